//! Hashing primitives shared by the ledgers' addressing and messaging formats.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use anyhow::{Result, anyhow};
use blake2::{Blake2b, Blake2b512, Digest, digest::consts::U32};
use serde::{Deserialize, Serialize};

use crate::serde_util::prefixed_hex_array;

type Blake2b256 = Blake2b<U32>;

pub fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let mut out = [0; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn blake2_512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(data);
    let mut out = [0; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// A 256-bit hash, e.g. the content hash identifying a cross-ledger message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "prefixed_hex_array")] pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn of(data: &[u8]) -> Hash {
        Hash(blake2_256(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", hex::encode(&self.0[..4]))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("a hash is 32 bytes, got {}", b.len()))?;
        Ok(Hash(bytes))
    }
}
