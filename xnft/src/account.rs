//! Accounts and the signers which act on their behalf.
//!
//! Inside this crate an account is always its raw 32 bytes. The SS58 text format is applied only when an account is
//! shown to a human or compared against a ledger's own textual rendering.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{blake2_256, blake2_512},
    serde_util::prefixed_hex_array,
};

/// The SS58 format of generic Substrate ledgers.
pub const GENERIC_SS58_FORMAT: u16 = 42;

const SS58_CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const SS58_CHECKSUM_LEN: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AccountId(#[serde(with = "prefixed_hex_array")] [u8; 32]);

impl AccountId {
    pub const fn new(bytes: [u8; 32]) -> AccountId {
        AccountId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_ss58(&self, format: u16) -> String {
        let mut data = ss58_prefix(format);
        data.extend_from_slice(&self.0);
        let checksum = ss58_checksum(&data);
        data.extend_from_slice(&checksum);
        bs58::encode(data).into_string()
    }

    /// Decodes an SS58 address, returning the account and the address format it was rendered in.
    pub fn from_ss58(address: &str) -> Result<(AccountId, u16)> {
        let data = bs58::decode(address).into_vec()?;
        let (format, prefix_len) = match data.first() {
            Some(&b) if b < 64 => (b as u16, 1),
            Some(&b) if b < 128 => {
                let Some(&second) = data.get(1) else {
                    bail!("truncated SS58 address {address}");
                };
                let lower = (b << 2) | (second >> 6);
                let upper = second & 0b0011_1111;
                (lower as u16 | ((upper as u16) << 8), 2)
            }
            Some(b) => bail!("invalid SS58 prefix byte {b:#x}"),
            None => bail!("empty SS58 address"),
        };
        if data.len() != prefix_len + 32 + SS58_CHECKSUM_LEN {
            bail!("unexpected SS58 address length {}", data.len());
        }
        let (body, checksum) = data.split_at(prefix_len + 32);
        if ss58_checksum(body) != checksum {
            bail!("invalid SS58 checksum in {address}");
        }
        let id: [u8; 32] = body[prefix_len..]
            .try_into()
            .map_err(|_| anyhow!("invalid account length"))?;
        Ok((AccountId(id), format))
    }
}

fn ss58_prefix(format: u16) -> Vec<u8> {
    match format {
        0..=63 => vec![format as u8],
        _ => {
            // Formats up to 16383 use the two-byte prefix. Only the low 14 bits are significant.
            let ident = format & 0b0011_1111_1111_1111;
            let first = ((ident & 0b0000_0000_1111_1100) >> 2) as u8 | 0b0100_0000;
            let second = ((ident >> 8) as u8) | (((ident & 0b0000_0000_0000_0011) as u8) << 6);
            vec![first, second]
        }
    }
}

fn ss58_checksum(data: &[u8]) -> [u8; SS58_CHECKSUM_LEN] {
    let mut preimage = SS58_CHECKSUM_PREFIX.to_vec();
    preimage.extend_from_slice(data);
    let hash = blake2_512(&preimage);
    [hash[0], hash[1]]
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.to_ss58(GENERIC_SS58_FORMAT))
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ss58(GENERIC_SS58_FORMAT))
    }
}

impl FromStr for AccountId {
    type Err = anyhow::Error;

    /// Accepts either a `0x`-prefixed hex account or an SS58 address of any format.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(hex) = s.strip_prefix("0x") {
            let bytes: [u8; 32] = hex::decode(hex)?
                .try_into()
                .map_err(|_| anyhow!("an account is 32 bytes"))?;
            return Ok(AccountId(bytes));
        }
        Ok(AccountId::from_ss58(s)?.0)
    }
}

/// A development signer. Key management is owned by the ledgers' wallets; here a signer is only an account with a
/// human-readable name, derived deterministically from its secret URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    name: String,
    account: AccountId,
}

impl Signer {
    pub fn new(name: impl Into<String>, account: AccountId) -> Self {
        Signer {
            name: name.into(),
            account,
        }
    }

    /// A signer for a development URI such as `//Alice`.
    pub fn from_uri(uri: &str) -> Self {
        let name = uri.trim_start_matches('/').to_owned();
        Signer {
            name,
            account: AccountId(blake2_256(uri.as_bytes())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> AccountId {
        self.account
    }
}

impl Display for Signer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.account)
    }
}
