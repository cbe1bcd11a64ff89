//! Deterministic custody accounts.
//!
//! A sovereign account on ledger X holds everything ledger Y owns collectively on X. It is a pure function of the
//! relationship between the two ledgers and Y's id, so both sides can compute it without communicating.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// The remote ledger is a child of the local one, e.g. a parachain seen from the relay chain.
    Child,
    /// The remote ledger shares a parent with the local one.
    Sibling,
}

impl Relationship {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Relationship::Child => b"para",
            Relationship::Sibling => b"sibl",
        }
    }
}

/// `tag ‖ remote_id (u32, little-endian) ‖ zero padding`.
pub fn sovereign_account(relationship: Relationship, remote_id: u32) -> AccountId {
    let mut bytes = [0; 32];
    bytes[..4].copy_from_slice(relationship.tag());
    bytes[4..8].copy_from_slice(&remote_id.to_le_bytes());
    AccountId::new(bytes)
}

const PALLET_PREFIX: &[u8; 4] = b"modl";

/// The account controlled by a pallet: `"modl" ‖ pallet_id ‖ zero padding`.
pub fn pallet_account(pallet_id: &str) -> Result<AccountId> {
    Ok(AccountId::new(pallet_bytes(pallet_id)?))
}

/// A sub-account of a pallet, e.g. the account of one NFT collection: `"modl" ‖ pallet_id ‖ sub (u32, little-endian)
/// ‖ zero padding`.
pub fn pallet_sub_account(pallet_id: &str, sub: u32) -> Result<AccountId> {
    let mut bytes = pallet_bytes(pallet_id)?;
    bytes[12..16].copy_from_slice(&sub.to_le_bytes());
    Ok(AccountId::new(bytes))
}

fn pallet_bytes(pallet_id: &str) -> Result<[u8; 32]> {
    if pallet_id.len() != 8 {
        bail!("pallet ID length must be 8, got {pallet_id:?}");
    }
    let mut bytes = [0; 32];
    bytes[..4].copy_from_slice(PALLET_PREFIX);
    bytes[4..12].copy_from_slice(pallet_id.as_bytes());
    Ok(bytes)
}
