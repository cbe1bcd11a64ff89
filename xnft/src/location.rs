//! Hierarchical addresses which name accounts, ledgers, currencies and NFT collections uniformly across ledgers.
//!
//! A [Location] is always relative to the ledger interpreting it: `parents` counts the hops up towards a common
//! ancestor and `interior` then descends from there. For parachains the common ancestor is the relay chain, so a
//! sibling's collection is `{parents: 1, interior: X2[Parachain(id), GeneralIndex(collection)]}`.
//!
//! The serde representation is the wire encoding used in calls and storage queries:
//! `{"parents": 1, "interior": {"X2": [{"Parachain": 2000}, {"GeneralIndex": 3}]}}`, or `"Here"` for an empty
//! interior.

use std::fmt::{self, Display, Formatter};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
};

use crate::{
    account::AccountId,
    serde_util::{compact_u128, num_as_str, prefixed_hex_array},
};

/// The maximum number of junctions in the interior of a [Location].
pub const MAX_JUNCTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("a location interior holds at most {MAX_JUNCTIONS} junctions, got {0}")]
    TooManyJunctions(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkId {
    Polkadot,
    Kusama,
    Westend,
    Rococo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Junction {
    Parachain(u32),
    PalletInstance(u8),
    GeneralIndex(#[serde(with = "compact_u128")] u128),
    GeneralKey {
        length: u8,
        #[serde(with = "prefixed_hex_array")]
        data: [u8; 32],
    },
    AccountId32 {
        network: Option<NetworkId>,
        id: AccountId,
    },
}

impl Display for Junction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Junction::Parachain(id) => write!(f, "Parachain({id})"),
            Junction::PalletInstance(index) => write!(f, "PalletInstance({index})"),
            Junction::GeneralIndex(index) => write!(f, "GeneralIndex({index})"),
            Junction::GeneralKey { length, data } => {
                write!(
                    f,
                    "GeneralKey(0x{})",
                    hex::encode(&data[..(*length as usize).min(32)])
                )
            }
            Junction::AccountId32 { id, .. } => write!(f, "AccountId32({id})"),
        }
    }
}

/// The ordered interior of a [Location], holding between zero and [MAX_JUNCTIONS] junctions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Junctions(Vec<Junction>);

impl Junctions {
    pub const fn here() -> Self {
        Junctions(Vec::new())
    }

    pub fn is_here(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Junction] {
        &self.0
    }

    pub fn first(&self) -> Option<&Junction> {
        self.0.first()
    }

    pub fn push(&mut self, junction: Junction) -> Result<(), LocationError> {
        if self.0.len() == MAX_JUNCTIONS {
            return Err(LocationError::TooManyJunctions(MAX_JUNCTIONS + 1));
        }
        self.0.push(junction);
        Ok(())
    }
}

impl TryFrom<Vec<Junction>> for Junctions {
    type Error = LocationError;

    fn try_from(junctions: Vec<Junction>) -> Result<Self, Self::Error> {
        if junctions.len() > MAX_JUNCTIONS {
            return Err(LocationError::TooManyJunctions(junctions.len()));
        }
        Ok(Junctions(junctions))
    }
}

impl Serialize for Junctions {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0.is_empty() {
            return serializer.serialize_str("Here");
        }
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&format!("X{}", self.0.len()), &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Junctions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JunctionsVisitor;

        impl<'de> Visitor<'de> for JunctionsVisitor {
            type Value = Junctions;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                f.write_str(r#""Here" or a map with a single "X1" to "X8" key"#)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Junctions, E> {
                match value {
                    "Here" => Ok(Junctions::here()),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Junctions, A::Error> {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(de::Error::invalid_length(0, &self));
                };
                let count: usize = key
                    .strip_prefix('X')
                    .and_then(|n| n.parse().ok())
                    .filter(|n| (1..=MAX_JUNCTIONS).contains(n))
                    .ok_or_else(|| de::Error::unknown_variant(&key, &["X1", "…", "X8"]))?;
                let junctions: Vec<Junction> = map.next_value()?;
                if junctions.len() != count {
                    return Err(de::Error::invalid_length(junctions.len(), &self));
                }
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("more than one interior variant"));
                }
                Ok(Junctions(junctions))
            }
        }

        deserializer.deserialize_any(JunctionsVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub parents: u8,
    pub interior: Junctions,
}

impl Location {
    pub fn new(parents: u8, interior: Vec<Junction>) -> Result<Self, LocationError> {
        Ok(Location {
            parents,
            interior: interior.try_into()?,
        })
    }

    /// The interpreting ledger itself.
    pub const fn here() -> Self {
        Location {
            parents: 0,
            interior: Junctions::here(),
        }
    }

    /// The relay chain, seen from one of its parachains.
    pub const fn parent() -> Self {
        Location {
            parents: 1,
            interior: Junctions::here(),
        }
    }

    /// An account on the interpreting ledger.
    pub fn account(id: AccountId) -> Self {
        Location {
            parents: 0,
            interior: Junctions(vec![Junction::AccountId32 { network: None, id }]),
        }
    }

    /// A parachain, seen from the relay chain's other children.
    pub fn parachain(para_id: u32) -> Self {
        Location {
            parents: 1,
            interior: Junctions(vec![Junction::Parachain(para_id)]),
        }
    }

    /// An account on a parachain, seen from one of its siblings.
    pub fn parachain_account(para_id: u32, id: AccountId) -> Self {
        Location {
            parents: 1,
            interior: Junctions(vec![
                Junction::Parachain(para_id),
                Junction::AccountId32 { network: None, id },
            ]),
        }
    }

    /// An NFT collection on a parachain. Ledgers which expose their NFTs through a sub-pallet namespace name the
    /// pallet instance between the parachain and the collection index.
    pub fn parachain_collection(para_id: u32, pallet_instance: Option<u8>, collection: u128) -> Self {
        let mut junctions = vec![Junction::Parachain(para_id)];
        if let Some(index) = pallet_instance {
            junctions.push(Junction::PalletInstance(index));
        }
        junctions.push(Junction::GeneralIndex(collection));
        Location {
            parents: 1,
            interior: Junctions(junctions),
        }
    }

    /// Returns a new location with `junction` appended to the interior.
    pub fn pushed_with(&self, junction: Junction) -> Result<Self, LocationError> {
        let mut location = self.clone();
        location.interior.push(junction)?;
        Ok(location)
    }

    /// The parachain this location descends into from the relay chain, if any.
    pub fn parachain_id(&self) -> Option<u32> {
        match (self.parents, self.interior.first()) {
            (1, Some(Junction::Parachain(id))) => Some(*id),
            _ => None,
        }
    }

    /// The junctions following the leading `Parachain` junction, if this location names something on a parachain.
    pub fn parachain_interior(&self) -> Option<&[Junction]> {
        self.parachain_id().map(|_| &self.interior.as_slice()[1..])
    }

    /// The account named by the last junction, if it is an `AccountId32`.
    pub fn account_id(&self) -> Option<AccountId> {
        match self.interior.as_slice().last() {
            Some(Junction::AccountId32 { id, .. }) => Some(*id),
            _ => None,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(parents: {}, ", self.parents)?;
        if self.interior.is_here() {
            f.write_str("Here)")
        } else {
            write!(f, "X{}[", self.interior.len())?;
            for (i, junction) in self.interior.as_slice().iter().enumerate() {
                if i != 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{junction}")?;
            }
            f.write_str("])")
        }
    }
}

/// Canonical identity of a fungible currency or NFT collection, independent of which ledger holds a derivative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetId {
    Concrete(Location),
    Abstract(String),
}

impl Display for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AssetId::Concrete(location) => write!(f, "Concrete{location}"),
            AssetId::Abstract(name) => write!(f, "Abstract({name})"),
        }
    }
}

/// One unit of a non-fungible collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetInstance {
    Undefined,
    Index(#[serde(with = "compact_u128")] u128),
    Array4(#[serde(with = "prefixed_hex_array")] [u8; 4]),
    Array8(#[serde(with = "prefixed_hex_array")] [u8; 8]),
    Array16(#[serde(with = "prefixed_hex_array")] [u8; 16]),
    Array32(#[serde(with = "prefixed_hex_array")] [u8; 32]),
}

impl Display for AssetInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AssetInstance::Undefined => f.write_str("Undefined"),
            AssetInstance::Index(index) => write!(f, "Index({index})"),
            AssetInstance::Array4(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            AssetInstance::Array8(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            AssetInstance::Array16(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            AssetInstance::Array32(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fungibility {
    Fungible(#[serde(with = "num_as_str")] u128),
    NonFungible(AssetInstance),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiAsset {
    pub id: AssetId,
    pub fun: Fungibility,
}

impl MultiAsset {
    pub fn fungible(id: AssetId, amount: u128) -> Self {
        MultiAsset {
            id,
            fun: Fungibility::Fungible(amount),
        }
    }

    pub fn non_fungible(id: AssetId, instance: AssetInstance) -> Self {
        MultiAsset {
            id,
            fun: Fungibility::NonFungible(instance),
        }
    }
}

/// Version tag for values passed to ledgers. Only the third revision of the message format is spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Versioned<T> {
    V3(T),
}

impl<T> Versioned<T> {
    pub fn into_inner(self) -> T {
        match self {
            Versioned::V3(inner) => inner,
        }
    }
}
