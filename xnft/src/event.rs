//! Events emitted by ledgers, and the closed set of kinds this crate understands.
//!
//! A ledger reports an event as an untyped `(section, method, data)` record. [EventKind] enumerates every
//! `(section, method)` pair the bridge protocol consumes and [ChainEvent] is the typed decoding of each of them.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use anyhow::anyhow;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    account::AccountId,
    crypto::Hash,
    error::{Error, Result},
    location::{AssetId, Location},
    serde_util::num_as_str,
};

/// One event from a ledger's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub section: String,
    pub method: String,
    pub data: Vec<Value>,
}

impl Event {
    pub fn new(kind: EventKind, data: Vec<Value>) -> Self {
        Event {
            section: kind.section().to_owned(),
            method: kind.method().to_owned(),
            data,
        }
    }

    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }

    /// The kind of this event, or `None` if it is not one this crate decodes.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.matches(self))
    }

    fn field<T: DeserializeOwned>(&self, kind: EventKind, index: usize) -> Result<T> {
        let value = self.data.get(index).ok_or_else(|| Error::Decode {
            kind,
            reason: format!("missing field {index}, got {} fields", self.data.len()),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| Error::Decode {
            kind,
            reason: format!("field {index}: {e}"),
        })
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.method)
    }
}

macro_rules! event_kinds {
    ($($kind:ident => ($section:literal, $method:literal),)*) => {
        /// Every `(section, method)` pair consumed by the bridge protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventKind {
            $($kind,)*
        }

        impl EventKind {
            pub const ALL: &'static [EventKind] = &[$(EventKind::$kind,)*];

            pub fn section(self) -> &'static str {
                match self {
                    $(EventKind::$kind => $section,)*
                }
            }

            pub fn method(self) -> &'static str {
                match self {
                    $(EventKind::$kind => $method,)*
                }
            }
        }
    };
}

event_kinds! {
    ExtrinsicSuccess => ("system", "ExtrinsicSuccess"),
    ExtrinsicFailed => ("system", "ExtrinsicFailed"),
    Sudid => ("sudo", "Sudid"),
    NewSession => ("session", "NewSession"),
    HrmpChannelForceOpened => ("hrmp", "HrmpChannelForceOpened"),
    XcmpMessageSent => ("xcmpQueue", "XcmpMessageSent"),
    XcmpSuccess => ("xcmpQueue", "Success"),
    XcmpFail => ("xcmpQueue", "Fail"),
    BalancesTransfer => ("balances", "Transfer"),
    CollectionCreated => ("common", "CollectionCreated"),
    ItemCreated => ("common", "ItemCreated"),
    ItemDestroyed => ("common", "ItemDestroyed"),
    CommonTransfer => ("common", "Transfer"),
    ForeignAssetRegistered => ("foreignAssets", "ForeignAssetRegistered"),
    CreatedClass => ("nft", "CreatedClass"),
    MintedToken => ("nft", "MintedToken"),
    TransferredToken => ("nft", "TransferredToken"),
    XnftAssetRegistered => ("xnft", "AssetRegistered"),
    AssetRegistryForeignAssetRegistered => ("assetRegistry", "ForeignAssetRegistered"),
}

impl EventKind {
    /// The `(section, method)` predicate of this kind.
    pub fn matches(self, event: &Event) -> bool {
        event.is(self.section(), self.method())
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.method())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (section, method) = s
            .split_once('.')
            .ok_or_else(|| anyhow!("expected `section.method`, got {s}"))?;
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.section() == section && kind.method() == method)
            .ok_or_else(|| anyhow!("unknown event kind {s}"))
    }
}

/// A module error as reported by a ledger, before it is resolved against the ledger's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleError {
    /// The index of the failing pallet.
    pub index: u8,
    /// The encoded error variant. The first byte is the variant index.
    #[serde(with = "crate::serde_util::prefixed_hex_array")]
    pub error: [u8; 4],
}

impl ModuleError {
    pub fn new(index: u8, variant: u8) -> Self {
        ModuleError {
            index,
            error: [variant, 0, 0, 0],
        }
    }

    pub fn variant(&self) -> u8 {
        self.error[0]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchError {
    Module(ModuleError),
    BadOrigin,
    CannotLookup,
    Other(String),
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Module(e) => {
                write!(f, "Module {{ index: {}, error: {} }}", e.index, e.variant())
            }
            DispatchError::BadOrigin => f.write_str("BadOrigin"),
            DispatchError::CannotLookup => f.write_str("CannotLookup"),
            DispatchError::Other(reason) => f.write_str(reason),
        }
    }
}

/// The typed contents of every [EventKind].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ExtrinsicSuccess,
    ExtrinsicFailed(DispatchError),
    Sudid(Result<(), DispatchError>),
    NewSession {
        index: u32,
    },
    HrmpChannelForceOpened {
        sender: u32,
        recipient: u32,
    },
    XcmpMessageSent {
        message_hash: Hash,
    },
    XcmpSuccess {
        message_hash: Hash,
    },
    XcmpFail {
        message_hash: Hash,
        error: String,
    },
    BalancesTransfer {
        from: AccountId,
        to: AccountId,
        amount: u128,
    },
    CollectionCreated {
        collection_id: u32,
        owner: AccountId,
    },
    ItemCreated {
        collection_id: u32,
        token_id: u32,
        owner: AccountId,
    },
    ItemDestroyed {
        collection_id: u32,
        token_id: u32,
        owner: AccountId,
    },
    CommonTransfer {
        collection_id: u32,
        token_id: u32,
        from: AccountId,
        to: AccountId,
    },
    ForeignAssetRegistered {
        asset_id: AssetId,
        collection_id: u32,
    },
    CreatedClass {
        owner: AccountId,
        class_id: u32,
    },
    MintedToken {
        from: AccountId,
        to: AccountId,
        class_id: u32,
        quantity: u32,
    },
    TransferredToken {
        from: AccountId,
        to: AccountId,
        class_id: u32,
        token_id: u32,
    },
    XnftAssetRegistered {
        asset_id: AssetId,
        class_id: u32,
    },
    AssetRegistryForeignAssetRegistered {
        location: Location,
        symbol: String,
    },
}

#[derive(Deserialize)]
struct Amount(#[serde(with = "num_as_str")] u128);

#[derive(Deserialize)]
struct AssetMetadata {
    symbol: String,
}

impl ChainEvent {
    /// Decodes `event` according to its kind.
    pub fn decode(event: &Event) -> Result<ChainEvent> {
        let kind = event
            .kind()
            .ok_or_else(|| anyhow!("cannot decode unknown event {event}"))?;
        ChainEvent::decode_as(kind, event)
    }

    /// Decodes `event`, which must be of the given kind.
    pub fn decode_as(kind: EventKind, event: &Event) -> Result<ChainEvent> {
        if !kind.matches(event) {
            return Err(Error::Decode {
                kind,
                reason: format!("got a {event} event"),
            });
        }
        let decoded = match kind {
            EventKind::ExtrinsicSuccess => ChainEvent::ExtrinsicSuccess,
            EventKind::ExtrinsicFailed => ChainEvent::ExtrinsicFailed(event.field(kind, 0)?),
            EventKind::Sudid => ChainEvent::Sudid(event.field(kind, 0)?),
            EventKind::NewSession => ChainEvent::NewSession {
                index: event.field(kind, 0)?,
            },
            EventKind::HrmpChannelForceOpened => ChainEvent::HrmpChannelForceOpened {
                sender: event.field(kind, 0)?,
                recipient: event.field(kind, 1)?,
            },
            EventKind::XcmpMessageSent => ChainEvent::XcmpMessageSent {
                message_hash: event.field(kind, 0)?,
            },
            EventKind::XcmpSuccess => ChainEvent::XcmpSuccess {
                message_hash: event.field(kind, 0)?,
            },
            EventKind::XcmpFail => ChainEvent::XcmpFail {
                message_hash: event.field(kind, 0)?,
                error: event.field(kind, 1)?,
            },
            EventKind::BalancesTransfer => ChainEvent::BalancesTransfer {
                from: event.field(kind, 0)?,
                to: event.field(kind, 1)?,
                amount: event.field::<Amount>(kind, 2)?.0,
            },
            EventKind::CollectionCreated => ChainEvent::CollectionCreated {
                collection_id: event.field(kind, 0)?,
                owner: event.field(kind, 2)?,
            },
            EventKind::ItemCreated => ChainEvent::ItemCreated {
                collection_id: event.field(kind, 0)?,
                token_id: event.field(kind, 1)?,
                owner: event.field(kind, 2)?,
            },
            EventKind::ItemDestroyed => ChainEvent::ItemDestroyed {
                collection_id: event.field(kind, 0)?,
                token_id: event.field(kind, 1)?,
                owner: event.field(kind, 2)?,
            },
            EventKind::CommonTransfer => ChainEvent::CommonTransfer {
                collection_id: event.field(kind, 0)?,
                token_id: event.field(kind, 1)?,
                from: event.field(kind, 2)?,
                to: event.field(kind, 3)?,
            },
            EventKind::ForeignAssetRegistered => ChainEvent::ForeignAssetRegistered {
                asset_id: event.field(kind, 0)?,
                collection_id: event.field(kind, 1)?,
            },
            EventKind::CreatedClass => ChainEvent::CreatedClass {
                owner: event.field(kind, 0)?,
                class_id: event.field(kind, 1)?,
            },
            EventKind::MintedToken => ChainEvent::MintedToken {
                from: event.field(kind, 0)?,
                to: event.field(kind, 1)?,
                class_id: event.field(kind, 2)?,
                quantity: event.field(kind, 3)?,
            },
            EventKind::TransferredToken => ChainEvent::TransferredToken {
                from: event.field(kind, 0)?,
                to: event.field(kind, 1)?,
                class_id: event.field(kind, 2)?,
                token_id: event.field(kind, 3)?,
            },
            EventKind::XnftAssetRegistered => ChainEvent::XnftAssetRegistered {
                asset_id: event.field(kind, 0)?,
                class_id: event.field(kind, 1)?,
            },
            EventKind::AssetRegistryForeignAssetRegistered => {
                ChainEvent::AssetRegistryForeignAssetRegistered {
                    location: event.field(kind, 1)?,
                    symbol: event.field::<AssetMetadata>(kind, 2)?.symbol,
                }
            }
        };
        Ok(decoded)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::ExtrinsicSuccess => EventKind::ExtrinsicSuccess,
            ChainEvent::ExtrinsicFailed(_) => EventKind::ExtrinsicFailed,
            ChainEvent::Sudid(_) => EventKind::Sudid,
            ChainEvent::NewSession { .. } => EventKind::NewSession,
            ChainEvent::HrmpChannelForceOpened { .. } => EventKind::HrmpChannelForceOpened,
            ChainEvent::XcmpMessageSent { .. } => EventKind::XcmpMessageSent,
            ChainEvent::XcmpSuccess { .. } => EventKind::XcmpSuccess,
            ChainEvent::XcmpFail { .. } => EventKind::XcmpFail,
            ChainEvent::BalancesTransfer { .. } => EventKind::BalancesTransfer,
            ChainEvent::CollectionCreated { .. } => EventKind::CollectionCreated,
            ChainEvent::ItemCreated { .. } => EventKind::ItemCreated,
            ChainEvent::ItemDestroyed { .. } => EventKind::ItemDestroyed,
            ChainEvent::CommonTransfer { .. } => EventKind::CommonTransfer,
            ChainEvent::ForeignAssetRegistered { .. } => EventKind::ForeignAssetRegistered,
            ChainEvent::CreatedClass { .. } => EventKind::CreatedClass,
            ChainEvent::MintedToken { .. } => EventKind::MintedToken,
            ChainEvent::TransferredToken { .. } => EventKind::TransferredToken,
            ChainEvent::XnftAssetRegistered { .. } => EventKind::XnftAssetRegistered,
            ChainEvent::AssetRegistryForeignAssetRegistered { .. } => {
                EventKind::AssetRegistryForeignAssetRegistered
            }
        }
    }

    /// Encodes this event in the positional layout ledgers report it in.
    pub fn encode(&self) -> Event {
        let data = match self {
            ChainEvent::ExtrinsicSuccess => vec![json!({})],
            ChainEvent::ExtrinsicFailed(error) => vec![json!(error), json!({})],
            ChainEvent::Sudid(result) => vec![json!(result)],
            ChainEvent::NewSession { index } => vec![json!(index)],
            ChainEvent::HrmpChannelForceOpened { sender, recipient } => {
                vec![json!(sender), json!(recipient), json!(8), json!(512)]
            }
            ChainEvent::XcmpMessageSent { message_hash } => vec![json!(message_hash)],
            ChainEvent::XcmpSuccess { message_hash } => vec![json!(message_hash), json!(0)],
            ChainEvent::XcmpFail {
                message_hash,
                error,
            } => vec![json!(message_hash), json!(error), json!(0)],
            ChainEvent::BalancesTransfer { from, to, amount } => {
                vec![json!(from), json!(to), json!(amount.to_string())]
            }
            ChainEvent::CollectionCreated {
                collection_id,
                owner,
            } => vec![json!(collection_id), json!(0), json!(owner)],
            ChainEvent::ItemCreated {
                collection_id,
                token_id,
                owner,
            }
            | ChainEvent::ItemDestroyed {
                collection_id,
                token_id,
                owner,
            } => vec![json!(collection_id), json!(token_id), json!(owner), json!(1)],
            ChainEvent::CommonTransfer {
                collection_id,
                token_id,
                from,
                to,
            } => vec![
                json!(collection_id),
                json!(token_id),
                json!(from),
                json!(to),
                json!(1),
            ],
            ChainEvent::ForeignAssetRegistered {
                asset_id,
                collection_id,
            } => vec![json!(asset_id), json!(collection_id)],
            ChainEvent::CreatedClass { owner, class_id } => vec![json!(owner), json!(class_id)],
            ChainEvent::MintedToken {
                from,
                to,
                class_id,
                quantity,
            } => vec![json!(from), json!(to), json!(class_id), json!(quantity)],
            ChainEvent::TransferredToken {
                from,
                to,
                class_id,
                token_id,
            } => vec![json!(from), json!(to), json!(class_id), json!(token_id)],
            ChainEvent::XnftAssetRegistered { asset_id, class_id } => {
                vec![json!(asset_id), json!(class_id)]
            }
            ChainEvent::AssetRegistryForeignAssetRegistered { location, symbol } => vec![
                json!(0),
                json!(location),
                json!({ "symbol": symbol }),
            ],
        };
        Event::new(self.kind(), data)
    }
}

impl From<ChainEvent> for Event {
    fn from(event: ChainEvent) -> Self {
        event.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_on_section_and_method() {
        let event = Event::new(EventKind::XcmpSuccess, vec![]);
        assert!(EventKind::XcmpSuccess.matches(&event));
        assert!(!EventKind::XcmpFail.matches(&event));
        assert_eq!(event.kind(), Some(EventKind::XcmpSuccess));
        assert_eq!(
            "xcmpQueue.Success".parse::<EventKind>().unwrap(),
            EventKind::XcmpSuccess
        );
        assert_eq!(EventKind::XnftAssetRegistered.to_string(), "xnft.AssetRegistered");
        assert!("xcmpQueue.Nope".parse::<EventKind>().is_err());

        let unknown = Event {
            section: "democracy".to_owned(),
            method: "Voted".to_owned(),
            data: vec![],
        };
        assert_eq!(unknown.kind(), None);
    }

    #[test]
    fn kinds_are_unique() {
        for (i, a) in EventKind::ALL.iter().enumerate() {
            for b in &EventKind::ALL[i + 1..] {
                assert_ne!((a.section(), a.method()), (b.section(), b.method()));
            }
        }
    }

    #[test]
    fn decodes_positional_fields() {
        let hash = Hash::of(b"message");
        let event = Event::new(
            EventKind::XcmpFail,
            vec![json!(hash), json!("NotHoldingFees"), json!(1000)],
        );
        assert_eq!(
            ChainEvent::decode(&event).unwrap(),
            ChainEvent::XcmpFail {
                message_hash: hash,
                error: "NotHoldingFees".to_owned()
            }
        );

        let failed = Event::new(
            EventKind::ExtrinsicFailed,
            vec![json!({"Module": {"index": 12, "error": "0x03000000"}}), json!({})],
        );
        assert_eq!(
            ChainEvent::decode(&failed).unwrap(),
            ChainEvent::ExtrinsicFailed(DispatchError::Module(ModuleError::new(12, 3)))
        );
    }

    #[test]
    fn typed_events_survive_encoding() {
        let owner = AccountId::new([7; 32]);
        let events = [
            ChainEvent::ItemCreated {
                collection_id: 3,
                token_id: 1,
                owner,
            },
            ChainEvent::BalancesTransfer {
                from: owner,
                to: AccountId::new([8; 32]),
                amount: 10u128.pow(20),
            },
            ChainEvent::Sudid(Err(DispatchError::BadOrigin)),
            ChainEvent::AssetRegistryForeignAssetRegistered {
                location: Location::parachain(2095),
                symbol: "QTZ".to_owned(),
            },
        ];
        for event in events {
            assert_eq!(ChainEvent::decode(&event.encode()).unwrap(), event);
        }
    }

    #[test]
    fn malformed_events_are_decode_errors() {
        let event = Event::new(EventKind::ItemCreated, vec![json!(1)]);
        assert!(matches!(
            ChainEvent::decode(&event),
            Err(Error::Decode {
                kind: EventKind::ItemCreated,
                ..
            })
        ));

        let event = Event::new(EventKind::NewSession, vec![json!("one")]);
        assert!(ChainEvent::decode(&event).is_err());
        assert!(ChainEvent::decode_as(EventKind::NewSession, &Event::new(EventKind::Sudid, vec![])).is_err());
    }
}
