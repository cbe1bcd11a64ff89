//! The boundary between this crate and a ledger's node.
//!
//! Everything ledger-specific (transaction encoding, signing, transport) lives behind [LedgerBackend]. The core only
//! sees opaque [Call]s going in and `(section, method, data)` events coming out.

use std::fmt::{self, Display, Formatter};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    account::Signer,
    event::{Event, ModuleError},
};

/// A submittable call, e.g. `xTokens.transferMultiassetWithFee(asset, fee, dest, weight_limit)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub section: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(section: &str, method: &str, args: Vec<Value>) -> Self {
        Call {
            section: section.to_owned(),
            method: method.to_owned(),
            args,
        }
    }

    /// Wraps this call in `sudo.sudo`, dispatching it with root privileges.
    pub fn sudo(self) -> Self {
        Call::new("sudo", "sudo", vec![json!(self)])
    }

    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }
}

impl Display for Call {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.method)
    }
}

/// A point lookup into a ledger's storage. An absent value is returned as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageQuery {
    pub section: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl StorageQuery {
    pub fn new(section: &str, method: &str, args: Vec<Value>) -> Self {
        StorageQuery {
            section: section.to_owned(),
            method: method.to_owned(),
            args,
        }
    }
}

impl Display for StorageQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.section, self.method, itertools::join(&self.args, ", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainProperties {
    pub token_symbol: String,
    pub token_decimals: u8,
    pub ss58_format: u16,
}

/// The progress of a submitted transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    /// Accepted into the transaction pool.
    Ready,
    /// Included in the block at `height`. `events` are the events the transaction emitted.
    InBlock { height: u64, events: Vec<Event> },
    /// Evicted from the pool without being included.
    Dropped(String),
}

/// A newly produced block and everything it emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBlock {
    pub height: u64,
    pub events: Vec<Event>,
}

#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn properties(&self) -> Result<ChainProperties>;

    /// Signs and submits `call`. The returned stream reports the transaction's progress and ends when the backend
    /// stops tracking it. Dropping the stream unsubscribes.
    async fn submit(&self, signer: &Signer, call: Call) -> Result<BoxStream<'static, TxStatus>>;

    async fn query(&self, query: StorageQuery) -> Result<Value>;

    /// Subscribes to newly produced blocks. A backend may report the same height more than once. Dropping the
    /// stream unsubscribes.
    async fn subscribe_new_blocks(&self) -> Result<BoxStream<'static, NewBlock>>;

    /// Resolves a module error to its `(section, method)` name using the ledger's metadata.
    fn lookup_module_error(&self, error: &ModuleError) -> Option<(String, String)>;
}
