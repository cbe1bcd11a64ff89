//! A backend which replays scripted responses, for unit tests of the layers above [LedgerBackend].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    account::Signer,
    cfg::{CorrelatorConfig, LedgerConfig, NativeCurrencyConfig, NftConfig, NftDialect},
    client::{Call, ChainProperties, LedgerBackend, NewBlock, StorageQuery, TxStatus},
    event::{Event, ModuleError},
    fake::SubscriptionGuard,
    ledger::Ledger,
};

#[derive(Default)]
struct State {
    txs: VecDeque<Vec<TxStatus>>,
    submitted: Vec<Call>,
    storage: HashMap<String, Value>,
    blocks: Vec<NewBlock>,
    block_subscribers: Vec<mpsc::UnboundedSender<NewBlock>>,
    blocks_closed: bool,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
    open_tx_subscriptions: Arc<AtomicUsize>,
    open_block_subscriptions: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub const XTOKENS_INDEX: u8 = 54;
    pub const XCM_EXECUTION_FAILED: u8 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// The statuses reported for the next submitted transaction.
    pub fn push_tx(&self, statuses: Vec<TxStatus>) {
        self.state.lock().txs.push_back(statuses);
    }

    pub fn submitted(&self) -> Vec<Call> {
        self.state.lock().submitted.clone()
    }

    pub fn set_storage(&self, query: StorageQuery, value: Value) {
        self.state.lock().storage.insert(query.to_string(), value);
    }

    /// Blocks replayed to every new block subscription.
    pub fn script_blocks(&self, blocks: impl IntoIterator<Item = (u64, Vec<Event>)>) {
        self.state.lock().blocks = blocks
            .into_iter()
            .map(|(height, events)| NewBlock { height, events })
            .collect();
    }

    /// Ends every block subscription once its replayed blocks are consumed.
    pub fn close_blocks(&self) {
        let mut state = self.state.lock();
        state.blocks_closed = true;
        state.block_subscribers.clear();
    }

    /// Sends a block to every live block subscription.
    pub fn emit_block(&self, height: u64, events: Vec<Event>) {
        let block = NewBlock { height, events };
        self.state
            .lock()
            .block_subscribers
            .retain(|s| s.send(block.clone()).is_ok());
    }

    pub fn open_tx_subscriptions(&self) -> usize {
        self.open_tx_subscriptions.load(Ordering::SeqCst)
    }

    pub fn open_block_subscriptions(&self) -> usize {
        self.open_block_subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerBackend for ScriptedBackend {
    async fn properties(&self) -> Result<ChainProperties> {
        Ok(ChainProperties {
            token_symbol: "TST".to_owned(),
            token_decimals: 12,
            ss58_format: 42,
        })
    }

    async fn submit(&self, _: &Signer, call: Call) -> Result<BoxStream<'static, TxStatus>> {
        let mut state = self.state.lock();
        let statuses = state
            .txs
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted response for {call}"))?;
        state.submitted.push(call);
        let guard = SubscriptionGuard::new(&self.open_tx_subscriptions);
        Ok(futures::stream::iter(statuses)
            .map(move |status| {
                let _guard = &guard;
                status
            })
            .boxed())
    }

    async fn query(&self, query: StorageQuery) -> Result<Value> {
        Ok(self
            .state
            .lock()
            .storage
            .get(&query.to_string())
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn subscribe_new_blocks(&self) -> Result<BoxStream<'static, NewBlock>> {
        let mut state = self.state.lock();
        let (sender, receiver) = mpsc::unbounded_channel();
        for block in &state.blocks {
            let _ = sender.send(block.clone());
        }
        if !state.blocks_closed {
            state.block_subscribers.push(sender);
        }
        let guard = SubscriptionGuard::new(&self.open_block_subscriptions);
        Ok(UnboundedReceiverStream::new(receiver)
            .map(move |block| {
                let _guard = &guard;
                block
            })
            .boxed())
    }

    fn lookup_module_error(&self, error: &ModuleError) -> Option<(String, String)> {
        (error.index == Self::XTOKENS_INDEX && error.variant() == Self::XCM_EXECUTION_FAILED)
            .then(|| ("xTokens".to_owned(), "XcmExecutionFailed".to_owned()))
    }
}

pub async fn scripted_ledger(backend: &ScriptedBackend) -> Ledger {
    scripted_ledger_with_dialect(backend, NftDialect::ForeignAssets).await
}

pub async fn scripted_ledger_with_dialect(backend: &ScriptedBackend, dialect: NftDialect) -> Ledger {
    scripted_parachain(backend, "Scripted", 1000, dialect).await
}

pub async fn scripted_parachain(backend: &ScriptedBackend, name: &str, para_id: u32, dialect: NftDialect) -> Ledger {
    let config = LedgerConfig {
        name: name.to_owned(),
        para_id: Some(para_id),
        native_currency: NativeCurrencyConfig {
            symbol: "TST".to_owned(),
            decimals: 12,
            id: None,
        },
        ss58_format: 42,
        nft: Some(NftConfig {
            dialect,
            pallet_instance: None,
        }),
    };
    Ledger::connect(&config, CorrelatorConfig::default(), Arc::new(backend.clone()))
        .await
        .unwrap()
}
