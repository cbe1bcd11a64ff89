//! An in-memory network of ledgers: one relay chain and its parachains.
//!
//! Every ledger produces blocks on its own timer, with a seeded random jitter, so nothing about the relative order
//! of blocks across ledgers can be assumed. Messages between parachains are delivered a random number of blocks
//! after they are sent. Parachains only start producing blocks once the relay chain has rotated to its first
//! session.

pub mod runtime;
pub mod xcm;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::*;

use self::{
    runtime::{Context, Runtime},
    xcm::{Inbound, Message, Router},
};
use crate::{
    account::{AccountId, Signer},
    cfg::{Config, LedgerConfig, SimulationConfig},
    client::{Call, ChainProperties, LedgerBackend, NewBlock, StorageQuery, TxStatus},
    event::{ChainEvent, ModuleError},
    ledger::{self, Ledger, Relay},
    location::{AssetId, Location},
};

/// Whole units of its native currency given to each development account on every ledger.
const ENDOWMENT_UNITS: u128 = 1_000_000;

/// Counts a subscription as open for as long as it is alive.
pub(crate) struct SubscriptionGuard(Arc<AtomicUsize>);

impl SubscriptionGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        SubscriptionGuard(counter.clone())
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PendingTx {
    signer: AccountId,
    call: Call,
    status: mpsc::UnboundedSender<TxStatus>,
}

struct State {
    runtime: Runtime,
    height: u64,
    pending: Vec<PendingTx>,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
    inbound: Vec<Inbound>,
    subscribers: Vec<mpsc::UnboundedSender<NewBlock>>,
}

/// One simulated ledger. Clones share the ledger.
#[derive(Clone)]
pub struct FakeLedger {
    name: String,
    para_id: Option<u32>,
    properties: ChainProperties,
    router: Arc<Router>,
    state: Arc<Mutex<State>>,
    open_subscriptions: Arc<AtomicUsize>,
}

impl FakeLedger {
    fn new(config: &LedgerConfig, accounts: &[AccountId], router: Arc<Router>) -> Result<FakeLedger> {
        let currency = &config.native_currency;
        let native = match (&currency.id, config.para_id) {
            (Some(id), _) => id.clone(),
            (None, Some(para_id)) => AssetId::Concrete(Location::parachain(para_id)),
            (None, None) => AssetId::Concrete(Location::parent()),
        };
        let endowment = ledger::scale(ENDOWMENT_UNITS, currency.decimals).ok_or_else(|| {
            anyhow!(
                "{} cannot endow {ENDOWMENT_UNITS} {} with {} decimals",
                config.name,
                currency.symbol,
                currency.decimals
            )
        })?;
        let runtime = Runtime::genesis(
            &config.name,
            config.para_id,
            config.nft,
            native,
            currency.decimals,
            accounts,
            endowment,
        )?;
        let inbox = config.para_id.map(|id| router.register(id));
        Ok(FakeLedger {
            name: config.name.clone(),
            para_id: config.para_id,
            properties: ChainProperties {
                token_symbol: currency.symbol.clone(),
                token_decimals: currency.decimals,
                ss58_format: config.ss58_format,
            },
            router,
            state: Arc::new(Mutex::new(State {
                runtime,
                height: 0,
                pending: vec![],
                inbox,
                inbound: vec![],
                subscribers: vec![],
            })),
            open_subscriptions: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// The number of live transaction and block subscriptions.
    pub fn open_subscriptions(&self) -> usize {
        self.open_subscriptions.load(Ordering::SeqCst)
    }

    async fn run(self, simulation: SimulationConfig, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let jitter = simulation.block_time_jitter.as_millis() as u64;
        loop {
            let delay = simulation.block_time + Duration::from_millis(rng.gen_range(0..=jitter));
            tokio::time::sleep(delay).await;
            self.produce_block(&simulation, &mut rng);
        }
    }

    fn produce_block(&self, simulation: &SimulationConfig, rng: &mut ChaCha8Rng) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if self.para_id.is_some() && self.router.session_index() == 0 {
            return;
        }
        state.height += 1;
        let height = state.height;

        let mut events = vec![];
        if self.para_id.is_none() && height % simulation.session_length.max(1) == 0 {
            let index = self.router.next_session();
            debug!(ledger = self.name, height, index, "new session");
            events.push(ChainEvent::NewSession { index }.encode());
        }

        if let Some(inbox) = &mut state.inbox {
            while let Ok(message) = inbox.try_recv() {
                let deliver_at = height + 1 + rng.gen_range(0..=simulation.max_delivery_delay_blocks);
                trace!(ledger = self.name, hash = %message.hash, deliver_at, "message queued");
                state.inbound.push(Inbound { message, deliver_at });
            }
        }
        let (due, waiting) = std::mem::take(&mut state.inbound)
            .into_iter()
            .partition::<Vec<_>, _>(|inbound| inbound.deliver_at <= height);
        state.inbound = waiting;
        for inbound in due {
            events.extend(state.runtime.receive(&inbound.message));
        }

        let mut ctx = Context {
            router: &self.router,
            outbox: vec![],
        };
        for tx in std::mem::take(&mut state.pending) {
            let tx_events = state.runtime.apply_extrinsic(&mut ctx, tx.signer, &tx.call);
            let _ = tx.status.send(TxStatus::InBlock {
                height,
                events: tx_events.clone(),
            });
            events.extend(tx_events);
        }
        for (destination, message) in ctx.outbox {
            let hash = message.hash;
            if !self.router.send(destination, message) {
                warn!(ledger = self.name, %hash, destination, "message could not be routed");
            }
        }

        trace!(ledger = self.name, height, events = events.len(), "produced block");
        let block = NewBlock { height, events };
        state
            .subscribers
            .retain(|subscriber| subscriber.send(block.clone()).is_ok());
    }
}

#[async_trait]
impl LedgerBackend for FakeLedger {
    async fn properties(&self) -> Result<ChainProperties> {
        Ok(self.properties.clone())
    }

    async fn submit(&self, signer: &Signer, call: Call) -> Result<BoxStream<'static, TxStatus>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(TxStatus::Ready)?;
        self.state.lock().pending.push(PendingTx {
            signer: signer.account(),
            call,
            status: sender,
        });
        let guard = SubscriptionGuard::new(&self.open_subscriptions);
        Ok(UnboundedReceiverStream::new(receiver)
            .map(move |status| {
                let _guard = &guard;
                status
            })
            .boxed())
    }

    async fn query(&self, query: StorageQuery) -> Result<Value> {
        self.state.lock().runtime.query(&self.router, &query)
    }

    async fn subscribe_new_blocks(&self) -> Result<BoxStream<'static, NewBlock>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(sender);
        let guard = SubscriptionGuard::new(&self.open_subscriptions);
        Ok(UnboundedReceiverStream::new(receiver)
            .map(move |block| {
                let _guard = &guard;
                block
            })
            .boxed())
    }

    fn lookup_module_error(&self, error: &ModuleError) -> Option<(String, String)> {
        runtime::lookup_module_error(error)
    }
}

/// A running simulated network. Block production stops when it is dropped.
pub struct FakeNetwork {
    config: Config,
    relay: FakeLedger,
    parachains: Vec<FakeLedger>,
    _tasks: JoinSet<()>,
}

impl FakeNetwork {
    /// Starts producing blocks on every configured ledger. Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Result<FakeNetwork> {
        let accounts: Vec<_> = config
            .accounts
            .iter()
            .map(|uri| Signer::from_uri(uri).account())
            .collect();
        let router = Arc::new(Router::default());
        let relay = FakeLedger::new(&config.relay, &accounts, router.clone())?;
        let parachains = config
            .parachains
            .iter()
            .map(|parachain| FakeLedger::new(parachain, &accounts, router.clone()))
            .collect::<Result<Vec<_>>>()?;

        let seed = config.simulation.seed.unwrap_or_else(rand::random);
        info!(seed, parachains = parachains.len(), "starting simulated network");
        let mut tasks = JoinSet::new();
        for (index, ledger) in std::iter::once(&relay).chain(&parachains).enumerate() {
            tasks.spawn(
                ledger
                    .clone()
                    .run(config.simulation.clone(), seed ^ index as u64),
            );
        }

        Ok(FakeNetwork {
            config: config.clone(),
            relay,
            parachains,
            _tasks: tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self, name: &str) -> Option<&FakeLedger> {
        std::iter::once(&self.relay)
            .chain(&self.parachains)
            .find(|ledger| ledger.name == name)
    }

    pub async fn relay(&self) -> crate::error::Result<Relay> {
        let ledger = Ledger::connect(
            &self.config.relay,
            self.config.correlator.clone(),
            Arc::new(self.relay.clone()),
        )
        .await?;
        Relay::new(ledger)
    }

    pub async fn parachain(&self, name: &str) -> crate::error::Result<Ledger> {
        let config = self
            .config
            .parachain(name)
            .ok_or_else(|| anyhow!("no parachain named {name} is configured"))?;
        let backend = self
            .backend(name)
            .ok_or_else(|| anyhow!("{name} is not running"))?;
        Ledger::connect(config, self.config.correlator.clone(), Arc::new(backend.clone())).await
    }

    /// Every configured parachain, in configuration order.
    pub async fn parachains(&self) -> crate::error::Result<Vec<Ledger>> {
        let mut ledgers = Vec::with_capacity(self.parachains.len());
        for parachain in &self.parachains {
            ledgers.push(self.parachain(&parachain.name).await?);
        }
        Ok(ledgers)
    }

    /// The number of live subscriptions across the whole network.
    pub fn open_subscriptions(&self) -> usize {
        std::iter::once(&self.relay)
            .chain(&self.parachains)
            .map(FakeLedger::open_subscriptions)
            .sum()
    }
}
