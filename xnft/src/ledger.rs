//! A connected ledger and the configuration which tells apart one ledger's behaviour from another's.

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::*;

use crate::{
    account::{AccountId, Signer},
    cfg::{CorrelatorConfig, LedgerConfig, NftConfig},
    client::{Call, LedgerBackend, StorageQuery},
    error::Result,
    event::{ChainEvent, EventKind},
    exec::{self, TxResult},
    location::{AssetId, Junction, Location, MultiAsset},
    scan,
    sovereign::{Relationship, sovereign_account},
};

/// Where a ledger sits in the relay chain topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Relay,
    Parachain(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub symbol: String,
    pub decimals: u8,
    pub id: AssetId,
}

impl NativeCurrency {
    /// `units` whole tokens, in the currency's smallest denomination.
    pub fn amount(&self, units: u128) -> Result<u128> {
        scale(units, self.decimals)
            .ok_or_else(|| anyhow!("{units} {} overflows the smallest denomination", self.symbol).into())
    }

    pub fn as_multiasset(&self, units: u128) -> Result<MultiAsset> {
        Ok(MultiAsset::fungible(self.id.clone(), self.amount(units)?))
    }
}

/// `units * 10^decimals`, or `None` if it does not fit in a `u128`.
pub fn scale(units: u128, decimals: u8) -> Option<u128> {
    10u128
        .checked_pow(decimals.into())
        .and_then(|unit| units.checked_mul(unit))
}

/// A connected ledger.
///
/// Every ledger is the same type; what differs between them is captured by its [LedgerConfig] (native currency,
/// NFT dialect) and the [LedgerBackend] it talks to. Clones share the backend.
#[derive(Clone)]
pub struct Ledger {
    name: String,
    role: Role,
    currency: NativeCurrency,
    ss58_format: u16,
    nft: Option<NftConfig>,
    correlator: CorrelatorConfig,
    backend: Arc<dyn LedgerBackend>,
}

impl Debug for Ledger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("currency", &self.currency)
            .field("nft", &self.nft)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Connects to a ledger, reading its native currency metadata from the chain itself.
    pub async fn connect(
        config: &LedgerConfig,
        correlator: CorrelatorConfig,
        backend: Arc<dyn LedgerBackend>,
    ) -> Result<Ledger> {
        let properties = backend.properties().await?;
        let role = match config.para_id {
            Some(id) => Role::Parachain(id),
            None => Role::Relay,
        };
        if properties.token_symbol != config.native_currency.symbol {
            warn!(
                ledger = config.name,
                configured = config.native_currency.symbol,
                actual = properties.token_symbol,
                "native currency symbol differs from the configuration"
            );
        }
        let id = match &config.native_currency.id {
            Some(id) => id.clone(),
            None => AssetId::Concrete(own_location(role)),
        };

        info!(
            ledger = config.name,
            ?role,
            symbol = properties.token_symbol,
            decimals = properties.token_decimals,
            "connected"
        );
        Ok(Ledger {
            name: config.name.clone(),
            role,
            currency: NativeCurrency {
                symbol: properties.token_symbol,
                decimals: properties.token_decimals,
                id,
            },
            ss58_format: properties.ss58_format,
            nft: config.nft,
            correlator,
            backend,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn para_id(&self) -> Option<u32> {
        match self.role {
            Role::Relay => None,
            Role::Parachain(id) => Some(id),
        }
    }

    pub fn native_currency(&self) -> &NativeCurrency {
        &self.currency
    }

    pub fn correlator(&self) -> &CorrelatorConfig {
        &self.correlator
    }

    pub fn backend(&self) -> &Arc<dyn LedgerBackend> {
        &self.backend
    }

    pub fn nft(&self) -> Result<NftConfig> {
        Ok(self
            .nft
            .ok_or_else(|| anyhow!("{} does not support NFTs", self.name))?)
    }

    /// Renders `account` the way this ledger does.
    pub fn address(&self, account: AccountId) -> String {
        account.to_ss58(self.ss58_format)
    }

    /// This ledger, as seen by its siblings.
    pub fn location(&self) -> Location {
        own_location(self.role)
    }

    /// An account on this ledger, as seen by its siblings.
    pub fn account_location(&self, account: AccountId) -> Result<Location> {
        Ok(self
            .location()
            .pushed_with(Junction::AccountId32 {
                network: None,
                id: account,
            })?)
    }

    /// One of this ledger's NFT collections, as seen by its siblings.
    pub fn collection_location(&self, collection_id: u32) -> Result<Location> {
        let Role::Parachain(para_id) = self.role else {
            return Err(anyhow!("{} is not a parachain", self.name).into());
        };
        Ok(Location::parachain_collection(
            para_id,
            self.nft()?.pallet_instance,
            collection_id as u128,
        ))
    }

    /// The account on this ledger which holds everything `other` owns here.
    pub fn sovereign_account_of(&self, other: &Ledger) -> Result<AccountId> {
        let account = match (self.role, other.role) {
            (Role::Relay, Role::Parachain(id)) => sovereign_account(Relationship::Child, id),
            (Role::Parachain(_), Role::Parachain(id)) => sovereign_account(Relationship::Sibling, id),
            _ => {
                return Err(anyhow!(
                    "{} has no sovereign account for {}",
                    self.name,
                    other.name
                )
                .into());
            }
        };
        Ok(account)
    }

    /// Looks up a storage value. Returns `None` if the value is absent.
    pub async fn query<T: DeserializeOwned>(
        &self,
        section: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<T>> {
        let query = StorageQuery::new(section, method, args);
        trace!(ledger = self.name, %query, "query");
        let value = self.backend.query(query).await?;
        if value.is_null() {
            return Ok(None);
        }
        let value = serde_json::from_value(value)
            .map_err(|e| anyhow!("unexpected value of {section}.{method} on {}: {e}", self.name))?;
        Ok(Some(value))
    }

    pub async fn execute(&self, signer: &Signer, call: Call) -> Result<TxResult> {
        exec::execute(self, signer, call).await
    }

    /// The free balance of `account` in this ledger's native currency.
    pub async fn balance(&self, account: AccountId) -> Result<u128> {
        let balance: Option<Balance> = self
            .query("system", "account", vec![json!(account)])
            .await?;
        Ok(balance.map(|b| b.free).unwrap_or_default())
    }

    /// The free balance of `account` in a foreign currency registered on this ledger.
    pub async fn foreign_balance(&self, currency: &AssetId, account: AccountId) -> Result<u128> {
        let balance: Option<Balance> = self
            .query("tokens", "accounts", vec![json!(account), json!(currency)])
            .await?;
        Ok(balance.map(|b| b.free).unwrap_or_default())
    }

    /// Transfers native currency, keeping the sender's account alive.
    pub async fn transfer_native(&self, signer: &Signer, to: AccountId, amount: u128) -> Result<()> {
        self.execute(
            signer,
            Call::new(
                "balances",
                "transferKeepAlive",
                vec![json!(to), json!(amount.to_string())],
            ),
        )
        .await?;
        Ok(())
    }
}

fn own_location(role: Role) -> Location {
    match role {
        Role::Relay => Location::parent(),
        Role::Parachain(id) => Location::parachain(id),
    }
}

#[derive(serde::Deserialize)]
struct Balance {
    #[serde(with = "crate::serde_util::num_as_str")]
    free: u128,
}

/// Relay chain operations, used to bring the parachains up and connect them to each other.
#[derive(Debug, Clone)]
pub struct Relay(Ledger);

impl Relay {
    pub fn new(ledger: Ledger) -> Result<Self> {
        if ledger.role != Role::Relay {
            return Err(anyhow!("{} is not a relay chain", ledger.name).into());
        }
        Ok(Relay(ledger))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.0
    }

    pub async fn session_index(&self) -> Result<u32> {
        Ok(self
            .0
            .query("session", "currentIndex", vec![])
            .await?
            .unwrap_or_default())
    }

    /// Parachains produce blocks once the relay chain has rotated to its first session.
    pub async fn wait_for_parachains_start(&self) -> Result<()> {
        let index = self.session_index().await?;
        if index > 0 {
            debug!(index, "parachains are already running");
            return Ok(());
        }
        info!(ledger = self.0.name, "waiting for the parachains to start");
        let max_blocks = self.0.correlator.session_max_blocks;
        let sessions = scan::wait_for_events(&self.0, EventKind::NewSession, max_blocks).await?;
        if let Some(ChainEvent::NewSession { index }) = sessions
            .first()
            .map(ChainEvent::decode)
            .transpose()?
        {
            info!(index, "new session started");
        }
        Ok(())
    }

    pub async fn hrmp_channel_exists(&self, sender: u32, recipient: u32) -> Result<bool> {
        let channel: Option<Value> = self
            .0
            .query(
                "hrmp",
                "hrmpChannels",
                vec![json!({ "sender": sender, "recipient": recipient })],
            )
            .await?;
        Ok(channel.is_some())
    }

    /// Opens the channel from `sender` to `recipient`, if it is not already open.
    pub async fn force_open_hrmp_channel(&self, signer: &Signer, sender: u32, recipient: u32) -> Result<()> {
        if sender == recipient {
            return Err(anyhow!("cannot open an HRMP channel from {sender} to itself").into());
        }
        if self.hrmp_channel_exists(sender, recipient).await? {
            info!(sender, recipient, "HRMP channel is already open");
            return Ok(());
        }
        let call = Call::new(
            "hrmp",
            "forceOpenHrmpChannel",
            vec![json!(sender), json!(recipient), json!(8), json!(512)],
        )
        .sudo();
        self.0.execute(signer, call).await?;
        info!(sender, recipient, "opened HRMP channel");
        Ok(())
    }

    pub async fn force_open_hrmp_duplex(&self, signer: &Signer, first: u32, second: u32) -> Result<()> {
        self.force_open_hrmp_channel(signer, first, second).await?;
        self.force_open_hrmp_channel(signer, second, first).await
    }
}
