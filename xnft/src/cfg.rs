use std::{fs, path::Path, time::Duration};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{account::GENERIC_SS58_FORMAT, location::AssetId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The relay chain which the parachains are attached to.
    #[serde(default = "relay_default")]
    pub relay: LedgerConfig,
    /// Every parachain to bridge between.
    #[serde(default)]
    pub parachains: Vec<LedgerConfig>,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Secret URIs of the development accounts, endowed at genesis. The first one is the sudo key.
    #[serde(default = "accounts_default")]
    pub accounts: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            relay: relay_default(),
            parachains: vec![],
            correlator: CorrelatorConfig::default(),
            simulation: SimulationConfig::default(),
            accounts: accounts_default(),
        }
    }
}

impl Config {
    pub fn parachain(&self, name: &str) -> Option<&LedgerConfig> {
        self.parachains.iter().find(|p| p.name == name)
    }
}

pub fn relay_default() -> LedgerConfig {
    LedgerConfig {
        name: "Relay".to_owned(),
        para_id: None,
        native_currency: NativeCurrencyConfig {
            symbol: "ROC".to_owned(),
            decimals: 12,
            id: None,
        },
        ss58_format: GENERIC_SS58_FORMAT,
        nft: None,
    }
}

pub fn accounts_default() -> Vec<String> {
    ["//Alice", "//Bob", "//Charlie", "//Dave"]
        .map(str::to_owned)
        .to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    pub name: String,
    /// The parachain ID. `None` for the relay chain.
    #[serde(default)]
    pub para_id: Option<u32>,
    pub native_currency: NativeCurrencyConfig,
    #[serde(default = "ss58_format_default")]
    pub ss58_format: u16,
    /// How this ledger exposes NFTs. `None` if it has no NFT support.
    #[serde(default)]
    pub nft: Option<NftConfig>,
}

pub fn ss58_format_default() -> u16 {
    GENERIC_SS58_FORMAT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeCurrencyConfig {
    pub symbol: String,
    pub decimals: u8,
    /// The canonical identity of the currency. Defaults to the ledger's own location, as seen by its siblings.
    #[serde(default)]
    pub id: Option<AssetId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NftConfig {
    pub dialect: NftDialect,
    /// The pallet instance which namespaces this ledger's NFT collections in their locations.
    #[serde(default)]
    pub pallet_instance: Option<u8>,
}

/// The NFT APIs a ledger speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NftDialect {
    /// Collections live in `common`/`unique`; derivatives are registered with `foreignAssets` and burned when
    /// they are sent back to their reserve.
    ForeignAssets,
    /// Classes live in `nft`/`ormlNFT`; derivatives are registered with `xnft` and stashed when they are sent back to
    /// their reserve.
    Xnft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelatorConfig {
    /// Blocks to observe before giving up on an event, unless a caller asks for a different window.
    #[serde(default = "max_blocks_default")]
    pub max_blocks: usize,
    /// Blocks to observe on the destination ledger before a transfer is considered undelivered.
    #[serde(default = "delivery_max_blocks_default")]
    pub delivery_max_blocks: usize,
    /// Blocks to observe on the relay chain while waiting for a new session.
    #[serde(default = "session_max_blocks_default")]
    pub session_max_blocks: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        CorrelatorConfig {
            max_blocks: max_blocks_default(),
            delivery_max_blocks: delivery_max_blocks_default(),
            session_max_blocks: session_max_blocks_default(),
        }
    }
}

pub fn max_blocks_default() -> usize {
    5
}

pub fn delivery_max_blocks_default() -> usize {
    10
}

pub fn session_max_blocks_default() -> usize {
    12
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// The mean time between blocks on every simulated ledger.
    #[serde(default = "block_time_default")]
    pub block_time: Duration,
    /// The maximum deviation from `block_time` of a single block.
    #[serde(default = "block_time_jitter_default")]
    pub block_time_jitter: Duration,
    /// The maximum number of destination blocks a message spends in transit.
    #[serde(default = "max_delivery_delay_blocks_default")]
    pub max_delivery_delay_blocks: u64,
    /// Relay chain blocks per session.
    #[serde(default = "session_length_default")]
    pub session_length: u64,
    /// Seed for block timing and message delays. Random if unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            block_time: block_time_default(),
            block_time_jitter: block_time_jitter_default(),
            max_delivery_delay_blocks: max_delivery_delay_blocks_default(),
            session_length: session_length_default(),
            seed: None,
        }
    }
}

pub fn block_time_default() -> Duration {
    Duration::from_millis(6000)
}

pub fn block_time_jitter_default() -> Duration {
    Duration::from_millis(2000)
}

pub fn max_delivery_delay_blocks_default() -> u64 {
    2
}

pub fn session_length_default() -> u64 {
    10
}

/// Reads and merges the given TOML files. Each top-level key may only be set by one file.
pub fn read_config<P: AsRef<Path>>(paths: &[P]) -> Result<Config> {
    let mut merged_config = toml::Table::new();
    for path in paths {
        let path = path.as_ref();
        let config = fs::read_to_string(path)?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {path:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    let config: Config = Deserialize::deserialize(merged_config)?;
    Ok(config)
}
