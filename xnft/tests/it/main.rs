mod registration;
mod scan;
mod transfer;

use serde_json::json;
use tracing::*;
use xnft::{
    account::Signer,
    cfg::{Config, LedgerConfig, NativeCurrencyConfig, NftConfig, NftDialect, SimulationConfig},
    fake::FakeNetwork,
    ledger::{Ledger, Relay},
    location::AssetId,
    registry,
    token::{Collection, Token},
};

pub const QUARTZ: u32 = 2095;
pub const KARURA: u32 = 2000;

/// A relay chain with a parachain of each NFT dialect, running on a simulated network.
pub struct Network {
    pub fake: FakeNetwork,
    pub relay: Relay,
    pub quartz: Ledger,
    pub karura: Ledger,
    pub alice: Signer,
    pub bob: Signer,
}

fn config(seed: u64) -> Config {
    let karura_currency: AssetId = serde_json::from_value(json!({
        "Concrete": {
            "parents": 1,
            "interior": { "X2": [
                { "Parachain": KARURA },
                { "GeneralKey": {
                    "length": 2,
                    "data": "0x0080000000000000000000000000000000000000000000000000000000000000",
                } },
            ] },
        }
    }))
    .unwrap();
    Config {
        parachains: vec![
            LedgerConfig {
                name: "Quartz".to_owned(),
                para_id: Some(QUARTZ),
                native_currency: NativeCurrencyConfig {
                    symbol: "QTZ".to_owned(),
                    decimals: 18,
                    id: None,
                },
                ss58_format: 255,
                nft: Some(NftConfig {
                    dialect: NftDialect::ForeignAssets,
                    pallet_instance: None,
                }),
            },
            LedgerConfig {
                name: "Karura".to_owned(),
                para_id: Some(KARURA),
                native_currency: NativeCurrencyConfig {
                    symbol: "KAR".to_owned(),
                    decimals: 12,
                    id: Some(karura_currency),
                },
                ss58_format: 8,
                nft: Some(NftConfig {
                    dialect: NftDialect::Xnft,
                    pallet_instance: Some(121),
                }),
            },
        ],
        simulation: SimulationConfig {
            seed: Some(seed),
            ..SimulationConfig::default()
        },
        accounts: vec!["//Alice".to_owned(), "//Bob".to_owned()],
        ..Config::default()
    }
}

impl Network {
    pub async fn new(seed: u64) -> Network {
        let fake = FakeNetwork::start(&config(seed)).unwrap();
        let relay = fake.relay().await.unwrap();
        let quartz = fake.parachain("Quartz").await.unwrap();
        let karura = fake.parachain("Karura").await.unwrap();
        Network {
            fake,
            relay,
            quartz,
            karura,
            alice: Signer::from_uri("//Alice"),
            bob: Signer::from_uri("//Bob"),
        }
    }

    /// Waits for the parachains to start, connects them and registers each one's currency with the other.
    pub async fn setup(&self) {
        self.relay.wait_for_parachains_start().await.unwrap();
        self.relay
            .force_open_hrmp_duplex(&self.alice, QUARTZ, KARURA)
            .await
            .unwrap();
        registry::register_foreign_currency(&self.quartz, &self.alice, self.karura.native_currency())
            .await
            .unwrap();
        registry::register_foreign_currency(&self.karura, &self.alice, self.quartz.native_currency())
            .await
            .unwrap();
        info!("network is set up");
    }

    /// Mints a token owned by `owner` in a new collection on `ledger`, and registers its collection on the other
    /// parachain.
    pub async fn mint(&self, ledger: &Ledger, owner: &Signer) -> Token {
        let collection = Collection::create(ledger, owner).await.unwrap();
        let token = collection.mint(owner, owner.account()).await.unwrap();
        registry::register_foreign_asset(self.other(ledger), &self.alice, &token.asset_id().unwrap(), "xNFT")
            .await
            .unwrap();
        token
    }

    pub fn other(&self, ledger: &Ledger) -> &Ledger {
        if ledger.name() == self.quartz.name() {
            &self.karura
        } else {
            &self.quartz
        }
    }
}
