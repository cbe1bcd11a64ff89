//! Mapping reserve assets to their derivatives on other ledgers.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::{
    account::Signer,
    cfg::NftDialect,
    client::Call,
    error::{Error, Result},
    event::{ChainEvent, EventKind},
    ledger::{Ledger, NativeCurrency},
    location::{AssetId, AssetInstance, Versioned},
    token::Token,
};

/// The state of the derivative of one foreign token on a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivativeStatus {
    /// The derivative exists and is in circulation.
    Active(u32),
    /// The derivative exists, but its reserve token has been sent back to the reserve. The derivative is held until
    /// the reserve token is exported again.
    Stashed(u32),
    /// No derivative has ever been minted.
    NotExists,
}

impl DerivativeStatus {
    /// The local token ID, if a derivative exists.
    pub fn token_id(self) -> Option<u32> {
        match self {
            DerivativeStatus::Active(id) | DerivativeStatus::Stashed(id) => Some(id),
            DerivativeStatus::NotExists => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, DerivativeStatus::Active(_))
    }
}

/// `assetRegistry.assetMetadatas`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(with = "crate::serde_util::num_as_str")]
    pub minimal_balance: u128,
}

/// The local collection which holds derivatives of `asset_id`, if one is registered.
pub async fn derivative_collection(ledger: &Ledger, asset_id: &AssetId) -> Result<Option<u32>> {
    let (section, method) = match ledger.nft()?.dialect {
        NftDialect::ForeignAssets => ("foreignAssets", "foreignAssetToCollection"),
        NftDialect::Xnft => ("xnft", "foreignAssetToClass"),
    };
    ledger.query(section, method, vec![json!(asset_id)]).await
}

/// The status of the derivative of `instance` in the local collection `collection_id`.
pub async fn derivative_status(
    ledger: &Ledger,
    collection_id: u32,
    instance: AssetInstance,
) -> Result<DerivativeStatus> {
    let args = vec![json!(collection_id), json!(instance)];
    let status = match ledger.nft()?.dialect {
        // Derivatives are burned when their reserve token leaves, so a mapped one is always in circulation.
        NftDialect::ForeignAssets => ledger
            .query("foreignAssets", "foreignReserveAssetInstanceToTokenId", args)
            .await?
            .map_or(DerivativeStatus::NotExists, DerivativeStatus::Active),
        NftDialect::Xnft => ledger
            .query("xnft", "foreignInstanceToDerivativeStatus", args)
            .await?
            .unwrap_or(DerivativeStatus::NotExists),
    };
    Ok(status)
}

/// Resolves the derivative of `token` on `ledger`.
///
/// An active and a stashed derivative resolve to the same token. Use [derivative_status] to tell them apart.
pub async fn derivative_of(ledger: &Ledger, token: &Token) -> Result<Token> {
    let asset_id = token.asset_id()?;
    let Some(collection_id) = derivative_collection(ledger, &asset_id).await? else {
        return Err(Error::NoDerivativeCollection {
            ledger: ledger.name().to_owned(),
            asset_id,
        });
    };
    let instance = token.asset_instance();
    let Some(token_id) = derivative_status(ledger, collection_id, instance)
        .await?
        .token_id()
    else {
        return Err(Error::NoDerivativeToken {
            ledger: ledger.name().to_owned(),
            asset_id,
            instance,
        });
    };

    let derivative = Token::new(ledger, collection_id, token_id);
    debug!(%token, %derivative, "resolved derivative");
    Ok(derivative)
}

/// Registers a collection on `ledger` to hold derivatives of the NFT collection `asset_id`, returning its ID.
///
/// Registering an asset which is already registered returns the existing collection.
pub async fn register_foreign_asset(
    ledger: &Ledger,
    signer: &Signer,
    asset_id: &AssetId,
    description: &str,
) -> Result<u32> {
    if let Some(collection_id) = derivative_collection(ledger, asset_id).await? {
        info!(
            ledger = ledger.name(),
            %asset_id,
            collection_id,
            "the foreign asset \"{description}\" is already registered"
        );
        return Ok(collection_id);
    }

    let collection_id = match ledger.nft()?.dialect {
        NftDialect::ForeignAssets => {
            let call = Call::new(
                "foreignAssets",
                "forceRegisterForeignAsset",
                vec![
                    json!(Versioned::V3(asset_id)),
                    json!(utf16(description)),
                    json!("xNFT"),
                    json!("NFT"),
                ],
            );
            let result = ledger.execute(signer, call.sudo()).await?;
            let ChainEvent::CollectionCreated { collection_id, .. } =
                result.extract_first(EventKind::CollectionCreated)?
            else {
                return Err(Error::EventNotFound(EventKind::CollectionCreated));
            };
            collection_id
        }
        NftDialect::Xnft => {
            let call = Call::new("xnft", "registerAsset", vec![json!(Versioned::V3(asset_id))]);
            let result = ledger.execute(signer, call.sudo()).await?;
            let ChainEvent::XnftAssetRegistered { class_id, .. } =
                result.extract_first(EventKind::XnftAssetRegistered)?
            else {
                return Err(Error::EventNotFound(EventKind::XnftAssetRegistered));
            };
            class_id
        }
    };

    info!(
        ledger = ledger.name(),
        %asset_id,
        collection_id,
        "registered the NFT foreign asset \"{description}\""
    );
    Ok(collection_id)
}

/// Registers `currency`, the native currency of another ledger, as a foreign currency on `ledger`.
///
/// Registering a currency which is already registered does nothing.
pub async fn register_foreign_currency(
    ledger: &Ledger,
    signer: &Signer,
    currency: &NativeCurrency,
) -> Result<()> {
    let call = match ledger.nft()?.dialect {
        NftDialect::ForeignAssets => {
            let existing: Option<u32> = ledger
                .query(
                    "foreignAssets",
                    "foreignAssetToCollection",
                    vec![json!(currency.id)],
                )
                .await?;
            if existing.is_some() {
                info!(ledger = ledger.name(), symbol = currency.symbol, "the foreign currency is already registered");
                return Ok(());
            }
            Call::new(
                "foreignAssets",
                "forceRegisterForeignAsset",
                vec![
                    json!(Versioned::V3(&currency.id)),
                    json!(utf16(&currency.symbol)),
                    json!(currency.symbol),
                    json!({ "Fungible": currency.decimals }),
                ],
            )
        }
        NftDialect::Xnft => {
            // The registry is keyed by location. Currencies are told apart by symbol.
            let registered: Vec<AssetMetadata> = ledger
                .query("assetRegistry", "assetMetadatas", vec![])
                .await?
                .unwrap_or_default();
            if registered.iter().any(|m| m.symbol == currency.symbol) {
                info!(ledger = ledger.name(), symbol = currency.symbol, "the foreign currency is already registered");
                return Ok(());
            }
            let AssetId::Concrete(location) = &currency.id else {
                return Err(anyhow::anyhow!(
                    "{} can only register currencies with a concrete location, got {}",
                    ledger.name(),
                    currency.id
                )
                .into());
            };
            let metadata = AssetMetadata {
                name: currency.symbol.clone(),
                symbol: currency.symbol.clone(),
                decimals: currency.decimals,
                minimal_balance: currency.amount(1)?,
            };
            Call::new(
                "assetRegistry",
                "registerForeignAsset",
                vec![json!(Versioned::V3(location)), json!(metadata)],
            )
        }
    };

    ledger.execute(signer, call.sudo()).await?;
    info!(ledger = ledger.name(), symbol = currency.symbol, "registered the foreign currency");
    Ok(())
}

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        account::AccountId,
        client::{StorageQuery, TxStatus},
        location::Location,
        testing::{ScriptedBackend, scripted_ledger, scripted_ledger_with_dialect},
    };

    fn reserve_token(ledger: &Ledger) -> Token {
        // Any ledger with NFTs can stand in for the reserve; only the projection to an asset matters here.
        Token::new(ledger, 3, 9)
    }

    #[test]
    fn status_wire_format() {
        assert_eq!(
            serde_json::to_value(DerivativeStatus::Active(4)).unwrap(),
            json!({ "active": 4 })
        );
        assert_eq!(
            serde_json::from_value::<DerivativeStatus>(json!({ "stashed": 2 })).unwrap(),
            DerivativeStatus::Stashed(2)
        );
        assert_eq!(
            serde_json::from_value::<DerivativeStatus>(json!("notExists")).unwrap(),
            DerivativeStatus::NotExists
        );
        assert_eq!(DerivativeStatus::Stashed(2).token_id(), Some(2));
        assert!(!DerivativeStatus::Stashed(2).is_active());
    }

    #[tokio::test]
    async fn resolution_failures() {
        let backend = ScriptedBackend::new();
        let ledger = scripted_ledger_with_dialect(&backend, NftDialect::Xnft).await;
        let token = reserve_token(&ledger);
        let asset_id = token.asset_id().unwrap();

        let error = derivative_of(&ledger, &token).await.unwrap_err();
        assert!(matches!(error, Error::NoDerivativeCollection { .. }), "{error}");

        backend.set_storage(
            StorageQuery::new("xnft", "foreignAssetToClass", vec![json!(asset_id)]),
            json!(5),
        );
        let status_query = StorageQuery::new(
            "xnft",
            "foreignInstanceToDerivativeStatus",
            vec![json!(5), json!(AssetInstance::Index(9))],
        );
        backend.set_storage(status_query.clone(), json!("notExists"));
        let error = derivative_of(&ledger, &token).await.unwrap_err();
        assert!(matches!(error, Error::NoDerivativeToken { .. }), "{error}");

        // Stashed and active derivatives are the same token.
        for status in [json!({ "stashed": 1 }), json!({ "active": 1 })] {
            backend.set_storage(status_query.clone(), status);
            let derivative = derivative_of(&ledger, &token).await.unwrap();
            assert_eq!((derivative.collection_id, derivative.token_id), (5, 1));
        }
    }

    #[tokio::test]
    async fn foreign_assets_derivatives_are_active_while_mapped() {
        let backend = ScriptedBackend::new();
        let ledger = scripted_ledger(&backend).await;
        let instance = AssetInstance::Index(2);
        let query = StorageQuery::new(
            "foreignAssets",
            "foreignReserveAssetInstanceToTokenId",
            vec![json!(1), json!(instance)],
        );

        assert_eq!(
            derivative_status(&ledger, 1, instance).await.unwrap(),
            DerivativeStatus::NotExists
        );
        backend.set_storage(query, json!(6));
        assert_eq!(
            derivative_status(&ledger, 1, instance).await.unwrap(),
            DerivativeStatus::Active(6)
        );
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let backend = ScriptedBackend::new();
        let ledger = scripted_ledger(&backend).await;
        let alice = Signer::from_uri("//Alice");
        let asset_id = AssetId::Concrete(Location::parachain_collection(2000, Some(121), 4));

        backend.push_tx(vec![TxStatus::InBlock {
            height: 3,
            events: vec![
                ChainEvent::CollectionCreated {
                    collection_id: 11,
                    owner: AccountId::new([0; 32]),
                }
                .encode(),
                ChainEvent::ExtrinsicSuccess.encode(),
            ],
        }]);
        let first = register_foreign_asset(&ledger, &alice, &asset_id, "Karura NFT")
            .await
            .unwrap();
        assert_eq!(first, 11);
        let submitted = backend.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].is("sudo", "sudo"));
        assert_eq!(submitted[0].args[0]["method"], json!("forceRegisterForeignAsset"));

        backend.set_storage(
            StorageQuery::new("foreignAssets", "foreignAssetToCollection", vec![json!(asset_id)]),
            json!(11),
        );
        let second = register_foreign_asset(&ledger, &alice, &asset_id, "Karura NFT")
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.submitted().len(), 1);
    }

    #[tokio::test]
    async fn currencies_are_registered_once_per_symbol() {
        let backend = ScriptedBackend::new();
        let ledger = scripted_ledger_with_dialect(&backend, NftDialect::Xnft).await;
        let alice = Signer::from_uri("//Alice");
        let qtz = NativeCurrency {
            symbol: "QTZ".to_owned(),
            decimals: 18,
            id: AssetId::Concrete(Location::parachain(2095)),
        };

        backend.push_tx(vec![TxStatus::InBlock {
            height: 1,
            events: vec![ChainEvent::ExtrinsicSuccess.encode()],
        }]);
        register_foreign_currency(&ledger, &alice, &qtz).await.unwrap();
        let metadata: AssetMetadata =
            serde_json::from_value(backend.submitted()[0].args[0]["args"][1].clone()).unwrap();
        assert_eq!(metadata.minimal_balance, 10u128.pow(18));

        backend.set_storage(
            StorageQuery::new("assetRegistry", "assetMetadatas", vec![]),
            Value::Array(vec![json!(metadata)]),
        );
        register_foreign_currency(&ledger, &alice, &qtz).await.unwrap();
        assert_eq!(backend.submitted().len(), 1);
    }
}
