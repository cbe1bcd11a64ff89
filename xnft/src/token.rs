//! NFT collections and tokens, in each ledger's own dialect.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::{
    account::{AccountId, Signer},
    cfg::NftDialect,
    client::Call,
    error::{Error, Result},
    event::{ChainEvent, EventKind},
    ledger::Ledger,
    location::{AssetId, AssetInstance, MultiAsset},
    sovereign::pallet_sub_account,
};

/// The pallet which owns the accounts of ORML NFT classes.
pub const NFT_CLASS_PALLET_ID: &str = "aca/aNFT";

/// Transferable, burnable, mintable and class properties mutable.
const CLASS_FEATURES_ALL: u8 = 0xF;

/// An account as the `common` pallet addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossAccountId {
    Substrate(AccountId),
}

/// `nonfungible.tokenData`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub owner: CrossAccountId,
}

/// `ormlNFT.tokens`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrmlTokenInfo {
    pub owner: AccountId,
}

/// A collection on a given ledger.
#[derive(Debug, Clone)]
pub struct Collection {
    pub ledger: Ledger,
    pub id: u32,
}

impl Collection {
    /// Creates a new NFT collection owned by `signer`.
    pub async fn create(ledger: &Ledger, signer: &Signer) -> Result<Collection> {
        let id = match ledger.nft()?.dialect {
            NftDialect::ForeignAssets => {
                let call = Call::new(
                    "unique",
                    "createCollectionEx",
                    vec![json!({ "mode": "NFT", "tokenPrefix": "xNFT" })],
                );
                let result = ledger.execute(signer, call).await?;
                let ChainEvent::CollectionCreated { collection_id, .. } =
                    result.extract_first(EventKind::CollectionCreated)?
                else {
                    return Err(Error::EventNotFound(EventKind::CollectionCreated));
                };
                collection_id
            }
            NftDialect::Xnft => {
                let call = Call::new(
                    "nft",
                    "createClass",
                    vec![json!("xNFT Collection"), json!(CLASS_FEATURES_ALL), json!({})],
                );
                let result = ledger.execute(signer, call).await?;
                let ChainEvent::CreatedClass { class_id, .. } =
                    result.extract_first(EventKind::CreatedClass)?
                else {
                    return Err(Error::EventNotFound(EventKind::CreatedClass));
                };
                // The class account pays the deposits of the tokens minted into the class.
                let class_account = pallet_sub_account(NFT_CLASS_PALLET_ID, class_id)?;
                let deposit = ledger.native_currency().amount(10)?;
                ledger.transfer_native(signer, class_account, deposit).await?;
                class_id
            }
        };

        let collection = Collection {
            ledger: ledger.clone(),
            id,
        };
        info!(%collection, "created NFT collection");
        Ok(collection)
    }

    pub fn asset_id(&self) -> Result<AssetId> {
        Ok(AssetId::Concrete(self.ledger.collection_location(self.id)?))
    }

    /// Mints a token owned by `owner`.
    pub async fn mint(&self, signer: &Signer, owner: AccountId) -> Result<Token> {
        let ledger = &self.ledger;
        let token_id = match ledger.nft()?.dialect {
            NftDialect::ForeignAssets => {
                let call = Call::new(
                    "unique",
                    "createItem",
                    vec![
                        json!(self.id),
                        json!(CrossAccountId::Substrate(owner)),
                        json!("NFT"),
                    ],
                );
                let result = ledger.execute(signer, call).await?;
                let ChainEvent::ItemCreated { token_id, .. } =
                    result.extract_first(EventKind::ItemCreated)?
                else {
                    return Err(Error::EventNotFound(EventKind::ItemCreated));
                };
                token_id
            }
            NftDialect::Xnft => {
                // `nft.MintedToken` does not carry the token ID, so read the next one first.
                let token_id: u32 = ledger
                    .query("ormlNFT", "nextTokenId", vec![json!(self.id)])
                    .await?
                    .unwrap_or_default();
                // Tokens are minted by the class account, which the class owner controls through a proxy.
                let class_account = pallet_sub_account(NFT_CLASS_PALLET_ID, self.id)?;
                let mint = Call::new(
                    "nft",
                    "mint",
                    vec![json!(owner), json!(self.id), json!("xNFT"), json!({}), json!(1)],
                );
                let call = Call::new(
                    "proxy",
                    "proxy",
                    vec![json!(class_account), json!("Any"), json!(mint)],
                );
                ledger
                    .execute(signer, call)
                    .await?
                    .extract_events(EventKind::MintedToken)?;
                token_id
            }
        };

        let token = Token {
            ledger: ledger.clone(),
            collection_id: self.id,
            token_id,
        };
        info!(%token, owner = ledger.address(owner), "minted NFT");
        Ok(token)
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/Collection({})", self.ledger.name(), self.id)
    }
}

/// A token in a collection on a given ledger.
#[derive(Debug, Clone)]
pub struct Token {
    pub ledger: Ledger,
    pub collection_id: u32,
    pub token_id: u32,
}

impl Token {
    pub fn new(ledger: &Ledger, collection_id: u32, token_id: u32) -> Self {
        Token {
            ledger: ledger.clone(),
            collection_id,
            token_id,
        }
    }

    pub fn collection(&self) -> Collection {
        Collection {
            ledger: self.ledger.clone(),
            id: self.collection_id,
        }
    }

    /// The collection's identity when this token leaves its ledger.
    pub fn asset_id(&self) -> Result<AssetId> {
        self.collection().asset_id()
    }

    pub fn asset_instance(&self) -> AssetInstance {
        AssetInstance::Index(self.token_id as u128)
    }

    pub fn as_multiasset(&self) -> Result<MultiAsset> {
        Ok(MultiAsset::non_fungible(self.asset_id()?, self.asset_instance()))
    }

    /// The current owner, or `None` if the token does not exist.
    pub async fn owner(&self) -> Result<Option<AccountId>> {
        let ledger = &self.ledger;
        let args = vec![json!(self.collection_id), json!(self.token_id)];
        let owner = match ledger.nft()?.dialect {
            NftDialect::ForeignAssets => ledger
                .query::<TokenData>("nonfungible", "tokenData", args)
                .await?
                .map(|data| match data.owner {
                    CrossAccountId::Substrate(account) => account,
                }),
            NftDialect::Xnft => ledger
                .query::<OrmlTokenInfo>("ormlNFT", "tokens", args)
                .await?
                .map(|info| info.owner),
        };
        Ok(owner)
    }

    /// Whether `account` currently owns this token.
    pub async fn check_owner(&self, account: AccountId) -> Result<bool> {
        match self.ledger.nft()?.dialect {
            NftDialect::ForeignAssets => Ok(self
                .ledger
                .query(
                    "nonfungible",
                    "owned",
                    vec![
                        json!(self.collection_id),
                        json!(CrossAccountId::Substrate(account)),
                        json!(self.token_id),
                    ],
                )
                .await?
                .unwrap_or(false)),
            NftDialect::Xnft => Ok(self.owner().await? == Some(account)),
        }
    }

    /// Fails with [Error::CustodyViolation] unless `account` owns this token.
    pub async fn expect_owner(&self, account: AccountId) -> Result<()> {
        if !self.check_owner(account).await? {
            return Err(Error::CustodyViolation {
                token: self.to_string(),
                expected: self.ledger.address(account),
            });
        }
        debug!(token = %self, owner = self.ledger.address(account), "ownership confirmed");
        Ok(())
    }

    /// Transfers this token within its ledger, using the ledger's native NFT API.
    pub async fn transfer(&self, signer: &Signer, to: AccountId) -> Result<()> {
        let call = match self.ledger.nft()?.dialect {
            NftDialect::ForeignAssets => Call::new(
                "unique",
                "transfer",
                vec![
                    json!(CrossAccountId::Substrate(to)),
                    json!(self.collection_id),
                    json!(self.token_id),
                    json!(1),
                ],
            ),
            NftDialect::Xnft => Call::new(
                "nft",
                "transfer",
                vec![json!(to), json!([self.collection_id, self.token_id])],
            ),
        };
        self.ledger.execute(signer, call).await?;
        info!(token = %self, to = self.ledger.address(to), "transferred NFT");
        Ok(())
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/Collection({})/Token({})",
            self.ledger.name(),
            self.collection_id,
            self.token_id
        )
    }
}
