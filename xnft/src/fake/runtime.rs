//! The state transition function of a simulated ledger.
//!
//! Only the calls and storage items the bridge protocol touches are modelled. Each ledger runs one of two NFT
//! dialects, matching [NftDialect].

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::*;

use super::xcm::{Instruction, Message, Router};
use crate::{
    account::AccountId,
    cfg::{NftConfig, NftDialect},
    client::{Call, StorageQuery},
    event::{ChainEvent, DispatchError, Event, ModuleError},
    location::{AssetId, AssetInstance, Fungibility, Junction, Location, MultiAsset, Versioned},
    registry::{AssetMetadata, DerivativeStatus},
    serde_util::num_as_str,
    sovereign::{Relationship, pallet_account, pallet_sub_account, sovereign_account},
    token::{CrossAccountId, NFT_CLASS_PALLET_ID},
};

/// The module errors every simulated ledger knows, by pallet index. Variants are indexed by position.
const MODULE_ERRORS: &[(u8, &str, &[&str])] = &[
    (10, "balances", &["InsufficientBalance", "ExistentialDeposit"]),
    (12, "sudo", &["RequireSudo"]),
    (29, "proxy", &["TooMany", "NotFound", "NotProxy"]),
    (
        54,
        "xTokens",
        &[
            "AssetHasNoReserve",
            "NotCrossChainTransfer",
            "XcmExecutionFailed",
            "SendFailure",
            "NotSupportedMultiLocation",
            "FeeNotEnough",
        ],
    ),
    (
        60,
        "hrmp",
        &["OpenHrmpChannelToSelf", "OpenHrmpChannelAlreadyExists"],
    ),
    (
        66,
        "common",
        &["CollectionNotFound", "TokenNotFound", "NoPermission", "UnsupportedOperation"],
    ),
    (80, "foreignAssets", &["AssetAlreadyRegistered"]),
    (
        121,
        "nft",
        &["ClassIdNotFound", "TokenIdNotFound", "NoPermission", "InvalidQuantity"],
    ),
    (122, "xnft", &["AssetAlreadyRegistered"]),
    (123, "assetRegistry", &["MultiLocationExisted"]),
];

/// Resolves a module error against [MODULE_ERRORS].
pub fn lookup_module_error(error: &ModuleError) -> Option<(String, String)> {
    let (_, section, variants) = MODULE_ERRORS.iter().find(|(index, ..)| *index == error.index)?;
    let method = variants.get(error.variant() as usize)?;
    Some((section.to_string(), method.to_string()))
}

fn module_error(section: &str, method: &str) -> DispatchError {
    MODULE_ERRORS
        .iter()
        .find(|(_, s, _)| *s == section)
        .and_then(|(index, _, variants)| {
            let variant = variants.iter().position(|m| *m == method)?;
            Some(DispatchError::Module(ModuleError::new(*index, variant as u8)))
        })
        .unwrap_or_else(|| DispatchError::Other(format!("{section}.{method}")))
}

/// Where a failing XCM program gives up. Reported in `xcmpQueue.Fail`.
const ASSET_NOT_FOUND: &str = "AssetNotFound";
const NOT_HOLDING_FEES: &str = "NotHoldingFees";
const FAILED_TO_TRANSACT_ASSET: &str = "FailedToTransactAsset";
const UNTRUSTED_RESERVE_LOCATION: &str = "UntrustedReserveLocation";

/// The share of a transfer's fee consumed by its execution on the destination is `1 / EXECUTION_COST_DIVISOR`.
const EXECUTION_COST_DIVISOR: u128 = 20;

const FOREIGN_ASSETS_PALLET_ID: &str = "frgnasts";
const XNFT_PALLET_ID: &str = "aca/xNFT";

type DispatchResult = Result<Vec<Event>, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Root,
    Signed(AccountId),
}

impl Origin {
    fn signed(self) -> Result<AccountId, DispatchError> {
        match self {
            Origin::Signed(account) => Ok(account),
            Origin::Root => Err(DispatchError::BadOrigin),
        }
    }

    fn ensure_root(self) -> Result<(), DispatchError> {
        match self {
            Origin::Root => Ok(()),
            Origin::Signed(_) => Err(DispatchError::BadOrigin),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Nft,
    Fungible(u8),
}

#[derive(Debug, Clone)]
struct Collection {
    owner: AccountId,
    mode: Mode,
    /// The asset this collection holds derivatives of, if it is not a native collection.
    reserve: Option<AssetId>,
    tokens: BTreeMap<u32, AccountId>,
    next_token_id: u32,
}

impl Collection {
    fn new(owner: AccountId, mode: Mode, reserve: Option<AssetId>) -> Self {
        Collection {
            owner,
            mode,
            reserve,
            tokens: BTreeMap::new(),
            next_token_id: 0,
        }
    }
}

#[derive(Deserialize)]
struct Amount(#[serde(with = "num_as_str")] u128);

#[derive(Deserialize)]
struct HrmpChannelId {
    sender: u32,
    recipient: u32,
}

/// What a ledger's runtime needs from the outside world while it applies a block.
pub struct Context<'a> {
    pub router: &'a Router,
    /// Messages to send once the extrinsic which produced them succeeds, with their destinations.
    pub outbox: Vec<(u32, Message)>,
}

#[derive(Debug, Clone)]
pub struct Runtime {
    name: String,
    para_id: Option<u32>,
    nft: Option<NftConfig>,
    native: AssetId,
    decimals: u8,
    sudo_key: AccountId,
    balances: HashMap<AccountId, u128>,
    foreign_balances: HashMap<(AssetId, AccountId), u128>,
    currencies: HashMap<AssetId, AssetMetadata>,
    collections: BTreeMap<u32, Collection>,
    next_collection_id: u32,
    foreign_assets: HashMap<AssetId, u32>,
    derivatives: HashMap<(u32, AssetInstance), DerivativeStatus>,
    /// `(delegate, real)` pairs.
    proxies: HashSet<(AccountId, AccountId)>,
    message_nonce: u64,
}

impl Runtime {
    /// A ledger whose first endowed account holds the sudo key.
    pub fn genesis(
        name: &str,
        para_id: Option<u32>,
        nft: Option<NftConfig>,
        native: AssetId,
        decimals: u8,
        endowed: &[AccountId],
        endowment: u128,
    ) -> anyhow::Result<Runtime> {
        let sudo_key = *endowed
            .first()
            .ok_or_else(|| anyhow!("{name} needs at least one endowed account"))?;
        let next_collection_id = match nft.map(|n| n.dialect) {
            Some(NftDialect::ForeignAssets) => 1,
            _ => 0,
        };
        Ok(Runtime {
            name: name.to_owned(),
            para_id,
            nft,
            native,
            decimals,
            sudo_key,
            balances: endowed.iter().map(|a| (*a, endowment)).collect(),
            foreign_balances: HashMap::new(),
            currencies: HashMap::new(),
            collections: BTreeMap::new(),
            next_collection_id,
            foreign_assets: HashMap::new(),
            derivatives: HashMap::new(),
            proxies: HashSet::new(),
            message_nonce: 0,
        })
    }

    fn dialect(&self) -> Option<NftDialect> {
        self.nft.map(|n| n.dialect)
    }

    /// Applies a signed extrinsic. A failed extrinsic leaves no trace except its `system.ExtrinsicFailed` event.
    pub fn apply_extrinsic(&mut self, ctx: &mut Context, signer: AccountId, call: &Call) -> Vec<Event> {
        let snapshot = self.clone();
        let outbox_len = ctx.outbox.len();
        match self.dispatch(ctx, Origin::Signed(signer), call) {
            Ok(mut events) => {
                events.push(ChainEvent::ExtrinsicSuccess.encode());
                events
            }
            Err(error) => {
                debug!(ledger = %self.name, %call, %error, "extrinsic failed");
                *self = snapshot;
                ctx.outbox.truncate(outbox_len);
                vec![ChainEvent::ExtrinsicFailed(error).encode()]
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut Context, origin: Origin, call: &Call) -> DispatchResult {
        trace!(ledger = %self.name, %call, ?origin, "dispatch");
        match (call.section.as_str(), call.method.as_str()) {
            ("sudo", "sudo") => self.sudo(ctx, origin, call),
            ("proxy", "proxy") => self.proxy(ctx, origin, call),
            ("balances", "transferKeepAlive") => {
                let from = origin.signed()?;
                let to: AccountId = arg(call, 0)?;
                let Amount(amount) = arg(call, 1)?;
                self.transfer_balance(from, to, amount)
            }
            ("hrmp", "forceOpenHrmpChannel") if self.para_id.is_none() => {
                origin.ensure_root()?;
                let sender: u32 = arg(call, 0)?;
                let recipient: u32 = arg(call, 1)?;
                if sender == recipient {
                    return Err(module_error("hrmp", "OpenHrmpChannelToSelf"));
                }
                if !ctx.router.open_channel(sender, recipient) {
                    return Err(module_error("hrmp", "OpenHrmpChannelAlreadyExists"));
                }
                Ok(vec![ChainEvent::HrmpChannelForceOpened { sender, recipient }.encode()])
            }
            ("xTokens", "transferMultiassetWithFee") if self.para_id.is_some() => {
                self.transfer_multiasset_with_fee(ctx, origin, call)
            }
            _ => match self.dialect() {
                Some(NftDialect::ForeignAssets) => self.dispatch_unique(origin, call),
                Some(NftDialect::Xnft) => self.dispatch_orml(origin, call),
                None => Err(unknown_call(call)),
            },
        }
    }

    fn sudo(&mut self, ctx: &mut Context, origin: Origin, call: &Call) -> DispatchResult {
        if origin.signed()? != self.sudo_key {
            return Err(module_error("sudo", "RequireSudo"));
        }
        let inner: Call = arg(call, 0)?;
        let snapshot = self.clone();
        let outbox_len = ctx.outbox.len();
        // The outcome of the root call is reported by `sudo.Sudid`. The wrapper itself succeeds either way.
        let result = match self.dispatch(ctx, Origin::Root, &inner) {
            Ok(events) => return Ok([events, vec![ChainEvent::Sudid(Ok(())).encode()]].concat()),
            Err(error) => error,
        };
        *self = snapshot;
        ctx.outbox.truncate(outbox_len);
        Ok(vec![ChainEvent::Sudid(Err(result)).encode()])
    }

    fn proxy(&mut self, ctx: &mut Context, origin: Origin, call: &Call) -> DispatchResult {
        let delegate = origin.signed()?;
        let real: AccountId = arg(call, 0)?;
        let inner: Call = arg(call, 2)?;
        if !self.proxies.contains(&(delegate, real)) {
            return Err(module_error("proxy", "NotProxy"));
        }
        self.dispatch(ctx, Origin::Signed(real), &inner)
    }

    fn dispatch_unique(&mut self, origin: Origin, call: &Call) -> DispatchResult {
        match (call.section.as_str(), call.method.as_str()) {
            ("unique", "createCollectionEx") => {
                let owner = origin.signed()?;
                let collection_id = self.create_collection(Collection::new(owner, Mode::Nft, None));
                Ok(vec![ChainEvent::CollectionCreated { collection_id, owner }.encode()])
            }
            ("unique", "createItem") => {
                let sender = origin.signed()?;
                let collection_id: u32 = arg(call, 0)?;
                let CrossAccountId::Substrate(owner) = arg(call, 1)?;
                let collection = self.collection(collection_id, "common", "CollectionNotFound")?;
                if collection.owner != sender {
                    return Err(module_error("common", "NoPermission"));
                }
                if collection.mode != Mode::Nft {
                    return Err(module_error("common", "UnsupportedOperation"));
                }
                let token_id = self.mint(collection_id, owner);
                Ok(vec![self.mint_event(collection_id, token_id, sender, owner)])
            }
            ("unique", "transfer") => {
                let sender = origin.signed()?;
                let CrossAccountId::Substrate(to) = arg(call, 0)?;
                let collection_id: u32 = arg(call, 1)?;
                let token_id: u32 = arg(call, 2)?;
                self.collection(collection_id, "common", "CollectionNotFound")?;
                match self.owner_of(collection_id, token_id) {
                    None => Err(module_error("common", "TokenNotFound")),
                    Some(owner) if owner != sender => Err(module_error("common", "NoPermission")),
                    Some(_) => Ok(vec![self.move_token(collection_id, token_id, to)]),
                }
            }
            ("foreignAssets", "forceRegisterForeignAsset") => {
                origin.ensure_root()?;
                let asset_id = arg::<Versioned<AssetId>>(call, 0)?.into_inner();
                let name: Vec<u16> = arg(call, 1)?;
                let token_prefix: String = arg(call, 2)?;
                let mode: Value = arg(call, 3)?;
                if self.foreign_assets.contains_key(&asset_id) {
                    return Err(module_error("foreignAssets", "AssetAlreadyRegistered"));
                }
                let mode = match mode.get("Fungible").and_then(Value::as_u64) {
                    Some(decimals) => Mode::Fungible(decimals as u8),
                    None => Mode::Nft,
                };
                let owner = pallet(FOREIGN_ASSETS_PALLET_ID)?;
                let collection_id =
                    self.create_collection(Collection::new(owner, mode, Some(asset_id.clone())));
                self.foreign_assets.insert(asset_id.clone(), collection_id);
                if let Mode::Fungible(decimals) = mode {
                    self.currencies.insert(
                        asset_id.clone(),
                        AssetMetadata {
                            name: String::from_utf16_lossy(&name),
                            symbol: token_prefix,
                            decimals,
                            minimal_balance: 0,
                        },
                    );
                }
                Ok(vec![
                    ChainEvent::CollectionCreated { collection_id, owner }.encode(),
                    ChainEvent::ForeignAssetRegistered {
                        asset_id,
                        collection_id,
                    }
                    .encode(),
                ])
            }
            _ => Err(unknown_call(call)),
        }
    }

    fn dispatch_orml(&mut self, origin: Origin, call: &Call) -> DispatchResult {
        match (call.section.as_str(), call.method.as_str()) {
            ("nft", "createClass") => {
                let creator = origin.signed()?;
                let class_id = self.next_collection_id;
                // A class is owned by its own account, which the creator controls through a proxy.
                let class_account = pallet_sub_account(NFT_CLASS_PALLET_ID, class_id).map_err(other)?;
                self.create_collection(Collection::new(class_account, Mode::Nft, None));
                self.proxies.insert((creator, class_account));
                Ok(vec![
                    ChainEvent::CreatedClass {
                        owner: class_account,
                        class_id,
                    }
                    .encode(),
                ])
            }
            ("nft", "mint") => {
                let sender = origin.signed()?;
                let to: AccountId = arg(call, 0)?;
                let class_id: u32 = arg(call, 1)?;
                let quantity: u32 = arg(call, 4)?;
                let class = self.collection(class_id, "nft", "ClassIdNotFound")?;
                if class.owner != sender {
                    return Err(module_error("nft", "NoPermission"));
                }
                if quantity == 0 {
                    return Err(module_error("nft", "InvalidQuantity"));
                }
                // Each token reserves a deposit from the class account.
                let deposit = 10u128
                    .checked_pow(self.decimals.into())
                    .and_then(|unit| (unit / 10).checked_mul(quantity.into()))
                    .ok_or_else(|| module_error("nft", "NumOverflow"))?;
                self.withdraw(sender, deposit)?;
                for _ in 0..quantity {
                    self.mint(class_id, to);
                }
                Ok(vec![
                    ChainEvent::MintedToken {
                        from: sender,
                        to,
                        class_id,
                        quantity,
                    }
                    .encode(),
                ])
            }
            ("nft", "transfer") => {
                let sender = origin.signed()?;
                let to: AccountId = arg(call, 0)?;
                let (class_id, token_id): (u32, u32) = arg(call, 1)?;
                self.collection(class_id, "nft", "ClassIdNotFound")?;
                match self.owner_of(class_id, token_id) {
                    None => Err(module_error("nft", "TokenIdNotFound")),
                    Some(owner) if owner != sender => Err(module_error("nft", "NoPermission")),
                    Some(_) => Ok(vec![self.move_token(class_id, token_id, to)]),
                }
            }
            ("xnft", "registerAsset") => {
                origin.ensure_root()?;
                let asset_id = arg::<Versioned<AssetId>>(call, 0)?.into_inner();
                if self.foreign_assets.contains_key(&asset_id) {
                    return Err(module_error("xnft", "AssetAlreadyRegistered"));
                }
                let owner = pallet(XNFT_PALLET_ID)?;
                let class_id =
                    self.create_collection(Collection::new(owner, Mode::Nft, Some(asset_id.clone())));
                self.foreign_assets.insert(asset_id.clone(), class_id);
                Ok(vec![ChainEvent::XnftAssetRegistered { asset_id, class_id }.encode()])
            }
            ("assetRegistry", "registerForeignAsset") => {
                origin.ensure_root()?;
                let location = arg::<Versioned<Location>>(call, 0)?.into_inner();
                let metadata: AssetMetadata = arg(call, 1)?;
                let asset_id = AssetId::Concrete(location.clone());
                if self.currencies.contains_key(&asset_id) {
                    return Err(module_error("assetRegistry", "MultiLocationExisted"));
                }
                let symbol = metadata.symbol.clone();
                self.currencies.insert(asset_id, metadata);
                Ok(vec![ChainEvent::AssetRegistryForeignAssetRegistered { location, symbol }.encode()])
            }
            _ => Err(unknown_call(call)),
        }
    }

    fn transfer_multiasset_with_fee(&mut self, ctx: &mut Context, origin: Origin, call: &Call) -> DispatchResult {
        let sender = origin.signed()?;
        let asset = arg::<Versioned<MultiAsset>>(call, 0)?.into_inner();
        let fee = arg::<Versioned<MultiAsset>>(call, 1)?.into_inner();
        let dest = arg::<Versioned<Location>>(call, 2)?.into_inner();
        let xtokens = |method| module_error("xTokens", method);

        let self_id = self.para_id.ok_or_else(|| xtokens("NotCrossChainTransfer"))?;
        let (Some(destination), Some(beneficiary), 2) = (dest.parachain_id(), dest.account_id(), dest.interior.len())
        else {
            return Err(xtokens("NotSupportedMultiLocation"));
        };
        if destination == self_id {
            return Err(xtokens("NotCrossChainTransfer"));
        }
        if !ctx.router.channel_exists(self_id, destination) {
            return Err(xtokens("SendFailure"));
        }
        let Fungibility::Fungible(fee_amount) = fee.fun else {
            return Err(xtokens("FeeNotEnough"));
        };
        if fee_amount == 0 {
            return Err(xtokens("FeeNotEnough"));
        }
        let (AssetId::Concrete(location), Fungibility::NonFungible(instance)) = (&asset.id, asset.fun) else {
            return Err(xtokens("AssetHasNoReserve"));
        };
        let Some(reserve) = location.parachain_id() else {
            return Err(xtokens("AssetHasNoReserve"));
        };

        // Anything that goes wrong while executing the transfer locally is an execution failure.
        let failed = |_| xtokens("XcmExecutionFailed");
        let mut events = Vec::new();
        let instruction = if reserve == self_id {
            let custodian = sovereign_account(Relationship::Sibling, destination);
            events.push(
                self.lock_native_token(location, instance, sender, custodian)
                    .map_err(failed)?,
            );
            Instruction::ReserveAssetDeposited
        } else if reserve == destination {
            events.push(
                self.withdraw_derivative(&asset.id, instance, sender)
                    .map_err(failed)?,
            );
            Instruction::WithdrawAsset
        } else {
            return Err(xtokens("AssetHasNoReserve"));
        };
        events.extend(
            self.pay_fee(&fee.id, fee_amount, sender, destination)
                .map_err(|_| xtokens("XcmExecutionFailed"))?,
        );

        let message = Message::new(self_id, instruction, asset, fee, beneficiary, self.message_nonce);
        self.message_nonce += 1;
        events.push(
            ChainEvent::XcmpMessageSent {
                message_hash: message.hash,
            }
            .encode(),
        );
        ctx.outbox.push((destination, message));
        Ok(events)
    }

    /// Moves a native token into the custody of `custodian`, refusing derivatives.
    fn lock_native_token(
        &mut self,
        location: &Location,
        instance: AssetInstance,
        sender: AccountId,
        custodian: AccountId,
    ) -> Result<Event, &'static str> {
        let collection_id = self.local_collection(location).ok_or(ASSET_NOT_FOUND)?;
        let collection = self.collections.get(&collection_id).ok_or(ASSET_NOT_FOUND)?;
        if collection.reserve.is_some() {
            // This ledger is not the reserve of the collection's tokens.
            return Err(UNTRUSTED_RESERVE_LOCATION);
        }
        let token_id = token_id(instance).ok_or(ASSET_NOT_FOUND)?;
        if self.owner_of(collection_id, token_id) != Some(sender) {
            return Err(FAILED_TO_TRANSACT_ASSET);
        }
        Ok(self.move_token(collection_id, token_id, custodian))
    }

    /// Takes a derivative out of circulation ahead of its reserve token being released.
    fn withdraw_derivative(
        &mut self,
        asset_id: &AssetId,
        instance: AssetInstance,
        sender: AccountId,
    ) -> Result<Event, &'static str> {
        let collection_id = *self.foreign_assets.get(asset_id).ok_or(ASSET_NOT_FOUND)?;
        let Some(DerivativeStatus::Active(token_id)) = self.derivatives.get(&(collection_id, instance)).copied()
        else {
            return Err(ASSET_NOT_FOUND);
        };
        if self.owner_of(collection_id, token_id) != Some(sender) {
            return Err(FAILED_TO_TRANSACT_ASSET);
        }
        match self.dialect() {
            Some(NftDialect::Xnft) => {
                let stash = pallet(XNFT_PALLET_ID).map_err(|_| FAILED_TO_TRANSACT_ASSET)?;
                self.derivatives
                    .insert((collection_id, instance), DerivativeStatus::Stashed(token_id));
                Ok(self.move_token(collection_id, token_id, stash))
            }
            _ => {
                self.derivatives.remove(&(collection_id, instance));
                if let Some(collection) = self.collections.get_mut(&collection_id) {
                    collection.tokens.remove(&token_id);
                }
                Ok(ChainEvent::ItemDestroyed {
                    collection_id,
                    token_id,
                    owner: sender,
                }
                .encode())
            }
        }
    }

    /// Pays for execution on `destination`. The native currency is held for the destination by its sovereign account.
    /// A foreign currency is burned, since its reserve holds it.
    fn pay_fee(
        &mut self,
        fee_id: &AssetId,
        amount: u128,
        sender: AccountId,
        destination: u32,
    ) -> Result<Vec<Event>, DispatchError> {
        if *fee_id == self.native {
            let custodian = sovereign_account(Relationship::Sibling, destination);
            return self.transfer_balance(sender, custodian, amount);
        }
        if !self.currencies.contains_key(fee_id) {
            return Err(module_error("xTokens", "AssetHasNoReserve"));
        }
        let balance = self
            .foreign_balances
            .entry((fee_id.clone(), sender))
            .or_default();
        *balance = balance
            .checked_sub(amount)
            .ok_or_else(|| module_error("balances", "InsufficientBalance"))?;
        Ok(vec![])
    }

    /// Executes an inbound message. A failed message leaves no trace except its `xcmpQueue.Fail` event.
    pub fn receive(&mut self, message: &Message) -> Vec<Event> {
        let snapshot = self.clone();
        match self.execute_message(message) {
            Ok(mut events) => {
                debug!(ledger = %self.name, hash = %message.hash, "message executed");
                events.push(
                    ChainEvent::XcmpSuccess {
                        message_hash: message.hash,
                    }
                    .encode(),
                );
                events
            }
            Err(error) => {
                debug!(ledger = %self.name, hash = %message.hash, error, "message failed");
                *self = snapshot;
                vec![
                    ChainEvent::XcmpFail {
                        message_hash: message.hash,
                        error: error.to_owned(),
                    }
                    .encode(),
                ]
            }
        }
    }

    fn execute_message(&mut self, message: &Message) -> Result<Vec<Event>, &'static str> {
        let self_id = self.para_id.ok_or(UNTRUSTED_RESERVE_LOCATION)?;
        let Fungibility::Fungible(fee) = message.fee.fun else {
            return Err(ASSET_NOT_FOUND);
        };
        let refund = fee - fee / EXECUTION_COST_DIVISOR;

        let mut events = Vec::new();
        if message.fee.id == self.native {
            let custodian = sovereign_account(Relationship::Sibling, message.origin);
            self.withdraw(custodian, fee).map_err(|_| NOT_HOLDING_FEES)?;
            self.deposit(message.beneficiary, refund);
        } else {
            if !self.currencies.contains_key(&message.fee.id) {
                return Err(ASSET_NOT_FOUND);
            }
            *self
                .foreign_balances
                .entry((message.fee.id.clone(), message.beneficiary))
                .or_default() += refund;
        }

        let (AssetId::Concrete(location), Fungibility::NonFungible(instance)) = (&message.asset.id, message.asset.fun)
        else {
            return Err(ASSET_NOT_FOUND);
        };
        match message.instruction {
            Instruction::ReserveAssetDeposited => {
                if location.parachain_id() != Some(message.origin) {
                    return Err(UNTRUSTED_RESERVE_LOCATION);
                }
                let collection_id = *self
                    .foreign_assets
                    .get(&message.asset.id)
                    .ok_or(ASSET_NOT_FOUND)?;
                events.push(self.deposit_derivative(collection_id, instance, message.beneficiary)?);
            }
            Instruction::WithdrawAsset => {
                if location.parachain_id() != Some(self_id) {
                    return Err(UNTRUSTED_RESERVE_LOCATION);
                }
                let collection_id = self.local_collection(location).ok_or(ASSET_NOT_FOUND)?;
                let token_id = token_id(instance).ok_or(ASSET_NOT_FOUND)?;
                // The reserve only releases what the sender's sovereign account holds.
                let custodian = sovereign_account(Relationship::Sibling, message.origin);
                if self.owner_of(collection_id, token_id) != Some(custodian) {
                    return Err(FAILED_TO_TRANSACT_ASSET);
                }
                events.push(self.move_token(collection_id, token_id, message.beneficiary));
            }
        }
        Ok(events)
    }

    fn deposit_derivative(
        &mut self,
        collection_id: u32,
        instance: AssetInstance,
        beneficiary: AccountId,
    ) -> Result<Event, &'static str> {
        let collection = self.collections.get(&collection_id).ok_or(ASSET_NOT_FOUND)?;
        if collection.mode != Mode::Nft {
            return Err(FAILED_TO_TRANSACT_ASSET);
        }
        let owner = collection.owner;
        match self.derivatives.get(&(collection_id, instance)).copied() {
            Some(DerivativeStatus::Active(_)) => Err(FAILED_TO_TRANSACT_ASSET),
            Some(DerivativeStatus::Stashed(token_id)) => {
                self.derivatives
                    .insert((collection_id, instance), DerivativeStatus::Active(token_id));
                Ok(self.move_token(collection_id, token_id, beneficiary))
            }
            Some(DerivativeStatus::NotExists) | None => {
                let token_id = self.mint(collection_id, beneficiary);
                self.derivatives
                    .insert((collection_id, instance), DerivativeStatus::Active(token_id));
                Ok(self.mint_event(collection_id, token_id, owner, beneficiary))
            }
        }
    }

    fn create_collection(&mut self, collection: Collection) -> u32 {
        let id = self.next_collection_id;
        self.next_collection_id += 1;
        self.collections.insert(id, collection);
        id
    }

    fn collection(&self, id: u32, section: &str, not_found: &str) -> Result<&Collection, DispatchError> {
        self.collections
            .get(&id)
            .ok_or_else(|| module_error(section, not_found))
    }

    fn local_collection(&self, location: &Location) -> Option<u32> {
        let interior = location.parachain_interior()?;
        let index = match (self.nft?.pallet_instance, interior) {
            (None, [Junction::GeneralIndex(index)]) => *index,
            (Some(expected), [Junction::PalletInstance(pallet), Junction::GeneralIndex(index)])
                if expected == *pallet =>
            {
                *index
            }
            _ => return None,
        };
        index.try_into().ok()
    }

    fn owner_of(&self, collection_id: u32, token_id: u32) -> Option<AccountId> {
        self.collections.get(&collection_id)?.tokens.get(&token_id).copied()
    }

    fn mint(&mut self, collection_id: u32, owner: AccountId) -> u32 {
        let numbered_from_one = self.dialect() == Some(NftDialect::ForeignAssets);
        let Some(collection) = self.collections.get_mut(&collection_id) else {
            return 0;
        };
        // Unique numbers tokens from 1, ORML from 0.
        if collection.next_token_id == 0 && numbered_from_one {
            collection.next_token_id = 1;
        }
        let token_id = collection.next_token_id;
        collection.next_token_id += 1;
        collection.tokens.insert(token_id, owner);
        token_id
    }

    fn mint_event(&self, collection_id: u32, token_id: u32, minter: AccountId, owner: AccountId) -> Event {
        match self.dialect() {
            Some(NftDialect::Xnft) => ChainEvent::MintedToken {
                from: minter,
                to: owner,
                class_id: collection_id,
                quantity: 1,
            },
            _ => ChainEvent::ItemCreated {
                collection_id,
                token_id,
                owner,
            },
        }
        .encode()
    }

    fn move_token(&mut self, collection_id: u32, token_id: u32, to: AccountId) -> Event {
        let from = self
            .collections
            .get_mut(&collection_id)
            .and_then(|c| c.tokens.insert(token_id, to))
            .unwrap_or_default();
        match self.dialect() {
            Some(NftDialect::Xnft) => ChainEvent::TransferredToken {
                from,
                to,
                class_id: collection_id,
                token_id,
            },
            _ => ChainEvent::CommonTransfer {
                collection_id,
                token_id,
                from,
                to,
            },
        }
        .encode()
    }

    fn balance(&self, account: AccountId) -> u128 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn withdraw(&mut self, account: AccountId, amount: u128) -> Result<(), DispatchError> {
        let balance = self
            .balance(account)
            .checked_sub(amount)
            .ok_or_else(|| module_error("balances", "InsufficientBalance"))?;
        self.balances.insert(account, balance);
        Ok(())
    }

    fn deposit(&mut self, account: AccountId, amount: u128) {
        *self.balances.entry(account).or_default() += amount;
    }

    fn transfer_balance(&mut self, from: AccountId, to: AccountId, amount: u128) -> DispatchResult {
        self.withdraw(from, amount)?;
        self.deposit(to, amount);
        Ok(vec![ChainEvent::BalancesTransfer { from, to, amount }.encode()])
    }

    /// Reads a storage item. Absent values are `null`.
    pub fn query(&self, router: &Router, query: &StorageQuery) -> anyhow::Result<Value> {
        let dialect = self.dialect();
        let value = match (query.section.as_str(), query.method.as_str()) {
            ("system", "account") => {
                let account: AccountId = query_arg(query, 0)?;
                json!({ "free": self.balance(account).to_string() })
            }
            ("tokens", "accounts") => {
                let account: AccountId = query_arg(query, 0)?;
                let currency: AssetId = query_arg(query, 1)?;
                let free = self
                    .foreign_balances
                    .get(&(currency, account))
                    .copied()
                    .unwrap_or_default();
                json!({ "free": free.to_string() })
            }
            ("session", "currentIndex") if self.para_id.is_none() => json!(router.session_index()),
            ("hrmp", "hrmpChannels") if self.para_id.is_none() => {
                let id: HrmpChannelId = query_arg(query, 0)?;
                if router.channel_exists(id.sender, id.recipient) {
                    json!({ "maxCapacity": 8, "maxMessageSize": 512 })
                } else {
                    Value::Null
                }
            }
            ("nonfungible", "owned") if dialect == Some(NftDialect::ForeignAssets) => {
                let collection_id: u32 = query_arg(query, 0)?;
                let CrossAccountId::Substrate(account) = query_arg(query, 1)?;
                let token_id: u32 = query_arg(query, 2)?;
                json!(self.owner_of(collection_id, token_id) == Some(account))
            }
            ("nonfungible", "tokenData") if dialect == Some(NftDialect::ForeignAssets) => {
                let owner = self.owner_of(query_arg(query, 0)?, query_arg(query, 1)?);
                owner.map_or(Value::Null, |owner| {
                    json!({ "owner": CrossAccountId::Substrate(owner) })
                })
            }
            ("foreignAssets", "foreignAssetToCollection") if dialect == Some(NftDialect::ForeignAssets) => {
                let asset_id: AssetId = query_arg(query, 0)?;
                json!(self.foreign_assets.get(&asset_id))
            }
            ("foreignAssets", "foreignReserveAssetInstanceToTokenId")
                if dialect == Some(NftDialect::ForeignAssets) =>
            {
                let key: (u32, AssetInstance) = (query_arg(query, 0)?, query_arg(query, 1)?);
                match self.derivatives.get(&key) {
                    Some(DerivativeStatus::Active(token_id)) => json!(token_id),
                    _ => Value::Null,
                }
            }
            ("ormlNFT", "tokens") if dialect == Some(NftDialect::Xnft) => {
                let owner = self.owner_of(query_arg(query, 0)?, query_arg(query, 1)?);
                owner.map_or(Value::Null, |owner| json!({ "owner": owner }))
            }
            ("ormlNFT", "nextTokenId") if dialect == Some(NftDialect::Xnft) => {
                let class_id: u32 = query_arg(query, 0)?;
                json!(self.collections.get(&class_id).map(|c| c.next_token_id))
            }
            ("xnft", "foreignAssetToClass") if dialect == Some(NftDialect::Xnft) => {
                let asset_id: AssetId = query_arg(query, 0)?;
                json!(self.foreign_assets.get(&asset_id))
            }
            ("xnft", "foreignInstanceToDerivativeStatus") if dialect == Some(NftDialect::Xnft) => {
                let key: (u32, AssetInstance) = (query_arg(query, 0)?, query_arg(query, 1)?);
                json!(self.derivatives.get(&key))
            }
            ("assetRegistry", "assetMetadatas") if dialect == Some(NftDialect::Xnft) => {
                let mut metadata: Vec<_> = self.currencies.values().collect();
                metadata.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                json!(metadata)
            }
            _ => return Err(anyhow!("{} has no storage item {query}", self.name)),
        };
        Ok(value)
    }
}

fn token_id(instance: AssetInstance) -> Option<u32> {
    match instance {
        AssetInstance::Index(index) => index.try_into().ok(),
        _ => None,
    }
}

fn pallet(id: &str) -> Result<AccountId, DispatchError> {
    pallet_account(id).map_err(other)
}

fn other(error: anyhow::Error) -> DispatchError {
    DispatchError::Other(error.to_string())
}

fn unknown_call(call: &Call) -> DispatchError {
    DispatchError::Other(format!("unknown call {call}"))
}

fn arg<T: DeserializeOwned>(call: &Call, index: usize) -> Result<T, DispatchError> {
    let value = call
        .args
        .get(index)
        .ok_or_else(|| DispatchError::Other(format!("{call} is missing argument {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| DispatchError::Other(format!("invalid argument {index} of {call}: {e}")))
}

fn query_arg<T: DeserializeOwned>(query: &StorageQuery, index: usize) -> anyhow::Result<T> {
    let value = query
        .args
        .get(index)
        .ok_or_else(|| anyhow!("{query} is missing argument {index}"))?;
    serde_json::from_value(value.clone()).map_err(|e| anyhow!("invalid argument {index} of {query}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{account::Signer, event::EventKind};

    const QUARTZ: u32 = 2095;
    const KARURA: u32 = 2000;

    fn alice() -> AccountId {
        Signer::from_uri("//Alice").account()
    }

    fn bob() -> AccountId {
        Signer::from_uri("//Bob").account()
    }

    fn quartz() -> Runtime {
        let nft = NftConfig {
            dialect: NftDialect::ForeignAssets,
            pallet_instance: None,
        };
        let native = AssetId::Concrete(Location::parachain(QUARTZ));
        Runtime::genesis("Quartz", Some(QUARTZ), Some(nft), native, 18, &[alice(), bob()], 10u128.pow(24)).unwrap()
    }

    fn karura() -> Runtime {
        let nft = NftConfig {
            dialect: NftDialect::Xnft,
            pallet_instance: Some(121),
        };
        let native = AssetId::Concrete(Location::parachain(KARURA));
        let mut runtime =
            Runtime::genesis("Karura", Some(KARURA), Some(nft), native, 12, &[alice(), bob()], 10u128.pow(18)).unwrap();
        // Fees paid in KAR by Quartz are held by Quartz's sovereign account.
        runtime.deposit(sovereign_account(Relationship::Sibling, QUARTZ), 10u128.pow(15));
        runtime
    }

    fn router() -> Router {
        let router = Router::default();
        router.open_channel(QUARTZ, KARURA);
        router.open_channel(KARURA, QUARTZ);
        router
    }

    fn apply(runtime: &mut Runtime, router: &Router, signer: AccountId, call: Call) -> (Vec<Event>, Vec<(u32, Message)>) {
        let mut ctx = Context {
            router,
            outbox: vec![],
        };
        let events = runtime.apply_extrinsic(&mut ctx, signer, &call);
        (events, ctx.outbox)
    }

    fn decode(events: &[Event], kind: EventKind) -> ChainEvent {
        let event = events.iter().find(|e| kind.matches(e)).unwrap();
        ChainEvent::decode(event).unwrap()
    }

    fn send_call(asset: MultiAsset, fee: MultiAsset, destination: u32, beneficiary: AccountId) -> Call {
        Call::new(
            "xTokens",
            "transferMultiassetWithFee",
            vec![
                json!(Versioned::V3(asset)),
                json!(Versioned::V3(fee)),
                json!(Versioned::V3(Location::parachain_account(destination, beneficiary))),
                json!("Unlimited"),
            ],
        )
    }

    #[test]
    fn failed_extrinsics_are_rolled_back() {
        let router = router();
        let mut runtime = quartz();
        let before = runtime.balance(alice());

        let call = Call::new(
            "balances",
            "transferKeepAlive",
            vec![json!(bob()), json!(before.saturating_mul(2).to_string())],
        );
        let (events, _) = apply(&mut runtime, &router, alice(), call);
        assert_eq!(
            decode(&events, EventKind::ExtrinsicFailed),
            ChainEvent::ExtrinsicFailed(module_error("balances", "InsufficientBalance"))
        );
        assert_eq!(runtime.balance(alice()), before);
    }

    #[test]
    fn sudo_reports_the_inner_failure() {
        let router = router();
        let mut runtime = karura();
        let asset_id = AssetId::Concrete(Location::parachain_collection(QUARTZ, None, 1));
        let register = Call::new("xnft", "registerAsset", vec![json!(Versioned::V3(&asset_id))]);

        let (events, _) = apply(&mut runtime, &router, bob(), register.clone().sudo());
        assert_eq!(
            decode(&events, EventKind::ExtrinsicFailed),
            ChainEvent::ExtrinsicFailed(module_error("sudo", "RequireSudo"))
        );

        let (events, _) = apply(&mut runtime, &router, alice(), register.clone().sudo());
        assert_eq!(decode(&events, EventKind::Sudid), ChainEvent::Sudid(Ok(())));
        assert!(EventKind::XnftAssetRegistered.matches(&events[0]));

        let (events, _) = apply(&mut runtime, &router, alice(), register.sudo());
        assert_eq!(
            decode(&events, EventKind::Sudid),
            ChainEvent::Sudid(Err(module_error("xnft", "AssetAlreadyRegistered")))
        );
        assert!(EventKind::ExtrinsicSuccess.matches(events.last().unwrap()));
    }

    #[test]
    fn module_errors_resolve_by_name() {
        let DispatchError::Module(error) = module_error("xTokens", "XcmExecutionFailed") else {
            panic!("xTokens errors are module errors");
        };
        assert_eq!(error, ModuleError::new(54, 2));
        assert_eq!(
            lookup_module_error(&error),
            Some(("xTokens".to_owned(), "XcmExecutionFailed".to_owned()))
        );
        assert_eq!(lookup_module_error(&ModuleError::new(54, 40)), None);
        assert_eq!(lookup_module_error(&ModuleError::new(1, 0)), None);
    }

    #[test]
    fn tokens_travel_to_a_derivative_and_back() {
        let router = router();
        let mut quartz = quartz();
        let mut karura = karura();

        let (events, _) = apply(&mut quartz, &router, alice(), Call::new("unique", "createCollectionEx", vec![]));
        let ChainEvent::CollectionCreated { collection_id, .. } = decode(&events, EventKind::CollectionCreated) else {
            unreachable!()
        };
        let mint = Call::new(
            "unique",
            "createItem",
            vec![json!(collection_id), json!(CrossAccountId::Substrate(alice())), json!("NFT")],
        );
        let (events, _) = apply(&mut quartz, &router, alice(), mint);
        let ChainEvent::ItemCreated { token_id, .. } = decode(&events, EventKind::ItemCreated) else {
            unreachable!()
        };
        assert_eq!(token_id, 1);

        let asset_id = AssetId::Concrete(Location::parachain_collection(QUARTZ, None, collection_id as u128));
        let register = Call::new("xnft", "registerAsset", vec![json!(Versioned::V3(&asset_id))]).sudo();
        apply(&mut karura, &router, alice(), register);
        let kar = AssetId::Concrete(Location::parachain(KARURA));
        let qtz = AssetId::Concrete(Location::parachain(QUARTZ));
        let metadata = AssetMetadata {
            name: "QTZ".to_owned(),
            symbol: "QTZ".to_owned(),
            decimals: 18,
            minimal_balance: 1,
        };
        let register_qtz = Call::new(
            "assetRegistry",
            "registerForeignAsset",
            vec![json!(Versioned::V3(Location::parachain(QUARTZ))), json!(metadata)],
        );
        apply(&mut karura, &router, alice(), register_qtz.sudo());

        // Outbound: Quartz is the reserve, so it keeps the token and Karura mints a derivative.
        let nft = MultiAsset::non_fungible(asset_id.clone(), AssetInstance::Index(token_id as u128));
        let fee = MultiAsset::fungible(qtz.clone(), 10u128.pow(18));
        let (events, outbox) = apply(&mut quartz, &router, alice(), send_call(nft.clone(), fee, KARURA, bob()));
        assert!(EventKind::ExtrinsicSuccess.matches(events.last().unwrap()), "{events:?}");
        let custodian = sovereign_account(Relationship::Sibling, KARURA);
        assert_eq!(quartz.owner_of(collection_id, token_id), Some(custodian));
        assert_eq!(quartz.balance(custodian), 10u128.pow(18));

        let [(KARURA, message)] = &outbox[..] else {
            panic!("expected one message for Karura, got {outbox:?}");
        };
        let events = karura.receive(message);
        assert!(EventKind::XcmpSuccess.matches(events.last().unwrap()), "{events:?}");
        let status_key = (0, AssetInstance::Index(token_id as u128));
        assert_eq!(karura.derivatives[&status_key], DerivativeStatus::Active(0));
        assert_eq!(karura.owner_of(0, 0), Some(bob()));
        assert_eq!(
            karura.foreign_balances[&(qtz.clone(), bob())],
            10u128.pow(18) - 10u128.pow(18) / EXECUTION_COST_DIVISOR
        );

        // Back again: the derivative is stashed and the reserve releases the token.
        let fee = MultiAsset::fungible(kar, 10u128.pow(12));
        let (events, outbox) = apply(&mut karura, &router, bob(), send_call(nft, fee, QUARTZ, alice()));
        assert!(EventKind::ExtrinsicSuccess.matches(events.last().unwrap()), "{events:?}");
        assert_eq!(karura.derivatives[&status_key], DerivativeStatus::Stashed(0));
        assert_eq!(karura.owner_of(0, 0), Some(pallet_account(XNFT_PALLET_ID).unwrap()));

        let [(QUARTZ, message)] = &outbox[..] else {
            panic!("expected one message for Quartz, got {outbox:?}");
        };
        // Quartz has not registered KAR, so it cannot take the fee.
        let events = quartz.receive(message);
        assert_eq!(
            decode(&events, EventKind::XcmpFail),
            ChainEvent::XcmpFail {
                message_hash: message.hash,
                error: ASSET_NOT_FOUND.to_owned()
            }
        );
        assert_eq!(quartz.owner_of(collection_id, token_id), Some(custodian));

        quartz.currencies.insert(
            AssetId::Concrete(Location::parachain(KARURA)),
            AssetMetadata {
                name: "KAR".to_owned(),
                symbol: "KAR".to_owned(),
                decimals: 12,
                minimal_balance: 0,
            },
        );
        let events = quartz.receive(message);
        assert!(EventKind::XcmpSuccess.matches(events.last().unwrap()), "{events:?}");
        assert_eq!(quartz.owner_of(collection_id, token_id), Some(alice()));
    }

    #[test]
    fn an_active_derivative_is_not_deposited_twice() {
        let router = router();
        let mut karura = karura();
        let asset_id = AssetId::Concrete(Location::parachain_collection(QUARTZ, None, 1));
        apply(
            &mut karura,
            &router,
            alice(),
            Call::new("xnft", "registerAsset", vec![json!(Versioned::V3(&asset_id))]).sudo(),
        );
        let deposit = |nonce| {
            Message::new(
                QUARTZ,
                Instruction::ReserveAssetDeposited,
                MultiAsset::non_fungible(asset_id.clone(), AssetInstance::Index(7)),
                MultiAsset::fungible(AssetId::Concrete(Location::parachain(KARURA)), 10u128.pow(12)),
                bob(),
                nonce,
            )
        };

        let events = karura.receive(&deposit(0));
        assert!(EventKind::XcmpSuccess.matches(events.last().unwrap()), "{events:?}");
        let status_key = (0, AssetInstance::Index(7));
        assert_eq!(karura.derivatives[&status_key], DerivativeStatus::Active(0));
        let balance = karura.balance(bob());

        let second = deposit(1);
        let events = karura.receive(&second);
        assert_eq!(
            decode(&events, EventKind::XcmpFail),
            ChainEvent::XcmpFail {
                message_hash: second.hash,
                error: FAILED_TO_TRANSACT_ASSET.to_owned()
            }
        );
        assert_eq!(karura.derivatives[&status_key], DerivativeStatus::Active(0));
        assert_eq!(karura.owner_of(0, 0), Some(bob()));
        assert_eq!(karura.owner_of(0, 1), None);
        assert_eq!(karura.balance(bob()), balance);
    }

    #[test]
    fn derivatives_cannot_be_sent_as_if_they_were_native() {
        let router = router();
        let mut karura = karura();
        let asset_id = AssetId::Concrete(Location::parachain_collection(QUARTZ, None, 1));
        apply(
            &mut karura,
            &router,
            alice(),
            Call::new("xnft", "registerAsset", vec![json!(Versioned::V3(&asset_id))]).sudo(),
        );
        karura.derivatives.insert((0, AssetInstance::Index(1)), DerivativeStatus::Active(0));
        karura.mint(0, bob());

        // The derivative's class, posing as a Karura collection.
        let spoofed = AssetId::Concrete(Location::parachain_collection(KARURA, Some(121), 0));
        let nft = MultiAsset::non_fungible(spoofed, AssetInstance::Index(0));
        let fee = MultiAsset::fungible(AssetId::Concrete(Location::parachain(KARURA)), 10u128.pow(12));
        let (events, outbox) = apply(&mut karura, &router, bob(), send_call(nft, fee, QUARTZ, bob()));
        assert_eq!(
            decode(&events, EventKind::ExtrinsicFailed),
            ChainEvent::ExtrinsicFailed(module_error("xTokens", "XcmExecutionFailed"))
        );
        assert!(outbox.is_empty());
        assert_eq!(karura.owner_of(0, 0), Some(bob()));
    }

    #[test]
    fn queries_read_absent_values_as_null() {
        let router = router();
        let runtime = quartz();
        let query = StorageQuery::new(
            "foreignAssets",
            "foreignAssetToCollection",
            vec![json!(AssetId::Concrete(Location::parachain(KARURA)))],
        );
        assert_eq!(runtime.query(&router, &query).unwrap(), Value::Null);
        let query = StorageQuery::new("system", "account", vec![json!(alice())]);
        assert_eq!(
            runtime.query(&router, &query).unwrap(),
            json!({ "free": 10u128.pow(24).to_string() })
        );
        assert!(runtime.query(&router, &StorageQuery::new("ormlNFT", "tokens", vec![])).is_err());
    }
}
