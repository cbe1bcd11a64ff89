//! Sending NFTs from one ledger to another and verifying that custody moved with them.
//!
//! A transfer is only complete once three independent observations agree:
//!
//! 1. The source ledger included the transfer and emitted the outbound message.
//! 2. The destination ledger processed a message with the same hash.
//! 3. Ownership on both ledgers is what the reserve model demands. While a derivative is active, the reserve token is
//!    held by the destination's sovereign account on the reserve ledger. Once the token is back on its reserve ledger,
//!    the derivative is no longer active.

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::{
    account::{AccountId, Signer},
    client::Call,
    crypto::Hash,
    error::{DeliveryFailure, Error, Result},
    event::{ChainEvent, EventKind},
    ledger::Ledger,
    location::{MultiAsset, Versioned},
    registry,
    scan,
    token::Token,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightLimit {
    Unlimited,
    Limited(u64),
}

/// The lifecycle of a [Transfer].
///
/// `Built → Submitted → IncludedOk → MessageSent → DeliveryConfirmed | DeliveryTimedOut | DeliveryRejected`.
/// A transfer the source ledger fails goes from `Submitted` straight to `DeliveryRejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Built,
    Submitted,
    IncludedOk,
    MessageSent,
    DeliveryConfirmed,
    DeliveryTimedOut,
    DeliveryRejected,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::DeliveryConfirmed | TransferState::DeliveryTimedOut | TransferState::DeliveryRejected
        )
    }
}

impl Display for TransferState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// One NFT, sent from `source` to `beneficiary` on `destination`.
///
/// The token is always named by its canonical identity on its reserve ledger, whichever ledger it is sent from.
#[derive(Debug)]
pub struct Transfer {
    source: Ledger,
    token: Token,
    fee: MultiAsset,
    destination: Ledger,
    beneficiary: AccountId,
    weight_limit: WeightLimit,
    state: TransferState,
    message_hash: Option<Hash>,
}

impl Transfer {
    pub fn new(source: &Ledger, token: &Token, fee: MultiAsset, destination: &Ledger, beneficiary: AccountId) -> Self {
        Transfer {
            source: source.clone(),
            token: token.clone(),
            fee,
            destination: destination.clone(),
            beneficiary,
            weight_limit: WeightLimit::Unlimited,
            state: TransferState::Built,
            message_hash: None,
        }
    }

    pub fn with_weight_limit(mut self, weight_limit: WeightLimit) -> Self {
        self.weight_limit = weight_limit;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// The hash of the outbound message, once the source ledger has emitted it.
    pub fn message_hash(&self) -> Option<Hash> {
        self.message_hash
    }

    /// `xTokens.transferMultiassetWithFee(asset, fee, dest, weight_limit)`
    pub fn call(&self) -> Result<Call> {
        let asset = self.token.as_multiasset()?;
        let dest = self.destination.account_location(self.beneficiary)?;
        Ok(Call::new(
            "xTokens",
            "transferMultiassetWithFee",
            vec![
                json!(Versioned::V3(asset)),
                json!(Versioned::V3(&self.fee)),
                json!(Versioned::V3(dest)),
                json!(self.weight_limit),
            ],
        ))
    }

    fn advance(&mut self, state: TransferState) {
        debug!(token = %self.token, from = %self.state, to = %state, "transfer state");
        self.state = state;
    }

    /// Submits the transfer on the source ledger and returns the hash of the message it sends.
    pub async fn submit(&mut self, signer: &Signer) -> Result<Hash> {
        if self.state != TransferState::Built {
            return Err(anyhow::anyhow!("{} has already been submitted ({})", self.token, self.state).into());
        }
        let call = self.call()?;
        self.advance(TransferState::Submitted);

        let result = match self.source.execute(signer, call).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, Error::SubmissionRejected(_)) {
                    self.advance(TransferState::DeliveryRejected);
                }
                return Err(e);
            }
        };
        self.advance(TransferState::IncludedOk);

        let ChainEvent::XcmpMessageSent { message_hash } = result.extract_first(EventKind::XcmpMessageSent)? else {
            return Err(Error::EventNotFound(EventKind::XcmpMessageSent));
        };
        self.message_hash = Some(message_hash);
        self.advance(TransferState::MessageSent);

        info!(
            token = %self.token,
            source = self.source.name(),
            destination = self.destination.name(),
            %message_hash,
            "sent NFT"
        );
        Ok(message_hash)
    }

    /// Waits for the destination ledger to process the message sent by [Transfer::submit].
    pub async fn await_delivery(&mut self) -> Result<()> {
        let Some(message_hash) = self.message_hash else {
            return Err(anyhow::anyhow!("{} has not sent a message yet ({})", self.token, self.state).into());
        };
        let max_blocks = self.destination.correlator().delivery_max_blocks;
        match scan::expect_xcmp_queue_success(&self.destination, message_hash, max_blocks).await {
            Ok(()) => {
                self.advance(TransferState::DeliveryConfirmed);
                Ok(())
            }
            Err(e) => {
                if let Error::BridgeDeliveryFailed { reason, .. } = &e {
                    self.advance(match reason {
                        DeliveryFailure::Rejected(_) => TransferState::DeliveryRejected,
                        DeliveryFailure::TimedOut { .. } => TransferState::DeliveryTimedOut,
                    });
                }
                Err(e)
            }
        }
    }

    /// Checks that custody moved as the reserve model demands, returning the token the beneficiary now holds on the
    /// destination ledger.
    pub async fn verify_custody(&self) -> Result<Token> {
        if self.state != TransferState::DeliveryConfirmed {
            return Err(anyhow::anyhow!("{} has not been delivered ({})", self.token, self.state).into());
        }

        if self.token.ledger.role() == self.destination.role() {
            // Back on the reserve ledger.
            self.token.expect_owner(self.beneficiary).await?;
            let asset_id = self.token.asset_id()?;
            if let Some(collection_id) = registry::derivative_collection(&self.source, &asset_id).await? {
                let status =
                    registry::derivative_status(&self.source, collection_id, self.token.asset_instance()).await?;
                if status.is_active() {
                    return Err(Error::UnexpectedDerivativeStatus {
                        ledger: self.source.name().to_owned(),
                        token: self.token.to_string(),
                        expected: "stashed or burned",
                        actual: status,
                    });
                }
            }
            info!(token = %self.token, owner = self.destination.address(self.beneficiary), "NFT returned to its reserve");
            return Ok(self.token.clone());
        }

        let derivative = registry::derivative_of(&self.destination, &self.token).await?;
        let status = registry::derivative_status(
            &self.destination,
            derivative.collection_id,
            self.token.asset_instance(),
        )
        .await?;
        if !status.is_active() {
            return Err(Error::UnexpectedDerivativeStatus {
                ledger: self.destination.name().to_owned(),
                token: self.token.to_string(),
                expected: "active",
                actual: status,
            });
        }
        derivative.expect_owner(self.beneficiary).await?;

        let reserve = &self.token.ledger;
        let custodian = reserve.sovereign_account_of(&self.destination)?;
        self.token.expect_owner(custodian).await?;

        info!(
            token = %self.token,
            %derivative,
            owner = self.destination.address(self.beneficiary),
            "NFT is backed by its reserve"
        );
        Ok(derivative)
    }
}

/// Sends `token` from `source` to `beneficiary` on `destination`, paying `fee` for its execution there.
///
/// Returns the token the beneficiary holds on `destination` after delivery: the derivative, or the reserve token itself
/// if `destination` is its reserve ledger.
pub async fn transfer(
    source: &Ledger,
    signer: &Signer,
    token: &Token,
    fee: MultiAsset,
    destination: &Ledger,
    beneficiary: AccountId,
) -> Result<Token> {
    let mut transfer = Transfer::new(source, token, fee, destination, beneficiary);
    transfer.submit(signer).await?;
    transfer.await_delivery().await?;
    transfer.verify_custody().await
}
