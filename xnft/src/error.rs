use std::fmt::{self, Display, Formatter};

use crate::{
    crypto::Hash,
    event::EventKind,
    location::{AssetId, AssetInstance, LocationError},
    registry::DerivativeStatus,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error from verifying the bridge protocol.
///
/// None of these are retried by the harness. Waiting is only ever expressed as the bounded block polling of
/// [crate::scan], never as re-submission, which could mint or spend twice.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The local ledger included the transaction and failed it.
    #[error("{0}")]
    SubmissionRejected(DispatchFailures),
    /// A caller asked a transaction result for an event the transaction did not emit.
    #[error("the expected event \"{0}\" is not found")]
    EventNotFound(EventKind),
    /// A bounded wait observed its whole window of new blocks without a match.
    #[error("no events matching the criteria: \"{criteria}\" within {max_blocks} blocks on {ledger}")]
    Timeout {
        ledger: String,
        criteria: String,
        max_blocks: usize,
    },
    #[error("no derivative collection is found for {asset_id} on {ledger}")]
    NoDerivativeCollection { ledger: String, asset_id: AssetId },
    #[error("no derivative token is found for {asset_id}/{instance} on {ledger}")]
    NoDerivativeToken {
        ledger: String,
        asset_id: AssetId,
        instance: AssetInstance,
    },
    #[error("message {message_hash} was not delivered to {destination}: {reason}")]
    BridgeDeliveryFailed {
        destination: String,
        message_hash: Hash,
        reason: DeliveryFailure,
    },
    #[error("{token} should be owned by {expected}")]
    CustodyViolation { token: String, expected: String },
    #[error("the derivative of {token} on {ledger} should be {expected}, but it is {actual:?}")]
    UnexpectedDerivativeStatus {
        ledger: String,
        token: String,
        expected: &'static str,
        actual: DerivativeStatus,
    },
    #[error("malformed {kind} event: {reason}")]
    Decode { kind: EventKind, reason: String },
    #[error("the {stream} stream of {ledger} ended before the wait resolved")]
    SubscriptionClosed {
        ledger: String,
        stream: &'static str,
    },
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

/// Why a ledger failed a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    /// A module-level error, resolved against the ledger's metadata.
    Module { section: String, method: String },
    /// Any other failure, in the ledger's own words.
    Other(String),
}

impl Display for DispatchFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DispatchFailure::Module { section, method } => write!(f, "{section}.{method}"),
            DispatchFailure::Other(reason) => f.write_str(reason),
        }
    }
}

/// Every failure marker found in the block which included a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailures(pub Vec<DispatchFailure>);

impl DispatchFailures {
    /// Whether any of the failures is the module error `section.method`.
    pub fn contains(&self, section: &str, method: &str) -> bool {
        self.0.iter().any(|failure| {
            matches!(failure, DispatchFailure::Module { section: s, method: m } if s == section && m == method)
        })
    }
}

impl Display for DispatchFailures {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&itertools::join(&self.0, "; "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The destination processed the message and failed it.
    Rejected(String),
    /// The destination never reported the message within the allowed window.
    TimedOut { max_blocks: usize },
}

impl Display for DeliveryFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Rejected(reason) => write!(f, "rejected ({reason})"),
            DeliveryFailure::TimedOut { max_blocks } => {
                write!(f, "not observed within {max_blocks} blocks")
            }
        }
    }
}

impl Error {
    /// Whether this is a submission rejected with the module error `section.method`.
    pub fn is_module_error(&self, section: &str, method: &str) -> bool {
        matches!(self, Error::SubmissionRejected(failures) if failures.contains(section, method))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
