use anyhow::anyhow;
use futures::StreamExt;
use tracing::*;

use crate::{
    account::Signer,
    client::{Call, LedgerBackend, TxStatus},
    error::{DispatchFailure, DispatchFailures, Error, Result},
    event::{ChainEvent, DispatchError, Event, EventKind},
    ledger::Ledger,
};

/// The events emitted by a successfully included transaction.
#[derive(Debug, Clone)]
pub struct TxResult {
    height: u64,
    events: Vec<Event>,
}

impl TxResult {
    /// The height of the block which included the transaction.
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Every event of `kind`, in emission order. It is an error to ask for an event the transaction did not emit.
    pub fn extract_events(&self, kind: EventKind) -> Result<Vec<&Event>> {
        let events: Vec<_> = self.events.iter().filter(|e| kind.matches(e)).collect();
        if events.is_empty() {
            return Err(Error::EventNotFound(kind));
        }
        Ok(events)
    }

    /// Every event of `kind`, decoded.
    pub fn extract(&self, kind: EventKind) -> Result<Vec<ChainEvent>> {
        self.extract_events(kind)?
            .into_iter()
            .map(|e| ChainEvent::decode_as(kind, e))
            .collect()
    }

    /// The first event of `kind`, decoded.
    pub fn extract_first(&self, kind: EventKind) -> Result<ChainEvent> {
        let event = self.extract_events(kind)?[0];
        ChainEvent::decode_as(kind, event)
    }
}

/// Submits `call` and waits for it to be included in a block.
///
/// Resolves on the first block which includes the transaction, not on broadcast. Fails with
/// [Error::SubmissionRejected] if the transaction's events contain a failure marker. The inclusion subscription is
/// released when this returns.
pub async fn execute(ledger: &Ledger, signer: &Signer, call: Call) -> Result<TxResult> {
    debug!(ledger = ledger.name(), signer = signer.name(), %call, "submitting");
    let mut statuses = ledger.backend().submit(signer, call).await?;

    while let Some(status) = statuses.next().await {
        match status {
            TxStatus::Ready => trace!(ledger = ledger.name(), "ready"),
            TxStatus::InBlock { height, events } => {
                let failures = failures(ledger.backend().as_ref(), &events)?;
                if !failures.is_empty() {
                    let failures = DispatchFailures(failures);
                    debug!(ledger = ledger.name(), height, %failures, "transaction failed");
                    return Err(Error::SubmissionRejected(failures));
                }
                debug!(ledger = ledger.name(), height, "transaction included");
                return Ok(TxResult { height, events });
            }
            TxStatus::Dropped(reason) => {
                return Err(anyhow!("transaction was dropped by {}: {reason}", ledger.name()).into());
            }
        }
    }

    Err(Error::SubscriptionClosed {
        ledger: ledger.name().to_owned(),
        stream: "inclusion",
    })
}

/// Decodes every failure marker in `events`.
fn failures(backend: &dyn LedgerBackend, events: &[Event]) -> Result<Vec<DispatchFailure>> {
    let mut failures = Vec::new();
    for event in events {
        // A root call's own failure is reported by `sudo.Sudid`, separately from the outcome of the wrapper.
        let error = match event.kind() {
            Some(kind @ (EventKind::ExtrinsicFailed | EventKind::Sudid)) => {
                match ChainEvent::decode_as(kind, event)? {
                    ChainEvent::ExtrinsicFailed(error) | ChainEvent::Sudid(Err(error)) => error,
                    _ => continue,
                }
            }
            _ => continue,
        };
        failures.push(resolve(backend, error));
    }
    Ok(failures)
}

fn resolve(backend: &dyn LedgerBackend, error: DispatchError) -> DispatchFailure {
    match error {
        DispatchError::Module(module) => match backend.lookup_module_error(&module) {
            Some((section, method)) => DispatchFailure::Module { section, method },
            None => DispatchFailure::Other(DispatchError::Module(module).to_string()),
        },
        other => DispatchFailure::Other(other.to_string()),
    }
}
