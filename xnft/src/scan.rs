//! Correlating events across ledgers by polling each ledger's new blocks.
//!
//! There is no notification from one ledger to another. To observe that a message sent by ledger A has been processed
//! by ledger B, we watch B's blocks as they are produced, up to a bounded number of them.

use futures::StreamExt;
use tracing::*;

use crate::{
    crypto::Hash,
    error::{DeliveryFailure, Error, Result},
    event::{ChainEvent, Event, EventKind},
    ledger::Ledger,
};

/// Waits for a block on `ledger` whose events `filter_map` maps to a non-empty result.
///
/// Every new height is examined once. Notifications for a height which is not above the last one seen are ignored.
/// Fails with [Error::Timeout] once `max_blocks` distinct heights have been examined without a match. The block
/// subscription is released when this returns, whatever the outcome.
pub async fn search_events<T, F>(
    ledger: &Ledger,
    criteria: &str,
    max_blocks: usize,
    mut filter_map: F,
) -> Result<Vec<T>>
where
    F: FnMut(&[Event]) -> Vec<T>,
{
    let timeout = || Error::Timeout {
        ledger: ledger.name().to_owned(),
        criteria: criteria.to_owned(),
        max_blocks,
    };

    info!(ledger = ledger.name(), criteria, "searching for events");
    if max_blocks == 0 {
        return Err(timeout());
    }

    let mut blocks = ledger.backend().subscribe_new_blocks().await?;
    let mut last_height = None;
    let mut attempt = 0;

    while let Some(block) = blocks.next().await {
        if last_height.is_some_and(|last| block.height <= last) {
            trace!(height = block.height, "ignoring a block we have already seen");
            continue;
        }
        last_height = Some(block.height);
        attempt += 1;
        debug!(
            ledger = ledger.name(),
            attempt,
            max_blocks,
            height = block.height,
            "examining block"
        );

        let found = filter_map(&block.events);
        if !found.is_empty() {
            info!(
                ledger = ledger.name(),
                height = block.height,
                count = found.len(),
                "found matching events"
            );
            return Ok(found);
        }
        if attempt >= max_blocks {
            return Err(timeout());
        }
    }

    Err(Error::SubscriptionClosed {
        ledger: ledger.name().to_owned(),
        stream: "new blocks",
    })
}

/// Waits for any event of `kind`.
pub async fn wait_for_events(ledger: &Ledger, kind: EventKind, max_blocks: usize) -> Result<Vec<Event>> {
    search_events(ledger, &format!("\"{kind}\" event"), max_blocks, |events| {
        events
            .iter()
            .filter(|e| kind.matches(e))
            .cloned()
            .collect()
    })
    .await
}

enum Outcome {
    Success,
    Fail(String),
}

/// Waits for `ledger` to process the message with the given hash.
///
/// Fails with [Error::BridgeDeliveryFailed] if `ledger` rejects the message or does not process it within
/// `max_blocks`.
pub async fn expect_xcmp_queue_success(ledger: &Ledger, message_hash: Hash, max_blocks: usize) -> Result<()> {
    let criteria = format!("xcmpQueue.Success or xcmpQueue.Fail with messageHash == {message_hash}");
    let outcomes = search_events(ledger, &criteria, max_blocks, |events| {
        events
            .iter()
            .filter_map(|event| match decode_xcmp_outcome(event) {
                Ok(Some((hash, outcome))) if hash == message_hash => Some(outcome),
                Ok(_) => None,
                Err(e) => {
                    warn!(%event, %e, "skipping a malformed event");
                    None
                }
            })
            .collect()
    })
    .await;

    let failed = |reason| Error::BridgeDeliveryFailed {
        destination: ledger.name().to_owned(),
        message_hash,
        reason,
    };
    match outcomes {
        Ok(outcomes) => match outcomes.into_iter().next() {
            Some(Outcome::Fail(error)) => {
                warn!(%message_hash, error, "message was rejected");
                Err(failed(DeliveryFailure::Rejected(error)))
            }
            _ => {
                info!(%message_hash, ledger = ledger.name(), "message was processed");
                Ok(())
            }
        },
        Err(Error::Timeout { max_blocks, .. }) => Err(failed(DeliveryFailure::TimedOut { max_blocks })),
        Err(e) => Err(e),
    }
}

fn decode_xcmp_outcome(event: &Event) -> Result<Option<(Hash, Outcome)>> {
    let Some(kind @ (EventKind::XcmpSuccess | EventKind::XcmpFail)) = event.kind() else {
        return Ok(None);
    };
    let outcome = match ChainEvent::decode_as(kind, event)? {
        ChainEvent::XcmpSuccess { message_hash } => (message_hash, Outcome::Success),
        ChainEvent::XcmpFail {
            message_hash,
            error,
        } => (message_hash, Outcome::Fail(error)),
        _ => return Ok(None),
    };
    Ok(Some(outcome))
}
