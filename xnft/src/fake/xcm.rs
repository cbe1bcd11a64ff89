//! Message passing between simulated ledgers.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU32, Ordering},
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::*;

use crate::{account::AccountId, crypto::Hash, location::MultiAsset};

/// What the destination of a message does with the asset it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Instruction {
    /// The sender is the asset's reserve and holds it on the destination's behalf. Mint or reactivate a derivative.
    ReserveAssetDeposited,
    /// The destination is the asset's reserve. Release it from the sender's sovereign account.
    WithdrawAsset,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub hash: Hash,
    pub origin: u32,
    pub instruction: Instruction,
    pub asset: MultiAsset,
    pub fee: MultiAsset,
    pub beneficiary: AccountId,
}

impl Message {
    /// Builds a message, hashing its contents together with a nonce which is unique for each sender.
    pub fn new(
        origin: u32,
        instruction: Instruction,
        asset: MultiAsset,
        fee: MultiAsset,
        beneficiary: AccountId,
        nonce: u64,
    ) -> Message {
        let preimage = serde_json::json!([origin, instruction, asset, fee, beneficiary, nonce]);
        Message {
            hash: Hash::of(preimage.to_string().as_bytes()),
            origin,
            instruction,
            asset,
            fee,
            beneficiary,
        }
    }
}

/// A message in the inbound queue of its destination.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: Message,
    /// The destination height at which the message is executed.
    pub deliver_at: u64,
}

/// State shared by every ledger of a simulated network: the relay chain's session, its HRMP channels and each
/// parachain's inbound message queue.
#[derive(Debug, Default)]
pub struct Router {
    session_index: AtomicU32,
    channels: RwLock<HashSet<(u32, u32)>>,
    inboxes: RwLock<HashMap<u32, mpsc::UnboundedSender<Message>>>,
}

impl Router {
    pub fn session_index(&self) -> u32 {
        self.session_index.load(Ordering::SeqCst)
    }

    /// Rotates to the next session, returning its index.
    pub fn next_session(&self) -> u32 {
        self.session_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn channel_exists(&self, sender: u32, recipient: u32) -> bool {
        self.channels.read().contains(&(sender, recipient))
    }

    /// Returns `false` if the channel was already open.
    pub fn open_channel(&self, sender: u32, recipient: u32) -> bool {
        self.channels.write().insert((sender, recipient))
    }

    pub fn register(&self, para_id: u32) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inboxes.write().insert(para_id, sender);
        receiver
    }

    /// Queues `message` for `destination`. Requires an open channel from the sender.
    pub fn send(&self, destination: u32, message: Message) -> bool {
        if !self.channel_exists(message.origin, destination) {
            return false;
        }
        let inboxes = self.inboxes.read();
        let Some(inbox) = inboxes.get(&destination) else {
            return false;
        };
        trace!(hash = %message.hash, origin = message.origin, destination, "routing message");
        inbox.send(message).is_ok()
    }
}
