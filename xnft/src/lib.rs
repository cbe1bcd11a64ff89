pub mod account;
pub mod cfg;
pub mod client;
pub mod crypto;
pub mod error;
pub mod event;
pub mod exec;
pub mod fake;
pub mod ledger;
pub mod location;
pub mod registry;
pub mod scan;
pub mod serde_util;
pub mod sovereign;
#[cfg(test)]
mod testing;
pub mod token;
pub mod transfer;
