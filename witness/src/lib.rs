pub mod address;
pub mod amount;
pub mod attestation;
pub mod bridge;
pub mod cache;
pub mod cfg;
pub mod chain;
pub mod creation;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod retry;
pub mod sender;
pub mod state;
#[cfg(any(test, feature = "test_util"))]
pub mod test_util;
