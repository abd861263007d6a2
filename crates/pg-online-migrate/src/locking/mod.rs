//! Lock coordination with concurrent sessions.
//!
//! - [`retries`]: run a block under short `lock_timeout`s, backing off between
//!   attempts, so DDL never queues behind long-running transactions for long
//! - [`monitor`]: after-statement observer that flags transactional migrations
//!   taking heavy locks on several tables in separate statements

pub mod monitor;
pub mod retries;

pub use monitor::{LockMonitor, LOW_SEVERITY_LOCK_MODES};
pub use retries::{TimingConfiguration, WithLockRetries};
