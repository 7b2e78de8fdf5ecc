//! fleetsync
//!
//! Master-side coordinator for a file-integrity cluster: keeps a golden
//! snapshot of the managed tree, reconciles worker archives against it and
//! answers fleet-wide admin queries.

pub mod admin;
pub mod agents;
pub mod archive;
pub mod cli;
pub mod config;
pub mod file_lock;
pub mod file_write;
pub mod golden;
pub mod journal;
pub mod master;
pub mod net_async;
pub mod node;
pub mod protocol;
pub mod protocol_core;
pub mod reconcile;
pub mod session;
pub mod snapshot;
pub mod transfer;
pub mod transport;

pub use config::MasterConfig;
pub use master::{Master, StopHandle};
