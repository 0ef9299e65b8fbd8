//! Solo Mining Client
//!
//! An async client for mining directly against a full node:
//! - block-template tracking over JSON-RPC polling
//! - sub-second new-block detection through a ZMQ-style push channel
//! - stale-tolerant block submission
//! - collision-resistant 256-bit nonce generation for mining workers

pub mod client;
pub mod config;
pub mod error;
pub mod nonce;
pub mod notify;
pub mod rpc;
pub mod template;
pub mod types;

pub use client::{PollScheduler, SoloClient, SoloClientHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use template::BlockTemplate;
pub use types::{ConnectionState, JobListener, JobResult, SubmitOutcome};

/// Application information
pub const APP_NAME: &str = "solo-mining-client";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
