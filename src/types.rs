//! Core types for solo mining
//!
//! Shared state types and the listener surface consumed by the external
//! mining-thread manager.

use crate::template::BlockTemplate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Orchestrator-level connection state
///
/// Governs whether submit and poll operations are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transports open
    Unconnected,
    /// Transports opening or recovering from a transient failure
    Connecting,
    /// At least one successful template fetch since (re)connecting
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconnected => write!(f, "unconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A solved job handed back by a mining worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Identifier of the job the nonce was found for
    pub job_id: String,
    /// The solved 256-bit nonce
    pub nonce: [u8; 32],
}

impl JobResult {
    /// Create a new job result
    pub fn new(job_id: impl Into<String>, nonce: [u8; 32]) -> Self {
        Self {
            job_id: job_id.into(),
            nonce,
        }
    }
}

/// Outcome of a block submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Whether the node accepted the block
    pub accepted: bool,
    /// Whether the solved job had already been superseded at submit time
    pub stale: bool,
    /// Node reject reason or transport failure, when not accepted
    pub error: Option<String>,
}

impl SubmitOutcome {
    /// An accepted submission
    pub fn accepted(stale: bool) -> Self {
        Self {
            accepted: true,
            stale,
            error: None,
        }
    }

    /// A rejected or failed submission
    pub fn rejected(stale: bool, error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            stale,
            error: Some(error.into()),
        }
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.accepted { "accepted" } else { "rejected" };
        if self.stale {
            write!(f, "{verdict} (stale)")?;
        } else {
            write!(f, "{verdict}")?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// Listener surface consumed by the external mining-thread manager
///
/// All callbacks except `on_submit_result` are invoked from the orchestrator
/// event loop, so jobs and connection-state changes arrive in order.
pub trait JobListener: Send + Sync {
    /// A new job superseded the previous one
    fn on_job(&self, template: Arc<BlockTemplate>);

    /// A submission issued through the handle completed
    fn on_submit_result(&self, request_id: u64, outcome: SubmitOutcome);

    /// The orchestrator changed connection state
    fn on_connection_state(&self, state: ConnectionState);
}
