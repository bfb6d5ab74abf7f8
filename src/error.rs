//! Error taxonomy for the end-to-end driver.
//!
//! Everything in [`E2eError`] is fatal for a run. Per-agent input failures are
//! reported separately as [`TransientActionFailure`] so callers have to handle
//! them explicitly instead of letting them escape through `?`.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    /// The lobby tick did not advance for longer than the stall threshold.
    #[error(
        "lobby {lobby_id} tick stalled at {tick} for {idle:?} (threshold {threshold:?}); is the game server processing inputs?"
    )]
    LivenessStall {
        lobby_id: String,
        tick: u64,
        idle: Duration,
        threshold: Duration,
    },

    /// A bounded wait expired.
    #[error("timed out after {waited:?} waiting for {what}")]
    DeadlineExceeded { what: String, waited: Duration },

    /// The fill phase did not reach the configured scale.
    #[error("count mismatch: {0}")]
    CountMismatch(String),

    #[error(
        "failed to solve proof-of-work (difficulty {difficulty}) in {max_iters} iterations; increase POW_MAX_ITERS or reduce difficulty"
    )]
    PowExhausted { difficulty: u32, max_iters: u64 },

    #[error("payout failed for lobby {lobby_id}: {reason}")]
    PayoutFailed { lobby_id: String, reason: String },

    #[error("transaction {tx_hash} failed (status={status})")]
    TransactionFailed { tx_hash: String, status: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A collaborator answered with a non-success status.
    #[error("HTTP {status} {url}: {body}")]
    Api { status: u16, url: String, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("snapshot store error: {0}")]
    SnapshotStore(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("invalid lobby snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl E2eError {
    pub fn deadline(what: impl Into<String>, waited: Duration) -> Self {
        Self::DeadlineExceeded {
            what: what.into(),
            waited,
        }
    }
}

pub type Result<T> = std::result::Result<T, E2eError>;

/// A single agent's input could not be delivered this cycle.
///
/// The orchestrator skips the agent and retries on the next cycle with a fresh
/// snapshot.
#[derive(Error, Debug)]
#[error("input for agent {agent_id} in lobby {lobby_id} failed: {reason}")]
pub struct TransientActionFailure {
    pub lobby_id: String,
    pub agent_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_error_mentions_what_was_awaited() {
        let error = E2eError::deadline("payout record for lobby l1", Duration::from_secs(30));
        let text = error.to_string();
        assert!(text.contains("payout record for lobby l1"));
        assert!(text.contains("30s"));
    }

    #[test]
    fn pow_exhausted_names_the_budget() {
        let error = E2eError::PowExhausted {
            difficulty: 6,
            max_iters: 10,
        };
        assert!(error.to_string().contains("in 10 iterations"));
    }
}
