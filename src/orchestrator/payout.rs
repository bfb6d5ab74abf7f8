//! Payout handling for finished lobbies, advanced one non-blocking step per
//! control-loop cycle.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api::LobbyApi;
use crate::error::{E2eError, Result};
use crate::ledger::PayoutLedger;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMode {
    /// Only confirm the payout record exists.
    DryRun,
    /// The API's payout worker executes; wait for line items to settle.
    AutoWorker,
    /// Trigger `POST /payouts/execute` ourselves.
    Manual,
}

#[derive(Clone, Copy, Debug)]
pub struct PayoutWaits {
    pub record: Duration,
    pub execution: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PayoutOutcome {
    #[serde(rename = "payoutId")]
    pub payout_id: Option<String>,
    pub sent: u32,
    pub failed: u32,
    pub executed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PayoutProgress {
    #[default]
    Idle,
    AwaitingRecord {
        since: Instant,
    },
    AwaitingItems {
        payout_id: String,
        since: Instant,
    },
    Settled(PayoutOutcome),
}

impl PayoutProgress {
    pub fn outcome(&self) -> Option<&PayoutOutcome> {
        match self {
            Self::Settled(outcome) => Some(outcome),
            _ => None,
        }
    }
}

pub struct PayoutStep<'a, A: ?Sized, L: ?Sized> {
    pub api: &'a A,
    pub ledger: &'a L,
    pub mode: PayoutMode,
    pub waits: PayoutWaits,
    pub lobby_id: &'a str,
    pub total_coins: i64,
}

impl<A, L> PayoutStep<'_, A, L>
where
    A: LobbyApi + ?Sized,
    L: PayoutLedger + ?Sized,
{
    /// Moves `progress` forward by at most one external poll.
    ///
    /// Ledger read errors are retried on the next cycle; expired waits and a
    /// failed execute call are fatal.
    pub async fn advance(&self, progress: &PayoutProgress, now: Instant) -> Result<PayoutProgress> {
        match progress {
            PayoutProgress::Idle => self.await_record(now, now).await,
            PayoutProgress::AwaitingRecord { since } => self.await_record(*since, now).await,
            PayoutProgress::AwaitingItems { payout_id, since } => {
                self.await_items(payout_id, *since, now).await
            }
            PayoutProgress::Settled(_) => Ok(progress.clone()),
        }
    }

    async fn await_record(&self, since: Instant, now: Instant) -> Result<PayoutProgress> {
        let lookup = match self.ledger.payout_id(self.lobby_id).await {
            Ok(found) => found,
            Err(error) => {
                warn!(lobby_id = self.lobby_id, error = %error, "payout_lookup_failed");
                None
            }
        };
        let Some(payout_id) = lookup else {
            let waited = now.saturating_duration_since(since);
            if waited > self.waits.record {
                return Err(E2eError::deadline(
                    format!("payout record for lobby {}", self.lobby_id),
                    waited,
                ));
            }
            return Ok(PayoutProgress::AwaitingRecord { since });
        };
        info!(lobby_id = self.lobby_id, payout_id = %payout_id, "payout_ready");

        match self.mode {
            PayoutMode::DryRun => Ok(settled(Some(payout_id), 0, 0, false)),
            PayoutMode::AutoWorker if self.total_coins <= 0 => {
                Ok(settled(Some(payout_id), 0, 0, false))
            }
            PayoutMode::AutoWorker => {
                // The item wait shares the clock started when the record wait began.
                self.await_items(&payout_id, since, now).await
            }
            PayoutMode::Manual if self.total_coins <= 0 => {
                info!(lobby_id = self.lobby_id, "payout_skipped_no_coins");
                Ok(settled(Some(payout_id), 0, 0, false))
            }
            PayoutMode::Manual => {
                let executed = self.api.execute_payout(self.lobby_id).await.map_err(|error| {
                    E2eError::PayoutFailed {
                        lobby_id: self.lobby_id.to_string(),
                        reason: error.to_string(),
                    }
                })?;
                info!(
                    lobby_id = self.lobby_id,
                    sent = executed.sent,
                    failed = executed.failed,
                    "payout_executed"
                );
                Ok(settled(Some(payout_id), executed.sent, executed.failed, true))
            }
        }
    }

    async fn await_items(
        &self,
        payout_id: &str,
        since: Instant,
        now: Instant,
    ) -> Result<PayoutProgress> {
        match self.ledger.payout_item_counts(payout_id).await {
            Ok(counts) if counts.is_settled() => {
                if counts.failed > 0 {
                    warn!(
                        lobby_id = self.lobby_id,
                        payout_id,
                        failed = counts.failed,
                        "payout_items_failed"
                    );
                }
                info!(
                    lobby_id = self.lobby_id,
                    payout_id,
                    sent = counts.sent,
                    failed = counts.failed,
                    "payout_worker_observed"
                );
                return Ok(settled(
                    Some(payout_id.to_string()),
                    counts.sent,
                    counts.failed,
                    true,
                ));
            }
            Ok(_) => {}
            Err(error) => {
                warn!(lobby_id = self.lobby_id, error = %error, "payout_items_lookup_failed");
            }
        }

        let limit = self.waits.record.max(self.waits.execution);
        let waited = now.saturating_duration_since(since);
        if waited > limit {
            return Err(E2eError::deadline(
                format!("payout execution for lobby {}", self.lobby_id),
                waited,
            ));
        }
        Ok(PayoutProgress::AwaitingItems {
            payout_id: payout_id.to_string(),
            since,
        })
    }
}

fn settled(payout_id: Option<String>, sent: u32, failed: u32, executed: bool) -> PayoutProgress {
    PayoutProgress::Settled(PayoutOutcome {
        payout_id,
        sent,
        failed,
        executed,
    })
}
