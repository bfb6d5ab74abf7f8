//! Multi-lobby driver for the scale scenario.
//!
//! A single control loop owns every [`LobbyState`]. Each cycle fetches all
//! unfinished snapshots concurrently, then updates lobby state and plans
//! inputs sequentially, then sends the planned inputs concurrently. Finished
//! lobbies move through result verification and payout one step per cycle.

pub mod lobby;
pub mod payout;

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use self::lobby::{deliver_input, LobbyArena, LobbyKey, PlannedInput, ResultsReport};
use self::payout::{PayoutMode, PayoutStep, PayoutWaits};
use crate::api::{IdentityApi, LobbyApi};
use crate::constants::{
    join_interval, DEFAULT_PAYOUT_ADDRESS_A, DEFAULT_PAYOUT_ADDRESS_B, POW_MAX_ITERS,
    SCALE_POLL_INTERVAL, TICK_STALL,
};
use crate::engine::{LivenessMonitor, Progress};
use crate::error::{E2eError, Result};
use crate::identity::{IdentityBootstrapper, RegisteredAgent};
use crate::ledger::PayoutLedger;
use crate::pow::spawn_solve_pow;
use crate::rng::Rng;
use crate::snapshot::{LobbySnapshot, SnapshotStore};
use crate::types::LobbyStatus;

pub use self::lobby::{LobbyPhase, LobbyState};

#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    pub game_mode_id: String,
    pub lobbies: usize,
    pub players_per_lobby: usize,
    pub runners_per_lobby: usize,
    pub fill: Duration,
    pub match_duration: Duration,
    pub finish_grace: Duration,
    pub poll_interval: Duration,
    pub input_every_ticks: u64,
    pub tick_stall: Duration,
    pub payout_mode: PayoutMode,
    pub payout_wait: Duration,
    pub payout_exec_wait: Duration,
    pub coins_per_match: u32,
    pub payout_addresses: [String; 2],
    pub pow_max_iters: u64,
    /// Upper bound on concurrent requests per cycle.
    pub fanout: usize,
    pub seed: Option<u32>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            game_mode_id: String::new(),
            lobbies: 10,
            players_per_lobby: 10,
            runners_per_lobby: 10,
            fill: Duration::from_secs(300),
            match_duration: Duration::from_secs(60),
            finish_grace: Duration::from_secs(180),
            poll_interval: SCALE_POLL_INTERVAL,
            input_every_ticks: 1,
            tick_stall: TICK_STALL,
            payout_mode: PayoutMode::DryRun,
            payout_wait: Duration::from_secs(30),
            payout_exec_wait: Duration::from_secs(45),
            coins_per_match: 10,
            payout_addresses: [
                DEFAULT_PAYOUT_ADDRESS_A.to_string(),
                DEFAULT_PAYOUT_ADDRESS_B.to_string(),
            ],
            pow_max_iters: POW_MAX_ITERS,
            fanout: 32,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LobbySummary {
    #[serde(rename = "lobbyId")]
    pub lobby_id: String,
    #[serde(rename = "watchCode")]
    pub watch_code: Option<String>,
    pub phase: Option<LobbyPhase>,
    pub players: usize,
    pub results: Option<ResultsReport>,
    #[serde(rename = "payoutId")]
    pub payout_id: Option<String>,
    pub sent: u32,
    pub failed: u32,
    #[serde(rename = "failedInputs")]
    pub failed_inputs: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    #[serde(rename = "gameModeId")]
    pub game_mode_id: String,
    #[serde(rename = "lobbyCount")]
    pub lobby_count: usize,
    pub finished: usize,
    #[serde(rename = "resultMismatches")]
    pub result_mismatches: usize,
    #[serde(rename = "totalCoins")]
    pub total_coins: i64,
    #[serde(rename = "payoutsSent")]
    pub payouts_sent: u32,
    #[serde(rename = "payoutsFailed")]
    pub payouts_failed: u32,
    pub cycles: u64,
    #[serde(rename = "inputsSent")]
    pub inputs_sent: u64,
    #[serde(rename = "inputsFailed")]
    pub inputs_failed: u64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
    pub lobbies: Vec<LobbySummary>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CycleStats {
    cycles: u64,
    inputs_sent: u64,
    inputs_failed: u64,
}

pub struct Orchestrator<A, S, L> {
    api: A,
    store: S,
    ledger: L,
    options: OrchestratorOptions,
    arena: LobbyArena,
    liveness: LivenessMonitor,
    rng: Rng,
    stats: CycleStats,
}

impl<A, S, L> Orchestrator<A, S, L>
where
    A: IdentityApi + LobbyApi,
    S: SnapshotStore,
    L: PayoutLedger,
{
    pub fn new(api: A, store: S, ledger: L, options: OrchestratorOptions) -> Self {
        let rng = options.seed.map(Rng::new).unwrap_or_else(Rng::from_entropy);
        let liveness = LivenessMonitor::new(options.tick_stall);
        Self {
            api,
            store,
            ledger,
            options,
            arena: LobbyArena::default(),
            liveness,
            rng,
            stats: CycleStats::default(),
        }
    }

    pub fn arena(&self) -> &LobbyArena {
        &self.arena
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            lobbies = self.options.lobbies,
            players_per_lobby = self.options.players_per_lobby,
            runners_per_lobby = self.options.runners_per_lobby,
            fill_secs = self.options.fill.as_secs_f64(),
            duration_secs = self.options.match_duration.as_secs(),
            input_every_ticks = self.options.input_every_ticks,
            payout_mode = ?self.options.payout_mode,
            "scale_started"
        );

        self.fill().await?;
        self.check_fill()?;
        info!(lobbies = self.arena.len(), "scale_fill_complete");

        let finish_window = self.options.match_duration + self.options.finish_grace;
        let finish_deadline = Instant::now() + finish_window;
        let mut all_finished_logged = false;
        loop {
            let now = Instant::now();
            self.cycle(now).await?;

            if self.all_finished() {
                if !all_finished_logged {
                    info!(lobbies = self.arena.len(), "all_lobbies_finished");
                    all_finished_logged = true;
                }
                if self.all_settled() {
                    break;
                }
            } else if now >= finish_deadline {
                let remaining: Vec<&str> = self
                    .arena
                    .iter()
                    .filter(|lobby| !lobby.phase.is_finished())
                    .map(LobbyState::label)
                    .collect();
                return Err(E2eError::deadline(
                    format!("lobbies to finish (remaining: {})", remaining.join(", ")),
                    finish_window,
                ));
            }
            sleep(self.options.poll_interval).await;
        }

        Ok(self.summary(started.elapsed()))
    }

    /// One driving step plus one completion step for every lobby.
    pub async fn cycle(&mut self, now: Instant) -> Result<()> {
        self.drive_cycle(now).await?;
        self.advance_completed(now).await
    }

    async fn fill(&mut self) -> Result<()> {
        let total = self.options.lobbies * self.options.players_per_lobby;
        let interval = join_interval(self.options.fill, total);
        let mut next_join = Instant::now();
        for idx in 0..total {
            loop {
                let now = Instant::now();
                if now >= next_join {
                    break;
                }
                self.cycle(now).await?;
                let pause = self
                    .options
                    .poll_interval
                    .min(next_join.saturating_duration_since(Instant::now()));
                sleep(pause).await;
            }
            let (label, payout_address) = self.agent_identity(idx);
            let agent = self.register_while_driving(&label, &payout_address).await?;
            self.seat(agent, idx, total, Instant::now()).await?;
            next_join += interval;
        }
        Ok(())
    }

    fn agent_identity(&self, idx: usize) -> (String, String) {
        (
            format!("S{:03}", idx + 1),
            self.options.payout_addresses[idx % 2].clone(),
        )
    }

    /// Registers one agent, running control cycles while its proof-of-work is
    /// solved on the blocking pool.
    async fn register_while_driving(
        &mut self,
        label: &str,
        payout_address: &str,
    ) -> Result<RegisteredAgent> {
        let challenge = self.api.request_challenge().await?;
        let mut solving = spawn_solve_pow(
            challenge.nonce.clone(),
            challenge.difficulty,
            self.options.pow_max_iters,
        );
        let solved = loop {
            tokio::select! {
                joined = &mut solving => break joined??,
                _ = sleep(self.options.poll_interval) => self.cycle(Instant::now()).await?,
            }
        };
        IdentityBootstrapper::new(&self.api, self.options.pow_max_iters)
            .submit(challenge, solved, payout_address, label)
            .await
    }

    /// Registers agent `idx` and seats it in whichever lobby the API picks.
    pub async fn join_one(&mut self, idx: usize, total: usize, now: Instant) -> Result<()> {
        let (label, payout_address) = self.agent_identity(idx);
        let agent = IdentityBootstrapper::new(&self.api, self.options.pow_max_iters)
            .register(&payout_address, &label)
            .await?;
        self.seat(agent, idx, total, now).await
    }

    async fn seat(
        &mut self,
        agent: RegisteredAgent,
        idx: usize,
        total: usize,
        now: Instant,
    ) -> Result<()> {
        let joined = self
            .api
            .join_lobby(&agent.token, &self.options.game_mode_id)
            .await?;

        let (key, created) = self.arena.get_or_insert(&joined.lobby_id);
        let lobby = self.arena.get_mut(key);
        lobby.note_join(joined.watch_code.as_deref(), joined.status.as_deref());
        lobby.add_seat(joined.slot, agent.token);
        if created {
            info!(
                lobby_id = %lobby.lobby_id,
                watch_code = lobby.watch_code.as_deref().unwrap_or(""),
                "lobby_created"
            );
        }
        info!(
            join = idx + 1,
            total,
            label = %agent.label,
            lobby = lobby.label(),
            slot = joined.slot,
            joined = lobby.seat_count(),
            players_per_lobby = self.options.players_per_lobby,
            status = joined.status.as_deref().unwrap_or(""),
            "agent_joined"
        );
        self.refresh_mappings(vec![key], now).await;
        Ok(())
    }

    pub fn check_fill(&self) -> Result<()> {
        if self.arena.len() != self.options.lobbies {
            let codes: Vec<&str> = self.arena.iter().map(LobbyState::label).collect();
            return Err(E2eError::CountMismatch(format!(
                "expected {} lobbies, but created {}: [{}]",
                self.options.lobbies,
                self.arena.len(),
                codes.join(", ")
            )));
        }
        let not_full: Vec<String> = self
            .arena
            .iter()
            .filter(|lobby| lobby.seat_count() != self.options.players_per_lobby)
            .map(|lobby| format!("{}={}", lobby.label(), lobby.seat_count()))
            .collect();
        if !not_full.is_empty() {
            return Err(E2eError::CountMismatch(format!(
                "lobbies did not fill to {} players: [{}]",
                self.options.players_per_lobby,
                not_full.join(", ")
            )));
        }
        Ok(())
    }

    /// Polls every unfinished lobby once and sends this cycle's inputs.
    pub async fn drive_cycle(&mut self, now: Instant) -> Result<()> {
        self.stats.cycles += 1;
        let pending: Vec<(LobbyKey, String)> = self
            .arena
            .keys()
            .filter(|key| !self.arena.get(*key).phase.is_finished())
            .map(|key| (key, self.arena.get(key).lobby_id.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let store = &self.store;
        let fetched: Vec<(LobbyKey, Result<Option<LobbySnapshot>>)> = stream::iter(pending)
            .map(|(key, lobby_id)| async move { (key, store.fetch(&lobby_id).await) })
            .buffer_unordered(self.options.fanout.max(1))
            .collect()
            .await;

        let runner_limit = self.options.runners_per_lobby;
        let mut active = Vec::new();
        let mut stale_mappings = Vec::new();
        for (key, fetched) in fetched {
            let lobby = self.arena.get_mut(key);
            let snapshot = match fetched {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(error) => {
                    warn!(lobby_id = %lobby.lobby_id, error = %error, "snapshot_fetch_failed");
                    continue;
                }
            };

            if lobby.observe_snapshot(&snapshot, now) {
                self.liveness.forget(&lobby.lobby_id);
                info!(lobby_id = %lobby.lobby_id, lobby = lobby.label(), tick = snapshot.tick, "lobby_finished");
                continue;
            }
            if snapshot.status != Some(LobbyStatus::Active) {
                continue;
            }
            if let Progress::Stalled { tick, idle } =
                self.liveness.check(&lobby.lobby_id, snapshot.tick, now)
            {
                return Err(E2eError::LivenessStall {
                    lobby_id: lobby.lobby_id.clone(),
                    tick,
                    idle,
                    threshold: self.liveness.threshold(),
                });
            }
            if lobby.needs_mapping_refresh(now, runner_limit) {
                stale_mappings.push(key);
            }
            active.push((key, snapshot));
        }

        self.refresh_mappings(stale_mappings, now).await;

        let slices = u32::try_from(self.options.players_per_lobby.max(1)).unwrap_or(u32::MAX);
        let mut planned: Vec<(LobbyKey, PlannedInput)> = Vec::new();
        for (key, snapshot) in &active {
            let inputs = self.arena.get_mut(*key).plan_cycle(
                snapshot,
                self.options.input_every_ticks,
                slices,
                &mut self.rng,
            );
            planned.extend(inputs.into_iter().map(|input| (*key, input)));
        }
        self.send_inputs(planned).await;
        Ok(())
    }

    async fn refresh_mappings(&mut self, keys: Vec<LobbyKey>, now: Instant) {
        if keys.is_empty() {
            return;
        }
        let api = &self.api;
        let requests: Vec<(LobbyKey, String)> = keys
            .into_iter()
            .map(|key| (key, self.arena.get(key).lobby_id.clone()))
            .collect();
        let fetched: Vec<_> = stream::iter(requests)
            .map(|(key, lobby_id)| async move { (key, api.lobby_players(&lobby_id).await) })
            .buffer_unordered(self.options.fanout.max(1))
            .collect()
            .await;

        for (key, rows) in fetched {
            let lobby = self.arena.get_mut(key);
            match rows {
                Ok(rows) => {
                    lobby.apply_player_rows(&rows, self.options.runners_per_lobby, now);
                }
                Err(error) => {
                    warn!(lobby_id = %lobby.lobby_id, error = %error, "player_mapping_failed");
                }
            }
        }
    }

    async fn send_inputs(&mut self, planned: Vec<(LobbyKey, PlannedInput)>) {
        if planned.is_empty() {
            return;
        }
        let api = &self.api;
        let delivered: Vec<_> = stream::iter(planned)
            .map(|(key, input)| async move {
                let outcome = deliver_input(api, &input).await;
                (key, input, outcome)
            })
            .buffer_unordered(self.options.fanout.max(1))
            .collect()
            .await;

        for (key, input, outcome) in delivered {
            let lobby = self.arena.get_mut(key);
            match outcome {
                Ok(()) => {
                    lobby.record_sent(&input);
                    self.stats.inputs_sent += 1;
                }
                Err(failure) => {
                    lobby.record_failure(&failure);
                    self.stats.inputs_failed += 1;
                }
            }
        }
    }

    /// Verifies results and advances payouts of finished lobbies.
    pub async fn advance_completed(&mut self, now: Instant) -> Result<()> {
        let waits = PayoutWaits {
            record: self.options.payout_wait,
            execution: self.options.payout_exec_wait,
        };
        let keys: Vec<LobbyKey> = self.arena.keys().collect();
        for key in keys {
            let lobby = self.arena.get_mut(key);
            match lobby.phase {
                LobbyPhase::Finished => {
                    let since = *lobby.finished_at.get_or_insert(now);
                    match self.api.lobby_result(&lobby.lobby_id).await {
                        Ok(result) => {
                            let report = ResultsReport::from_result(&lobby.lobby_id, &result);
                            info!(
                                lobby_id = %lobby.lobby_id,
                                lobby = lobby.label(),
                                coins_collected = report.total_coins,
                                coins_per_match = self.options.coins_per_match,
                                reward_wei = %report.total_reward_wei,
                                mismatches = report.mismatches,
                                players = report.players,
                                "lobby_results"
                            );
                            lobby.results = Some(report);
                            lobby.phase = LobbyPhase::ResultsVerified;
                        }
                        Err(error) => {
                            let waited = now.saturating_duration_since(since);
                            if waited > self.options.payout_wait {
                                return Err(E2eError::deadline(
                                    format!("results of lobby {}", lobby.lobby_id),
                                    waited,
                                ));
                            }
                            warn!(lobby_id = %lobby.lobby_id, error = %error, "lobby_result_failed");
                        }
                    }
                }
                LobbyPhase::ResultsVerified => {
                    let step = PayoutStep {
                        api: &self.api,
                        ledger: &self.ledger,
                        mode: self.options.payout_mode,
                        waits,
                        lobby_id: &lobby.lobby_id,
                        total_coins: lobby.results.as_ref().map_or(0, |r| r.total_coins),
                    };
                    let next = step.advance(&lobby.payout, now).await?;
                    if let Some(outcome) = next.outcome() {
                        info!(
                            lobby_id = %lobby.lobby_id,
                            payout_id = outcome.payout_id.as_deref().unwrap_or(""),
                            sent = outcome.sent,
                            failed = outcome.failed,
                            executed = outcome.executed,
                            "payout_settled"
                        );
                        lobby.phase = LobbyPhase::PayoutSettled;
                    }
                    lobby.payout = next;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn all_finished(&self) -> bool {
        self.arena.iter().all(|lobby| lobby.phase.is_finished())
    }

    pub fn all_settled(&self) -> bool {
        self.arena
            .iter()
            .all(|lobby| lobby.phase == LobbyPhase::PayoutSettled)
    }

    pub fn summary(&self, elapsed: Duration) -> RunSummary {
        let lobbies: Vec<LobbySummary> = self
            .arena
            .iter()
            .map(|lobby| {
                let outcome = lobby.payout.outcome();
                LobbySummary {
                    lobby_id: lobby.lobby_id.clone(),
                    watch_code: lobby.watch_code.clone(),
                    phase: Some(lobby.phase),
                    players: lobby.seat_count(),
                    results: lobby.results.clone(),
                    payout_id: outcome.and_then(|o| o.payout_id.clone()),
                    sent: outcome.map_or(0, |o| o.sent),
                    failed: outcome.map_or(0, |o| o.failed),
                    failed_inputs: lobby.failed_inputs,
                }
            })
            .collect();
        RunSummary {
            game_mode_id: self.options.game_mode_id.clone(),
            lobby_count: lobbies.len(),
            finished: self.arena.iter().filter(|l| l.phase.is_finished()).count(),
            result_mismatches: lobbies
                .iter()
                .filter_map(|l| l.results.as_ref())
                .map(|r| r.mismatches)
                .sum(),
            total_coins: lobbies
                .iter()
                .filter_map(|l| l.results.as_ref())
                .map(|r| r.total_coins)
                .sum(),
            payouts_sent: lobbies.iter().map(|l| l.sent).sum(),
            payouts_failed: lobbies.iter().map(|l| l.failed).sum(),
            cycles: self.stats.cycles,
            inputs_sent: self.stats.inputs_sent,
            inputs_failed: self.stats.inputs_failed,
            elapsed_ms: elapsed.as_millis() as u64,
            lobbies,
        }
    }
}
