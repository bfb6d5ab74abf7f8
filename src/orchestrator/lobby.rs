use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::payout::PayoutProgress;
use crate::api::LobbyApi;
use crate::chain::parse_quai_amount;
use crate::constants::{MAPPING_REFRESH, WEI_PER_QUAI};
use crate::engine::{assign_targets, AgentMotion, MoveContext};
use crate::error::TransientActionFailure;
use crate::rng::Rng;
use crate::snapshot::LobbySnapshot;
use crate::types::{
    AgentId, CoinId, Direction, GridSize, LobbyPlayerRow, LobbyResult, LobbyStatus, Position,
    Slot,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyPhase {
    Waiting,
    Active,
    Finished,
    ResultsVerified,
    PayoutSettled,
}

impl LobbyPhase {
    pub fn is_finished(self) -> bool {
        self >= Self::Finished
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LobbyKey(usize);

/// Lobbies in join order with an id lookup.
#[derive(Debug, Default)]
pub struct LobbyArena {
    lobbies: Vec<LobbyState>,
    index: HashMap<String, LobbyKey>,
}

impl LobbyArena {
    /// Returns the lobby's key and whether it was created by this call.
    pub fn get_or_insert(&mut self, lobby_id: &str) -> (LobbyKey, bool) {
        if let Some(key) = self.index.get(lobby_id) {
            return (*key, false);
        }
        let key = LobbyKey(self.lobbies.len());
        self.lobbies.push(LobbyState::new(lobby_id));
        self.index.insert(lobby_id.to_string(), key);
        (key, true)
    }

    pub fn key_of(&self, lobby_id: &str) -> Option<LobbyKey> {
        self.index.get(lobby_id).copied()
    }

    pub fn get(&self, key: LobbyKey) -> &LobbyState {
        &self.lobbies[key.0]
    }

    pub fn get_mut(&mut self, key: LobbyKey) -> &mut LobbyState {
        &mut self.lobbies[key.0]
    }

    pub fn keys(&self) -> impl Iterator<Item = LobbyKey> {
        (0..self.lobbies.len()).map(LobbyKey)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LobbyState> {
        self.lobbies.iter()
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }
}

/// One input the orchestrator is about to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedInput {
    pub lobby_id: String,
    pub agent_id: AgentId,
    pub token: String,
    pub direction: Direction,
    pub tick: u64,
    pub position: Position,
}

pub async fn deliver_input<A: LobbyApi + ?Sized>(
    api: &A,
    input: &PlannedInput,
) -> Result<(), TransientActionFailure> {
    api.send_input(&input.token, &input.lobby_id, input.direction)
        .await
        .map_err(|error| TransientActionFailure {
            lobby_id: input.lobby_id.clone(),
            agent_id: input.agent_id.clone(),
            reason: error.to_string(),
        })
}

#[derive(Clone, Debug)]
struct AgentRecord {
    slot: Slot,
    motion: AgentMotion,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResultsReport {
    pub players: usize,
    #[serde(rename = "totalCoins")]
    pub total_coins: i64,
    #[serde(rename = "totalRewardWei")]
    pub total_reward_wei: u128,
    pub mismatches: usize,
}

impl ResultsReport {
    /// Each collected coin must be worth exactly one QUAI.
    pub fn from_result(lobby_id: &str, result: &LobbyResult) -> Self {
        let mut report = Self {
            players: result.results.len(),
            ..Self::default()
        };
        for row in &result.results {
            report.total_coins += row.final_coins;
            let expected = u128::try_from(row.final_coins.max(0)).unwrap_or(0) * WEI_PER_QUAI;
            let reward = parse_quai_amount(&row.final_reward);
            if let Ok(wei) = reward {
                report.total_reward_wei += wei;
            }
            if reward.as_ref().ok() != Some(&expected) || row.final_coins < 0 {
                report.mismatches += 1;
                warn!(
                    lobby_id,
                    agent_id = row.agent_id.as_deref().unwrap_or("unknown"),
                    final_coins = row.final_coins,
                    final_reward = %row.final_reward,
                    "reward_mismatch"
                );
            }
        }
        report
    }
}

/// Orchestration state for one lobby. Mutated only by the control loop.
#[derive(Debug)]
pub struct LobbyState {
    pub lobby_id: String,
    pub watch_code: Option<String>,
    pub status: Option<LobbyStatus>,
    pub phase: LobbyPhase,
    pub grid: GridSize,
    pub tick: u64,
    pub finished_at: Option<Instant>,
    pub results: Option<ResultsReport>,
    pub payout: PayoutProgress,
    pub failed_inputs: u64,
    seats: BTreeMap<Slot, String>,
    slot_agents: BTreeMap<Slot, AgentId>,
    agents: HashMap<AgentId, AgentRecord>,
    runners: Vec<AgentId>,
    last_mapping_refresh: Option<Instant>,
}

impl LobbyState {
    pub fn new(lobby_id: &str) -> Self {
        Self {
            lobby_id: lobby_id.to_string(),
            watch_code: None,
            status: None,
            phase: LobbyPhase::Waiting,
            grid: GridSize {
                width: 1,
                height: 1,
            },
            tick: 0,
            finished_at: None,
            results: None,
            payout: PayoutProgress::default(),
            failed_inputs: 0,
            seats: BTreeMap::new(),
            slot_agents: BTreeMap::new(),
            agents: HashMap::new(),
            runners: Vec::new(),
            last_mapping_refresh: None,
        }
    }

    /// Short name for logs: the watch code when known.
    pub fn label(&self) -> &str {
        self.watch_code.as_deref().unwrap_or(&self.lobby_id)
    }

    pub fn note_join(&mut self, watch_code: Option<&str>, status: Option<&str>) {
        if let Some(code) = watch_code.filter(|code| !code.is_empty()) {
            self.watch_code = Some(code.to_string());
        }
        if let Some(status) = status.and_then(LobbyStatus::parse) {
            self.set_status(status);
        }
    }

    pub fn add_seat(&mut self, slot: Slot, token: String) {
        self.seats.insert(slot, token);
    }

    pub fn seat_count(&self) -> usize {
        self.seats.len()
    }

    pub fn runners(&self) -> &[AgentId] {
        &self.runners
    }

    pub fn agent_for_slot(&self, slot: Slot) -> Option<&str> {
        self.slot_agents.get(&slot).map(String::as_str)
    }

    pub fn motion(&self, agent_id: &str) -> Option<&AgentMotion> {
        self.agents.get(agent_id).map(|record| &record.motion)
    }

    fn set_status(&mut self, status: LobbyStatus) {
        self.status = Some(status);
        let phase = match status {
            LobbyStatus::Waiting => LobbyPhase::Waiting,
            LobbyStatus::Active => LobbyPhase::Active,
            LobbyStatus::Finished => LobbyPhase::Finished,
        };
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// Copies snapshot metadata. Returns true when this observation moved the
    /// lobby into the finished phase.
    pub fn observe_snapshot(&mut self, snapshot: &LobbySnapshot, now: Instant) -> bool {
        let was_finished = self.phase.is_finished();
        self.tick = snapshot.tick;
        self.grid = snapshot.grid;
        if let Some(status) = snapshot.status {
            self.set_status(status);
        }
        let finished_now = !was_finished && self.phase.is_finished();
        if finished_now {
            self.finished_at = Some(now);
        }
        finished_now
    }

    fn expected_runners(&self, runner_limit: usize) -> usize {
        runner_limit.max(1).min(self.seats.len())
    }

    fn mapped_seats(&self) -> usize {
        self.seats
            .keys()
            .filter(|slot| self.slot_agents.contains_key(slot))
            .count()
    }

    pub fn needs_mapping_refresh(&self, now: Instant, runner_limit: usize) -> bool {
        let stale = self
            .last_mapping_refresh
            .map_or(true, |at| now.saturating_duration_since(at) >= MAPPING_REFRESH);
        stale
            || self.runners.len() < self.expected_runners(runner_limit)
            || self.mapped_seats() < self.seats.len()
    }

    /// Merges `GET /players` rows. A slot keeps the first agent seen for it;
    /// conflicting rows are ignored. Returns how many rows conflicted.
    pub fn apply_player_rows(
        &mut self,
        rows: &[LobbyPlayerRow],
        runner_limit: usize,
        now: Instant,
    ) -> usize {
        let mut conflicts = 0;
        for row in rows {
            match self.slot_agents.get(&row.slot) {
                Some(known) if *known == row.agent_id => {}
                Some(known) => {
                    conflicts += 1;
                    warn!(
                        lobby_id = %self.lobby_id,
                        slot = row.slot,
                        known = %known,
                        reported = %row.agent_id,
                        "slot_mapping_conflict"
                    );
                }
                None => {
                    self.slot_agents.insert(row.slot, row.agent_id.clone());
                    self.agents
                        .entry(row.agent_id.clone())
                        .or_insert_with(|| AgentRecord {
                            slot: row.slot,
                            motion: AgentMotion::default(),
                        });
                }
            }
        }

        let runner_limit = runner_limit.max(1);
        self.runners = self
            .seats
            .keys()
            .take(runner_limit)
            .filter_map(|slot| self.slot_agents.get(slot).cloned())
            .collect();
        self.last_mapping_refresh = Some(now);
        conflicts
    }

    /// Plans at most one input per runner for this snapshot.
    pub fn plan_cycle(
        &mut self,
        snapshot: &LobbySnapshot,
        input_every_ticks: u64,
        slices: u32,
        rng: &mut Rng,
    ) -> Vec<PlannedInput> {
        let positioned: Vec<(AgentId, Position)> = self
            .runners
            .iter()
            .filter_map(|agent_id| {
                snapshot
                    .player(agent_id)
                    .map(|player| (agent_id.clone(), player.position))
            })
            .collect();
        if positioned.is_empty() {
            return Vec::new();
        }

        let assignments = assign_targets(&positioned, &snapshot.coins, true);
        let claimed: HashSet<CoinId> = assignments.values().map(|a| a.coin_id).collect();
        let occupied = snapshot.occupied();
        let ctx = MoveContext {
            grid: snapshot.grid,
            coins: &snapshot.coins,
            occupied: &occupied,
            claimed: &claimed,
            slices,
        };

        let tick = snapshot.tick;
        let mut planned = Vec::new();
        for (agent_id, position) in positioned {
            let Some(record) = self.agents.get_mut(&agent_id) else {
                continue;
            };
            let Some(token) = self.seats.get(&record.slot) else {
                continue;
            };
            if !record.motion.is_due(tick, input_every_ticks) {
                continue;
            }
            let blocked = record.motion.observe(tick, position);
            let direction = record.motion.plan(
                position,
                record.slot,
                assignments.get(&agent_id),
                &ctx,
                blocked,
                rng,
            );
            debug!(
                lobby_id = %self.lobby_id,
                agent_id = %agent_id,
                slot = record.slot,
                tick,
                x = position.x,
                y = position.y,
                target = ?record.motion.target(),
                blocked_count = record.motion.blocked_count(),
                direction = direction.as_str(),
                "move_planned"
            );
            planned.push(PlannedInput {
                lobby_id: self.lobby_id.clone(),
                agent_id,
                token: token.clone(),
                direction,
                tick,
                position,
            });
        }
        planned
    }

    pub fn record_sent(&mut self, input: &PlannedInput) {
        if let Some(record) = self.agents.get_mut(&input.agent_id) {
            record.motion.record_sent(input.tick, input.position);
        }
    }

    pub fn record_failure(&mut self, failure: &TransientActionFailure) {
        self.failed_inputs += 1;
        debug!(
            lobby_id = %failure.lobby_id,
            agent_id = %failure.agent_id,
            reason = %failure.reason,
            failed_inputs = self.failed_inputs,
            "input_skipped"
        );
    }
}
