//! Two-agent completion scenario.
//!
//! Registers two agents, checks that a lone agent can leave a lobby, then
//! seats both agents in a fresh two-player lobby and steers each of them onto
//! one coin. Once the lobby finishes the payout is executed and, unless chain
//! checks are skipped, every transfer is followed to its receipt and to the
//! recipient balance.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::api::{IdentityApi, LobbyApi};
use crate::chain::{format_wei, parse_quai_amount, receipt_succeeded, ChainReader};
use crate::constants::{
    CHAIN_POLL, DEFAULT_PAYOUT_ADDRESS_A, DEFAULT_PAYOUT_ADDRESS_B, DUO_POLL_INTERVAL,
    PAYOUT_ITEMS_POLL, POW_MAX_ITERS, STATE_WAIT_POLL, TICK_STALL,
};
use crate::engine::{assign_targets, rank_directions, LivenessMonitor, Progress};
use crate::error::{E2eError, Result};
use crate::identity::{IdentityBootstrapper, RegisteredAgent};
use crate::ledger::{LobbyLedger, PayoutLedger};
use crate::snapshot::{LobbySnapshot, SnapshotStore};
use crate::types::{AgentId, Direction, GameModeSpec, GridSize, Position, SentPayoutItem};

const DUO_PLAYERS: u32 = 2;
const LEAVE_CHECK_DURATION_SEC: u32 = 10;

#[derive(Clone, Debug)]
pub struct DuoOptions {
    pub game_duration: Duration,
    pub reward_pool_quai: String,
    pub coin_wait: Duration,
    pub move_timeout: Duration,
    pub finish_wait: Duration,
    pub payout_wait: Duration,
    pub tx_wait: Duration,
    pub balance_wait: Duration,
    pub tick_stall: Duration,
    pub skip_chain: bool,
    pub payout_addresses: [String; 2],
    pub pow_max_iters: u64,
}

impl Default for DuoOptions {
    fn default() -> Self {
        Self {
            game_duration: Duration::from_secs(10),
            reward_pool_quai: "1".to_string(),
            coin_wait: Duration::from_secs(10),
            move_timeout: Duration::from_secs(20),
            finish_wait: Duration::from_secs(20),
            payout_wait: Duration::from_secs(30),
            tx_wait: Duration::from_secs(60),
            balance_wait: Duration::from_secs(90),
            tick_stall: TICK_STALL,
            skip_chain: false,
            payout_addresses: [
                DEFAULT_PAYOUT_ADDRESS_A.to_string(),
                DEFAULT_PAYOUT_ADDRESS_B.to_string(),
            ],
            pow_max_iters: POW_MAX_ITERS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DuoReport {
    pub lobby_id: String,
    pub payout_id: String,
    pub sent: u32,
    pub failed: u32,
    pub tx_hashes: Vec<String>,
    pub chain_verified: bool,
}

/// One seated agent: who it is in the lobby and how to act for it.
#[derive(Clone, Debug)]
struct DuoSeat {
    agent_id: AgentId,
    token: String,
    label: String,
}

pub struct DuoScenario<'a, A, L, S, C> {
    api: &'a A,
    ledger: &'a L,
    store: &'a S,
    chain: Option<&'a C>,
    options: DuoOptions,
}

impl<'a, A, L, S, C> DuoScenario<'a, A, L, S, C>
where
    A: IdentityApi + LobbyApi,
    L: PayoutLedger + LobbyLedger,
    S: SnapshotStore,
    C: ChainReader,
{
    /// `chain` is ignored when `options.skip_chain` is set.
    pub fn new(
        api: &'a A,
        ledger: &'a L,
        store: &'a S,
        chain: Option<&'a C>,
        options: DuoOptions,
    ) -> Self {
        let chain = chain.filter(|_| !options.skip_chain);
        Self {
            api,
            ledger,
            store,
            chain,
            options,
        }
    }

    pub async fn run(&self) -> Result<DuoReport> {
        info!(
            coin_wait_secs = self.options.coin_wait.as_secs_f64(),
            move_timeout_secs = self.options.move_timeout.as_secs_f64(),
            tick_stall_secs = self.options.tick_stall.as_secs_f64(),
            finish_wait_secs = self.options.finish_wait.as_secs_f64(),
            payout_wait_secs = self.options.payout_wait.as_secs_f64(),
            tx_wait_secs = self.options.tx_wait.as_secs_f64(),
            balance_wait_secs = self.options.balance_wait.as_secs_f64(),
            skip_chain = self.options.skip_chain,
            "duo_started"
        );

        let bootstrap = IdentityBootstrapper::new(self.api, self.options.pow_max_iters);
        let first = bootstrap
            .register(&self.options.payout_addresses[0], "P1")
            .await?;
        let second = bootstrap
            .register(&self.options.payout_addresses[1], "P2")
            .await?;
        info!(p1 = %first.agent_id, p2 = %second.agent_id, "duo_agents_registered");

        self.leave_check(&first).await?;

        let game_mode_id = self
            .ledger
            .create_game_mode(&GameModeSpec {
                max_players: DUO_PLAYERS,
                duration_sec: secs_u32(self.options.game_duration),
                coins_per_match: DUO_PLAYERS,
                reward_pool_quai: self.options.reward_pool_quai.clone(),
            })
            .await?;

        let (lobby_id, seats) = self.seat_both(&game_mode_id, [&first, &second]).await?;
        let snapshot = self.wait_for_coins(&lobby_id, seats.len()).await?;
        info!(
            lobby_id = %lobby_id,
            width = snapshot.grid.width,
            height = snapshot.grid.height,
            coins = snapshot.coins.len(),
            ends_at = snapshot.ends_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
            "duo_grid_ready"
        );

        self.collect_one_each(&lobby_id, &seats, &snapshot).await?;
        self.wait_for_finish(&lobby_id).await?;
        let payout_id = self.wait_for_payout_record(&lobby_id).await?;

        let mut report = DuoReport {
            lobby_id: lobby_id.clone(),
            payout_id: payout_id.clone(),
            ..DuoReport::default()
        };
        let Some(chain) = self.chain else {
            info!(lobby_id = %lobby_id, payout_id = %payout_id, "duo_chain_checks_skipped");
            return Ok(report);
        };

        let before = self.read_balances(chain).await?;
        let executed = self.api.execute_payout(&lobby_id).await?;
        info!(
            lobby_id = %lobby_id,
            sent = executed.sent,
            failed = executed.failed,
            "payout_executed"
        );
        report.sent = executed.sent;
        report.failed = executed.failed;
        if executed.sent == 0 {
            let reason = self
                .ledger
                .first_failure(&payout_id)
                .await?
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(E2eError::PayoutFailed { lobby_id, reason });
        }

        let items = self.ledger.sent_payout_items(&payout_id).await?;
        report.tx_hashes = sent_tx_hashes(&report.lobby_id, &items)?;
        for tx_hash in &report.tx_hashes {
            self.wait_for_receipt(chain, tx_hash).await?;
        }
        let expected = expected_payouts(&items)?;
        self.wait_for_balances(chain, &before, &expected).await?;
        report.chain_verified = true;
        Ok(report)
    }

    async fn leave_check(&self, agent: &RegisteredAgent) -> Result<()> {
        let game_mode_id = self
            .ledger
            .create_game_mode(&GameModeSpec {
                max_players: 1,
                duration_sec: LEAVE_CHECK_DURATION_SEC,
                coins_per_match: 1,
                reward_pool_quai: self.options.reward_pool_quai.clone(),
            })
            .await?;
        let joined = self.api.join_lobby(&agent.token, &game_mode_id).await?;
        self.api.leave_lobby(&agent.token, &joined.lobby_id).await?;
        info!(lobby_id = %joined.lobby_id, agent_id = %agent.agent_id, "leave_check_passed");
        Ok(())
    }

    /// Joins both agents and resolves their in-lobby agent ids by slot.
    async fn seat_both(
        &self,
        game_mode_id: &str,
        agents: [&RegisteredAgent; 2],
    ) -> Result<(String, Vec<DuoSeat>)> {
        let mut tokens_by_slot = HashMap::new();
        let mut lobby_id = None::<String>;
        for agent in agents {
            let joined = self.api.join_lobby(&agent.token, game_mode_id).await?;
            if let Some(known) = lobby_id.as_deref() {
                if known != joined.lobby_id {
                    return Err(E2eError::CountMismatch(format!(
                        "{} joined lobby {} instead of {known}",
                        agent.label, joined.lobby_id
                    )));
                }
            }
            info!(
                label = %agent.label,
                lobby_id = %joined.lobby_id,
                watch_code = joined.watch_code.as_deref().unwrap_or(""),
                slot = joined.slot,
                status = joined.status.as_deref().unwrap_or(""),
                "agent_joined"
            );
            tokens_by_slot.insert(joined.slot, (agent.token.clone(), agent.label.clone()));
            lobby_id = Some(joined.lobby_id);
        }
        let lobby_id = lobby_id.unwrap_or_default();

        let rows = self.ledger.lobby_agents_by_slot(&lobby_id).await?;
        if rows.len() != agents.len() {
            return Err(E2eError::CountMismatch(format!(
                "expected {} agents in lobby {lobby_id}, found {}",
                agents.len(),
                rows.len()
            )));
        }
        let seats = rows
            .into_iter()
            .map(|(slot, agent_id)| {
                let (token, label) = tokens_by_slot.remove(&slot).ok_or_else(|| {
                    E2eError::CountMismatch(format!("no joined agent holds slot {slot}"))
                })?;
                Ok(DuoSeat {
                    agent_id,
                    token,
                    label,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((lobby_id, seats))
    }

    async fn wait_for_coins(&self, lobby_id: &str, agents: usize) -> Result<LobbySnapshot> {
        let started = Instant::now();
        loop {
            if let Some(snapshot) = self.store.fetch(lobby_id).await? {
                if snapshot.coins.len() >= agents {
                    return Ok(snapshot);
                }
            }
            let waited = started.elapsed();
            if waited > self.options.coin_wait {
                return Err(E2eError::deadline(
                    format!("{agents} coins in lobby {lobby_id}"),
                    waited,
                ));
            }
            sleep(STATE_WAIT_POLL).await;
        }
    }

    async fn collect_one_each(
        &self,
        lobby_id: &str,
        seats: &[DuoSeat],
        initial: &LobbySnapshot,
    ) -> Result<()> {
        let agent_ids: Vec<AgentId> = seats.iter().map(|seat| seat.agent_id.clone()).collect();
        let mut tracker = CollectionTracker::new(initial, &agent_ids);
        let mut liveness = LivenessMonitor::new(self.options.tick_stall);
        let started = Instant::now();

        loop {
            let now = Instant::now();
            let waited = now.saturating_duration_since(started);
            if waited > self.options.move_timeout {
                return Err(E2eError::deadline(
                    format!("both agents to collect a coin in lobby {lobby_id}"),
                    waited,
                ));
            }

            let snapshot = self.store.fetch(lobby_id).await?.ok_or_else(|| {
                E2eError::InvalidSnapshot(format!("lobby {lobby_id} state disappeared"))
            })?;
            if let Progress::Stalled { tick, idle } = liveness.check(lobby_id, snapshot.tick, now) {
                return Err(E2eError::LivenessStall {
                    lobby_id: lobby_id.to_string(),
                    tick,
                    idle,
                    threshold: liveness.threshold(),
                });
            }
            for agent_id in tracker.observe(&snapshot) {
                info!(lobby_id, agent_id = %agent_id, "coin_collected");
            }
            if tracker.is_complete() {
                return Ok(());
            }
            if snapshot.is_finished() {
                return Err(E2eError::deadline(
                    format!("both agents to collect a coin before lobby {lobby_id} finished"),
                    waited,
                ));
            }

            let pending: Vec<(usize, AgentId)> = seats
                .iter()
                .enumerate()
                .filter(|(_, seat)| !tracker.has_collected(&seat.agent_id))
                .map(|(idx, seat)| (idx, seat.agent_id.clone()))
                .collect();
            for (agent_id, direction) in plan_duo_moves(&snapshot, &pending) {
                let Some(seat) = seats.iter().find(|seat| seat.agent_id == agent_id) else {
                    continue;
                };
                debug!(lobby_id, label = %seat.label, direction = direction.as_str(), "move_planned");
                if let Err(error) = self.api.send_input(&seat.token, lobby_id, direction).await {
                    warn!(lobby_id, label = %seat.label, error = %error, "input_skipped");
                }
            }
            sleep(DUO_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_finish(&self, lobby_id: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            if let Some(snapshot) = self.store.fetch(lobby_id).await? {
                if snapshot.is_finished() {
                    info!(lobby_id, tick = snapshot.tick, "lobby_finished");
                    return Ok(());
                }
            }
            let waited = started.elapsed();
            if waited > self.options.finish_wait {
                return Err(E2eError::deadline(format!("lobby {lobby_id} to finish"), waited));
            }
            sleep(STATE_WAIT_POLL).await;
        }
    }

    async fn wait_for_payout_record(&self, lobby_id: &str) -> Result<String> {
        let started = Instant::now();
        loop {
            if let Some(payout_id) = self.ledger.payout_id(lobby_id).await? {
                info!(lobby_id, payout_id = %payout_id, "payout_ready");
                return Ok(payout_id);
            }
            let waited = started.elapsed();
            if waited > self.options.payout_wait {
                return Err(E2eError::deadline(
                    format!("payout record for lobby {lobby_id}"),
                    waited,
                ));
            }
            sleep(PAYOUT_ITEMS_POLL).await;
        }
    }

    async fn read_balances(&self, chain: &C) -> Result<Vec<(String, u128)>> {
        let mut balances = Vec::with_capacity(self.options.payout_addresses.len());
        for address in &self.options.payout_addresses {
            let wei = chain.balance_wei(address).await?;
            balances.push((address.clone(), wei));
        }
        Ok(balances)
    }

    async fn wait_for_receipt(&self, chain: &C, tx_hash: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            if let Some(receipt) = chain.transaction_receipt(tx_hash).await? {
                if !receipt_succeeded(&receipt) {
                    let status = receipt
                        .get("status")
                        .map_or_else(|| "missing".to_string(), |status| status.to_string());
                    return Err(E2eError::TransactionFailed {
                        tx_hash: tx_hash.to_string(),
                        status,
                    });
                }
                info!(tx_hash, "transaction_confirmed");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited > self.options.tx_wait {
                return Err(E2eError::deadline(format!("receipt of {tx_hash}"), waited));
            }
            sleep(CHAIN_POLL).await;
        }
    }

    async fn wait_for_balances(
        &self,
        chain: &C,
        before: &[(String, u128)],
        expected: &HashMap<String, u128>,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let mut all_increased = true;
            for (address, before_wei) in before {
                let after_wei = chain.balance_wei(address).await?;
                let want = expected.get(&address.to_lowercase()).copied().unwrap_or(1);
                if balance_increased(*before_wei, after_wei, want) {
                    info!(
                        address = %address,
                        before = %format_wei(*before_wei),
                        after = %format_wei(after_wei),
                        "balance_increased"
                    );
                } else {
                    all_increased = false;
                }
            }
            if all_increased {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited > self.options.balance_wait {
                return Err(E2eError::deadline("payout balances to increase", waited));
            }
            sleep(CHAIN_POLL).await;
        }
    }
}

fn secs_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX)
}

/// Remembers each agent's starting score and which agents have since scored.
#[derive(Debug)]
struct CollectionTracker {
    baseline: HashMap<AgentId, i64>,
    collected: HashSet<AgentId>,
}

impl CollectionTracker {
    fn new(snapshot: &LobbySnapshot, agent_ids: &[AgentId]) -> Self {
        let baseline = agent_ids
            .iter()
            .map(|agent_id| {
                let score = snapshot.player(agent_id).map_or(0, |player| player.score);
                (agent_id.clone(), score)
            })
            .collect();
        Self {
            baseline,
            collected: HashSet::new(),
        }
    }

    /// Returns the agents whose score rose above their baseline for the first time.
    fn observe(&mut self, snapshot: &LobbySnapshot) -> Vec<AgentId> {
        let mut newly = Vec::new();
        for (agent_id, baseline) in &self.baseline {
            if self.collected.contains(agent_id) {
                continue;
            }
            if snapshot
                .player(agent_id)
                .is_some_and(|player| player.score > *baseline)
            {
                self.collected.insert(agent_id.clone());
                newly.push(agent_id.clone());
            }
        }
        newly.sort();
        newly
    }

    fn has_collected(&self, agent_id: &str) -> bool {
        self.collected.contains(agent_id)
    }

    fn is_complete(&self) -> bool {
        self.collected.len() == self.baseline.len()
    }
}

/// Opposite corners for the first and second seat.
fn drift_corner(seat_index: usize, grid: GridSize) -> Position {
    if seat_index == 0 {
        Position::new(0, 0)
    } else {
        Position::new(grid.width - 1, grid.height - 1)
    }
}

/// One input per pending agent: toward its strictly assigned coin, or toward
/// its corner while coins are short.
fn plan_duo_moves(
    snapshot: &LobbySnapshot,
    pending: &[(usize, AgentId)],
) -> Vec<(AgentId, Direction)> {
    let positioned: Vec<(AgentId, Position)> = pending
        .iter()
        .filter_map(|(_, agent_id)| {
            snapshot
                .player(agent_id)
                .map(|player| (agent_id.clone(), player.position))
        })
        .collect();
    let assignments = assign_targets(&positioned, &snapshot.coins, false);

    pending
        .iter()
        .filter_map(|(seat_index, agent_id)| {
            let position = snapshot.player(agent_id)?.position;
            let target = assignments
                .get(agent_id)
                .map_or_else(|| drift_corner(*seat_index, snapshot.grid), |a| a.position);
            Some((agent_id.clone(), rank_directions(position, target)[0]))
        })
        .collect()
}

fn sent_tx_hashes(lobby_id: &str, items: &[SentPayoutItem]) -> Result<Vec<String>> {
    let hashes: Vec<String> = items.iter().filter_map(|item| item.tx_hash.clone()).collect();
    if hashes.is_empty() {
        return Err(E2eError::PayoutFailed {
            lobby_id: lobby_id.to_string(),
            reason: "payout sent but no tx_hash recorded".to_string(),
        });
    }
    Ok(hashes)
}

/// Expected wei per lowercased payout address.
fn expected_payouts(items: &[SentPayoutItem]) -> Result<HashMap<String, u128>> {
    let mut expected = HashMap::new();
    for item in items {
        let wei = parse_quai_amount(&item.amount_quai)?;
        *expected
            .entry(item.payout_address.to_lowercase())
            .or_insert(0) += wei;
    }
    Ok(expected)
}

fn balance_increased(before: u128, after: u128, expected: u128) -> bool {
    after.saturating_sub(before) >= expected.max(1)
}
