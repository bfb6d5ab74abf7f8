//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it. Parsed arguments are turned into plain option structs so
//! the library never depends on clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::constants::{
    DEFAULT_API_URL, DEFAULT_DATABASE_URL, DEFAULT_PAYOUT_ADDRESS_A, DEFAULT_PAYOUT_ADDRESS_B,
    DEFAULT_REDIS_URL, DEFAULT_RPC_URL, POW_MAX_ITERS,
};
use crate::duo::DuoOptions;
use crate::error::{E2eError, Result};
use crate::logging::LogFormat;
use crate::orchestrator::payout::PayoutMode;
use crate::orchestrator::OrchestratorOptions;
use crate::types::GameModeSpec;

#[derive(Parser, Debug)]
#[command(author, version, about = "End-to-end load driver for the coin runner game")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fill many lobbies with agents and drive them until payout.
    Scale(ScaleArgs),
    /// Two agents, one coin each, payout verified on chain.
    Duo(DuoArgs),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SnapshotSource {
    #[default]
    Redis,
    Http,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    #[arg(long, env = "API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
    #[arg(long, env = "E2E_SNAPSHOT_SOURCE", value_enum, default_value_t = SnapshotSource::Redis)]
    pub snapshot_source: SnapshotSource,
    #[arg(long, env = "QUAI_RPC_URL", default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,
    #[arg(long, env = "POW_MAX_ITERS", default_value_t = POW_MAX_ITERS)]
    pub pow_max_iters: u64,
    #[arg(long, env = "E2E_HTTP_TIMEOUT_SEC", default_value_t = 180.0)]
    pub http_timeout_secs: f64,
    #[arg(long, env = "E2E_TICK_STALL_SEC", default_value_t = 3.0)]
    pub tick_stall_secs: f64,
    #[arg(long, env = "E2E_AGENT_PAYOUT_ADDRESS", default_value = DEFAULT_PAYOUT_ADDRESS_A)]
    pub payout_address_a: String,
    #[arg(long, env = "E2E_AGENT2_PAYOUT_ADDRESS", default_value = DEFAULT_PAYOUT_ADDRESS_B)]
    pub payout_address_b: String,
    #[arg(long, env = "E2E_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
    /// Log every planned move at debug level.
    #[arg(long, env = "E2E_LOG_MOVES", value_parser = FalseyValueParser::new())]
    pub log_moves: bool,
}

impl GlobalArgs {
    pub fn http_timeout(&self) -> Result<Duration> {
        seconds("http timeout", self.http_timeout_secs)
    }

    pub fn tick_stall(&self) -> Result<Duration> {
        seconds("tick stall", self.tick_stall_secs)
    }

    fn payout_addresses(&self) -> [String; 2] {
        [self.payout_address_a.clone(), self.payout_address_b.clone()]
    }
}

#[derive(Args, Debug)]
pub struct ScaleArgs {
    #[arg(long, env = "E2E_SCALE_LOBBIES", default_value_t = 10)]
    pub lobbies: usize,
    #[arg(long, env = "E2E_SCALE_PLAYERS_PER_LOBBY", default_value_t = 10)]
    pub players_per_lobby: usize,
    #[arg(long, env = "E2E_SCALE_FILL_SECONDS", default_value_t = 300.0)]
    pub fill_secs: f64,
    #[arg(long, env = "E2E_SCALE_DURATION_SEC", default_value_t = 60)]
    pub duration_secs: u32,
    #[arg(long, env = "E2E_SCALE_COINS_PER_MATCH", default_value_t = 10)]
    pub coins_per_match: u32,
    #[arg(long, env = "E2E_SCALE_REWARD_POOL_QUAI", default_value = "10")]
    pub reward_pool_quai: String,
    /// Call `POST /payouts/execute` for each finished lobby.
    #[arg(long, env = "E2E_SCALE_EXECUTE_PAYOUTS", value_parser = FalseyValueParser::new())]
    pub execute_payouts: bool,
    /// The API's payout worker sends transfers on its own.
    #[arg(long, env = "AUTO_PAYOUTS_ENABLED", value_parser = FalseyValueParser::new())]
    pub auto_payouts: bool,
    #[arg(long, env = "E2E_SCALE_INPUT_EVERY_TICKS", default_value_t = 1)]
    pub input_every_ticks: u64,
    /// Defaults to every seat.
    #[arg(long, env = "E2E_SCALE_RUNNERS_PER_LOBBY")]
    pub runners_per_lobby: Option<usize>,
    #[arg(long, env = "E2E_SCALE_POLL_MS", default_value_t = 250)]
    pub poll_ms: u64,
    #[arg(long, env = "E2E_SCALE_FINISH_GRACE_SEC", default_value_t = 180.0)]
    pub finish_grace_secs: f64,
    #[arg(long, env = "E2E_PAYOUT_WAIT_SEC", default_value_t = 30.0)]
    pub payout_wait_secs: f64,
    #[arg(long, env = "E2E_PAYOUT_EXEC_WAIT_SEC", default_value_t = 45.0)]
    pub payout_exec_wait_secs: f64,
    #[arg(long, env = "E2E_SCALE_SEED")]
    pub seed: Option<u32>,
    #[arg(long)]
    pub summary_out: Option<PathBuf>,
}

impl ScaleArgs {
    pub fn payout_mode(&self) -> PayoutMode {
        match (self.execute_payouts, self.auto_payouts) {
            (false, _) => PayoutMode::DryRun,
            (true, true) => PayoutMode::AutoWorker,
            (true, false) => PayoutMode::Manual,
        }
    }

    pub fn game_mode(&self) -> GameModeSpec {
        GameModeSpec {
            max_players: u32::try_from(self.players_per_lobby).unwrap_or(u32::MAX),
            duration_sec: self.duration_secs,
            coins_per_match: self.coins_per_match,
            reward_pool_quai: self.reward_pool_quai.clone(),
        }
    }

    pub fn options(&self, global: &GlobalArgs, game_mode_id: String) -> Result<OrchestratorOptions> {
        if self.lobbies == 0 || self.players_per_lobby == 0 {
            return Err(E2eError::Config(
                "lobbies and players per lobby must be positive".to_string(),
            ));
        }
        if self.input_every_ticks == 0 {
            return Err(E2eError::Config(
                "input every ticks must be at least 1".to_string(),
            ));
        }
        Ok(OrchestratorOptions {
            game_mode_id,
            lobbies: self.lobbies,
            players_per_lobby: self.players_per_lobby,
            runners_per_lobby: self
                .runners_per_lobby
                .unwrap_or(self.players_per_lobby)
                .clamp(1, self.players_per_lobby),
            fill: seconds("fill", self.fill_secs)?,
            match_duration: Duration::from_secs(u64::from(self.duration_secs)),
            finish_grace: seconds("finish grace", self.finish_grace_secs)?,
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            input_every_ticks: self.input_every_ticks,
            tick_stall: global.tick_stall()?,
            payout_mode: self.payout_mode(),
            payout_wait: seconds("payout wait", self.payout_wait_secs)?,
            payout_exec_wait: seconds("payout exec wait", self.payout_exec_wait_secs)?,
            coins_per_match: self.coins_per_match,
            payout_addresses: global.payout_addresses(),
            pow_max_iters: global.pow_max_iters,
            seed: self.seed,
            ..OrchestratorOptions::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct DuoArgs {
    #[arg(long, env = "E2E_GAME_DURATION_SEC", default_value_t = 10)]
    pub game_duration_secs: u64,
    #[arg(long, env = "E2E_REWARD_POOL", default_value = "1")]
    pub reward_pool_quai: String,
    #[arg(long, env = "E2E_COIN_WAIT_SEC", default_value_t = 10.0)]
    pub coin_wait_secs: f64,
    #[arg(long, env = "E2E_MOVE_TIMEOUT_SEC", default_value_t = 20.0)]
    pub move_timeout_secs: f64,
    #[arg(long, env = "E2E_FINISH_WAIT_SEC", default_value_t = 20.0)]
    pub finish_wait_secs: f64,
    #[arg(long, env = "E2E_PAYOUT_WAIT_SEC", default_value_t = 30.0)]
    pub payout_wait_secs: f64,
    #[arg(long, env = "E2E_TX_WAIT_SEC", default_value_t = 60.0)]
    pub tx_wait_secs: f64,
    #[arg(long, env = "E2E_BALANCE_WAIT_SEC", default_value_t = 90.0)]
    pub balance_wait_secs: f64,
    /// Stop after the payout record exists; no execute call and no chain reads.
    #[arg(long, env = "E2E_SKIP_CHAIN", value_parser = FalseyValueParser::new())]
    pub skip_chain: bool,
}

impl DuoArgs {
    pub fn options(&self, global: &GlobalArgs) -> Result<DuoOptions> {
        Ok(DuoOptions {
            game_duration: Duration::from_secs(self.game_duration_secs),
            reward_pool_quai: self.reward_pool_quai.clone(),
            coin_wait: seconds("coin wait", self.coin_wait_secs)?,
            move_timeout: seconds("move timeout", self.move_timeout_secs)?,
            finish_wait: seconds("finish wait", self.finish_wait_secs)?,
            payout_wait: seconds("payout wait", self.payout_wait_secs)?,
            tx_wait: seconds("tx wait", self.tx_wait_secs)?,
            balance_wait: seconds("balance wait", self.balance_wait_secs)?,
            tick_stall: global.tick_stall()?,
            skip_chain: self.skip_chain,
            payout_addresses: global.payout_addresses(),
            pow_max_iters: global.pow_max_iters,
        })
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        E2eError::Config(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        ))
    })
}
