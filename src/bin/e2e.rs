use clap::Parser;
use qlympics_e2e::api::ApiClient;
use qlympics_e2e::chain::ChainClient;
use qlympics_e2e::config::{Cli, Command, DuoArgs, GlobalArgs, ScaleArgs, SnapshotSource};
use qlympics_e2e::duo::DuoScenario;
use qlympics_e2e::error::Result;
use qlympics_e2e::ledger::{LobbyLedger, PgLedger};
use qlympics_e2e::logging;
use qlympics_e2e::orchestrator::{Orchestrator, RunSummary};
use qlympics_e2e::snapshot::{AnySnapshotStore, HttpSnapshotStore, RedisSnapshotStore};
use std::io;
use std::path::Path;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = logging::init(cli.global.log_format, cli.global.log_moves) {
        eprintln!("e2e failed: {error}");
        std::process::exit(1);
    }

    if let Err(error) = run(cli).await {
        error!(error = %error, "run_failed");
        eprintln!("e2e failed: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    let api = ApiClient::new(&global.api_url, global.http_timeout()?)?;
    info!(api_url = %global.api_url, "health_check");
    let health = api.health().await?;
    info!(status = %health, "health_ok");

    let ledger = PgLedger::connect(&global.database_url).await?;
    let store = snapshot_store(&global, &api)?;

    match cli.command {
        Command::Scale(args) => run_scale(&global, &args, api, store, ledger).await,
        Command::Duo(args) => run_duo(&global, &args, &api, &store, &ledger).await,
    }
}

fn snapshot_store(global: &GlobalArgs, api: &ApiClient) -> Result<AnySnapshotStore> {
    Ok(match global.snapshot_source {
        SnapshotSource::Redis => {
            AnySnapshotStore::Redis(RedisSnapshotStore::from_url(&global.redis_url)?)
        }
        SnapshotSource::Http => AnySnapshotStore::Http(HttpSnapshotStore::new(api.clone())),
    })
}

async fn run_scale(
    global: &GlobalArgs,
    args: &ScaleArgs,
    api: ApiClient,
    store: AnySnapshotStore,
    ledger: PgLedger,
) -> Result<()> {
    let game_mode_id = ledger.create_game_mode(&args.game_mode()).await?;
    let options = args.options(global, game_mode_id)?;
    let mut orchestrator = Orchestrator::new(api, store, ledger, options);
    let summary = orchestrator.run().await?;

    let mut summary_out_written: Option<String> = None;
    if let Some(path) = args.summary_out.as_ref() {
        write_summary(path, &summary)?;
        summary_out_written = Some(path.to_string_lossy().to_string());
    }
    for lobby in &summary.lobbies {
        info!(
            lobby_id = %lobby.lobby_id,
            watch_code = lobby.watch_code.as_deref().unwrap_or(""),
            coins = lobby.results.as_ref().map_or(0, |r| r.total_coins),
            payout_id = lobby.payout_id.as_deref().unwrap_or(""),
            sent = lobby.sent,
            failed = lobby.failed,
            failed_inputs = lobby.failed_inputs,
            "lobby_summary"
        );
    }
    info!(
        lobbies = summary.lobby_count,
        finished = summary.finished,
        result_mismatches = summary.result_mismatches,
        total_coins = summary.total_coins,
        payouts_sent = summary.payouts_sent,
        payouts_failed = summary.payouts_failed,
        inputs_sent = summary.inputs_sent,
        inputs_failed = summary.inputs_failed,
        elapsed_ms = summary.elapsed_ms,
        summary_out = summary_out_written.as_deref().unwrap_or(""),
        "run_finished"
    );
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

async fn run_duo(
    global: &GlobalArgs,
    args: &DuoArgs,
    api: &ApiClient,
    store: &AnySnapshotStore,
    ledger: &PgLedger,
) -> Result<()> {
    let options = args.options(global)?;
    let chain = if options.skip_chain {
        None
    } else {
        Some(ChainClient::new(&global.rpc_url, global.http_timeout()?)?)
    };
    let report = DuoScenario::new(api, ledger, store, chain.as_ref(), options)
        .run()
        .await?;
    info!(
        lobby_id = %report.lobby_id,
        payout_id = %report.payout_id,
        sent = report.sent,
        failed = report.failed,
        transactions = report.tx_hashes.len(),
        chain_verified = report.chain_verified,
        "run_finished"
    );
    Ok(())
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let summary_text = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, summary_text)
}
