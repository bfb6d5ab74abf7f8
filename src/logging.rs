use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::error::{E2eError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

const MOVE_DIRECTIVES: [&str; 2] = [
    "qlympics_e2e::orchestrator::lobby=debug",
    "qlympics_e2e::duo=debug",
];

/// Builds the filter: `RUST_LOG` when set and valid, `info` otherwise.
/// `log_moves` raises the per-move planners to `debug`.
pub fn env_filter(log_moves: bool) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_moves {
        for directive in MOVE_DIRECTIVES {
            let directive = directive
                .parse::<Directive>()
                .map_err(|error| E2eError::Config(format!("log directive {directive}: {error}")))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Installs the global subscriber. Events go to stderr so stdout stays free
/// for the run summary.
pub fn init(format: LogFormat, log_moves: bool) -> Result<()> {
    let filter = env_filter(log_moves)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|error| E2eError::Config(format!("logging already initialised: {error}")))
}
