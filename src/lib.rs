pub mod api;
pub mod chain;
pub mod config;
pub mod constants;
pub mod duo;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod pow;
pub mod rng;
pub mod snapshot;
pub mod types;
