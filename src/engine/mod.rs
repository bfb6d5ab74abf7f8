//! Per-cycle decision logic: coin assignment, movement and lobby liveness.
//!
//! Nothing in here performs I/O. The orchestrator feeds snapshots in and
//! sends the resulting directions out.

pub mod assignment;
pub mod liveness;
pub mod movement;

mod utils;

pub use self::assignment::{assign_targets, Assignment};
pub use self::liveness::{LivenessMonitor, Progress};
pub use self::movement::{choose_direction, rank_directions, AgentMotion, MoveContext, Patrol};
