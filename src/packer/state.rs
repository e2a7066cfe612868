//! Per-shard state machine tags — §4.9.
//!
//! ```text
//! IDLE --try_acquire--> LEASED --open_writer--> PACKING --rollover/flush--> FINALIZING
//!   ^                     |                        |                              |
//!   |                     | renew fails            | error                        | upload ack
//!   |                     v                        v                              v
//!   +----------------- LOST <------- FAILED ------>  (abandon container, release)  COMMITTED -> IDLE
//! ```
//!
//! `ShardPhase` itself carries no behavior; it exists so the control loop's
//! transitions are named instead of implicit, and so metrics/logs can tag
//! events with where in the lifecycle a shard task currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    Idle,
    Leased,
    Packing,
    Finalizing,
    Committed,
    Lost,
    Failed,
}

impl ShardPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ShardPhase::Idle => "idle",
            ShardPhase::Leased => "leased",
            ShardPhase::Packing => "packing",
            ShardPhase::Finalizing => "finalizing",
            ShardPhase::Committed => "committed",
            ShardPhase::Lost => "lost",
            ShardPhase::Failed => "failed",
        }
    }
}
