//! Recursive estimation of unobserved physical parameters from live sensor
//! and control streams.

mod millis;
mod rollout;
mod signals;
mod ssid;
mod vector_log;

pub use millis::time_since_epoch_millis;
pub use rollout::{ForceReplay, Optimizer, Problem, Solution, TrajectoryRollout};
pub use signals::block_termination_signals;
pub use ssid::{InferListener, InitialPosEstimator, Ssid, SsidParams};
pub use vector_log::VectorLog;
