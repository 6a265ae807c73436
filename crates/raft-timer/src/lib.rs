//! # raft-timer
//!
//! why: drive election, heartbeat and liveness timeouts without one os timer per task
//! relations: used by raft-core's runtime, which posts timer events back onto a peer's queue
//! what: Wheel (slot placement), TimingWheel (driver thread + worker pool), TaskHandle

mod driver;
mod task;
mod wheel;

pub use driver::{TimingWheel, WheelConfig};
pub use task::TaskHandle;
