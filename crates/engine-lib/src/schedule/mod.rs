//! Mode and throttle scheduling
//!
//! This module provides:
//! - Daily wall-clock windows that may wrap past midnight (`window`)
//! - The throttle ladder derived from health telemetry (`throttle`)
//! - The `Scheduler` that selects the active mode and profile (`scheduler`)

mod clock;
mod scheduler;
mod throttle;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::Scheduler;
pub use throttle::{compute_throttle_level, ThrottleLevel};
pub use window::DailyWindow;
