//! `flywheel-core` — configuration and shared defaults for the flywheel
//! task-queue workspace.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, FlywheelConfig, SchedulerConfig};
pub use error::{CoreError, Result};
