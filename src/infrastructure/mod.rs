//! Infrastructure layer
//!
//! Configuration loading and log setup for the agent process.

pub mod config;
pub mod logging;

pub use config::{AgentConfig, ConfigError, ConfigOverrides};
pub use logging::init_logging;
