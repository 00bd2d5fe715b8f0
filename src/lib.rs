pub mod config;
pub mod core;

// Re-export main components for easy access
pub use config::{ConfigError, HarnessConfig, TimeoutConfig};
pub use core::*;
