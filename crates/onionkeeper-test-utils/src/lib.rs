#![deny(unsafe_code)]

//! Shared test utilities for the onionkeeper workspace.
//!
//! Provides config builders, a scripted fake daemon, and tracing helpers so
//! that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! onionkeeper-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod tracing_setup;

pub use config::{TestConfigBuilder, TestEnv};
pub use daemon::{FakeDaemon, FakeDaemonScript, eventually};
pub use tracing_setup::{init_test_tracing, init_test_tracing_with};
