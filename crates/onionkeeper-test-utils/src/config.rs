//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries, and [`TestEnv`] when the
//! config needs real directories to live in.

use std::path::{Path, PathBuf};

use onionkeeper_config::AppConfig;
use tempfile::TempDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// Starts from the defaults with no settle delay and a short connect
/// timeout, so lifecycle tests do not sit idle.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .bridge_mode("custom")
///     .custom_bridges(["obfs4 192.0.2.1:443 FINGERPRINT"])
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.daemon.settle_delay_ms = 0;
        config.daemon.connect_timeout_secs = 5;
        Self { config }
    }

    /// Put the data and auth directories under `root`.
    pub fn dirs_under(mut self, root: &Path) -> Self {
        self.config.daemon.data_dir = root.join("data");
        self.config.daemon.auth_dir = root.join("data").join("auth");
        self
    }

    pub fn bridge_mode(mut self, mode: &str) -> Self {
        self.config.bridges.mode = mode.to_string();
        self
    }

    pub fn custom_bridges<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.bridges.custom = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn provisioner(mut self, name: &str) -> Self {
        self.config.transports.provisioner = name.to_string();
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.daemon.log_file = Some(path.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.daemon.connect_timeout_secs = secs;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A config whose directories live in an owned temp directory.
///
/// The directory is deleted when this value is dropped, even on panic.
pub struct TestEnv {
    pub config: AppConfig,
    temp_dir: TempDir,
}

impl TestEnv {
    /// Default test config in a fresh temp directory.
    pub fn new() -> Self {
        Self::with(TestConfigBuilder::new())
    }

    /// `builder`'s config, with its directories moved into a fresh temp
    /// directory.
    pub fn with(builder: TestConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = builder.dirs_under(temp_dir.path()).build();
        Self { config, temp_dir }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
