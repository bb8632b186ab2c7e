//! Build metadata embedded by `build.rs`, reported by `onionkeeper version`.

use std::fmt;

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit hash, or `unknown` outside a git checkout.
pub const GIT_HASH: &str = env!("ONIONKEEPER_GIT_HASH");

/// Seconds since the Unix epoch.
pub const BUILD_TIMESTAMP: &str = env!("ONIONKEEPER_BUILD_TIMESTAMP");

/// `debug` or `release`.
pub const BUILD_PROFILE: &str = env!("ONIONKEEPER_BUILD_PROFILE");

/// Everything recorded about the running build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub profile: &'static str,
    pub built_at: u64,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            profile: BUILD_PROFILE,
            built_at: BUILD_TIMESTAMP.parse().unwrap_or(0),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, built at {})",
            self.version, self.git_hash, self.profile, self.built_at
        )
    }
}

/// One-line version, e.g. `0.1.0 (abc1234, debug, built at 1760745600)`.
pub fn version_string() -> String {
    BuildInfo::current().to_string()
}
