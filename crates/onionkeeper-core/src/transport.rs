//! Transport-plugin provisioning.
//!
//! The plugins run outside this crate; all the option builder needs is the
//! local SOCKS endpoint of the plugin serving a given bridge family. A
//! [`TransportProvisioner`] answers that question. The implementation is
//! chosen from configuration rather than compiled in per platform.

use std::sync::Arc;

use onionkeeper_config::TransportConfig;

/// Which plugin a bridge mode needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Serves the built-in and user-supplied bridge lines.
    Primary,
    /// Serves the single fallback bridge.
    Alternate,
}

/// A transport plugin reachable on the loopback interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEndpoint {
    /// Transport name as it appears at the start of bridge lines.
    pub name: String,
    pub port: u16,
}

impl TransportEndpoint {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// Value of the `ClientTransportPlugin` option for this endpoint.
    pub fn plugin_line(&self) -> String {
        format!("{} socks5 127.0.0.1:{}", self.name, self.port)
    }
}

/// Supplies plugin endpoints to the option builder.
pub trait TransportProvisioner: Send + Sync {
    /// Human-readable name (e.g. "static", "none").
    fn name(&self) -> &str;

    /// Endpoint for `kind`, or `None` if no plugin is available for it.
    fn endpoint(&self, kind: TransportKind) -> Option<TransportEndpoint>;
}

/// Plugins listening on fixed, pre-configured ports.
#[derive(Debug, Clone)]
pub struct StaticPorts {
    primary: TransportEndpoint,
    alternate: TransportEndpoint,
}

impl StaticPorts {
    pub fn new(primary: TransportEndpoint, alternate: TransportEndpoint) -> Self {
        Self { primary, alternate }
    }
}

impl TransportProvisioner for StaticPorts {
    fn name(&self) -> &str {
        "static"
    }

    fn endpoint(&self, kind: TransportKind) -> Option<TransportEndpoint> {
        Some(match kind {
            TransportKind::Primary => self.primary.clone(),
            TransportKind::Alternate => self.alternate.clone(),
        })
    }
}

/// No plugins at all. Every bridge mode degrades to a direct connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransports;

impl TransportProvisioner for NoTransports {
    fn name(&self) -> &str {
        "none"
    }

    fn endpoint(&self, _kind: TransportKind) -> Option<TransportEndpoint> {
        None
    }
}

/// Select the provisioner named by `transports.provisioner`.
pub fn provisioner_from_config(config: &TransportConfig) -> Arc<dyn TransportProvisioner> {
    match config.provisioner.as_str() {
        "none" => Arc::new(NoTransports),
        _ => Arc::new(StaticPorts::new(
            TransportEndpoint::new(&config.primary_name, config.primary_port),
            TransportEndpoint::new(&config.alternate_name, config.alternate_port),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_line() {
        let ep = TransportEndpoint::new("obfs4", 47351);
        assert_eq!(ep.plugin_line(), "obfs4 socks5 127.0.0.1:47351");
    }

    #[test]
    fn test_static_from_config() {
        let provisioner = provisioner_from_config(&TransportConfig::default());
        assert_eq!(provisioner.name(), "static");
        let alt = provisioner.endpoint(TransportKind::Alternate).unwrap();
        assert_eq!(alt.name, "snowflake");
        assert_eq!(alt.port, 47352);
    }

    #[test]
    fn test_none_from_config() {
        let config = TransportConfig {
            provisioner: "none".to_string(),
            ..TransportConfig::default()
        };
        let provisioner = provisioner_from_config(&config);
        assert_eq!(provisioner.name(), "none");
        assert!(provisioner.endpoint(TransportKind::Primary).is_none());
    }
}
