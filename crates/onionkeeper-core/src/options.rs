//! Daemon option generation.
//!
//! [`ConfigBuilder::build`] maps a [`BridgeMode`] and an [`IpCapability`] to an
//! ordered list of [`ConfigOption`]s. The same list is rendered either as
//! startup arguments ([`as_cli_args`]) or as live `SETCONF` assignments
//! ([`as_assignment`]) through [`render`], so ordering is decided in one place.
//!
//! Order of the bridge-related options:
//!
//! ```text
//! ClientTransportPlugin → Bridge… → UseBridges → ClientPreferIPv6ORPort → ClientUseIPv4 → ClientUseIPv6
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use onionkeeper_config::AppConfig;

use crate::transport::{TransportKind, TransportProvisioner};

/// Where bridge lines come from and which plugin carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Direct connection, no bridges.
    #[default]
    None,
    /// Built-in bridge list over the primary transport.
    BuiltInTransport,
    /// User-supplied bridge lines over the primary transport.
    CustomTransport,
    /// Single fixed fallback bridge over the alternate transport.
    AlternateTransport,
}

impl BridgeMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            BridgeMode::None => 0,
            BridgeMode::BuiltInTransport => 1,
            BridgeMode::CustomTransport => 2,
            BridgeMode::AlternateTransport => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgeMode::BuiltInTransport,
            2 => BridgeMode::CustomTransport,
            3 => BridgeMode::AlternateTransport,
            _ => BridgeMode::None,
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMode::None => write!(f, "none"),
            BridgeMode::BuiltInTransport => write!(f, "builtin"),
            BridgeMode::CustomTransport => write!(f, "custom"),
            BridgeMode::AlternateTransport => write!(f, "alternate"),
        }
    }
}

impl FromStr for BridgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BridgeMode::None),
            "builtin" => Ok(BridgeMode::BuiltInTransport),
            "custom" => Ok(BridgeMode::CustomTransport),
            "alternate" => Ok(BridgeMode::AlternateTransport),
            other => Err(format!("unknown bridge mode {other:?}")),
        }
    }
}

/// IP protocol families the current network can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum IpCapability {
    #[default]
    Unknown,
    IPv4Only,
    IPv6Only,
    DualStack,
}

impl IpCapability {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            IpCapability::Unknown => 0,
            IpCapability::IPv4Only => 1,
            IpCapability::IPv6Only => 2,
            IpCapability::DualStack => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => IpCapability::IPv4Only,
            2 => IpCapability::IPv6Only,
            3 => IpCapability::DualStack,
            _ => IpCapability::Unknown,
        }
    }
}

impl fmt::Display for IpCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpCapability::Unknown => write!(f, "unknown"),
            IpCapability::IPv4Only => write!(f, "ipv4"),
            IpCapability::IPv6Only => write!(f, "ipv6"),
            IpCapability::DualStack => write!(f, "dual"),
        }
    }
}

impl FromStr for IpCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(IpCapability::Unknown),
            "ipv4" => Ok(IpCapability::IPv4Only),
            "ipv6" => Ok(IpCapability::IPv6Only),
            "dual" => Ok(IpCapability::DualStack),
            other => Err(format!("unknown IP capability {other:?}")),
        }
    }
}

/// A single daemon option, independent of how it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigOption {
    pub key: String,
    pub value: String,
}

impl ConfigOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Render `options` in order with a caller-supplied function.
pub fn render<I, F>(options: &[ConfigOption], render: F) -> Vec<I::Item>
where
    I: IntoIterator,
    F: FnMut(&ConfigOption) -> I,
{
    options.iter().flat_map(render).collect()
}

/// Startup shape: `--Key value`.
pub fn as_cli_args(option: &ConfigOption) -> [String; 2] {
    [format!("--{}", option.key), option.value.clone()]
}

/// Live shape: a `(key, value)` pair for `SETCONF`.
pub fn as_assignment(option: &ConfigOption) -> Option<(String, String)> {
    Some((option.key.clone(), option.value.clone()))
}

/// Bridge lines available to the builder.
#[derive(Debug, Clone, Default)]
pub struct BridgeSources {
    pub builtin: Vec<String>,
    pub custom: Vec<String>,
    /// Fixed fallback line for [`BridgeMode::AlternateTransport`].
    pub alternate: String,
}

impl BridgeSources {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            builtin: config.bridges.builtin.clone(),
            custom: config.bridges.custom.clone(),
            alternate: config.transports.alternate_bridge.clone(),
        }
    }
}

/// Maps `(BridgeMode, IpCapability)` to daemon options.
pub struct ConfigBuilder<'a> {
    sources: &'a BridgeSources,
    transports: &'a dyn TransportProvisioner,
}

impl<'a> ConfigBuilder<'a> {
    pub fn new(sources: &'a BridgeSources, transports: &'a dyn TransportProvisioner) -> Self {
        Self {
            sources,
            transports,
        }
    }

    /// Build the bridge and IP-preference options for one configuration.
    ///
    /// If no plugin endpoint is available for the requested mode, the
    /// direct-connection options are produced instead. An empty bridge list
    /// still produces the bridge options, leaving the daemon to report that
    /// it has no bridges.
    pub fn build(&self, mode: BridgeMode, ip: IpCapability) -> Vec<ConfigOption> {
        let mut options = Vec::new();
        let effective = self.push_bridge_options(mode, &mut options);
        push_ip_options(effective, ip, &mut options);
        options
    }

    fn push_bridge_options(&self, mode: BridgeMode, options: &mut Vec<ConfigOption>) -> BridgeMode {
        let (kind, lines) = match mode {
            BridgeMode::None => {
                options.push(ConfigOption::new("UseBridges", "0"));
                return BridgeMode::None;
            }
            BridgeMode::BuiltInTransport => (TransportKind::Primary, &self.sources.builtin[..]),
            BridgeMode::CustomTransport => (TransportKind::Primary, &self.sources.custom[..]),
            BridgeMode::AlternateTransport => (
                TransportKind::Alternate,
                std::slice::from_ref(&self.sources.alternate),
            ),
        };

        let Some(endpoint) = self.transports.endpoint(kind) else {
            warn!(
                %mode,
                provisioner = self.transports.name(),
                "No transport plugin available; falling back to a direct connection"
            );
            options.push(ConfigOption::new("UseBridges", "0"));
            return BridgeMode::None;
        };
        let lines: Vec<&String> = lines.iter().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            warn!(%mode, "No bridge lines configured for this mode");
        }

        options.push(ConfigOption::new(
            "ClientTransportPlugin",
            endpoint.plugin_line(),
        ));
        for line in lines {
            options.push(ConfigOption::new("Bridge", line.as_str()));
        }
        options.push(ConfigOption::new("UseBridges", "1"));
        mode
    }
}

fn push_ip_options(mode: BridgeMode, ip: IpCapability, options: &mut Vec<ConfigOption>) {
    if ip == IpCapability::IPv6Only {
        options.push(ConfigOption::new("ClientPreferIPv6ORPort", "1"));
        // Bridge lines may only carry IPv4 addresses, so IPv4 stays on.
        let use_ipv4 = if mode == BridgeMode::None { "0" } else { "1" };
        options.push(ConfigOption::new("ClientUseIPv4", use_ipv4));
    } else {
        options.push(ConfigOption::new("ClientPreferIPv6ORPort", "auto"));
        options.push(ConfigOption::new("ClientUseIPv4", "1"));
    }
    options.push(ConfigOption::new("ClientUseIPv6", "1"));
}

/// Options every daemon launch starts with, before the bridge options.
pub fn startup_options(config: &AppConfig) -> Vec<ConfigOption> {
    let daemon = &config.daemon;
    let mut options = vec![
        ConfigOption::new("DNSPort", "auto"),
        ConfigOption::new("AutomapHostsOnResolve", "1"),
        ConfigOption::new("VirtualAddrNetworkIPv4", "10.192.0.0/10"),
        ConfigOption::new("VirtualAddrNetworkIPv6", "[FC00::]/7"),
        ConfigOption::new("LogMessageDomains", "1"),
        ConfigOption::new("SafeLogging", "1"),
        ConfigOption::new("SocksPort", "auto"),
    ];
    if let Some(path) = &daemon.geoip_file {
        options.push(ConfigOption::new("GeoIPFile", path.display().to_string()));
    }
    if let Some(path) = &daemon.geoip6_file {
        options.push(ConfigOption::new("GeoIPv6File", path.display().to_string()));
    }
    options.extend([
        ConfigOption::new("ClientOnly", "1"),
        ConfigOption::new("AvoidDiskWrites", "1"),
        ConfigOption::new(
            "MaxMemInQueues",
            format!("{} MB", daemon.max_mem_in_queues_mb),
        ),
        ConfigOption::new("CookieAuthentication", "1"),
        ConfigOption::new("CookieAuthFile", config.cookie_file().display().to_string()),
        ConfigOption::new("ControlPort", "auto"),
        ConfigOption::new(
            "ControlPortWriteToFile",
            config.control_port_file().display().to_string(),
        ),
        ConfigOption::new("DataDirectory", daemon.data_dir.display().to_string()),
    ]);
    if let Some(path) = &daemon.log_file {
        options.push(ConfigOption::new(
            "Log",
            format!("notice file {}", path.display()),
        ));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NoTransports, StaticPorts, TransportEndpoint};
    use pretty_assertions::assert_eq;

    fn sources() -> BridgeSources {
        BridgeSources {
            builtin: vec!["obfs4 1.1.1.1:443 AAA".to_string(), "obfs4 2.2.2.2:443 BBB".to_string()],
            custom: vec!["obfs4 3.3.3.3:443 CCC".to_string()],
            alternate: "snowflake 192.0.2.3:80 DDD".to_string(),
        }
    }

    fn ports() -> StaticPorts {
        StaticPorts::new(
            TransportEndpoint::new("obfs4", 1001),
            TransportEndpoint::new("snowflake", 1002),
        )
    }

    fn pairs(options: &[ConfigOption]) -> Vec<(String, String)> {
        render(options, as_assignment)
    }

    fn kv(key: &str, value: &str) -> (String, String) {
        (key.to_string(), value.to_string())
    }

    #[test]
    fn test_none_dual_stack() {
        let (s, p) = (sources(), ports());
        let options = ConfigBuilder::new(&s, &p).build(BridgeMode::None, IpCapability::DualStack);
        assert_eq!(
            pairs(&options),
            vec![
                kv("UseBridges", "0"),
                kv("ClientPreferIPv6ORPort", "auto"),
                kv("ClientUseIPv4", "1"),
                kv("ClientUseIPv6", "1"),
            ]
        );
    }

    #[test]
    fn test_builtin_ipv6_only() {
        let (s, p) = (sources(), ports());
        let options =
            ConfigBuilder::new(&s, &p).build(BridgeMode::BuiltInTransport, IpCapability::IPv6Only);
        assert_eq!(
            pairs(&options),
            vec![
                kv("ClientTransportPlugin", "obfs4 socks5 127.0.0.1:1001"),
                kv("Bridge", "obfs4 1.1.1.1:443 AAA"),
                kv("Bridge", "obfs4 2.2.2.2:443 BBB"),
                kv("UseBridges", "1"),
                kv("ClientPreferIPv6ORPort", "1"),
                kv("ClientUseIPv4", "1"),
                kv("ClientUseIPv6", "1"),
            ]
        );
    }

    #[test]
    fn test_custom_uses_user_lines() {
        let (s, p) = (sources(), ports());
        let options =
            ConfigBuilder::new(&s, &p).build(BridgeMode::CustomTransport, IpCapability::Unknown);
        let bridges: Vec<_> = options.iter().filter(|o| o.key == "Bridge").collect();
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].value, "obfs4 3.3.3.3:443 CCC");
        assert_eq!(options[0].value, "obfs4 socks5 127.0.0.1:1001");
    }

    #[test]
    fn test_alternate_single_fallback() {
        let (s, p) = (sources(), ports());
        let options =
            ConfigBuilder::new(&s, &p).build(BridgeMode::AlternateTransport, IpCapability::IPv4Only);
        assert_eq!(
            &pairs(&options)[..3],
            &[
                kv("ClientTransportPlugin", "snowflake socks5 127.0.0.1:1002"),
                kv("Bridge", "snowflake 192.0.2.3:80 DDD"),
                kv("UseBridges", "1"),
            ]
        );
    }

    #[test]
    fn test_ordering_for_every_mode() {
        let (s, p) = (sources(), ports());
        let builder = ConfigBuilder::new(&s, &p);
        for mode in [
            BridgeMode::BuiltInTransport,
            BridgeMode::CustomTransport,
            BridgeMode::AlternateTransport,
        ] {
            let options = builder.build(mode, IpCapability::DualStack);
            let position = |key: &str| options.iter().position(|o| o.key == key).unwrap();
            let last_bridge = options.iter().rposition(|o| o.key == "Bridge").unwrap();
            assert_eq!(position("ClientTransportPlugin"), 0, "{mode}");
            assert!(position("Bridge") > position("ClientTransportPlugin"));
            assert!(position("UseBridges") > last_bridge);
            assert_eq!(options.last().unwrap().key, "ClientUseIPv6");
        }
    }

    #[test]
    fn test_ipv4_rule_for_every_capability() {
        let (s, p) = (sources(), ports());
        let builder = ConfigBuilder::new(&s, &p);
        let cases = [
            (IpCapability::Unknown, BridgeMode::None, "auto", "1"),
            (IpCapability::IPv4Only, BridgeMode::None, "auto", "1"),
            (IpCapability::DualStack, BridgeMode::None, "auto", "1"),
            (IpCapability::IPv6Only, BridgeMode::None, "1", "0"),
            (IpCapability::Unknown, BridgeMode::BuiltInTransport, "auto", "1"),
            (IpCapability::IPv4Only, BridgeMode::CustomTransport, "auto", "1"),
            (IpCapability::DualStack, BridgeMode::AlternateTransport, "auto", "1"),
            (IpCapability::IPv6Only, BridgeMode::BuiltInTransport, "1", "1"),
            (IpCapability::IPv6Only, BridgeMode::CustomTransport, "1", "1"),
            (IpCapability::IPv6Only, BridgeMode::AlternateTransport, "1", "1"),
        ];
        for (ip, mode, prefer, use_v4) in cases {
            let options = builder.build(mode, ip);
            let value = |key: &str| {
                options
                    .iter()
                    .find(|o| o.key == key)
                    .map(|o| o.value.clone())
                    .unwrap()
            };
            assert_eq!(value("ClientPreferIPv6ORPort"), prefer, "{mode}/{ip}");
            assert_eq!(value("ClientUseIPv4"), use_v4, "{mode}/{ip}");
            assert_eq!(value("ClientUseIPv6"), "1");
        }
    }

    #[test]
    fn test_missing_plugin_falls_back_to_direct() {
        let s = sources();
        let options = ConfigBuilder::new(&s, &NoTransports)
            .build(BridgeMode::BuiltInTransport, IpCapability::IPv6Only);
        assert_eq!(options[0], ConfigOption::new("UseBridges", "0"));
        assert!(options.iter().all(|o| o.key != "Bridge"));
        assert!(options.contains(&ConfigOption::new("ClientUseIPv4", "0")));
    }

    #[test]
    fn test_empty_custom_list_keeps_bridge_options() {
        let s = BridgeSources {
            custom: vec!["  ".to_string()],
            ..sources()
        };
        let p = ports();
        let options =
            ConfigBuilder::new(&s, &p).build(BridgeMode::CustomTransport, IpCapability::IPv6Only);
        assert_eq!(
            pairs(&options),
            vec![
                kv("ClientTransportPlugin", "obfs4 socks5 127.0.0.1:1001"),
                kv("UseBridges", "1"),
                kv("ClientPreferIPv6ORPort", "1"),
                kv("ClientUseIPv4", "1"),
                kv("ClientUseIPv6", "1"),
            ]
        );
    }

    #[test]
    fn test_render_cli_args() {
        let options = vec![
            ConfigOption::new("UseBridges", "0"),
            ConfigOption::new("ClientUseIPv6", "1"),
        ];
        assert_eq!(
            render(&options, as_cli_args),
            vec!["--UseBridges", "0", "--ClientUseIPv6", "1"]
        );
    }

    #[test]
    fn test_startup_options() {
        let mut config = AppConfig::default();
        config.daemon.data_dir = "/d".into();
        config.daemon.auth_dir = "/a".into();
        config.daemon.log_file = Some("/l/tor.log".into());
        let options = startup_options(&config);

        assert!(options.contains(&ConfigOption::new("ControlPort", "auto")));
        assert!(options.contains(&ConfigOption::new("CookieAuthentication", "1")));
        assert!(options.contains(&ConfigOption::new("DataDirectory", "/d")));
        assert!(options.contains(&ConfigOption::new("MaxMemInQueues", "5 MB")));
        assert!(options.contains(&ConfigOption::new("ControlPortWriteToFile", "/a/control-port")));
        assert_eq!(
            options.last().unwrap(),
            &ConfigOption::new("Log", "notice file /l/tor.log")
        );
        assert!(options.iter().all(|o| o.key != "GeoIPFile"));
    }

    #[test]
    fn test_mode_round_trips_through_u8() {
        for mode in [
            BridgeMode::None,
            BridgeMode::BuiltInTransport,
            BridgeMode::CustomTransport,
            BridgeMode::AlternateTransport,
        ] {
            assert_eq!(BridgeMode::from_u8(mode.to_u8()), mode);
            assert_eq!(mode.to_string().parse::<BridgeMode>().unwrap(), mode);
        }
        assert_eq!("dual".parse::<IpCapability>().unwrap(), IpCapability::DualStack);
        assert!("ipv5".parse::<IpCapability>().is_err());
    }
}
