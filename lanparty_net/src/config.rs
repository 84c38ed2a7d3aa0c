// Session configuration.
//
// `NetConfig` carries every tunable of the transport: ports, bind address,
// advertised name, client cap, and the timing knobs of the blocking loops.
// Defaults match a small LAN session (reliable 8080, unreliable 8081,
// discovery 53000, four clients). A config can be loaded from TOML; missing
// keys fall back to the defaults, and the CLI overlays its flags on top.
//
// Port 0 is accepted everywhere and means "let the OS pick", which the tests
// rely on. When the reliable port is 0 the unreliable port is also
// ephemeral instead of "reliable + 1".

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

pub const DEFAULT_RELIABLE_PORT: u16 = 8080;
pub const DEFAULT_DISCOVERY_PORT: u16 = 53000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    pub reliable_port: u16,
    /// Explicit unreliable port. `None` means reliable port + 1.
    pub unreliable_port: Option<u16>,
    pub discovery_port: u16,
    pub bind_address: IpAddr,
    /// Name advertised in discovery replies.
    pub display_name: String,
    /// Address advertised in discovery replies. Empty lets the discovering
    /// side use the reply's source address.
    pub advertise_address: String,
    pub max_clients: usize,
    pub discovery_window_ms: u64,
    /// Where discovery probes are sent.
    pub discovery_target: IpAddr,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// How often blocking loops wake up to check for cancellation.
    pub poll_interval_ms: u64,
    /// How many times a client repeats its unreliable-address announcement.
    pub announce_attempts: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            reliable_port: DEFAULT_RELIABLE_PORT,
            unreliable_port: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            display_name: default_display_name(),
            advertise_address: String::new(),
            max_clients: 4,
            discovery_window_ms: 3000,
            discovery_target: IpAddr::V4(Ipv4Addr::BROADCAST),
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            poll_interval_ms: 50,
            announce_attempts: 3,
        }
    }
}

/// The machine's host name, or `"lanparty-host"` if it cannot be read.
fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "lanparty-host".into())
}

impl NetConfig {
    /// Parse a TOML document. Unknown keys are rejected.
    pub fn from_toml_str(text: &str) -> Result<Self, NetError> {
        let config: NetConfig =
            toml::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, NetError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NetError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.max_clients == 0 {
            return Err(NetError::Config("max_clients must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(NetError::Config("poll_interval_ms must be positive".into()));
        }
        if self.handshake_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(NetError::Config("timeouts must be positive".into()));
        }
        if self.reliable_port == u16::MAX && self.unreliable_port.is_none() {
            return Err(NetError::Config(
                "reliable_port leaves no room for the unreliable port".into(),
            ));
        }
        Ok(())
    }

    /// The unreliable port paired with a given reliable port.
    pub fn unreliable_port_for(&self, reliable_port: u16) -> u16 {
        match self.unreliable_port {
            Some(port) => port,
            None if reliable_port == 0 => 0,
            None => reliable_port.saturating_add(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.unreliable_port_for(config.reliable_port), 8081);
    }

    #[test]
    fn default_name_is_machine_host_name() {
        let expected = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "lanparty-host".into());
        assert_eq!(NetConfig::default().display_name, expected);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = NetConfig::from_toml_str(
            r#"
            reliable_port = 9000
            display_name = "attic"
            max_clients = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.reliable_port, 9000);
        assert_eq!(config.unreliable_port_for(9000), 9001);
        assert_eq!(config.display_name, "attic");
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn explicit_unreliable_port_wins() {
        let config = NetConfig::from_toml_str("unreliable_port = 7000").unwrap();
        assert_eq!(config.unreliable_port_for(8080), 7000);
    }

    #[test]
    fn ephemeral_reliable_port_gives_ephemeral_unreliable() {
        let config = NetConfig::default();
        assert_eq!(config.unreliable_port_for(0), 0);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(matches!(
            NetConfig::from_toml_str("max_clients = 0"),
            Err(NetError::Config(_))
        ));
        assert!(matches!(
            NetConfig::from_toml_str("poll_interval_ms = 0"),
            Err(NetError::Config(_))
        ));
        assert!(matches!(
            NetConfig::from_toml_str("reliable_port = \"eighty\""),
            Err(NetError::Config(_))
        ));
        assert!(matches!(
            NetConfig::from_toml_str("relaible_port = 1"),
            Err(NetError::Config(_))
        ));
    }
}
