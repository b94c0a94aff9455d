//! Application configuration, loaded once at startup from a TOML file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::overlay::protocol::{PeerIdentity, DEFAULT_MAX_MSG_SIZE};

fn default_ttl() -> u64 {
    7200
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rendezvous_port() -> u16 {
    7000
}

fn default_discover_interval() -> u64 {
    30
}

fn default_ttl_warning_treshold() -> u64 {
    60
}

fn default_register_retry_attempts() -> u32 {
    3
}

fn default_register_backoff_base() -> u64 {
    2
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_ack_timeout() -> u64 {
    5
}

fn default_max_msg_size() -> usize {
    DEFAULT_MAX_MSG_SIZE
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_backoff_base() -> u64 {
    2
}

fn default_ping_interval() -> u64 {
    5
}

fn default_max_ping_failures() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub peer: PeerConfig,
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub peer_connection: PeerConnectionConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub message_router: MessageRouterConfig,
}

/// Identity of the local peer and the TTL it asks the directory for.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub namespace: String,
    pub port: u16,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendezvousConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_rendezvous_port")]
    pub port: u16,
    /// Seconds between automatic DISCOVER passes.
    #[serde(default = "default_discover_interval")]
    pub discover_interval: u64,
    /// Seconds before TTL expiry at which re-registration is triggered.
    #[serde(default = "default_ttl_warning_treshold")]
    pub ttl_warning_treshold: u64,
    #[serde(default = "default_register_retry_attempts")]
    pub register_retry_attempts: u32,
    #[serde(default = "default_register_backoff_base")]
    pub register_backoff_base: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_rendezvous_port(),
            discover_interval: default_discover_interval(),
            ttl_warning_treshold: default_ttl_warning_treshold(),
            register_retry_attempts: default_register_retry_attempts(),
            register_backoff_base: default_register_backoff_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout(),
            ack_timeout: default_ack_timeout(),
            max_msg_size: default_max_msg_size(),
        }
    }
}

/// Immediate retry policy for one outbound dial attempt. The longer-term
/// per-peer backoff lives in the overlay controller's failure table.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConnectionConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_max_ping_failures")]
    pub max_ping_failures: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            max_ping_failures: default_max_ping_failures(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRouterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MessageRouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    pub const MIN_TTL: u64 = 1;
    pub const MAX_TTL: u64 = 86400;

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
        Ok(config)
    }

    /// Check everything the rest of the system assumes about the loaded tree.
    pub fn validate(&self) -> Result<()> {
        PeerIdentity::new(&self.peer.name, &self.peer.namespace)
            .context("invalid [peer] name/namespace")?;

        if self.peer.port == 0 {
            bail!("[peer] port must be between 1 and 65535");
        }

        if !(Self::MIN_TTL..=Self::MAX_TTL).contains(&self.peer.ttl) {
            bail!(
                "[peer] ttl must be between {} and {} seconds",
                Self::MIN_TTL,
                Self::MAX_TTL
            );
        }

        // Without this the re-registration loop could fire on every wake-up.
        if self.peer.ttl <= 2 * self.rendezvous.ttl_warning_treshold {
            bail!(
                "[peer] ttl ({}s) must be greater than twice the rendezvous \
                 ttl_warning_treshold ({}s)",
                self.peer.ttl,
                self.rendezvous.ttl_warning_treshold
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
            [peer]
            name = "alice"
            namespace = "cic"
            port = 9101
        "#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(minimal()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.peer.ttl, 7200);
        assert_eq!(config.rendezvous.host, "127.0.0.1");
        assert_eq!(config.rendezvous.discover_interval, 30);
        assert_eq!(config.network.max_msg_size, 32768);
        assert_eq!(config.keepalive.max_ping_failures, 3);
        assert_eq!(config.message_router.max_retries, 2);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
                [peer]
                name = "bob"
                namespace = "mat"
                port = 9102
                ttl = 300

                [rendezvous]
                host = "rdzv.example.net"
                port = 4000
                ttl_warning_treshold = 60

                [network]
                ack_timeout = 1
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.rendezvous.host, "rdzv.example.net");
        assert_eq!(config.peer.ttl, 300);
        assert_eq!(config.network.ack_timeout, 1);
        // Unlisted sections still fall back wholesale.
        assert_eq!(config.peer_connection.retry_attempts, 2);
    }

    #[test]
    fn ttl_must_clear_twice_the_warning_threshold() {
        let config: Config = toml::from_str(
            r#"
                [peer]
                name = "carol"
                namespace = "cic"
                port = 9103
                ttl = 120

                [rendezvous]
                ttl_warning_treshold = 60
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn identity_and_port_are_validated() {
        let mut config: Config = toml::from_str(minimal()).unwrap();
        config.peer.name = "with@at".into();
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(minimal()).unwrap();
        config.peer.ttl = 0;
        assert!(config.validate().is_err());
    }
}
