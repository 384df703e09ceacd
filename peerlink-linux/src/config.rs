//! Load config from file and environment.

use std::path::PathBuf;

use peerlink_core::Multiaddr;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_LISTEN_ADDR, PEERLINK_DISCOVERY_PORT, PEERLINK_LOG, PEERLINK_BOOTSTRAP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default /ip4/0.0.0.0/tcp/45679).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: Multiaddr,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// LAN multicast discovery on/off.
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// Peers dialed at startup.
    #[serde(default)]
    pub bootstrap: Vec<Multiaddr>,
    /// Log filter used when RUST_LOG is unset.
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_listen_addr() -> Multiaddr {
    Multiaddr::tcp(([0, 0, 0, 0], 45679).into())
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_true() -> bool {
    true
}
fn default_log() -> String {
    "info".into()
}
fn default_ping_interval_secs() -> u64 {
    15
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            discovery_port: default_discovery_port(),
            discovery: default_true(),
            bootstrap: Vec::new(),
            log: default_log(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let config = load_file().unwrap_or_default();
    apply_overrides(config, |key| std::env::var(key).ok())
}

/// Apply `PEERLINK_*` overrides looked up through `get`. Unparseable values are ignored.
pub fn apply_overrides(mut c: Config, get: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = get("PEERLINK_LISTEN_ADDR") {
        match s.parse() {
            Ok(addr) => c.listen_addr = addr,
            Err(e) => warn!(value = %s, error = %e, "ignoring PEERLINK_LISTEN_ADDR"),
        }
    }
    if let Some(s) = get("PEERLINK_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = get("PEERLINK_LOG") {
        c.log = s;
    }
    if let Some(s) = get("PEERLINK_BOOTSTRAP") {
        c.bootstrap = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect();
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_addr.to_string(), "/ip4/0.0.0.0/tcp/45679");
        assert_eq!(c.discovery_port, 45678);
        assert!(c.discovery);
        assert!(c.bootstrap.is_empty());
    }

    #[test]
    fn file_fields_and_defaults() {
        let c: Config = toml::from_str(
            r#"
            listen_addr = "/ip4/127.0.0.1/tcp/5000"
            bootstrap = ["/ip4/10.0.0.2/tcp/45679"]
            discovery = false
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr.to_string(), "/ip4/127.0.0.1/tcp/5000");
        assert_eq!(c.bootstrap.len(), 1);
        assert!(!c.discovery);
        assert_eq!(c.ping_interval_secs, 15);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("listen_addr = \"nope\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PEERLINK_LISTEN_ADDR", "/ip4/127.0.0.1/tcp/1"),
            ("PEERLINK_DISCOVERY_PORT", "not a port"),
            ("PEERLINK_LOG", "debug"),
            ("PEERLINK_BOOTSTRAP", "/ip4/10.0.0.1/tcp/2, bogus ,/ip4/10.0.0.3/tcp/4"),
        ]
        .into_iter()
        .collect();
        let c = apply_overrides(Config::default(), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr.to_string(), "/ip4/127.0.0.1/tcp/1");
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.log, "debug");
        assert_eq!(c.bootstrap.len(), 2);
    }
}
