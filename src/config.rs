//! Configuration for the Rail Tunnel client.
//!
//! - [`TunnelConfig`] is the validated, immutable session target.
//! - [`Config`] holds saved defaults from `~/.config/rail-tunnel/config.toml`.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::TunnelError;

/// Path on the relay that accepts control connections.
const CONTROL_PATH: &str = "_tunnel/ws/connect";

pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// Where the tunnel forwards to and which relay it registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Scheme, host and port of the local service, without a trailing slash.
    pub local_base_url: String,
    pub local_port: u16,
    /// The relay's public base URL as given by the operator.
    pub relay_url: String,
    control_url: Url,
}

impl TunnelConfig {
    /// `local_port` is expected to be range-checked by the caller.
    pub fn new(local_host: &str, local_port: u16, relay_url: &str) -> Result<Self, TunnelError> {
        let local_base_url = format!("http://{}:{}", local_host, local_port);
        Url::parse(&local_base_url).map_err(|e| TunnelError::InvalidLocalHost {
            host: local_host.to_string(),
            reason: e.to_string(),
        })?;

        let relay = Url::parse(relay_url).map_err(|e| TunnelError::InvalidRelayUrl {
            url: relay_url.to_string(),
            reason: e.to_string(),
        })?;
        if relay.host_str().is_none() {
            return Err(TunnelError::InvalidRelayUrl {
                url: relay_url.to_string(),
                reason: "missing host".to_string(),
            });
        }
        let control_url = control_url(&relay, local_port)?;

        Ok(Self {
            local_base_url,
            local_port,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            control_url,
        })
    }

    /// `ws(s)://<relay-host>/_tunnel/ws/connect?port=<local_port>`
    pub fn control_url(&self) -> &Url {
        &self.control_url
    }
}

/// Mirror `http`/`https` onto `ws`/`wss` and append the control path, keeping
/// any path prefix the relay is mounted under.
fn control_url(relay: &Url, local_port: u16) -> Result<Url, TunnelError> {
    let invalid = |reason: &str| TunnelError::InvalidRelayUrl {
        url: relay.to_string(),
        reason: reason.to_string(),
    };

    let scheme = match relay.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(invalid("scheme must be http, https, ws or wss")),
    };

    let mut url = relay.clone();
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot rewrite scheme"))?;
    let path = format!("{}/{}", url.path().trim_end_matches('/'), CONTROL_PATH);
    url.set_path(&path);
    url.set_fragment(None);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("port", &local_port.to_string());

    Ok(url)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    pub host: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "rail-tunnel")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_control_url_mirrors_scheme() {
        let secure = TunnelConfig::new("localhost", 3000, "https://my-app.railway.app").unwrap();
        assert_eq!(
            secure.control_url().as_str(),
            "wss://my-app.railway.app/_tunnel/ws/connect?port=3000"
        );

        let plain = TunnelConfig::new("localhost", 8080, "http://127.0.0.1:9000/").unwrap();
        assert_eq!(
            plain.control_url().as_str(),
            "ws://127.0.0.1:9000/_tunnel/ws/connect?port=8080"
        );
    }

    #[test]
    fn test_control_url_keeps_path_prefix() {
        let config = TunnelConfig::new("localhost", 3000, "https://relay.dev/tunnels/?x=1").unwrap();
        assert_eq!(
            config.control_url().as_str(),
            "wss://relay.dev/tunnels/_tunnel/ws/connect?port=3000"
        );
    }

    #[test]
    fn test_tunnel_config_urls() {
        let config = TunnelConfig::new("localhost", 3000, "https://my-app.railway.app/").unwrap();
        assert_eq!(config.local_base_url, "http://localhost:3000");
        assert_eq!(config.relay_url, "https://my-app.railway.app");
        assert_eq!(config.local_port, 3000);
    }

    #[test]
    fn test_rejects_bad_relay_url() {
        assert!(matches!(
            TunnelConfig::new("localhost", 3000, "ftp://relay.dev"),
            Err(TunnelError::InvalidRelayUrl { .. })
        ));
        assert!(matches!(
            TunnelConfig::new("localhost", 3000, "relay.dev"),
            Err(TunnelError::InvalidRelayUrl { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_local_host() {
        assert!(matches!(
            TunnelConfig::new("bad host", 3000, "https://relay.dev"),
            Err(TunnelError::InvalidLocalHost { .. })
        ));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            relay: RelayConfig {
                url: Some("https://relay.dev".to_string()),
            },
            local: LocalConfig {
                host: Some("127.0.0.1".to_string()),
            },
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.relay.url.as_deref(), Some("https://relay.dev"));
        assert_eq!(loaded.local.host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_config_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.relay.url.is_none());
        assert!(loaded.local.host.is_none());
    }
}
