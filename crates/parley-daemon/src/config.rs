//! Daemon configuration loaded from environment variables.
//!
//! Delivery tuning lives in [`parley_client::OutboxConfig`]; this only covers
//! where things are stored and what to talk to.

use std::net::SocketAddr;
use std::path::PathBuf;

use directories::ProjectDirs;
use parley_shared::constants::MAX_IMAGE_SIZE;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Holds `parley.db` and the `blobs/` directory.
    /// Env: `PARLEY_DATA_DIR`
    /// Default: the platform data directory, or `./parley-data`.
    pub data_dir: PathBuf,

    /// Base URL of the remote message store.
    /// Env: `PARLEY_REMOTE_URL`
    /// Default: `http://127.0.0.1:8080`
    pub remote_url: String,

    /// Bearer token sent with every remote call.
    /// Env: `PARLEY_REMOTE_TOKEN`
    pub remote_token: Option<String>,

    /// Address probed for reachability.  Without it the daemon assumes it is
    /// online and lets send failures drive the backoff.
    /// Env: `PARLEY_PROBE_ADDR`
    pub probe_addr: Option<SocketAddr>,

    /// Identity stamped on outgoing messages.
    /// Env: `PARLEY_USER_ID`
    pub user_id: String,

    /// Largest image accepted into the blob store.
    pub max_blob_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("com", "parley", "parley")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./parley-data"));

        Self {
            data_dir,
            remote_url: "http://127.0.0.1:8080".to_string(),
            remote_token: None,
            probe_addr: None,
            user_id: "local".to_string(),
            max_blob_size: MAX_IMAGE_SIZE,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("PARLEY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(url) = lookup("PARLEY_REMOTE_URL") {
            config.remote_url = url;
        }

        if let Some(token) = lookup("PARLEY_REMOTE_TOKEN") {
            if !token.is_empty() {
                config.remote_token = Some(token);
            }
        }

        if let Some(addr) = lookup("PARLEY_PROBE_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.probe_addr = Some(parsed),
                Err(_) => tracing::warn!(value = %addr, "Invalid PARLEY_PROBE_ADDR, probing disabled"),
            }
        }

        if let Some(user) = lookup("PARLEY_USER_ID") {
            if !user.trim().is_empty() {
                config.user_id = user.trim().to_string();
            }
        }

        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::from_lookup(lookup(&[]));
        assert_eq!(config.remote_url, "http://127.0.0.1:8080");
        assert!(config.remote_token.is_none());
        assert!(config.probe_addr.is_none());
        assert_eq!(config.db_path(), config.data_dir.join("parley.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = DaemonConfig::from_lookup(lookup(&[
            ("PARLEY_DATA_DIR", "/tmp/parley"),
            ("PARLEY_REMOTE_TOKEN", "secret"),
            ("PARLEY_PROBE_ADDR", "10.0.0.1:443"),
            ("PARLEY_USER_ID", " alice "),
        ]));
        assert_eq!(config.blob_dir(), PathBuf::from("/tmp/parley/blobs"));
        assert_eq!(config.remote_token.as_deref(), Some("secret"));
        assert_eq!(config.probe_addr, Some(([10, 0, 0, 1], 443).into()));
        assert_eq!(config.user_id, "alice");
    }

    #[test]
    fn test_invalid_probe_addr_is_ignored() {
        let config = DaemonConfig::from_lookup(lookup(&[("PARLEY_PROBE_ADDR", "not an addr")]));
        assert!(config.probe_addr.is_none());
    }
}
