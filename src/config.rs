//! Configuration directory, identity persistence, and transport wiring.
//!
//! The config directory holds `config.toml` (peer wiring for the overlay
//! node) and, unless `-i` points elsewhere, the identity file `rnsh`.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::transport::{Identity, TransportConfig};

/// Default peer-listener address for listener mode.
pub const DEFAULT_BIND: &str = "0.0.0.0:4242";
/// Default peer to dial in client mode.
pub const DEFAULT_PEER: &str = "127.0.0.1:4242";

const CONFIG_FILE: &str = "config.toml";
const IDENTITY_FILE: &str = "rnsh";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to store identity: {0}")]
    Identity(#[from] std::io::Error),
}

/// Resolve the config directory: the `--config` argument, or a per-user
/// default.
pub fn config_dir(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("rnsh"))
            .unwrap_or_else(|| PathBuf::from(".rnsh"))
    })
}

/// Load `config.toml` from the config directory; a missing file means
/// defaults.
pub fn load_transport_config(dir: &Path) -> Result<TransportConfig, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(TransportConfig::default());
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
}

/// Listener nodes accept peers; default the bind address when unset.
pub fn for_listener(mut config: TransportConfig) -> TransportConfig {
    if config.bind.is_none() {
        config.bind = Some(DEFAULT_BIND.to_string());
    }
    config
}

/// Client nodes dial peers; default to the local listener when unset.
pub fn for_client(mut config: TransportConfig) -> TransportConfig {
    if config.peers.is_empty() {
        config.peers = vec![DEFAULT_PEER.to_string()];
    }
    config
}

/// Load the identity, creating and persisting a fresh one when the file is
/// missing or unreadable.
pub fn load_or_create_identity(
    dir: &Path,
    identity_path: Option<&Path>,
) -> Result<Identity, ConfigError> {
    let path = identity_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.join(IDENTITY_FILE));
    if path.is_file() {
        match Identity::from_file(&path) {
            Ok(identity) => return Ok(identity),
            Err(e) => warn!("could not load identity from {}: {e}", path.display()),
        }
    }
    info!("no valid saved identity found, creating new...");
    let identity = Identity::generate();
    identity.to_file(&path)?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_transport_config(dir.path()).unwrap();
        assert!(config.bind.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn config_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "bind = \"127.0.0.1:4444\"\npeers = [\"10.0.0.1:4242\"]\n",
        )
        .unwrap();
        let config = load_transport_config(dir.path()).unwrap();
        assert_eq!(config.bind.as_deref(), Some("127.0.0.1:4444"));
        assert_eq!(config.peers, vec!["10.0.0.1:4242".to_string()]);
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "bind = [nonsense").unwrap();
        assert!(load_transport_config(dir.path()).is_err());
    }

    #[test]
    fn identity_is_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(dir.path(), None).unwrap();
        let second = load_or_create_identity(dir.path(), None).unwrap();
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn mode_defaults_fill_in_missing_wiring() {
        let listener = for_listener(TransportConfig::default());
        assert_eq!(listener.bind.as_deref(), Some(DEFAULT_BIND));
        let client = for_client(TransportConfig::default());
        assert_eq!(client.peers, vec![DEFAULT_PEER.to_string()]);
    }
}
