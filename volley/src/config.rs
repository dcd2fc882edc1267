//! Configuration file loading.
//!
//! The configuration is a single RON document. Every section, and every
//! field inside it, has a default, so an empty `()` is a valid file:
//!
//! ```ron
//! (
//!     connection: (
//!         helo_name: "mailer.example.com",
//!         address_families: [Ipv4],
//!         tls: Opportunistic,
//!     ),
//!     dns: (timeout_secs: 5),
//!     routing: (
//!         routes: { "test.example.com": "localhost:1025" },
//!     ),
//!     dispatch: (
//!         mail_from: "news@example.com",
//!         emails_per_hour: 3600.0,
//!     ),
//!     validation: (
//!         expected_endpoint: Some("mx.example.net"),
//!     ),
//! )
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use volley_delivery::{ConnectionConfig, DispatchConfig, DnsConfig, RoutingConfig, ValidationConfig};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "VOLLEY_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub dns: DnsConfig,
    pub routing: RoutingConfig,
    pub dispatch: DispatchConfig,
    pub validation: ValidationConfig,
}

impl Config {
    /// Parse a RON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid RON for this structure.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    /// Load the configuration, searching the usual places.
    ///
    /// See [`find_config_file`] for the precedence. With no file anywhere,
    /// the built-in defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file is missing, or a file
    /// is found but cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let env = std::env::var(CONFIG_ENV).ok();

        let Some(path) = find_config_file(explicit, env.as_deref(), &default_paths())? else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Self::from_ron(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }
}

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./volley.config.ron"),
        PathBuf::from("/etc/volley/volley.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. An explicit `--config` path
/// 2. `VOLLEY_CONFIG` environment variable
/// 3. `./volley.config.ron` (current working directory)
/// 4. `/etc/volley/volley.config.ron` (system-wide config)
///
/// Explicit and environment paths must exist; the defaults are optional.
///
/// # Errors
///
/// Returns an error if an explicit or environment path does not exist.
pub fn find_config_file(
    explicit: Option<&Path>,
    env: Option<&str>,
    defaults: &[PathBuf],
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}
