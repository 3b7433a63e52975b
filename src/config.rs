use std::{path::Path, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

/// Prefix of the environment variables that override [`ClientConfig`]
/// fields, e.g. `SETTINGS_SYNC__BASE_PATH`.
pub const ENV_PREFIX: &str = "SETTINGS_SYNC";

/// Settings client configuration
///
/// Loaded with the following priority (highest last):
/// 1. Default values
/// 2. An optional TOML file
/// 3. `SETTINGS_SYNC__*` environment variables
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for every request path, for servers hosted under a sub path
    /// Default: "" (requests go to the root)
    pub base_path: String,

    /// Version of the server build this client belongs to, sent with every
    /// write so that a mismatched server can reject it
    /// Default: this crate's version
    pub server_version: String,

    /// How long a new batch of changes waits for more changes before it may
    /// be sent, in milliseconds
    /// Default: 0 (send as soon as the batch is polled)
    pub flush_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            flush_window_ms: 0,
        }
    }
}

impl ClientConfig {
    /// Load the configuration from an optional file and the environment.
    /// A path that is given must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Config::builder();

        if let Some(path) = path {
            config = config.add_source(File::from(path).required(true));
        }

        config = config.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true),
        );

        Ok(config.build()?.try_deserialize()?)
    }

    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.flush_window_ms)
    }
}
