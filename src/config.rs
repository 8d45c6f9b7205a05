use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub socket: SocketConfig,
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
}

/// Settings for the guarded socket this daemon creates.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    pub path: PathBuf,
    /// Octal permission string, e.g. "0600".
    pub mode: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Settings for the real Docker control socket requests are forwarded to.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root of the model store (contains manifests/ and blobs/).
    pub root: PathBuf,
    /// Registry host models are pulled from.
    pub registry_host: String,
    /// Use plain http when talking to the registry.
    pub insecure: bool,
}

impl SocketConfig {
    pub fn mode_bits(&self) -> Result<u32> {
        u32::from_str_radix(&self.mode, 8)
            .map_err(|_| AppError::Config(format!("invalid socket mode: {}", self.mode)))
    }
}

fn default_store_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib/modelsock"))
        .join(".ollama")
        .join("models")
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with default values
            .set_default("socket.path", "model.sock")?
            .set_default("socket.mode", "0600")?
            .set_default("upstream.socket", "/var/run/docker.sock")?
            .set_default("store.root", default_store_root().to_string_lossy().to_string())?
            .set_default("store.registry_host", "registry.ollama.ai")?
            .set_default("store.insecure", false)?
            // Add configuration from files
            .add_source(File::with_name("config/default").required(false))
            // Add environment variables with prefix MODELSOCK_
            .add_source(Environment::with_prefix("MODELSOCK").separator("_"))
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig {
                path: PathBuf::from("model.sock"),
                mode: "0600".to_string(),
                uid: None,
                gid: None,
            },
            upstream: UpstreamConfig {
                socket: PathBuf::from("/var/run/docker.sock"),
            },
            store: StoreConfig {
                root: default_store_root(),
                registry_host: "registry.ollama.ai".to_string(),
                insecure: false,
            },
        }
    }
}
