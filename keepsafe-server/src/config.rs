//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the HTTP auth surface.
    pub http_addr: String,
    /// Address of the framed RPC surface.
    pub rpc_addr: String,
    pub db_path: PathBuf,
    /// Root of the per-user blob tree.
    pub file_root: PathBuf,
    /// Secret for signing bearer tokens, loaded once at startup.
    pub token_secret: String,
    /// Token lifetime in seconds; fixed at issue.
    pub token_ttl_secs: i64,
    /// Upper bound on HTTP request bodies.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8543".to_string(),
            rpc_addr: "127.0.0.1:8553".to_string(),
            db_path: PathBuf::from("keepsafe.db"),
            file_root: PathBuf::from("data/server_files"),
            token_secret: "keepsafe-dev-secret".to_string(),
            token_ttl_secs: 3600,
            max_body_size: 65_536,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
