use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Request execution limits shared by every context
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// In-memory budget for multipart bodies; larger files spill to disk
    #[serde(default = "default_multipart_memory")]
    pub multipart_memory: ByteSize,
    /// Upper bound on a buffered request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: ByteSize,
    /// Idle contexts kept for reuse
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multipart_memory: default_multipart_memory(),
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle: default_pool_max_idle(),
        }
    }
}

fn default_multipart_memory() -> ByteSize {
    ByteSize::mib(32)
}

fn default_max_body_bytes() -> ByteSize {
    ByteSize::mib(32)
}

fn default_pool_max_idle() -> usize {
    1024
}

/// Storage provider type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Memory,
    Local,
}

/// Upload storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    /// Directory for the local provider
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("data/uploads")
}
