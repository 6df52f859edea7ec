use anyhow::{Context, Result};
use std::time::Duration;

use crate::types::BackoffPolicy;

/// Process configuration, loaded once at startup from the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Postgres connection string for the queue store.
    pub database_url: String,
    /// Base URL of the GPU inference service, e.g. `http://10.0.0.5:8001`.
    pub gpu_base_url: String,
    /// Base URL of this backend, used to build callback URLs handed to the GPU.
    pub backend_base_url: String,
    /// Address the internal HTTP server binds to.
    pub bind_addr: String,
    /// Mount point of the filesystem shared with the GPU; relative task file
    /// paths are joined onto it before being sent out.
    pub shared_mount_path: String,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub backoff: BackoffPolicy,
}

impl Settings {
    /// Read configuration from the environment (`.env` honored via dotenvy).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let gpu_base_url =
            std::env::var("GPU_BASE_URL").context("GPU_BASE_URL is not set")?;
        let backend_base_url =
            std::env::var("BACKEND_BASE_URL").context("BACKEND_BASE_URL is not set")?;

        Ok(Self {
            database_url,
            gpu_base_url: gpu_base_url.trim_end_matches('/').to_string(),
            backend_base_url: backend_base_url.trim_end_matches('/').to_string(),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            shared_mount_path: env_or("SHARED_FILESYSTEM_MOUNT_PATH", "/mnt/shared"),
            poll_interval: Duration::from_secs(env_parsed("QUEUE_POLL_INTERVAL_SECONDS", 5)?),
            lease: Duration::from_secs(env_parsed("QUEUE_LEASE_SECONDS", 1800)?),
            heartbeat_interval: Duration::from_secs(env_parsed("QUEUE_HEARTBEAT_SECONDS", 30)?),
            max_concurrent_tasks: env_parsed("QUEUE_MAX_CONCURRENT_TASKS", 3)? as usize,
            backoff: BackoffPolicy {
                base: Duration::from_secs(env_parsed("QUEUE_BACKOFF_BASE_SECONDS", 60)?),
                cap: Duration::from_secs(env_parsed("QUEUE_BACKOFF_CAP_SECONDS", 3600)?),
                jitter_frac: 0.2,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} must be an integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
