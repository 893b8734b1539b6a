//! Environment-variable configuration shared by the worker and API binaries,
//! plus the tracing bootstrap both of them call at startup.

use anyhow::{Context, Result};

pub const ENV_BROKER_URL: &str = "BROKER_URL";
pub const ENV_OWNER: &str = "OWNER";
pub const ENV_WORKER_GROUP: &str = "WORKER_GROUP";
pub const ENV_DATABASE_URL: &str = "SIDEFX_DATABASE_URL";
pub const ENV_ARTIFACTS_DIR: &str = "ARTIFACTS_DIR";
pub const ENV_API_ADDR: &str = "SIDEFX_API_ADDR";
pub const ENV_MAX_ATTEMPTS_DEFAULT: &str = "SIDEFX_MAX_ATTEMPTS_DEFAULT";

const DEFAULT_BROKER_URL: &str = "http://localhost:8080";
const DEFAULT_WORKER_GROUP: &str = "sidefx-worker";
const DEFAULT_ARTIFACTS_DIR: &str = "/data/artifacts";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8090";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LEASE_MS: u64 = 30_000;

/// Configuration for the `sidefx-worker` consume-loop binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker_url: String,
    pub owner: String,
    pub worker_group: String,
    pub database_url: String,
    pub artifacts_dir: String,
    pub lease_ms: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker_url: env_or(ENV_BROKER_URL, DEFAULT_BROKER_URL),
            owner: env_or(ENV_OWNER, &hostname()),
            worker_group: env_or(ENV_WORKER_GROUP, DEFAULT_WORKER_GROUP),
            database_url: std::env::var(ENV_DATABASE_URL)
                .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?,
            artifacts_dir: env_or(ENV_ARTIFACTS_DIR, DEFAULT_ARTIFACTS_DIR),
            lease_ms: DEFAULT_LEASE_MS,
        })
    }
}

/// Configuration for the `sidefx-api` ingress binary.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub broker_url: String,
    pub bind_addr: std::net::SocketAddr,
    pub max_attempts_default: u32,
    pub owner: String,
    pub database_url: Option<String>,
    pub artifacts_dir: String,
    pub events_lease_ms: u64,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var(ENV_API_ADDR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_API_ADDR.parse().expect("default addr is valid"));

        let max_attempts_default = std::env::var(ENV_MAX_ATTEMPTS_DEFAULT)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            broker_url: env_or(ENV_BROKER_URL, DEFAULT_BROKER_URL),
            bind_addr,
            max_attempts_default,
            owner: env_or(ENV_OWNER, &hostname()),
            database_url: std::env::var(ENV_DATABASE_URL).ok(),
            artifacts_dir: env_or(ENV_ARTIFACTS_DIR, DEFAULT_ARTIFACTS_DIR),
            events_lease_ms: DEFAULT_LEASE_MS,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Load `.env.local` if present. Silent if missing — production injects env
/// vars directly.
pub fn bootstrap_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

/// Initialize structured logging. Honors `RUST_LOG`, falling back to
/// `LOG_LEVEL`, falling back to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::EnvFilter::try_new(level)
        })
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
