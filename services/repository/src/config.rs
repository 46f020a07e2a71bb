//! Configuration for the repository service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

/// Top-level service configuration, loaded from `OMNI_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Data root all image folders live under. Must already exist.
    pub data_folder: PathBuf,

    /// Path of the SQLite record database.
    pub database_path: PathBuf,

    /// Static token required by the mutating endpoints.
    pub upload_token: String,

    pub work_manager: WorkManagerSettings,

    pub puller: PullerSettings,

    /// Comma-separated Kafka brokers; unset means log-only events.
    pub kafka_brokers: Option<String>,

    /// Object storage credentials; unset disables publishing.
    pub object_storage: Option<ObjectStorageSettings>,
}

/// Work dispatch knobs.
#[derive(Debug, Clone)]
pub struct WorkManagerSettings {
    /// Concurrent worker tasks consuming the work queue.
    pub threads: usize,

    /// How often the fetcher sweeps the store.
    pub sync_interval: Duration,
}

impl Default for WorkManagerSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            sync_interval: Duration::from_secs(10),
        }
    }
}

/// Puller knobs.
#[derive(Debug, Clone)]
pub struct PullerSettings {
    /// Re-enqueue attempts per block before it counts as failed.
    pub max_retry: u32,

    /// Concurrent block downloads per image.
    pub max_concurrency: usize,

    /// Byte-range size per block.
    pub block_size: u64,

    /// Supervisor tick checking for completion.
    pub tick_interval: Duration,
}

impl Default for PullerSettings {
    fn default() -> Self {
        Self {
            max_retry: 3,
            max_concurrency: 4,
            block_size: 100 * 1024 * 1024,
            tick_interval: Duration::from_secs(5),
        }
    }
}

/// S3-compatible object storage settings.
#[derive(Debug, Clone)]
pub struct ObjectStorageSettings {
    /// Endpoint host, e.g. `obs.cn-north-4.myhuaweicloud.com`.
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,

    /// Multipart part size in bytes.
    pub part_size: u64,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_var("OMNI_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = env_var("OMNI_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let data_folder = PathBuf::from(
            env_var("OMNI_DATA_FOLDER").unwrap_or_else(|| "/var/lib/omni-repository/data".to_string()),
        );

        let database_path = env_var("OMNI_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_folder.join("repository.db"));

        let Some(upload_token) = env_var("OMNI_UPLOAD_TOKEN") else {
            bail!("upload token is empty, set OMNI_UPLOAD_TOKEN");
        };

        let defaults = WorkManagerSettings::default();
        let work_manager = WorkManagerSettings {
            threads: env_parse("OMNI_WORKER_THREADS", defaults.threads),
            sync_interval: Duration::from_secs(env_parse(
                "OMNI_SYNC_INTERVAL",
                defaults.sync_interval.as_secs(),
            )),
        };

        let defaults = PullerSettings::default();
        let puller = PullerSettings {
            max_retry: env_parse("OMNI_PULLER_MAX_RETRY", defaults.max_retry),
            max_concurrency: env_parse("OMNI_PULLER_MAX_CONCURRENCY", defaults.max_concurrency),
            block_size: env_parse("OMNI_PULLER_BLOCK_SIZE", defaults.block_size),
            tick_interval: defaults.tick_interval,
        };

        let kafka_brokers = env_var("OMNI_KAFKA_BROKERS");

        let object_storage = match (env_var("OMNI_OBS_ENDPOINT"), env_var("OMNI_OBS_BUCKET")) {
            (Some(endpoint), Some(bucket)) => {
                let Some(access_key) = env_var("OMNI_OBS_ACCESS_KEY") else {
                    bail!("OMNI_OBS_ACCESS_KEY is required when object storage is configured");
                };
                let Some(secret_key) = env_var("OMNI_OBS_SECRET_KEY") else {
                    bail!("OMNI_OBS_SECRET_KEY is required when object storage is configured");
                };
                Some(ObjectStorageSettings {
                    endpoint,
                    bucket,
                    access_key,
                    secret_key,
                    region: env_var("OMNI_OBS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                    part_size: env_parse("OMNI_OBS_PART_SIZE", 100 * 1024 * 1024),
                })
            }
            _ => None,
        };

        Ok(Self {
            listen_addr,
            log_level,
            data_folder,
            database_path,
            upload_token,
            work_manager,
            puller,
            kafka_brokers,
            object_storage,
        })
    }
}
