use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PROVIDER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_BLOB_ROOT: &str = "./storage";
const DEFAULT_ATTACHMENT_BASE_PATH: &str = "messages";
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_TITLE_MODEL: &str = "meta-llama/llama-3.1-8b-instruct";
const DEFAULT_TITLE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_LINEAGE_DEPTH: usize = 10_000;

/// Process configuration, read once at startup from the environment
/// (a `.env` file is loaded first when present).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub provider_base_url: String,
    pub blob_root: String,
    pub attachment_base_path: String,
    pub subscriber_queue_capacity: usize,
    pub title_model: String,
    pub title_timeout: Duration,
    pub max_lineage_depth: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set (copy .env.example to .env)"))?;

        Ok(Self {
            database_url,
            port: parsed_or("PORT", DEFAULT_PORT),
            provider_base_url: string_or("PROVIDER_BASE_URL", DEFAULT_PROVIDER_BASE_URL),
            blob_root: string_or("BLOB_ROOT", DEFAULT_BLOB_ROOT),
            attachment_base_path: string_or("ATTACHMENT_BASE_PATH", DEFAULT_ATTACHMENT_BASE_PATH),
            subscriber_queue_capacity: parsed_or("SUBSCRIBER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)
                .max(1),
            title_model: string_or("TITLE_MODEL", DEFAULT_TITLE_MODEL),
            title_timeout: Duration::from_secs(parsed_or(
                "TITLE_TIMEOUT_SECS",
                DEFAULT_TITLE_TIMEOUT_SECS,
            )),
            max_lineage_depth: parsed_or("MAX_LINEAGE_DEPTH", DEFAULT_MAX_LINEAGE_DEPTH),
        })
    }
}

fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {key}={raw:?}, using {default}");
            default
        }),
        Err(_) => default,
    }
}
