use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, IngestionError};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub ingestion: IngestionConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            database: DatabaseConfig::from_env(),
            upstream: UpstreamConfig::from_env(),
            ingestion: IngestionConfig::from_env(),
        }
    }

    /// Validate cross-field constraints that `from_env` cannot catch.
    pub fn validate(&self) -> Result<(), IngestionError> {
        if self.upstream.base_url.is_empty() {
            return Err(IngestionError::new(
                ErrorCode::InvalidConfig,
                "CHOREO_BASE_URL must be set",
            ));
        }
        if self.upstream.page_limit == 0 {
            return Err(IngestionError::new(
                ErrorCode::InvalidConfig,
                "CHOREO_PAGE_LIMIT must be at least 1",
            ));
        }
        if self.ingestion.burst_length_secs == 0 {
            return Err(IngestionError::new(
                ErrorCode::InvalidConfig,
                "INGEST_BURST_LENGTH_SECS must be at least 1",
            ));
        }
        if self.ingestion.backoff_schedule_secs.is_empty() {
            return Err(IngestionError::new(
                ErrorCode::InvalidConfig,
                "INGEST_BACKOFF_SCHEDULE_SECS must list at least one entry",
            ));
        }
        Ok(())
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: env_u16("SERVER_PORT", 7007),
        }
    }
}

// ── Database ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; the scheme selects the IN-clause batch size.
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    fn from_env() -> Self {
        Self {
            url: env_or("DATABASE_URL", "postgres://localhost:5432/choreo_sync"),
            max_connections: env_u32("DATABASE_MAX_CONNECTIONS", 10),
        }
    }
}

// ── Upstream catalog API ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Logical source identifier for ingestion bookkeeping.
    pub provider_name: String,
    pub base_url: String,
    pub token: Option<String>,
    /// Page size requested from list endpoints.
    pub page_limit: u32,
    /// Worker-pool width for per-component detail fetches.
    pub detail_concurrency: usize,
    /// Delay between detail-fetch batches, to respect upstream rate limits.
    pub detail_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl UpstreamConfig {
    fn from_env() -> Self {
        Self {
            provider_name: env_or("CHOREO_PROVIDER_NAME", "choreo"),
            base_url: env_or("CHOREO_BASE_URL", ""),
            token: env_opt("CHOREO_TOKEN"),
            page_limit: env_u32("CHOREO_PAGE_LIMIT", 100),
            detail_concurrency: env_u32("CHOREO_DETAIL_CONCURRENCY", 5) as usize,
            detail_delay_ms: env_u64("CHOREO_DETAIL_DELAY_MS", 100),
            request_timeout_secs: env_u64("CHOREO_REQUEST_TIMEOUT_SECS", 30),
        }
    }
}

// ── Ingestion cadence ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Wall-clock budget of one burst.
    pub burst_length_secs: u64,
    /// Rest period between full cycles.
    pub rest_length_secs: u64,
    /// Scheduler cadence between task invocations.
    pub frequency_secs: u64,
    /// Backoff lengths indexed by attempt count (last entry repeats).
    pub backoff_schedule_secs: Vec<u64>,
    /// Age past which a stray open ingestion row is considered stale.
    pub duplicate_age_secs: u64,
    /// Cooldown applied by purge-and-reset before the next run may start.
    pub purge_cooldown_secs: u64,
}

impl IngestionConfig {
    fn from_env() -> Self {
        let schedule = env_opt("INGEST_BACKOFF_SCHEDULE_SECS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse().ok())
                    .collect::<Vec<u64>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_backoff_schedule);

        Self {
            burst_length_secs: env_u64("INGEST_BURST_LENGTH_SECS", 10),
            rest_length_secs: env_u64("INGEST_REST_LENGTH_SECS", 3600),
            frequency_secs: env_u64("INGEST_FREQUENCY_SECS", 30),
            backoff_schedule_secs: schedule,
            duplicate_age_secs: env_u64("INGEST_DUPLICATE_AGE_SECS", 60),
            purge_cooldown_secs: env_u64("INGEST_PURGE_COOLDOWN_SECS", 86_400),
        }
    }
}

/// 24s, 10m, 3h, 24h.
fn default_backoff_schedule() -> Vec<u64> {
    vec![24, 600, 10_800, 86_400]
}

// ── Tests ─────────────────────────────────────────────────────
