use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

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

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
    pub transform: TransformConfig,
    pub retention: RetentionConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FEEDSYNC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("FEEDSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            fetch: FetchConfig::from_env_profiled(p),
            transform: TransformConfig::from_env_profiled(p),
            retention: RetentionConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings that would leave the engine unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.worker_pool_size == 0 {
            return Err(ConfigError::invalid("SYNC_WORKERS", "must be at least 1"));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::invalid("SYNC_TICK_SECS", "must be at least 1"));
        }
        if self.retention.history_cap == 0 {
            return Err(ConfigError::invalid("SYNC_HISTORY_CAP", "must be at least 1"));
        }
        if !(self.retention.staleness_factor > 0.0) {
            return Err(ConfigError::invalid(
                "SYNC_STALENESS_FACTOR",
                format!("must be positive, got {}", self.retention.staleness_factor),
            ));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::invalid("FETCH_TIMEOUT_SECS", "must be at least 1"));
        }
        if self.transform.timeout_ms == 0 {
            return Err(ConfigError::invalid("TRANSFORM_TIMEOUT_MS", "must be at least 1"));
        }
        if self.transform.max_memory_bytes < MIN_TRANSFORM_MEMORY_BYTES {
            return Err(ConfigError::invalid(
                "TRANSFORM_MAX_MEMORY_BYTES",
                format!("must be at least {MIN_TRANSFORM_MEMORY_BYTES}"),
            ));
        }
        Ok(())
    }

    /// Whether the lease TTL outlives a worst-case fetch + transform.
    pub fn lease_covers_run_budget(&self) -> bool {
        let budget_ms = self.fetch.timeout_secs * 1000 + self.transform.timeout_ms;
        self.scheduler.lease_ttl_secs * 1000 > budget_ms
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:      {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  postgres:    host={}, db={}, configured={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.is_configured()
        );
        tracing::info!(
            "  scheduler:   tick={}s, workers={}, lease_ttl={}s, instance={}",
            self.scheduler.tick_interval_secs,
            self.scheduler.worker_pool_size,
            self.scheduler.lease_ttl_secs,
            self.scheduler.instance_id
        );
        tracing::info!(
            "  fetch:       timeout={}s, max_response={}B",
            self.fetch.timeout_secs,
            self.fetch.max_response_bytes
        );
        tracing::info!(
            "  transform:   timeout={}ms, fuel={}, max_output={}B, max_memory={}B",
            self.transform.timeout_ms,
            self.transform.fuel,
            self.transform.max_output_bytes,
            self.transform.max_memory_bytes
        );
        tracing::info!(
            "  retention:   history_cap={}, sample={}B, staleness_factor={}",
            self.retention.history_cap,
            self.retention.sample_bytes,
            self.retention.staleness_factor
        );
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
            "scheduler": {
                "tick_interval_secs": self.scheduler.tick_interval_secs,
                "worker_pool_size": self.scheduler.worker_pool_size,
                "lease_ttl_secs": self.scheduler.lease_ttl_secs,
                "instance_id": self.scheduler.instance_id,
            },
            "fetch": {
                "timeout_secs": self.fetch.timeout_secs,
                "max_response_bytes": self.fetch.max_response_bytes,
            },
            "transform": {
                "timeout_ms": self.transform.timeout_ms,
                "fuel": self.transform.fuel,
                "max_output_bytes": self.transform.max_output_bytes,
                "max_memory_bytes": self.transform.max_memory_bytes,
            },
            "retention": {
                "history_cap": self.retention.history_cap,
                "sample_bytes": self.retention.sample_bytes,
                "staleness_factor": self.retention.staleness_factor,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            server: ServerConfig::default(),
            postgres: PostgresConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            transform: TransformConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "PORT", 3001),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cors_origin: "*".to_string(),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; takes precedence over the discrete fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "DATABASE_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_parse(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "feedsync"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_parse(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.username.is_some()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "feedsync".to_string(),
            username: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub worker_pool_size: usize,
    pub lease_ttl_secs: u64,
    /// Lease holder identity for this process.
    pub instance_id: String,
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            tick_interval_secs: profiled_env_parse(p, "SYNC_TICK_SECS", 30),
            worker_pool_size: profiled_env_parse(p, "SYNC_WORKERS", 8),
            lease_ttl_secs: profiled_env_parse(p, "SYNC_LEASE_TTL_SECS", 120),
            instance_id: profiled_env_opt(p, "SYNC_INSTANCE_ID").unwrap_or_else(default_instance_id),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            worker_pool_size: 8,
            lease_ttl_secs: 120,
            instance_id: default_instance_id(),
        }
    }
}

fn default_instance_id() -> String {
    format!("feedsync-{}", uuid::Uuid::new_v4().simple())
}

// ── Fetch ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_response_bytes: usize,
    pub user_agent: String,
}

impl FetchConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            timeout_secs: profiled_env_parse(p, "FETCH_TIMEOUT_SECS", 30),
            max_response_bytes: profiled_env_parse(p, "FETCH_MAX_RESPONSE_BYTES", 10 * 1024 * 1024),
            user_agent: profiled_env_or(p, "FETCH_USER_AGENT", "feedsync/0.1"),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
            user_agent: "feedsync/0.1".to_string(),
        }
    }
}

// ── Transform sandbox ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub timeout_ms: u64,
    /// Instruction budget for a single evaluation.
    pub fuel: u64,
    pub max_output_bytes: usize,
    /// Address-space ceiling of the transform worker process.
    pub max_memory_bytes: u64,
    /// Worker executable. Unset means `feedsync-transform` next to the
    /// running binary.
    pub worker_path: Option<String>,
}

const DEFAULT_TRANSFORM_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
/// Below this the worker cannot even load.
const MIN_TRANSFORM_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

impl TransformConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            timeout_ms: profiled_env_parse(p, "TRANSFORM_TIMEOUT_MS", 2000),
            fuel: profiled_env_parse(p, "TRANSFORM_FUEL", 50_000_000),
            max_output_bytes: profiled_env_parse(p, "TRANSFORM_MAX_OUTPUT_BYTES", 1024 * 1024),
            max_memory_bytes: profiled_env_parse(
                p,
                "TRANSFORM_MAX_MEMORY_BYTES",
                DEFAULT_TRANSFORM_MEMORY_BYTES,
            ),
            worker_path: profiled_env_opt(p, "TRANSFORM_WORKER"),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            fuel: 50_000_000,
            max_output_bytes: 1024 * 1024,
            max_memory_bytes: DEFAULT_TRANSFORM_MEMORY_BYTES,
            worker_path: None,
        }
    }
}

// ── Retention ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Run records kept per definition.
    pub history_cap: usize,
    /// Max bytes of payload kept on each run record.
    pub sample_bytes: usize,
    pub staleness_factor: f64,
}

impl RetentionConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            history_cap: profiled_env_parse(p, "SYNC_HISTORY_CAP", 50),
            sample_bytes: profiled_env_parse(p, "SYNC_SAMPLE_BYTES", 2048),
            staleness_factor: profiled_env_parse(p, "SYNC_STALENESS_FACTOR", 2.0),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_cap: 50,
            sample_bytes: 2048,
            staleness_factor: 2.0,
        }
    }
}
