use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_DUE_PER_TICK: usize = 100;
pub const DEFAULT_ENGINE_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (opsconductor.toml + OPSCONDUCTOR_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on another writer's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between dispatch ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on a single handoff to the execution engine.
    #[serde(default = "default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,
    /// Due schedules claimed per tick; the rest wait for the next tick.
    #[serde(default = "default_max_due_per_tick")]
    pub max_due_per_tick: usize,
    /// Re-examine executions stranded in `scheduled` when the loop starts.
    #[serde(default = "bool_true")]
    pub recover_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            handoff_timeout_ms: DEFAULT_HANDOFF_TIMEOUT_MS,
            max_due_per_tick: DEFAULT_MAX_DUE_PER_TICK,
            recover_on_startup: true,
        }
    }
}

/// Where accepted executions are submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the execution engine API. Unset means executions queue
    /// locally and are reported through the CLI.
    pub base_url: Option<String>,
    /// Optional bearer token sent with every submission.
    pub token: Option<String>,
    #[serde(default = "default_engine_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            request_timeout_ms: DEFAULT_ENGINE_REQUEST_TIMEOUT_MS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_handoff_timeout_ms() -> u64 {
    DEFAULT_HANDOFF_TIMEOUT_MS
}
fn default_max_due_per_tick() -> usize {
    DEFAULT_MAX_DUE_PER_TICK
}
fn default_engine_request_timeout_ms() -> u64 {
    DEFAULT_ENGINE_REQUEST_TIMEOUT_MS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opsconductor/opsconductor.db", home)
}

impl OpsConfig {
    /// Load config from a TOML file with OPSCONDUCTOR_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `OPSCONDUCTOR_SCHEDULER__TICK_INTERVAL_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OPSCONDUCTOR_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opsconductor/opsconductor.toml", home)
}
