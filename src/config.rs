use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, loaded once from the environment at startup.
/// Every field has a sane default — a missing or malformed env var never
/// panics, it just falls back (mirrors the teacher's `Config::from_env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub sentry_dsn: Option<String>,
    /// Directory the supervisor's sqlite Block Store and engine working
    /// directories live under. Defaults to `~/.cc-runner`.
    pub data_dir: PathBuf,
    /// Idle TTL after which the Registry's reaper terminates a Session Unit.
    pub session_idle_ttl: Duration,
    /// Interval the reaper wakes on to scan for idle sessions.
    pub reaper_interval: Duration,
    /// Capacity of each Session Unit's bounded event queue.
    pub event_queue_capacity: usize,
    /// Grace period `terminate()` waits after closing stdin before killing.
    pub terminate_grace: Duration,
    /// Path to the `claude` (or compatible) engine binary.
    pub engine_binary: String,
    /// In Geek mode, whether a `Critical`-classified tool_use (spec §4.6)
    /// aborts the current turn instead of merely being recorded.
    pub geek_refuses_critical: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("CC_RUNNER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".cc-runner")
            });

        Self {
            port: env_or("CC_RUNNER_PORT", 8099),
            environment: std::env::var("CC_RUNNER_ENV").unwrap_or_else(|_| "local".to_string()),
            sentry_dsn: std::env::var("SENTRY_DSN").ok().filter(|s| !s.is_empty()),
            data_dir,
            session_idle_ttl: Duration::from_secs(env_or("CC_RUNNER_SESSION_IDLE_TTL_SECS", 1800)),
            reaper_interval: Duration::from_secs(env_or("CC_RUNNER_REAPER_INTERVAL_SECS", 60)),
            event_queue_capacity: env_or("CC_RUNNER_EVENT_QUEUE_CAPACITY", 256),
            terminate_grace: Duration::from_millis(env_or(
                "CC_RUNNER_TERMINATE_GRACE_MS",
                3000,
            )),
            engine_binary: std::env::var("CC_RUNNER_ENGINE_BIN")
                .unwrap_or_else(|_| "claude".to_string()),
            geek_refuses_critical: env_or("CC_RUNNER_GEEK_REFUSES_CRITICAL", true),
        }
    }

    pub fn block_store_path(&self) -> PathBuf {
        self.data_dir.join("blocks.sqlite3")
    }
}
