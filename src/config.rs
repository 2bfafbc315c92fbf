use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from `RESERVA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub sweeps: SweepConfig,
    pub cache_ttl: Duration,
    /// Compact the WAL once this many events were appended since the last compaction.
    pub compact_threshold: u64,
}

/// Timing of the booking state machine.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub auto_confirm_delay: Duration,
    /// A booking still pending after this long is expired.
    pub pending_expiry: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at once.
    pub workers: usize,
    /// Attempts per task before a transient failure drops it.
    pub max_attempts: u32,
    /// First retry delay; doubles with each attempt.
    pub retry_base: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub expiry_period: Duration,
    pub reminder_period: Duration,
    pub maintenance_period: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_confirm_delay: Duration::from_secs(60),
            pending_expiry: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            retry_base: Duration::from_millis(500),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            expiry_period: Duration::from_secs(300),
            reminder_period: Duration::from_secs(3600),
            maintenance_period: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            lifecycle: LifecycleConfig::default(),
            scheduler: SchedulerConfig::default(),
            sweeps: SweepConfig::default(),
            cache_ttl: Duration::from_secs(300),
            compact_threshold: 1000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key).map_or(default, Duration::from_secs)
}

/// Like `env_secs`, but a period of zero keeps the default.
fn env_period(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .filter(|s| *s > 0)
        .map_or(default, Duration::from_secs)
}

impl Config {
    /// Environment overrides on top of the defaults. Unparsable values fall
    /// back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_dir: std::env::var("RESERVA_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: env_parse("RESERVA_METRICS_PORT"),
            lifecycle: LifecycleConfig {
                auto_confirm_delay: env_secs(
                    "RESERVA_AUTO_CONFIRM_DELAY_SECS",
                    d.lifecycle.auto_confirm_delay,
                ),
                pending_expiry: env_secs("RESERVA_PENDING_EXPIRY_SECS", d.lifecycle.pending_expiry),
            },
            scheduler: SchedulerConfig {
                workers: env_parse::<usize>("RESERVA_WORKERS")
                    .filter(|w| *w > 0)
                    .unwrap_or(d.scheduler.workers),
                max_attempts: env_parse::<u32>("RESERVA_TASK_MAX_ATTEMPTS")
                    .filter(|a| *a > 0)
                    .unwrap_or(d.scheduler.max_attempts),
                retry_base: env_parse::<u64>("RESERVA_TASK_RETRY_BASE_MS")
                    .map_or(d.scheduler.retry_base, Duration::from_millis),
            },
            sweeps: SweepConfig {
                expiry_period: env_period("RESERVA_EXPIRY_SWEEP_SECS", d.sweeps.expiry_period),
                reminder_period: env_period("RESERVA_REMINDER_SWEEP_SECS", d.sweeps.reminder_period),
                maintenance_period: env_period(
                    "RESERVA_COMPACT_SWEEP_SECS",
                    d.sweeps.maintenance_period,
                ),
            },
            cache_ttl: env_secs("RESERVA_CACHE_TTL_SECS", d.cache_ttl),
            compact_threshold: env_parse("RESERVA_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
        }
    }
}
