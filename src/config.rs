//! Dispatcher tuning knobs.
//!
//! Every value here is part of the external contract: the defaults are what
//! runners and observers are written against. Each knob can be overridden
//! through a `MINI_CI_*` environment variable, mainly so integration setups
//! can shrink the timeouts.

use std::path::PathBuf;
use std::time::Duration;

/// Cadence at which runners are expected to volunteer heartbeats (seconds).
/// The dispatcher never pings; it only watches this clock go stale.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

const DEFAULT_DEAD_AFTER_SECS: u64 = 15;
const DEFAULT_RETRY_MAX: u32 = 3;
const DEFAULT_ASSIGN_TICK_MS: u64 = 200;
const DEFAULT_JANITOR_TICK_MS: u64 = 1000;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 5;

/// Runtime configuration for the dispatcher process.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// A runner whose last heartbeat is older than this is considered dead.
    pub dead_after: Duration,
    /// Requeues allowed per revision before it is dropped.
    pub retry_max: u32,
    /// Queue-pop timeout and idle-probe sleep used by the assigner.
    pub assign_tick: Duration,
    /// Interval between janitor scans of the runner table.
    pub janitor_tick: Duration,
    /// Connect and reply deadline for outbound RUN requests.
    pub run_timeout: Duration,
    /// Directory holding result files, the shared log and the event journal.
    pub results_dir: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dead_after: Duration::from_secs(DEFAULT_DEAD_AFTER_SECS),
            retry_max: DEFAULT_RETRY_MAX,
            assign_tick: Duration::from_millis(DEFAULT_ASSIGN_TICK_MS),
            janitor_tick: Duration::from_millis(DEFAULT_JANITOR_TICK_MS),
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            results_dir: PathBuf::from("test_results"),
        }
    }
}

impl DispatcherConfig {
    /// Contract defaults with `MINI_CI_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            dead_after: Duration::from_secs(env_u64("MINI_CI_DEAD_SECS", DEFAULT_DEAD_AFTER_SECS)),
            retry_max: env_u64("MINI_CI_RETRY_MAX", u64::from(DEFAULT_RETRY_MAX)) as u32,
            assign_tick: Duration::from_millis(env_u64(
                "MINI_CI_ASSIGN_TICK_MS",
                DEFAULT_ASSIGN_TICK_MS,
            )),
            janitor_tick: Duration::from_millis(env_u64(
                "MINI_CI_JANITOR_TICK_MS",
                DEFAULT_JANITOR_TICK_MS,
            )),
            run_timeout: Duration::from_secs(env_u64(
                "MINI_CI_RUN_TIMEOUT_SECS",
                DEFAULT_RUN_TIMEOUT_SECS,
            )),
            results_dir: PathBuf::from("test_results"),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
