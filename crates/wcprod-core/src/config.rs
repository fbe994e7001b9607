//! Store configuration read from the environment.
//!
//! | Variable                       | Default   |
//! |--------------------------------|-----------|
//! | `WCPROD_BUSY_TIMEOUT_MS`       | 5000      |
//! | `WCPROD_MAX_ENTRIES_PER_SHARD` | 1000000   |
//! | `WCPROD_SAMPLE_SIZE`           | 1000      |
//! | `WCPROD_PRIORITIZE`            | true      |

use std::time::Duration;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_ENTRIES_PER_SHARD: usize = 1_000_000;
pub const DEFAULT_SAMPLE_SIZE: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long SQLite waits for another process's write lock.
    pub busy_timeout: Duration,
    /// Upper bound on configurations per shard at registration.
    pub max_entries_per_shard: usize,
    /// Candidate pool size for work selection (0 = whole shard).
    pub sample_size: usize,
    pub prioritize: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            max_entries_per_shard: DEFAULT_MAX_ENTRIES_PER_SHARD,
            sample_size: DEFAULT_SAMPLE_SIZE,
            prioritize: true,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unparseable values fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| -> Option<u64> { lookup(key)?.trim().parse::<u64>().ok() };

        Self {
            busy_timeout: number("WCPROD_BUSY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
            max_entries_per_shard: number("WCPROD_MAX_ENTRIES_PER_SHARD")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_entries_per_shard),
            sample_size: number("WCPROD_SAMPLE_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.sample_size),
            prioritize: match lookup("WCPROD_PRIORITIZE") {
                Some(val) => {
                    let v = val.trim().to_lowercase();
                    !matches!(v.as_str(), "0" | "false" | "no" | "off")
                }
                None => defaults.prioritize,
            },
        }
    }
}
