use std::{env, str::FromStr, sync::Arc};
use tracing::warn;

pub const DEFAULT_RECONCILE_TTL_SECONDS: u64 = 90;

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of workers of the reconciliation pool
    pub reconciliation_threads: usize,
    /// Seconds between two periodic resyncs of every target, at least 1
    pub reconcile_ttl: u64,
    /// Version used to select the resource generators of a target
    pub operator_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconciliation_threads: from_env_parsed(
                "RECONCILIATION_THREADS",
                default_reconciliation_threads(),
            ),
            reconcile_ttl: from_env_parsed("RECONCILE_TTL_SECONDS", DEFAULT_RECONCILE_TTL_SECONDS).max(1),
            operator_version: from_env_default("OPERATOR_VERSION", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Half of the available cores, rounded up
pub fn default_reconciliation_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus + 1) / 2
}

/// Supplier of the shared library overwrite skip flag.
///
/// The environment is read on every call so the flag can be flipped at runtime.
pub fn skip_shared_libraries_overwrites() -> Arc<dyn Fn() -> bool + Send + Sync> {
    Arc::new(|| from_env_parsed("SKIP_SHARED_LIBRARIES_OVERWRITES", false))
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}

// Source and parse the variable from the env - use default if not set or not parseable
fn from_env_parsed<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(var) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value {value:?} for {var}, using {default:?}");
            default
        }),
        Err(_) => default,
    }
}
