//! Engine tunables.
//!
//! Pool sizing and the heuristic selectivity constants are configuration
//! rather than hard-coded so that different deployments (and tests) can
//! pin them down. Boolean environment toggles accept "t", "T", "1" and
//! "true", everything else is false.

use std::env;

/// Heuristic selectivity and cost constants used by restriction ordering
/// and cardinality estimation.
#[derive(Debug, Clone, Copy)]
pub struct Selectivities {
    pub eq: f64,
    pub eq2: f64,
    pub not_null: f64,
    pub tiny_table: f64,
    pub join_filter: f64,
}

impl Default for Selectivities {
    fn default() -> Self {
        Self {
            eq: 0.01,
            eq2: 0.02,
            not_null: 0.9,
            tiny_table: 0.003,
            join_filter: 0.5,
        }
    }
}

/// Engine-wide configuration, resolved once at context construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Override for the page pool size in bytes. `None` sizes the pool to
    /// `total_ram / unused_ratio / 2`.
    pub page_pool_bytes: Option<usize>,
    /// Override for the query pool size in bytes. `None` sizes the pool to
    /// `total_ram / unused_ratio * 4 / 5`.
    pub query_pool_bytes: Option<usize>,
    /// Ratio of total hardware threads to the threads available to this
    /// process. `None` derives it from the CPU affinity mask.
    pub unused_ratio: Option<usize>,
    /// Override for the worker count. `None` uses the affinity mask.
    pub concurrency: Option<usize>,
    pub selectivity: Selectivities,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_pool_bytes: None,
            query_pool_bytes: None,
            unused_ratio: None,
            concurrency: None,
            selectivity: Selectivities::default(),
        }
    }
}

impl EngineConfig {
    /// Read overrides from `MORSELDB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.page_pool_bytes = env_usize("MORSELDB_PAGE_POOL_BYTES");
        config.query_pool_bytes = env_usize("MORSELDB_QUERY_POOL_BYTES");
        config.unused_ratio = env_usize("MORSELDB_UNUSED_RATIO");
        config.concurrency = env_usize("MORSELDB_THREADS");
        config
    }
}

/// Parse a boolean environment toggle.
pub fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    Some(matches!(value.as_str(), "t" | "T" | "1" | "true"))
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_flag_parsing() {
        env::set_var("MORSELDB_TEST_FLAG", "t");
        assert_eq!(env_flag("MORSELDB_TEST_FLAG"), Some(true));
        env::set_var("MORSELDB_TEST_FLAG", "T");
        assert_eq!(env_flag("MORSELDB_TEST_FLAG"), Some(true));
        env::set_var("MORSELDB_TEST_FLAG", "1");
        assert_eq!(env_flag("MORSELDB_TEST_FLAG"), Some(true));
        env::set_var("MORSELDB_TEST_FLAG", "0");
        assert_eq!(env_flag("MORSELDB_TEST_FLAG"), Some(false));
        env::remove_var("MORSELDB_TEST_FLAG");
        assert_eq!(env_flag("MORSELDB_TEST_FLAG"), None);
    }

    #[test]
    fn test_default_selectivities() {
        let s = Selectivities::default();
        assert!(s.eq < s.eq2);
        assert!(s.tiny_table < s.join_filter);
    }
}
