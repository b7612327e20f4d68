// MorselDB - vectorized, parallel, in-memory columnar hash-join engine
// Core library module

pub mod common;
pub mod config;
pub mod error;
pub mod filter;
pub mod join;
pub mod memory;
pub mod pipeline;
pub mod planner;
pub mod query;
pub mod scan;
pub mod scheduler;
pub mod simd;
pub mod storage;

pub use config::EngineConfig;
pub use error::{DbError, Result};
pub use query::execute::{build_context, build_context_with, destroy_context, execute, Context};
pub use query::plan::{ColumnarTable, Data, Plan};
pub use storage::column::DataType;

#[cfg(test)]
pub(crate) mod test_util {
    use once_cell::sync::Lazy;
    use parking_lot::{Mutex, MutexGuard};

    /// Engine state is process-global; tests that drive queries take this
    /// lock to keep the single-query-at-a-time invariant.
    static ENGINE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub fn engine_lock() -> MutexGuard<'static, ()> {
        ENGINE_LOCK.lock()
    }
}
