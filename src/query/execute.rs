//! Engine entry points: context lifecycle and plan execution.

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::memory::{page_pool, query_arena};
use crate::query::import;
use crate::query::plan::{ColumnarTable, Plan};
use crate::scheduler;

/// Handle to an initialized engine: scheduler and memory pools.
pub struct Context {
    _private: (),
}

/// Set up the scheduler and memory pools with default configuration.
pub fn build_context() -> Context {
    build_context_with(EngineConfig::from_env())
}

/// Set up the scheduler and memory pools.
pub fn build_context_with(config: EngineConfig) -> Context {
    scheduler::setup(&config);
    Context { _private: () }
}

/// Tear down a context. The worker pool and pools stay resident for the
/// process; this only marks the handle as spent.
pub fn destroy_context(context: Context) {
    drop(context);
}

/// Execute a plan against the engine, returning the materialized result.
pub fn execute(plan: &Plan, _context: &Context) -> Result<ColumnarTable> {
    scheduler::start_query();
    page_pool::start_query();

    let result = (|| {
        let data_source = import::import_tables(plan);
        let mut prepared = import::import_plan(data_source, plan)?;
        prepared.run()
    })();

    query_arena::end_query();
    scheduler::end_query();

    match result {
        Err(DbError::Execution(message)) if message.contains("query memory exhausted") => {
            Err(DbError::QueryMemoryExhausted { requested: 0 })
        }
        other => {
            if other.is_err() {
                debug!("query failed, pools reclaimed at next start");
            }
            other
        }
    }
}
