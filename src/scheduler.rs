//! Worker-thread pool with single-slot cooperative task dispatch.
//!
//! The main thread (worker 0) publishes one task at a time into an atomic
//! slot; workers spin, then sleep with jitter, on that slot. Between
//! queries worker 1 runs background maintenance: first-time setup of the
//! memory pools and incremental prefaulting up to the configured target.
//!
//! Ordering: a task is complete once every worker reports `sleeping`
//! again, which `run` waits for before returning. There is no ordering
//! between morsels of the same task.

use std::cell::Cell;
use std::hint::spin_loop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::memory::{page_pool, query_arena};

/// Sentinel row id: initialize the worker's local state.
pub const MORSEL_INIT: u64 = u64::MAX - 1;
/// Sentinel row id: finalize the worker's local state.
pub const MORSEL_FINI: u64 = u64::MAX;

const TASK_NONE: usize = 0;
const TASK_DEAD: usize = 1;

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

/// Id of the calling worker; 0 on the main thread.
#[inline]
pub fn thread_id() -> usize {
    WORKER_ID.with(|id| id.get())
}

struct TaskHolder<'a> {
    f: &'a (dyn Fn(usize) + Sync),
}

struct WorkerShared {
    sleeping: AtomicBool,
}

struct SchedulerImpl {
    workers: Mutex<Vec<Arc<WorkerShared>>>,
    joins: Mutex<Vec<thread::JoinHandle<()>>>,
    /// 0 = empty, 1 = shutdown, else `*const TaskHolder`.
    available_task: AtomicUsize,
    setup_done: AtomicBool,
    maintenance_done: AtomicBool,
    do_maintenance: AtomicBool,
    pm_done: AtomicBool,
    qm_done: AtomicBool,
    failure: Mutex<Option<String>>,
}

struct MemoryPlan {
    page_pool_bytes: usize,
    query_pool_bytes: usize,
    concurrency: usize,
}

static IMPL: OnceCell<SchedulerImpl> = OnceCell::new();
static PLAN: OnceCell<MemoryPlan> = OnceCell::new();

fn imp() -> &'static SchedulerImpl {
    IMPL.get().expect("scheduler not set up")
}

fn affinity_threads() -> usize {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
            let count = libc::CPU_COUNT(&set);
            if count > 0 {
                return count as usize;
            }
        }
    }
    num_cpus::get()
}

/// Hardware threads available to this process.
pub fn concurrency() -> usize {
    PLAN.get().map(|p| p.concurrency).unwrap_or_else(affinity_threads)
}

/// Ratio of total hardware threads to the threads we may use; bounds the
/// memory fraction this process claims.
fn unused_ratio(config: &EngineConfig, affinity: usize) -> usize {
    if let Some(ratio) = config.unused_ratio {
        return ratio.max(1);
    }
    let total = sys_info::cpu_num().map(|n| n as usize).unwrap_or(affinity);
    (total / affinity).max(1)
}

/// Resolve pool sizes and spawn the first worker. Later calls are no-ops.
pub fn setup(config: &EngineConfig) {
    PLAN.get_or_init(|| {
        let affinity = config.concurrency.unwrap_or_else(affinity_threads).max(1);
        let ratio = unused_ratio(config, affinity);
        let ram = sys_info::mem_info().map(|m| m.total as usize * 1024).unwrap_or(8 << 30);
        let plan = MemoryPlan {
            page_pool_bytes: config.page_pool_bytes.unwrap_or(ram / ratio / 2),
            query_pool_bytes: config.query_pool_bytes.unwrap_or(ram / ratio * 4 / 5),
            concurrency: affinity,
        };
        debug!(
            workers = plan.concurrency,
            page_pool = plan.page_pool_bytes,
            query_pool = plan.query_pool_bytes,
            "scheduler setup"
        );
        plan
    });
    static STARTED: AtomicBool = AtomicBool::new(false);
    let imp = IMPL.get_or_init(|| SchedulerImpl {
        workers: Mutex::new(Vec::new()),
        joins: Mutex::new(Vec::new()),
        available_task: AtomicUsize::new(TASK_NONE),
        setup_done: AtomicBool::new(false),
        maintenance_done: AtomicBool::new(true),
        do_maintenance: AtomicBool::new(true),
        pm_done: AtomicBool::new(false),
        qm_done: AtomicBool::new(false),
        failure: Mutex::new(None),
    });
    if !STARTED.swap(true, Ordering::SeqCst) {
        if concurrency() == 1 {
            imp.perform_maintenance();
        } else {
            spawn_worker(imp, 1);
        }
    }
}

fn spawn_worker(imp: &'static SchedulerImpl, id: usize) {
    let shared = Arc::new(WorkerShared { sleeping: AtomicBool::new(true) });
    imp.workers.lock().push(shared.clone());
    let join = thread::spawn(move || {
        WORKER_ID.with(|w| w.set(id));
        worker_loop(imp, id, &shared);
    });
    imp.joins.lock().push(join);
}

impl SchedulerImpl {
    fn record_failure(&self, message: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    fn take_failure(&self) -> Option<String> {
        self.failure.lock().take()
    }

    fn perform_maintenance(&'static self) {
        if !self.setup_done.load(Ordering::Acquire) {
            let plan = PLAN.get().expect("memory plan");
            let num_threads = plan.concurrency - 1;
            for id in 2..num_threads + 1 {
                spawn_worker(self, id);
            }
            page_pool::setup(plan.page_pool_bytes, plan.concurrency);
            query_arena::setup(plan.query_pool_bytes, plan.concurrency);
            self.setup_done.store(true, Ordering::Release);

            if num_threads == 0 {
                self.maintenance_done.store(true, Ordering::Release);
                return;
            }
        }

        if self.do_maintenance.load(Ordering::Acquire)
            && !(self.qm_done.load(Ordering::Relaxed) && self.pm_done.load(Ordering::Relaxed))
        {
            self.maintenance_done.store(false, Ordering::Release);
            while self.do_maintenance.load(Ordering::Acquire)
                && !(self.qm_done.load(Ordering::Relaxed) && self.pm_done.load(Ordering::Relaxed))
            {
                if !self.qm_done.load(Ordering::Relaxed) {
                    self.qm_done.store(query_arena::prefault(), Ordering::Relaxed);
                }
                if !self.pm_done.load(Ordering::Relaxed) {
                    self.pm_done.store(page_pool::prefault(), Ordering::Relaxed);
                }
            }
            self.maintenance_done.store(true, Ordering::Release);
        }
    }
}

fn worker_loop(imp: &'static SchedulerImpl, id: usize, shared: &WorkerShared) {
    let mut rng = StdRng::seed_from_u64(id as u64);
    while imp.available_task.load(Ordering::Acquire) != TASK_DEAD {
        if id % 4 == 0 {
            for _ in 0..16 * 1024 {
                if imp.available_task.load(Ordering::Acquire) != TASK_NONE {
                    break;
                }
                spin_loop();
            }
        }
        while imp.available_task.load(Ordering::Acquire) == TASK_NONE {
            for _ in 0..32 {
                if imp.available_task.load(Ordering::Acquire) != TASK_NONE {
                    break;
                }
                spin_loop();
            }
            if id == 1 {
                imp.perform_maintenance();
            }
            thread::sleep(Duration::from_micros(rng.random_range(1..=12)));
        }

        shared.sleeping.store(false, Ordering::Release);
        let task = imp.available_task.load(Ordering::Acquire);
        if task > TASK_DEAD {
            let holder = unsafe { &*(task as *const TaskHolder) };
            let result = catch_unwind(AssertUnwindSafe(|| (holder.f)(id)));
            if let Err(payload) = result {
                imp.record_failure(panic_message(payload));
                imp.available_task.store(TASK_NONE, Ordering::Release);
                shared.sleeping.store(true, Ordering::Release);
                continue;
            }
            if imp.available_task.load(Ordering::Acquire) > TASK_DEAD {
                imp.available_task.store(TASK_NONE, Ordering::Release);
            }
        } else if task == TASK_DEAD {
            break;
        }
        shared.sleeping.store(true, Ordering::Release);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker task panicked".to_string()
    }
}

/// Publish `task` to all workers and participate from the main thread.
/// Returns once every worker has settled; a panic in any worker aborts the
/// task and surfaces as an error.
fn run(task: &(dyn Fn(usize) + Sync)) -> Result<()> {
    let imp = imp();
    if thread_id() != 0 {
        return Err(DbError::Execution("only the main thread can start tasks".into()));
    }
    debug_assert_eq!(imp.available_task.load(Ordering::Relaxed), TASK_NONE);
    let holder = TaskHolder { f: task };
    imp.available_task.store(&holder as *const TaskHolder as usize, Ordering::Release);

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(0))) {
        imp.record_failure(panic_message(payload));
    }

    imp.available_task.store(TASK_NONE, Ordering::Release);
    for worker in imp.workers.lock().iter() {
        while !worker.sleeping.load(Ordering::Acquire) {
            spin_loop();
        }
    }
    imp.available_task.store(TASK_NONE, Ordering::Release);

    match imp.take_failure() {
        Some(message) => Err(DbError::Execution(message)),
        None => Ok(()),
    }
}

struct JobState {
    current: AtomicUsize,
    end: usize,
}

/// Dispatch `size` work items across the pool. Items are grouped into
/// `min(size, concurrency)` jobs; workers drain their own job first, then
/// round-robin-steal from the others. With `finalize` set, every worker
/// that processed at least one item receives `MORSEL_INIT` before its
/// first item and `MORSEL_FINI` after the task drains.
pub fn parallel_impl(size: usize, finalize: bool, task: &(dyn Fn(usize, u64) + Sync)) -> Result<()> {
    let jobs = size.clamp(1, concurrency());
    let step = (size + jobs - 1) / jobs;
    let states: Vec<CachePadded<JobState>> = (0..jobs)
        .map(|i| {
            CachePadded::new(JobState {
                current: AtomicUsize::new(i * step),
                end: ((i + 1) * step).min(size),
            })
        })
        .collect();

    let imp = imp();
    run(&|worker_id: usize| {
        let conc = concurrency();
        let initial_job = (worker_id / ((conc + jobs - 1) / jobs)).min(jobs - 1);
        let mut current_job = initial_job;
        let mut first = finalize;
        while imp.available_task.load(Ordering::Acquire) > TASK_DEAD {
            let job = &states[current_job];
            if job.current.load(Ordering::Relaxed) < job.end {
                loop {
                    let i = job.current.fetch_add(1, Ordering::Relaxed);
                    if i >= job.end {
                        break;
                    }
                    if first {
                        first = false;
                        task(worker_id, MORSEL_INIT);
                    }
                    task(worker_id, i as u64);
                }
            }
            let next_job = if current_job + 1 >= jobs { 0 } else { current_job + 1 };
            if next_job == initial_job {
                break;
            }
            current_job = next_job;
        }
        if !first && finalize {
            task(worker_id, MORSEL_FINI);
        }
    })
}

/// Split `[begin, end)` into morsels of `morsel_size` rows; `task` receives
/// the first row id of each claimed morsel (or a sentinel).
pub fn parallel_morsel(
    begin: u64,
    end: u64,
    morsel_size: u64,
    finalize: bool,
    task: &(dyn Fn(usize, u64) + Sync),
) -> Result<()> {
    let size = (end - begin + morsel_size - 1) / morsel_size;
    parallel_impl(size as usize, finalize, &|worker_id, i| {
        if i >= MORSEL_INIT {
            task(worker_id, i)
        } else {
            task(worker_id, begin + i * morsel_size)
        }
    })
}

/// Run `task` once per index in `[begin, end)`, in parallel.
pub fn parallel_for(begin: u64, end: u64, task: &(dyn Fn(usize, u64) + Sync)) -> Result<()> {
    if begin >= end {
        return Ok(());
    }
    parallel_morsel(begin, end, 1, false, task)
}

/// Quiesce maintenance before a query touches the pools.
pub fn start_query() {
    let imp = imp();
    imp.do_maintenance.store(false, Ordering::Release);
    while !imp.setup_done.load(Ordering::Acquire) {
        spin_loop();
    }
    while !imp.maintenance_done.load(Ordering::Acquire) {
        spin_loop();
    }
    // We observed do_maintenance == false and maintenance_done == true
    // together; only this thread flips do_maintenance, so a worker that was
    // about to start maintenance will notice the flag and back off.
}

/// Re-enable background maintenance after a query.
pub fn end_query() {
    let imp = imp();
    debug_assert!(imp.maintenance_done.load(Ordering::Acquire));
    debug_assert!(!imp.do_maintenance.load(Ordering::Acquire));
    if concurrency() > 1 {
        imp.maintenance_done.store(true, Ordering::Release);
        imp.do_maintenance.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn test_config() -> EngineConfig {
        EngineConfig {
            page_pool_bytes: Some(64 << 20),
            query_pool_bytes: Some(64 << 20),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_parallel_morsel_covers_range() {
        let _guard = crate::test_util::engine_lock();
        setup(&test_config());
        start_query();
        let sum = AtomicU64::new(0);
        let count = AtomicU64::new(0);
        parallel_morsel(0, 1000, 10, false, &|_, row| {
            if row < MORSEL_INIT {
                sum.fetch_add(row, Ordering::Relaxed);
                count.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 100);
        assert_eq!(sum.load(Ordering::Relaxed), (0..100u64).map(|i| i * 10).sum());
        end_query();
    }

    #[test]
    fn test_init_finalize_pairing() {
        let _guard = crate::test_util::engine_lock();
        setup(&test_config());
        start_query();
        let inits = AtomicU64::new(0);
        let finis = AtomicU64::new(0);
        let rows = AtomicU64::new(0);
        parallel_morsel(0, 64, 1, true, &|_, row| match row {
            MORSEL_INIT => {
                inits.fetch_add(1, Ordering::Relaxed);
            }
            MORSEL_FINI => {
                finis.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                rows.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
        assert_eq!(rows.load(Ordering::Relaxed), 64);
        assert_eq!(inits.load(Ordering::Relaxed), finis.load(Ordering::Relaxed));
        assert!(inits.load(Ordering::Relaxed) >= 1);
        end_query();
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let _guard = crate::test_util::engine_lock();
        setup(&test_config());
        start_query();
        let result = parallel_for(0, 100, &|_, row| {
            if row == 57 {
                panic!("boom at row 57");
            }
        });
        match result {
            Err(DbError::Execution(message)) => assert!(message.contains("boom")),
            other => panic!("expected execution error, got {other:?}"),
        }
        end_query();
    }
}
