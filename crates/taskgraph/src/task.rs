//! The per-task lifecycle: memoize in-process, consult the cache,
//! stage inputs, run the body, persist the output.
//!
//! Grounded on SPEC_FULL.md §4.4's eight-step `invoke` protocol. The
//! per-instance output guard and lazily-collected upstream results
//! mirror the shape of `cache/local/mod.rs`'s `OnceCell`-memoized
//! backend handle; the global per-fingerprint lock table is new (no
//! teacher file needed cross-instance dedup at this granularity) and
//! is grounded directly on SPEC_FULL.md §5/§9's "global process state"
//! design note.

use std::{
    cell::RefCell,
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use bon::Builder;
use color_eyre::eyre::Context;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, OnceCell as AsyncOnceCell};
use tracing::{debug, instrument, trace, warn};

use crate::{
    capture::StreamRedirect,
    cache::CacheStore,
    error::{self, RetryTask, TaskGraphError},
    fingerprint::{self, Fingerprint},
    fs,
    handle::TaskHandle,
    scheduler,
    value::Value,
    worker::WorkerPool,
};

/// A registered task body: a pure(ish) computation from an input
/// value to an output value, executed with `work_dir` as its current
/// directory.
///
/// `NAME` and `VERSION` together fold the task type's identity into
/// its fingerprint (see `fingerprint::body_digest`): two distinct body
/// types never collide even with byte-identical inputs, and bumping
/// `VERSION` invalidates every cache entry for a body whose semantics
/// changed. A body must be `Clone` because a copy of it crosses into
/// whatever context actually runs it — a blocking thread, or a worker
/// pool thread — the way a deep-copied input does (see SPEC_FULL.md
/// §5's serialization-boundary note); this crate does not implement
/// the fuller name-based body registry SPEC_FULL.md §9 sketches for
/// genuine cross-process workers, since the worker pool here is
/// in-process (see DESIGN.md).
pub trait TaskBody: Send + Sync + Clone + 'static {
    const NAME: &'static str;
    const VERSION: &'static str;

    fn run(&self, input: &Value, work_dir: &Path) -> error::Result<Value>;
}

/// Which standard streams a policy applies to.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub enum StreamPolicy {
    #[default]
    None,
    Stdout,
    Stderr,
    Both,
}

impl StreamPolicy {
    pub(crate) fn applies_to_stdout(self) -> bool {
        matches!(self, StreamPolicy::Stdout | StreamPolicy::Both)
    }

    pub(crate) fn applies_to_stderr(self) -> bool {
        matches!(self, StreamPolicy::Stderr | StreamPolicy::Both)
    }
}

/// Construction parameters for a [`Task`]. Built with `TaskConfig::builder()...build()`,
/// matching the teacher's own `#[derive(Builder)]` style for richer value types.
#[derive(Builder)]
pub struct TaskConfig<B: TaskBody> {
    body: B,
    #[builder(into)]
    cache_root: PathBuf,
    input: Value,
    #[builder(default)]
    worker: Option<WorkerPool>,
    /// A sticky work directory; when absent, a fresh temporary
    /// directory is created per attempt.
    #[builder(default)]
    work_dir: Option<PathBuf>,
    #[builder(default)]
    capture: StreamPolicy,
    #[builder(default)]
    suppress: StreamPolicy,
    #[builder(into)]
    display_name: Option<String>,
}

enum WorkDirPolicy {
    Sticky(PathBuf),
    Transient(Mutex<Option<tempfile::TempDir>>),
}

/// A maximum of three attempts total: the initial run plus two
/// retries, matching SPEC_FULL.md §4.4's fixed retry bound.
const MAX_ATTEMPTS: u32 = 3;

static FINGERPRINT_LOCKS: LazyLock<DashMap<Fingerprint, Arc<Mutex<()>>>> =
    LazyLock::new(DashMap::new);

fn fingerprint_lock(fingerprint: Fingerprint) -> Arc<Mutex<()>> {
    FINGERPRINT_LOCKS
        .entry(fingerprint)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .value()
        .clone()
}

/// Serializes the window in which a body relies on the ambient
/// current directory and redirected stdio — both process-global —
/// distinct from the per-fingerprint lock table above, which only
/// serializes identical tasks. Two bodies with different fingerprints
/// still resolve dependencies and stage files concurrently; only
/// actual body execution is one-at-a-time process-wide.
static PROCESS_EXEC_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

tokio::task_local! {
    static VISITING: RefCell<HashSet<usize>>;
}

/// Run `fut`, tracking `id` in a task-local visited set so a task
/// whose input transitively contains itself is rejected as
/// `InvalidInput` instead of deadlocking on its own output guard. The
/// first call along a given async task establishes the scope; nested
/// calls (through `scheduler::resolve` invoking further dependency
/// handles) reuse it.
async fn guard_against_cycle<T>(
    id: usize,
    fut: impl std::future::Future<Output = error::Result<T>>,
) -> error::Result<T> {
    if VISITING.try_with(|_| ()).is_ok() {
        let inserted = VISITING.with(|set| set.borrow_mut().insert(id));
        if !inserted {
            return Err(TaskGraphError::InvalidInput(
                "task input graph contains a cycle".to_string(),
            ));
        }
        let result = fut.await;
        VISITING.with(|set| set.borrow_mut().remove(&id));
        result
    } else {
        VISITING.scope(RefCell::new(HashSet::from([id])), fut).await
    }
}

/// Recursively stage every artifact reachable in `value` into
/// `work_dir`.
fn stage<'a>(value: &'a Value, work_dir: &'a Path) -> BoxFuture<'a, error::Result<()>> {
    Box::pin(async move {
        match value {
            Value::Artifact(artifact) => artifact
                .stage_into(work_dir)
                .await
                .map_err(TaskGraphError::Other),
            Value::Map(map) => {
                for v in map.values() {
                    stage(v, work_dir).await?;
                }
                Ok(())
            }
            Value::Seq(items) => {
                for v in items {
                    stage(v, work_dir).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    })
}

/// A single task instance: a body, its input, and everything needed to
/// run it exactly once per distinct fingerprint.
pub struct Task<B: TaskBody> {
    body: B,
    cache: CacheStore,
    input: Value,
    worker: Option<WorkerPool>,
    work_dir: WorkDirPolicy,
    capture: StreamPolicy,
    suppress: StreamPolicy,
    display_name: String,
    output: Mutex<Option<Value>>,
    fingerprint: AsyncOnceCell<Fingerprint>,
}

impl<B: TaskBody> std::fmt::Debug for Task<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("body", &B::NAME)
            .field("version", &B::VERSION)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl<B: TaskBody> Task<B> {
    /// Construct a task, wrapped in the `Arc` every handle and
    /// deferred-output reference to it shares.
    pub fn new(config: TaskConfig<B>) -> error::Result<Arc<Self>> {
        config
            .input
            .validate_root_is_map("task input")
            .map_err(TaskGraphError::Other)?;
        let display_name = config.display_name.unwrap_or_else(|| B::NAME.to_string());
        let work_dir = match config.work_dir {
            Some(path) => WorkDirPolicy::Sticky(path),
            None => WorkDirPolicy::Transient(Mutex::new(None)),
        };
        Ok(Arc::new(Self {
            body: config.body,
            cache: CacheStore::new(config.cache_root),
            input: config.input,
            worker: config.worker,
            work_dir,
            capture: config.capture,
            suppress: config.suppress,
            display_name,
            output: Mutex::new(None),
            fingerprint: AsyncOnceCell::new(),
        }))
    }

    /// A deferred reference to this task's entire output, usable as
    /// another task's input before this one has run.
    pub fn output(self: &Arc<Self>) -> Value {
        Value::Task(Arc::clone(self) as Arc<dyn TaskHandle>)
    }

    /// A deferred reference to a single field of this task's output.
    pub fn field(self: &Arc<Self>, key: impl Into<String>) -> Value {
        Value::Field(Arc::clone(self) as Arc<dyn TaskHandle>, key.into())
    }

    /// Run this task to completion (or return its memoized/cached
    /// output), returning its output value. The async core of the
    /// protocol described in SPEC_FULL.md §4.4; synchronous callers
    /// drive it with their own runtime's `block_on`.
    pub async fn result(&self) -> error::Result<Value> {
        self.invoke_impl().await
    }

    async fn compute_fingerprint(&self) -> error::Result<Fingerprint> {
        self.fingerprint
            .get_or_try_init(|| async {
                fingerprint::fingerprint_of(B::NAME, B::VERSION, &self.input)
                    .await
                    .map_err(TaskGraphError::Other)
            })
            .await
            .copied()
    }

    async fn invoke_impl(&self) -> error::Result<Value> {
        let id = self as *const Self as *const () as usize;
        guard_against_cycle(id, self.invoke_body()).await
    }

    #[instrument(skip(self), fields(task = %self.display_name))]
    async fn invoke_body(&self) -> error::Result<Value> {
        // Step 1: already memoized in this process?
        let mut output_slot = self.output.lock().await;
        if let Some(output) = output_slot.as_ref() {
            return Ok(output.clone());
        }

        // Step 2: resolve upstream dependency tasks.
        let resolved_input = scheduler::resolve(&self.input).await?;

        // Step 3: acquire the global per-fingerprint lock, serializing
        // identical tasks within the process.
        let fingerprint = self.compute_fingerprint().await?;
        let lock = fingerprint_lock(fingerprint);
        let _fingerprint_guard = lock.lock().await;

        // Step 4: cache hit?
        if self.cache.lookup(&fingerprint, &self.display_name).await {
            debug!(%fingerprint, "cache hit");
            let output = self.cache.load(&fingerprint, &self.display_name).await?;
            *output_slot = Some(output.clone());
            return Ok(output);
        }

        // Steps 5-6: stage inputs, run the body, retrying on
        // `RetryTask` up to `MAX_ATTEMPTS`, recreating a transient work
        // directory between attempts.
        let mut work_dir = PathBuf::new();
        let mut attempt = 0u32;
        let body_output = loop {
            attempt += 1;
            work_dir = self.work_dir_for_attempt(attempt).await?;
            stage(&resolved_input, &work_dir).await?;

            match self.run_body(&resolved_input, &work_dir, &fingerprint).await {
                Ok(output) => break output,
                Err(TaskGraphError::Other(err)) if err.downcast_ref::<RetryTask>().is_some() => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(TaskGraphError::RetriesExhausted { attempts: attempt });
                    }
                    warn!(attempt, "task body requested a retry");
                }
                Err(other) => return Err(other),
            }
        };

        // Step 7: validate output shape.
        body_output
            .validate_root_is_map("task output")
            .map_err(TaskGraphError::Other)?;

        // Step 8: store, release locks (implicit on scope exit), return.
        let mut committed_output = body_output.clone();
        let input_debug = fingerprint::canonical_json(B::NAME, B::VERSION, &resolved_input)
            .await
            .map_err(TaskGraphError::Other)?;
        self.cache
            .store(
                &fingerprint,
                &self.display_name,
                &mut committed_output,
                &work_dir,
                &input_debug,
            )
            .await?;

        debug!(%fingerprint, "stored cache entry");
        *output_slot = Some(committed_output.clone());
        Ok(committed_output)
    }

    async fn work_dir_for_attempt(&self, attempt: u32) -> error::Result<PathBuf> {
        match &self.work_dir {
            WorkDirPolicy::Sticky(path) => {
                fs::create_dir_all(path).await.map_err(TaskGraphError::Other)?;
                Ok(path.clone())
            }
            WorkDirPolicy::Transient(slot) => {
                let mut slot = slot.lock().await;
                if attempt > 1 {
                    trace!(attempt, "recycling transient work directory");
                }
                let dir = tempfile::tempdir()
                    .context("create transient work directory")
                    .map_err(TaskGraphError::Other)?;
                let path = dir.path().to_path_buf();
                // Dropping the previous `TempDir` here removes it from
                // disk, satisfying the "destroy and recreate" rule.
                *slot = Some(dir);
                Ok(path)
            }
        }
    }

    async fn run_body(
        &self,
        input: &Value,
        work_dir: &Path,
        fingerprint: &Fingerprint,
    ) -> error::Result<Value> {
        let stdout_path = self.cache.stdout_log_path(fingerprint, &self.display_name);
        let stderr_path = self.cache.stderr_log_path(fingerprint, &self.display_name);
        if let Some(parent) = stdout_path.parent() {
            fs::create_dir_all(parent).await.map_err(TaskGraphError::Other)?;
        }

        let body = self.body.clone();
        let input = input.clone();
        let work_dir_owned = work_dir.to_path_buf();
        let capture = self.capture;
        let suppress = self.suppress;

        let job = move || -> color_eyre::Result<Value> {
            let _redirect = StreamRedirect::install(capture, suppress, &stdout_path, &stderr_path)
                .context("install stream redirection")?;
            let _cwd_guard = CwdGuard::enter(&work_dir_owned).context("enter work directory")?;
            // Unwrap an `Other`-variant error back to its inner `eyre::Error`
            // rather than boxing it a second time, so a `RetryTask` raised
            // by the body stays directly `downcast_ref`-able once this
            // crosses back into `invoke_body`.
            body.run(&input, &work_dir_owned).map_err(|err| match err {
                TaskGraphError::Other(inner) => inner,
                other => color_eyre::eyre::Error::new(other),
            })
        };

        let _exec_guard = PROCESS_EXEC_MUTEX.lock().await;
        let result = if let Some(worker) = &self.worker {
            worker.dispatch(job).await
        } else {
            tokio::task::spawn_blocking(job)
                .await
                .context("join blocking task")?
        };
        result.map_err(TaskGraphError::Other)
    }
}

impl<B: TaskBody> TaskHandle for Task<B> {
    fn fingerprint(&self) -> BoxFuture<'_, error::Result<Fingerprint>> {
        Box::pin(self.compute_fingerprint())
    }

    fn invoke(&self) -> BoxFuture<'_, error::Result<Value>> {
        Box::pin(self.invoke_impl())
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    fn enter(dir: &Path) -> std::io::Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Clone)]
    struct Sum {
        invocations: Arc<AtomicUsize>,
    }

    impl TaskBody for Sum {
        const NAME: &'static str = "Sum";
        const VERSION: &'static str = "v1";

        fn run(&self, input: &Value, _work_dir: &Path) -> error::Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let a = input.get("a").and_then(Value::as_int).unwrap_or_default();
            let b = input.get("b").and_then(Value::as_int).unwrap_or_default();
            Ok(Value::map([("sum".to_string(), Value::Int(a + b))]))
        }
    }

    #[derive(Clone)]
    struct FlakyThenOk {
        attempts: Arc<AtomicUsize>,
        succeed_on: u32,
    }

    impl TaskBody for FlakyThenOk {
        const NAME: &'static str = "FlakyThenOk";
        const VERSION: &'static str = "v1";

        fn run(&self, _input: &Value, _work_dir: &Path) -> error::Result<Value> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.succeed_on as usize {
                return Err(TaskGraphError::Other(color_eyre::eyre::Error::new(RetryTask)));
            }
            Ok(Value::map([("ok".to_string(), Value::Bool(true))]))
        }
    }

    #[tokio::test]
    async fn repeated_run_is_a_cache_hit_with_no_second_invocation() {
        let cache_root = tempdir().unwrap();
        let invocations = Arc::new(AtomicUsize::new(0));
        let body = Sum { invocations: Arc::clone(&invocations) };
        let input = Value::map([("a".to_string(), Value::Int(2)), ("b".to_string(), Value::Int(3))]);

        let config = TaskConfig::builder()
            .body(body.clone())
            .cache_root(cache_root.path())
            .input(input.clone())
            .display_name("Sum")
            .build();
        let task = Task::new(config).unwrap();
        let first = task.result().await.unwrap();
        assert_eq!(first.get("sum").unwrap().as_int(), Some(5));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // A *fresh* task instance with the same body/input should hit
        // the on-disk cache and never invoke the body again.
        let config2 = TaskConfig::builder()
            .body(body)
            .cache_root(cache_root.path())
            .input(input)
            .display_name("Sum")
            .build();
        let task2 = Task::new(config2).unwrap();
        let second = task2.result().await.unwrap();
        assert_eq!(second.get("sum").unwrap().as_int(), Some(5));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_instance_invoked_concurrently_runs_body_once() {
        let cache_root = tempdir().unwrap();
        let invocations = Arc::new(AtomicUsize::new(0));
        let body = Sum { invocations: Arc::clone(&invocations) };
        let input = Value::map([("a".to_string(), Value::Int(10)), ("b".to_string(), Value::Int(20))]);
        let config = TaskConfig::builder()
            .body(body)
            .cache_root(cache_root.path())
            .input(input)
            .display_name("Sum")
            .build();
        let task = Arc::new(Task::new(config).unwrap());

        let (a, b) = tokio::join!(task.result(), task.result());
        assert_eq!(a.unwrap().get("sum").unwrap().as_int(), Some(30));
        assert_eq!(b.unwrap().get("sum").unwrap().as_int(), Some(30));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_the_body_succeeds() {
        let cache_root = tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let body = FlakyThenOk { attempts: Arc::clone(&attempts), succeed_on: 3 };
        let config = TaskConfig::builder()
            .body(body)
            .cache_root(cache_root.path())
            .input(Value::map([]))
            .display_name("FlakyThenOk")
            .build();
        let task = Task::new(config).unwrap();
        let output = task.result().await.unwrap();
        assert!(matches!(output.get("ok"), Some(Value::Bool(true))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_retries_exhausted() {
        let cache_root = tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let body = FlakyThenOk { attempts: Arc::clone(&attempts), succeed_on: 10 };
        let config = TaskConfig::builder()
            .body(body)
            .cache_root(cache_root.path())
            .input(Value::map([]))
            .display_name("FlakyThenOk")
            .build();
        let task = Task::new(config).unwrap();
        let err = task.result().await.unwrap_err();
        assert!(matches!(err, TaskGraphError::RetriesExhausted { attempts: 3 }));
    }

    #[derive(Clone)]
    struct Identity;
    impl TaskBody for Identity {
        const NAME: &'static str = "Identity";
        const VERSION: &'static str = "v1";
        fn run(&self, _input: &Value, _work_dir: &Path) -> error::Result<Value> {
            Ok(Value::map([]))
        }
    }

    #[derive(Debug)]
    struct LazyHandle(Arc<std::sync::OnceLock<Arc<Task<Identity>>>>);

    impl TaskHandle for LazyHandle {
        fn fingerprint(&self) -> BoxFuture<'_, error::Result<Fingerprint>> {
            Box::pin(async move { self.0.get().expect("initialized before use").fingerprint().await })
        }
        fn invoke(&self) -> BoxFuture<'_, error::Result<Value>> {
            Box::pin(async move { self.0.get().expect("initialized before use").invoke().await })
        }
        fn display_name(&self) -> &str {
            "lazy"
        }
    }

    #[tokio::test]
    async fn self_referential_input_is_rejected_as_invalid_input() {
        use std::sync::OnceLock;

        let cache_root = tempdir().unwrap();
        let cell: Arc<OnceLock<Arc<Task<Identity>>>> = Arc::new(OnceLock::new());
        let cell_for_input = Arc::clone(&cell);
        // Build a task whose input refers to itself via a `Field` node
        // over a not-yet-initialized cell; we populate the cell with
        // the task's own handle right after construction, producing a
        // genuine cycle once `result()` is called.
        let config = TaskConfig::builder()
            .body(Identity)
            .cache_root(cache_root.path())
            .input(Value::map([(
                "self".to_string(),
                Value::Field(
                    Arc::new(LazyHandle(cell_for_input)) as Arc<dyn TaskHandle>,
                    "self".to_string(),
                ),
            )]))
            .display_name("Identity")
            .build();
        let task = Task::new(config).unwrap();
        cell.set(Arc::clone(&task)).ok();

        let err = task.result().await.unwrap_err();
        assert!(matches!(err, TaskGraphError::InvalidInput(_)));
    }
}
