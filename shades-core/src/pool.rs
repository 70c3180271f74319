//! Bounded, crash-isolated execution of file checks.
//!
//! Every file is checked inside its own blocking task, so a panicking
//! formatter only loses that one file. External formatters additionally run
//! in their own OS process. A [`StopSignal`] halts dispatch; in-flight tasks
//! get a grace period and are then abandoned while completed results are
//! kept.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep};

use crate::domain::{Failure, FileResult, FileStatus};
use crate::formatter::Formatter;
use crate::fs::FileSystem;
use crate::invoker::{check_source, panic_message};

/// Default time in-flight tasks get to finish after a stop request.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// One file to check.
#[derive(Debug, Clone)]
pub struct FileTask {
    /// Owning project name.
    pub project: String,
    /// Path recorded in the result, relative to the project root.
    pub relative_path: String,
    /// Path the source is read from.
    pub absolute_path: PathBuf,
    /// Formatter arguments for this file's project.
    pub args: Arc<Vec<String>>,
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Parallel workers; zero means the available hardware parallelism.
    pub workers: usize,
    /// How long in-flight tasks may run after a stop request.
    pub grace_period: Duration,
    /// Optional limit for a single file check.
    pub task_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            grace_period: DEFAULT_GRACE_PERIOD,
            task_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Number of workers actually used.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }
}

/// Sent after every completed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Files completed so far.
    pub completed: usize,
    /// Files submitted.
    pub total: usize,
    /// Project of the completed file.
    pub project: String,
    /// Relative path of the completed file.
    pub path: String,
    /// Status of the completed file.
    pub status: FileStatus,
}

/// A completed file check.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Owning project name.
    pub project: String,
    /// Result of the check.
    pub result: FileResult,
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Completed checks, in completion order.
    pub results: Vec<TaskOutcome>,
    /// Whether a stop request cut the run short.
    pub interrupted: bool,
    /// In-flight tasks abandoned after the grace period.
    pub abandoned: usize,
    /// Tasks never dispatched.
    pub not_started: usize,
}

/// Requests a stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the pool to stop dispatching.
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

/// Observes stop requests.
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once a stop is requested.
    pub async fn stopped(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                // Every handle is gone; no stop can arrive anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        StopHandle {
            sender: Arc::new(sender),
        },
        StopSignal { receiver },
    )
}

/// Runs file checks with bounded parallelism.
pub struct WorkerPool {
    formatter: Arc<dyn Formatter>,
    fs: Arc<dyn FileSystem>,
    config: PoolConfig,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl WorkerPool {
    /// Create a pool.
    pub fn new(formatter: Arc<dyn Formatter>, fs: Arc<dyn FileSystem>, config: PoolConfig) -> Self {
        Self {
            formatter,
            fs,
            config,
            progress: None,
        }
    }

    /// Report progress on `sender` as files complete.
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Check every task, honoring `stop`.
    pub async fn run(&self, tasks: Vec<FileTask>, mut stop: StopSignal) -> PoolReport {
        let total = tasks.len();
        let workers = self.config.effective_workers();
        info!("checking {total} files with {workers} workers");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut running: JoinSet<TaskOutcome> = JoinSet::new();
        let mut report = PoolReport::default();
        let mut pending = tasks.into_iter();

        'dispatch: while let Some(task) = pending.next() {
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => {
                        report.interrupted = true;
                        report.not_started = 1 + pending.len();
                        break 'dispatch;
                    }
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        self.record(joined, &mut report, total);
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => {
                            report.not_started = 1 + pending.len();
                            break 'dispatch;
                        }
                    },
                }
            };
            running.spawn(self.execute(task, permit));
        }

        if report.interrupted {
            info!(
                "stop requested; {} files not started, waiting for {} in flight",
                report.not_started,
                running.len()
            );
        }

        let grace = sleep(self.config.grace_period);
        tokio::pin!(grace);
        let mut grace_armed = report.interrupted;
        while !running.is_empty() {
            tokio::select! {
                biased;
                joined = running.join_next() => match joined {
                    Some(joined) => self.record(joined, &mut report, total),
                    None => break,
                },
                _ = stop.stopped(), if !grace_armed => {
                    info!("stop requested; waiting for {} files in flight", running.len());
                    report.interrupted = true;
                    grace_armed = true;
                    grace.as_mut().reset(Instant::now() + self.config.grace_period);
                }
                _ = &mut grace, if grace_armed => {
                    report.abandoned += running.len();
                    warn!("abandoning {} files after the grace period", running.len());
                    running.abort_all();
                    break;
                }
            }
        }

        debug!(
            "pool finished: {} completed, {} abandoned, {} not started",
            report.results.len(),
            report.abandoned,
            report.not_started
        );
        report
    }

    fn execute(
        &self,
        task: FileTask,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = TaskOutcome> + Send + 'static {
        let formatter = Arc::clone(&self.formatter);
        let fs = Arc::clone(&self.fs);
        let timeout = self.config.task_timeout;

        async move {
            let FileTask {
                project,
                relative_path,
                absolute_path,
                args,
            } = task;

            let read = tokio::task::spawn_blocking(move || fs.read_to_string(&absolute_path)).await;
            let source = match read {
                Ok(Ok(source)) => source,
                Ok(Err(err)) => {
                    let failure = Failure::crash(format!("could not read source: {err}"));
                    return TaskOutcome {
                        project,
                        result: FileResult::failed(relative_path, String::new(), failure),
                    };
                }
                Err(err) => {
                    let failure = Failure::crash(join_error_message(err));
                    return TaskOutcome {
                        project,
                        result: FileResult::failed(relative_path, String::new(), failure),
                    };
                }
            };

            // The permit travels with the blocking work so a check that
            // outlives its timeout still occupies its worker slot.
            let path = relative_path.clone();
            let text = source.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                check_source(formatter.as_ref(), &relative_path, text, &args)
            });

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("{project}: {path} timed out after {}s", limit.as_secs_f64());
                        let failure =
                            Failure::crash(format!("timed out after {}s", limit.as_secs_f64()));
                        return TaskOutcome {
                            project,
                            result: FileResult::failed(path, source, failure),
                        };
                    }
                },
                None => handle.await,
            };

            let result = match joined {
                Ok(result) => result,
                Err(err) => FileResult::failed(path, source, Failure::crash(join_error_message(err))),
            };
            TaskOutcome { project, result }
        }
    }

    fn record(
        &self,
        joined: Result<TaskOutcome, JoinError>,
        report: &mut PoolReport,
        total: usize,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("file check task failed: {err}");
                report.abandoned += 1;
                return;
            }
        };
        report.results.push(outcome);

        if let Some(progress) = &self.progress {
            let Some(last) = report.results.last() else {
                return;
            };
            // A dropped receiver only means nobody is watching.
            let _ = progress.send(Progress {
                completed: report.results.len(),
                total,
                project: last.project.clone(),
                path: last.result.path().to_string(),
                status: last.result.status(),
            });
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("worker panicked: {}", panic_message(err.into_panic().as_ref()))
    } else {
        format!("worker cancelled: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::{FileTask, PoolConfig, StopSignal, WorkerPool, stop_signal};
    use crate::ShadesError;
    use crate::domain::{Failure, FailureKind, FileStatus};
    use crate::formatter::{Formatter, MockFormatter};
    use crate::fs::{FileSystem, MockFileSystem};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn tasks(paths: &[&str]) -> Vec<FileTask> {
        let args = Arc::new(Vec::new());
        paths
            .iter()
            .map(|path| FileTask {
                project: "p".to_string(),
                relative_path: path.to_string(),
                absolute_path: PathBuf::from("/checkout").join(path),
                args: Arc::clone(&args),
            })
            .collect()
    }

    fn echo_fs() -> Arc<dyn FileSystem> {
        let mut fs = MockFileSystem::new();
        fs.expect_read_to_string()
            .returning(|path| Ok(format!("# {}\n", path.display())));
        Arc::new(fs)
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            grace_period: Duration::from_millis(50),
            task_timeout: None,
        }
    }

    struct Sleepy(Duration);

    impl Formatter for Sleepy {
        fn identity(&self) -> String {
            "sleepy".to_string()
        }

        fn format(&self, source: &str, _: &Path, _: &[String]) -> Result<String, Failure> {
            std::thread::sleep(self.0);
            Ok(source.to_string())
        }
    }

    struct PanicsOn(&'static str);

    impl Formatter for PanicsOn {
        fn identity(&self) -> String {
            "panics".to_string()
        }

        fn format(&self, source: &str, path: &Path, _: &[String]) -> Result<String, Failure> {
            if path == Path::new(self.0) {
                panic!("cannot handle {}", path.display());
            }
            Ok(source.to_string())
        }
    }

    #[tokio::test]
    async fn checks_every_task_and_reports_progress() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .returning(|source, _, _| Ok(source.to_string()));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(Arc::new(formatter), echo_fs(), config(2)).with_progress(sender);

        let report = pool
            .run(tasks(&["a.py", "b.py", "c.py"]), StopSignal::never())
            .await;

        assert_eq!(report.results.len(), 3);
        assert!(!report.interrupted);
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.not_started, 0);

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().map(|event| event.completed), Some(3));
        assert!(events.iter().all(|event| event.total == 3));
        assert!(events.iter().all(|event| event.status == FileStatus::Unchanged));
    }

    #[tokio::test]
    async fn a_crashing_file_does_not_take_down_siblings() {
        let pool = WorkerPool::new(Arc::new(PanicsOn("b.py")), echo_fs(), config(2));

        let report = pool
            .run(tasks(&["a.py", "b.py", "c.py"]), StopSignal::never())
            .await;

        assert_eq!(report.results.len(), 3);
        let crashed: Vec<&str> = report
            .results
            .iter()
            .filter(|outcome| {
                outcome.result.failure().map(|failure| failure.kind) == Some(FailureKind::Crash)
            })
            .map(|outcome| outcome.result.path())
            .collect();
        assert_eq!(crashed, vec!["b.py"]);
    }

    #[tokio::test]
    async fn stop_before_dispatch_starts_nothing() {
        let (handle, signal) = stop_signal();
        handle.stop();
        let pool = WorkerPool::new(Arc::new(MockFormatter::new()), echo_fs(), config(2));

        let report = pool.run(tasks(&["a.py", "b.py"]), signal).await;

        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert_eq!(report.not_started, 2);
    }

    #[tokio::test]
    async fn stop_keeps_completed_results() {
        let (handle, signal) = stop_signal();
        let mut pool_config = config(1);
        pool_config.grace_period = Duration::from_secs(5);
        let pool = WorkerPool::new(
            Arc::new(Sleepy(Duration::from_millis(200))),
            echo_fs(),
            pool_config,
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });
        let report = pool.run(tasks(&["a.py", "b.py", "c.py"]), signal).await;

        assert!(report.interrupted);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.not_started, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn in_flight_tasks_are_abandoned_after_grace() {
        let (handle, signal) = stop_signal();
        let pool = WorkerPool::new(
            Arc::new(Sleepy(Duration::from_millis(500))),
            echo_fs(),
            config(1),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });
        let report = pool.run(tasks(&["slow.py"]), signal).await;

        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn slow_files_time_out_as_crashes() {
        let mut pool_config = config(1);
        pool_config.task_timeout = Some(Duration::from_millis(20));
        let pool = WorkerPool::new(
            Arc::new(Sleepy(Duration::from_millis(300))),
            echo_fs(),
            pool_config,
        );

        let report = pool.run(tasks(&["slow.py"]), StopSignal::never()).await;

        let result = &report.results[0].result;
        let failure = result.failure().expect("timed out");
        assert_eq!(failure.kind, FailureKind::Crash);
        assert!(failure.message.starts_with("timed out"));
        assert_eq!(result.source(), "# /checkout/slow.py\n");
    }

    #[derive(Default)]
    struct Counting {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Formatter for Counting {
        fn identity(&self) -> String {
            "counting".to_string()
        }

        fn format(&self, source: &str, _: &Path, _: &[String]) -> Result<String, Failure> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(source.to_string())
        }
    }

    #[tokio::test]
    async fn timed_out_checks_keep_their_worker_slot() {
        let counting = Arc::new(Counting::default());
        let mut pool_config = config(2);
        pool_config.task_timeout = Some(Duration::from_millis(10));
        let formatter: Arc<dyn Formatter> = counting.clone();
        let pool = WorkerPool::new(formatter, echo_fs(), pool_config);

        let report = pool
            .run(
                tasks(&["a.py", "b.py", "c.py", "d.py", "e.py", "f.py"]),
                StopSignal::never(),
            )
            .await;

        assert_eq!(report.results.len(), 6);
        assert!(
            report
                .results
                .iter()
                .all(|outcome| outcome.result.status() == FileStatus::Failed)
        );
        let peak = counting.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn unreadable_sources_are_crashes() {
        let mut fs = MockFileSystem::new();
        fs.expect_read_to_string()
            .returning(|_| Err(ShadesError::Other("denied".to_string())));
        let pool = WorkerPool::new(Arc::new(MockFormatter::new()), Arc::new(fs), config(1));

        let report = pool.run(tasks(&["a.py"]), StopSignal::never()).await;

        let failure = report.results[0].result.failure().expect("failed");
        assert_eq!(failure.kind, FailureKind::Crash);
        assert!(failure.message.starts_with("could not read source"));
    }

    #[test]
    fn zero_workers_uses_available_parallelism() {
        assert!(PoolConfig::default().effective_workers() >= 1);
        assert_eq!(config(3).effective_workers(), 3);
    }
}
