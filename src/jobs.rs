use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{ContentAddress, JobStatus, SorterName};
use crate::error::SfError;
use crate::runner::{ConsoleLine, ConsoleLog, SorterRunner};
use crate::store::{ContentStore, canonical_json, sha1_hex};

/// Everything a sorter process needs to run one recording.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequest {
    pub sorter: SorterName,
    pub parameters: Value,
    pub recording_object: Value,
    pub command: Vec<String>,
}

impl JobRequest {
    /// Stable identity of the request, independent of how the sorter is launched.
    pub fn cache_key(&self) -> Result<String, SfError> {
        let identity = json!({
            "sorter": self.sorter.as_str(),
            "parameters": self.parameters,
            "recording": self.recording_object,
        });
        Ok(sha1_hex(&canonical_json(&identity)?))
    }
}

/// Telemetry captured for one job. Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub return_value: Option<Value>,
    pub error_message: Option<String>,
    pub console_lines: Vec<ConsoleLine>,
    pub timestamp_started: Option<f64>,
    pub timestamp_completed: Option<f64>,
    #[serde(default)]
    pub from_cache: bool,
}

impl JobState {
    pub fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            return_value: None,
            error_message: None,
            console_lines: Vec::new(),
            timestamp_started: None,
            timestamp_completed: None,
            from_cache: false,
        }
    }
}

/// Shared view of an asynchronously executing job. Only the executing worker writes to it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    state: Arc<Mutex<JobState>>,
}

impl JobHandle {
    pub fn new() -> Self {
        Self::from_state(JobState::pending())
    }

    pub fn from_state(state: JobState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A job that never ran.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::from_state(JobState {
            status: JobStatus::Error,
            error_message: Some(message.into()),
            ..JobState::pending()
        })
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> JobState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        // A worker that panicked mid-update leaves the last written state, which is still readable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut JobState)) {
        f(&mut self.lock());
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Asynchronous job submission facility.
pub trait JobHandler: Send + Sync {
    fn submit(&self, request: JobRequest) -> JobHandle;
    /// Blocks until every submitted job reached a terminal state.
    fn wait_all(&self) -> Result<(), SfError>;
    /// Releases workers. Safe to call more than once.
    fn cleanup(&self);
}

/// Finished jobs stored by request identity under a named feed.
pub struct JobCache {
    feed: String,
    store: Arc<dyn ContentStore>,
    index_dir: std::path::PathBuf,
}

impl JobCache {
    pub fn new(
        feed: impl Into<String>,
        store: Arc<dyn ContentStore>,
        cache_root: &std::path::Path,
    ) -> Self {
        let feed = feed.into();
        let index_dir = cache_root.join("job-cache").join(&feed);
        Self {
            feed,
            store,
            index_dir,
        }
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn lookup(&self, key: &str) -> Option<JobState> {
        let pointer = self.index_dir.join(key);
        let address: ContentAddress = std::fs::read_to_string(&pointer).ok()?.parse().ok()?;
        let value = self.store.load_json(&address).ok()?;
        let state: JobState = serde_json::from_value(value).ok()?;
        (state.status == JobStatus::Finished).then_some(JobState {
            from_cache: true,
            ..state
        })
    }

    pub fn record(&self, key: &str, state: &JobState) -> Result<(), SfError> {
        if state.status != JobStatus::Finished {
            return Ok(());
        }
        let value =
            serde_json::to_value(state).map_err(|err| SfError::JobHandler(err.to_string()))?;
        let address = self.store.store_json(&value)?;
        let pointer = camino::Utf8PathBuf::from_path_buf(self.index_dir.join(key))
            .map_err(|_| SfError::Filesystem("job cache path is not valid UTF-8".to_string()))?;
        crate::store::write_file_atomic(&pointer, address.to_string().as_bytes())
    }
}

struct QueuedJob {
    request: JobRequest,
    handle: JobHandle,
    cache_key: Option<String>,
}

/// Fixed-size pool of worker threads fed through a channel.
pub struct ParallelJobHandler {
    sender: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cache: Option<Arc<JobCache>>,
}

impl ParallelJobHandler {
    pub fn start(
        num_workers: usize,
        runner: Arc<dyn SorterRunner>,
        cache: Option<JobCache>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>();
        let rx = Arc::new(Mutex::new(rx));
        let cache = cache.map(Arc::new);

        let workers = (0..num_workers.max(1))
            .map(|index| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                let cache = cache.clone();
                thread::Builder::new()
                    .name(format!("sf-worker-{index}"))
                    .spawn(move || worker_loop(rx, runner, cache))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = workers.len(), "job handler started");
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            cache,
        }
    }

    fn shutdown(&self) -> Result<(), SfError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| SfError::JobHandler("sender lock poisoned".to_string()))?
            .take();
        drop(sender);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .map_err(|_| SfError::JobHandler("worker lock poisoned".to_string()))?,
        );
        let mut panicked = 0usize;
        for worker in workers {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(SfError::JobHandler(format!("{panicked} worker(s) panicked")));
        }
        Ok(())
    }
}

impl JobHandler for ParallelJobHandler {
    fn submit(&self, request: JobRequest) -> JobHandle {
        let handle = JobHandle::new();

        let cache_key = match (&self.cache, request.cache_key()) {
            (Some(_), Ok(key)) => Some(key),
            (Some(_), Err(err)) => {
                tracing::warn!(error = %err, "could not compute job cache key");
                None
            }
            (None, _) => None,
        };
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(cached) = cache.lookup(key) {
                tracing::info!(sorter = %request.sorter, feed = cache.feed(), "job cache hit");
                handle.update(|state| *state = cached);
                return handle;
            }
        }

        handle.update(|state| state.status = JobStatus::Queued);
        let queued = QueuedJob {
            request,
            handle: handle.clone(),
            cache_key,
        };
        let sent = match self.sender.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(queued).map_err(|_| "job queue closed".to_string()),
                None => Err("job handler already shut down".to_string()),
            },
            Err(_) => Err("sender lock poisoned".to_string()),
        };
        if let Err(message) = sent {
            tracing::debug!(%message, "job could not be queued");
            handle.update(|state| {
                state.status = JobStatus::Error;
                state.error_message = Some(message);
            });
        }
        handle
    }

    fn wait_all(&self) -> Result<(), SfError> {
        self.shutdown()
    }

    fn cleanup(&self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "job handler cleanup failed");
        }
    }
}

impl Drop for ParallelJobHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn worker_loop(
    rx: Arc<Mutex<Receiver<QueuedJob>>>,
    runner: Arc<dyn SorterRunner>,
    cache: Option<Arc<JobCache>>,
) {
    loop {
        let next = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let Ok(job) = next else {
            return;
        };
        run_job(&job, runner.as_ref());
        if let (Some(cache), Some(key)) = (&cache, &job.cache_key) {
            if let Err(err) = cache.record(key, &job.handle.snapshot()) {
                tracing::warn!(error = %err, "failed to record job in cache");
            }
        }
    }
}

fn run_job(job: &QueuedJob, runner: &dyn SorterRunner) {
    let sorter = job.request.sorter;
    job.handle.update(|state| {
        state.status = JobStatus::Running;
        state.timestamp_started = Some(now_seconds());
    });
    tracing::debug!(%sorter, "job started");

    let mut console = ConsoleLog::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&job.request, &mut console)))
        .unwrap_or_else(|payload| {
            Err(SfError::SorterFailed {
                sorter: sorter.to_string(),
                message: format!("runner panicked: {}", panic_message(payload.as_ref())),
            })
        });
    let completed = now_seconds();

    job.handle.update(|state| {
        state.console_lines = console.into_lines();
        state.timestamp_completed = Some(completed);
        match outcome {
            Ok(value) => {
                state.status = JobStatus::Finished;
                state.return_value = Some(value);
            }
            Err(err) => {
                state.status = JobStatus::Error;
                state.error_message = Some(err.to_string());
            }
        }
    });
    tracing::debug!(%sorter, status = %job.handle.status(), "job completed");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner;

    impl SorterRunner for EchoRunner {
        fn run(&self, request: &JobRequest, console: &mut ConsoleLog) -> Result<Value, SfError> {
            console.push("sorting");
            Ok(json!({"sorter": request.sorter.as_str()}))
        }
    }

    #[test]
    fn jobs_finish_after_wait() {
        let handler = ParallelJobHandler::start(2, Arc::new(EchoRunner), None);
        let handles: Vec<JobHandle> = (0..5)
            .map(|_| {
                handler.submit(JobRequest {
                    sorter: SorterName::MountainSort4,
                    parameters: json!({}),
                    recording_object: json!({}),
                    command: vec![],
                })
            })
            .collect();
        handler.wait_all().unwrap();
        for handle in handles {
            let state = handle.snapshot();
            assert_eq!(state.status, JobStatus::Finished);
            assert_eq!(state.console_lines.len(), 1);
            assert!(state.timestamp_started.is_some());
        }
    }

    #[test]
    fn submit_after_shutdown_errors_the_job() {
        let handler = ParallelJobHandler::start(1, Arc::new(EchoRunner), None);
        handler.cleanup();
        let handle = handler.submit(JobRequest {
            sorter: SorterName::Kilosort2,
            parameters: json!({}),
            recording_object: json!({}),
            command: vec![],
        });
        assert_eq!(handle.status(), JobStatus::Error);
    }
}
