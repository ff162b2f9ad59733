//! Fair, bounded job scheduler.
//!
//! Jobs queue per client; a single dispatcher task drains them into a
//! bounded worker pool, picking the next client uniformly at random so one
//! aggressive client cannot starve the rest. Worker finalization (slot
//! release, re-signal, working-directory deletion) runs on every exit path.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use rand::seq::IndexedRandom;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compiler::{self, CompileOutcome, CompileRequest, Engine};
use crate::error::ServiceError;

pub const MAX_CONCURRENT: usize = 2;
pub const MAX_QUEUE_SIZE: usize = 20;

/// One queued compilation plus its completion handle. The job exclusively
/// owns `work_dir`; the scheduler deletes it when the job terminates.
pub struct Job {
    pub work_dir: PathBuf,
    pub entrypoint: String,
    pub timeout_secs: u64,
    pub engine: Engine,
    pub halt_on_error: bool,
    pub done: oneshot::Sender<CompileOutcome>,
}

/// Seam between the scheduler and the compilation driver, so tests can
/// observe dispatch without spawning a toolchain.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, req: CompileRequest) -> BoxFuture<'static, CompileOutcome>;
}

struct LatexRunner;

impl JobRunner for LatexRunner {
    fn run(&self, req: CompileRequest) -> BoxFuture<'static, CompileOutcome> {
        Box::pin(compiler::compile_latex(req))
    }
}

#[derive(Default)]
struct SchedState {
    client_jobs: HashMap<String, VecDeque<Job>>,
    pending_count: usize,
}

pub struct QueueManager {
    state: Mutex<SchedState>,
    slots: Arc<Semaphore>,
    has_work: Notify,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    runner: Arc<dyn JobRunner>,
    max_queue_size: usize,
}

impl QueueManager {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Arc<Self> {
        Self::with_runner(max_concurrent, max_queue_size, Arc::new(LatexRunner))
    }

    /// Build a manager around a custom runner. Production code always uses
    /// [`QueueManager::new`]; this is the injection point for scheduler tests.
    pub fn with_runner(
        max_concurrent: usize,
        max_queue_size: usize,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState::default()),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            has_work: Notify::new(),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            runner,
            max_queue_size,
        })
    }

    /// Spawn the dispatcher task. Idempotent only in the sense that callers
    /// invoke it once at startup.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(this.dispatch_loop());
        *self.dispatcher.lock().unwrap() = Some(handle);
    }

    /// Stop dispatching and await the dispatcher. In-flight workers are
    /// abandoned; their finalization still cleans up working directories.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.has_work.notify_one();
        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Enqueue a job for `client_id`. Synchronous; fails when the global
    /// pending cap is reached. Ownership of the job's working directory
    /// transfers to the scheduler on success.
    pub fn submit(&self, client_id: &str, job: Job) -> Result<(), ServiceError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending_count >= self.max_queue_size {
                return Err(ServiceError::QueueFull);
            }
            state
                .client_jobs
                .entry(client_id.to_string())
                .or_default()
                .push_back(job);
            state.pending_count += 1;
        }
        self.has_work.notify_one();
        Ok(())
    }

    /// Total jobs queued and not yet handed to a worker.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending_count
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.has_work.notified() => {}
            }

            while self.pending_count() > 0 && !self.shutdown.is_cancelled() {
                let permit = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                };

                // Dropping an unused permit releases the slot.
                let Some((client_id, job)) = self.pop_random_client_job() else {
                    break;
                };
                tracing::info!(
                    client = %client_id,
                    work_dir = %job.work_dir.display(),
                    "dispatching job"
                );
                let this = Arc::clone(&self);
                tokio::spawn(this.run_job(job, permit));
            }
        }
    }

    /// Pick a client uniformly at random among those with pending jobs and
    /// pop the head of its FIFO. Uniformity over clients, not jobs, is what
    /// keeps a deep queue from buying a larger share.
    fn pop_random_client_job(&self) -> Option<(String, Job)> {
        let mut state = self.state.lock().unwrap();
        let client_id = {
            let candidates: Vec<&String> = state.client_jobs.keys().collect();
            candidates.choose(&mut rand::rng()).map(|c| (*c).clone())?
        };
        let jobs = state.client_jobs.get_mut(&client_id)?;
        let job = jobs.pop_front()?;
        if jobs.is_empty() {
            state.client_jobs.remove(&client_id);
        }
        state.pending_count -= 1;
        Some((client_id, job))
    }

    async fn run_job(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let Job {
            work_dir,
            entrypoint,
            timeout_secs,
            engine,
            halt_on_error,
            done,
        } = job;

        let mut finalizer = JobFinalizer {
            work_dir: work_dir.clone(),
            queue: Arc::clone(&self),
            permit: Some(permit),
            finished: false,
        };

        let outcome = self
            .runner
            .run(CompileRequest {
                work_dir,
                entrypoint,
                timeout_secs,
                engine,
                halt_on_error,
            })
            .await;

        // Finalize before resolving the handle so the caller never observes
        // a completed job whose working directory still exists.
        finalizer.finish();
        if done.send(outcome).is_err() {
            tracing::debug!("completion handle dropped before result delivery");
        }
    }
}

/// Worker finalization: delete the working directory, release the worker
/// slot, and re-signal the dispatcher. The `Drop` impl covers cancellation
/// and panics; the explicit `finish` call covers the normal path.
struct JobFinalizer {
    work_dir: PathBuf,
    queue: Arc<QueueManager>,
    permit: Option<OwnedSemaphorePermit>,
    finished: bool,
}

impl JobFinalizer {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
            tracing::debug!("work dir cleanup: {e}");
        }
        self.permit.take();
        self.queue.has_work.notify_one();
    }
}

impl Drop for JobFinalizer {
    fn drop(&mut self) {
        self.finish();
    }
}
