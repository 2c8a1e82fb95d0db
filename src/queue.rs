//! Bounded-concurrency job queue with lifecycle tracking.
//!
//! Jobs move `queued → processing → complete | error | queued`. The last
//! transition is a whole-job retry after a connection-class failure, delayed
//! by exponential backoff and then placed at the head of the queue. Finished
//! jobs stay queryable for the retention window and are then dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::processing::{JobRequest, JobRunner, ProgressUpdate};
use crate::state::{Job, JobStatus, JobStore, QueueStats};
use crate::transcription::Transcript;

const PROGRESS_BUFFER: usize = 64;
const UPDATE_BUFFER: usize = 256;

/// Accepts jobs, runs them under a concurrency cap and tracks their state
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Mutex<JobStore>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    updates: broadcast::Sender<Job>,
}

impl JobManager {
    pub fn new(runner: Arc<dyn JobRunner>, config: QueueConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        info!(
            "🔧 Job manager ready: {} workers, {} job retries",
            config.max_concurrency, config.transient_retry_limit
        );
        Self {
            inner: Arc::new(ManagerInner {
                store: Mutex::new(JobStore::new()),
                runner,
                config,
                updates,
            }),
        }
    }

    fn store(&self) -> MutexGuard<'_, JobStore> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, job: &Job) {
        // No subscribers is fine
        let _ = self.inner.updates.send(job.clone());
    }

    /// Queue a job for a session, or return the one that already covers it.
    ///
    /// An in-flight job for the session is always returned as is, as is a
    /// completed job with the same source and language. Anything else for
    /// the session is replaced.
    pub fn enqueue(&self, session_id: &str, source_ref: &str, language: Option<String>) -> Job {
        let job = {
            let mut store = self.store();

            if let Some(existing) = store.by_session(session_id) {
                let reusable = existing.status.is_active()
                    || (existing.status == JobStatus::Complete
                        && existing.matches_request(source_ref, language.as_deref()));
                if reusable {
                    debug!("Session {} already has job {}", session_id, existing.job_id);
                    return existing.clone();
                }
                let stale = existing.job_id;
                store.remove(&stale);
                info!("♻️ Replacing job {} for session {}", stale, session_id);
            }

            let job = Job::new(session_id, source_ref, language);
            info!("📥 Queued job {} for session {}", job.job_id, session_id);
            store.insert(job.clone());
            job
        };

        self.publish(&job);
        self.pump();
        job
    }

    /// Latest job for a session
    pub fn get_status(&self, session_id: &str) -> Option<Job> {
        self.store().by_session(session_id).cloned()
    }

    pub fn get_job(&self, job_id: &Uuid) -> Option<Job> {
        self.store().get(job_id).cloned()
    }

    /// Stream of job snapshots, one per state change or progress patch
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.inner.updates.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        self.store().stats()
    }

    /// Wait until a job reaches `complete` or `error`; None if it disappears
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Option<Job> {
        let mut updates = self.subscribe();
        match self.get_job(&job_id) {
            Some(job) if job.status.is_terminal() => return Some(job),
            None => return None,
            _ => {}
        }

        loop {
            match updates.recv().await {
                Ok(job) if job.job_id == job_id && job.status.is_terminal() => return Some(job),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => match self.get_job(&job_id) {
                    Some(job) if job.status.is_terminal() => return Some(job),
                    None => return None,
                    _ => {}
                },
                Err(broadcast::error::RecvError::Closed) => return self.get_job(&job_id),
            }
        }
    }

    /// Start queued jobs while worker slots are free
    fn pump(&self) {
        loop {
            let (id, request, snapshot) = {
                let mut store = self.store();
                if store.active() >= self.inner.config.max_concurrency {
                    return;
                }
                let Some(id) = store.pop_next() else {
                    return;
                };
                let Some(job) = store.get_mut(&id) else {
                    continue;
                };
                job.mark_processing();
                let request = JobRequest {
                    job_id: job.job_id,
                    session_id: job.session_id.clone(),
                    source_ref: job.source_ref.clone(),
                    language: job.language.clone(),
                };
                let snapshot = job.clone();
                store.acquire_slot();
                (id, request, snapshot)
            };

            self.publish(&snapshot);
            let manager = self.clone();
            tokio::spawn(async move { manager.run_job(id, request).await });
        }
    }

    async fn run_job(self, id: Uuid, request: JobRequest) {
        info!("▶️ Running job {} (attempt {})", id, self.get_job(&id).map_or(1, |j| j.retry_count + 1));

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_BUFFER);
        let progress_manager = self.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                let snapshot = {
                    let mut store = progress_manager.store();
                    match store.get_mut(&id) {
                        Some(job) if job.status == JobStatus::Processing => {
                            job.apply_progress(update);
                            Some(job.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(job) = snapshot {
                    progress_manager.publish(&job);
                }
            }
        });

        let result = self.inner.runner.run(request, progress_tx).await;
        // All progress lands before the terminal state is written
        if let Err(e) = progress_task.await {
            warn!("Progress consumer for job {} ended abnormally: {}", id, e);
        }

        let snapshot = {
            let mut store = self.store();
            store.release_slot();
            self.settle(&mut store, id, result)
        };

        if let Some(job) = snapshot {
            self.publish(&job);
        }
        self.pump();
    }

    /// Record a finished run; None if the job was removed meanwhile
    fn settle(&self, store: &mut JobStore, id: Uuid, result: crate::Result<Transcript>) -> Option<Job> {
        let limit = self.inner.config.transient_retry_limit;
        let job = store.get_mut(&id)?;

        match result {
            Ok(transcript) => {
                job.mark_complete(transcript);
                info!("✅ Job {} complete", id);
            }
            Err(e) if e.is_connection_class() && job.retry_count < limit => {
                job.mark_retry(e.to_string(), limit);
                let delay = self.inner.config.retry_delay(job.retry_count);
                warn!(
                    "🔁 Job {} hit a connection failure, retry {}/{} in {:?}: {}",
                    id, job.retry_count, limit, delay, e
                );
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.requeue_front(id);
                });
            }
            Err(e) => {
                warn!("❌ Job {} failed after {} retries: {}", id, job.retry_count, e);
                job.mark_error(e.to_string());
            }
        }

        let snapshot = job.clone();
        if snapshot.status.is_terminal() {
            self.schedule_cleanup(store, id);
        }
        Some(snapshot)
    }

    fn requeue_front(&self, id: Uuid) {
        {
            let mut store = self.store();
            match store.get(&id) {
                Some(job) if job.status == JobStatus::Queued => store.push_front(id),
                _ => return,
            }
        }
        self.pump();
    }

    fn schedule_cleanup(&self, store: &mut JobStore, id: Uuid) {
        let retention = self.inner.config.retention();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut store = manager.store();
            store.clear_cleanup(&id);
            if store.get(&id).map_or(false, |job| job.status.is_terminal()) {
                store.remove(&id);
                debug!("🧹 Job {} expired", id);
            }
        });
        store.set_cleanup(id, handle);
    }
}
