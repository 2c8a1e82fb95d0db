use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::processing::ProgressUpdate;
use crate::transcription::Transcript;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

/// One end-to-end transcription request and everything known about it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub session_id: String,
    pub source_ref: String,
    pub language: Option<String>,
    pub status: JobStatus,
    /// Human-readable description of the current step
    pub stage: String,
    /// 0..=100, never decreases while a run is in progress
    pub progress: u8,
    pub total_chunks: Option<usize>,
    pub completed_chunks: Option<usize>,
    pub retry_count: u32,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Transcript>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(session_id: impl Into<String>, source_ref: impl Into<String>, language: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            session_id: session_id.into(),
            source_ref: source_ref.into(),
            language,
            status: JobStatus::Queued,
            stage: "queued".to_string(),
            progress: 0,
            total_chunks: None,
            completed_chunks: None,
            retry_count: 0,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Same source and language as an earlier request
    pub fn matches_request(&self, source_ref: &str, language: Option<&str>) -> bool {
        self.source_ref == source_ref && self.language.as_deref() == language
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Merge a progress patch; progress only moves forward
    pub fn apply_progress(&mut self, update: ProgressUpdate) {
        self.stage = update.stage;
        self.progress = self.progress.max(update.progress.min(100));
        if update.total_chunks.is_some() {
            self.total_chunks = update.total_chunks;
        }
        if update.completed_chunks.is_some() {
            self.completed_chunks = update.completed_chunks;
        }
        self.touch();
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.stage = "starting".to_string();
        self.error = None;
        self.touch();
    }

    pub fn mark_complete(&mut self, transcript: Transcript) {
        self.status = JobStatus::Complete;
        self.stage = crate::processing::STAGE_COMPLETE.to_string();
        self.progress = 100;
        self.result = Some(transcript);
        self.error = None;
        self.touch();
        self.completed_at = Some(self.updated_at);
    }

    pub fn mark_error(&mut self, message: String) {
        self.status = JobStatus::Error;
        self.stage = "failed".to_string();
        self.error = Some(message);
        self.touch();
        self.completed_at = Some(self.updated_at);
    }

    /// Back to the queue after a transient failure; a new run starts from zero
    pub fn mark_retry(&mut self, message: String, limit: u32) {
        self.retry_count += 1;
        self.status = JobStatus::Queued;
        self.stage = format!("retrying after connection failure ({}/{})", self.retry_count, limit);
        self.progress = 0;
        self.total_chunks = None;
        self.completed_chunks = None;
        self.error = Some(message);
        self.touch();
    }
}

/// Counts of jobs by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub complete: usize,
    pub error: usize,
    /// Pipelines currently holding a worker slot
    pub active: usize,
    /// Jobs waiting in the FIFO (excludes jobs sitting out a retry backoff)
    pub waiting: usize,
}

/// In-memory job registry: jobs by id, session index, FIFO and cleanup timers
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    sessions: HashMap<String, Uuid>,
    queue: VecDeque<Uuid>,
    cleanup: HashMap<Uuid, JoinHandle<()>>,
    active: usize,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, point its session at it and queue it
    pub fn insert(&mut self, job: Job) {
        let id = job.job_id;
        self.sessions.insert(job.session_id.clone(), id);
        self.jobs.insert(id, job);
        self.queue.push_back(id);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn by_session(&self, session_id: &str) -> Option<&Job> {
        self.sessions.get(session_id).and_then(|id| self.jobs.get(id))
    }

    /// Put a job at the head of the queue
    pub fn push_front(&mut self, id: Uuid) {
        self.queue.retain(|queued| *queued != id);
        self.queue.push_front(id);
    }

    /// Next queued job in FIFO order, skipping entries that went stale
    pub fn pop_next(&mut self) -> Option<Uuid> {
        while let Some(id) = self.queue.pop_front() {
            if self
                .jobs
                .get(&id)
                .map_or(false, |job| job.status == JobStatus::Queued)
            {
                return Some(id);
            }
        }
        None
    }

    /// Drop a job; the session entry goes only if it still points here
    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        if self.sessions.get(&job.session_id) == Some(id) {
            self.sessions.remove(&job.session_id);
        }
        self.queue.retain(|queued| queued != id);
        if let Some(handle) = self.cleanup.remove(id) {
            handle.abort();
        }
        Some(job)
    }

    pub fn set_cleanup(&mut self, id: Uuid, handle: JoinHandle<()>) {
        if let Some(previous) = self.cleanup.insert(id, handle) {
            previous.abort();
        }
    }

    /// Forget a finished cleanup timer without aborting it
    pub fn clear_cleanup(&mut self, id: &Uuid) {
        self.cleanup.remove(id);
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn acquire_slot(&mut self) {
        self.active += 1;
    }

    pub fn release_slot(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            active: self.active,
            waiting: self.queue.len(),
            ..Default::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}
