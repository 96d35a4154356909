//! Job Registry: the single source of truth for job state.
//!
//! The index (jobs, submission order, in-flight keys) sits behind one mutex and
//! every job record behind its own. Locks are only ever nested record -> index,
//! which lets a terminal transition release its exclusion key atomically with
//! the state change.

use crate::error::JobError;
use crate::job::{
    CancelHandle, CancelToken, ExclusionKey, Job, JobId, JobKind, JobParams, JobResult, JobState,
    cancel_pair,
};
use crate::{BerthError, Result, log_debug, log_info, log_warn};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Change notifications pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Created {
        id: JobId,
        kind: JobKind,
        target: String,
    },
    Started {
        id: JobId,
    },
    Progress {
        id: JobId,
        line: Option<String>,
        percent: Option<u8>,
    },
    Finished {
        id: JobId,
        state: JobState,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { id, .. }
            | JobEvent::Started { id }
            | JobEvent::Progress { id, .. }
            | JobEvent::Finished { id, .. } => *id,
        }
    }
}

/// Returned by [`JobRegistry::submit`]; the token goes to the worker.
#[derive(Debug)]
pub struct Submission {
    pub id: JobId,
    pub token: CancelToken,
}

struct Entry {
    record: Arc<Mutex<Job>>,
    cancel: CancelHandle,
}

#[derive(Default)]
struct Index {
    jobs: HashMap<JobId, Entry>,
    order: Vec<JobId>,
    active: HashMap<ExclusionKey, JobId>,
}

pub struct JobRegistry {
    index: Mutex<Index>,
    events: broadcast::Sender<JobEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            index: Mutex::new(Index::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Create a pending job, failing fast if its key is already in flight.
    pub fn submit(&self, params: JobParams) -> Result<Submission> {
        let job = Job::new(params);
        let keys = job.exclusion_keys();
        let (id, kind, target) = (job.id, job.kind, job.target.clone());
        let (cancel, token) = cancel_pair();

        {
            let mut index = lock(&self.index);
            for key in &keys {
                if let Some(existing) = index.active.get(key) {
                    log_warn!(
                        "Rejecting {} on '{}': job {} still in flight",
                        kind,
                        key.target,
                        existing
                    );
                    return Err(BerthError::Conflict {
                        class: key.class.to_string(),
                        target: key.target.clone(),
                    });
                }
            }
            for key in keys {
                index.active.insert(key, id);
            }
            index.order.push(id);
            index.jobs.insert(
                id,
                Entry {
                    record: Arc::new(Mutex::new(job)),
                    cancel,
                },
            );
        }

        log_info!("Job {} created: {} on '{}'", id, kind, target);
        self.emit(JobEvent::Created { id, kind, target });
        Ok(Submission { id, token })
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        let record = self.record(id)?;
        let job = lock(&record).clone();
        Ok(job)
    }

    /// Jobs in submission order, optionally filtered.
    pub fn list(&self, kind: Option<JobKind>, state: Option<JobState>) -> Vec<Job> {
        let records: Vec<Arc<Mutex<Job>>> = {
            let index = lock(&self.index);
            index
                .order
                .iter()
                .filter_map(|id| index.jobs.get(id).map(|e| e.record.clone()))
                .collect()
        };

        records
            .iter()
            .map(|record| lock(record).clone())
            .filter(|job| kind.is_none_or(|k| job.kind == k))
            .filter(|job| state.is_none_or(|s| job.state == s))
            .collect()
    }

    /// The in-flight job holding `key`, if any.
    pub fn active_job(&self, key: &ExclusionKey) -> Option<JobId> {
        lock(&self.index).active.get(key).copied()
    }

    pub fn start(&self, id: JobId) -> Result<()> {
        let record = self.record(id)?;
        {
            let mut job = lock(&record);
            Self::check_transition(&job, JobState::Running)?;
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        }
        log_debug!("Job {} running", id);
        self.emit(JobEvent::Started { id });
        Ok(())
    }

    /// Append a progress line. Ignored once the job is terminal.
    pub fn update_progress(&self, id: JobId, line: impl Into<String>) -> Result<()> {
        self.progress(id, Some(line.into()), None)
    }

    pub fn set_percent(&self, id: JobId, percent: u8) -> Result<()> {
        self.progress(id, None, Some(percent.min(100)))
    }

    fn progress(&self, id: JobId, line: Option<String>, percent: Option<u8>) -> Result<()> {
        let record = self.record(id)?;
        {
            let mut job = lock(&record);
            if job.is_terminal() {
                return Ok(());
            }
            if let Some(line) = &line {
                job.progress.push(line.clone());
            }
            if percent.is_some() {
                job.percent = percent;
            }
        }
        self.emit(JobEvent::Progress { id, line, percent });
        Ok(())
    }

    pub fn complete(&self, id: JobId, result: JobResult) -> Result<()> {
        let message = result.summary();
        self.finish(id, JobState::Succeeded, Some(result), None, message)
    }

    pub fn fail(&self, id: JobId, error: JobError) -> Result<()> {
        let message = error.message.clone();
        self.finish(id, JobState::Failed, None, Some(error), message)
    }

    /// Mark the job cancelled and signal its worker. The external call is only
    /// interrupted where the adapter supports it.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        // Signal first so the worker discards its outcome instead of racing
        // the state change below.
        {
            let index = lock(&self.index);
            let entry = index
                .jobs
                .get(&id)
                .ok_or_else(|| BerthError::NotFound(format!("job {}", id)))?;
            entry.cancel.cancel();
        }

        let error = JobError::cancelled();
        let message = error.message.clone();
        self.finish(id, JobState::Cancelled, None, Some(error), message)
    }

    fn finish(
        &self,
        id: JobId,
        state: JobState,
        result: Option<JobResult>,
        error: Option<JobError>,
        message: String,
    ) -> Result<()> {
        let record = self.record(id)?;
        {
            let mut job = lock(&record);
            Self::check_transition(&job, state)?;
            job.state = state;
            job.result = result;
            job.error = error;
            job.message = Some(message);
            job.finished_at = Some(Utc::now());

            let mut index = lock(&self.index);
            for key in job.exclusion_keys() {
                if index.active.get(&key) == Some(&id) {
                    index.active.remove(&key);
                }
            }
        }

        log_info!("Job {} finished: {}", id, state);
        self.emit(JobEvent::Finished { id, state });
        Ok(())
    }

    fn check_transition(job: &Job, next: JobState) -> Result<()> {
        if job.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(BerthError::InvalidTransition {
                id: job.id.to_string(),
                from: job.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    fn record(&self, id: JobId) -> Result<Arc<Mutex<Job>>> {
        lock(&self.index)
            .jobs
            .get(&id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| BerthError::NotFound(format!("job {}", id)))
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
