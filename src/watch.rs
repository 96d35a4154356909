//! Presentation-side job feed.
//!
//! A front end owns one [`JobFeed`] and drains it from its own loop; workers
//! never call back into presentation code directly.

use crate::job::{Job, JobId};
use crate::registry::{JobEvent, JobRegistry};
use crate::{BerthError, Result, log_debug};
use std::sync::Arc;
use tokio::sync::broadcast::{Receiver, error::RecvError};

pub struct JobFeed {
    registry: Arc<JobRegistry>,
    events: Receiver<JobEvent>,
}

impl JobFeed {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        let events = registry.subscribe();
        Self { registry, events }
    }

    /// Wait until job `id` is terminal, passing each of its progress lines to
    /// `on_progress`, and return the final snapshot.
    pub async fn wait_for<F>(&mut self, id: JobId, mut on_progress: F) -> Result<Job>
    where
        F: FnMut(&str),
    {
        let job = self.registry.get(id)?;
        if job.is_terminal() {
            return Ok(job);
        }

        loop {
            match self.events.recv().await {
                Ok(event) if event.job_id() != id => {}
                Ok(JobEvent::Progress {
                    line: Some(line), ..
                }) => on_progress(&line),
                Ok(JobEvent::Finished { .. }) => return self.registry.get(id),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    // The finish event may be among those missed.
                    log_debug!("Job feed skipped {} events", missed);
                    let job = self.registry.get(id)?;
                    if job.is_terminal() {
                        return Ok(job);
                    }
                }
                // Not reachable while the feed holds the registry.
                Err(RecvError::Closed) => {
                    return Err(BerthError::Unknown("job registry closed".to_string()));
                }
            }
        }
    }
}
