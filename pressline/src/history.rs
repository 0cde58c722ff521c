//! The bounded history of finished publish jobs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::job::{FinishedJob, JobId, PublishJob, UserId};

/// Bounded, insertion-ordered collection of finished jobs.
///
/// When the capacity is exceeded the oldest entries are evicted; the engine
/// deletes their persisted form and fires the remove event for each one.
pub(crate) struct HistoryStore {
    capacity: usize,
    inner: Mutex<VecDeque<Arc<PublishJob>>>,
}

impl HistoryStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a finished job, returning the entries evicted to stay within
    /// capacity, oldest first.
    pub(crate) fn add(&self, job: Arc<PublishJob>) -> Vec<Arc<PublishJob>> {
        let mut history = self.inner.lock().unwrap();
        history.push_back(job);
        let mut evicted = Vec::new();
        while history.len() > self.capacity {
            if let Some(oldest) = history.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Removes the job with the given id, for administrative removal.
    pub(crate) fn remove(&self, id: &JobId) -> Option<Arc<PublishJob>> {
        let mut history = self.inner.lock().unwrap();
        let position = history.iter().position(|job| job.id() == *id)?;
        history.remove(position)
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<Arc<PublishJob>> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id() == *id)
            .cloned()
    }

    /// Read-only copy in finish order, optionally filtered by owning user.
    pub(crate) fn snapshot(&self, user: Option<&UserId>) -> Vec<FinishedJob> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|job| user.map_or(true, |user| job.user_id() == user))
            .filter_map(|job| job.finished_view())
            .collect()
    }
}
