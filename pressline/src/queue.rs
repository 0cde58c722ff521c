//! The FIFO queue of publish jobs waiting for the worker slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::job::{JobId, PendingJob, PublishJob};

/// FIFO collection of not-yet-started jobs, ordered by enqueue time.
///
/// Safe under concurrent calls from the engine's public API and the
/// scheduling tick; every operation holds the lock only for the duration of
/// the collection access.
pub(crate) struct PendingQueue {
    inner: Mutex<VecDeque<Arc<PublishJob>>>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, job: Arc<PublishJob>) {
        self.inner.lock().unwrap().push_back(job);
    }

    pub(crate) fn pop_front(&self) -> Option<Arc<PublishJob>> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Removes the job with the given id, returning it if it was queued.
    pub(crate) fn remove(&self, id: &JobId) -> Option<Arc<PublishJob>> {
        let mut queue = self.inner.lock().unwrap();
        let position = queue.iter().position(|job| job.id() == *id)?;
        queue.remove(position)
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<Arc<PublishJob>> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id() == *id)
            .cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Ordered handles to the queued jobs themselves.
    pub(crate) fn jobs(&self) -> Vec<Arc<PublishJob>> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// Read-only ordered copy for external listing.
    pub(crate) fn snapshot(&self) -> Vec<PendingJob> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.pending_view())
            .collect()
    }
}
