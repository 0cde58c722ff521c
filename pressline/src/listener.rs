//! Lifecycle event fan-out and completion notifications.
//!
//! Listeners are invoked in registration order. A listener that fails must
//! not stop the remaining listeners from being invoked; its error is written
//! to the job's report and logged, never rethrown to the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::TimeDelta;
use thiserror::Error;

use crate::job::{FinishedJob, JobOutcome, JobView, PendingJob, RunningJob, UserId};
use crate::report::SharedReport;

/// An error raised by a listener callback.
///
/// Isolated by the registry; it never interrupts the firing sequence or the
/// engine's own state transitions.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

/// The event-callback capability set for publish lifecycle events.
///
/// All callbacks default to no-ops so implementations subscribe only to the
/// events they care about.
pub trait PublishListener: Send + Sync {
    fn on_enqueue(&self, job: &PendingJob) -> Result<(), ListenerError> {
        let _ = job;
        Ok(())
    }

    fn on_start(&self, job: &RunningJob) -> Result<(), ListenerError> {
        let _ = job;
        Ok(())
    }

    fn on_abort(&self, job: &JobView, aborted_by: &UserId) -> Result<(), ListenerError> {
        let _ = (job, aborted_by);
        Ok(())
    }

    fn on_finish(&self, job: &FinishedJob) -> Result<(), ListenerError> {
        let _ = job;
        Ok(())
    }

    fn on_remove(&self, job: &FinishedJob) -> Result<(), ListenerError> {
        let _ = job;
        Ok(())
    }
}

/// Handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Delivers asynchronous, human-readable notifications to users.
///
/// The engine notifies a job's owner when the job finishes with warnings or
/// errors, was aborted, ran long, or was large; small clean publishes notify
/// only when [`Notifier::wants_routine`] says the recipient asked for them.
pub trait Notifier: Send + Sync {
    fn deliver(&self, recipient: &UserId, message: &str);

    /// Whether the recipient wants to hear about small, clean publishes too.
    fn wants_routine(&self, recipient: &UserId) -> bool {
        let _ = recipient;
        false
    }
}

/// Ordered collection of listeners with isolated callback failures.
pub(crate) struct ListenerRegistry {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn PublishListener>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, listener: Arc<dyn PublishListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn PublishListener>> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn fire(
        &self,
        event: &str,
        report: Option<&SharedReport>,
        mut callback: impl FnMut(&dyn PublishListener) -> Result<(), ListenerError>,
    ) {
        for listener in self.snapshot() {
            if let Err(err) = callback(listener.as_ref()) {
                tracing::warn!(%err, event, "publish listener failed");
                if let Some(report) = report {
                    report.warn(&format!("listener failed during {event}: {err}"));
                }
            }
        }
    }

    pub(crate) fn fire_enqueue(&self, job: &PendingJob, report: Option<&SharedReport>) {
        self.fire("enqueue", report, |listener| listener.on_enqueue(job));
    }

    pub(crate) fn fire_start(&self, job: &RunningJob, report: Option<&SharedReport>) {
        self.fire("start", report, |listener| listener.on_start(job));
    }

    pub(crate) fn fire_abort(
        &self,
        job: &JobView,
        aborted_by: &UserId,
        report: Option<&SharedReport>,
    ) {
        self.fire("abort", report, |listener| {
            listener.on_abort(job, aborted_by)
        });
    }

    pub(crate) fn fire_finish(&self, job: &FinishedJob, report: Option<&SharedReport>) {
        self.fire("finish", report, |listener| listener.on_finish(job));
    }

    pub(crate) fn fire_remove(&self, job: &FinishedJob) {
        self.fire("remove", None, |listener| listener.on_remove(job));
    }
}

/// Whether a finished job warrants a notification to its owner.
///
/// Jobs with warnings or errors, and jobs that did not publish cleanly,
/// always notify. Otherwise only long-running or large jobs do, unless the
/// recipient asked for routine notifications.
pub(crate) fn should_notify(
    job: &FinishedJob,
    long_job: TimeDelta,
    large_job: usize,
    wants_routine: bool,
) -> bool {
    if job.warnings > 0 || job.errors > 0 {
        return true;
    }
    if job.outcome != JobOutcome::Published {
        return true;
    }
    if job.finished_at - job.enqueued_at > long_job {
        return true;
    }
    if job.resource_count > large_job {
        return true;
    }
    wants_routine
}

pub(crate) fn completion_message(job: &FinishedJob) -> String {
    match job.outcome {
        JobOutcome::Published if job.warnings == 0 && job.errors == 0 => format!(
            "Publish job {} for project \"{}\" finished successfully ({} resources).",
            job.id, job.project_name, job.resource_count
        ),
        JobOutcome::Published => format!(
            "Publish job {} for project \"{}\" finished with {} warning(s) and {} error(s); see the publish report for details.",
            job.id, job.project_name, job.warnings, job.errors
        ),
        JobOutcome::Failed => format!(
            "Publish job {} for project \"{}\" failed; see the publish report for details.",
            job.id, job.project_name
        ),
        JobOutcome::Aborted => format!(
            "Publish job {} for project \"{}\" was aborted.",
            job.id, job.project_name
        ),
    }
}

pub(crate) fn abort_message(job: &FinishedJob, aborted_by: &UserId) -> String {
    format!(
        "Publish job {} for project \"{}\" was aborted by {}.",
        job.id, job.project_name, aborted_by
    )
}
