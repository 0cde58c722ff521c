//! The lifecycle record for a single publish job.
//!
//! A [`PublishJob`] is created by the engine when a publish request is
//! enqueued, mutated by the worker while the job runs, and archived into the
//! history once it finishes. External callers never see the record itself,
//! only the phase-restricted snapshots [`PendingJob`], [`RunningJob`] and
//! [`FinishedJob`].

use std::fmt::Display;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::report::SharedReport;
use crate::store::PublishList;
use crate::worker::WorkerId;

/// The globally unique publish-history id of a job.
///
/// Assigned by the engine at enqueue time and never reused; this is the token
/// used for all external lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user known to the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a project in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(String);

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ProjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to publish content, as submitted by a caller.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub project_id: ProjectId,
    pub project_name: String,
    pub locale: String,
    /// `Some` publishes exactly these resources (a direct publish), `None`
    /// publishes everything pending in the project.
    pub resources: Option<Vec<String>>,
}

/// How a publish job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The publish ran to completion. Per-resource problems, if any, are
    /// reflected in the warning and error counts.
    Published,
    /// The publish could not run or the worker died before completing it.
    Failed,
    /// The job was aborted, either before it started or by an engine
    /// shutdown interrupting it.
    Aborted,
}

/// Snapshot of a job that is waiting in the pending queue.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub id: JobId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub locale: String,
    pub direct_publish: bool,
    pub resource_count: usize,
    pub enqueued_at: DateTime<Utc>,
}

/// Snapshot of the job currently held by the worker.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub id: JobId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub locale: String,
    pub direct_publish: bool,
    pub resource_count: usize,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of a job that has finished and lives in the history.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub id: JobId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub locale: String,
    pub direct_publish: bool,
    pub resource_count: usize,
    pub enqueued_at: DateTime<Utc>,
    /// `None` for jobs that were aborted or failed before a worker started
    /// them.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
    pub warnings: usize,
    pub errors: usize,
}

/// A read-only view of a job appropriate to its current lifecycle phase.
#[derive(Debug, Clone)]
pub enum JobView {
    Pending(PendingJob),
    Running(RunningJob),
    Finished(FinishedJob),
}

impl JobView {
    pub fn id(&self) -> JobId {
        match self {
            Self::Pending(job) => job.id,
            Self::Running(job) => job.id,
            Self::Finished(job) => job.id,
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Pending(job) => &job.user_id,
            Self::Running(job) => &job.user_id,
            Self::Finished(job) => &job.user_id,
        }
    }

    pub fn project_name(&self) -> &str {
        match self {
            Self::Pending(job) => &job.project_name,
            Self::Running(job) => &job.project_name,
            Self::Finished(job) => &job.project_name,
        }
    }
}

/// The persisted form of a job record, written to and read from the content
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecordData {
    pub history_id: JobId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub user_id: UserId,
    pub locale: String,
    pub direct_publish: bool,
    pub resource_count: usize,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The mutable lifecycle record for one publish job.
///
/// The start and finish transitions may each happen at most once; violating
/// this is a programming error and panics rather than returning an error.
pub(crate) struct PublishJob {
    id: JobId,
    user_id: UserId,
    project_id: ProjectId,
    project_name: String,
    locale: String,
    direct_publish: bool,
    resource_count: usize,
    enqueued_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

struct JobState {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    worker: Option<WorkerId>,
    // Held while pending/running only; released on finish to bound memory.
    publish_list: Option<PublishList>,
    report: Option<SharedReport>,
    outcome: Option<JobOutcome>,
    warnings: usize,
    errors: usize,
}

impl PublishJob {
    pub(crate) fn new(
        user_id: UserId,
        request: &PublishRequest,
        publish_list: PublishList,
        report: SharedReport,
    ) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            project_id: request.project_id.clone(),
            project_name: request.project_name.clone(),
            locale: request.locale.clone(),
            direct_publish: request.resources.is_some(),
            resource_count: publish_list.resources.len(),
            enqueued_at: Utc::now(),
            state: Mutex::new(JobState {
                started_at: None,
                finished_at: None,
                worker: None,
                publish_list: Some(publish_list),
                report: Some(report),
                outcome: None,
                warnings: 0,
                errors: 0,
            }),
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The publish list, while the job is still pending or running.
    pub(crate) fn publish_list(&self) -> Option<PublishList> {
        self.state.lock().unwrap().publish_list.clone()
    }

    /// The report sink, while the job is still pending or running.
    pub(crate) fn report(&self) -> Option<SharedReport> {
        self.state.lock().unwrap().report.clone()
    }

    /// Records the start transition on behalf of a worker and hands it the
    /// publish list and report sink.
    ///
    /// # Panics
    ///
    /// Panics if the job has already been started or finished; both indicate
    /// a scheduling bug and are not recoverable.
    pub(crate) fn activate(&self, worker: WorkerId) -> (PublishList, SharedReport) {
        let mut state = self.state.lock().unwrap();
        if state.finished_at.is_some() {
            panic!("publish job {} activated after it finished", self.id);
        }
        if state.started_at.is_some() {
            panic!("publish job {} started twice", self.id);
        }
        state.started_at = Some(Utc::now());
        state.worker = Some(worker);
        let list = state
            .publish_list
            .clone()
            .unwrap_or_else(|| panic!("publish job {} has no publish list", self.id));
        let report = state
            .report
            .clone()
            .unwrap_or_else(|| panic!("publish job {} has no report sink", self.id));
        (list, report)
    }

    /// Records the finish transition and releases the publish list and
    /// report sink.
    ///
    /// The warning and error counts are captured from the report before it is
    /// released. Jobs that were aborted or failed before a worker ever
    /// started them finish with `started_at` left unset.
    ///
    /// # Panics
    ///
    /// Panics if the job has already finished.
    pub(crate) fn finish(&self, outcome: JobOutcome) -> FinishedJob {
        let mut state = self.state.lock().unwrap();
        if state.finished_at.is_some() {
            panic!("publish job {} finished twice", self.id);
        }
        let counts = state
            .report
            .as_ref()
            .map(|report| (report.warnings(), report.errors()));
        if let Some((warnings, errors)) = counts {
            state.warnings = warnings;
            state.errors = errors;
        }
        state.finished_at = Some(Utc::now());
        state.outcome = Some(outcome);
        state.publish_list = None;
        state.report = None;
        self.finished_from(&state)
    }

    fn pending_from(&self) -> PendingJob {
        PendingJob {
            id: self.id,
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            locale: self.locale.clone(),
            direct_publish: self.direct_publish,
            resource_count: self.resource_count,
            enqueued_at: self.enqueued_at,
        }
    }

    fn running_from(&self, started_at: DateTime<Utc>) -> RunningJob {
        RunningJob {
            id: self.id,
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            locale: self.locale.clone(),
            direct_publish: self.direct_publish,
            resource_count: self.resource_count,
            enqueued_at: self.enqueued_at,
            started_at,
        }
    }

    fn finished_from(&self, state: &JobState) -> FinishedJob {
        FinishedJob {
            id: self.id,
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            locale: self.locale.clone(),
            direct_publish: self.direct_publish,
            resource_count: self.resource_count,
            enqueued_at: self.enqueued_at,
            started_at: state.started_at,
            finished_at: state.finished_at.unwrap_or(self.enqueued_at),
            outcome: state.outcome.unwrap_or(JobOutcome::Failed),
            warnings: state.warnings,
            errors: state.errors,
        }
    }

    /// The pending-phase snapshot of this job.
    pub(crate) fn pending_view(&self) -> PendingJob {
        self.pending_from()
    }

    /// The running-phase snapshot, if the job has started and not finished.
    pub(crate) fn running_view(&self) -> Option<RunningJob> {
        let state = self.state.lock().unwrap();
        match (state.started_at, state.finished_at) {
            (Some(started_at), None) => Some(self.running_from(started_at)),
            _ => None,
        }
    }

    /// The finished-phase snapshot, if the job has finished.
    pub(crate) fn finished_view(&self) -> Option<FinishedJob> {
        let state = self.state.lock().unwrap();
        state.finished_at.map(|_| self.finished_from(&state))
    }

    /// The view appropriate to the job's current lifecycle phase.
    pub(crate) fn view(&self) -> JobView {
        let state = self.state.lock().unwrap();
        if state.finished_at.is_some() {
            JobView::Finished(self.finished_from(&state))
        } else if let Some(started_at) = state.started_at {
            JobView::Running(self.running_from(started_at))
        } else {
            JobView::Pending(self.pending_from())
        }
    }

    /// The persisted form of this record in its current state.
    pub(crate) fn record_data(&self) -> JobRecordData {
        let state = self.state.lock().unwrap();
        JobRecordData {
            history_id: self.id,
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            user_id: self.user_id.clone(),
            locale: self.locale.clone(),
            direct_publish: self.direct_publish,
            resource_count: self.resource_count,
            enqueued_at: self.enqueued_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SharedReport;

    fn request() -> PublishRequest {
        PublishRequest {
            project_id: "offline".into(),
            project_name: "Offline".to_owned(),
            locale: "en".to_owned(),
            resources: Some(vec!["/a.txt".to_owned()]),
        }
    }

    fn job() -> PublishJob {
        let list = PublishList {
            project: "offline".into(),
            resources: vec!["/a.txt".to_owned()],
        };
        PublishJob::new("alice".into(), &request(), list, SharedReport::new(None))
    }

    #[test]
    fn new_job_is_pending() {
        let job = job();
        assert!(matches!(job.view(), JobView::Pending(_)));
        assert!(job.running_view().is_none());
        assert!(job.finished_view().is_none());
    }

    #[test]
    fn activate_then_finish_produces_phase_views() {
        let job = job();
        job.activate(WorkerId(1));
        let running = job.running_view().unwrap();
        assert_eq!(running.resource_count, 1);
        assert!(running.started_at >= running.enqueued_at);

        let finished = job.finish(JobOutcome::Published);
        assert_eq!(finished.outcome, JobOutcome::Published);
        assert!(finished.started_at.is_some());
        assert!(job.running_view().is_none());
        // the publish list and report are released once the job finishes
        assert!(job.publish_list().is_none());
        assert!(job.report().is_none());
    }

    #[test]
    fn finish_without_start_leaves_started_unset() {
        let job = job();
        let finished = job.finish(JobOutcome::Aborted);
        assert_eq!(finished.outcome, JobOutcome::Aborted);
        assert!(finished.started_at.is_none());
    }

    #[test]
    fn finish_captures_report_counts() {
        let job = job();
        let report = job.report().unwrap();
        report.warn("something odd");
        report.error("something wrong");
        report.error("something else wrong");
        let finished = job.finish(JobOutcome::Published);
        assert_eq!(finished.warnings, 1);
        assert_eq!(finished.errors, 2);
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn double_activate_panics() {
        let job = job();
        job.activate(WorkerId(1));
        job.activate(WorkerId(2));
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn double_finish_panics() {
        let job = job();
        job.activate(WorkerId(1));
        job.finish(JobOutcome::Published);
        job.finish(JobOutcome::Published);
    }

    #[test]
    #[should_panic(expected = "activated after it finished")]
    fn activate_after_finish_panics() {
        let job = job();
        job.finish(JobOutcome::Aborted);
        job.activate(WorkerId(1));
    }

    #[test]
    fn record_data_round_trips_through_json() {
        let job = job();
        job.activate(WorkerId(1));
        let data = job.record_data();
        let json = serde_json::to_string(&data).unwrap();
        let back: JobRecordData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
        assert_eq!(back.history_id, job.id());
        assert!(back.started_at.is_some());
        assert!(back.finished_at.is_none());
    }
}
