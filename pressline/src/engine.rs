//! The publish engine: the controller that serializes publish jobs into a
//! single background worker and tracks their lifecycle.
//!
//! The engine owns the pending queue, the bounded history, the single worker
//! slot and the engine-level state. It is the sole authority that starts new
//! work: every trigger point funnels into the scheduling check, which is safe
//! to invoke redundantly and never starts two workers concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::FuturesOrdered;
use futures::StreamExt;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::history::HistoryStore;
use crate::job::{
    FinishedJob, JobId, JobOutcome, JobView, PendingJob, PublishJob, PublishRequest, RunningJob,
    UserId,
};
use crate::listener::{
    self, ListenerId, ListenerRegistry, Notifier, PublishListener,
};
use crate::queue::PendingQueue;
use crate::report::{ReportSink, SharedReport};
use crate::store::ContentStore;
use crate::worker::{self, WorkerHandle, WorkerId};
use crate::EngineError;

/// Engine-level state, read by the scheduling check on every tick.
///
/// Any transition between states is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepts and processes jobs.
    Started,
    /// Accepts jobs but does not start them.
    Stopped,
    /// Rejects new jobs from ordinary callers; the existing queue is still
    /// processed.
    Disabled,
}

/// The identity on whose behalf an engine operation is invoked.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: UserId,
    pub admin: bool,
}

impl Caller {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self {
            user: id.into(),
            admin: false,
        }
    }

    pub fn admin(id: impl Into<UserId>) -> Self {
        Self {
            user: id.into(),
            admin: true,
        }
    }
}

/// The publish job engine.
///
/// Cloning is cheap; clones share the same engine. The engine starts in the
/// [`EngineState::Started`] state and must be used from within a tokio
/// runtime.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pressline::engine::{Caller, PublishEngine};
/// use pressline::job::PublishRequest;
/// use pressline::store::memory::InMemoryStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let engine = PublishEngine::new(InMemoryStore::new());
/// engine
///     .enqueue(
///         &Caller::user("alice"),
///         PublishRequest {
///             project_id: "offline".into(),
///             project_name: "Offline".to_owned(),
///             locale: "en".to_owned(),
///             resources: Some(vec!["/index.html".to_owned()]),
///         },
///         None,
///     )
///     .await
///     .unwrap();
/// assert!(engine.wait_until_idle(Duration::from_secs(5)).await);
/// assert_eq!(engine.history(None).len(), 1);
/// # });
/// ```
pub struct PublishEngine<S: ContentStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: ContentStore> Clone for PublishEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct EngineInner<S> {
    config: EngineConfig,
    store: Arc<S>,
    queue: PendingQueue,
    history: HistoryStore,
    listeners: ListenerRegistry,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
    state: Mutex<EngineState>,
    // The single worker slot; holding an Option rather than a collection is
    // what enforces the one-job-at-a-time model.
    slot: AsyncMutex<Option<WorkerHandle>>,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    idle: Notify,
    worker_seq: AtomicU64,
}

impl<S: ContentStore> PublishEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        let inner = Arc::new(EngineInner {
            history: HistoryStore::new(config.history_capacity),
            config,
            store: Arc::new(store),
            queue: PendingQueue::new(),
            listeners: ListenerRegistry::new(),
            notifier: Mutex::new(None),
            state: Mutex::new(EngineState::Started),
            slot: AsyncMutex::new(None),
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            idle: Notify::new(),
            worker_seq: AtomicU64::new(0),
        });
        Self { inner }
    }

    /// Enqueues a publish request as a new job.
    ///
    /// Rejected while the engine is shutting down, and while it is
    /// [`EngineState::Disabled`] unless the caller is an administrator. The
    /// caller-supplied report sink, if any, receives a copy of every report
    /// line alongside the engine's durable copy.
    pub async fn enqueue(
        &self,
        caller: &Caller,
        request: PublishRequest,
        report: Option<Box<dyn ReportSink>>,
    ) -> Result<JobId, EngineError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        if *inner.state.lock().unwrap() == EngineState::Disabled && !caller.admin {
            return Err(EngineError::Disabled);
        }

        let list = inner.store.resolve_publish_list(&request).await?;
        let report = SharedReport::new(report);
        let job = Arc::new(PublishJob::new(caller.user.clone(), &request, list, report));
        // persist and announce before the job becomes visible to scheduling:
        // a tick fired by a finishing job could otherwise start this one
        // while its enqueue is still failing
        inner.store.write_job_record(&job.record_data()).await?;

        tracing::debug!(job_id = %job.id(), user = %caller.user, "publish job enqueued");
        inner
            .listeners
            .fire_enqueue(&job.pending_view(), job.report().as_ref());
        inner.queue.push(Arc::clone(&job));
        inner.spawn_tick();
        Ok(job.id())
    }

    /// Aborts a pending or not-yet-started job.
    ///
    /// Permitted only for the job owner or an administrator. Once the worker
    /// has signalled "started" the abort fails with
    /// [`EngineError::AlreadyStarted`]; the only cancellation path left then
    /// is the shutdown interrupt. With `remove_entirely` the record is
    /// discarded, otherwise it moves into the history with its finish
    /// metadata set.
    pub async fn abort(
        &self,
        caller: &Caller,
        job_id: JobId,
        remove_entirely: bool,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        let job = match inner.queue.get(&job_id) {
            Some(job) => job,
            None => {
                let slot = inner.slot.lock().await;
                match slot.as_ref() {
                    Some(worker) if worker.job.id() == job_id => Arc::clone(&worker.job),
                    _ => return Err(EngineError::NotFound(job_id)),
                }
            }
        };
        if !caller.admin && caller.user != *job.user_id() {
            return Err(EngineError::PermissionDenied {
                user: caller.user.clone(),
                job: job_id,
            });
        }

        // listeners hear about the abort before any state changes
        inner
            .listeners
            .fire_abort(&job.view(), &caller.user, job.report().as_ref());

        // still pending: dequeue and close. A pending job holds no resource
        // locks (those are acquired by scheduling just before its worker
        // spawns), so there is nothing to release here.
        if inner.queue.remove(&job_id).is_some() {
            let (finished, _report) = inner.close_job(&job, JobOutcome::Aborted).await;
            inner.notify_aborted(&finished, &caller.user);
            if remove_entirely {
                inner.drop_persisted(job_id).await;
            } else {
                inner.archive(job).await;
            }
            tracing::info!(job_id = %job_id, by = %caller.user, "pending publish job aborted");
            return Ok(());
        }

        let mut slot = inner.slot.lock().await;
        let worker = match slot.as_ref() {
            Some(worker) if worker.job.id() == job_id => worker,
            // finished in the meantime: too late to abort
            _ => return Err(EngineError::AlreadyStarted(job_id)),
        };
        if inner.shutting_down.load(Ordering::Acquire) {
            // the shutdown path will interrupt the running job; only note
            // the request in its report
            if let Some(report) = worker.job.report() {
                report.print(&format!(
                    "abort requested by {} during engine shutdown",
                    caller.user
                ));
            }
            return Ok(());
        }
        if !worker.signal.try_abort() {
            return Err(EngineError::AlreadyStarted(job_id));
        }

        // the cooperative abort won the pre-start window; the worker task
        // abandons itself and the bookkeeping happens here
        *slot = None;
        drop(slot);
        inner.release_locks(&job).await;
        let (finished, _report) = inner.close_job(&job, JobOutcome::Aborted).await;
        inner.notify_aborted(&finished, &caller.user);
        if remove_entirely {
            inner.drop_persisted(job_id).await;
        } else {
            inner.archive(job).await;
        }
        inner.spawn_tick();
        tracing::info!(job_id = %job_id, by = %caller.user, "publish job aborted before start");
        Ok(())
    }

    /// Shuts the engine down.
    ///
    /// Disallows further enqueues, waits up to the configured grace period
    /// for a running job, then interrupts it best-effort. Pending jobs stay
    /// queued and never start. Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("publish engine shutting down");

        let grace = inner.config.shutdown_grace;
        if !self.wait_for_worker_exit(grace).await {
            // grace expired: best-effort interrupt; a publish that never
            // yields may ignore it
            tracing::warn!("shutdown grace period expired; interrupting the running publish job");
            inner.shutdown_token.cancel();
            if !self.wait_for_worker_exit(grace).await {
                tracing::error!("running publish job did not stop after interrupt");
            }
        }

        // flush report state still held by jobs that will never start
        for job in inner.queue.jobs() {
            if let Some(report) = job.report() {
                report.flush();
            }
        }
        tracing::info!("publish engine stopped");
    }

    async fn wait_for_worker_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.slot.lock().await.is_none() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.slot.lock().await.is_none();
            }
        }
    }

    /// Waits until no job is pending or running, up to `timeout`.
    ///
    /// Returns whether the engine became idle.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle().await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle().await;
            }
        }
    }

    pub async fn is_idle(&self) -> bool {
        self.inner.queue.is_empty() && self.inner.slot.lock().await.is_none()
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock().unwrap()
    }

    /// Enables the engine; queued jobs start being processed again.
    pub fn start(&self) {
        *self.inner.state.lock().unwrap() = EngineState::Started;
        tracing::info!("publish engine started");
        self.inner.spawn_tick();
    }

    /// Stops dequeuing; jobs can still be enqueued.
    pub fn stop(&self) {
        *self.inner.state.lock().unwrap() = EngineState::Stopped;
        tracing::info!("publish engine stopped accepting work");
    }

    /// Rejects new jobs from ordinary callers; the existing queue is still
    /// processed.
    pub fn disable(&self) {
        *self.inner.state.lock().unwrap() = EngineState::Disabled;
        tracing::info!("publish engine disabled");
    }

    pub fn register_listener(&self, listener: Arc<dyn PublishListener>) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.inner.notifier.lock().unwrap() = Some(notifier);
    }

    /// Looks a job up by id in the queue, the worker slot and the history.
    pub async fn job(&self, id: JobId) -> Option<JobView> {
        if let Some(job) = self.inner.queue.get(&id) {
            return Some(job.view());
        }
        {
            let slot = self.inner.slot.lock().await;
            if let Some(worker) = slot.as_ref() {
                if worker.job.id() == id {
                    return Some(worker.job.view());
                }
            }
        }
        self.inner.history.get(&id).map(|job| job.view())
    }

    /// The queued jobs in start order.
    pub fn pending(&self) -> Vec<PendingJob> {
        self.inner.queue.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// The finished jobs in finish order, optionally filtered by owner.
    pub fn history(&self, user: Option<&UserId>) -> Vec<FinishedJob> {
        self.inner.history.snapshot(user)
    }

    /// The currently running job, if any.
    pub async fn running(&self) -> Option<RunningJob> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref().and_then(|worker| worker.job.running_view())
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// Removes a finished job from the history, deleting its persisted form.
    ///
    /// Permitted only for the job owner or an administrator.
    pub async fn remove_from_history(
        &self,
        caller: &Caller,
        job_id: JobId,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        let job = inner
            .history
            .get(&job_id)
            .ok_or(EngineError::NotFound(job_id))?;
        if !caller.admin && caller.user != *job.user_id() {
            return Err(EngineError::PermissionDenied {
                user: caller.user.clone(),
                job: job_id,
            });
        }
        let job = inner
            .history
            .remove(&job_id)
            .ok_or(EngineError::NotFound(job_id))?;
        inner.drop_persisted(job_id).await;
        if let Some(finished) = job.finished_view() {
            inner.listeners.fire_remove(&finished);
        }
        Ok(())
    }
}

impl<S: ContentStore> EngineInner<S> {
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn shutdown_signal(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    fn spawn_tick(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.check_for_work().await });
    }

    /// The scheduling tick: the only place new work is started.
    ///
    /// Idempotent; calling it redundantly from any trigger point never
    /// starts two workers concurrently, because the whole check runs under
    /// the worker-slot lock.
    pub(crate) async fn check_for_work(self: &Arc<Self>) {
        // let a just-finished worker fully release its slot first
        tokio::time::sleep(self.config.tick_delay).await;
        let mut slot = self.slot.lock().await;

        // a terminated task that never signalled is a dead worker: a fatal
        // failure of that one job
        let is_dead = slot.as_ref().map_or(false, |worker| {
            worker.handle.is_finished() && !worker.completed.load(Ordering::Acquire)
        });
        if !is_dead && slot.is_some() {
            return;
        }
        if let Some(dead) = slot.take() {
            tracing::error!(
                job_id = %dead.job.id(),
                worker = %dead.id,
                "publish worker terminated without signalling; discarding its job"
            );
            dead.handle.abort();
            self.release_locks(&dead.job).await;
            if let Some(report) = dead.job.report() {
                report.error("publish worker terminated unexpectedly");
            }
            self.conclude(&dead.job, JobOutcome::Failed).await;
            // fall through once to pick up the next pending job
        }

        // a disabled engine rejects new jobs but keeps draining the queue;
        // only a stopped engine parks pending work
        if self.shutting_down.load(Ordering::Acquire)
            || *self.state.lock().unwrap() == EngineState::Stopped
        {
            if slot.is_none() && self.queue.is_empty() {
                self.idle.notify_waiters();
            }
            return;
        }

        loop {
            let Some(job) = self.queue.pop_front() else {
                if slot.is_none() {
                    self.idle.notify_waiters();
                }
                return;
            };
            let Some(list) = job.publish_list() else {
                tracing::error!(job_id = %job.id(), "pending job has no publish list; discarding");
                self.conclude(&job, JobOutcome::Failed).await;
                continue;
            };
            if let Err(err) = self.store.lock_publish_list(&list).await {
                if let Some(report) = job.report() {
                    report.error(&format!("could not lock publish resources: {err}"));
                }
                tracing::warn!(job_id = %job.id(), %err, "could not lock publish resources");
                self.conclude(&job, JobOutcome::Failed).await;
                continue;
            }
            let id = WorkerId(self.worker_seq.fetch_add(1, Ordering::Relaxed) + 1);
            let worker = worker::spawn(Arc::clone(self), id, Arc::clone(&job));
            tracing::debug!(job_id = %job.id(), worker = %id, "publish worker activated");
            *slot = Some(worker);
            return;
        }
    }

    /// Worker callback: the job has recorded its start transition.
    pub(crate) async fn job_started(&self, job: &Arc<PublishJob>) {
        if let Err(err) = self.store.write_job_record(&job.record_data()).await {
            tracing::warn!(job_id = %job.id(), %err, "failed to persist started publish job");
        }
        if let Some(view) = job.running_view() {
            tracing::debug!(job_id = %job.id(), "publish job started");
            self.listeners.fire_start(&view, job.report().as_ref());
        }
    }

    /// Worker callback: the job's publish has completed, failed or been
    /// interrupted.
    pub(crate) async fn job_finished(
        self: &Arc<Self>,
        worker: WorkerId,
        job: Arc<PublishJob>,
        outcome: JobOutcome,
    ) {
        let finished = self.conclude(&job, outcome).await;
        tracing::info!(
            job_id = %finished.id,
            outcome = ?finished.outcome,
            warnings = finished.warnings,
            errors = finished.errors,
            "publish job finished"
        );
        {
            // clear the slot only if we are still the tracked worker
            let mut slot = self.slot.lock().await;
            if slot.as_ref().is_some_and(|handle| handle.id == worker) {
                *slot = None;
            }
        }
        self.idle.notify_waiters();
        self.spawn_tick();
    }

    /// Worker callback: the worker lost the pre-start race to an abort and
    /// never ran its job.
    pub(crate) async fn worker_abandoned(self: &Arc<Self>, worker: WorkerId) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|handle| handle.id == worker) {
            *slot = None;
            drop(slot);
            self.spawn_tick();
        }
    }

    async fn release_locks(&self, job: &Arc<PublishJob>) {
        if let Some(list) = job.publish_list() {
            if let Err(err) = self.store.unlock_publish_list(&list).await {
                tracing::warn!(job_id = %job.id(), %err, "failed to release publish locks");
            }
        }
    }

    /// Records the finish transition and persists the final record and
    /// report.
    async fn close_job(
        &self,
        job: &Arc<PublishJob>,
        outcome: JobOutcome,
    ) -> (FinishedJob, Option<SharedReport>) {
        let report = job.report();
        let finished = job.finish(outcome);
        if let Some(report) = &report {
            report.flush();
            if let Err(err) = self.store.write_report(finished.id, &report.bytes()).await {
                tracing::warn!(job_id = %finished.id, %err, "failed to persist publish report");
            }
        }
        if let Err(err) = self.store.write_job_record(&job.record_data()).await {
            tracing::warn!(job_id = %finished.id, %err, "failed to persist finished publish job");
        }
        (finished, report)
    }

    /// Closes a job through the finish path: fires the finish event,
    /// notifies the owner and archives the record.
    async fn conclude(&self, job: &Arc<PublishJob>, outcome: JobOutcome) -> FinishedJob {
        let (finished, report) = self.close_job(job, outcome).await;
        self.listeners.fire_finish(&finished, report.as_ref());
        self.notify_finished(&finished);
        self.archive(Arc::clone(job)).await;
        finished
    }

    async fn archive(&self, job: Arc<PublishJob>) {
        let evicted = self.history.add(job);
        self.drop_evicted(evicted).await;
    }

    async fn drop_evicted(&self, evicted: Vec<Arc<PublishJob>>) {
        if evicted.is_empty() {
            return;
        }
        evicted
            .iter()
            .map(|job| self.drop_persisted(job.id()))
            .collect::<FuturesOrdered<_>>()
            .collect::<Vec<()>>()
            .await;
        for job in evicted {
            if let Some(finished) = job.finished_view() {
                self.listeners.fire_remove(&finished);
            }
        }
    }

    async fn drop_persisted(&self, id: JobId) {
        let _ = self
            .store
            .delete_job_record(id)
            .await
            .inspect_err(|err| {
                tracing::warn!(job_id = %id, %err, "failed to delete persisted job record")
            });
        let _ = self.store.delete_report(id).await.inspect_err(|err| {
            tracing::warn!(job_id = %id, %err, "failed to delete persisted report")
        });
    }

    fn notify_finished(&self, finished: &FinishedJob) {
        let Some(notifier) = self.notifier.lock().unwrap().clone() else {
            return;
        };
        let routine = notifier.wants_routine(&finished.user_id);
        if listener::should_notify(finished, self.config.long_job, self.config.large_job, routine)
        {
            notifier.deliver(&finished.user_id, &listener::completion_message(finished));
        }
    }

    fn notify_aborted(&self, finished: &FinishedJob, aborted_by: &UserId) {
        let Some(notifier) = self.notifier.lock().unwrap().clone() else {
            return;
        };
        let message = listener::abort_message(finished, aborted_by);
        notifier.deliver(&finished.user_id, &message);
        if aborted_by != &finished.user_id {
            notifier.deliver(aborted_by, &message);
        }
    }
}
