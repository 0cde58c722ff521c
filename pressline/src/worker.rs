//! The single background execution unit for one publish job.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::engine::EngineInner;
use crate::job::{JobOutcome, PublishJob};
use crate::store::ContentStore;

/// Identity token a worker records on its job while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerId(pub(crate) u64);

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

const PHASE_ACTIVATING: u8 = 0;
const PHASE_STARTED: u8 = 1;
const PHASE_ABORTED: u8 = 2;

/// Cooperative abort handshake between the engine and a worker.
///
/// The worker moves the phase from activating to started exactly once; an
/// abort only succeeds if it claims the phase first. After the worker has
/// started, cancellation is only possible through the shutdown interrupt.
pub(crate) struct WorkerSignal {
    phase: AtomicU8,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(PHASE_ACTIVATING),
        }
    }

    pub(crate) fn try_start(&self) -> bool {
        self.phase
            .compare_exchange(
                PHASE_ACTIVATING,
                PHASE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn try_abort(&self) -> bool {
        self.phase
            .compare_exchange(
                PHASE_ACTIVATING,
                PHASE_ABORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The engine's handle to the active worker.
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) job: Arc<PublishJob>,
    pub(crate) signal: Arc<WorkerSignal>,
    /// Set by the worker once it has signalled the engine; a terminated task
    /// that never set this is a dead worker.
    pub(crate) completed: Arc<AtomicBool>,
    pub(crate) handle: JoinHandle<()>,
}

pub(crate) fn spawn<S: ContentStore>(
    engine: Arc<EngineInner<S>>,
    id: WorkerId,
    job: Arc<PublishJob>,
) -> WorkerHandle {
    let signal = Arc::new(WorkerSignal::new());
    let completed = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(run(
        engine,
        id,
        Arc::clone(&job),
        Arc::clone(&signal),
        Arc::clone(&completed),
    ));
    WorkerHandle {
        id,
        job,
        signal,
        completed,
        handle,
    }
}

async fn run<S: ContentStore>(
    engine: Arc<EngineInner<S>>,
    id: WorkerId,
    job: Arc<PublishJob>,
    signal: Arc<WorkerSignal>,
    completed: Arc<AtomicBool>,
) {
    if !signal.try_start() {
        // aborted in the pre-start window; the abort path owns the job's
        // bookkeeping, this task only releases its slot
        tracing::debug!(job_id = %job.id(), %id, "publish worker abandoned before start");
        completed.store(true, Ordering::Release);
        engine.worker_abandoned(id).await;
        return;
    }

    let (list, report) = job.activate(id);
    engine.job_started(&job).await;

    let outcome = tokio::select! {
        result = engine.store().execute_publish(&list, &report) => match result {
            Ok(outcome) => {
                report.print(&format!(
                    "published {} of {} resources",
                    outcome.published,
                    list.resources.len()
                ));
                JobOutcome::Published
            }
            Err(err) => {
                // a publish failure is data, not an engine fault
                tracing::warn!(job_id = %job.id(), %err, "publish failed");
                report.error(&format!("publish failed: {err}"));
                JobOutcome::Failed
            }
        },
        () = engine.shutdown_signal().cancelled() => {
            report.print("publish interrupted by engine shutdown");
            JobOutcome::Aborted
        }
    };

    // locks are released on every exit path; the release is idempotent-safe
    if let Err(err) = engine.store().unlock_publish_list(&list).await {
        tracing::warn!(job_id = %job.id(), %err, "failed to release publish locks");
    }

    completed.store(true, Ordering::Release);
    engine.job_finished(id, job, outcome).await;
}
