//! A background publish engine for content stores.
//!
//! Pressline queues publish requests as jobs and executes them one at a
//! time against a [`store::ContentStore`]. Jobs move from a FIFO pending
//! queue through a single worker slot into a bounded history; every job
//! finishes exactly once, with one of [`job::JobOutcome`]'s three outcomes.
//! Lifecycle events fan out to registered [`listener::PublishListener`]s and
//! a [`listener::Notifier`] delivers completion messages to job owners.
//!
//! The entry point is [`engine::PublishEngine`]; see its documentation for a
//! usage example.

use thiserror::Error;

pub mod config;
pub mod engine;
pub mod job;
pub mod listener;
pub mod report;
pub mod store;

mod history;
mod queue;
mod worker;

pub use config::EngineConfig;
pub use engine::{Caller, EngineState, PublishEngine};

use job::{JobId, UserId};
use store::StoreError;

/// Errors returned by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is disabled and the caller is not an administrator.
    #[error("the publish engine is disabled")]
    Disabled,
    /// The engine is shutting down and accepts no new jobs.
    #[error("the publish engine is shutting down")]
    ShuttingDown,
    /// No pending or running job has this id.
    #[error("no publish job with id {0}")]
    NotFound(JobId),
    /// The caller is neither the job's owner nor an administrator.
    #[error("user {user} may not operate on publish job {job}")]
    PermissionDenied { user: UserId, job: JobId },
    /// The job's worker already signalled "started"; the job can no longer
    /// be aborted.
    #[error("publish job {0} has already started")]
    AlreadyStarted(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}
