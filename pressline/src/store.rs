//! The content-store collaborator interface.
//!
//! The engine never manipulates stored content itself: resolving publish
//! lists, locking resources, executing the publish and persisting job
//! records all happen behind [`ContentStore`].

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{JobId, JobRecordData, ProjectId, PublishRequest};
use crate::report::SharedReport;

pub mod memory;

/// The concrete, resolved set of resources a publish job will act on.
///
/// Owned by the content store; the engine only holds a reference to it while
/// the job is pending or running.
#[derive(Debug, Clone)]
pub struct PublishList {
    pub project: ProjectId,
    pub resources: Vec<String>,
}

/// Result of an executed publish.
///
/// Ordinary per-resource problems are not failures of the call: the store
/// writes them to the report and they surface as the job's warning and error
/// counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    /// The number of resources actually promoted to the authoritative store.
    pub published: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {0} is locked by another publish")]
    ResourceLocked(String),
    #[error("error encoding or decoding a persisted job record")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("content store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow interface to the content store.
///
/// `unlock_publish_list` must be idempotent-safe: both the worker's exit path
/// and the abort path can legitimately release the same locks during
/// shutdown races.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Resolves the concrete resource set for a publish request.
    async fn resolve_publish_list(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishList, StoreError>;

    /// Locks every resource on the list, all or nothing.
    async fn lock_publish_list(&self, list: &PublishList) -> Result<(), StoreError>;

    /// Releases the locks for the list. Releasing twice must not corrupt
    /// state.
    async fn unlock_publish_list(&self, list: &PublishList) -> Result<(), StoreError>;

    /// Performs the publish, writing progress, warnings and errors to the
    /// report. Returns `Err` only for hard store faults, never for ordinary
    /// content errors.
    async fn execute_publish(
        &self,
        list: &PublishList,
        report: &SharedReport,
    ) -> Result<PublishOutcome, StoreError>;

    async fn write_job_record(&self, record: &JobRecordData) -> Result<(), StoreError>;

    async fn read_job_record(&self, id: JobId) -> Result<Option<JobRecordData>, StoreError>;

    async fn delete_job_record(&self, id: JobId) -> Result<(), StoreError>;

    async fn write_report(&self, id: JobId, bytes: &[u8]) -> Result<(), StoreError>;

    async fn read_report(&self, id: JobId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete_report(&self, id: JobId) -> Result<(), StoreError>;
}
