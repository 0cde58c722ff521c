//! An in-memory implementation of [`ContentStore`].
//!
//! Provided for tests and small single-process deployments. It is a correct
//! but unoptimized implementation, with hooks for scripting per-resource
//! outcomes and store faults from tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::job::{JobId, JobRecordData, ProjectId, PublishRequest};
use crate::report::SharedReport;

use super::{ContentStore, PublishList, PublishOutcome, StoreError};

/// In-memory content store.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    project_resources: Mutex<HashMap<ProjectId, Vec<String>>>,
    locks: Mutex<HashSet<String>>,
    records: Mutex<HashMap<JobId, JobRecordData>>,
    reports: Mutex<HashMap<JobId, Vec<u8>>>,
    warn_resources: Mutex<HashSet<String>>,
    fail_resources: Mutex<HashSet<String>>,
    publish_delay: Mutex<Duration>,
    next_publish_failure: Mutex<Option<String>>,
    next_record_failure: Mutex<Option<String>>,
    panic_next_publish: AtomicBool,
    executed: Mutex<Vec<PublishList>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            project_resources: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashSet::new()),
            records: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            warn_resources: Mutex::new(HashSet::new()),
            fail_resources: Mutex::new(HashSet::new()),
            publish_delay: Mutex::new(Duration::ZERO),
            next_publish_failure: Mutex::new(None),
            next_record_failure: Mutex::new(None),
            panic_next_publish: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

// Decrements the in-flight gauge on every exit path, including panics.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the resources a whole-project publish of `project`
    /// resolves to.
    pub fn with_project_resources(
        self,
        project: impl Into<ProjectId>,
        resources: Vec<String>,
    ) -> Self {
        self.inner
            .project_resources
            .lock()
            .unwrap()
            .insert(project.into(), resources);
        self
    }

    /// Makes every publish take at least this long.
    pub fn with_publish_delay(self, delay: Duration) -> Self {
        *self.inner.publish_delay.lock().unwrap() = delay;
        self
    }

    /// Scripts a warning for this resource on every publish.
    pub fn warn_resource(&self, path: &str) {
        self.inner
            .warn_resources
            .lock()
            .unwrap()
            .insert(path.to_owned());
    }

    /// Scripts a per-resource failure for this resource on every publish.
    pub fn fail_resource(&self, path: &str) {
        self.inner
            .fail_resources
            .lock()
            .unwrap()
            .insert(path.to_owned());
    }

    /// Makes the next `execute_publish` fail hard with the given message.
    pub fn fail_next_publish(&self, message: &str) {
        *self.inner.next_publish_failure.lock().unwrap() = Some(message.to_owned());
    }

    /// Makes the next `write_job_record` fail with the given message.
    pub fn fail_next_record_write(&self, message: &str) {
        *self.inner.next_record_failure.lock().unwrap() = Some(message.to_owned());
    }

    /// Makes the next `execute_publish` panic, simulating an unexpected
    /// runtime fault in the worker.
    pub fn panic_next_publish(&self) {
        self.inner.panic_next_publish.store(true, Ordering::Release);
    }

    /// The publish lists executed so far, in execution order.
    pub fn executed(&self) -> Vec<PublishList> {
        self.inner.executed.lock().unwrap().clone()
    }

    /// The highest number of publishes ever observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::Acquire)
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.inner.locks.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn resolve_publish_list(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishList, StoreError> {
        let resources = match &request.resources {
            Some(resources) => resources.clone(),
            None => self
                .inner
                .project_resources
                .lock()
                .unwrap()
                .get(&request.project_id)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(PublishList {
            project: request.project_id.clone(),
            resources,
        })
    }

    async fn lock_publish_list(&self, list: &PublishList) -> Result<(), StoreError> {
        let mut locks = self.inner.locks.lock().unwrap();
        if let Some(taken) = list.resources.iter().find(|path| locks.contains(*path)) {
            return Err(StoreError::ResourceLocked(taken.clone()));
        }
        for path in &list.resources {
            locks.insert(path.clone());
        }
        Ok(())
    }

    async fn unlock_publish_list(&self, list: &PublishList) -> Result<(), StoreError> {
        let mut locks = self.inner.locks.lock().unwrap();
        for path in &list.resources {
            locks.remove(path);
        }
        Ok(())
    }

    async fn execute_publish(
        &self,
        list: &PublishList,
        report: &SharedReport,
    ) -> Result<PublishOutcome, StoreError> {
        let in_flight = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner
            .max_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);
        let _guard = InFlightGuard(&self.inner.in_flight);

        if self.inner.panic_next_publish.swap(false, Ordering::AcqRel) {
            panic!("content store fault injected");
        }
        if let Some(message) = self.inner.next_publish_failure.lock().unwrap().take() {
            return Err(StoreError::Unavailable(message));
        }

        let delay = *self.inner.publish_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut published = 0;
        for path in &list.resources {
            if self.inner.fail_resources.lock().unwrap().contains(path) {
                report.error(&format!("failed to publish {path}"));
            } else if self.inner.warn_resources.lock().unwrap().contains(path) {
                report.warn(&format!("published {path} with problems"));
                published += 1;
            } else {
                report.print(&format!("publishing {path}"));
                published += 1;
            }
        }

        self.inner.executed.lock().unwrap().push(list.clone());
        Ok(PublishOutcome { published })
    }

    async fn write_job_record(&self, record: &JobRecordData) -> Result<(), StoreError> {
        if let Some(message) = self.inner.next_record_failure.lock().unwrap().take() {
            return Err(StoreError::Unavailable(message));
        }
        self.inner
            .records
            .lock()
            .unwrap()
            .insert(record.history_id, record.clone());
        Ok(())
    }

    async fn read_job_record(&self, id: JobId) -> Result<Option<JobRecordData>, StoreError> {
        Ok(self.inner.records.lock().unwrap().get(&id).cloned())
    }

    async fn delete_job_record(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.records.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn write_report(&self, id: JobId, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner.reports.lock().unwrap().insert(id, bytes.to_vec());
        Ok(())
    }

    async fn read_report(&self, id: JobId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.reports.lock().unwrap().get(&id).cloned())
    }

    async fn delete_report(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.reports.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;

    fn direct_request(resources: &[&str]) -> PublishRequest {
        PublishRequest {
            project_id: "offline".into(),
            project_name: "Offline".to_owned(),
            locale: "en".to_owned(),
            resources: Some(resources.iter().map(|r| (*r).to_owned()).collect()),
        }
    }

    fn record(id: JobId) -> JobRecordData {
        JobRecordData {
            history_id: id,
            project_id: "offline".into(),
            project_name: "Offline".to_owned(),
            user_id: "alice".into(),
            locale: "en".to_owned(),
            direct_publish: true,
            resource_count: 1,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn resolves_direct_and_project_publishes() {
        let store = InMemoryStore::new()
            .with_project_resources("offline", vec!["/x".to_owned(), "/y".to_owned()]);

        let direct = store
            .resolve_publish_list(&direct_request(&["/a", "/b", "/c"]))
            .await
            .unwrap();
        assert_eq!(direct.resources, vec!["/a", "/b", "/c"]);

        let whole = store
            .resolve_publish_list(&PublishRequest {
                resources: None,
                ..direct_request(&[])
            })
            .await
            .unwrap();
        assert_eq!(whole.resources, vec!["/x", "/y"]);
    }

    #[tokio::test]
    async fn locks_are_all_or_nothing_and_unlock_is_idempotent() {
        let store = InMemoryStore::new();
        let first = PublishList {
            project: "offline".into(),
            resources: vec!["/a".to_owned(), "/b".to_owned()],
        };
        store.lock_publish_list(&first).await.unwrap();

        let overlapping = PublishList {
            project: "offline".into(),
            resources: vec!["/c".to_owned(), "/b".to_owned()],
        };
        let err = store.lock_publish_list(&overlapping).await.unwrap_err();
        assert_matches!(err, StoreError::ResourceLocked(path) if path == "/b");
        // the failed attempt must not have locked /c
        assert!(!store.is_locked("/c"));

        store.unlock_publish_list(&first).await.unwrap();
        store.unlock_publish_list(&first).await.unwrap();
        assert!(!store.is_locked("/a"));
        store.lock_publish_list(&overlapping).await.unwrap();
    }

    #[tokio::test]
    async fn scripted_outcomes_land_in_the_report() {
        let store = InMemoryStore::new();
        store.warn_resource("/warn");
        store.fail_resource("/bad");
        let list = PublishList {
            project: "offline".into(),
            resources: vec!["/ok".to_owned(), "/warn".to_owned(), "/bad".to_owned()],
        };
        let report = SharedReport::new(None);

        let outcome = store.execute_publish(&list, &report).await.unwrap();
        assert_eq!(outcome.published, 2);
        assert_eq!(report.warnings(), 1);
        assert_eq!(report.errors(), 1);
        assert_eq!(store.executed().len(), 1);
    }

    #[tokio::test]
    async fn hard_failure_only_fails_once() {
        let store = InMemoryStore::new();
        store.fail_next_publish("store offline");
        let list = PublishList {
            project: "offline".into(),
            resources: vec![],
        };
        let report = SharedReport::new(None);

        let err = store.execute_publish(&list, &report).await.unwrap_err();
        assert_matches!(err, StoreError::Unavailable(_));
        store.execute_publish(&list, &report).await.unwrap();
    }

    #[tokio::test]
    async fn record_and_report_round_trip() {
        let store = InMemoryStore::new();
        let id = JobId::new();
        store.write_job_record(&record(id)).await.unwrap();
        assert!(store.read_job_record(id).await.unwrap().is_some());
        store.write_report(id, b"report body").await.unwrap();
        assert_eq!(
            store.read_report(id).await.unwrap().unwrap(),
            b"report body".to_vec()
        );

        store.delete_job_record(id).await.unwrap();
        store.delete_report(id).await.unwrap();
        assert!(store.read_job_record(id).await.unwrap().is_none());
        assert!(store.read_report(id).await.unwrap().is_none());
    }
}
