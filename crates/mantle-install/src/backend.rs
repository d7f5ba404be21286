//! Backend worker
//!
//! The frontend only records intent: it writes a document in a non-terminal
//! state and hands the key to a [`Dispatcher`]. The [`Backend`] then moves
//! the document to its next state:
//!
//! | state | action |
//! |---|---|
//! | Creating | run the installer |
//! | Updating | persist Succeeded |
//! | Deleting | delete DNS record, cluster resource group, then the document |
//! | Succeeded, Failed | nothing |

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};

#[cfg(test)]
use mockall::automock;

use mantle_common::model::{ClusterDocument, FailureRecord, ProvisioningState, ResourceId};
use mantle_common::retry::{retry_on_conflict, RetryConfig};
use mantle_common::{Error, Result};
use mantle_store::{mutate, DocumentStore};

use crate::azure::ResourceGroupsClient;
use crate::deploy::{wait_for_operation, DEPLOYMENT_POLL_INTERVAL};
use crate::dns::DnsRegistrar;
use crate::installer::Installer;

/// Stage name recorded when a delete fails
const DELETE_STAGE: &str = "delete";

/// Hands document keys to the backend
#[cfg_attr(test, automock)]
pub trait Dispatcher: Send + Sync {
    /// Schedule processing of `key`; returns immediately
    fn dispatch(&self, key: &str);
}

/// Moves documents from non-terminal states to terminal ones
pub struct Backend {
    store: Arc<dyn DocumentStore>,
    installer: Installer,
    dns: Arc<DnsRegistrar>,
    resource_groups: Arc<dyn ResourceGroupsClient>,
    poll_interval: Duration,
}

impl Backend {
    /// A backend over `store`
    pub fn new(
        store: Arc<dyn DocumentStore>,
        installer: Installer,
        dns: Arc<DnsRegistrar>,
        resource_groups: Arc<dyn ResourceGroupsClient>,
    ) -> Self {
        Self {
            store,
            installer,
            dns,
            resource_groups,
            poll_interval: DEPLOYMENT_POLL_INTERVAL,
        }
    }

    /// Override the resource group deletion poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Act on the current state of `key`
    #[instrument(skip(self, cancel), fields(cluster = %key))]
    pub async fn process(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let doc = match self.store.get(key).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => {
                debug!("document is gone, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match doc.state() {
            ProvisioningState::Creating => {
                let outcome = self.installer.install(key, cancel).await?;
                debug!(?outcome, "install attempt finished");
                Ok(())
            }
            ProvisioningState::Updating => self.finish_update(key, cancel).await,
            ProvisioningState::Deleting => match self.delete(&doc, cancel).await {
                Err(e) if !e.is_cancelled() => {
                    error!(error = %e, "delete failed");
                    self.record_failure(key, &e, cancel).await
                }
                other => other,
            },
            ProvisioningState::Succeeded | ProvisioningState::Failed => {
                debug!(state = %doc.state(), "terminal state, nothing to do");
                Ok(())
            }
        }
    }

    /// Re-dispatch every document left in a non-terminal state
    ///
    /// Run once at startup so work interrupted by a restart continues. A
    /// Failed document is never resumed.
    pub async fn recover(&self, dispatcher: &dyn Dispatcher) -> Result<usize> {
        let docs = self.store.list("").await?;
        let mut dispatched = 0;
        for doc in docs.iter().filter(|d| !d.state().is_terminal()) {
            info!(cluster = %doc.key, state = %doc.state(), "resuming interrupted work");
            dispatcher.dispatch(&doc.key);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn finish_update(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        mutate(self.store.as_ref(), key, cancel, |doc| {
            if doc.state() == ProvisioningState::Updating {
                doc.cluster.properties.provisioning_state = ProvisioningState::Succeeded;
                doc.cluster.properties.last_error = None;
            }
            Ok(())
        })
        .await?;
        info!("update succeeded");
        Ok(())
    }

    async fn delete(&self, doc: &ClusterDocument, cancel: &CancellationToken) -> Result<()> {
        let cluster = &doc.cluster;
        self.dns.unregister(cluster).await?;

        let subscription = ResourceId::parse(&cluster.id)?.subscription;
        let resource_group = &cluster.properties.resource_group;
        if !resource_group.is_empty() {
            if let Some(handle) = self
                .resource_groups
                .begin_delete(&subscription, resource_group)
                .await?
            {
                info!(resource_group = %resource_group, "deleting cluster resource group");
                wait_for_operation(
                    "delete-resource-group",
                    &handle,
                    self.poll_interval,
                    cancel,
                    || self.resource_groups.poll(&handle),
                )
                .await?;
            }
        }

        let key = doc.key.as_str();
        let store = self.store.as_ref();
        retry_on_conflict(&RetryConfig::conflict(), "delete_document", cancel, || async move {
            let current = match store.get(key).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            if current.state() != ProvisioningState::Deleting {
                return Err(Error::internal_with_context(
                    "backend",
                    format!("cluster left Deleting (now {})", current.state()),
                ));
            }
            match store.delete(key, &current.etag).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;
        info!("cluster deleted");
        Ok(())
    }

    async fn record_failure(&self, key: &str, error: &Error, cancel: &CancellationToken) -> Result<()> {
        let record = FailureRecord {
            stage: DELETE_STAGE.to_string(),
            message: error.to_string(),
            at: Utc::now(),
        };
        mutate(self.store.as_ref(), key, cancel, |doc| {
            doc.cluster.properties.provisioning_state = ProvisioningState::Failed;
            doc.cluster.properties.last_error = Some(record.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Runs the backend in-process, one task per key
///
/// A key that is already being processed is not started again. If it is
/// dispatched meanwhile, the running task processes it once more when it
/// finishes, so a state change made during an attempt is never missed.
pub struct LocalDispatcher {
    backend: Arc<Backend>,
    in_flight: Arc<DashMap<String, bool>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl LocalDispatcher {
    /// A dispatcher whose tasks stop when `cancel` fires
    pub fn new(backend: Arc<Backend>, cancel: CancellationToken) -> Self {
        Self {
            backend,
            in_flight: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Number of keys being processed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancel every task and wait for them to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("backend stopped");
    }
}

impl Dispatcher for LocalDispatcher {
    fn dispatch(&self, key: &str) {
        match self.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut running) => {
                debug!(cluster = %key, "already in flight, queued a re-run");
                *running.get_mut() = true;
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let backend = self.backend.clone();
        let in_flight = self.in_flight.clone();
        let cancel = self.cancel.clone();
        let key = key.to_string();
        let span = tracing::info_span!("backend", cluster = %key);
        self.tracker.spawn(
            async move {
                loop {
                    if let Err(e) = backend.process(&key, &cancel).await {
                        if e.is_cancelled() {
                            info!("processing cancelled");
                        } else {
                            warn!(error = %e, "processing failed");
                        }
                    }
                    if cancel.is_cancelled() {
                        in_flight.remove(&key);
                        break;
                    }
                    // Once the slot is released a new dispatch may own the key.
                    if in_flight.remove_if(&key, |_, rerun| !*rerun).is_some() {
                        break;
                    }
                    if let Some(mut rerun) = in_flight.get_mut(&key) {
                        *rerun = false;
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::{
        MockRecordSets, MockResourceGroupsClient, OperationStatus, RecordSets,
    };
    use crate::installer::tests::{handle, seeded_store, Fixture};
    use mantle_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dns(records: MockRecordSets) -> Arc<DnsRegistrar> {
        let records: Arc<dyn RecordSets> = Arc::new(records);
        Arc::new(DnsRegistrar::new(records, "rp-sub", "rp-rg", "example.com"))
    }

    fn deleting_records() -> MockRecordSets {
        let mut records = MockRecordSets::new();
        records
            .expect_delete_cname()
            .withf(|_, _, _, name| name.to_string() == "api.test-cluster")
            .returning(|_, _, _, _| Ok(()));
        records
    }

    fn backend(
        store: Arc<MemoryStore>,
        records: MockRecordSets,
        groups: MockResourceGroupsClient,
    ) -> Backend {
        Backend::new(
            store.clone(),
            Fixture::happy().installer(store),
            dns(records),
            Arc::new(groups),
        )
        .with_poll_interval(Duration::from_millis(1))
    }

    async fn set_state(store: &MemoryStore, key: &str, state: ProvisioningState) {
        mutate(store, key, &CancellationToken::new(), |doc| {
            doc.cluster.properties.provisioning_state = state;
            Ok(())
        })
        .await
        .expect("set state");
    }

    async fn wait_idle(dispatcher: &LocalDispatcher) {
        for _ in 0..500 {
            if dispatcher.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("dispatcher never went idle");
    }

    #[tokio::test]
    async fn updating_is_persisted_as_succeeded() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Updating).await;
        let backend = backend(store.clone(), MockRecordSets::new(), MockResourceGroupsClient::new());

        backend
            .process(&key, &CancellationToken::new())
            .await
            .expect("process");
        assert_eq!(
            store.get(&key).await.expect("doc").state(),
            ProvisioningState::Succeeded
        );
    }

    #[tokio::test]
    async fn deleting_removes_dns_resource_group_and_document() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Deleting).await;

        let mut groups = MockResourceGroupsClient::new();
        groups
            .expect_begin_delete()
            .withf(|sub, name| {
                sub.to_string() == "00000000-0000-0000-0000-000000000000"
                    && name.to_string() == "test-cluster"
            })
            .times(1)
            .returning(|_, _| Ok(Some(handle())));
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        groups.expect_poll().returning(move |_| {
            if p.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(OperationStatus::InProgress { retry_after: None })
            } else {
                Ok(OperationStatus::Succeeded)
            }
        });

        let backend = backend(store.clone(), deleting_records(), groups);
        backend
            .process(&key, &CancellationToken::new())
            .await
            .expect("process");
        assert!(store.get(&key).await.expect_err("deleted").is_not_found());
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delete_failure_marks_cluster_failed() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Deleting).await;

        let mut groups = MockResourceGroupsClient::new();
        groups
            .expect_begin_delete()
            .returning(|_, _| Ok(Some(handle())));
        groups.expect_poll().returning(|_| {
            Ok(OperationStatus::Failed {
                code: "ScopeLocked".into(),
                message: "resource group is locked".into(),
            })
        });

        let backend = backend(store.clone(), deleting_records(), groups);
        backend
            .process(&key, &CancellationToken::new())
            .await
            .expect("failure persisted");
        let doc = store.get(&key).await.expect("doc kept");
        assert_eq!(doc.state(), ProvisioningState::Failed);
        let failure = doc.cluster.properties.last_error.expect("failure");
        assert_eq!(failure.stage, "delete");
        assert!(failure.message.contains("ScopeLocked"));
    }

    #[tokio::test]
    async fn terminal_states_are_left_alone() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Failed).await;
        let before = store.get(&key).await.expect("doc");

        let backend = backend(store.clone(), MockRecordSets::new(), MockResourceGroupsClient::new());
        backend
            .process(&key, &CancellationToken::new())
            .await
            .expect("process");
        assert_eq!(store.get(&key).await.expect("doc").etag, before.etag);
    }

    #[tokio::test]
    async fn recover_dispatches_only_non_terminal_documents() {
        let (store, key) = seeded_store().await;
        let mut other = store.get(&key).await.expect("doc");
        other.key = format!("{}-done", key);
        other.etag.clear();
        other.cluster.properties.provisioning_state = ProvisioningState::Succeeded;
        store.create(other).await.expect("seed");

        let mut dispatcher = MockDispatcher::new();
        let expected = key.clone();
        dispatcher
            .expect_dispatch()
            .withf(move |k| k.to_string() == expected)
            .times(1)
            .return_const(());

        let backend = backend(store.clone(), MockRecordSets::new(), MockResourceGroupsClient::new());
        assert_eq!(backend.recover(&dispatcher).await.expect("recover"), 1);
    }

    #[tokio::test]
    async fn dispatching_a_busy_key_does_not_start_a_second_attempt() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Deleting).await;

        let mut groups = MockResourceGroupsClient::new();
        groups
            .expect_begin_delete()
            .times(1)
            .returning(|_, _| Ok(Some(handle())));
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        groups.expect_poll().returning(move |_| {
            if p.fetch_add(1, Ordering::SeqCst) < 5 {
                Ok(OperationStatus::InProgress { retry_after: None })
            } else {
                Ok(OperationStatus::Succeeded)
            }
        });

        let backend = Arc::new(backend(store.clone(), deleting_records(), groups));
        let dispatcher = LocalDispatcher::new(backend, CancellationToken::new());
        dispatcher.dispatch(&key);
        dispatcher.dispatch(&key);
        dispatcher.dispatch(&key);

        wait_idle(&dispatcher).await;
        assert!(store.is_empty());
    }

    /// Tracks how many `get` calls overlap
    struct OverlapStore {
        inner: Arc<MemoryStore>,
        active: AtomicU32,
        peak: AtomicU32,
        gets: AtomicU32,
    }

    #[async_trait::async_trait]
    impl DocumentStore for OverlapStore {
        async fn get(&self, key: &str) -> Result<ClusterDocument> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_micros(200)).await;
            let doc = self.inner.get(key).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            doc
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ClusterDocument>> {
            self.inner.list(prefix).await
        }

        async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
            self.inner.create(doc).await
        }

        async fn update(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
            self.inner.update(doc).await
        }

        async fn delete(&self, key: &str, etag: &str) -> Result<()> {
            self.inner.delete(key, etag).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_dispatches_never_overlap_attempts_for_one_key() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Failed).await;
        let overlap = Arc::new(OverlapStore {
            inner: store.clone(),
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            gets: AtomicU32::new(0),
        });
        let backend = Arc::new(Backend::new(
            overlap.clone(),
            Fixture::happy().installer(store),
            dns(MockRecordSets::new()),
            Arc::new(MockResourceGroupsClient::new()),
        ));
        let dispatcher = Arc::new(LocalDispatcher::new(backend, CancellationToken::new()));

        let senders: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    for i in 0..500 {
                        dispatcher.dispatch(&key);
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.expect("sender");
        }

        wait_idle(&dispatcher).await;
        assert!(overlap.gets.load(Ordering::SeqCst) >= 1);
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_work() {
        let (store, key) = seeded_store().await;
        set_state(&store, &key, ProvisioningState::Deleting).await;

        let mut groups = MockResourceGroupsClient::new();
        groups
            .expect_begin_delete()
            .returning(|_, _| Ok(Some(handle())));
        groups
            .expect_poll()
            .returning(|_| Ok(OperationStatus::InProgress { retry_after: None }));

        let backend = Arc::new(backend(store.clone(), deleting_records(), groups));
        let dispatcher = LocalDispatcher::new(backend, CancellationToken::new());
        dispatcher.dispatch(&key);
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.shutdown().await;

        // Cancelled work leaves the document as it was
        let doc = store.get(&key).await.expect("doc kept");
        assert_eq!(doc.state(), ProvisioningState::Deleting);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
