//! Versioned cluster document storage
//!
//! Every store implements [`DocumentStore`]: single-key atomic CRUD with
//! optimistic concurrency on the document etag. There are no cross-document
//! transactions; each cluster is an independent document.
//!
//! Callers that read, modify and write a document should go through
//! [`mutate`], which re-runs the whole cycle whenever another writer wins
//! the race.

#![deny(missing_docs)]

pub mod cosmos;
pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use mantle_common::model::ClusterDocument;
use mantle_common::retry::{retry_on_conflict, RetryConfig};
use mantle_common::Result;

pub use cosmos::{CosmosConfig, CosmosStore};
pub use memory::MemoryStore;

/// Single-document CRUD with etag preconditions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document for `key`
    ///
    /// Fails with NotFound when absent; never with a concurrency error.
    async fn get(&self, key: &str) -> Result<ClusterDocument>;

    /// All documents whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<ClusterDocument>>;

    /// Insert a new document
    ///
    /// Fails with Conflict if a document already exists for the key.
    /// Returns the stored document with its first etag.
    async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument>;

    /// Replace a document
    ///
    /// Fails with PreconditionFailed when `doc.etag` is not the stored etag.
    /// Returns the stored document with its new etag.
    async fn update(&self, doc: ClusterDocument) -> Result<ClusterDocument>;

    /// Remove a document, with the same precondition rule as `update`
    async fn delete(&self, key: &str, etag: &str) -> Result<()>;
}

/// Read-modify-write one document until the write lands
///
/// `f` is applied to a freshly read copy on every attempt, so it must only
/// depend on the document it is given. Returning an error from `f` aborts
/// without writing. Only lost etag races are retried.
pub async fn mutate<F>(
    store: &dyn DocumentStore,
    key: &str,
    cancel: &CancellationToken,
    f: F,
) -> Result<ClusterDocument>
where
    F: Fn(&mut ClusterDocument) -> Result<()> + Send + Sync,
{
    let config = RetryConfig::conflict();
    let apply = &f;
    retry_on_conflict(&config, "mutate_document", cancel, move || async move {
        let mut doc = store.get(key).await?;
        apply(&mut doc)?;
        store.update(doc).await
    })
    .await
}
