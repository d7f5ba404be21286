//! In-process document store
//!
//! Backs development runs and tests. Each operation holds the shard lock
//! for its key for the whole compare-and-write, which gives the same
//! single-key atomicity a remote store provides.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use mantle_common::model::ClusterDocument;
use mantle_common::{Error, Result};

use crate::DocumentStore;

/// Documents held in memory, keyed by document key
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<String, ClusterDocument>,
}

impl MemoryStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when no documents are stored
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

fn next_etag() -> String {
    format!("\"{}\"", Uuid::new_v4())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<ClusterDocument> {
        self.docs
            .get(key)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::not_found(format!("no document for key '{}'", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ClusterDocument>> {
        let mut docs: Vec<ClusterDocument> = self
            .docs
            .iter()
            .filter(|d| d.key().starts_with(prefix))
            .map(|d| d.value().clone())
            .collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    async fn create(&self, mut doc: ClusterDocument) -> Result<ClusterDocument> {
        match self.docs.entry(doc.key.clone()) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "document for key '{}' already exists",
                doc.key
            ))),
            Entry::Vacant(slot) => {
                doc.etag = next_etag();
                slot.insert(doc.clone());
                Ok(doc)
            }
        }
    }

    async fn update(&self, mut doc: ClusterDocument) -> Result<ClusterDocument> {
        let mut current = self
            .docs
            .get_mut(&doc.key)
            .ok_or_else(|| Error::not_found(format!("no document for key '{}'", doc.key)))?;
        if current.etag != doc.etag {
            return Err(Error::precondition_failed(format!(
                "etag {} does not match stored etag for '{}'",
                doc.etag, doc.key
            )));
        }
        doc.etag = next_etag();
        *current = doc.clone();
        Ok(doc)
    }

    async fn delete(&self, key: &str, etag: &str) -> Result<()> {
        if self.docs.remove_if(key, |_, d| d.etag == etag).is_some() {
            return Ok(());
        }
        if self.docs.contains_key(key) {
            Err(Error::precondition_failed(format!(
                "etag {} does not match stored etag for '{}'",
                etag, key
            )))
        } else {
            Err(Error::not_found(format!("no document for key '{}'", key)))
        }
    }
}
