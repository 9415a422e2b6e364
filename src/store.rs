//! # Store Module
//!
//! The narrow document-store interface the counter core runs against:
//! ordered range queries over a collection group, optimistic read-then-write
//! transactions, field-level merge / array-union / increment writes, and a
//! change feed for triggers.

use crate::model::Slice;
use crate::value::{Fields, Number, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A document read inside the transaction changed before commit.
    #[error("transaction aborted: {path} changed since it was read")]
    Aborted { path: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid document path: {0:?}")]
    InvalidPath(String),
    #[error("document codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Point-in-time view of one document. `data` is `None` when the document
/// does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: String,
    pub data: Option<Fields>,
    /// Commit sequence of the last write; 0 for a missing document.
    pub version: u64,
    pub update_time: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: None,
            version: 0,
            update_time: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn id(&self) -> &str {
        crate::sharding::basename(&self.path)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data
            .as_ref()
            .and_then(|data| crate::value::get_field(data, field))
    }
}

/// Collection-group query ordered by document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub collection_id: String,
    /// Inclusive lower bound; empty for unbounded.
    pub start: String,
    /// Exclusive upper bound; empty for unbounded.
    pub end: String,
    pub limit: usize,
}

impl RangeQuery {
    pub fn new(collection_id: impl Into<String>, slice: &Slice, limit: usize) -> Self {
        Self {
            collection_id: collection_id.into(),
            start: slice.start.clone(),
            end: slice.end.clone(),
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replace the whole document.
    Set { path: String, fields: Fields },
    /// Set dotted field paths, creating the document if needed.
    Merge {
        path: String,
        fields: Vec<(String, Value)>,
    },
    /// Append elements not already present in the array field.
    ArrayUnion {
        path: String,
        field: String,
        elements: Vec<Value>,
    },
    /// Add to a numeric dotted field, treating a missing field as zero.
    Increment {
        path: String,
        field: String,
        by: Number,
    },
    Delete { path: String },
}

impl Write {
    pub fn path(&self) -> &str {
        match self {
            Write::Set { path, .. }
            | Write::Merge { path, .. }
            | Write::ArrayUnion { path, .. }
            | Write::Increment { path, .. }
            | Write::Delete { path } => path,
        }
    }
}

/// What a transaction hands to the store: the versions it observed and the
/// writes to apply atomically if none of them moved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub preconditions: BTreeMap<String, u64>,
    pub writes: Vec<Write>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Snapshot, StoreError>;

    async fn get_all(&self, paths: &[String]) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            snapshots.push(self.get(path).await?);
        }
        Ok(snapshots)
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Snapshot>, StoreError>;

    /// Direct children of a collection, ordered by document id.
    async fn list(&self, collection_path: &str) -> Result<Vec<Snapshot>, StoreError>;

    async fn commit(&self, commit: Commit) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Read-then-write transaction. Every read records the observed version;
/// [`Transaction::commit`] fails with [`StoreError::Aborted`] if any of those
/// documents changed in between.
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    commit: Commit,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            commit: Commit::default(),
        }
    }

    pub async fn get(&mut self, path: &str) -> Result<Snapshot, StoreError> {
        let snapshot = self.store.get(path).await?;
        self.observe(&snapshot);
        Ok(snapshot)
    }

    pub async fn get_all(&mut self, paths: &[String]) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.store.get_all(paths).await?;
        for snapshot in &snapshots {
            self.observe(snapshot);
        }
        Ok(snapshots)
    }

    /// Range query whose results become preconditions. Documents inserted
    /// into the range concurrently are not guarded.
    pub async fn query(&mut self, query: &RangeQuery) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.store.query(query).await?;
        for snapshot in &snapshots {
            self.observe(snapshot);
        }
        Ok(snapshots)
    }

    pub async fn list(&mut self, collection_path: &str) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.store.list(collection_path).await?;
        for snapshot in &snapshots {
            self.observe(snapshot);
        }
        Ok(snapshots)
    }

    fn observe(&mut self, snapshot: &Snapshot) {
        self.commit
            .preconditions
            .entry(snapshot.path.clone())
            .or_insert(snapshot.version);
    }

    pub fn set(&mut self, path: impl Into<String>, fields: Fields) -> &mut Self {
        self.commit.writes.push(Write::Set {
            path: path.into(),
            fields,
        });
        self
    }

    pub fn merge(&mut self, path: impl Into<String>, fields: Vec<(String, Value)>) -> &mut Self {
        self.commit.writes.push(Write::Merge {
            path: path.into(),
            fields,
        });
        self
    }

    pub fn array_union(
        &mut self,
        path: impl Into<String>,
        field: impl Into<String>,
        elements: Vec<Value>,
    ) -> &mut Self {
        self.commit.writes.push(Write::ArrayUnion {
            path: path.into(),
            field: field.into(),
            elements,
        });
        self
    }

    pub fn increment(
        &mut self,
        path: impl Into<String>,
        field: impl Into<String>,
        by: Number,
    ) -> &mut Self {
        self.commit.writes.push(Write::Increment {
            path: path.into(),
            field: field.into(),
            by,
        });
        self
    }

    pub fn delete(&mut self, path: impl Into<String>) -> &mut Self {
        self.commit.writes.push(Write::Delete { path: path.into() });
        self
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        if self.commit.writes.is_empty() {
            return Ok(());
        }
        self.store.commit(self.commit).await
    }
}
