//! In-memory [`DocumentStore`].
//!
//! Documents are kept in one ordered map keyed by full path, so collection
//! group range queries are a single ordered scan. Commits are serialized
//! under a lock and validated against the versions each transaction read.

use crate::sharding::{collection_id, dirname};
use crate::store::{ChangeEvent, ChangeKind, Commit, DocumentStore, RangeQuery, Snapshot, StoreError, Write};
use crate::value::{get_field, set_field, Fields, Number, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::broadcast;
use tracing::trace;

const CHANGE_FEED_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct StoredDoc {
    fields: Fields,
    version: u64,
    update_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    sequence: u64,
    /// Commits writing under any of these prefixes fail.
    failing_prefixes: Vec<String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Make every commit that writes under `prefix` fail as unavailable.
    pub fn fail_commits_under(&self, prefix: impl Into<String>) {
        self.inner.lock().failing_prefixes.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failing_prefixes.clear();
    }

    /// Move a document's update time into the past.
    pub fn backdate(&self, path: &str, by: chrono::Duration) {
        if let Some(doc) = self.inner.lock().docs.get_mut(path) {
            doc.update_time -= by;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().docs.is_empty()
    }

    /// All document paths in order.
    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().docs.keys().cloned().collect()
    }

    fn snapshot_of(path: &str, doc: Option<&StoredDoc>) -> Snapshot {
        match doc {
            Some(doc) => Snapshot {
                path: path.to_string(),
                data: Some(doc.fields.clone()),
                version: doc.version,
                update_time: Some(doc.update_time),
            },
            None => Snapshot::missing(path),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) || segments.len() % 2 != 0 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn apply_write(docs: &mut BTreeMap<String, StoredDoc>, write: Write, version: u64, now: DateTime<Utc>) {
    let fresh = || StoredDoc {
        fields: Fields::new(),
        version,
        update_time: now,
    };
    match write {
        Write::Set { path, fields } => {
            docs.insert(
                path,
                StoredDoc {
                    fields,
                    version,
                    update_time: now,
                },
            );
        }
        Write::Merge { path, fields } => {
            let doc = docs.entry(path).or_insert_with(fresh);
            for (field, value) in fields {
                set_field(&mut doc.fields, &field, value);
            }
            doc.version = version;
            doc.update_time = now;
        }
        Write::ArrayUnion {
            path,
            field,
            elements,
        } => {
            let doc = docs.entry(path).or_insert_with(fresh);
            let mut items = get_field(&doc.fields, &field)
                .and_then(Value::as_array)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            for element in elements {
                if !items.contains(&element) {
                    items.push(element);
                }
            }
            set_field(&mut doc.fields, &field, Value::Array(items));
            doc.version = version;
            doc.update_time = now;
        }
        Write::Increment { path, field, by } => {
            let doc = docs.entry(path).or_insert_with(fresh);
            let current = get_field(&doc.fields, &field)
                .and_then(Value::as_number)
                .unwrap_or(Number::Integer(0));
            set_field(&mut doc.fields, &field, Value::from(current + by));
            doc.version = version;
            doc.update_time = now;
        }
        Write::Delete { path } => {
            docs.remove(&path);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Snapshot, StoreError> {
        validate_path(path)?;
        let inner = self.inner.lock();
        Ok(Self::snapshot_of(path, inner.docs.get(path)))
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock();
        let lower = if query.start.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(query.start.as_str())
        };
        let snapshots = inner
            .docs
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(path, _)| query.end.is_empty() || path.as_str() < query.end.as_str())
            .filter(|(path, _)| collection_id(path) == query.collection_id)
            .take(query.limit)
            .map(|(path, doc)| Self::snapshot_of(path, Some(doc)))
            .collect();
        Ok(snapshots)
    }

    async fn list(&self, collection_path: &str) -> Result<Vec<Snapshot>, StoreError> {
        let prefix = format!("{collection_path}/");
        let inner = self.inner.lock();
        let snapshots = inner
            .docs
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| dirname(path) == collection_path)
            .map(|(path, doc)| Self::snapshot_of(path, Some(doc)))
            .collect();
        Ok(snapshots)
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        for write in &commit.writes {
            validate_path(write.path())?;
        }

        let events = {
            let mut inner = self.inner.lock();
            if let Some(write) = commit.writes.iter().find(|write| {
                inner
                    .failing_prefixes
                    .iter()
                    .any(|prefix| write.path().starts_with(prefix.as_str()))
            }) {
                return Err(StoreError::Unavailable(format!(
                    "injected failure writing {}",
                    write.path()
                )));
            }

            for (path, version) in &commit.preconditions {
                let current = inner.docs.get(path).map(|doc| doc.version).unwrap_or(0);
                if current != *version {
                    return Err(StoreError::Aborted { path: path.clone() });
                }
            }

            let mut existed: BTreeMap<String, bool> = BTreeMap::new();
            for write in &commit.writes {
                let path = write.path();
                if !existed.contains_key(path) {
                    let exists = inner.docs.contains_key(path);
                    existed.insert(path.to_string(), exists);
                }
            }

            inner.sequence += 1;
            let version = inner.sequence;
            let now = Utc::now();
            for write in commit.writes {
                apply_write(&mut inner.docs, write, version, now);
            }

            existed
                .into_iter()
                .filter_map(|(path, before)| {
                    let after = inner.docs.contains_key(&path);
                    let kind = match (before, after) {
                        (false, true) => ChangeKind::Created,
                        (true, true) => ChangeKind::Updated,
                        (true, false) => ChangeKind::Deleted,
                        (false, false) => return None,
                    };
                    Some(ChangeEvent { path, kind })
                })
                .collect::<Vec<_>>()
        };

        for event in events {
            trace!(path = %event.path, kind = ?event.kind, "document changed");
            // No subscribers is fine.
            let _ = self.changes.send(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
