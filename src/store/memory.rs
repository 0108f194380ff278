use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocKey, Document, DocumentStore, Query, ReadStamp, Snapshot, WriteOp};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    body: Document,
}

/// In-process document store with the same optimistic semantics as [`super::PgStore`].
///
/// Used for local dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<DocKey, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply `ops` against `docs`; nothing is applied if any op fails.
    fn apply(docs: &mut BTreeMap<DocKey, Entry>, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut staged = docs.clone();

        for op in ops {
            match op {
                WriteOp::Set { key, body } => {
                    let version = staged.get(&key).map_or(1, |e| e.version + 1);
                    staged.insert(key, Entry { version, body });
                }
                WriteOp::Create { key, body } => {
                    if staged.contains_key(&key) {
                        return Err(StoreError::AlreadyExists(key));
                    }
                    staged.insert(key, Entry { version: 1, body });
                }
                WriteOp::Update { key, fields } => {
                    let entry = staged
                        .get_mut(&key)
                        .ok_or_else(|| StoreError::NotFound(key.clone()))?;
                    let object = entry.body.as_object_mut().ok_or_else(|| StoreError::Malformed {
                        key: key.clone(),
                        message: "document body is not an object".to_string(),
                    })?;
                    object.extend(fields);
                    entry.version += 1;
                }
            }
        }

        *docs = staged;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Snapshot>> {
        // Give concurrent transactions a chance to interleave between read and commit.
        tokio::task::yield_now().await;

        let docs = self.docs.lock();
        Ok(docs.get(key).map(|e| Snapshot {
            key: key.clone(),
            version: e.version,
            body: e.body.clone(),
        }))
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Snapshot>> {
        let docs = self.docs.lock();
        Ok(docs
            .iter()
            .filter(|(key, entry)| key.collection == query.collection && query.matches(&key.id, &entry.body))
            .take(query.limit)
            .map(|(key, entry)| Snapshot {
                key: key.clone(),
                version: entry.version,
                body: entry.body.clone(),
            })
            .collect())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut docs = self.docs.lock();
        Self::apply(&mut docs, ops)
    }

    async fn commit(&self, reads: Vec<ReadStamp>, writes: Vec<WriteOp>) -> StoreResult<()> {
        let mut docs = self.docs.lock();

        for read in &reads {
            let current = docs.get(&read.key).map(|e| e.version);
            if current != read.version {
                return Err(StoreError::Conflict);
            }
        }

        Self::apply(&mut docs, writes)
    }
}
