//! Document store capability.
//!
//! Payout records, audit records, sequence counters and the fee hint all live in a
//! key-document store. Shared mutable documents are only ever changed through
//! [`run_atomic`], which gives read-then-conditional-write semantics on top of the
//! store's optimistic [`DocumentStore::commit`].

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type Document = Value;

/// Address of a single document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read from the store, with the version used for optimistic commits
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: DocKey,
    pub version: u64,
    pub body: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equality. Comparing against `null` also matches an absent field.
    Eq,
    /// Negated [`FilterOp::Eq`]; against `null` it requires a present, non-null field.
    Ne,
    Lte,
    /// The field is an array containing the value.
    Contains,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub limit: usize,
    /// Keyset cursor: only ids strictly greater than this one.
    pub start_after: Option<String>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            limit: usize::MAX,
            start_after: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, id: Option<impl Into<String>>) -> Self {
        self.start_after = id.map(Into::into);
        self
    }

    /// Evaluate the cursor and the filters against a document.
    pub fn matches(&self, id: &str, body: &Document) -> bool {
        if self.start_after.as_deref().map_or(false, |cursor| id <= cursor) {
            return false;
        }

        self.filters.iter().all(|f| {
            let field = body.get(&f.field);
            match f.op {
                FilterOp::Eq => equals(field, &f.value),
                FilterOp::Ne => !equals(field, &f.value),
                FilterOp::Lte => compare(field, &f.value).map_or(false, |o| o.is_le()),
                FilterOp::Contains => field
                    .and_then(Value::as_array)
                    .map_or(false, |items| items.contains(&f.value)),
            }
        })
    }
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match (field, expected) {
        (None, Value::Null) => true,
        (Some(v), expected) => v == expected,
        (None, _) => false,
    }
}

fn compare(field: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    match (field?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A single write, used both in batches and in atomic commits
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create-or-replace the whole document.
    Set { key: DocKey, body: Document },
    /// Merge top-level fields into an existing document. Fails if absent.
    Update { key: DocKey, fields: Map<String, Value> },
    /// Create the document. Fails if it exists.
    Create { key: DocKey, body: Document },
}

impl WriteOp {
    pub fn key(&self) -> &DocKey {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Update { key, .. } | WriteOp::Create { key, .. } => key,
        }
    }
}

/// Version observed for a document read inside a transaction (`None` = absent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStamp {
    pub key: DocKey,
    pub version: Option<u64>,
}

/// Transactional key-document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Snapshot>>;

    /// Matching documents ordered by id, at most `query.limit` of them.
    async fn query(&self, query: &Query) -> StoreResult<Vec<Snapshot>>;

    /// Applies every op or none of them. Not guarded by read versions.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Applies `writes` only if every document in `reads` still carries the recorded
    /// version; otherwise fails with [`StoreError::Conflict`] and writes nothing.
    async fn commit(&self, reads: Vec<ReadStamp>, writes: Vec<WriteOp>) -> StoreResult<()>;

    /// Create-only write. Fails with [`StoreError::AlreadyExists`] instead of overwriting.
    async fn create(&self, key: &DocKey, body: Document) -> StoreResult<()> {
        self.batch_write(vec![WriteOp::Create {
            key: key.clone(),
            body,
        }])
        .await
    }

    async fn set(&self, key: &DocKey, body: Document) -> StoreResult<()> {
        self.batch_write(vec![WriteOp::Set {
            key: key.clone(),
            body,
        }])
        .await
    }

    async fn update(&self, key: &DocKey, fields: Map<String, Value>) -> StoreResult<()> {
        self.batch_write(vec![WriteOp::Update {
            key: key.clone(),
            fields,
        }])
        .await
    }
}

#[derive(Debug, Default)]
struct TxState {
    reads: BTreeMap<DocKey, Option<u64>>,
    writes: Vec<WriteOp>,
}

/// Read set and buffered writes of one optimistic transaction attempt
#[derive(Clone)]
pub struct Transaction {
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<TxState>>,
}

impl Transaction {
    fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    /// Read a document and record its version in the read set.
    pub async fn get(&self, key: &DocKey) -> StoreResult<Option<Document>> {
        let snapshot = self.store.get(key).await?;
        let mut state = self.state.lock();
        // The first observed version is the one the commit is checked against.
        state
            .reads
            .entry(key.clone())
            .or_insert_with(|| snapshot.as_ref().map(|s| s.version));
        Ok(snapshot.map(|s| s.body))
    }

    pub fn set(&self, key: DocKey, body: Document) {
        self.state.lock().writes.push(WriteOp::Set { key, body });
    }

    pub fn update(&self, key: DocKey, fields: Map<String, Value>) {
        self.state.lock().writes.push(WriteOp::Update { key, fields });
    }

    fn take(&self) -> (Vec<ReadStamp>, Vec<WriteOp>) {
        let state = std::mem::take(&mut *self.state.lock());
        let reads = state
            .reads
            .into_iter()
            .map(|(key, version)| ReadStamp { key, version })
            .collect();
        (reads, state.writes)
    }
}

/// Upper bound of the random pause between conflicting attempts.
const CONFLICT_JITTER_MS: u64 = 25;

/// Run `f` as an optimistic read-modify-write transaction.
///
/// `f` is invoked with a fresh [`Transaction`] per attempt; if it returns an error the
/// attempt is abandoned without committing and the error is returned as-is. Commit
/// conflicts are retried up to `max_attempts` times.
pub async fn run_atomic<T, E, F, Fut>(
    store: &Arc<dyn DocumentStore>,
    max_attempts: u32,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let tx = Transaction::new(store.clone());
        let value = f(tx.clone()).await?;
        let (reads, writes) = tx.take();

        match store.commit(reads, writes).await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict) => {
                debug!("Atomic transaction conflicted (attempt {}/{})", attempt, max_attempts);
                let jitter = rand::rng().random_range(0..=CONFLICT_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::ContentionExhausted {
        attempts: max_attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_query_matches_null_and_absent() {
        let query = Query::collection("payouts").filter("txHash", FilterOp::Eq, Value::Null);

        assert!(query.matches("p1", &json!({ "to": "0xAAA" })));
        assert!(query.matches("p1", &json!({ "txHash": null })));
        assert!(!query.matches("p1", &json!({ "txHash": "pending" })));
    }

    #[test]
    fn test_query_not_null_and_cursor() {
        let query = Query::collection("payouts")
            .filter("to", FilterOp::Ne, Value::Null)
            .after(Some("p2"));

        assert!(query.matches("p3", &json!({ "to": "0xAAA" })));
        assert!(!query.matches("p3", &json!({ "to": null })));
        assert!(!query.matches("p3", &json!({ "value": "1" })));
        assert!(!query.matches("p2", &json!({ "to": "0xAAA" })));
        assert!(!query.matches("p1", &json!({ "to": "0xAAA" })));
    }

    #[test]
    fn test_query_range_and_contains() {
        let query = Query::collection("payouts")
            .filter("effectiveTs", FilterOp::Lte, 1_000)
            .filter("payoutIds", FilterOp::Contains, "p1");

        assert!(query.matches("t1", &json!({ "effectiveTs": 1_000, "payoutIds": ["p0", "p1"] })));
        assert!(!query.matches("t1", &json!({ "effectiveTs": 1_001, "payoutIds": ["p1"] })));
        assert!(!query.matches("t1", &json!({ "effectiveTs": 10, "payoutIds": ["p2"] })));
        assert!(!query.matches("t1", &json!({ "payoutIds": ["p1"] })));
    }

    #[tokio::test]
    async fn test_run_atomic_retries_after_conflict() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let key = DocKey::new("counters", "c");
        store.set(&key, json!({ "value": 1 })).await.unwrap();

        let calls = AtomicU32::new(0);
        let result: Result<i64, StoreError> = run_atomic(&store, 3, |tx| {
            let key = key.clone();
            let store = store.clone();
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let current = tx.get(&key).await?.unwrap()["value"].as_i64().unwrap();
                if call == 0 {
                    // Someone else writes between our read and our commit.
                    store.set(&key, json!({ "value": current + 10 })).await?;
                }
                tx.set(key, json!({ "value": current + 1 }));
                Ok(current)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.body["value"], 12);
    }

    #[tokio::test]
    async fn test_run_atomic_gives_up() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let key = DocKey::new("counters", "c");
        store.set(&key, json!({ "value": 0 })).await.unwrap();

        let result: Result<(), StoreError> = run_atomic(&store, 2, |tx| {
            let key = key.clone();
            let store = store.clone();
            async move {
                tx.get(&key).await?;
                store.set(&key, json!({ "value": 99 })).await?;
                tx.set(key, json!({ "value": 1 }));
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::ContentionExhausted { attempts: 2 })));
    }

    #[tokio::test]
    async fn test_run_atomic_application_error_aborts() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let key = DocKey::new("counters", "c");

        let result: Result<(), StoreError> = run_atomic(&store, 3, |tx| {
            let key = key.clone();
            async move {
                tx.set(key.clone(), json!({ "value": 1 }));
                Err(StoreError::NotFound(key))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
