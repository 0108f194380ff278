//! Per-sender sequence (nonce) counter.
//!
//! The counter document holds the next sequence to hand out. It is only ever changed
//! by [`SequenceAllocator::allocate`] and [`SequenceAllocator::reconcile`], both of
//! which run inside an optimistic store transaction.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::error::{StoreError, StoreResult};
use crate::store::{run_atomic, DocKey, DocumentStore};

pub struct SequenceAllocator {
    store: Arc<dyn DocumentStore>,
    collection: String,
    max_attempts: u32,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            store,
            collection: collection.into(),
            max_attempts,
        }
    }

    fn key(&self, sender: &str) -> DocKey {
        DocKey::new(&self.collection, format!("sender:{}", sender))
    }

    /// Current counter value without reserving anything.
    pub async fn peek(&self, sender: &str) -> StoreResult<u64> {
        let key = self.key(sender);
        let body = self.store.get(&key).await?.map(|s| s.body);
        counter_value(&key, body.as_ref())
    }

    /// Reserve the next sequence for `sender`. The counter starts at 0 on first use.
    #[instrument(skip(self))]
    pub async fn allocate(&self, sender: &str) -> StoreResult<u64> {
        let key = self.key(sender);

        let sequence = run_atomic(&self.store, self.max_attempts, |tx| {
            let key = key.clone();
            async move {
                let body = tx.get(&key).await?;
                let current = counter_value(&key, body.as_ref())?;
                tx.set(key, json!({ "value": current + 1 }));
                Ok::<_, StoreError>(current)
            }
        })
        .await?;

        debug!("🔢 Allocated sequence {} for {}", sequence, sender);
        Ok(sequence)
    }

    /// Raise the counter to at least `observed + 1`. Never lowers it.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, sender: &str, observed: u64) -> StoreResult<u64> {
        let key = self.key(sender);
        let target = observed + 1;

        let (before, after) = run_atomic(&self.store, self.max_attempts, |tx| {
            let key = key.clone();
            async move {
                let body = tx.get(&key).await?;
                let current = counter_value(&key, body.as_ref())?;
                if target > current {
                    tx.set(key, json!({ "value": target }));
                    Ok::<_, StoreError>((current, target))
                } else {
                    Ok((current, current))
                }
            }
        })
        .await?;

        if after != before {
            info!("🔧 Sequence counter for {} reconciled {} -> {}", sender, before, after);
        }
        Ok(after)
    }
}

fn counter_value(key: &DocKey, body: Option<&Value>) -> StoreResult<u64> {
    let Some(body) = body else {
        return Ok(0);
    };

    body.get("value")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Malformed {
            key: key.clone(),
            message: "counter `value` is not a non-negative integer".to_string(),
        })
}
