//! Fee hint: a background watch on the externally maintained gas price.
//!
//! The rest of the worker only sees [`FeeHint::current`]; subscription failures and
//! resubscription are handled inside [`FeeWatcher`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{DocKey, DocumentStore};

/// Latest known fee hint, shared by value
#[derive(Clone)]
pub struct FeeHint {
    rx: watch::Receiver<Option<Decimal>>,
}

impl FeeHint {
    pub fn current(&self) -> Option<Decimal> {
        *self.rx.borrow()
    }
}

/// Never trust an external fee beyond what the network currently asks, and never go
/// below the configured floor on the network side.
pub fn clamp_gas_price(
    hint: Option<Decimal>,
    network: Decimal,
    floor: Decimal,
    fallback: Decimal,
) -> Decimal {
    let network = network.max(floor);
    hint.unwrap_or(fallback).min(network)
}

/// Stream of fee updates. An `Err` item ends the subscription.
#[async_trait]
pub trait FeeSource: Send + Sync {
    async fn subscribe(&self) -> StoreResult<BoxStream<'static, StoreResult<Decimal>>>;
}

/// Polls the fee document (`{ "value": <number|string> }`) on a fixed interval
pub struct DocumentFeeSource {
    store: Arc<dyn DocumentStore>,
    key: DocKey,
    refresh: Duration,
}

impl DocumentFeeSource {
    pub fn new(store: Arc<dyn DocumentStore>, key: DocKey, refresh: Duration) -> Self {
        Self { store, key, refresh }
    }

    async fn read(store: Arc<dyn DocumentStore>, key: DocKey) -> StoreResult<Option<Decimal>> {
        let Some(snapshot) = store.get(&key).await? else {
            return Ok(None);
        };

        let parsed = match snapshot.body.get("value") {
            Some(Value::String(s)) => Decimal::from_str(s).ok(),
            Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
            _ => None,
        };

        parsed.map(Some).ok_or_else(|| StoreError::Malformed {
            key,
            message: "fee hint `value` is not a decimal".to_string(),
        })
    }
}

#[async_trait]
impl FeeSource for DocumentFeeSource {
    async fn subscribe(&self) -> StoreResult<BoxStream<'static, StoreResult<Decimal>>> {
        let store = self.store.clone();
        let key = self.key.clone();

        let stream = IntervalStream::new(tokio::time::interval(self.refresh))
            .then(move |_| Self::read(store.clone(), key.clone()))
            .filter_map(|item| async move { item.transpose() })
            .boxed();

        Ok(stream)
    }
}

pub struct FeeWatcher;

impl FeeWatcher {
    /// Start watching `source`; returns the shared hint and the supervisor task.
    pub fn spawn(
        source: Arc<dyn FeeSource>,
        initial: Option<Decimal>,
        resubscribe_interval: Duration,
    ) -> (FeeHint, JoinHandle<()>) {
        let (tx, rx) = watch::channel(initial);
        let handle = tokio::spawn(Self::supervise(source, tx, resubscribe_interval));
        (FeeHint { rx }, handle)
    }

    async fn supervise(
        source: Arc<dyn FeeSource>,
        tx: watch::Sender<Option<Decimal>>,
        resubscribe_interval: Duration,
    ) {
        loop {
            match source.subscribe().await {
                Ok(mut updates) => {
                    while let Some(update) = updates.next().await {
                        match update {
                            Ok(value) => {
                                debug!("⛽ Fee hint updated: {}", value);
                                if tx.send(Some(value)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                error!("Fee hint watch failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!("Fee hint subscribe failed: {}", e),
            }

            if tx.is_closed() {
                return;
            }

            info!("Trying to restart fee hint watcher in {:?}", resubscribe_interval);
            tokio::time::sleep(resubscribe_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_clamp_gas_price() {
        // Hint below the network price is used as-is.
        assert_eq!(clamp_gas_price(Some(dec!(2)), dec!(5), dec!(1.5), dec!(9)), dec!(2));
        // Hint above the network price is cut down.
        assert_eq!(clamp_gas_price(Some(dec!(50)), dec!(5), dec!(1.5), dec!(9)), dec!(5));
        // Network below the floor is raised before clamping.
        assert_eq!(clamp_gas_price(Some(dec!(50)), dec!(1), dec!(1.5), dec!(9)), dec!(1.5));
        // No hint yet: fall back.
        assert_eq!(clamp_gas_price(None, dec!(20), dec!(1.5), dec!(9)), dec!(9));
    }

    /// Fails the first subscription, then yields one value and an error per subscription.
    struct FlakySource {
        subscriptions: Mutex<u32>,
    }

    #[async_trait]
    impl FeeSource for FlakySource {
        async fn subscribe(&self) -> StoreResult<BoxStream<'static, StoreResult<Decimal>>> {
            let n = {
                let mut subs = self.subscriptions.lock();
                *subs += 1;
                *subs
            };
            if n == 1 {
                return Err(StoreError::Conflict);
            }
            let items = vec![Ok(Decimal::from(n * 100)), Err(StoreError::Conflict)];
            Ok(futures::stream::iter(items).boxed())
        }
    }

    #[tokio::test]
    async fn test_watcher_resubscribes_after_failure() {
        let source = Arc::new(FlakySource {
            subscriptions: Mutex::new(0),
        });
        let (hint, handle) = FeeWatcher::spawn(source.clone(), Some(dec!(1)), Duration::from_millis(5));

        let mut seen_later_value = false;
        for _ in 0..200 {
            if hint.current().map_or(false, |v| v >= dec!(300)) {
                seen_later_value = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(seen_later_value, "watcher should keep resubscribing");
        assert!(*source.subscriptions.lock() >= 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_document_source_reads_value() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let key = DocKey::new("config", "gasPrice");
        store.set(&key, json!({ "value": "2000000000" })).await.unwrap();

        let source = DocumentFeeSource::new(store, key, Duration::from_millis(1));
        let mut updates = source.subscribe().await.unwrap();

        assert_eq!(updates.next().await.unwrap().unwrap(), dec!(2000000000));
    }

    #[tokio::test]
    async fn test_document_source_rejects_malformed_value() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let key = DocKey::new("config", "gasPrice");
        store.set(&key, json!({ "value": "cheap" })).await.unwrap();

        let source = DocumentFeeSource::new(store, key, Duration::from_millis(1));
        let mut updates = source.subscribe().await.unwrap();

        assert!(updates.next().await.unwrap().is_err());
    }
}
