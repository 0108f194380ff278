use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::models::{DataAnomaly, PayoutRecord, RecipientBatch, PENDING};
use crate::error::{ClaimError, StoreError, StoreResult};
use crate::store::{run_atomic, DocKey, DocumentStore, FilterOp, Query};

/// Payout Claim Manager - selects due payouts and claims them per recipient
///
/// The claim transaction is the only place a record moves off `txHash == null`.
pub struct ClaimManager {
    store: Arc<dyn DocumentStore>,
    collection: String,
    page_size: usize,
    sender_account_id: Option<String>,
    atomic_attempts: u32,
}

impl ClaimManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        page_size: usize,
        sender_account_id: Option<String>,
        atomic_attempts: u32,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            page_size,
            sender_account_id,
            atomic_attempts,
        }
    }

    pub fn key(&self, payout_id: &str) -> DocKey {
        DocKey::new(&self.collection, payout_id)
    }

    /// One page of unclaimed payouts with a linked wallet whose effective time has passed.
    ///
    /// Pass the previous page's `next` to continue past records that were skipped.
    pub async fn fetch_due(&self, now_ms: i64, after: Option<&str>) -> StoreResult<PayoutPage> {
        let mut query = Query::collection(&self.collection)
            .filter("waitForClaim", FilterOp::Eq, false)
            .filter("effectiveTs", FilterOp::Lte, now_ms)
            .filter("txHash", FilterOp::Eq, Value::Null)
            .filter("to", FilterOp::Ne, Value::Null)
            .after(after)
            .limit(self.page_size);

        if let Some(sender) = &self.sender_account_id {
            query = query.filter("senderAccountId", FilterOp::Eq, sender.as_str());
        }

        self.page(&query).await
    }

    /// Claimed payouts whose claim is older than `cutoff_ms`.
    pub async fn fetch_stale_pending(&self, cutoff_ms: i64, after: Option<&str>) -> StoreResult<PayoutPage> {
        let query = Query::collection(&self.collection)
            .filter("txHash", FilterOp::Eq, PENDING)
            .filter("claimedTs", FilterOp::Lte, cutoff_ms)
            .after(after)
            .limit(self.page_size);

        self.page(&query).await
    }

    /// Matching records; malformed documents are skipped so one bad record cannot stall the page.
    async fn page(&self, query: &Query) -> StoreResult<PayoutPage> {
        let snapshots = self.store.query(query).await?;
        let next = match snapshots.last() {
            Some(last) if snapshots.len() >= query.limit => Some(last.key.id.clone()),
            _ => None,
        };

        let records = snapshots
            .iter()
            .filter_map(|snapshot| match PayoutRecord::from_snapshot(snapshot) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("⚠️ Skipping unreadable payout: {}", e);
                    None
                }
            })
            .collect();

        Ok(PayoutPage { records, next })
    }

    /// Group records by recipient wallet, in first-seen order.
    ///
    /// Records without a wallet are skipped quietly (the recipient has not linked one
    /// yet); records without a positive value are skipped as data anomalies.
    ///
    /// A recipient whose total would overflow the decimal range is dropped entirely.
    pub fn aggregate(records: Vec<PayoutRecord>) -> Vec<RecipientBatch> {
        let mut batches: Vec<RecipientBatch> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut overflowed: HashSet<String> = HashSet::new();

        for record in records {
            if record.is_claimed() {
                continue;
            }

            let Some(wallet) = record.to.clone().filter(|w| !w.is_empty()) else {
                debug!("Payout {} has no recipient wallet yet, skipping", record.id);
                continue;
            };

            let value = match record.decimal_value() {
                Ok(value) => value,
                Err(anomaly) => {
                    warn!("⚠️ Payout {} skipped: {}", record.id, anomaly);
                    continue;
                }
            };

            let slot = *index.entry(wallet.clone()).or_insert_with(|| {
                batches.push(RecipientBatch::new(wallet.clone(), record.to_id.clone()));
                batches.len() - 1
            });

            let batch = &mut batches[slot];
            batch.payout_ids.push(record.id);
            match batch.value.checked_add(value) {
                Some(total) => batch.value = total,
                None => {
                    if overflowed.insert(wallet.clone()) {
                        warn!("⚠️ Payouts for {} skipped: {}", wallet, DataAnomaly::SumOverflow);
                    }
                }
            }
            if let Some(remark) = record.remarks.filter(|r| !r.is_empty()) {
                batch.remarks.push(remark);
            }
        }

        batches.retain(|batch| !overflowed.contains(&batch.wallet));
        batches
    }

    /// Atomically move every record of `batch` from unclaimed to `"pending"`.
    ///
    /// Fails with [`ClaimError::Conflict`] and writes nothing if any record is
    /// already claimed.
    #[instrument(skip(self, batch), fields(recipient = %batch.wallet, records = batch.payout_ids.len()))]
    pub async fn claim(&self, batch: &RecipientBatch) -> Result<(), ClaimError> {
        let keys: Vec<DocKey> = batch.payout_ids.iter().map(|id| self.key(id)).collect();

        run_atomic(&self.store, self.atomic_attempts, |tx| {
            let keys = keys.clone();
            let recipient = batch.wallet.clone();
            async move {
                for key in &keys {
                    let body = tx
                        .get(key)
                        .await?
                        .ok_or_else(|| ClaimError::Missing(key.id.clone()))?;

                    let claimed = body.get("txHash").map_or(false, |h| !h.is_null());
                    if claimed {
                        return Err(ClaimError::Conflict {
                            recipient,
                            payout_id: key.id.clone(),
                        });
                    }
                }

                let claimed_ts = Utc::now().timestamp_millis();
                for key in keys {
                    let mut fields = Map::new();
                    fields.insert("txHash".to_string(), Value::from(PENDING));
                    fields.insert("claimedTs".to_string(), Value::from(claimed_ts));
                    tx.update(key, fields);
                }
                Ok(())
            }
        })
        .await?;

        info!("🔒 Claimed {} payouts for {}", batch.payout_ids.len(), batch.wallet);
        Ok(())
    }

    /// Hand a claimed batch back to selection after a dispatch that never reached the chain.
    ///
    /// Only records still marked `"pending"` are reverted; anything else is left alone.
    #[instrument(skip(self, batch), fields(recipient = %batch.wallet))]
    pub async fn release(&self, batch: &RecipientBatch) -> StoreResult<usize> {
        let keys: Vec<DocKey> = batch.payout_ids.iter().map(|id| self.key(id)).collect();

        let released = run_atomic(&self.store, self.atomic_attempts, |tx| {
            let keys = keys.clone();
            async move {
                let mut released = 0;
                for key in keys {
                    let pending = tx
                        .get(&key)
                        .await?
                        .map_or(false, |body| body.get("txHash").and_then(Value::as_str) == Some(PENDING));
                    if !pending {
                        continue;
                    }

                    let mut fields = Map::new();
                    fields.insert("txHash".to_string(), Value::Null);
                    fields.insert("claimedTs".to_string(), Value::Null);
                    tx.update(key, fields);
                    released += 1;
                }
                Ok::<_, StoreError>(released)
            }
        })
        .await?;

        info!("🔓 Released {} payouts for {}", released, batch.wallet);
        Ok(released)
    }
}

/// One page of a keyset scan over the payouts collection
#[derive(Debug, Default)]
pub struct PayoutPage {
    pub records: Vec<PayoutRecord>,
    /// Id to resume after; `None` once the scan reached the end.
    pub next: Option<String>,
}
