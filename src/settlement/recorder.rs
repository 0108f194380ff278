use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::audit::{AuditLog, AuditRecord, STATUS_PENDING};
use crate::dispatch::DispatchReceipt;
use crate::error::{RecorderError, RecorderStep, StoreError, StoreResult};
use crate::events::{EventPublisher, SettlementEvent};
use crate::execution::Route;
use crate::payout::{RecipientBatch, PENDING};
use crate::store::{run_atomic, DocKey, DocumentStore};

/// Settlement Recorder - bookkeeping after a successful broadcast
///
/// Owns audit record creation and the final `"pending"` -> hash flip. The steps are
/// independent; each one runs even if an earlier one failed.
pub struct SettlementRecorder {
    store: Arc<dyn DocumentStore>,
    audit: Arc<AuditLog>,
    events: EventPublisher,
    payouts_collection: String,
    users_collection: String,
    atomic_attempts: u32,
}

impl SettlementRecorder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        audit: Arc<AuditLog>,
        events: EventPublisher,
        payouts_collection: impl Into<String>,
        users_collection: impl Into<String>,
        atomic_attempts: u32,
    ) -> Self {
        Self {
            store,
            audit,
            events,
            payouts_collection: payouts_collection.into(),
            users_collection: users_collection.into(),
            atomic_attempts,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    #[instrument(skip_all, fields(recipient = %batch.wallet, tx_hash = %receipt.tx_hash))]
    pub async fn record(
        &self,
        batch: &RecipientBatch,
        route: &Route,
        receipt: &DispatchReceipt,
    ) -> Result<(), RecorderError> {
        let backend = &route.backend;
        let mut failures = Vec::new();

        let height = match backend.current_height().await {
            Ok(height) => Some(height),
            Err(e) => {
                warn!("Could not read chain height for {}: {}", receipt.tx_hash, e);
                None
            }
        };

        let amount = match backend.from_base_units(batch.value) {
            Ok(display) => Some(display.to_string()),
            Err(e) => {
                warn!("Could not convert {} to display units: {}", batch.value, e);
                None
            }
        };

        let record = AuditRecord {
            kind: receipt.chain.audit_type().to_string(),
            chain: receipt.chain,
            tx_hash: receipt.tx_hash.clone(),
            from_wallet: receipt.sender.clone(),
            to_wallet: batch.wallet.clone(),
            to_id: batch.recipient_user_id.clone(),
            amount: amount.clone(),
            value: batch.value.to_string(),
            sequence: receipt.sequence,
            fee: receipt.fee.clone(),
            height,
            raw_signed_tx: receipt.raw_signed_tx.clone(),
            remarks: batch.memo(),
            payout_ids: batch.payout_ids.clone(),
            ts: Utc::now().timestamp_millis(),
            status: STATUS_PENDING.to_string(),
        };

        match self.audit.create(&record).await {
            Ok(()) => debug!("📝 Audit record written for {}", receipt.tx_hash),
            Err(StoreError::AlreadyExists(_)) => {
                if let Ok(Some(existing)) = self.audit.get(&receipt.tx_hash).await {
                    warn!(
                        "Audit record for {} already exists (payouts {:?}, sequence {})",
                        receipt.tx_hash, existing.payout_ids, existing.sequence
                    );
                }
                failures.push(RecorderStep::DuplicateAudit);
            }
            Err(e) => failures.push(RecorderStep::Audit(e)),
        }

        match self.mark_settled(&batch.payout_ids, &receipt.tx_hash).await {
            Ok(()) => {
                if let Some(user_id) = &batch.recipient_user_id {
                    self.mirror_to_user(user_id, &batch.payout_ids, &receipt.tx_hash).await;
                }
            }
            Err(e) => failures.push(RecorderStep::MarkSettled(e)),
        }

        self.events
            .emit(&SettlementEvent {
                log_type: receipt.chain.settlement_log_type(),
                from_wallet: receipt.sender.clone(),
                to_wallet: batch.wallet.clone(),
                to_id: batch.recipient_user_id.clone(),
                amount: amount.unwrap_or_else(|| batch.value.to_string()),
                tx_hash: receipt.tx_hash.clone(),
                tx_sequence: receipt.sequence,
                current_block: height,
                payout_ids: batch.payout_ids.clone(),
            })
            .await;

        if failures.is_empty() {
            info!(
                "💰 Settled {} payouts for {} in {} (sequence {}{})",
                batch.payout_ids.len(),
                batch.wallet,
                receipt.tx_hash,
                receipt.sequence,
                if receipt.reconciled { ", reconciled" } else { "" }
            );
            Ok(())
        } else {
            Err(RecorderError::Incomplete {
                tx_hash: receipt.tx_hash.clone(),
                failures,
            })
        }
    }

    /// Flip every record in `payout_ids` from `"pending"` to `tx_hash`, all or nothing.
    ///
    /// Records already carrying `tx_hash` are left as they are. Any other state fails
    /// with [`StoreError::StateMismatch`] and nothing is written.
    pub async fn mark_settled(&self, payout_ids: &[String], tx_hash: &str) -> StoreResult<()> {
        let keys: Vec<DocKey> = payout_ids
            .iter()
            .map(|id| DocKey::new(&self.payouts_collection, id))
            .collect();

        run_atomic(&self.store, self.atomic_attempts, |tx| {
            let keys = keys.clone();
            async move {
                let settled_ts = Utc::now().timestamp_millis();
                for key in keys {
                    let body = tx.get(&key).await?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
                    match body.get("txHash").and_then(Value::as_str) {
                        Some(PENDING) => tx.update(key, settled_fields(tx_hash, settled_ts)),
                        Some(current) if current == tx_hash => {}
                        other => {
                            return Err(StoreError::StateMismatch {
                                message: format!("expected txHash \"{}\", found {:?}", PENDING, other),
                                key,
                            })
                        }
                    }
                }
                Ok(())
            }
        })
        .await
    }

    /// Best-effort copy of the hash into the user's own payout documents.
    async fn mirror_to_user(&self, user_id: &str, payout_ids: &[String], tx_hash: &str) {
        let collection = format!("{}/{}/payouts", self.users_collection, user_id);
        let settled_ts = Utc::now().timestamp_millis();

        for id in payout_ids {
            let key = DocKey::new(&collection, id);
            match self.store.update(&key, settled_fields(tx_hash, settled_ts)).await {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => debug!("No user mirror at {}", key),
                Err(e) => warn!("User mirror update for {} failed: {}", key, e),
            }
        }
    }
}

fn settled_fields(tx_hash: &str, settled_ts: i64) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("txHash".to_string(), Value::from(tx_hash));
    fields.insert("settledTs".to_string(), Value::from(settled_ts));
    fields
}
