use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::recorder::SettlementRecorder;
use crate::error::StoreResult;
use crate::payout::ClaimManager;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Payouts whose bookkeeping was finished from an existing audit record
    pub finished: usize,
    /// Pending payouts with no audit record; left for an operator
    pub unresolved: Vec<String>,
}

/// Finishes bookkeeping for claims that were broadcast but never flipped to a hash.
///
/// Never dispatches: a `"pending"` payout without an audit record may still have an
/// on-chain transfer, so it is only reported.
pub struct StaleClaimRecovery {
    claims: Arc<ClaimManager>,
    recorder: Arc<SettlementRecorder>,
    stale_after: Duration,
}

impl StaleClaimRecovery {
    pub fn new(claims: Arc<ClaimManager>, recorder: Arc<SettlementRecorder>, stale_after: Duration) -> Self {
        Self {
            claims,
            recorder,
            stale_after,
        }
    }

    pub async fn run(&self, now_ms: i64) -> StoreResult<RecoveryReport> {
        let cutoff = now_ms - self.stale_after.as_millis() as i64;
        let mut report = RecoveryReport::default();

        // Group by the transaction that settled them so each hash is flipped once.
        let mut by_hash: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.claims.fetch_stale_pending(cutoff, cursor.as_deref()).await?;
            for payout in page.records.into_iter().filter(|p| p.is_pending()) {
                match self.recorder.audit().find_by_payout(&payout.id).await? {
                    Some(audit) => by_hash.entry(audit.tx_hash).or_default().push(payout.id),
                    None => {
                        warn!(
                            "⚠️ Payout {} has been pending since {:?} with no audit record; needs review",
                            payout.id, payout.claimed_ts
                        );
                        report.unresolved.push(payout.id);
                    }
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        for (tx_hash, payout_ids) in by_hash {
            self.recorder.mark_settled(&payout_ids, &tx_hash).await?;
            info!("🩹 Finished bookkeeping for {} payouts of {}", payout_ids.len(), tx_hash);
            report.finished += payout_ids.len();
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::recording::{publisher, RecordingSink};
    use crate::settlement::audit::{tests::audit_record, AuditLog};
    use crate::store::{DocKey, DocumentStore, MemoryStore};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_recovery_finishes_audited_and_reports_the_rest() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let stale_ts = NOW - 3_600_000;
        for (id, claimed_ts) in [("p1", stale_ts), ("p2", stale_ts), ("p3", stale_ts), ("p4", NOW)] {
            store
                .set(
                    &DocKey::new("payouts", id),
                    json!({ "to": "0xAAA", "txHash": "pending", "claimedTs": claimed_ts }),
                )
                .await
                .unwrap();
        }

        let audit = Arc::new(AuditLog::new(store.clone(), "tx"));
        audit.create(&audit_record("0xabc", &["p1", "p2"])).await.unwrap();

        let recorder = Arc::new(SettlementRecorder::new(
            store.clone(),
            audit,
            publisher(Arc::new(RecordingSink::new())),
            "payouts",
            "users",
            5,
        ));
        let claims = Arc::new(ClaimManager::new(store.clone(), "payouts", 250, None, 5));
        let recovery = StaleClaimRecovery::new(claims, recorder, Duration::from_secs(600));

        let report = recovery.run(NOW).await.unwrap();

        assert_eq!(report.finished, 2);
        assert_eq!(report.unresolved, vec!["p3"]);
        for (id, expected) in [("p1", "0xabc"), ("p2", "0xabc"), ("p3", "pending"), ("p4", "pending")] {
            let body = store.get(&DocKey::new("payouts", id)).await.unwrap().unwrap().body;
            assert_eq!(body["txHash"], expected, "payout {}", id);
        }

        // Second run has nothing left to finish.
        let again = recovery.run(NOW).await.unwrap();
        assert_eq!(again.finished, 0);
        assert_eq!(again.unresolved, vec!["p3"]);
    }

    #[tokio::test]
    async fn test_unresolved_claims_do_not_hide_audited_ones() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        for id in ["a1", "a2", "p1"] {
            store
                .set(
                    &DocKey::new("payouts", id),
                    json!({ "to": "0xAAA", "txHash": "pending", "claimedTs": NOW - 3_600_000 }),
                )
                .await
                .unwrap();
        }

        let audit = Arc::new(AuditLog::new(store.clone(), "tx"));
        audit.create(&audit_record("0xabc", &["p1"])).await.unwrap();
        let recorder = Arc::new(SettlementRecorder::new(
            store.clone(),
            audit,
            publisher(Arc::new(RecordingSink::new())),
            "payouts",
            "users",
            5,
        ));
        let claims = Arc::new(ClaimManager::new(store.clone(), "payouts", 1, None, 5));
        let recovery = StaleClaimRecovery::new(claims, recorder, Duration::from_secs(600));

        let report = recovery.run(NOW).await.unwrap();

        assert_eq!(report.finished, 1);
        assert_eq!(report.unresolved, vec!["a1", "a2"]);
        let body = store.get(&DocKey::new("payouts", "p1")).await.unwrap().unwrap().body;
        assert_eq!(body["txHash"], "0xabc");
    }
}
