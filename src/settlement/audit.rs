use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::execution::{ChainKind, Fee};
use crate::store::{DocKey, DocumentStore, FilterOp, Query, Snapshot};

pub const STATUS_PENDING: &str = "pending";

/// One settled dispatch, keyed by transaction hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// `payout` or `cosmosPayout`
    #[serde(rename = "type")]
    pub kind: String,
    pub chain: ChainKind,
    pub tx_hash: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub to_id: Option<String>,
    /// Display units; absent if the conversion failed
    pub amount: Option<String>,
    /// Base units
    pub value: String,
    pub sequence: u64,
    pub fee: Fee,
    pub height: Option<u64>,
    pub raw_signed_tx: String,
    pub remarks: Option<String>,
    pub payout_ids: Vec<String>,
    pub ts: i64,
    pub status: String,
}

/// Create-only log of settled transactions
pub struct AuditLog {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl AuditLog {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    fn key(&self, tx_hash: &str) -> DocKey {
        DocKey::new(&self.collection, tx_hash)
    }

    /// Fails with [`StoreError::AlreadyExists`] if the hash is already logged.
    pub async fn create(&self, record: &AuditRecord) -> StoreResult<()> {
        let body = serde_json::to_value(record)?;
        self.store.create(&self.key(&record.tx_hash), body).await
    }

    pub async fn get(&self, tx_hash: &str) -> StoreResult<Option<AuditRecord>> {
        self.store
            .get(&self.key(tx_hash))
            .await?
            .map(|s| parse(&s))
            .transpose()
    }

    /// The audit record whose batch included `payout_id`, if any.
    pub async fn find_by_payout(&self, payout_id: &str) -> StoreResult<Option<AuditRecord>> {
        let query = Query::collection(&self.collection)
            .filter("payoutIds", FilterOp::Contains, payout_id)
            .limit(1);

        self.store
            .query(&query)
            .await?
            .first()
            .map(parse)
            .transpose()
    }
}

fn parse(snapshot: &Snapshot) -> StoreResult<AuditRecord> {
    serde_json::from_value(snapshot.body.clone()).map_err(|e| StoreError::Malformed {
        key: snapshot.key.clone(),
        message: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    pub(crate) fn audit_record(tx_hash: &str, payout_ids: &[&str]) -> AuditRecord {
        AuditRecord {
            kind: ChainKind::Evm.audit_type().to_string(),
            chain: ChainKind::Evm,
            tx_hash: tx_hash.to_string(),
            from_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            to_wallet: "0xAAA".to_string(),
            to_id: Some("alice".to_string()),
            amount: Some("3".to_string()),
            value: "3000000000000000000".to_string(),
            sequence: 7,
            fee: Fee {
                gas_limit: 21_000,
                gas_price: dec!(1000000000),
            },
            height: Some(1_000),
            raw_signed_tx: "0xf86b".to_string(),
            remarks: None,
            payout_ids: payout_ids.iter().map(|s| s.to_string()).collect(),
            ts: 1_700_000_000_000,
            status: STATUS_PENDING.to_string(),
        }
    }

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemoryStore::new()), "tx")
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_rejected_not_overwritten() {
        let log = log();
        let first = audit_record("0xabc", &["p1"]);
        log.create(&first).await.unwrap();

        let mut second = audit_record("0xabc", &["p9"]);
        second.sequence = 99;
        let result = log.create(&second).await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(log.get("0xabc").await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_body_uses_wire_field_names() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let log = AuditLog::new(store.clone(), "tx");
        log.create(&audit_record("0xabc", &["p1"])).await.unwrap();

        let body = store.get(&DocKey::new("tx", "0xabc")).await.unwrap().unwrap().body;
        assert_eq!(body["type"], "payout");
        assert_eq!(body["fromWallet"], "0x1111111111111111111111111111111111111111");
        assert_eq!(body["rawSignedTx"], "0xf86b");
        assert_eq!(body["fee"]["gasPrice"], "1000000000");
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn test_find_by_payout() {
        let log = log();
        log.create(&audit_record("0xabc", &["p1", "p2"])).await.unwrap();
        log.create(&audit_record("0xdef", &["p3"])).await.unwrap();

        assert_eq!(log.find_by_payout("p2").await.unwrap().unwrap().tx_hash, "0xabc");
        assert!(log.find_by_payout("p4").await.unwrap().is_none());
    }
}
