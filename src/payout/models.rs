use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::StoreError;
use crate::store::Snapshot;

/// Claim marker written while a transfer is in flight
pub const PENDING: &str = "pending";

/// A unit of owed value as stored in the payouts collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    /// Document id; not part of the body.
    #[serde(skip)]
    pub id: String,
    /// Recipient wallet. Unset until the user links one.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub to_id: Option<String>,
    /// Base units, as a decimal string or a JSON number.
    #[serde(default, alias = "amount")]
    pub value: Option<Value>,
    #[serde(default)]
    pub effective_ts: Option<i64>,
    #[serde(default)]
    pub wait_for_claim: bool,
    /// `None` = unclaimed, `"pending"` = in flight, anything else = settled.
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub sender_account_id: Option<String>,
    #[serde(default)]
    pub claimed_ts: Option<i64>,
}

/// Record-level data problems. The record is skipped, never summed as zero.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataAnomaly {
    #[error("payout has no value")]
    MissingValue,

    #[error("payout value {0:?} is not a decimal")]
    UnparseableValue(String),

    #[error("payout value {0} is not positive")]
    NonPositiveValue(Decimal),

    #[error("recipient total exceeds the decimal range")]
    SumOverflow,
}

impl PayoutRecord {
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, StoreError> {
        let mut record: PayoutRecord =
            serde_json::from_value(snapshot.body.clone()).map_err(|e| StoreError::Malformed {
                key: snapshot.key.clone(),
                message: e.to_string(),
            })?;
        record.id = snapshot.key.id.clone();
        Ok(record)
    }

    pub fn is_claimed(&self) -> bool {
        self.tx_hash.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.tx_hash.as_deref() == Some(PENDING)
    }

    /// Exact positive value in base units.
    pub fn decimal_value(&self) -> Result<Decimal, DataAnomaly> {
        let value = match &self.value {
            None | Some(Value::Null) => return Err(DataAnomaly::MissingValue),
            Some(Value::String(s)) => parse_decimal(s),
            Some(Value::Number(n)) => parse_decimal(&n.to_string()),
            Some(other) => Err(DataAnomaly::UnparseableValue(other.to_string())),
        }?;

        if value <= Decimal::ZERO {
            return Err(DataAnomaly::NonPositiveValue(value));
        }
        Ok(value)
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, DataAnomaly> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| DataAnomaly::UnparseableValue(raw.to_string()))
}

/// All due payouts for one recipient wallet, settled as a single transfer
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientBatch {
    pub wallet: String,
    pub recipient_user_id: Option<String>,
    /// Constituent record ids in selection order
    pub payout_ids: Vec<String>,
    /// Exact sum of the constituent values, base units
    pub value: Decimal,
    pub remarks: Vec<String>,
}

impl RecipientBatch {
    pub fn new(wallet: impl Into<String>, recipient_user_id: Option<String>) -> Self {
        Self {
            wallet: wallet.into(),
            recipient_user_id,
            payout_ids: Vec::new(),
            value: Decimal::ZERO,
            remarks: Vec::new(),
        }
    }

    /// Remarks joined for the transaction memo.
    pub fn memo(&self) -> Option<String> {
        if self.remarks.is_empty() {
            None
        } else {
            Some(self.remarks.join("; "))
        }
    }
}
