pub mod cosmos;
pub mod evm;
pub mod router;
pub mod units;

#[cfg(test)]
pub mod mock;

pub use cosmos::{CosmosBackend, CosmosConfig};
pub use evm::{EvmBackend, EvmConfig};
pub use router::{BackendRouter, Route};
pub use units::Denomination;

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;

/// Ledger family a backend settles on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Cosmos,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Evm => "evm",
            ChainKind::Cosmos => "cosmos",
        }
    }

    /// `type` field of the audit record
    pub fn audit_type(&self) -> &'static str {
        match self {
            ChainKind::Evm => "payout",
            ChainKind::Cosmos => "cosmosPayout",
        }
    }

    /// `logType` of the settlement event
    pub fn settlement_log_type(&self) -> &'static str {
        match self {
            ChainKind::Evm => "eventPayout",
            ChainKind::Cosmos => "eventCosmosPayout",
        }
    }
}

/// Fee parameters for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub gas_limit: u64,
    /// Price per gas unit in the chain's base unit; zero when the chain takes no fee.
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_price: Decimal,
}

/// Value transfer to be signed
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub recipient: String,
    /// Amount in base units
    pub amount: Decimal,
    pub sequence: u64,
    pub fee: Fee,
    pub memo: Option<String>,
}

/// Signed transaction ready to broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    /// Wire encoding: 0x-hex for EVM, amino JSON for Cosmos
    pub raw: String,
    /// Hash computed locally while signing, when the chain format allows it
    pub hash: Option<String>,
}

/// Capability set every ledger variant provides to the dispatch engine
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn chain(&self) -> ChainKind;

    /// Address funding payouts; also keys the sequence counter.
    fn sender_address(&self) -> &str;

    /// Address formats are disjoint between variants, so at most one backend matches.
    fn is_address_of_this_kind(&self, address: &str) -> bool;

    fn denomination(&self) -> &Denomination;

    /// Fee to use for the next transaction
    async fn resolve_fee(&self) -> LedgerResult<Fee>;

    async fn sign(&self, transfer: &TransferRequest) -> LedgerResult<SignedPayload>;

    /// Returns the transaction hash.
    async fn broadcast(&self, payload: &SignedPayload) -> LedgerResult<String>;

    /// Chain-observed next sequence for `address`. Only used for reconciliation.
    async fn current_account_sequence(&self, address: &str) -> LedgerResult<u64>;

    async fn current_height(&self) -> LedgerResult<u64>;

    fn to_base_units(&self, display: Decimal) -> LedgerResult<Decimal> {
        self.denomination().to_base_units(display)
    }

    fn from_base_units(&self, base: Decimal) -> LedgerResult<Decimal> {
        self.denomination().from_base_units(base)
    }
}
