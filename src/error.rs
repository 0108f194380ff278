use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::execution::ChainKind;
use crate::store::DocKey;

/// Top-level error type for the settlement worker
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("No ledger backend accepts address {0}")]
    UnroutableAddress(String),
}

/// Document store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// A document read inside an atomic transaction changed before commit.
    #[error("Concurrent modification detected")]
    Conflict,

    #[error("Document already exists: {0}")]
    AlreadyExists(DocKey),

    #[error("Document not found: {0}")]
    NotFound(DocKey),

    #[error("Atomic transaction gave up after {attempts} conflicting attempts")]
    ContentionExhausted { attempts: u32 },

    #[error("Malformed document {key}: {message}")]
    Malformed { key: DocKey, message: String },

    /// The document is not in the state the write was conditioned on.
    #[error("Unexpected state of {key}: {message}")]
    StateMismatch { key: DocKey, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),
}

/// Ledger backend errors
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Network/RPC failure. The chain may or may not have seen the request.
    #[error("Transport failure on {chain}: {message}")]
    Transport { chain: ChainKind, message: String },

    /// The chain refused the transaction and said why.
    #[error("Broadcast rejected by {chain}: {reason}")]
    BroadcastRejected { chain: ChainKind, reason: String },

    #[error("Signing failed on {chain}: {message}")]
    Signing { chain: ChainKind, message: String },

    #[error("Invalid address format for {chain}: {address}")]
    InvalidAddress { chain: ChainKind, address: String },

    #[error("Unit conversion failed: {0}")]
    Units(String),
}

const STALE_SEQUENCE_MARKERS: &[&str] = &[
    "sequence mismatch",
    "incorrect account sequence",
    "nonce too low",
    "replacement transaction underpriced",
];

impl LedgerError {
    /// Rejection reasons that a fresh sequence from the chain can fix.
    pub fn is_stale_sequence(&self) -> bool {
        match self {
            LedgerError::BroadcastRejected { reason, .. } => {
                let reason = reason.to_lowercase();
                STALE_SEQUENCE_MARKERS.iter().any(|m| reason.contains(m))
            }
            _ => false,
        }
    }

    /// Whether the reconcile/retry path may recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transport { .. }) || self.is_stale_sequence()
    }
}

/// Claim transaction errors
#[derive(Error, Debug)]
pub enum ClaimError {
    /// Another run already moved one of the records off `txHash == null`.
    #[error("Payout {payout_id} for {recipient} is already claimed")]
    Conflict { recipient: String, payout_id: String },

    #[error("Payout {0} vanished before it could be claimed")]
    Missing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Terminal dispatch failures for one recipient
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Sequence allocation failed: {0}")]
    Sequence(#[from] StoreError),

    #[error("Fatal ledger error at sequence {sequence}: {source}")]
    Fatal {
        sequence: u64,
        source: LedgerError,
        /// A signed payload was handed to the chain at least once
        broadcast: bool,
    },

    #[error("Retry limit of {limit} exceeded at sequence {sequence}: {last_error}")]
    RetryLimitExceeded {
        limit: u32,
        sequence: u64,
        last_error: LedgerError,
        broadcast: bool,
    },
}

impl DispatchError {
    /// Whether the chain may have seen a transaction for this transfer.
    pub fn reached_chain(&self) -> bool {
        match self {
            DispatchError::Sequence(_) => false,
            DispatchError::Fatal { broadcast, .. } | DispatchError::RetryLimitExceeded { broadcast, .. } => *broadcast,
        }
    }
}

/// A bookkeeping step that did not complete after a successful broadcast
#[derive(Error, Debug)]
pub enum RecorderStep {
    #[error("audit record already exists")]
    DuplicateAudit,

    #[error("audit write failed: {0}")]
    Audit(StoreError),

    #[error("mark settled failed: {0}")]
    MarkSettled(StoreError),
}

/// Raised when the transfer is on-chain but bookkeeping is not complete
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Bookkeeping incomplete for on-chain tx {tx_hash}: {}", format_steps(.failures))]
    Incomplete {
        tx_hash: String,
        failures: Vec<RecorderStep>,
    },
}

fn format_steps(steps: &[RecorderStep]) -> String {
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<rust_decimal::Error> for LedgerError {
    fn from(error: rust_decimal::Error) -> Self {
        LedgerError::Units(format!("Decimal conversion error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

pub type StoreResult<T> = Result<T, StoreError>;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(reason: &str) -> LedgerError {
        LedgerError::BroadcastRejected {
            chain: ChainKind::Evm,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_stale_sequence_classification() {
        assert!(rejected("Returned error: nonce too low").is_stale_sequence());
        assert!(rejected("replacement transaction underpriced").is_retryable());
        assert!(rejected("account sequence mismatch, expected 42, got 40").is_retryable());
        assert!(!rejected("insufficient funds for gas * price + value").is_retryable());
    }

    #[test]
    fn test_transport_is_retryable() {
        let err = LedgerError::Transport {
            chain: ChainKind::Cosmos,
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_stale_sequence());
    }

    #[test]
    fn test_reached_chain() {
        let lost = DispatchError::Sequence(StoreError::ContentionExhausted { attempts: 3 });
        let unsigned = DispatchError::Fatal {
            sequence: 4,
            source: LedgerError::Units("bad amount".to_string()),
            broadcast: false,
        };
        let sent = DispatchError::RetryLimitExceeded {
            limit: 2,
            sequence: 4,
            last_error: rejected("nonce too low"),
            broadcast: true,
        };

        assert!(!lost.reached_chain());
        assert!(!unsigned.reached_chain());
        assert!(sent.reached_chain());
    }
}
