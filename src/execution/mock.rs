//! Scriptable in-process ledger backend for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{ChainKind, Denomination, Fee, LedgerBackend, SignedPayload, TransferRequest};
use crate::error::{LedgerError, LedgerResult};

pub const EVM_SENDER: &str = "0x1111111111111111111111111111111111111111";
pub const COSMOS_SENDER: &str = "cosmos1sender";

pub struct MockBackend {
    chain: ChainKind,
    sender: String,
    denomination: Denomination,
    fee: Fee,
    height: u64,
    height_fails: AtomicBool,
    fee_fails: AtomicBool,
    chain_sequence: Mutex<u64>,
    script: Mutex<VecDeque<LedgerResult<String>>>,
    signed: Mutex<Vec<TransferRequest>>,
    broadcasts: AtomicU32,
}

impl MockBackend {
    fn new(chain: ChainKind, sender: &str, denomination: Denomination) -> Self {
        Self {
            chain,
            sender: sender.to_string(),
            denomination,
            fee: Fee {
                gas_limit: 21_000,
                gas_price: Decimal::from(1_000_000_000u64),
            },
            height: 1_000,
            height_fails: AtomicBool::new(false),
            fee_fails: AtomicBool::new(false),
            chain_sequence: Mutex::new(0),
            script: Mutex::new(VecDeque::new()),
            signed: Mutex::new(Vec::new()),
            broadcasts: AtomicU32::new(0),
        }
    }

    pub fn evm() -> Self {
        Self::new(ChainKind::Evm, EVM_SENDER, Denomination::new("wei", "LIKE", 18))
    }

    pub fn cosmos() -> Self {
        Self::new(ChainKind::Cosmos, COSMOS_SENDER, Denomination::new("nanolike", "LIKE", 9))
    }

    /// Queue broadcast outcomes; once drained every broadcast succeeds.
    pub fn script_broadcasts(&self, outcomes: impl IntoIterator<Item = LedgerResult<String>>) {
        self.script.lock().extend(outcomes);
    }

    pub fn set_chain_sequence(&self, sequence: u64) {
        *self.chain_sequence.lock() = sequence;
    }

    pub fn fail_height(&self) {
        self.height_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_fee(&self, failing: bool) {
        self.fee_fails.store(failing, Ordering::SeqCst);
    }

    pub fn signed(&self) -> Vec<TransferRequest> {
        self.signed.lock().clone()
    }

    pub fn broadcast_count(&self) -> u32 {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub fn transport_error(&self) -> LedgerError {
        LedgerError::Transport {
            chain: self.chain,
            message: "connection reset by peer".to_string(),
        }
    }

    pub fn rejection(&self, reason: &str) -> LedgerError {
        LedgerError::BroadcastRejected {
            chain: self.chain,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LedgerBackend for MockBackend {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    fn sender_address(&self) -> &str {
        &self.sender
    }

    fn is_address_of_this_kind(&self, address: &str) -> bool {
        match self.chain {
            ChainKind::Evm => address.starts_with("0x"),
            ChainKind::Cosmos => address.starts_with("cosmos1"),
        }
    }

    fn denomination(&self) -> &Denomination {
        &self.denomination
    }

    async fn resolve_fee(&self) -> LedgerResult<Fee> {
        if self.fee_fails.load(Ordering::SeqCst) {
            return Err(self.transport_error());
        }
        Ok(self.fee.clone())
    }

    async fn sign(&self, transfer: &TransferRequest) -> LedgerResult<SignedPayload> {
        self.signed.lock().push(transfer.clone());
        let hash = match self.chain {
            ChainKind::Evm => Some(format!("0xlocal{}", transfer.sequence)),
            ChainKind::Cosmos => None,
        };
        Ok(SignedPayload {
            raw: format!("signed:{}:{}:{}", transfer.recipient, transfer.amount, transfer.sequence),
            hash,
        })
    }

    async fn broadcast(&self, _payload: &SignedPayload) -> LedgerResult<String> {
        let n = self.broadcasts.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("0xtx{}", n)))
    }

    async fn current_account_sequence(&self, _address: &str) -> LedgerResult<u64> {
        Ok(*self.chain_sequence.lock())
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        if self.height_fails.load(Ordering::SeqCst) {
            return Err(self.transport_error());
        }
        Ok(self.height)
    }
}
