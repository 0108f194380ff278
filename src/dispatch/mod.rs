//! Dispatch Protocol: allocate a sequence, sign, broadcast; on failure reconcile the
//! sequence against the chain and retry with a fixed backoff, up to a ceiling.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{DispatchError, LedgerError};
use crate::events::{DispatchErrorEvent, EventPublisher, LOG_TYPE_DISPATCH_ERROR};
use crate::execution::{ChainKind, Fee, Route, SignedPayload, TransferRequest};
use crate::sequence::SequenceAllocator;

/// Per-chain retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum broadcast rounds, the optimistic one included
    pub retry_limit: u32,
    /// Pause before each retry after the first reconciliation; roughly one block time
    pub backoff: Duration,
}

/// Outcome of a successful dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub chain: ChainKind,
    pub tx_hash: String,
    pub sequence: u64,
    pub fee: Fee,
    pub sender: String,
    pub raw_signed_tx: String,
    /// Sequence was taken from the chain rather than the local counter
    pub reconciled: bool,
}

#[derive(Debug, Clone)]
pub enum DispatchState {
    Allocating,
    Signing,
    Broadcasting(SignedPayload),
    Reconciling,
    Retrying,
    Succeeded(String),
    Failed(LedgerError),
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Allocating => "allocating",
            DispatchState::Signing => "signing",
            DispatchState::Broadcasting(_) => "broadcasting",
            DispatchState::Reconciling => "reconciling",
            DispatchState::Retrying => "retrying",
            DispatchState::Succeeded(_) => "succeeded",
            DispatchState::Failed(_) => "failed",
        };
        f.write_str(name)
    }
}

/// Mutable bookkeeping of one dispatch
#[derive(Debug, Default)]
struct Attempt {
    sequence: u64,
    rounds: u32,
    reconciling: bool,
    last_payload: Option<SignedPayload>,
}

impl Attempt {
    /// Next state after a failed round.
    fn after_failure(&self, error: LedgerError, limit: u32) -> DispatchState {
        if !error.is_retryable() || self.rounds >= limit {
            return DispatchState::Failed(error);
        }
        if self.reconciling {
            DispatchState::Retrying
        } else {
            DispatchState::Reconciling
        }
    }
}

pub struct DispatchProtocol {
    allocator: Arc<SequenceAllocator>,
    events: EventPublisher,
}

impl DispatchProtocol {
    pub fn new(allocator: Arc<SequenceAllocator>, events: EventPublisher) -> Self {
        Self { allocator, events }
    }

    /// Send `amount` base units to `recipient` through `route`, paying `fee`.
    ///
    /// Returns only once the chain accepted a transaction, or with a terminal error
    /// after which no further broadcast for this transfer will happen. Every terminal
    /// error is published as a dispatch error event.
    #[instrument(skip(self, route, fee, memo), fields(chain = %route.backend.chain(), sender = %route.backend.sender_address()))]
    pub async fn dispatch(
        &self,
        route: &Route,
        recipient: &str,
        amount: Decimal,
        fee: Fee,
        memo: Option<String>,
    ) -> Result<DispatchReceipt, DispatchError> {
        let backend = &route.backend;
        let sender = backend.sender_address().to_string();
        let limit = route.retry.retry_limit.max(1);

        let mut attempt = Attempt::default();
        let mut state = DispatchState::Allocating;

        let tx_hash = loop {
            debug!("dispatch -> {} (sequence {}, round {})", state, attempt.sequence, attempt.rounds);

            state = match state {
                DispatchState::Allocating => match self.allocator.allocate(&sender).await {
                    Ok(sequence) => {
                        attempt.sequence = sequence;
                        DispatchState::Signing
                    }
                    Err(e) => {
                        let error = DispatchError::Sequence(e);
                        self.publish_failure(&sender, recipient, &attempt, &error).await;
                        return Err(error);
                    }
                },
                DispatchState::Signing => {
                    attempt.rounds += 1;
                    let transfer = TransferRequest {
                        recipient: recipient.to_string(),
                        amount,
                        sequence: attempt.sequence,
                        fee: fee.clone(),
                        memo: memo.clone(),
                    };
                    match backend.sign(&transfer).await {
                        Ok(payload) => DispatchState::Broadcasting(payload),
                        Err(e) => {
                            warn!("Signing at sequence {} failed: {}", attempt.sequence, e);
                            attempt.after_failure(e, limit)
                        }
                    }
                }
                DispatchState::Broadcasting(payload) => {
                    let result = backend.broadcast(&payload).await;
                    attempt.last_payload = Some(payload);
                    match result {
                        Ok(hash) => DispatchState::Succeeded(hash),
                        Err(e) => {
                            warn!(
                                "Broadcast at sequence {} failed (round {}/{}): {}",
                                attempt.sequence, attempt.rounds, limit, e
                            );
                            attempt.after_failure(e, limit)
                        }
                    }
                }
                DispatchState::Reconciling => {
                    // Borrow the chain's view; allocating again would burn a counter slot.
                    attempt.reconciling = true;
                    match backend.current_account_sequence(&sender).await {
                        Ok(sequence) => {
                            info!("🔁 Chain reports sequence {} for {}", sequence, sender);
                            attempt.sequence = sequence;
                            DispatchState::Signing
                        }
                        Err(e) => {
                            warn!("Sequence lookup for {} failed: {}", sender, e);
                            // A failed lookup consumes a round so a dead node cannot loop forever.
                            attempt.rounds += 1;
                            attempt.after_failure(e, limit)
                        }
                    }
                }
                DispatchState::Retrying => {
                    tokio::time::sleep(route.retry.backoff).await;
                    DispatchState::Reconciling
                }
                DispatchState::Succeeded(hash) => break hash,
                DispatchState::Failed(error) => {
                    return Err(self.fail(&sender, recipient, attempt, limit, error).await);
                }
            };
        };

        if attempt.reconciling {
            if let Err(e) = self.allocator.reconcile(&sender, attempt.sequence).await {
                // The transfer is on-chain; the next reconcile will catch the counter up.
                error!("Counter reconcile for {} at {} failed: {}", sender, attempt.sequence, e);
            }
        }

        info!(
            "✅ Dispatched {} to {} at sequence {}: {}",
            amount, recipient, attempt.sequence, tx_hash
        );

        Ok(DispatchReceipt {
            chain: backend.chain(),
            tx_hash,
            sequence: attempt.sequence,
            fee,
            sender,
            raw_signed_tx: attempt.last_payload.map(|p| p.raw).unwrap_or_default(),
            reconciled: attempt.reconciling,
        })
    }

    async fn fail(
        &self,
        sender: &str,
        recipient: &str,
        attempt: Attempt,
        limit: u32,
        last_error: LedgerError,
    ) -> DispatchError {
        let broadcast = attempt.last_payload.is_some();
        let error = if last_error.is_retryable() {
            DispatchError::RetryLimitExceeded {
                limit,
                sequence: attempt.sequence,
                last_error,
                broadcast,
            }
        } else {
            DispatchError::Fatal {
                sequence: attempt.sequence,
                source: last_error,
                broadcast,
            }
        };

        self.publish_failure(sender, recipient, &attempt, &error).await;
        error
    }

    async fn publish_failure(&self, sender: &str, recipient: &str, attempt: &Attempt, error: &DispatchError) {
        error!(
            "❌ Dispatch from {} to {} failed at sequence {}: {}",
            sender, recipient, attempt.sequence, error
        );

        let (tx_hash, raw_signed_tx) = match &attempt.last_payload {
            Some(p) => (p.hash.clone(), Some(p.raw.clone())),
            None => (None, None),
        };

        self.events
            .emit(&DispatchErrorEvent {
                log_type: LOG_TYPE_DISPATCH_ERROR,
                from_wallet: sender.to_string(),
                to_wallet: recipient.to_string(),
                tx_hash,
                raw_signed_tx,
                tx_sequence: attempt.sequence,
                error: error.to_string(),
            })
            .await;
    }
}
