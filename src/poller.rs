// Poll Loop - drives claim -> dispatch -> record, one page per cycle
//
// Pages are walked with a keyset cursor that survives between cycles, so records that
// keep being skipped cannot hide the ones behind them.
//
// Recipients are processed one at a time so sequence allocation for a sender stays
// strictly ordered. Nothing a single recipient does can stop the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchProtocol;
use crate::error::{AppError, AppResult, ClaimError, LedgerError};
use crate::execution::BackendRouter;
use crate::payout::{ClaimManager, RecipientBatch};
use crate::settlement::{SettlementRecorder, StaleClaimRecovery};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Run stale claim recovery every this many cycles; 0 disables it.
    pub recovery_every_cycles: u64,
}

/// What happened in one cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub batches: usize,
    pub settled: usize,
    pub conflicts: usize,
    pub unroutable: usize,
    pub failed: usize,
    /// Broadcast succeeded but bookkeeping did not finish
    pub incomplete: usize,
}

enum Outcome {
    Settled,
    Conflict,
}

pub struct PollLoop {
    claims: Arc<ClaimManager>,
    router: Arc<BackendRouter>,
    dispatcher: Arc<DispatchProtocol>,
    recorder: Arc<SettlementRecorder>,
    recovery: Option<Arc<StaleClaimRecovery>>,
    config: PollConfig,
    /// Last id of the previous full page
    cursor: Mutex<Option<String>>,
}

impl PollLoop {
    pub fn new(
        claims: Arc<ClaimManager>,
        router: Arc<BackendRouter>,
        dispatcher: Arc<DispatchProtocol>,
        recorder: Arc<SettlementRecorder>,
        recovery: Option<Arc<StaleClaimRecovery>>,
        config: PollConfig,
    ) -> Self {
        Self {
            claims,
            router,
            dispatcher,
            recorder,
            recovery,
            config,
            cursor: Mutex::new(None),
        }
    }

    /// Run until `shutdown` resolves. Errors are logged; the next cycle always runs.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "🔄 Poll loop started (interval {:?}, chains {:?})",
            self.config.interval,
            self.router.registered_chains()
        );

        self.recover().await;

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;

            if self.config.recovery_every_cycles > 0 && cycle % self.config.recovery_every_cycles == 0 {
                self.recover().await;
            }

            match self.run_once(Utc::now().timestamp_millis()).await {
                Ok(report) if report.selected > 0 => info!("📊 Cycle {}: {:?}", cycle, report),
                Ok(_) => debug!("Cycle {}: nothing due", cycle),
                Err(e) => error!("❌ Cycle {} failed: {}", cycle, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = &mut shutdown => {
                    info!("🛑 Poll loop stopping after cycle {}", cycle);
                    break;
                }
            }
        }
    }

    async fn recover(&self) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        match recovery.run(Utc::now().timestamp_millis()).await {
            Ok(report) if report.finished > 0 || !report.unresolved.is_empty() => {
                info!("🩹 Stale claim recovery: {:?}", report)
            }
            Ok(_) => {}
            Err(e) => error!("Stale claim recovery failed: {}", e),
        }
    }

    /// One page: select, aggregate, then settle each recipient in turn.
    ///
    /// Each call resumes after the previous full page and wraps to the start once a
    /// short page is seen.
    pub async fn run_once(&self, now_ms: i64) -> AppResult<CycleReport> {
        let cursor = self.cursor.lock().clone();
        let page = self.claims.fetch_due(now_ms, cursor.as_deref()).await?;
        *self.cursor.lock() = page.next;

        let mut report = CycleReport {
            selected: page.records.len(),
            ..Default::default()
        };

        let batches = ClaimManager::aggregate(page.records);
        report.batches = batches.len();

        for batch in &batches {
            match self.settle(batch).await {
                Ok(Outcome::Settled) => report.settled += 1,
                Ok(Outcome::Conflict) => report.conflicts += 1,
                Err(AppError::UnroutableAddress(address)) => {
                    error!("No ledger backend for recipient {} ({:?}); left unclaimed", address, batch.payout_ids);
                    report.unroutable += 1;
                }
                Err(AppError::Recorder(e)) => {
                    error!(
                        "🚨 Transfer to {} is on-chain but bookkeeping is incomplete: {}",
                        batch.wallet, e
                    );
                    report.incomplete += 1;
                }
                Err(e) => {
                    let sender = self
                        .router
                        .route(&batch.wallet)
                        .map(|r| r.backend.sender_address().to_string())
                        .unwrap_or_default();
                    error!(
                        sender = %sender,
                        recipient = %batch.wallet,
                        payouts = ?batch.payout_ids,
                        "❌ Settlement failed: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn settle(&self, batch: &RecipientBatch) -> AppResult<Outcome> {
        let route = self
            .router
            .route(&batch.wallet)
            .ok_or_else(|| AppError::UnroutableAddress(batch.wallet.clone()))?;

        // Reject before claiming so nothing is left pending for a transfer that cannot be signed.
        if !batch.value.fract().is_zero() {
            return Err(LedgerError::Units(format!(
                "{} {} is not a whole number of base units",
                batch.value,
                route.backend.denomination().base
            ))
            .into());
        }

        // Resolved before claiming; a fee outage leaves the records selectable next cycle.
        let fee = route.backend.resolve_fee().await?;

        match self.claims.claim(batch).await {
            Ok(()) => {}
            Err(ClaimError::Conflict { payout_id, .. }) => {
                warn!("Payout {} for {} already claimed elsewhere, skipping", payout_id, batch.wallet);
                return Ok(Outcome::Conflict);
            }
            Err(e) => return Err(e.into()),
        }

        let receipt = match self
            .dispatcher
            .dispatch(route, &batch.wallet, batch.value, fee, batch.memo())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if !e.reached_chain() => {
                match self.claims.release(batch).await {
                    Ok(released) => warn!("Nothing was broadcast to {}; released {} payouts", batch.wallet, released),
                    Err(release_error) => error!(
                        "🚨 Claim release for {} ({:?}) failed, records stay pending: {}",
                        batch.wallet, batch.payout_ids, release_error
                    ),
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.recorder.record(batch, route, &receipt).await?;
        Ok(Outcome::Settled)
    }
}
