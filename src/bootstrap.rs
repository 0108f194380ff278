use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CosmosSettings, EvmSettings, Settings, StoreBackend};
use crate::dispatch::{DispatchProtocol, RetryPolicy};
use crate::error::{AppError, AppResult};
use crate::events::{EventPublisher, EventSink, LogSink, WebhookSink};
use crate::execution::{BackendRouter, CosmosBackend, CosmosConfig, EvmBackend, EvmConfig};
use crate::fees::{DocumentFeeSource, FeeHint, FeeWatcher};
use crate::payout::ClaimManager;
use crate::poller::{PollConfig, PollLoop};
use crate::sequence::SequenceAllocator;
use crate::settlement::{AuditLog, SettlementRecorder, StaleClaimRecovery};
use crate::store::{DocKey, DocumentStore, MemoryStore, PgStore};

/// Everything the worker runs
pub struct Worker {
    pub poll_loop: PollLoop,
    pub fee_watcher: Option<JoinHandle<()>>,
}

pub async fn initialize_worker(settings: &Settings) -> AppResult<Worker> {
    info!("Initializing settlement components ...");

    let store = initialize_store(settings).await?;
    let events = initialize_events(settings)?;

    info!("⚙️  Initializing ledger backends...");
    let mut router = BackendRouter::new();
    let mut fee_watcher = None;

    if let Some(evm) = &settings.evm {
        let (hint, handle) = FeeWatcher::spawn(
            Arc::new(DocumentFeeSource::new(
                store.clone(),
                DocKey::new(&settings.collections.config, &settings.fees.document_id),
                Duration::from_millis(settings.fees.refresh_interval_ms),
            )),
            None,
            Duration::from_millis(settings.fees.resubscribe_interval_ms),
        );
        fee_watcher = Some(handle);

        let backend = initialize_evm(evm, settings.sender_account_selector, hint).await?;
        router.register(
            Arc::new(backend),
            RetryPolicy {
                retry_limit: evm.retry_limit,
                backoff: Duration::from_millis(evm.retry_backoff_ms),
            },
        );
        info!("✅ EVM backend registered (chain id {})", evm.chain_id);
    } else {
        warn!("⚠️  [evm] not configured - EVM payouts disabled");
    }

    if let Some(cosmos) = &settings.cosmos {
        let backend = initialize_cosmos(cosmos)?;
        router.register(
            Arc::new(backend),
            RetryPolicy {
                retry_limit: cosmos.retry_limit,
                backoff: Duration::from_millis(cosmos.retry_backoff_ms),
            },
        );
        info!("✅ Cosmos backend registered ({})", cosmos.chain_id);
    } else {
        warn!("⚠️  [cosmos] not configured - Cosmos payouts disabled");
    }

    if router.is_empty() {
        return Err(AppError::Config("no ledger backend could be registered".to_string()));
    }

    let collections = &settings.collections;
    let allocator = Arc::new(SequenceAllocator::new(
        store.clone(),
        &collections.counters,
        settings.store.atomic_attempts,
    ));
    let dispatcher = Arc::new(DispatchProtocol::new(allocator, events.clone()));

    let claims = Arc::new(ClaimManager::new(
        store.clone(),
        &collections.payouts,
        settings.page_size,
        settings.sender_account_id.clone(),
        settings.store.atomic_attempts,
    ));

    let audit = Arc::new(AuditLog::new(store.clone(), &collections.transactions));
    let recorder = Arc::new(SettlementRecorder::new(
        store.clone(),
        audit,
        events,
        &collections.payouts,
        &collections.users,
        settings.store.atomic_attempts,
    ));

    let recovery = settings.recovery.enabled.then(|| {
        Arc::new(StaleClaimRecovery::new(
            claims.clone(),
            recorder.clone(),
            Duration::from_millis(settings.recovery.stale_after_ms),
        ))
    });

    let poll_loop = PollLoop::new(
        claims,
        Arc::new(router),
        dispatcher,
        recorder,
        recovery,
        PollConfig {
            interval: settings.poll_interval(),
            recovery_every_cycles: if settings.recovery.enabled {
                settings.recovery.every_cycles
            } else {
                0
            },
        },
    );

    info!("✅ Settlement worker initialized");
    Ok(Worker { poll_loop, fee_watcher })
}

async fn initialize_store(settings: &Settings) -> AppResult<Arc<dyn DocumentStore>> {
    match settings.store.backend {
        StoreBackend::Memory => {
            warn!("⚠️  Using the in-memory store - nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = settings
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Config("store.database_url is not set".to_string()))?;
            let store = PgStore::connect(url, settings.store.max_connections).await?;
            info!("✅ Document store connected");
            Ok(Arc::new(store))
        }
    }
}

fn initialize_events(settings: &Settings) -> AppResult<EventPublisher> {
    let events = &settings.events;
    let sink: Arc<dyn EventSink> = match &events.webhook_url {
        Some(url) => Arc::new(
            WebhookSink::new(url.clone(), Duration::from_millis(events.timeout_ms))
                .map_err(|e| AppError::Config(format!("event webhook client: {}", e)))?,
        ),
        None => Arc::new(LogSink),
    };

    if !events.enabled {
        info!("Event publishing disabled");
    }

    Ok(EventPublisher::new(
        sink,
        &events.topic,
        &settings.app_server,
        &settings.network,
        events.enabled,
    ))
}

async fn initialize_evm(evm: &EvmSettings, selector: usize, hint: FeeHint) -> AppResult<EvmBackend> {
    let account = evm
        .account(selector)
        .ok_or_else(|| AppError::Config("evm has no signing account".to_string()))?;
    if !evm.accounts.is_empty() && selector >= evm.accounts.len() {
        warn!(
            "⚠️  sender_account_selector {} out of range ({} accounts); using the first",
            selector,
            evm.accounts.len()
        );
    }

    let token_contract = evm
        .token_contract
        .as_deref()
        .map(|raw| {
            raw.parse::<Address>()
                .map_err(|e| AppError::Config(format!("evm.token_contract {}: {}", raw, e)))
        })
        .transpose()?;

    let config = EvmConfig {
        rpc_url: evm.rpc_url.clone(),
        chain_id: evm.chain_id,
        token_contract,
        gas_limit: account.gas_limit.unwrap_or(evm.gas_limit),
        min_gas_price_wei: evm.min_gas_price_wei,
        default_gas_price_wei: evm.default_gas_price_wei,
        decimals: evm.decimals,
    };

    Ok(EvmBackend::connect(config, &account.private_key, account.address.as_deref(), hint).await?)
}

fn initialize_cosmos(cosmos: &CosmosSettings) -> AppResult<CosmosBackend> {
    let config = CosmosConfig {
        lcd_endpoint: cosmos.lcd_endpoint.clone(),
        chain_id: cosmos.chain_id.clone(),
        sender_address: cosmos.sender_address.clone().filter(|a| !a.is_empty()),
        gas: cosmos.gas,
        denom: cosmos.denom.clone(),
        display_denom: cosmos.display_denom.clone(),
        decimals: cosmos.decimals,
        address_prefix: cosmos.address_prefix.clone(),
        request_timeout: Duration::from_millis(cosmos.request_timeout_ms),
    };
    Ok(CosmosBackend::new(config, &cosmos.private_key_hex)?)
}
