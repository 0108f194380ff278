use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Optional config file, looked up as `settler.toml` (or any format `config` knows).
pub const CONFIG_FILE: &str = "settler";
pub const ENV_PREFIX: &str = "SETTLER";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub poll_interval_ms: u64,
    pub page_size: usize,
    /// Index into `evm.accounts`; out of range falls back to the first account.
    pub sender_account_selector: usize,
    /// Only pick up payouts tagged with this sender account.
    pub sender_account_id: Option<String>,
    pub app_server: String,
    pub network: String,
    pub store: StoreSettings,
    pub collections: CollectionSettings,
    pub events: EventSettings,
    pub fees: FeeSettings,
    pub recovery: RecoverySettings,
    pub evm: Option<EvmSettings>,
    pub cosmos: Option<CosmosSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            page_size: 250,
            sender_account_selector: 0,
            sender_account_id: None,
            app_server: "payout-settler".to_string(),
            network: "testnet".to_string(),
            store: StoreSettings::default(),
            collections: CollectionSettings::default(),
            events: EventSettings::default(),
            fees: FeeSettings::default(),
            recovery: RecoverySettings::default(),
            evm: None,
            cosmos: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Attempts per optimistic transaction before giving up
    pub atomic_attempts: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            database_url: None,
            max_connections: 10,
            atomic_attempts: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectionSettings {
    pub payouts: String,
    pub transactions: String,
    pub counters: String,
    pub config: String,
    pub users: String,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            payouts: "payouts".to_string(),
            transactions: "tx".to_string(),
            counters: "counters".to_string(),
            config: "config".to_string(),
            users: "users".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EventSettings {
    pub enabled: bool,
    /// Events go to the log when unset.
    pub webhook_url: Option<String>,
    pub topic: String,
    pub timeout_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            topic: "misc".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeeSettings {
    /// Id of the fee hint document in the config collection
    pub document_id: String,
    pub refresh_interval_ms: u64,
    pub resubscribe_interval_ms: u64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            document_id: "gasPrice".to_string(),
            refresh_interval_ms: 10_000,
            resubscribe_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub stale_after_ms: u64,
    pub every_cycles: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_ms: 600_000,
            every_cycles: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvmAccount {
    /// Checked against the key when set
    pub address: Option<String>,
    pub private_key: String,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EvmSettings {
    pub rpc_url: String,
    pub chain_id: u64,
    pub accounts: Vec<EvmAccount>,
    /// Single-account shorthand, used when `accounts` is empty
    pub private_key: Option<String>,
    pub token_contract: Option<String>,
    pub gas_limit: u64,
    pub min_gas_price_wei: Decimal,
    pub default_gas_price_wei: Decimal,
    pub decimals: u32,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EvmSettings {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 1,
            accounts: Vec::new(),
            private_key: None,
            token_contract: None,
            gas_limit: 200_000,
            min_gas_price_wei: Decimal::from(1_500_000_000u64),
            default_gas_price_wei: Decimal::from(20_000_000_000u64),
            decimals: 18,
            retry_limit: 10,
            retry_backoff_ms: 15_000,
        }
    }
}

impl EvmSettings {
    /// Account chosen by `selector`, or the first one.
    pub fn account(&self, selector: usize) -> Option<EvmAccount> {
        if let Some(account) = self.accounts.get(selector).or_else(|| self.accounts.first()) {
            return Some(account.clone());
        }
        self.private_key.as_ref().map(|key| EvmAccount {
            address: None,
            private_key: key.clone(),
            gas_limit: None,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CosmosSettings {
    pub lcd_endpoint: String,
    pub chain_id: String,
    pub private_key_hex: String,
    /// Derived from the key when unset; checked against it when set.
    pub sender_address: Option<String>,
    pub gas: u64,
    pub denom: String,
    pub display_denom: String,
    pub decimals: u32,
    pub address_prefix: String,
    pub request_timeout_ms: u64,
    pub retry_limit: u32,
    /// Roughly one block time
    pub retry_backoff_ms: u64,
}

impl Default for CosmosSettings {
    fn default() -> Self {
        Self {
            lcd_endpoint: "http://localhost:1317".to_string(),
            chain_id: String::new(),
            private_key_hex: String::new(),
            sender_address: None,
            gas: 200_000,
            denom: "nanolike".to_string(),
            display_denom: "LIKE".to_string(),
            decimals: 9,
            address_prefix: "cosmos".to_string(),
            request_timeout_ms: 10_000,
            retry_limit: 10,
            retry_backoff_ms: 5_000,
        }
    }
}

impl Settings {
    /// Defaults, then `settler.toml` if present, then `SETTLER_*` variables.
    pub fn load() -> AppResult<Self> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name(CONFIG_FILE).required(false))
                .add_source(environment()),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.evm.is_none() && self.cosmos.is_none() {
            return Err(AppError::Config(
                "no ledger configured; set [evm] and/or [cosmos]".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(AppError::Config("page_size must be positive".to_string()));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(AppError::Config(
                "store.database_url is required for the postgres store".to_string(),
            ));
        }
        if self.events.enabled && self.events.topic.is_empty() {
            return Err(AppError::Config("events.topic must not be empty".to_string()));
        }
        if let Some(evm) = &self.evm {
            if evm.account(self.sender_account_selector).is_none() {
                return Err(AppError::Config(
                    "evm needs at least one account or evm.private_key".to_string(),
                ));
            }
        }
        if let Some(cosmos) = &self.cosmos {
            if cosmos.private_key_hex.is_empty() {
                return Err(AppError::Config("cosmos.private_key_hex is required".to_string()));
            }
            if cosmos.chain_id.is_empty() {
                return Err(AppError::Config("cosmos.chain_id is required".to_string()));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `SETTLER_EVM__RPC_URL` -> `evm.rpc_url`
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
