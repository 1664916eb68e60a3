//! Configuration loading and pre-flight validation
//!
//! Settings come from environment variables (a `.env` file is loaded when
//! present) or from a JSON file with the same fields in nested sections.
//! Either way they land in [`RawConfig`], and [`RawConfig::validate`] turns
//! that into an immutable [`RelayConfig`] or names the first bad field.

use alloy::primitives::Address;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::amount::{AmountConverter, MAX_DECIMALS};
use crate::destination::name::{encode_name, encode_symbol, validate_account};
use crate::error::ConfigError;
use crate::retry::RetryConfig;

const DEFAULT_EVENT_NAME: &str = "Teleport";
const DEFAULT_MEMO: &str = "Welcome to SENSE on EOS!";
const DEFAULT_DESTINATION_DECIMALS: u32 = 4;
const DEFAULT_PERMISSION: &str = "active";
const DEFAULT_WALLET_NAME: &str = "default";
const DEFAULT_EXPIRATION_SECS: u32 = 300;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_MAX_BLOCK_RANGE: u64 = 5_000;
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1_024;
/// Largest precision an EOSIO asset symbol can carry
const MAX_DESTINATION_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    #[serde(alias = "blackhole")]
    pub source: RawSource,
    #[serde(alias = "eosiotoken")]
    pub destination: RawDestination,
    pub relay: RawRelay,
    pub database: RawDatabase,
    pub alerts: RawAlerts,
    pub api: RawApi,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSource {
    #[serde(alias = "websocket_provider")]
    pub ws_url: Option<String>,
    #[serde(alias = "address")]
    pub contract: Option<String>,
    pub decimals: Option<String>,
    pub symbol: Option<String>,
    pub abi_path: Option<String>,
    pub event_name: Option<String>,
    pub start_block: Option<String>,
    pub max_block_range: Option<String>,
    pub subscription_buffer: Option<String>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDestination {
    #[serde(alias = "http_endpoint")]
    pub api_endpoint: Option<String>,
    pub chain_id: Option<String>,
    pub wallet_url: Option<String>,
    pub wallet_name: Option<String>,
    pub wallet_password: Option<String>,
    pub signing_key: Option<String>,
    #[serde(alias = "account")]
    pub token_contract: Option<String>,
    pub issuer: Option<String>,
    pub permission: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<String>,
    pub expiration_secs: Option<String>,
}

/// Custom Debug that redacts the wallet password.
impl fmt::Debug for RawDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDestination")
            .field("api_endpoint", &self.api_endpoint)
            .field("chain_id", &self.chain_id)
            .field("wallet_url", &self.wallet_url)
            .field("wallet_name", &self.wallet_name)
            .field("wallet_password", &self.wallet_password.as_ref().map(|_| "<redacted>"))
            .field("signing_key", &self.signing_key)
            .field("token_contract", &self.token_contract)
            .field("issuer", &self.issuer)
            .field("permission", &self.permission)
            .field("symbol", &self.symbol)
            .field("decimals", &self.decimals)
            .field("expiration_secs", &self.expiration_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRelay {
    pub exchange_rate: Option<String>,
    pub memo: Option<String>,
    pub workers: Option<String>,
    pub queue_capacity: Option<String>,
    pub dispatch_max_retries: Option<String>,
    pub dispatch_initial_backoff_ms: Option<String>,
    pub dispatch_max_backoff_ms: Option<String>,
    pub reconnect_max_attempts: Option<String>,
    pub reconnect_initial_backoff_ms: Option<String>,
    pub reconnect_max_backoff_ms: Option<String>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDatabase {
    pub url: Option<String>,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for RawDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDatabase")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAlerts {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawApi {
    pub bind_addr: Option<String>,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok()
}

impl RawConfig {
    /// Load from a JSON file when given, otherwise from `.env` and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_json_file(path),
            None => Self::load_from_file(".env"),
        }
    }

    /// Load a specific .env file (if it exists), then read the environment
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Ok(Self::from_env())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Config path is not valid UTF-8: {}", path.display()))?;
        config::Config::builder()
            .add_source(config::File::new(path_str, config::FileFormat::Json))
            .build()
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?
            .try_deserialize()
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Read the process environment (no `.env` handling)
    pub fn from_env() -> Self {
        Self {
            source: RawSource {
                ws_url: var("ETH_WEBSOCKET_PROVIDER"),
                contract: var("MIGRATION_CONTRACT"),
                decimals: var("ETH_DECIMALS"),
                symbol: var("ETH_SYMBOL"),
                abi_path: var("SOURCE_ABI_PATH"),
                event_name: var("SOURCE_EVENT_NAME"),
                start_block: var("SOURCE_START_BLOCK"),
                max_block_range: var("SOURCE_MAX_BLOCK_RANGE"),
                subscription_buffer: var("SOURCE_SUBSCRIPTION_BUFFER"),
            },
            destination: RawDestination {
                api_endpoint: var("EOS_API_ENDPOINT"),
                chain_id: var("EOS_CHAIN_ID"),
                wallet_url: var("EOS_WALLET_URL"),
                wallet_name: var("EOS_WALLET_NAME"),
                wallet_password: var("EOS_WALLET_PASSWORD"),
                signing_key: var("EOS_SIGNING_KEY"),
                token_contract: var("EOS_TOKEN_CONTRACT"),
                issuer: var("EOS_TOKEN_ISSUER"),
                permission: var("EOS_ISSUER_PERMISSION"),
                symbol: var("EOS_TOKEN_SYMBOL"),
                decimals: var("EOS_DECIMALS"),
                expiration_secs: var("EOS_TX_EXPIRATION_SECS"),
            },
            relay: RawRelay {
                exchange_rate: var("EOS_EXCHANGE_RATE"),
                memo: var("TELEPORT_MEMO"),
                workers: var("RELAY_WORKERS"),
                queue_capacity: var("RELAY_QUEUE_CAPACITY"),
                dispatch_max_retries: var("DISPATCH_MAX_RETRIES"),
                dispatch_initial_backoff_ms: var("DISPATCH_INITIAL_BACKOFF_MS"),
                dispatch_max_backoff_ms: var("DISPATCH_MAX_BACKOFF_MS"),
                reconnect_max_attempts: var("RECONNECT_MAX_ATTEMPTS"),
                reconnect_initial_backoff_ms: var("RECONNECT_INITIAL_BACKOFF_MS"),
                reconnect_max_backoff_ms: var("RECONNECT_MAX_BACKOFF_MS"),
            },
            database: RawDatabase {
                url: var("DATABASE_URL"),
            },
            alerts: RawAlerts {
                webhook_url: var("ALERT_WEBHOOK_URL"),
            },
            api: RawApi {
                bind_addr: var("API_BIND_ADDR"),
            },
        }
    }

    /// Check every field and build the immutable relay configuration
    pub fn validate(&self) -> Result<RelayConfig, ConfigError> {
        let source = self.validate_source()?;
        let destination = self.validate_destination()?;
        let relay = self.validate_relay(source.decimals, destination.decimals)?;

        let database_url = required("database.url", &self.database.url)?;

        let alert_webhook_url = optional(&self.alerts.webhook_url)
            .map(|url| http_url("alerts.webhook_url", url))
            .transpose()?;

        let api_bind_addr = optional(&self.api.bind_addr)
            .map(|addr| {
                SocketAddr::from_str(addr)
                    .map_err(|e| ConfigError::new("api.bind_addr", e.to_string()))
            })
            .transpose()?;

        Ok(RelayConfig {
            source,
            destination,
            relay,
            database_url,
            alert_webhook_url,
            api_bind_addr,
        })
    }

    fn validate_source(&self) -> Result<SourceConfig, ConfigError> {
        let raw = &self.source;

        let ws_url = required("source.ws_url", &raw.ws_url)?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::new(
                "source.ws_url",
                "must be a websocket URL (ws:// or wss://)",
            ));
        }

        let contract = evm_address("source.contract", &required("source.contract", &raw.contract)?)?;

        let decimals = number("source.decimals", &raw.decimals, None)?;
        if decimals > MAX_DECIMALS {
            return Err(ConfigError::new(
                "source.decimals",
                format!("must be at most {}", MAX_DECIMALS),
            ));
        }

        let max_block_range =
            number("source.max_block_range", &raw.max_block_range, Some(DEFAULT_MAX_BLOCK_RANGE))?;
        if max_block_range == 0 {
            return Err(ConfigError::new("source.max_block_range", "must be positive"));
        }

        let subscription_buffer = number(
            "source.subscription_buffer",
            &raw.subscription_buffer,
            Some(DEFAULT_SUBSCRIPTION_BUFFER),
        )?;
        if subscription_buffer == 0 {
            return Err(ConfigError::new("source.subscription_buffer", "must be positive"));
        }

        let start_block = match optional(&raw.start_block) {
            Some(_) => Some(number("source.start_block", &raw.start_block, None)?),
            None => None,
        };

        Ok(SourceConfig {
            ws_url,
            contract,
            abi_path: PathBuf::from(required("source.abi_path", &raw.abi_path)?),
            event_name: optional(&raw.event_name)
                .unwrap_or(DEFAULT_EVENT_NAME)
                .to_string(),
            symbol: required("source.symbol", &raw.symbol)?,
            decimals,
            start_block,
            max_block_range,
            subscription_buffer,
        })
    }

    fn validate_destination(&self) -> Result<DestinationConfig, ConfigError> {
        let raw = &self.destination;

        let api_endpoint = http_url(
            "destination.api_endpoint",
            &required("destination.api_endpoint", &raw.api_endpoint)?,
        )?;
        let wallet_url = http_url(
            "destination.wallet_url",
            &required("destination.wallet_url", &raw.wallet_url)?,
        )?;

        let chain_id = required("destination.chain_id", &raw.chain_id)?.to_lowercase();
        if chain_id.len() != 64 || !chain_id.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::new(
                "destination.chain_id",
                "must be 64 hex characters",
            ));
        }

        let token_contract = required("destination.token_contract", &raw.token_contract)?;
        validate_account(&token_contract)
            .map_err(|e| ConfigError::new("destination.token_contract", e.to_string()))?;
        let issuer = required("destination.issuer", &raw.issuer)?;
        validate_account(&issuer).map_err(|e| ConfigError::new("destination.issuer", e.to_string()))?;

        let permission = optional(&raw.permission)
            .unwrap_or(DEFAULT_PERMISSION)
            .to_string();
        encode_name(&permission)
            .map_err(|e| ConfigError::new("destination.permission", e.to_string()))?;

        let decimals = number(
            "destination.decimals",
            &raw.decimals,
            Some(DEFAULT_DESTINATION_DECIMALS),
        )?;
        if decimals > MAX_DESTINATION_DECIMALS {
            return Err(ConfigError::new(
                "destination.decimals",
                format!("must be at most {}", MAX_DESTINATION_DECIMALS),
            ));
        }

        let symbol = required("destination.symbol", &raw.symbol)?;
        encode_symbol(decimals as u8, &symbol)
            .map_err(|e| ConfigError::new("destination.symbol", e.reason))?;

        let expiration_secs = number(
            "destination.expiration_secs",
            &raw.expiration_secs,
            Some(DEFAULT_EXPIRATION_SECS),
        )?;
        if expiration_secs == 0 || expiration_secs > 3600 {
            return Err(ConfigError::new(
                "destination.expiration_secs",
                "must be between 1 and 3600",
            ));
        }

        Ok(DestinationConfig {
            api_endpoint,
            chain_id,
            wallet_url,
            wallet_name: optional(&raw.wallet_name)
                .unwrap_or(DEFAULT_WALLET_NAME)
                .to_string(),
            wallet_password: optional(&raw.wallet_password).map(str::to_string),
            signing_key: required("destination.signing_key", &raw.signing_key)?,
            token_contract,
            issuer,
            permission,
            symbol,
            decimals,
            expiration_secs,
        })
    }

    fn validate_relay(
        &self,
        source_decimals: u32,
        destination_decimals: u32,
    ) -> Result<RelaySettings, ConfigError> {
        let raw = &self.relay;

        let exchange_rate = required("relay.exchange_rate", &raw.exchange_rate)?;
        AmountConverter::new(source_decimals, destination_decimals, &exchange_rate)
            .map_err(|e| ConfigError::new("relay.exchange_rate", e.reason))?;

        let workers = positive("relay.workers", &raw.workers, DEFAULT_WORKERS)?;
        let queue_capacity =
            positive("relay.queue_capacity", &raw.queue_capacity, DEFAULT_QUEUE_CAPACITY)?;

        let defaults = RetryConfig::default();
        let dispatch_retry = retry_policy(
            ("relay.dispatch_max_retries", &raw.dispatch_max_retries),
            ("relay.dispatch_initial_backoff_ms", &raw.dispatch_initial_backoff_ms),
            ("relay.dispatch_max_backoff_ms", &raw.dispatch_max_backoff_ms),
            &defaults,
        )?;
        let reconnect = retry_policy(
            ("relay.reconnect_max_attempts", &raw.reconnect_max_attempts),
            ("relay.reconnect_initial_backoff_ms", &raw.reconnect_initial_backoff_ms),
            ("relay.reconnect_max_backoff_ms", &raw.reconnect_max_backoff_ms),
            &RetryConfig::reconnect_default(),
        )?;

        Ok(RelaySettings {
            exchange_rate,
            memo: raw.memo.clone().unwrap_or_else(|| DEFAULT_MEMO.to_string()),
            workers,
            queue_capacity,
            dispatch_retry,
            reconnect,
        })
    }
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required(field: &'static str, value: &Option<String>) -> Result<String, ConfigError> {
    optional(value)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::missing(field))
}

fn number<T>(field: &'static str, value: &Option<String>, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match (optional(value), default) {
        (Some(s), _) => s
            .parse()
            .map_err(|e: T::Err| ConfigError::new(field, format!("`{}`: {}", s, e))),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(ConfigError::missing(field)),
    }
}

fn positive<T>(field: &'static str, value: &Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let n = number(field, value, Some(default))?;
    if n <= T::default() {
        return Err(ConfigError::new(field, "must be positive"));
    }
    Ok(n)
}

fn retry_policy(
    max: (&'static str, &Option<String>),
    initial_ms: (&'static str, &Option<String>),
    max_backoff_ms: (&'static str, &Option<String>),
    defaults: &RetryConfig,
) -> Result<RetryConfig, ConfigError> {
    let max_retries = positive(max.0, max.1, defaults.max_retries)?;
    let initial = positive(
        initial_ms.0,
        initial_ms.1,
        defaults.initial_backoff.as_millis() as u64,
    )?;
    let ceiling = positive(
        max_backoff_ms.0,
        max_backoff_ms.1,
        defaults.max_backoff.as_millis() as u64,
    )?;
    if ceiling < initial {
        return Err(ConfigError::new(
            max_backoff_ms.0,
            "must not be smaller than the initial backoff",
        ));
    }
    Ok(RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(initial),
        max_backoff: Duration::from_millis(ceiling),
        backoff_multiplier: defaults.backoff_multiplier,
    })
}

fn http_url(field: &'static str, url: &str) -> Result<String, ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::new(field, "must be an http:// or https:// URL"))
    }
}

/// Parse an EVM address, enforcing the EIP-55 checksum when it is mixed-case
fn evm_address(field: &'static str, s: &str) -> Result<Address, ConfigError> {
    let hex_part = s.strip_prefix("0x").unwrap_or(s);
    if hex_part.len() != 40 {
        return Err(ConfigError::new(field, "must be 20 bytes of hex"));
    }
    let mixed_case = hex_part.chars().any(|c| c.is_ascii_lowercase())
        && hex_part.chars().any(|c| c.is_ascii_uppercase());
    if mixed_case {
        Address::parse_checksummed(s, None)
            .map_err(|_| ConfigError::new(field, "EIP-55 checksum mismatch"))
    } else {
        Address::from_str(s).map_err(|e| ConfigError::new(field, e.to_string()))
    }
}

#[derive(Clone)]
pub struct RelayConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub relay: RelaySettings,
    pub database_url: String,
    pub alert_webhook_url: Option<String>,
    pub api_bind_addr: Option<SocketAddr>,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("relay", &self.relay)
            .field("database_url", &"<redacted>")
            .field("alert_webhook_url", &self.alert_webhook_url.as_ref().map(|_| "<redacted>"))
            .field("api_bind_addr", &self.api_bind_addr)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub ws_url: String,
    pub contract: Address,
    pub abi_path: PathBuf,
    pub event_name: String,
    pub symbol: String,
    pub decimals: u32,
    /// First block to scan when the ledger has no cursor yet
    pub start_block: Option<u64>,
    pub max_block_range: u64,
    /// Live notifications buffered before the subscription counts as lagged
    pub subscription_buffer: usize,
}

#[derive(Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    pub api_endpoint: String,
    pub chain_id: String,
    pub wallet_url: String,
    pub wallet_name: String,
    pub wallet_password: Option<String>,
    /// Public key the wallet signs with
    pub signing_key: String,
    pub token_contract: String,
    pub issuer: String,
    pub permission: String,
    pub symbol: String,
    pub decimals: u32,
    pub expiration_secs: u32,
}

/// Custom Debug that redacts the wallet password.
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("api_endpoint", &self.api_endpoint)
            .field("chain_id", &self.chain_id)
            .field("wallet_url", &self.wallet_url)
            .field("wallet_name", &self.wallet_name)
            .field("wallet_password", &"<redacted>")
            .field("signing_key", &self.signing_key)
            .field("token_contract", &self.token_contract)
            .field("issuer", &self.issuer)
            .field("permission", &self.permission)
            .field("symbol", &self.symbol)
            .field("decimals", &self.decimals)
            .field("expiration_secs", &self.expiration_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Decimal string; parsed exactly by the amount converter
    pub exchange_rate: String,
    pub memo: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub dispatch_retry: RetryConfig,
    pub reconnect: RetryConfig,
}
