//! EVM source chain over a websocket provider

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::pubsub::{ConnectionHandle, PubSubConnect, PubSubFrontend, RawSubscription};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{TransportErrorKind, TransportResult};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::{EventStream, SourceChain};
use crate::config::SourceConfig;
use crate::error::SubscriptionError;
use crate::types::{EventId, SourceEvent};

/// Event parameter carrying the raw token amount
const AMOUNT_PARAM: &str = "amount";
/// Event parameter carrying the destination account
const NOTE_PARAM: &str = "note";

/// Load the contract ABI from a build artifact (`abi` field) or a bare ABI array
pub fn load_abi(path: &Path) -> Result<JsonAbi> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read ABI artifact {}", path.display()))?;
    parse_abi(&raw)
}

pub fn parse_abi(raw: &str) -> Result<JsonAbi> {
    let value: serde_json::Value =
        serde_json::from_str(raw).wrap_err("ABI artifact is not valid JSON")?;
    let abi = match value {
        serde_json::Value::Object(mut artifact) => artifact
            .remove("abi")
            .ok_or_else(|| eyre!("ABI artifact has no `abi` field"))?,
        array @ serde_json::Value::Array(_) => array,
        _ => return Err(eyre!("ABI artifact must be an object or an array")),
    };
    serde_json::from_value(abi).wrap_err("Failed to parse contract ABI")
}

/// Resolve the event to watch and check it carries the fields the relay needs
pub fn resolve_event(abi: &JsonAbi, name: &str) -> Result<Event> {
    let event = abi
        .event(name)
        .and_then(|overloads| overloads.first())
        .cloned()
        .ok_or_else(|| eyre!("Event `{}` not found in contract ABI", name))?;

    for (param, ty) in [(AMOUNT_PARAM, "uint"), (NOTE_PARAM, "string")] {
        let input = event
            .inputs
            .iter()
            .find(|i| i.name == param)
            .ok_or_else(|| eyre!("Event `{}` has no `{}` parameter", name, param))?;
        if input.indexed || !input.ty.starts_with(ty) {
            return Err(eyre!(
                "Event `{}` parameter `{}` must be a non-indexed {}",
                name,
                param,
                ty
            ));
        }
    }
    Ok(event)
}

/// Decode one log into a source event
pub fn decode_log(event: &Event, log: &Log) -> Result<SourceEvent, SubscriptionError> {
    let decoded = event
        .decode_log(log.data(), true)
        .map_err(|e| SubscriptionError::Decode(e.to_string()))?;

    let (block_number, log_index, tx_hash) =
        match (log.block_number, log.log_index, log.transaction_hash) {
            (Some(b), Some(i), Some(h)) => (b, i, h),
            _ => {
                return Err(SubscriptionError::Decode(
                    "log is missing block number, log index or transaction hash".to_string(),
                ))
            }
        };

    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut amount = None;
    let mut note = None;
    for input in &event.inputs {
        let value = if input.indexed {
            indexed.next()
        } else {
            body.next()
        };
        match (input.name.as_str(), value) {
            (AMOUNT_PARAM, Some(DynSolValue::Uint(v, _))) => amount = Some(v.to_string()),
            (NOTE_PARAM, Some(DynSolValue::String(s))) => note = Some(s),
            _ => {}
        }
    }

    let id = EventId::new(block_number, log_index, format!("{:#x}", tx_hash));
    match (amount, note) {
        (Some(amount), Some(note)) => Ok(SourceEvent { id, amount, note }),
        _ => Err(SubscriptionError::Decode(format!(
            "{}: event is missing `{}` or `{}`",
            id, AMOUNT_PARAM, NOTE_PARAM
        ))),
    }
}

fn transport_err(e: impl std::fmt::Display) -> SubscriptionError {
    SubscriptionError::Transport(e.to_string())
}

/// Websocket connector without background reconnects
///
/// alloy's pubsub service would otherwise reconnect and re-subscribe on
/// its own, keeping the same subscription stream open across an outage
/// and hiding the gap from the subscriber. Failing `try_reconnect` shuts
/// the service down instead, which closes every subscription channel so
/// the stream ends and the subscriber replays from its cursor.
#[derive(Debug, Clone)]
struct SingleSessionWs(WsConnect);

impl PubSubConnect for SingleSessionWs {
    fn is_local(&self) -> bool {
        self.0.is_local()
    }

    async fn connect(&self) -> TransportResult<ConnectionHandle> {
        self.0.connect().await
    }

    async fn try_reconnect(&self) -> TransportResult<ConnectionHandle> {
        Err(TransportErrorKind::custom_str(
            "source websocket dropped; subscriber re-subscribes with gap replay",
        ))
    }
}

/// Turn raw subscription notifications into decoded events
///
/// A lagged receiver has lost notifications, so it surfaces as a transport
/// error and ends the stream; the subscriber then replays the gap.
fn log_stream(subscription: RawSubscription, event: Event) -> EventStream {
    stream::unfold(Some(subscription), move |state| {
        let event = event.clone();
        async move {
            let mut subscription = state?;
            loop {
                let raw = match subscription.recv().await {
                    Ok(raw) => raw,
                    Err(RecvError::Lagged(missed)) => {
                        let err = SubscriptionError::Transport(format!(
                            "subscription lagged, {} notifications dropped",
                            missed
                        ));
                        return Some((Err(err), None));
                    }
                    Err(RecvError::Closed) => return None,
                };
                let log: Log = match serde_json::from_str(raw.get()) {
                    Ok(log) => log,
                    Err(e) => {
                        let err = SubscriptionError::Decode(format!("malformed log: {}", e));
                        return Some((Err(err), Some(subscription)));
                    }
                };
                if log.removed {
                    warn!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        "Skipping removed log"
                    );
                    continue;
                }
                return Some((decode_log(&event, &log), Some(subscription)));
            }
        }
    })
    .boxed()
}

/// Websocket-backed EVM source bound to one contract and event
pub struct EvmSource {
    ws_url: String,
    contract: Address,
    event: Event,
    subscription_buffer: usize,
    /// Replaced on every `subscribe` after the first
    provider: RwLock<RootProvider<PubSubFrontend>>,
    /// Set while the connection opened by `connect` has not been subscribed on
    fresh: AtomicBool,
}

impl EvmSource {
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let abi = load_abi(&config.abi_path)?;
        let event = resolve_event(&abi, &config.event_name)?;
        let provider = Self::open(&config.ws_url, config.subscription_buffer)
            .await
            .wrap_err("Failed to connect to source websocket endpoint")?;

        info!(
            contract = %config.contract,
            event = %event.signature(),
            selector = %event.selector(),
            "EVM source connected"
        );

        Ok(Self {
            ws_url: config.ws_url.clone(),
            contract: config.contract,
            event,
            subscription_buffer: config.subscription_buffer,
            provider: RwLock::new(provider),
            fresh: AtomicBool::new(true),
        })
    }

    async fn open(
        url: &str,
        buffer: usize,
    ) -> Result<RootProvider<PubSubFrontend>, SubscriptionError> {
        let client = ClientBuilder::default()
            .pubsub(SingleSessionWs(WsConnect::new(url)))
            .await
            .map_err(transport_err)?;
        client.set_channel_size(buffer);
        Ok(ProviderBuilder::new().on_client(client))
    }

    fn provider(&self) -> RootProvider<PubSubFrontend> {
        self.provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn filter(&self) -> Filter {
        Filter::new()
            .address(self.contract)
            .event_signature(self.event.selector())
    }
}

#[async_trait]
impl SourceChain for EvmSource {
    async fn subscribe(&self) -> Result<EventStream, SubscriptionError> {
        // Each later session gets its own connection; the old one is dead
        let provider = if self.fresh.swap(false, Ordering::SeqCst) {
            self.provider()
        } else {
            Self::open(&self.ws_url, self.subscription_buffer).await?
        };
        let subscription = provider
            .subscribe_logs(&self.filter())
            .await
            .map_err(transport_err)?;
        *self.provider.write().unwrap_or_else(|e| e.into_inner()) = provider;

        Ok(log_stream(subscription.into_raw(), self.event.clone()))
    }

    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, SubscriptionError> {
        let filter = self.filter().from_block(from_block).to_block(to_block);
        let logs = self
            .provider()
            .get_logs(&filter)
            .await
            .map_err(transport_err)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| !l.removed) {
            match decode_log(&self.event, log) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!(error = %e, "Skipping undecodable log during replay"),
            }
        }
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }

    async fn latest_block(&self) -> Result<u64, SubscriptionError> {
        self.provider()
            .get_block_number()
            .await
            .map_err(transport_err)
    }
}
