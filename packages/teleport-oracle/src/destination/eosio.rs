//! EOSIO client: builds and serializes `transfer` transactions, signs them
//! through keosd and pushes them to nodeos.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use eyre::{eyre, Result, WrapErr};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::name::{encode_name, encode_symbol, validate_account};
use super::{DestinationChain, SignedTransfer, TransferReceipt, TransferRequest};
use crate::config::DestinationConfig;
use crate::error::DispatchError;

/// nodeos exception names worth retrying with the same signed transaction
const TRANSIENT_EXCEPTIONS: &[&str] = &[
    "deadline_exception",
    "tx_cpu_usage_exceeded",
    "tx_net_usage_exceeded",
    "leeway_deadline_exception",
    "greylist_cpu_usage_exceeded",
    "greylist_net_usage_exceeded",
    "ro_trx_vm_oc_compile_temporary_failure",
];

const DUPLICATE_EXCEPTION: &str = "tx_duplicate";
const WALLET_UNLOCKED_EXCEPTION: &str = "wallet_unlocked_exception";

#[derive(Debug, Clone, Deserialize)]
struct ChainInfo {
    chain_id: String,
    head_block_time: String,
    last_irreversible_block_num: u64,
    last_irreversible_block_id: String,
}

/// TaPoS header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxHeader {
    expiration: u32,
    ref_block_num: u16,
    ref_block_prefix: u32,
}

impl TxHeader {
    fn from_info(info: &ChainInfo, expiration_secs: u32) -> Result<Self> {
        let head = NaiveDateTime::parse_from_str(&info.head_block_time, "%Y-%m-%dT%H:%M:%S%.f")
            .wrap_err_with(|| format!("Bad head_block_time {}", info.head_block_time))?;
        let expiration = (head + ChronoDuration::seconds(expiration_secs as i64))
            .and_utc()
            .timestamp();

        let block_id = hex::decode(&info.last_irreversible_block_id)
            .wrap_err("Bad last_irreversible_block_id")?;
        if block_id.len() < 12 {
            return Err(eyre!("last_irreversible_block_id too short"));
        }
        let prefix = [block_id[8], block_id[9], block_id[10], block_id[11]];

        Ok(Self {
            expiration: u32::try_from(expiration).wrap_err("Expiration out of range")?,
            ref_block_num: (info.last_irreversible_block_num & 0xffff) as u16,
            ref_block_prefix: u32::from_le_bytes(prefix),
        })
    }

    fn expiration_string(&self) -> String {
        chrono::DateTime::from_timestamp(self.expiration as i64, 0)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

/// Little-endian binary writer for the chain's serialization format
#[derive(Debug, Default)]
struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn varuint32(&mut self, mut v: u32) -> &mut Self {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if v == 0 {
                return self;
            }
        }
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.varuint32(b.len() as u32);
        self.buf.extend_from_slice(b);
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[derive(Debug, Clone, Serialize)]
struct PermissionLevel {
    actor: String,
    permission: String,
}

#[derive(Debug, Clone, Serialize)]
struct Action {
    account: String,
    name: String,
    authorization: Vec<PermissionLevel>,
    /// Hex of the packed action data
    data: String,
}

/// Parse a fixed-point amount into integer units at `decimals` precision
fn parse_units(amount: &str, decimals: u32) -> Result<i64, DispatchError> {
    let bad = |reason: &str| DispatchError::Permanent(format!("amount `{}`: {}", amount, reason));

    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if frac.len() != decimals as usize {
        return Err(bad("precision does not match the token"));
    }
    if whole.is_empty() || !whole.bytes().chain(frac.bytes()).all(|c| c.is_ascii_digit()) {
        return Err(bad("not a non-negative decimal"));
    }
    format!("{}{}", whole, frac)
        .parse::<i64>()
        .map_err(|_| bad("exceeds the asset range"))
}

/// Map a nodeos/keosd error body onto the retry classification
fn classify_chain_error(status: StatusCode, body: &Value) -> DispatchError {
    let name = body
        .pointer("/error/name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let what = body
        .pointer("/error/details/0/message")
        .or_else(|| body.pointer("/error/what"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = if name.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), what)
    } else {
        format!("{}: {}", name, what)
    };

    let transient_status = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    );
    if transient_status || TRANSIENT_EXCEPTIONS.contains(&name) {
        DispatchError::Transient(message)
    } else {
        DispatchError::Permanent(message)
    }
}

fn transport_error(e: reqwest::Error) -> DispatchError {
    // Anything that might not have reached the node is safe to retry:
    // a rebroadcast of the same transaction is rejected as a duplicate.
    DispatchError::Transient(format!("network error: {}", e))
}

/// Client bound to one issuer account and token contract
pub struct EosioClient {
    client: Client,
    api_url: String,
    wallet_url: String,
    wallet_name: String,
    wallet_password: Option<String>,
    signing_key: String,
    chain_id: String,
    token_contract: String,
    issuer: String,
    permission: String,
    symbol: String,
    decimals: u32,
    expiration_secs: u32,
}

impl EosioClient {
    pub fn new(config: &DestinationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_endpoint.trim_end_matches('/').to_string(),
            wallet_url: config.wallet_url.trim_end_matches('/').to_string(),
            wallet_name: config.wallet_name.clone(),
            wallet_password: config.wallet_password.clone(),
            signing_key: config.signing_key.clone(),
            chain_id: config.chain_id.clone(),
            token_contract: config.token_contract.clone(),
            issuer: config.issuer.clone(),
            permission: config.permission.clone(),
            symbol: config.symbol.clone(),
            decimals: config.decimals,
            expiration_secs: config.expiration_secs,
        })
    }

    /// Check the node is reachable and on the configured chain
    pub async fn check_chain(&self) -> Result<()> {
        let info = self
            .get_info()
            .await
            .map_err(|e| eyre!("Failed to query destination chain: {}", e))?;
        if !info.chain_id.eq_ignore_ascii_case(&self.chain_id) {
            return Err(eyre!(
                "Destination chain id mismatch: node reports {}, configured {}",
                info.chain_id,
                self.chain_id
            ));
        }
        info!(
            chain_id = %info.chain_id,
            lib = info.last_irreversible_block_num,
            "Destination chain reachable"
        );
        Ok(())
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, DispatchError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({ "message": "unparseable response body" }));

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_chain_error(status, &body))
        }
    }

    async fn get_info(&self) -> Result<ChainInfo, DispatchError> {
        let url = format!("{}/v1/chain/get_info", self.api_url);
        let body = self.post(&url, &json!({})).await?;
        serde_json::from_value(body)
            .map_err(|e| DispatchError::Transient(format!("malformed get_info response: {}", e)))
    }

    async fn unlock_wallet(&self) -> Result<(), DispatchError> {
        let Some(password) = &self.wallet_password else {
            return Ok(());
        };
        let url = format!("{}/v1/wallet/unlock", self.wallet_url);
        match self.post(&url, &json!([self.wallet_name, password])).await {
            Ok(_) => {
                debug!(wallet = %self.wallet_name, "Wallet unlocked");
                Ok(())
            }
            Err(DispatchError::Permanent(msg)) if msg.starts_with(WALLET_UNLOCKED_EXCEPTION) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn transfer_data(&self, to_name: u64, units: i64, memo: &str) -> Result<Vec<u8>, DispatchError> {
        let from = encode_name(&self.issuer)
            .map_err(|e| DispatchError::Permanent(e.to_string()))?;
        let symbol = encode_symbol(self.decimals as u8, &self.symbol)
            .map_err(|e| DispatchError::Permanent(e.to_string()))?;

        Ok(Packer::default()
            .u64(from)
            .u64(to_name)
            .i64(units)
            .u64(symbol)
            .bytes(memo.as_bytes())
            .finish())
    }

    fn pack_transaction(&self, header: &TxHeader, data: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let names = [
            encode_name(&self.token_contract),
            encode_name("transfer"),
            encode_name(&self.issuer),
            encode_name(&self.permission),
        ];
        let mut encoded = [0u64; 4];
        for (slot, name) in encoded.iter_mut().zip(names) {
            *slot = name.map_err(|e| DispatchError::Permanent(e.to_string()))?;
        }
        let [account, action, actor, permission] = encoded;

        let mut packer = Packer::default();
        packer
            .u32(header.expiration)
            .u16(header.ref_block_num)
            .u32(header.ref_block_prefix)
            .varuint32(0) // max_net_usage_words
            .u8(0) // max_cpu_usage_ms
            .varuint32(0) // delay_sec
            .varuint32(0) // context_free_actions
            .varuint32(1)
            .u64(account)
            .u64(action)
            .varuint32(1)
            .u64(actor)
            .u64(permission)
            .bytes(data)
            .varuint32(0); // transaction_extensions
        Ok(packer.finish())
    }

    fn transaction_json(&self, header: &TxHeader, data: &[u8]) -> Value {
        let action = Action {
            account: self.token_contract.clone(),
            name: "transfer".to_string(),
            authorization: vec![PermissionLevel {
                actor: self.issuer.clone(),
                permission: self.permission.clone(),
            }],
            data: hex::encode(data),
        };
        json!({
            "expiration": header.expiration_string(),
            "ref_block_num": header.ref_block_num,
            "ref_block_prefix": header.ref_block_prefix,
            "max_net_usage_words": 0,
            "max_cpu_usage_ms": 0,
            "delay_sec": 0,
            "context_free_actions": [],
            "actions": [action],
            "transaction_extensions": [],
            "signatures": [],
            "context_free_data": [],
        })
    }

    async fn sign(&self, tx: &Value) -> Result<Vec<String>, DispatchError> {
        let url = format!("{}/v1/wallet/sign_transaction", self.wallet_url);
        let body = self
            .post(&url, &json!([tx, [self.signing_key], self.chain_id]))
            .await?;
        let signatures: Vec<String> = body
            .get("signatures")
            .and_then(Value::as_array)
            .map(|sigs| {
                sigs.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if signatures.is_empty() {
            return Err(DispatchError::Permanent(
                "wallet returned no signatures".to_string(),
            ));
        }
        Ok(signatures)
    }
}

#[async_trait]
impl DestinationChain for EosioClient {
    async fn prepare(&self, request: &TransferRequest) -> Result<SignedTransfer, DispatchError> {
        let to = validate_account(&request.to)
            .map_err(|e| DispatchError::Permanent(format!("malformed destination account: {}", e)))?;
        let units = parse_units(&request.amount, self.decimals)?;
        let data = self.transfer_data(to, units, &request.memo)?;

        let info = self.get_info().await?;
        let header = TxHeader::from_info(&info, self.expiration_secs)
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        let packed = self.pack_transaction(&header, &data)?;
        let transaction_id = hex::encode(Sha256::digest(&packed));

        self.unlock_wallet().await?;
        let signatures = self.sign(&self.transaction_json(&header, &data)).await?;

        debug!(
            event_id = %request.event_id,
            tx_id = %transaction_id,
            quantity = %format!("{} {}", request.amount, self.symbol),
            to = %request.to,
            "Signed transfer"
        );

        Ok(SignedTransfer {
            transaction_id,
            signatures,
            packed_trx: hex::encode(packed),
        })
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<TransferReceipt, DispatchError> {
        let url = format!("{}/v1/chain/push_transaction", self.api_url);
        let body = json!({
            "signatures": signed.signatures,
            "compression": "none",
            "packed_context_free_data": "",
            "packed_trx": signed.packed_trx,
        });

        match self.post(&url, &body).await {
            Ok(response) => {
                let status = response
                    .pointer("/processed/receipt/status")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if status != "executed" {
                    return Err(DispatchError::Permanent(format!(
                        "transaction not executed (status `{}`)",
                        status
                    )));
                }
                let transaction_id = response
                    .get("transaction_id")
                    .and_then(Value::as_str)
                    .unwrap_or(&signed.transaction_id)
                    .to_string();
                Ok(TransferReceipt {
                    transaction_id,
                    block_num: response.pointer("/processed/block_num").and_then(Value::as_u64),
                    duplicate: false,
                })
            }
            Err(DispatchError::Permanent(msg)) if msg.starts_with(DUPLICATE_EXCEPTION) => {
                warn!(
                    tx_id = %signed.transaction_id,
                    "Destination already has this transaction, treating as issued"
                );
                Ok(TransferReceipt {
                    transaction_id: signed.transaction_id.clone(),
                    block_num: None,
                    duplicate: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}
