//! Destination chain collaborator
//!
//! Submitting a transfer is split in two so a retry can rebroadcast the
//! exact same signed transaction: if an earlier broadcast actually landed,
//! the chain rejects the copy as a duplicate instead of issuing twice.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DispatchError;

pub mod eosio;
pub mod name;

pub use eosio::EosioClient;

/// One `transfer` action on the destination token contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    /// Ledger key of the source event this transfer settles
    pub event_id: String,
    pub to: String,
    /// Fixed-point amount with exactly the destination precision
    pub amount: String,
    pub memo: String,
}

/// A signed transaction ready to broadcast (possibly more than once)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub transaction_id: String,
    pub signatures: Vec<String>,
    /// Hex of the serialized transaction
    pub packed_trx: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transaction_id: String,
    pub block_num: Option<u64>,
    /// The chain already had this transaction (an earlier attempt landed)
    pub duplicate: bool,
}

#[async_trait]
pub trait DestinationChain: Send + Sync {
    /// Build and sign the transfer; no network side effects on the ledger
    async fn prepare(&self, request: &TransferRequest) -> Result<SignedTransfer, DispatchError>;

    /// Push a signed transaction and wait for a terminal outcome
    async fn broadcast(&self, signed: &SignedTransfer) -> Result<TransferReceipt, DispatchError>;
}
