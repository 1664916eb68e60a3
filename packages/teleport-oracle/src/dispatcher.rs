//! Transfer dispatcher
//!
//! Submits one transfer with bounded retries. The transaction is built and
//! signed once; transient failures rebroadcast the same signed bytes so a
//! broadcast that actually landed cannot turn into a second issuance.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::destination::{DestinationChain, SignedTransfer, TransferReceipt, TransferRequest};
use crate::error::DispatchError;
use crate::metrics;
use crate::retry::{RetryAction, RetryConfig, RetryContext};

/// Successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub receipt: TransferReceipt,
    pub attempts: u32,
}

/// Terminal dispatch failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub error: DispatchError,
    pub attempts: u32,
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

pub struct Dispatcher {
    destination: Arc<dyn DestinationChain>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(destination: Arc<dyn DestinationChain>, retry: RetryConfig) -> Self {
        Self { destination, retry }
    }

    async fn attempt(
        &self,
        request: &TransferRequest,
        signed: &mut Option<SignedTransfer>,
    ) -> Result<TransferReceipt, DispatchError> {
        let tx = match signed.take() {
            Some(tx) => tx,
            None => self.destination.prepare(request).await?,
        };
        let result = self.destination.broadcast(&tx).await;
        *signed = Some(tx);
        result
    }

    /// Submit the transfer and wait for a terminal outcome
    pub async fn dispatch(&self, request: &TransferRequest) -> Result<Dispatched, DispatchFailure> {
        let started = Instant::now();
        let mut ctx = RetryContext::with_config(self.retry.clone());
        let mut signed: Option<SignedTransfer> = None;

        loop {
            match self.attempt(request, &mut signed).await {
                Ok(receipt) => {
                    let attempts = ctx.attempt + 1;
                    metrics::DISPATCH_ATTEMPTS.with_label_values(&["success"]).inc();
                    metrics::DISPATCH_DURATION.observe(started.elapsed().as_secs_f64());
                    info!(
                        event_id = %request.event_id,
                        tx_id = %receipt.transaction_id,
                        attempts,
                        duplicate = receipt.duplicate,
                        "Transfer issued"
                    );
                    return Ok(Dispatched { receipt, attempts });
                }
                Err(e) => {
                    let label = if e.is_transient() { "transient" } else { "permanent" };
                    metrics::DISPATCH_ATTEMPTS.with_label_values(&[label]).inc();
                    ctx.record_failure(e);
                }
            }

            match ctx.next_action() {
                RetryAction::RetryAfter(backoff) => {
                    warn!(
                        event_id = %request.event_id,
                        attempt = ctx.attempt,
                        max = self.retry.max_retries,
                        ?backoff,
                        error = ?ctx.last_error,
                        "Transfer attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                RetryAction::GiveUp => {
                    metrics::DISPATCH_DURATION.observe(started.elapsed().as_secs_f64());
                    let error = ctx
                        .last_error
                        .take()
                        .unwrap_or_else(|| DispatchError::Permanent("no attempt made".to_string()));
                    return Err(DispatchFailure {
                        error,
                        attempts: ctx.attempt,
                    });
                }
            }
        }
    }
}
