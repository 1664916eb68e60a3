//! In-process source and destination doubles for pipeline tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::alert::{Alert, AlertSink};
use crate::destination::{DestinationChain, SignedTransfer, TransferReceipt, TransferRequest};
use crate::error::{DispatchError, SubscriptionError};
use crate::source::{EventStream, SourceChain};
use crate::types::{EventId, SourceEvent};

pub fn source_event(block: u64, index: u64, amount: &str, note: &str) -> SourceEvent {
    SourceEvent {
        id: EventId::new(block, index, format!("0x{:064x}", block)),
        amount: amount.to_string(),
        note: note.to_string(),
    }
}

/// One scripted connection: the head block seen at subscribe time and the
/// events delivered live before the transport drops
#[derive(Debug, Clone)]
pub struct Session {
    head: u64,
    live: Vec<SourceEvent>,
    hang: bool,
    /// Events the stream keeps yielding after reporting a lag
    after_lag: Option<Vec<SourceEvent>>,
}

impl Session {
    pub fn new(head: u64, live: Vec<SourceEvent>) -> Self {
        Self {
            head,
            live,
            hang: false,
            after_lag: None,
        }
    }

    /// Stream that reports lost notifications mid-flight and then stays
    /// open, as a transport that reconnected underneath the subscription
    pub fn lagging(head: u64, before: Vec<SourceEvent>, after: Vec<SourceEvent>) -> Self {
        Self {
            head,
            live: before,
            hang: true,
            after_lag: Some(after),
        }
    }

    /// Connection that never drops
    pub fn hanging(head: u64) -> Self {
        Self::hanging_with(head, vec![])
    }

    pub fn hanging_with(head: u64, live: Vec<SourceEvent>) -> Self {
        Self {
            head,
            live,
            hang: true,
            after_lag: None,
        }
    }
}

/// Scripted source chain; connecting after the last session fails
pub struct MockSource {
    history: Vec<SourceEvent>,
    sessions: Mutex<VecDeque<Session>>,
    head: Mutex<u64>,
    replays: Mutex<Vec<(u64, u64)>>,
    subscribe_calls: AtomicU32,
}

impl MockSource {
    pub fn new(history: Vec<SourceEvent>, sessions: Vec<Session>) -> Self {
        Self {
            history,
            sessions: Mutex::new(sessions.into()),
            head: Mutex::new(0),
            replays: Mutex::new(Vec::new()),
            subscribe_calls: AtomicU32::new(0),
        }
    }

    pub fn replay_ranges(&self) -> Vec<(u64, u64)> {
        self.replays.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceChain for MockSource {
    async fn subscribe(&self) -> Result<EventStream, SubscriptionError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SubscriptionError::Transport("connection refused".to_string()))?;
        *self.head.lock().unwrap() = session.head;

        let mut live: EventStream = stream::iter(session.live.into_iter().map(Ok)).boxed();
        if let Some(after) = session.after_lag {
            let lagged = SubscriptionError::Transport("subscription lagged".to_string());
            live = live
                .chain(stream::iter(std::iter::once(Err(lagged))))
                .chain(stream::iter(after.into_iter().map(Ok)))
                .boxed();
        }
        if session.hang {
            Ok(live.chain(stream::pending()).boxed())
        } else {
            Ok(live)
        }
    }

    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, SubscriptionError> {
        self.replays.lock().unwrap().push((from_block, to_block));
        let mut events: Vec<_> = self
            .history
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.id.block_number))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }

    async fn latest_block(&self) -> Result<u64, SubscriptionError> {
        Ok(*self.head.lock().unwrap())
    }
}

/// Destination double that behaves like a chain with duplicate detection
#[derive(Default)]
pub struct MockDestination {
    prepare_errors: Mutex<VecDeque<DispatchError>>,
    broadcast_errors: Mutex<VecDeque<DispatchError>>,
    always: Option<DispatchError>,
    recipient_errors: HashMap<String, DispatchError>,
    prepared: Mutex<HashMap<String, TransferRequest>>,
    prepare_calls: AtomicU32,
    broadcasts: Mutex<Vec<String>>,
    issued: Mutex<Vec<(String, TransferRequest)>>,
    delay: Option<Duration>,
}

impl MockDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prepare_errors(self, errors: Vec<DispatchError>) -> Self {
        *self.prepare_errors.lock().unwrap() = errors.into();
        self
    }

    /// Fail the next broadcasts in order, then succeed
    pub fn with_broadcast_errors(self, errors: Vec<DispatchError>) -> Self {
        *self.broadcast_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn always_failing(mut self, error: DispatchError) -> Self {
        self.always = Some(error);
        self
    }

    /// Every broadcast to `to` fails with `error`
    pub fn failing_for(mut self, to: &str, error: DispatchError) -> Self {
        self.recipient_errors.insert(to.to_string(), error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prepare_calls(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    /// Transaction ids of every broadcast, in order
    pub fn broadcast_tx_ids(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }

    /// Transfers that landed on the destination
    pub fn issued(&self) -> Vec<TransferRequest> {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn broadcasts_for(&self, event_id: &str) -> usize {
        let prepared = self.prepared.lock().unwrap();
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|id| prepared.get(*id).is_some_and(|r| r.event_id == event_id))
            .count()
    }
}

#[async_trait]
impl DestinationChain for MockDestination {
    async fn prepare(&self, request: &TransferRequest) -> Result<SignedTransfer, DispatchError> {
        let n = self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.prepare_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let transaction_id = format!("tx{:04}", n);
        self.prepared
            .lock()
            .unwrap()
            .insert(transaction_id.clone(), request.clone());
        Ok(SignedTransfer {
            transaction_id,
            signatures: vec!["SIG_K1_mock".to_string()],
            packed_trx: String::new(),
        })
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<TransferReceipt, DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.broadcasts
            .lock()
            .unwrap()
            .push(signed.transaction_id.clone());

        let request = self
            .prepared
            .lock()
            .unwrap()
            .get(&signed.transaction_id)
            .cloned()
            .ok_or_else(|| DispatchError::Permanent("unknown transaction".to_string()))?;

        if let Some(err) = self.recipient_errors.get(&request.to) {
            return Err(err.clone());
        }
        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        if let Some(err) = self.broadcast_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut issued = self.issued.lock().unwrap();
        let duplicate = issued.iter().any(|(id, _)| id == &signed.transaction_id);
        if !duplicate {
            issued.push((signed.transaction_id.clone(), request));
        }
        Ok(TransferReceipt {
            transaction_id: signed.transaction_id.clone(),
            block_num: Some(1),
            duplicate,
        })
    }
}

/// Alert sink that keeps what it was sent
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Poll until `check` holds or the timeout passes
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
