//! Source event subscription with reconnect and gap replay
//!
//! The subscriber forwards every decoded teleport event into a bounded
//! channel in transport order. After a disconnect it re-subscribes and
//! replays `[cursor, head]` from the chain's log history before resuming
//! live delivery, so an outage never silently drops an event. Replay
//! re-delivers the cursor block, which the relay ledger absorbs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SubscriptionError;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::SourceEvent;

pub mod evm;

pub use evm::EvmSource;

/// Live event stream; ends (or yields an error) when the transport drops
pub type EventStream = BoxStream<'static, Result<SourceEvent, SubscriptionError>>;

/// Source chain collaborator bound to one contract, ABI and event name
#[async_trait]
pub trait SourceChain: Send + Sync {
    /// Open a live subscription to the bound event
    async fn subscribe(&self) -> Result<EventStream, SubscriptionError>;

    /// Historical events in an inclusive block range, in chain order
    async fn query_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, SubscriptionError>;

    /// Current head block number
    async fn latest_block(&self) -> Result<u64, SubscriptionError>;
}

/// Why a single connection session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Transport dropped; reconnect
    Disconnected,
    /// Shutdown requested or the consumer went away
    Stopped,
}

/// A session that lasted this long counts as healthy even if it delivered nothing
const MIN_HEALTHY_SESSION: Duration = Duration::from_secs(30);

/// Maintains the subscription and delivers events downstream
pub struct EventSubscriber {
    source: Arc<dyn SourceChain>,
    reconnect: RetryConfig,
    /// Last delivered block; replay starts here (inclusive)
    cursor: Option<u64>,
    /// Upper bound on the block span of a single replay query
    max_block_range: u64,
    /// Events delivered by the current session
    session_deliveries: u64,
}

impl EventSubscriber {
    pub fn new(source: Arc<dyn SourceChain>, reconnect: RetryConfig) -> Self {
        Self {
            source,
            reconnect,
            cursor: None,
            max_block_range: 5_000,
            session_deliveries: 0,
        }
    }

    /// Resume from a persisted or configured block instead of the head
    pub fn with_start_block(mut self, block: Option<u64>) -> Self {
        self.cursor = block;
        self
    }

    pub fn with_max_block_range(mut self, range: u64) -> Self {
        self.max_block_range = range.max(1);
        self
    }

    /// Run until cancelled, the consumer closes, or reconnects are exhausted
    ///
    /// Every session end is followed by a backoff. Sessions that drop before
    /// delivering anything or staying up for a while count as failures, so
    /// an endpoint that accepts and immediately closes still escalates.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SubscriptionError> {
        let mut failures = 0u32;

        info!(start_block = ?self.cursor, "Source subscriber starting");

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.session_deliveries = 0;
            let started = Instant::now();
            let result = self.session(&tx, &cancel).await;
            let healthy =
                self.session_deliveries > 0 || started.elapsed() >= MIN_HEALTHY_SESSION;

            let last_error = match result {
                Ok(SessionEnd::Stopped) => {
                    info!(cursor = ?self.cursor, "Source subscriber stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected) if healthy => {
                    failures = 0;
                    None
                }
                Ok(SessionEnd::Disconnected) => {
                    failures += 1;
                    Some("subscription dropped before delivering any event".to_string())
                }
                Err(e) => {
                    failures += 1;
                    Some(e.to_string())
                }
            };
            metrics::RECONNECTS.inc();

            if let Some(last_error) = &last_error {
                if !self.reconnect.should_retry(failures) {
                    error!(
                        attempts = failures,
                        error = %last_error,
                        "Source re-subscription failed repeatedly, giving up"
                    );
                    return Err(SubscriptionError::ReconnectExhausted {
                        attempts: failures,
                        last_error: last_error.clone(),
                    });
                }
            }

            let backoff = self.reconnect.backoff_for_attempt(failures.saturating_sub(1));
            match &last_error {
                None => warn!(
                    cursor = ?self.cursor,
                    ?backoff,
                    "Source subscription disconnected, re-subscribing with gap replay"
                ),
                Some(e) => warn!(
                    attempt = failures,
                    max = self.reconnect.max_retries,
                    ?backoff,
                    error = %e,
                    "Source subscription failed, retrying after backoff"
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One connection: subscribe, replay the gap, then stream live events
    async fn session(
        &mut self,
        tx: &mpsc::Sender<SourceEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SubscriptionError> {
        // Subscribe before reading the head so nothing lands between replay and live
        let mut stream = self.source.subscribe().await?;
        let head = self.source.latest_block().await?;

        match self.cursor {
            Some(from) if from <= head => {
                if !self.replay(from, head, tx).await? {
                    return Ok(SessionEnd::Stopped);
                }
            }
            Some(_) => {}
            None => {
                debug!(head, "No replay cursor, starting from head");
                self.cursor = Some(head);
            }
        }

        info!(head, cursor = ?self.cursor, "Source subscription established");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Stopped),
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if !self.deliver(event, tx).await {
                            return Ok(SessionEnd::Stopped);
                        }
                    }
                    Some(Err(SubscriptionError::Decode(reason))) => {
                        warn!(error = %reason, "Skipping undecodable source log");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Source stream error");
                        return Ok(SessionEnd::Disconnected);
                    }
                    None => return Ok(SessionEnd::Disconnected),
                },
            }
        }
    }

    /// Returns false if the consumer went away mid-replay
    async fn replay(
        &mut self,
        from_block: u64,
        to_block: u64,
        tx: &mpsc::Sender<SourceEvent>,
    ) -> Result<bool, SubscriptionError> {
        let mut current_from = from_block;
        let mut replayed = 0usize;

        while current_from <= to_block {
            let current_to = current_from
                .saturating_add(self.max_block_range - 1)
                .min(to_block);
            let events = self.source.query_events(current_from, current_to).await?;
            for event in events {
                replayed += 1;
                if !self.deliver(event, tx).await {
                    return Ok(false);
                }
            }
            current_from = current_to + 1;
        }

        info!(from_block, to_block, replayed, "Gap replay complete");
        Ok(true)
    }

    async fn deliver(&mut self, event: SourceEvent, tx: &mpsc::Sender<SourceEvent>) -> bool {
        let block = event.id.block_number;
        debug!(event_id = %event.id, block, "Delivering source event");
        if tx.send(event).await.is_err() {
            return false;
        }
        self.cursor = Some(self.cursor.map_or(block, |c| c.max(block)));
        self.session_deliveries += 1;
        metrics::LAST_DELIVERED_BLOCK.set(block as i64);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{source_event, MockSource, Session};

    fn fast_reconnect(max: u32) -> RetryConfig {
        RetryConfig {
            max_retries: max,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<SourceEvent>) -> Vec<SourceEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_delivers_live_events_in_order() {
        let events: Vec<_> = (1..=3).map(|b| source_event(b, 0, "1", "alice")).collect();
        let source = Arc::new(MockSource::new(
            events.clone(),
            vec![Session::new(0, events.clone())],
        ));
        let (tx, rx) = mpsc::channel(16);
        let subscriber = EventSubscriber::new(source, fast_reconnect(2));

        let result = subscriber.run(tx, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SubscriptionError::ReconnectExhausted { attempts: 2, .. })
        ));
        assert_eq!(collect(rx).await, events);
    }

    #[tokio::test]
    async fn test_replays_outage_window_after_disconnect() {
        let history: Vec<_> = (1..=6).map(|b| source_event(b, 0, "1", "alice")).collect();
        let source = Arc::new(MockSource::new(
            history.clone(),
            vec![
                // first session sees blocks 1-2 live, then drops
                Session::new(0, history[0..2].to_vec()),
                // blocks 3-5 were emitted during the outage; 6 arrives live
                Session::new(5, history[5..6].to_vec()),
            ],
        ));
        let (tx, rx) = mpsc::channel(16);
        let subscriber = EventSubscriber::new(source.clone(), fast_reconnect(1));

        let _ = subscriber.run(tx, CancellationToken::new()).await;
        let delivered = collect(rx).await;

        for ev in &history {
            assert!(delivered.contains(ev), "missing {}", ev.id);
        }
        // replay restarts at the last delivered block (2)
        assert_eq!(source.replay_ranges(), vec![(2, 5)]);
    }

    #[tokio::test]
    async fn test_replay_is_chunked_by_block_range() {
        let history: Vec<_> = (10..=20).map(|b| source_event(b, 0, "1", "bob")).collect();
        let source = Arc::new(MockSource::new(
            history.clone(),
            vec![Session::new(20, vec![])],
        ));
        let (tx, rx) = mpsc::channel(64);
        let subscriber = EventSubscriber::new(source.clone(), fast_reconnect(1))
            .with_start_block(Some(10))
            .with_max_block_range(4);

        let _ = subscriber.run(tx, CancellationToken::new()).await;

        assert_eq!(collect(rx).await, history);
        assert_eq!(source.replay_ranges(), vec![(10, 13), (14, 17), (18, 20)]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_cleanly() {
        let source = Arc::new(MockSource::new(vec![], vec![Session::hanging(0)]));
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let subscriber = EventSubscriber::new(source, fast_reconnect(3));

        let handle = tokio::spawn(subscriber.run(tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("subscriber did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failures_escalate() {
        let source = Arc::new(MockSource::new(vec![], vec![]));
        let (tx, _rx) = mpsc::channel(4);
        let subscriber = EventSubscriber::new(source.clone(), fast_reconnect(4));

        let err = subscriber
            .run(tx, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SubscriptionError::ReconnectExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.subscribe_calls(), 4);
    }

    #[tokio::test]
    async fn test_lagged_stream_triggers_gap_replay() {
        let history: Vec<_> = (1..=6).map(|b| source_event(b, 0, "1", "carol")).collect();
        let source = Arc::new(MockSource::new(
            history.clone(),
            vec![
                // blocks 2-4 are lost by the lag; the stream itself stays open
                Session::lagging(1, history[0..1].to_vec(), history[4..6].to_vec()),
                Session::hanging(6),
            ],
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let subscriber = EventSubscriber::new(source.clone(), fast_reconnect(2));
        let handle = tokio::spawn(subscriber.run(tx, cancel.clone()));

        let mut delivered = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !history.iter().all(|ev| delivered.contains(ev)) {
                delivered.push(rx.recv().await.expect("subscriber stopped early"));
            }
        })
        .await
        .expect("lagged events were never replayed");
        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());

        assert_eq!(source.subscribe_calls(), 2);
        // the cursor (block 1) is where the lost window starts
        assert_eq!(source.replay_ranges(), vec![(1, 6)]);
    }

    #[tokio::test]
    async fn test_sessions_dropping_immediately_escalate_with_backoff() {
        let sessions = (0..200).map(|_| Session::new(0, vec![])).collect();
        let source = Arc::new(MockSource::new(vec![], sessions));
        let (tx, _rx) = mpsc::channel(4);
        let reconnect = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        let subscriber = EventSubscriber::new(source.clone(), reconnect);

        let started = Instant::now();
        let err = subscriber
            .run(tx, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SubscriptionError::ReconnectExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("before delivering"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.subscribe_calls(), 3);
        // 20ms + 40ms between the three sessions
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_healthy_session_resets_failure_count() {
        let history: Vec<_> = (1..=3).map(|b| source_event(b, 0, "1", "dave")).collect();
        let source = Arc::new(MockSource::new(
            history.clone(),
            vec![
                Session::new(0, vec![]),
                Session::new(0, history[0..1].to_vec()),
                // head behind the cursor: nothing to replay, nothing delivered
                Session::new(0, vec![]),
                Session::new(0, history[1..3].to_vec()),
            ],
        ));
        let (tx, rx) = mpsc::channel(16);
        let subscriber = EventSubscriber::new(source.clone(), fast_reconnect(2));

        let err = subscriber
            .run(tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SubscriptionError::ReconnectExhausted { attempts: 2, .. }
        ));
        // one empty session before each delivering one never reached the limit
        assert_eq!(source.subscribe_calls(), 6);
        let delivered = collect(rx).await;
        for ev in &history {
            assert!(delivered.contains(ev), "missing {}", ev.id);
        }
    }
}
