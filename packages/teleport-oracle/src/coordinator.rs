//! Relay coordinator
//!
//! Wires the subscriber, ledger, converter and dispatcher together:
//!
//! ```text
//! subscriber --events--> intake (try_begin, in order) --jobs--> N workers
//!                                                          convert -> dispatch -> mark_*
//! ```
//!
//! Intake is the only place `try_begin` runs, so the ledger decides every
//! event exactly once before any destination transaction exists. The
//! cursor only advances past events that have been recorded.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertSink};
use crate::amount::AmountConverter;
use crate::config::RelaySettings;
use crate::destination::TransferRequest;
use crate::dispatcher::Dispatcher;
use crate::error::{LedgerError, SubscriptionError};
use crate::ledger::{BeginOutcome, RelayLedger};
use crate::metrics;
use crate::source::EventSubscriber;
use crate::types::SourceEvent;

/// What happened to one delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Already in the ledger; nothing dispatched
    Skipped,
    Issued { tx_id: String },
    Failed { reason: String },
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    pub observed: u64,
    pub skipped: u64,
    pub issued: u64,
    pub failed: u64,
}

impl RelaySummary {
    fn record(&mut self, outcome: &RelayOutcome) {
        match outcome {
            RelayOutcome::Skipped => self.skipped += 1,
            RelayOutcome::Issued { .. } => self.issued += 1,
            RelayOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: RelaySummary) {
        self.observed += other.observed;
        self.skipped += other.skipped;
        self.issued += other.issued;
        self.failed += other.failed;
    }
}

/// Why the pipeline stopped on its own
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The idempotency guard is unavailable; dispatching would be unsafe
    #[error("relay ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct RelayCoordinator {
    ledger: Arc<dyn RelayLedger>,
    converter: AmountConverter,
    dispatcher: Dispatcher,
    alerts: Arc<dyn AlertSink>,
    memo: String,
    workers: usize,
    queue_capacity: usize,
}

impl RelayCoordinator {
    pub fn new(
        ledger: Arc<dyn RelayLedger>,
        converter: AmountConverter,
        dispatcher: Dispatcher,
        alerts: Arc<dyn AlertSink>,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            ledger,
            converter,
            dispatcher,
            alerts,
            memo: settings.memo.clone(),
            workers: settings.workers.max(1),
            queue_capacity: settings.queue_capacity.max(1),
        }
    }

    /// Block to resume from: the persisted cursor, else the configured start
    pub async fn resume_block(&self, configured: Option<u64>) -> Result<Option<u64>, LedgerError> {
        Ok(self.ledger.load_cursor().await?.or(configured))
    }

    /// Report records left PENDING by a previous run
    ///
    /// A PENDING record means a dispatch may or may not have reached the
    /// destination. They are never re-dispatched automatically.
    pub async fn report_pending(&self) -> Result<usize, LedgerError> {
        let pending = self.ledger.pending_records().await?;
        metrics::PENDING_RECORDS.set(pending.len() as i64);

        for record in &pending {
            warn!(
                event_id = %record.event_id,
                block = record.block_number,
                recipient = %record.recipient,
                raw_amount = %record.raw_amount,
                "Relay record left pending by a previous run"
            );
            self.alerts
                .send(Alert::critical(
                    record.event_id.clone(),
                    format!(
                        "relay to {} (raw amount {}) was interrupted; check the destination chain and reconcile manually",
                        record.recipient, record.raw_amount
                    ),
                ))
                .await;
        }
        if !pending.is_empty() {
            self.alerts
                .send(Alert::warning(format!(
                    "{} relay record(s) awaiting manual reconciliation; they will not be re-dispatched",
                    pending.len()
                )))
                .await;
        }
        Ok(pending.len())
    }

    /// Relay a single event end to end (guard, convert, dispatch, record)
    pub async fn handle_event(&self, event: &SourceEvent) -> Result<RelayOutcome, LedgerError> {
        match self.begin(event).await? {
            BeginOutcome::AlreadyHandled => Ok(RelayOutcome::Skipped),
            BeginOutcome::Proceed => Ok(self.process(event).await),
        }
    }

    async fn begin(&self, event: &SourceEvent) -> Result<BeginOutcome, LedgerError> {
        metrics::EVENTS_OBSERVED.inc();
        let outcome = self.ledger.try_begin(event).await?;
        if outcome == BeginOutcome::AlreadyHandled {
            metrics::record_outcome("skipped");
            debug!(event_id = %event.id, "Event already in ledger, skipping");
        }
        Ok(outcome)
    }

    /// Convert and dispatch an event whose PENDING record this caller owns
    async fn process(&self, event: &SourceEvent) -> RelayOutcome {
        let event_id = event.id.key();

        let amount = match self.converter.convert(&event.amount) {
            Ok(amount) => amount,
            Err(e) => return self.fail(&event_id, e.to_string()).await,
        };

        let request = TransferRequest {
            event_id: event_id.clone(),
            to: event.recipient().to_string(),
            amount: amount.to_string(),
            memo: self.memo.clone(),
        };
        info!(
            event_id = %event_id,
            block = event.id.block_number,
            to = %request.to,
            raw_amount = %event.amount,
            amount = %request.amount,
            "Relaying teleport"
        );

        match self.dispatcher.dispatch(&request).await {
            Ok(dispatched) => {
                let tx_id = dispatched.receipt.transaction_id;
                if let Err(e) = self.ledger.mark_issued(&event_id, &tx_id).await {
                    error!(event_id = %event_id, tx_id = %tx_id, error = %e, "Failed to record issued transfer");
                    self.alerts
                        .send(Alert::critical(
                            event_id.clone(),
                            format!("transfer issued as {} but the ledger update failed: {}", tx_id, e),
                        ))
                        .await;
                }
                metrics::record_outcome("issued");
                RelayOutcome::Issued { tx_id }
            }
            Err(failure) => self.fail(&event_id, failure.to_string()).await,
        }
    }

    async fn fail(&self, event_id: &str, reason: String) -> RelayOutcome {
        error!(event_id, reason = %reason, "Relay failed");
        if let Err(e) = self.ledger.mark_failed(event_id, &reason).await {
            error!(event_id, error = %e, "Failed to record failed relay");
        }
        self.alerts
            .send(Alert::critical(event_id, format!("relay failed: {}", reason)))
            .await;
        metrics::record_outcome("failed");
        RelayOutcome::Failed { reason }
    }

    fn spawn_workers(
        self: &Arc<Self>,
        jobs: mpsc::Receiver<SourceEvent>,
    ) -> Vec<JoinHandle<RelaySummary>> {
        let jobs = Arc::new(Mutex::new(jobs));
        (0..self.workers)
            .map(|worker| {
                let this = Arc::clone(self);
                let jobs = Arc::clone(&jobs);
                tokio::spawn(async move {
                    let mut summary = RelaySummary::default();
                    loop {
                        let job = jobs.lock().await.recv().await;
                        let Some(event) = job else { break };
                        let outcome = this.process(&event).await;
                        summary.record(&outcome);
                    }
                    debug!(worker, "Relay worker finished");
                    summary
                })
            })
            .collect()
    }

    /// Run the pipeline until cancelled or a fatal error
    ///
    /// On return every accepted job has reached a terminal state.
    pub async fn run(
        self: Arc<Self>,
        subscriber: EventSubscriber,
        cancel: CancellationToken,
    ) -> Result<RelaySummary, PipelineError> {
        let (event_tx, mut events) = mpsc::channel(self.queue_capacity);
        let (job_tx, jobs) = mpsc::channel(self.queue_capacity);

        let subscriber_cancel = cancel.child_token();
        let subscriber_task = tokio::spawn(subscriber.run(event_tx, subscriber_cancel.clone()));
        let workers = self.spawn_workers(jobs);

        metrics::UP.set(1);
        info!(workers = self.workers, "Relay pipeline running");

        let mut summary = RelaySummary::default();
        let mut fatal: Option<PipelineError> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            summary.observed += 1;

            match self.begin(&event).await {
                Ok(BeginOutcome::AlreadyHandled) => summary.skipped += 1,
                Ok(BeginOutcome::Proceed) => {
                    let block = event.id.block_number;
                    if job_tx.send(event).await.is_err() {
                        break;
                    }
                    if let Err(e) = self.ledger.save_cursor(block).await {
                        warn!(block, error = %e, "Failed to persist replay cursor");
                    }
                }
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "Relay ledger unavailable, stopping intake");
                    fatal = Some(PipelineError::Ledger(e));
                    break;
                }
            }
        }

        // Stop the source, then let the workers drain accepted jobs
        subscriber_cancel.cancel();
        drop(events);
        drop(job_tx);

        for worker in workers {
            match worker.await {
                Ok(partial) => summary.merge(partial),
                Err(e) => error!(error = %e, "Relay worker panicked"),
            }
        }

        let subscriber_result = match subscriber_task.await {
            Ok(result) => result,
            Err(e) => Err(SubscriptionError::Transport(format!("subscriber task failed: {}", e))),
        };

        metrics::UP.set(0);
        info!(?summary, "Relay pipeline stopped");

        if let Some(e) = fatal {
            self.alerts
                .send(Alert::fatal(format!("relay stopped: {}", e)))
                .await;
            return Err(e);
        }
        if let Err(e) = subscriber_result {
            self.alerts
                .send(Alert::fatal(format!("relay stopped: {}", e)))
                .await;
            return Err(e.into());
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::error::DispatchError;
    use crate::ledger::MemoryLedger;
    use crate::retry::RetryConfig;
    use crate::testing::{source_event, wait_until, MockDestination, MockSource, RecordingAlerts, Session};
    use crate::types::RelayStatus;
    use std::time::Duration;

    const ONE_TOKEN: &str = "1000000000000000000";

    fn settings(workers: usize) -> RelaySettings {
        RelaySettings {
            exchange_rate: "3.01369863".to_string(),
            memo: "Welcome to SENSE on EOS!".to_string(),
            workers,
            queue_capacity: 16,
            dispatch_retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                backoff_multiplier: 2.0,
            },
            reconnect: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                backoff_multiplier: 2.0,
            },
        }
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        destination: Arc<MockDestination>,
        alerts: Arc<RecordingAlerts>,
        coordinator: Arc<RelayCoordinator>,
        settings: RelaySettings,
    }

    fn harness(destination: MockDestination, workers: usize) -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let destination = Arc::new(destination);
        let alerts = Arc::new(RecordingAlerts::default());
        let settings = settings(workers);
        let converter = AmountConverter::new(18, 4, &settings.exchange_rate).unwrap();
        let dispatcher = Dispatcher::new(destination.clone(), settings.dispatch_retry.clone());
        let coordinator = Arc::new(RelayCoordinator::new(
            ledger.clone(),
            converter,
            dispatcher,
            alerts.clone(),
            &settings,
        ));
        Harness {
            ledger,
            destination,
            alerts,
            coordinator,
            settings,
        }
    }

    #[tokio::test]
    async fn test_handle_event_issues_converted_transfer() {
        let h = harness(MockDestination::new(), 1);
        let event = source_event(10, 0, ONE_TOKEN, " te.mgr5ymass ");

        let outcome = h.coordinator.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Issued { .. }));

        let issued = h.destination.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].to, "te.mgr5ymass");
        assert_eq!(issued[0].amount, "3.0137");
        assert_eq!(issued[0].memo, "Welcome to SENSE on EOS!");

        let record = h.ledger.get(&event.id.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Issued);

        // a second delivery is absorbed
        assert_eq!(
            h.coordinator.handle_event(&event).await.unwrap(),
            RelayOutcome::Skipped
        );
        assert_eq!(h.destination.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_amount_is_relayed_as_zero() {
        let h = harness(MockDestination::new(), 1);
        let event = source_event(1, 0, "0", "alice");
        h.coordinator.handle_event(&event).await.unwrap();
        assert_eq!(h.destination.issued()[0].amount, "0.0000");
    }

    #[tokio::test]
    async fn test_invalid_amount_fails_without_dispatch() {
        let h = harness(MockDestination::new(), 1);
        let event = source_event(1, 0, "-5", "alice");

        let outcome = h.coordinator.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { .. }));
        assert_eq!(h.destination.prepare_calls(), 0);

        let record = h.ledger.get(&event.id.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Failed);
        assert_eq!(h.alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_marks_failed_and_alerts() {
        let h = harness(
            MockDestination::new().always_failing(DispatchError::Transient("timeout".into())),
            1,
        );
        let event = source_event(5, 1, ONE_TOKEN, "alice");

        let outcome = h.coordinator.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { .. }));
        assert_eq!(
            h.destination.broadcasts_for(&event.id.key()),
            h.settings.dispatch_retry.max_retries as usize
        );

        let record = h.ledger.get(&event.id.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RelayStatus::Failed);
        assert!(record.error_message.unwrap().contains("timeout"));

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_id.as_deref(), Some(event.id.key().as_str()));

        // FAILED is terminal: a replay does not retry it
        assert_eq!(
            h.coordinator.handle_event(&event).await.unwrap(),
            RelayOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_after_one_attempt() {
        let h = harness(
            MockDestination::new()
                .failing_for("nosuchacct", DispatchError::Permanent("unknown account".into())),
            1,
        );
        let event = source_event(5, 0, ONE_TOKEN, "nosuchacct");

        let outcome = h.coordinator.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { .. }));
        assert_eq!(h.destination.broadcasts_for(&event.id.key()), 1);
        assert_eq!(h.alerts.alerts().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_issue_once() {
        let h = harness(MockDestination::new().with_delay(Duration::from_millis(5)), 1);
        let event = source_event(77, 2, ONE_TOKEN, "alice");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = h.coordinator.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                coordinator.handle_event(&event).await.unwrap()
            }));
        }

        let mut issued = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RelayOutcome::Issued { .. }) {
                issued += 1;
            }
        }
        assert_eq!(issued, 1);
        assert_eq!(h.destination.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_replays_outage_exactly_once() {
        let history: Vec<_> = (1..=8)
            .map(|b| source_event(b, 0, ONE_TOKEN, &format!("user{}", b % 5 + 1)))
            .collect();
        let source = Arc::new(MockSource::new(
            history.clone(),
            vec![
                Session::new(0, history[0..3].to_vec()),
                // blocks 4-6 land while disconnected
                Session::hanging_with(6, history[6..8].to_vec()),
            ],
        ));
        let h = harness(MockDestination::new(), 3);
        let subscriber = EventSubscriber::new(source.clone(), h.settings.reconnect.clone());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(h.coordinator.clone().run(subscriber, cancel.clone()));

        let destination = h.destination.clone();
        assert!(wait_until(Duration::from_secs(5), || destination.issued().len() == 8).await);
        cancel.cancel();
        let summary = run.await.unwrap().unwrap();

        let mut issued: Vec<_> = h.destination.issued().into_iter().map(|r| r.event_id).collect();
        issued.sort();
        let mut expected: Vec<_> = history.iter().map(|e| e.id.key()).collect();
        expected.sort();
        assert_eq!(issued, expected);

        assert_eq!(summary.issued, 8);
        assert_eq!(summary.failed, 0);
        // block 3 was delivered live and again by the replay
        assert!(summary.skipped >= 1);
        assert_eq!(summary.observed, summary.issued + summary.skipped);
        assert_eq!(h.ledger.load_cursor().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_pipeline_escalates_reconnect_exhaustion() {
        let source = Arc::new(MockSource::new(
            vec![],
            vec![Session::new(0, vec![source_event(1, 0, ONE_TOKEN, "alice")])],
        ));
        let h = harness(MockDestination::new(), 2);
        let subscriber = EventSubscriber::new(source, h.settings.reconnect.clone());

        let result = h.coordinator.clone().run(subscriber, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::Subscription(SubscriptionError::ReconnectExhausted { .. }))
        ));
        // the accepted job still drained before returning
        assert_eq!(h.destination.issued().len(), 1);

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].event_id.is_none());
        assert!(alerts[0].message.contains("relay stopped"));
    }

    #[tokio::test]
    async fn test_report_pending_is_quiet_on_clean_ledger() {
        let h = harness(MockDestination::new(), 1);
        assert_eq!(h.coordinator.report_pending().await.unwrap(), 0);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_dispatch_leaves_nothing_pending() {
        let live: Vec<_> = (1..=6)
            .map(|b| source_event(b, 0, ONE_TOKEN, &format!("user{}", b)))
            .collect();
        let source = Arc::new(MockSource::new(
            live.clone(),
            vec![Session::hanging_with(0, live.clone())],
        ));
        // one slow worker: jobs queue up behind the in-flight dispatch
        let h = harness(MockDestination::new().with_delay(Duration::from_millis(50)), 1);
        let subscriber = EventSubscriber::new(source, h.settings.reconnect.clone());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(h.coordinator.clone().run(subscriber, cancel.clone()));

        let destination = h.destination.clone();
        assert!(wait_until(Duration::from_secs(5), || !destination.issued().is_empty()).await);
        cancel.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pipeline did not drain after cancellation")
            .unwrap()
            .unwrap();

        assert!(summary.issued >= 1);
        assert_eq!(summary.issued + summary.failed, summary.observed - summary.skipped);
        assert!(h.ledger.pending_records().await.unwrap().is_empty());

        let counts = h.ledger.status_counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.issued as u64, summary.issued);
        assert_eq!(h.destination.issued().len() as u64, summary.issued);
    }

    #[tokio::test]
    async fn test_resume_prefers_persisted_cursor() {
        let h = harness(MockDestination::new(), 1);
        assert_eq!(h.coordinator.resume_block(Some(100)).await.unwrap(), Some(100));
        h.ledger.save_cursor(250).await.unwrap();
        assert_eq!(h.coordinator.resume_block(Some(100)).await.unwrap(), Some(250));
    }

    #[tokio::test]
    async fn test_report_pending_alerts_without_dispatch() {
        let h = harness(MockDestination::new(), 1);
        let interrupted = source_event(3, 0, ONE_TOKEN, "alice");
        h.ledger.try_begin(&interrupted).await.unwrap();

        assert_eq!(h.coordinator.report_pending().await.unwrap(), 1);
        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].event_id.as_deref(), Some(interrupted.id.key().as_str()));
        assert_eq!(alerts[1].severity, Severity::Warning);
        assert!(alerts[1].message.starts_with("1 relay record(s)"));
        assert_eq!(h.destination.prepare_calls(), 0);

        // and a replay of the same event does not dispatch it either
        assert_eq!(
            h.coordinator.handle_event(&interrupted).await.unwrap(),
            RelayOutcome::Skipped
        );
    }
}
