use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SyncError},
    link::{DeviceLink, EventSink, LinkEvent, RunEvent, RunId},
    machine::{Command, SyncSession},
    store::{commit_with_retry, CommitReport, SessionStore},
    types::{
        Clock, ClockDrift, FailureReason, Session, SyncConfig, SyncOutcome, SyncState,
        SyncStatus, SystemClock,
    },
};

/// Summary of a finished sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Run identity
    pub run: RunId,
    /// Terminal state: `Idle` on success, `Failed(reason)` otherwise
    pub state: SyncState,
    /// Aggregate outcome
    pub outcome: SyncOutcome,
    /// Sessions collected from the tracker, in emission order
    pub sessions: Vec<Session>,
    /// Clock drift measured during the handshake
    pub drift: Option<ClockDrift>,
    /// Store report, if a commit was attempted and acknowledged
    pub commit: Option<CommitReport>,
    /// Final status line
    pub message: String,
}

impl SyncReport {
    fn from_session(session: &SyncSession) -> Self {
        let status = session.status();
        Self {
            run: session.run(),
            state: status.state,
            outcome: status
                .outcome
                .unwrap_or(SyncOutcome::NoData(FailureReason::Cancelled)),
            sessions: session.sessions().to_vec(),
            drift: session.drift(),
            commit: session.commit_report().cloned(),
            message: status.message,
        }
    }

    /// Whether the tracker delivered its whole queue and every session is stored
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Synced
    }
}

/// Handle to a run started with [`SyncEngine::start`]
#[derive(Debug)]
pub struct RunHandle {
    run: RunId,
    result: oneshot::Receiver<SyncReport>,
}

impl RunHandle {
    /// Run identity
    #[must_use]
    pub const fn run(&self) -> RunId {
        self.run
    }

    /// Wait for the run to finish
    ///
    /// Runs superseded by a newer one still finish, with a
    /// [`FailureReason::Cancelled`] outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the run task ended without a report.
    pub async fn wait(self) -> Result<SyncReport> {
        self.result.await.map_err(|_| SyncError::Cancelled)
    }
}

struct ActiveRun {
    run: RunId,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner<L, S> {
    link: Mutex<L>,
    store: S,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    syncing: AtomicBool,
    events_tx: mpsc::UnboundedSender<RunEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<RunEvent>>,
    status: watch::Sender<SyncStatus>,
    active: Mutex<Option<ActiveRun>>,
}

/// Session sync engine
///
/// `SyncEngine` owns a [`DeviceLink`] and a [`SessionStore`] and runs one sync
/// at a time. Each run drives a [`SyncSession`] state machine from a single
/// task: link events, timer expiry and cancellation are processed strictly in
/// arrival order, and every transition publishes a [`SyncStatus`] snapshot.
///
/// # Examples
///
/// ```no_run
/// use treadsync::{BtleplugLink, MemorySessionStore, SyncConfig, SyncEngine};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let link = BtleplugLink::new().await?;
///     let store = MemorySessionStore::new();
///     let engine = SyncEngine::new(link, store.clone(), SyncConfig::default());
///
///     let report = engine.sync().await?;
///     println!("{}", report.message);
///
///     for session in store.sessions().await {
///         println!("{session}");
///     }
///     Ok(())
/// }
/// ```
pub struct SyncEngine<L, S> {
    inner: Arc<Inner<L, S>>,
}

impl<L, S> SyncEngine<L, S>
where
    L: DeviceLink + 'static,
    S: SessionStore + 'static,
{
    /// Create an engine using the system clock
    pub fn new(link: L, store: S, config: SyncConfig) -> Self {
        Self::with_clock(link, store, config, Arc::new(SystemClock))
    }

    /// Create an engine with a custom phone clock
    pub fn with_clock(link: L, store: S, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus::idle());

        Self {
            inner: Arc::new(Inner {
                link: Mutex::new(link),
                store,
                config,
                clock,
                generation: AtomicU64::new(0),
                syncing: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(events_rx),
                status,
                active: Mutex::new(None),
            }),
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Session store the engine commits to
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Whether a run is in progress
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Latest status snapshot
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to status snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Start a new run, cancelling any run still in flight
    ///
    /// The previous run is cancelled and has released the link before the new
    /// run gets its identity, so events it triggered late are discarded.
    pub async fn start(&self) -> RunHandle {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            if previous.cancel.send(()).is_ok() {
                info!(run = %previous.run, "Cancelling in-flight sync");
            }
            if let Err(e) = previous.task.await {
                warn!(run = %previous.run, "Sync task ended abnormally: {e}");
            }
        }

        let run = RunId(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.syncing.store(true, Ordering::SeqCst);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let report = inner.drive(run, cancel_rx).await;
            inner.syncing.store(false, Ordering::SeqCst);
            let _ = result_tx.send(report);
        });

        *active = Some(ActiveRun {
            run,
            cancel: cancel_tx,
            task,
        });
        RunHandle {
            run,
            result: result_rx,
        }
    }

    /// Run a sync to completion
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the run task ended without a report.
    /// Run failures are reported in the [`SyncReport`], not as errors.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.start().await.wait().await
    }

    /// Cancel the run in flight, if any, and wait for it to stop
    pub async fn cancel(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            let _ = previous.cancel.send(());
            if let Err(e) = previous.task.await {
                warn!(run = %previous.run, "Sync task ended abnormally: {e}");
            }
        }
    }
}

impl<L, S> Inner<L, S>
where
    L: DeviceLink,
    S: SessionStore,
{
    async fn drive(&self, run: RunId, mut cancel: oneshot::Receiver<()>) -> SyncReport {
        let mut link = self.link.lock().await;
        let mut events = self.events_rx.lock().await;
        while let Ok(stale) = events.try_recv() {
            debug!(%run, stale = %stale.run, "Discarding stale event");
        }
        link.bind(EventSink::new(run, self.events_tx.clone()));

        let mut session = SyncSession::new(run, self.config.clone(), Arc::clone(&self.clock));
        let mut pending: VecDeque<Command> = session.start().into();
        let mut deadline: Option<Instant> = None;
        let mut cancelled = false;

        loop {
            while let Some(command) = pending.pop_front() {
                match command {
                    Command::StartTimer(after) => deadline = Some(Instant::now() + after),
                    Command::CancelTimer => deadline = None,
                    Command::Link(request) => {
                        let operation = request.operation();
                        let limit = self.config.operation_timeout();
                        match timeout(limit, request.apply(&mut *link)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(%run, %operation, "Link request failed: {e}");
                                pending.extend(session.handle(LinkEvent::Error {
                                    operation,
                                    reason: e.to_string(),
                                }));
                            }
                            Err(_) => {
                                warn!(%run, %operation, ?limit, "Link request timed out");
                                pending.extend(session.on_link_timeout(operation));
                            }
                        }
                    }
                    Command::Commit(batch) => {
                        session.enter_committing();
                        self.publish(&session);
                        let result = commit_with_retry(&self.store, &batch, &self.config).await;
                        pending.extend(session.on_commit(result));
                    }
                }
                self.publish(&session);
            }

            if session.is_finished() {
                break;
            }

            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut cancel, if !cancelled => {
                    cancelled = true;
                    info!(%run, "Sync cancelled");
                    pending.extend(session.cancel());
                }
                received = events.recv() => match received {
                    Some(RunEvent { run: origin, event }) if origin == run => {
                        pending.extend(session.handle(event));
                    }
                    Some(stale) => {
                        debug!(%run, stale = %stale.run, event = ?stale.event, "Discarding stale event");
                    }
                    None => {
                        pending.extend(session.handle(LinkEvent::Disconnected {
                            reason: Some("event channel closed".to_string()),
                        }));
                    }
                },
                () = timer => {
                    deadline = None;
                    pending.extend(session.on_timeout());
                }
            }
        }

        let report = SyncReport::from_session(&session);
        info!(%run, state = %report.state, "{}", report.message);
        report
    }

    fn publish(&self, session: &SyncSession) {
        let status = session.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::ScanRequest,
        protocol::ACK,
        sim::{SimStep, SimulatedTreadmill},
        store::{MemorySessionStore, RecordOutcome},
        types::{DeviceId, FixedClock, GattProfile},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use uuid::Uuid;

    const PHONE_EPOCH: u32 = 1_700_000_000;

    type TestEngine<L> = SyncEngine<L, MemorySessionStore>;

    fn new_engine<L: DeviceLink + 'static>(link: L) -> (TestEngine<L>, MemorySessionStore) {
        let store = MemorySessionStore::new();
        let engine = SyncEngine::with_clock(
            link,
            store.clone(),
            SyncConfig::default(),
            Arc::new(FixedClock(PHONE_EPOCH)),
        );
        (engine, store)
    }

    fn treadmill() -> SimulatedTreadmill {
        SimulatedTreadmill::new(GattProfile::default(), PHONE_EPOCH)
    }

    fn sessions(count: u32) -> Vec<Session> {
        (0..count)
            .map(|i| {
                let start = PHONE_EPOCH - 86_400 + i * 3_600;
                Session::new(start, start + 1_200, 1_000 + i)
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_commits_sessions_in_order() {
        let expected = sessions(3);
        let sim = treadmill().with_records(expected.clone()).then_complete();
        let writes = sim.write_log();
        let (engine, store) = new_engine(sim);

        let report = engine.sync().await.unwrap();

        assert_eq!(report.state, SyncState::Idle);
        assert_eq!(report.outcome, SyncOutcome::Synced);
        assert!(report.is_success());
        assert_eq!(report.sessions, expected);
        assert_eq!(store.sessions().await, expected);
        assert_eq!(store.commit_count().await, 1);
        assert_eq!(report.message, "Synced 3 sessions");

        let writes = writes.lock().await;
        let gatt = GattProfile::default();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].characteristic, gatt.phone_time);
        assert_eq!(writes[0].data, Bytes::copy_from_slice(&PHONE_EPOCH.to_be_bytes()));
        assert!(writes[1..]
            .iter()
            .all(|w| w.characteristic == gatt.ack && w.data[..] == [ACK]));

        assert!(!engine.is_syncing());
        assert_eq!(engine.status().state, SyncState::Idle);
        assert_eq!(engine.status().sessions_saved, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_device_found() {
        let (engine, store) = new_engine(treadmill().hidden());

        let report = engine.sync().await.unwrap();

        assert_eq!(report.state, SyncState::Failed(FailureReason::NoDeviceFound));
        assert_eq!(
            report.outcome,
            SyncOutcome::NoData(FailureReason::NoDeviceFound)
        );
        assert!(report.sessions.is_empty());
        assert_eq!(store.commit_count().await, 0);
        assert_eq!(engine.status().message, "No data synced: No treadmill found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_stream_commits_received_sessions() {
        let records = sessions(2);
        let sim = treadmill()
            .with_records(records.clone())
            .then(SimStep::Disconnect);
        let (engine, store) = new_engine(sim);

        let report = engine.sync().await.unwrap();

        assert_eq!(report.state, SyncState::Failed(FailureReason::Disconnected));
        assert_eq!(
            report.outcome,
            SyncOutcome::PartialSync(FailureReason::Disconnected)
        );
        assert_eq!(store.sessions().await, records);
        assert!(report.message.starts_with("Partial sync"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_skipped() {
        let records = sessions(2);
        let sim = treadmill()
            .with_records([records[0]])
            .then(SimStep::Frame(Bytes::from_static(&[0xAB; 7])))
            .with_records([records[1]])
            .then_complete();
        let (engine, store) = new_engine(sim);

        let report = engine.sync().await.unwrap();

        assert_eq!(report.outcome, SyncOutcome::Synced);
        assert_eq!(report.sessions, records);
        assert_eq!(store.sessions().await, records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_drift_warning() {
        let sim = SimulatedTreadmill::new(GattProfile::default(), PHONE_EPOCH + 1_000)
            .with_records(sessions(1))
            .then_complete();
        let (engine, _store) = new_engine(sim);

        let report = engine.sync().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Synced);
        let drift = report.drift.unwrap();
        assert_eq!(drift.offset_secs, 1_000);
        assert!(drift.warning);
        assert!(engine.status().has_drift_warning());

        let sim = SimulatedTreadmill::new(GattProfile::default(), PHONE_EPOCH + 10)
            .with_records(sessions(1))
            .then_complete();
        let (engine, _store) = new_engine(sim);

        let report = engine.sync().await.unwrap();
        assert_eq!(report.drift.unwrap().offset_secs, 10);
        assert!(!report.drift.unwrap().warning);
        assert!(!engine.status().has_drift_warning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_commits_partial() {
        let records = sessions(1);
        let sim = treadmill()
            .with_records(records.clone())
            .then(SimStep::Stall);
        let (engine, store) = new_engine(sim);

        let started = Instant::now();
        let report = engine.sync().await.unwrap();

        assert!(started.elapsed() >= engine.config().stream_inactivity_timeout());
        assert_eq!(report.state, SyncState::Failed(FailureReason::StreamStalled));
        assert_eq!(store.sessions().await, records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic() {
        let gatt = GattProfile::default();
        let sim = treadmill().with_characteristics(vec![gatt.session_data, gatt.ack]);
        let (engine, store) = new_engine(sim);

        let report = engine.sync().await.unwrap();

        assert_eq!(
            report.state,
            SyncState::Failed(FailureReason::CharacteristicMissing(vec![
                gatt.device_time,
                gatt.phone_time
            ]))
        );
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_refused() {
        let (engine, _store) = new_engine(treadmill().refusing_connections());

        let report = engine.sync().await.unwrap();
        assert_eq!(
            report.state,
            SyncState::Failed(FailureReason::ConnectFailed("connection refused".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_write_failure_keeps_received_session() {
        let records = sessions(2);
        let sim = treadmill().with_records(records.clone()).failing_acks();
        let (engine, store) = new_engine(sim);

        let report = engine.sync().await.unwrap();

        assert!(matches!(
            report.state,
            SyncState::Failed(FailureReason::WriteFailed(_))
        ));
        assert_eq!(store.sessions().await, vec![records[0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_disconnect_does_not_block_commit() {
        let records = sessions(2);
        let sim = treadmill()
            .with_records(records.clone())
            .then_complete()
            .hanging_disconnect();
        let (engine, store) = new_engine(sim);

        let started = Instant::now();
        let report = engine.sync().await.unwrap();

        assert!(started.elapsed() >= engine.config().operation_timeout());
        assert_eq!(report.state, SyncState::Idle);
        assert_eq!(report.outcome, SyncOutcome::Synced);
        assert_eq!(store.sessions().await, records);
        assert!(!engine.is_syncing());
    }

    /// Store that refuses every session after the first
    #[derive(Default)]
    struct QuotaStore {
        inner: MemorySessionStore,
    }

    #[async_trait]
    impl SessionStore for QuotaStore {
        async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>> {
            let mut outcomes = Vec::with_capacity(batch.len());
            for session in batch {
                if self.inner.sessions().await.is_empty() {
                    outcomes.extend(self.inner.commit(std::slice::from_ref(session)).await?);
                } else {
                    outcomes.push(RecordOutcome::Failed("quota exceeded".to_string()));
                }
            }
            Ok(outcomes)
        }

        async fn contains(&self, start: u32, stop: u32) -> Result<bool> {
            self.inner.contains(start, stop).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsaved_records_report_partially_stored() {
        let records = sessions(3);
        let sim = treadmill().with_records(records.clone()).then_complete();
        let engine = SyncEngine::with_clock(
            sim,
            QuotaStore::default(),
            SyncConfig::default(),
            Arc::new(FixedClock(PHONE_EPOCH)),
        );

        let report = engine.sync().await.unwrap();

        assert_eq!(report.state, SyncState::Idle);
        assert_eq!(report.outcome, SyncOutcome::PartiallyStored);
        assert!(!report.is_success());
        let commit = report.commit.unwrap();
        assert_eq!(commit.stored, 1);
        assert_eq!(commit.failed.len(), 2);
        assert_eq!(report.message, "Saved 1 of 3 sessions; 2 could not be saved");
        assert_eq!(engine.store().inner.sessions().await, vec![records[0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_in_flight_run() {
        let sim = treadmill()
            .with_records(sessions(1))
            .then(SimStep::Stall);
        let (engine, store) = new_engine(sim);
        let mut status = engine.subscribe();

        let first = engine.start().await;
        status
            .wait_for(|s| {
                s.run == first.run()
                    && s.state == SyncState::AwaitingRecord
                    && s.sessions_received == 1
            })
            .await
            .unwrap();
        assert!(engine.is_syncing());

        let second = engine.start().await;
        assert!(second.run() > first.run());

        let first_report = first.wait().await.unwrap();
        assert_eq!(first_report.state, SyncState::Failed(FailureReason::Cancelled));
        assert_eq!(
            first_report.outcome,
            SyncOutcome::NoData(FailureReason::Cancelled)
        );

        let second_run = second.run();
        let second_report = second.wait().await.unwrap();
        assert_eq!(second_report.run, second_run);
        assert_eq!(
            second_report.state,
            SyncState::Failed(FailureReason::StreamStalled)
        );
        assert_eq!(store.commit_count().await, 0);
    }

    /// Link that replays a disconnect through the previous run's sink
    struct HauntedLink {
        inner: SimulatedTreadmill,
        previous: Option<EventSink>,
        current: Option<EventSink>,
    }

    #[async_trait]
    impl DeviceLink for HauntedLink {
        fn bind(&mut self, sink: EventSink) {
            self.previous = self.current.replace(sink.clone());
            self.inner.bind(sink);
        }

        async fn start_scan(&mut self, request: &ScanRequest) -> Result<()> {
            if let Some(previous) = &self.previous {
                previous.emit(LinkEvent::Disconnected { reason: None });
                previous.emit(LinkEvent::DeviceDiscovered {
                    id: DeviceId::from("ghost"),
                    name: None,
                });
            }
            self.inner.start_scan(request).await
        }

        async fn stop_scan(&mut self) -> Result<()> {
            self.inner.stop_scan().await
        }

        async fn connect(&mut self, device: &DeviceId) -> Result<()> {
            self.inner.connect(device).await
        }

        async fn discover_services(&mut self, service: Uuid) -> Result<()> {
            self.inner.discover_services(service).await
        }

        async fn discover_characteristics(&mut self, characteristics: &[Uuid]) -> Result<()> {
            self.inner.discover_characteristics(characteristics).await
        }

        async fn read(&mut self, characteristic: Uuid) -> Result<()> {
            self.inner.read(characteristic).await
        }

        async fn write(
            &mut self,
            characteristic: Uuid,
            data: Bytes,
            with_response: bool,
        ) -> Result<()> {
            self.inner.write(characteristic, data, with_response).await
        }

        async fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
            self.inner.subscribe(characteristic).await
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.inner.disconnect().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_events_are_discarded() {
        let records = sessions(2);
        let link = HauntedLink {
            inner: treadmill()
                .then_complete()
                .with_records(records.clone())
                .then_complete(),
            previous: None,
            current: None,
        };
        let (engine, store) = new_engine(link);

        let first = engine.sync().await.unwrap();
        assert_eq!(first.outcome, SyncOutcome::Synced);
        assert!(first.sessions.is_empty());

        let second = engine.sync().await.unwrap();
        assert_eq!(second.outcome, SyncOutcome::Synced);
        assert_eq!(second.sessions, records);
        assert_eq!(store.sessions().await, records);
    }
}
