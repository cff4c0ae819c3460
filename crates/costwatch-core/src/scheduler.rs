//! Check loop: one cycle immediately, then one per interval until shutdown.
//!
//! Lifecycle: `Starting → Running → ShuttingDown → Stopped`. Cycles are
//! strictly sequential and always persist last, so a crash mid-cycle only
//! loses that cycle. Per-cycle errors are logged and retried on the next
//! tick with a growing backoff; they never stop the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::MonitorError;
use crate::gate;
use crate::lock::InstanceLock;
use crate::notify::{format_alert, NotificationSink};
use crate::state::{MonitorState, StateStore};
use crate::usage::UsageSource;

/// Extra delay after the first failed cycle
pub const BACKOFF_START: Duration = Duration::from_secs(30);
/// Ceiling for the extra delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Alert when the period cost is strictly above this (USD)
    pub threshold: f64,
    /// Delay between cycles
    pub interval: Duration,
    /// Instance lock name
    pub lock_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckResult {
    pub exceeded: bool,
    pub notification_sent: bool,
    pub new_state: MonitorState,
}

/// Counters across cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub exceeded: u64,
    pub notifications_sent: u64,
    pub fetch_failures: u64,
    pub delivery_failures: u64,
    pub consecutive_failures: u32,
}

/// Fires the shutdown request
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Observes the shutdown request
#[derive(Debug, Clone)]
pub struct ShutdownListener(watch::Receiver<bool>);

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the trigger
    /// is dropped without firing.
    pub async fn triggered(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a shutdown trigger/listener pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownListener(rx))
}

/// Drives usage checks and alerting
pub struct Scheduler<U, N> {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    source: U,
    sink: Option<N>,
    store: Box<dyn StateStore>,
    lock: Box<dyn InstanceLock>,
    state: MonitorState,
    /// Last state known to be on disk
    persisted: MonitorState,
    phase: SchedulerPhase,
    stats: CycleStats,
    backoff: Duration,
}

impl<U: UsageSource, N: NotificationSink> Scheduler<U, N> {
    /// Create a scheduler. `sink: None` disables delivery but not evaluation.
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        source: U,
        sink: Option<N>,
        store: Box<dyn StateStore>,
        lock: Box<dyn InstanceLock>,
    ) -> Self {
        Self {
            config,
            clock,
            source,
            sink,
            store,
            lock,
            state: MonitorState::default(),
            persisted: MonitorState::default(),
            phase: SchedulerPhase::Starting,
            stats: CycleStats::default(),
            backoff: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Run until `shutdown` fires. Fails only if startup fails.
    pub async fn run(
        &mut self,
        mut shutdown: ShutdownListener,
    ) -> Result<CycleStats, MonitorError> {
        self.start()?;
        info!(
            threshold = self.config.threshold,
            interval_secs = self.config.interval.as_secs(),
            "Usage monitor running"
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            self.tick().await;

            let wait = self.config.interval + self.backoff;
            debug!(wait_secs = wait.as_secs(), "Waiting for next check");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.triggered() => {}
            }
        }

        self.stop();
        Ok(self.stats)
    }

    /// Start, run exactly one cycle, and stop
    pub async fn run_once(&mut self) -> Result<CheckResult, MonitorError> {
        self.start()?;
        let result = self.check().await;
        self.stop();
        result
    }

    /// Take the instance lock and load persisted state
    fn start(&mut self) -> Result<(), MonitorError> {
        self.phase = SchedulerPhase::Starting;
        let name = self.config.lock_name.clone();

        match self.lock.acquire(&name) {
            Ok(true) => {}
            Ok(false) => {
                self.phase = SchedulerPhase::Stopped;
                return Err(MonitorError::LockUnavailable { name });
            }
            Err(err) => {
                self.phase = SchedulerPhase::Stopped;
                return Err(MonitorError::Lock(err));
            }
        }

        self.state = match self.store.load() {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "Unreadable monitor state; starting empty");
                MonitorState::default()
            }
        };
        self.persisted = self.state;
        debug!(state = ?self.state, "Monitor state loaded");

        self.phase = SchedulerPhase::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.phase = SchedulerPhase::ShuttingDown;
        info!("Usage monitor shutting down");
        self.source.close();
        self.lock.cleanup();
        self.phase = SchedulerPhase::Stopped;
        info!(
            cycles = self.stats.cycles,
            notifications = self.stats.notifications_sent,
            "Usage monitor stopped"
        );
    }

    /// One cycle inside the loop; errors end here
    async fn tick(&mut self) {
        match self.check().await {
            Ok(result) => {
                self.stats.consecutive_failures = 0;
                self.backoff = Duration::ZERO;
                debug!(?result, "Check cycle succeeded");
            }
            Err(err) => {
                self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
                self.backoff = next_backoff(self.backoff);
                warn!(
                    error = %err,
                    consecutive_failures = self.stats.consecutive_failures,
                    backoff_secs = self.backoff.as_secs(),
                    "Check cycle failed; retrying next tick"
                );
            }
        }
        debug!(stats = ?self.stats, "Cycle counters");
    }

    /// fetch → compare → decide → notify → persist
    pub async fn check(&mut self) -> Result<CheckResult, MonitorError> {
        self.stats.cycles += 1;
        let today = self.clock.today();
        let period = self.clock.current_period();

        let snapshot = match self.source.fetch_usage(&period).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(period = %period, "No usage recorded for the current period");
                return Ok(CheckResult {
                    exceeded: false,
                    notification_sent: false,
                    new_state: self.state,
                });
            }
            Err(err) => {
                self.stats.fetch_failures += 1;
                return Err(err.into());
            }
        };

        let threshold = self.config.threshold;
        let exceeded = snapshot.total_cost > threshold;
        if exceeded {
            self.stats.exceeded += 1;
        }
        let decision = gate::decide(&self.state, exceeded, today);

        let mut delivery_error = None;
        let delivered = match (&self.sink, decision.send) {
            (Some(sink), true) => match sink.deliver(&format_alert(&snapshot, threshold)).await {
                Ok(()) => true,
                Err(err) => {
                    self.stats.delivery_failures += 1;
                    delivery_error = Some(err);
                    false
                }
            },
            (None, true) => {
                info!(cost = snapshot.total_cost, threshold, "No webhook configured; alert suppressed");
                false
            }
            (_, false) => false,
        };
        if delivered {
            self.stats.notifications_sent += 1;
        }

        let new_state = gate::next_state(&self.state, exceeded, decision, delivered, today);
        self.state = new_state;

        info!(
            period = %snapshot.period,
            cost = snapshot.total_cost,
            threshold,
            exceeded,
            notified = delivered,
            "Usage check complete"
        );

        // a failed write stays pending until a later cycle lands it
        if new_state != self.persisted {
            self.store.save(&new_state).map_err(MonitorError::State)?;
            self.persisted = new_state;
        }
        if let Some(err) = delivery_error {
            return Err(err.into());
        }

        Ok(CheckResult {
            exceeded,
            notification_sent: delivered,
            new_state,
        })
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        BACKOFF_START
    } else {
        (current * 2).min(BACKOFF_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::{FetchError, SinkError};
    use crate::lock::PidFileLock;
    use crate::state::MemoryStateStore;
    use crate::usage::UsageSnapshot;
    use chrono::{DateTime, Local, NaiveDate, TimeZone};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type FetchResult = Result<Option<UsageSnapshot>, FetchError>;

    /// Scripted results first, then `fallback_cost` forever
    struct FakeSource {
        script: Mutex<VecDeque<FetchResult>>,
        fallback_cost: f64,
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl FakeSource {
        fn costing(cost: f64) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback_cost: cost,
                calls: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn then(self, result: FetchResult) -> Self {
            self.script.lock().push_back(result);
            self
        }
    }

    fn snapshot(period: &str, cost: f64) -> UsageSnapshot {
        UsageSnapshot {
            period: period.to_string(),
            total_cost: cost,
            models_used: vec!["claude-sonnet-4-20250514".to_string()],
        }
    }

    impl UsageSource for FakeSource {
        async fn fetch_usage(&self, period: &str) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| Ok(Some(snapshot(period, self.fallback_cost))))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<String>>>,
        failing: Arc<AtomicBool>,
    }

    impl NotificationSink for RecordingSink {
        async fn deliver(&self, text: &str) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Status { code: 503 });
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, 12, 0, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    fn config(threshold: f64) -> SchedulerConfig {
        SchedulerConfig {
            threshold,
            interval: Duration::from_secs(60),
            lock_name: "monitor".to_string(),
        }
    }

    struct Harness {
        scheduler: Scheduler<FakeSource, RecordingSink>,
        clock: Arc<FixedClock>,
        store: Arc<MemoryStateStore>,
        sent: Arc<Mutex<Vec<String>>>,
        failing: Arc<AtomicBool>,
        failing_saves: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    /// Shares the in-memory store with the test; fails the next
    /// `failing_saves` writes
    struct SharedStore {
        inner: Arc<MemoryStateStore>,
        failing_saves: Arc<AtomicUsize>,
    }

    impl StateStore for SharedStore {
        fn load(&self) -> anyhow::Result<MonitorState> {
            self.inner.load()
        }

        fn save(&self, state: &MonitorState) -> anyhow::Result<()> {
            let remaining = self.failing_saves.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_saves.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("disk full");
            }
            self.inner.save(state)
        }
    }

    fn harness(threshold: f64, source: FakeSource, with_sink: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(noon(2025, 7, 15)));
        let store = Arc::new(MemoryStateStore::new());
        let sink = RecordingSink::default();
        let sent = Arc::clone(&sink.sent);
        let failing = Arc::clone(&sink.failing);
        let failing_saves = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler::new(
            config(threshold),
            clock.clone(),
            source,
            with_sink.then_some(sink),
            Box::new(SharedStore {
                inner: Arc::clone(&store),
                failing_saves: Arc::clone(&failing_saves),
            }),
            Box::new(PidFileLock::new(dir.path())),
        );

        Harness {
            scheduler,
            clock,
            store,
            sent,
            failing,
            failing_saves,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_breach_sends_and_records_both_dates() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        let result = h.scheduler.run_once().await.unwrap();

        assert_eq!(
            result,
            CheckResult {
                exceeded: true,
                notification_sent: true,
                new_state: MonitorState {
                    last_notification_date: Some(day(15)),
                    last_exceedance_date: Some(day(15)),
                },
            }
        );
        assert_eq!(h.sent.lock().len(), 1);
        assert_eq!(h.store.snapshot(), Some(result.new_state));
        assert_eq!(h.scheduler.phase(), SchedulerPhase::Stopped);
    }

    #[tokio::test]
    async fn test_second_check_same_day_is_suppressed() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        h.scheduler.start().unwrap();

        assert!(h.scheduler.check().await.unwrap().notification_sent);
        let second = h.scheduler.check().await.unwrap();
        assert!(second.exceeded);
        assert!(!second.notification_sent);
        assert_eq!(h.sent.lock().len(), 1);
        // nothing changed, nothing rewritten
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_changes_nothing() {
        let mut h = harness(50.0, FakeSource::costing(40.23), true);
        let result = h.scheduler.run_once().await.unwrap();

        assert!(!result.exceeded);
        assert!(!result.notification_sent);
        assert_eq!(result.new_state, MonitorState::default());
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let mut h = harness(40.23, FakeSource::costing(40.23), true);
        assert!(!h.scheduler.run_once().await.unwrap().exceeded);
    }

    #[tokio::test]
    async fn test_new_day_rearms() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        h.scheduler.start().unwrap();
        assert!(h.scheduler.check().await.unwrap().notification_sent);

        h.clock.set(noon(2025, 7, 16));
        let next = h.scheduler.check().await.unwrap();
        assert!(next.notification_sent);
        assert_eq!(next.new_state.last_notification_date, Some(day(16)));
        assert_eq!(h.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_next_cycle() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        h.scheduler.start().unwrap();
        h.failing.store(true, Ordering::SeqCst);

        let err = h.scheduler.check().await.unwrap_err();
        assert!(matches!(err, MonitorError::SinkDeliveryFailed(_)));
        assert_eq!(
            h.store.snapshot(),
            Some(MonitorState {
                last_notification_date: None,
                last_exceedance_date: Some(day(15)),
            })
        );

        h.failing.store(false, Ordering::SeqCst);
        let retry = h.scheduler.check().await.unwrap();
        assert!(retry.notification_sent);
        assert_eq!(h.scheduler.stats().delivery_failures, 1);
        assert_eq!(h.scheduler.stats().notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_failed_state_write_is_retried_without_resending() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        h.scheduler.start().unwrap();
        h.failing_saves.store(1, Ordering::SeqCst);

        let err = h.scheduler.check().await.unwrap_err();
        assert!(matches!(err, MonitorError::State(_)));
        assert_eq!(err.exit_code(), 6);
        assert_eq!(h.store.snapshot(), None);
        assert_eq!(h.sent.lock().len(), 1);

        let next = h.scheduler.check().await.unwrap();
        assert!(next.exceeded);
        assert!(!next.notification_sent);
        assert_eq!(h.sent.lock().len(), 1);
        assert_eq!(
            h.store.snapshot(),
            Some(MonitorState {
                last_notification_date: Some(day(15)),
                last_exceedance_date: Some(day(15)),
            })
        );

        // on disk now; later cycles leave it alone
        h.scheduler.check().await.unwrap();
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_missing_sink_still_evaluates() {
        let mut h = harness(33.0, FakeSource::costing(40.23), false);
        let result = h.scheduler.run_once().await.unwrap();

        assert!(result.exceeded);
        assert!(!result.notification_sent);
        assert_eq!(result.new_state.last_notification_date, None);
        assert_eq!(result.new_state.last_exceedance_date, Some(day(15)));
    }

    #[tokio::test]
    async fn test_absent_period_is_benign() {
        let source = FakeSource::costing(40.23).then(Ok(None));
        let mut h = harness(33.0, source, true);
        let result = h.scheduler.run_once().await.unwrap();

        assert!(!result.exceeded);
        assert_eq!(h.store.writes(), 0);
        assert!(h.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces_from_single_cycle() {
        let source = FakeSource::costing(40.23).then(Err(FetchError::TooLarge { limit: 1 }));
        let mut h = harness(33.0, source, true);
        let err = h.scheduler.run_once().await.unwrap_err();

        assert!(matches!(err, MonitorError::Fetch(FetchError::TooLarge { .. })));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(h.scheduler.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_lock_held_by_live_process_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let holder = PidFileLock::new(dir.path());
        assert!(holder.acquire("monitor").unwrap());

        let mut scheduler = Scheduler::new(
            config(33.0),
            Arc::new(FixedClock::new(noon(2025, 7, 15))),
            FakeSource::costing(40.23),
            None::<RecordingSink>,
            Box::new(MemoryStateStore::new()),
            Box::new(PidFileLock::with_pid(dir.path(), std::process::id() + 1)),
        );
        let (_trigger, listener) = shutdown_channel();

        let err = scheduler.run(listener).await.unwrap_err();
        assert!(matches!(err, MonitorError::LockUnavailable { .. }));
        assert_eq!(scheduler.phase(), SchedulerPhase::Stopped);
        assert_eq!(scheduler.stats().cycles, 0);
    }

    #[tokio::test]
    async fn test_persisted_state_is_loaded_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let seeded = MonitorState {
            last_notification_date: Some(day(15)),
            last_exceedance_date: Some(day(15)),
        };
        let sink = RecordingSink::default();
        let sent = Arc::clone(&sink.sent);
        let mut scheduler = Scheduler::new(
            config(33.0),
            Arc::new(FixedClock::new(noon(2025, 7, 15))),
            FakeSource::costing(40.23),
            Some(sink),
            Box::new(MemoryStateStore::with_state(seeded)),
            Box::new(PidFileLock::new(dir.path())),
        );

        let result = scheduler.run_once().await.unwrap();
        assert!(!result.notification_sent);
        assert!(sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures_and_stops_on_shutdown() {
        let source = FakeSource::costing(40.23)
            .then(Err(FetchError::Timeout {
                after: Duration::from_secs(120),
            }))
            .then(Err(FetchError::TooLarge { limit: 1 }));
        let calls = Arc::clone(&source.calls);
        let closed = Arc::clone(&source.closed);
        let h = harness(33.0, source, true);
        let dir = h._dir.path().to_path_buf();
        let sent = Arc::clone(&h.sent);
        let mut scheduler = h.scheduler;
        let _dir = h._dir;

        let (trigger, listener) = shutdown_channel();
        let task = tokio::spawn(async move {
            let outcome = scheduler.run(listener).await;
            (outcome, scheduler)
        });

        while calls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        trigger.trigger();
        let (outcome, scheduler) = task.await.unwrap();

        outcome.unwrap();
        assert_eq!(scheduler.phase(), SchedulerPhase::Stopped);
        assert_eq!(scheduler.stats().fetch_failures, 2);
        assert_eq!(scheduler.stats().consecutive_failures, 0);
        assert_eq!(sent.lock().len(), 1);
        assert!(closed.load(Ordering::SeqCst));
        assert!(!dir.join("monitor.pid").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_tick_wait() {
        let mut h = harness(33.0, FakeSource::costing(1.0), true);
        h.scheduler.config.interval = Duration::from_secs(86_400);
        let mut scheduler = h.scheduler;

        let (trigger, listener) = shutdown_channel();
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(async move {
            scheduler.run(listener).await.unwrap();
            scheduler
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();
        let scheduler = task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(scheduler.stats().cycles, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_skips_cycles() {
        let mut h = harness(33.0, FakeSource::costing(40.23), true);
        let (trigger, listener) = shutdown_channel();
        trigger.trigger();

        let stats = h.scheduler.run(listener).await.unwrap();
        assert_eq!(stats.cycles, 0);
        assert_eq!(h.scheduler.phase(), SchedulerPhase::Stopped);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..7 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![30, 60, 120, 240, 480, 900, 900]);
    }
}
