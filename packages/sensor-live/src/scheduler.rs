use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::multiplexer::panic_message;
use crate::traits::{PauseNotice, RefreshNotifier, RefreshOperation};

/// Backoff policy of the refresh loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Interval after a successful refresh
    pub base_interval: Duration,
    /// Longest interval backoff may reach
    pub cap_interval: Duration,
    /// Consecutive failures after which auto-refresh pauses
    pub max_retries: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(60_000),
            cap_interval: Duration::from_millis(300_000),
            max_retries: 3,
        }
    }
}

impl RefreshPolicy {
    /// `min(base × 2^error_count, cap)`
    pub fn backoff_interval(&self, error_count: u32) -> Duration {
        let factor = 2u32.checked_pow(error_count).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.cap_interval)
            .min(self.cap_interval)
    }
}

/// Where the refresh loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    /// Waiting for the next regular run
    Scheduled,
    /// The refresh operation is in flight
    Running,
    /// Waiting for a retry after a failure
    BackoffScheduled,
    /// Gave up; only `resume()` leaves this state
    Paused,
    /// The loop has shut down
    Stopped,
}

/// What the loop does after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Arm(Duration),
    Pause,
}

/// Failure and timing state owned by the refresh loop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshState {
    pub phase: RefreshPhase,
    pub error_count: u32,
    pub current_interval: Duration,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    /// Refresh attempts so far
    pub runs: u64,
}

impl RefreshState {
    pub fn new(policy: &RefreshPolicy) -> Self {
        Self {
            phase: RefreshPhase::Scheduled,
            error_count: 0,
            current_interval: policy.base_interval,
            last_error: None,
            last_success: None,
            runs: 0,
        }
    }

    pub fn record_success(&mut self, policy: &RefreshPolicy) -> Transition {
        self.error_count = 0;
        self.current_interval = policy.base_interval;
        self.last_error = None;
        self.last_success = Some(Utc::now());
        self.phase = RefreshPhase::Scheduled;
        Transition::Arm(self.current_interval)
    }

    /// The ceiling is checked on the failure count, not on the interval
    pub fn record_failure(&mut self, policy: &RefreshPolicy, error: String) -> Transition {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error);

        if self.error_count >= policy.max_retries {
            self.phase = RefreshPhase::Paused;
            return Transition::Pause;
        }

        self.current_interval = policy.backoff_interval(self.error_count);
        self.phase = RefreshPhase::BackoffScheduled;
        Transition::Arm(self.current_interval)
    }

    pub fn reset(&mut self, policy: &RefreshPolicy) {
        self.error_count = 0;
        self.current_interval = policy.base_interval;
        self.phase = RefreshPhase::Scheduled;
    }

    pub fn is_paused(&self) -> bool {
        self.phase == RefreshPhase::Paused
    }
}

enum Command {
    Resume,
    Shutdown,
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl RefreshNotifier for LogNotifier {
    fn paused(&self, notice: &PauseNotice) {
        warn!("{}", notice.message());
    }

    fn resumed(&self) {
        info!("Auto-refresh resumed");
    }
}

/// Drives one refresh operation on an adaptive timer
pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Start the loop; the first run happens immediately
    pub fn spawn(
        operation: Arc<dyn RefreshOperation>,
        policy: RefreshPolicy,
        notifier: Arc<dyn RefreshNotifier>,
    ) -> RefreshController {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RefreshState::new(&policy));

        let task = tokio::spawn(async move {
            let mut driver = Driver {
                operation,
                policy,
                notifier,
                state: RefreshState::new(&policy),
                state_tx,
            };
            driver.run(cmd_rx).await;
        });

        RefreshController {
            cmd_tx,
            state_rx,
            task,
        }
    }
}

/// Handle to a running refresh loop
pub struct RefreshController {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<RefreshState>,
    task: JoinHandle<()>,
}

impl RefreshController {
    /// Leave `Paused` and refresh immediately; ignored in any other phase
    pub fn resume(&self) -> bool {
        self.cmd_tx.send(Command::Resume).is_ok()
    }

    /// Stop the loop and cancel any pending timer
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Current state snapshot
    pub fn state(&self) -> RefreshState {
        self.state_rx.borrow().clone()
    }

    /// Observe state changes, e.g. to show or hide a "paused" banner
    pub fn watch(&self) -> watch::Receiver<RefreshState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> RefreshState
    where
        F: FnMut(&RefreshState) -> bool,
    {
        let mut rx = self.state_rx.clone();
        if let Ok(state) = rx.wait_for(predicate).await {
            return state.clone();
        }
        // The loop is gone; report its final state
        let state = rx.borrow().clone();
        state
    }

    /// Wait for the loop task to finish after `shutdown()`
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct Driver {
    operation: Arc<dyn RefreshOperation>,
    policy: RefreshPolicy,
    notifier: Arc<dyn RefreshNotifier>,
    state: RefreshState,
    state_tx: watch::Sender<RefreshState>,
}

/// What the loop does after one run
enum Step {
    Arm(Pin<Box<Sleep>>),
    /// Leave the pending timer as it is
    Keep,
    Idle,
    Stop,
}

impl Driver {
    async fn run(&mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Auto-refresh started (base={:?}, cap={:?}, max_retries={})",
            self.policy.base_interval, self.policy.cap_interval, self.policy.max_retries
        );

        // The single authoritative pending timer; replacing it cancels the old one
        let mut timer = None;
        let mut step = self.execute(&mut cmd_rx).await;

        loop {
            match step {
                Step::Arm(next) => timer = Some(next),
                Step::Keep => {}
                Step::Idle => timer = None,
                Step::Stop => break,
            }

            step = tokio::select! {
                _ = wait_timer(&mut timer) => self.execute(&mut cmd_rx).await,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Resume) if self.state.is_paused() => {
                            self.state.reset(&self.policy);
                            self.notifier.resumed();
                            self.execute(&mut cmd_rx).await
                        }
                        Some(Command::Resume) => {
                            debug!("Resume ignored, auto-refresh is not paused");
                            Step::Keep
                        }
                        Some(Command::Shutdown) | None => Step::Stop,
                    }
                }
            };
        }

        drop(timer);
        self.state.phase = RefreshPhase::Stopped;
        self.publish();
        info!("Auto-refresh stopped");
    }

    /// One Running step; a shutdown received meanwhile cancels the operation
    async fn execute(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Step {
        self.state.phase = RefreshPhase::Running;
        self.state.runs += 1;
        self.publish();

        let operation = self.operation.clone();
        let refresh = AssertUnwindSafe(operation.refresh()).catch_unwind();
        tokio::pin!(refresh);

        let outcome = loop {
            tokio::select! {
                outcome = &mut refresh => break outcome,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Resume) => debug!("Resume ignored, a refresh is in flight"),
                    Some(Command::Shutdown) | None => {
                        info!("Refresh cancelled by shutdown");
                        return Step::Stop;
                    }
                },
            }
        };

        let result = match outcome {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(format!(
                "refresh operation panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        let transition = match result {
            Ok(()) => {
                if self.state.error_count > 0 {
                    info!("Refresh recovered after {} failures", self.state.error_count);
                }
                self.state.record_success(&self.policy)
            }
            Err(e) => {
                let transition = self.state.record_failure(&self.policy, e);
                warn!(
                    "Refresh failed ({}/{}): {}",
                    self.state.error_count,
                    self.policy.max_retries,
                    self.state.last_error.as_deref().unwrap_or_default()
                );
                transition
            }
        };

        let step = match transition {
            Transition::Arm(delay) => {
                debug!("Next refresh in {:?}", delay);
                Step::Arm(Box::pin(sleep(delay)))
            }
            Transition::Pause => {
                let notice = PauseNotice {
                    error_count: self.state.error_count,
                    last_error: self.state.last_error.clone().unwrap_or_default(),
                };
                self.notifier.paused(&notice);
                Step::Idle
            }
        };

        self.publish();
        step
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{LiveError, LiveResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Operation whose outcomes are scripted; succeeds once the script runs out
    struct ScriptedOperation {
        outcomes: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedOperation {
        fn new(outcomes: impl IntoIterator<Item = bool>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn offsets(&self, start: Instant) -> Vec<Duration> {
            self.calls.lock().iter().map(|t| *t - start).collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl RefreshOperation for ScriptedOperation {
        async fn refresh(&self) -> LiveResult<()> {
            self.calls.lock().push(Instant::now());
            let ok = self.outcomes.lock().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(LiveError::Internal("server unavailable".to_string()))
            }
        }
    }

    /// Operation that panics on the listed (1-based) calls, or on every call
    struct PanickingOperation {
        calls: Mutex<usize>,
        panics_on: Option<Vec<usize>>,
    }

    impl PanickingOperation {
        fn on_calls(calls: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                panics_on: Some(calls.to_vec()),
            })
        }

        fn always() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                panics_on: None,
            })
        }
    }

    #[async_trait]
    impl RefreshOperation for PanickingOperation {
        async fn refresh(&self) -> LiveResult<()> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            let panics = match &self.panics_on {
                Some(calls) => calls.contains(&call),
                None => true,
            };
            if panics {
                panic!("sensor backend exploded");
            }
            Ok(())
        }
    }

    /// Operation that takes a long time and records whether it finished
    #[derive(Default)]
    struct SlowOperation {
        started: Mutex<usize>,
        finished: Mutex<usize>,
    }

    #[async_trait]
    impl RefreshOperation for SlowOperation {
        async fn refresh(&self) -> LiveResult<()> {
            *self.started.lock() += 1;
            sleep(Duration::from_secs(30)).await;
            *self.finished.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        paused: Mutex<Vec<PauseNotice>>,
        resumed: Mutex<usize>,
    }

    impl RefreshNotifier for RecordingNotifier {
        fn paused(&self, notice: &PauseNotice) {
            self.paused.lock().push(notice.clone());
        }

        fn resumed(&self) {
            *self.resumed.lock() += 1;
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_backoff_interval_is_capped() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.backoff_interval(0), secs(60));
        assert_eq!(policy.backoff_interval(1), secs(120));
        assert_eq!(policy.backoff_interval(2), secs(240));
        assert_eq!(policy.backoff_interval(3), secs(300));
        assert_eq!(policy.backoff_interval(40), secs(300));
    }

    #[test]
    fn test_state_transitions() {
        let policy = RefreshPolicy::default();
        let mut state = RefreshState::new(&policy);

        assert_eq!(state.record_failure(&policy, "e1".into()), Transition::Arm(secs(120)));
        assert_eq!(state.phase, RefreshPhase::BackoffScheduled);
        assert_eq!(state.record_failure(&policy, "e2".into()), Transition::Arm(secs(240)));
        assert_eq!(state.record_failure(&policy, "e3".into()), Transition::Pause);
        assert!(state.is_paused());
        assert_eq!(state.error_count, 3);

        state.reset(&policy);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.current_interval, secs(60));
        assert_eq!(state.record_success(&policy), Transition::Arm(secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_then_pause() {
        let start = Instant::now();
        let op = ScriptedOperation::new([false, false, false]);
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), notifier.clone());

        let state = controller.wait_for(|s| s.is_paused()).await;
        assert_eq!(state.error_count, 3);
        assert_eq!(state.last_error.as_deref(), Some("Internal error: server unavailable"));
        assert_eq!(op.offsets(start), vec![secs(0), secs(120), secs(360)]);

        let notices = notifier.paused.lock().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].error_count, 3);

        // Nothing is armed while paused
        sleep(secs(3600)).await;
        assert_eq!(op.call_count(), 3);
        assert!(controller.state().is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let start = Instant::now();
        let op = ScriptedOperation::new([false, true]);
        let controller =
            RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), Arc::new(LogNotifier));

        let state = controller
            .wait_for(|s| s.phase == RefreshPhase::Scheduled && s.runs == 3)
            .await;
        assert_eq!(op.offsets(start), vec![secs(0), secs(120), secs(180)]);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.current_interval, secs(60));
        assert!(state.last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_pause_runs_immediately() {
        let op = ScriptedOperation::new([false, false, false, true]);
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), notifier.clone());

        controller.wait_for(|s| s.is_paused()).await;
        let paused_at = Instant::now();

        assert!(controller.resume());
        let state = controller
            .wait_for(|s| s.runs == 4 && s.phase == RefreshPhase::Scheduled)
            .await;

        assert_eq!(state.error_count, 0);
        assert_eq!(state.current_interval, secs(60));
        assert_eq!(op.offsets(paused_at).last().copied(), Some(secs(0)));
        assert_eq!(*notifier.resumed.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_is_ignored_unless_paused() {
        let op = ScriptedOperation::new([]);
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), notifier.clone());

        controller.wait_for(|s| s.runs == 1 && s.phase == RefreshPhase::Scheduled).await;
        controller.resume();
        sleep(secs(1)).await;

        assert_eq!(op.call_count(), 1);
        assert_eq!(*notifier.resumed.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_interval_keeps_single_timer() {
        let op = ScriptedOperation::new([]);
        let controller =
            RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), Arc::new(LogNotifier));

        sleep(secs(630)).await;
        // 0, 60, ..., 600
        assert_eq!(op.call_count(), 11);
        controller.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let op = ScriptedOperation::new([]);
        let controller =
            RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), Arc::new(LogNotifier));

        controller.wait_for(|s| s.runs == 1 && s.phase == RefreshPhase::Scheduled).await;
        controller.shutdown();
        let mut watch = controller.watch();
        controller.join().await;

        assert_eq!(watch.borrow_and_update().phase, RefreshPhase::Stopped);
        sleep(secs(600)).await;
        assert_eq!(op.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_refresh_counts_as_failure() {
        let op = PanickingOperation::on_calls(&[2]);
        let controller =
            RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), Arc::new(LogNotifier));

        let state = controller
            .wait_for(|s| s.runs == 2 && s.phase == RefreshPhase::BackoffScheduled)
            .await;
        assert_eq!(state.error_count, 1);
        assert_eq!(state.current_interval, secs(120));
        assert_eq!(
            state.last_error.as_deref(),
            Some("refresh operation panicked: sensor backend exploded")
        );

        // The loop survived and recovers on the next run
        let state = controller
            .wait_for(|s| s.runs == 3 && s.phase == RefreshPhase::Scheduled)
            .await;
        assert_eq!(state.error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_panics_pause_and_resume_still_works() {
        let op = PanickingOperation::always();
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), notifier.clone());

        let state = controller.wait_for(|s| s.is_paused()).await;
        assert_eq!(state.runs, 3);
        assert_eq!(notifier.paused.lock().len(), 1);

        sleep(secs(600)).await;
        assert!(controller.state().is_paused());

        assert!(controller.resume());
        let state = controller
            .wait_for(|s| s.runs == 4 && s.phase == RefreshPhase::BackoffScheduled)
            .await;
        assert_eq!(state.error_count, 1);
        assert_eq!(*notifier.resumed.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_refresh_in_flight() {
        let op = Arc::new(SlowOperation::default());
        let controller =
            RefreshScheduler::spawn(op.clone(), RefreshPolicy::default(), Arc::new(LogNotifier));

        controller.wait_for(|s| s.runs == 1 && s.phase == RefreshPhase::Running).await;
        // Resume while running is ignored and does not start a second run
        controller.resume();
        controller.shutdown();
        let mut watch = controller.watch();
        controller.join().await;

        assert_eq!(watch.borrow_and_update().phase, RefreshPhase::Stopped);
        sleep(secs(120)).await;
        assert_eq!(*op.started.lock(), 1);
        assert_eq!(*op.finished.lock(), 0);
    }
}
