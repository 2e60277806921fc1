use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{FetchError, WatchError};
use crate::job::{Job, JobId, JobReport, JobStatus, Transition};

/// Anything that can read the current status of a survey job.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn fetch_progress(&self, job_id: &str) -> Result<JobReport, FetchError>;
}

/// Polling parameters (admins can modify at runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    /// Consecutive fetch failures tolerated before the watch gives up.
    pub retry_limit: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            retry_limit: 0,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self::parse(
            dotenv::var("SURVEY_POLL_INTERVAL_MS").ok().as_deref(),
            dotenv::var("SURVEY_POLL_RETRY_LIMIT").ok().as_deref(),
        )
    }

    /// Build from raw setting values. Missing, unparsable or zero intervals
    /// fall back to the defaults.
    pub fn parse(poll_interval_ms: Option<&str>, retry_limit: Option<&str>) -> Self {
        let defaults = Self::default();
        let poll_interval = poll_interval_ms
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let retry_limit = retry_limit
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.retry_limit);

        Self {
            poll_interval,
            retry_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Polling,
    Completed,
    Failed,
    Cancelled,
    Errored,
}

impl WatchPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WatchPhase::Idle | WatchPhase::Polling)
    }
}

/// What a consumer displays for a watched job.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSnapshot {
    pub phase: WatchPhase,
    pub status: Option<JobStatus>,
    pub progress_percent: u8,
    pub progress_message: String,
    pub is_loading: bool,
}

impl WatchSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: WatchPhase::Idle,
            status: None,
            progress_percent: 0,
            progress_message: String::new(),
            is_loading: false,
        }
    }

    fn polling() -> Self {
        Self {
            phase: WatchPhase::Polling,
            is_loading: true,
            ..Self::idle()
        }
    }

    fn of(job: &Job, phase: WatchPhase) -> Self {
        Self {
            phase,
            status: Some(job.status),
            progress_percent: job.progress_percent(),
            progress_message: job.progress_message.clone(),
            is_loading: !phase.is_terminal(),
        }
    }
}

/// One-shot notifications. Each watch emits at most one of these.
#[derive(Debug)]
pub enum WatchEvent {
    /// The job finished; its document body and source list are captured.
    Completed(Job),
    Failed { message: String },
    Cancelled { message: String },
    /// Polling stopped because the status could not be read.
    Errored(FetchError),
}

pub struct ProgressWatcher {
    source: Arc<dyn ProgressSource>,
    config: WatchConfig,
}

impl ProgressWatcher {
    pub fn new(source: Arc<dyn ProgressSource>, config: WatchConfig) -> Self {
        Self { source, config }
    }

    /// Start polling `job_id`. The first fetch is issued immediately.
    ///
    /// An empty id never starts a poll loop; consumers should show
    /// [`WatchSnapshot::idle`] in that case.
    pub fn start(&self, job_id: &str) -> Result<WatchHandle, WatchError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(WatchError::InvalidInput);
        }

        let stopper = WatchStopper::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(WatchSnapshot::polling());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let poll = PollLoop {
            source: Arc::clone(&self.source),
            job: Job::new(job_id),
            config: self.config.clone(),
            stopper: stopper.clone(),
            snapshot_tx,
            event_tx,
        };
        info!(job_id, interval_ms = self.config.poll_interval.as_millis() as u64, "Watch started");
        let task = tokio::spawn(poll.run());

        Ok(WatchHandle {
            job_id: job_id.to_string(),
            stopper,
            snapshot: snapshot_rx,
            events: event_rx,
            task,
        })
    }
}

/// Tears a watch down from anywhere. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WatchStopper {
    alive: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WatchStopper {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Whether both stoppers control the same watch.
    pub fn same_watch(&self, other: &WatchStopper) -> bool {
        Arc::ptr_eq(&self.alive, &other.alive)
    }

    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Default for WatchStopper {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a running watch. Dropping it stops the watch.
pub struct WatchHandle {
    job_id: JobId,
    stopper: WatchStopper,
    snapshot: watch::Receiver<WatchSnapshot>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn snapshot(&self) -> WatchSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the next snapshot change. `None` once the poll loop has ended.
    pub async fn changed(&mut self) -> Option<WatchSnapshot> {
        self.snapshot.changed().await.ok()?;
        Some(self.snapshot.borrow_and_update().clone())
    }

    /// A separate receiver for snapshot changes, usable alongside
    /// [`WatchHandle::next_event`].
    pub fn subscribe(&self) -> watch::Receiver<WatchSnapshot> {
        self.snapshot.clone()
    }

    /// Wait for the one-shot terminal event. `None` if the watch ended without
    /// one (it was stopped) or the event was already taken.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn stopper(&self) -> WatchStopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stopper.stop();
    }
}

struct PollLoop {
    source: Arc<dyn ProgressSource>,
    job: Job,
    config: WatchConfig,
    stopper: WatchStopper,
    snapshot_tx: watch::Sender<WatchSnapshot>,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
}

impl PollLoop {
    async fn run(mut self) {
        let job_id = self.job.job_id.clone();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stopper.wake.notified() => {}
            }
            if !self.stopper.is_alive() {
                debug!(job_id = %job_id, "Watch stopped before next poll");
                return;
            }

            let result = self.source.fetch_progress(&job_id).await;

            // The consumer may have gone away while the request was in flight
            if !self.stopper.is_alive() {
                debug!(job_id = %job_id, "Watch stopped, discarding late response");
                return;
            }

            let report = match result {
                Ok(report) => {
                    failures = 0;
                    report
                }
                Err(e) if failures < self.config.retry_limit => {
                    failures += 1;
                    warn!(job_id = %job_id, failures, error = %e, "Progress fetch failed, will retry");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Progress fetch failed, stopping watch");
                    let last = self.snapshot_tx.borrow().clone();
                    self.snapshot_tx.send_replace(WatchSnapshot {
                        phase: WatchPhase::Errored,
                        is_loading: false,
                        ..last
                    });
                    let _ = self.event_tx.send(WatchEvent::Errored(e));
                    return;
                }
            };

            match self.job.apply(report) {
                Transition::Progressed => {
                    debug!(
                        job_id = %job_id,
                        status = %self.job.status,
                        percent = self.job.progress_percent(),
                        "Progress update"
                    );
                    self.snapshot_tx
                        .send_replace(WatchSnapshot::of(&self.job, WatchPhase::Polling));
                }
                Transition::Finished(status) => {
                    self.finish(status);
                    return;
                }
                Transition::Ignored => {}
            }
        }
    }

    fn finish(self, status: JobStatus) {
        let phase = match status {
            JobStatus::Completed => WatchPhase::Completed,
            JobStatus::Cancelled => WatchPhase::Cancelled,
            _ => WatchPhase::Failed,
        };
        info!(job_id = %self.job.job_id, %status, "Watch finished");
        self.snapshot_tx
            .send_replace(WatchSnapshot::of(&self.job, phase));

        let message = self.job.progress_message.clone();
        let event = match phase {
            WatchPhase::Completed => WatchEvent::Completed(self.job),
            WatchPhase::Cancelled => WatchEvent::Cancelled { message },
            _ => WatchEvent::Failed { message },
        };
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::job::SourceRecord;

    /// Replays canned responses, then reports "processing" forever.
    #[derive(Default)]
    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<JobReport, FetchError>>>,
        calls: AtomicUsize,
        fetched_at: Mutex<Vec<Instant>>,
        latency: Option<Duration>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<JobReport, FetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProgressSource for ScriptedSource {
        async fn fetch_progress(&self, _job_id: &str) -> Result<JobReport, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fetched_at.lock().unwrap().push(Instant::now());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(JobReport::progress(JobStatus::Processing, 0.5, "working")))
        }
    }

    fn watcher(source: &Arc<ScriptedSource>) -> ProgressWatcher {
        ProgressWatcher::new(source.clone(), WatchConfig::default())
    }

    fn api_error() -> FetchError {
        FetchError::Api {
            code: 102,
            message: "survey not found".to_string(),
        }
    }

    #[test]
    fn test_config_parse_values() {
        let config = WatchConfig::parse(Some(" 5000 "), Some("3"));
        assert_eq!(config.poll_interval, Duration::from_millis(5000));
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn test_config_parse_falls_back_to_defaults() {
        assert_eq!(WatchConfig::parse(None, None), WatchConfig::default());
        assert_eq!(WatchConfig::parse(Some("0"), Some("-1")), WatchConfig::default());
        assert_eq!(
            WatchConfig::parse(Some("fast"), Some("")).poll_interval,
            Duration::from_millis(2000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_id_never_polls() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let w = watcher(&source);

        assert_eq!(w.start("").err(), Some(WatchError::InvalidInput));
        assert_eq!(w.start("   ").err(), Some(WatchError::InvalidInput));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 0);
        assert!(!WatchSnapshot::idle().is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_then_completed() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(JobReport::progress(JobStatus::Processing, 0.2, "Reading papers")),
            Ok(JobReport::completed("See ##1$$.", vec![SourceRecord::titled("X")])),
        ]));
        let mut handle = watcher(&source).start("abc").unwrap();
        assert!(handle.snapshot().is_loading);

        let snap = handle.changed().await.unwrap();
        assert_eq!(snap.status, Some(JobStatus::Processing));
        assert_eq!(snap.progress_percent, 20);
        assert_eq!(snap.progress_message, "Reading papers");
        assert!(snap.is_loading);

        let Some(WatchEvent::Completed(job)) = handle.next_event().await else {
            panic!("expected completion event");
        };
        let doc = job.processed_document().unwrap();
        assert_eq!(doc.display_document, "See [1].");
        assert_eq!(doc.citation_map.get(&1).map(String::as_str), Some("X"));

        let snap = handle.snapshot();
        assert_eq!(snap.phase, WatchPhase::Completed);
        assert_eq!(snap.progress_percent, 100);
        assert!(!snap.is_loading);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.calls(), 2);
        assert!(handle.next_event().await.is_none());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_terminal_payloads_notify_once() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(JobReport::completed("body", vec![])),
            Ok(JobReport::completed("body again", vec![])),
            Ok(JobReport::completed("body again", vec![])),
        ]));
        let mut handle = watcher(&source).start("abc").unwrap();

        assert!(matches!(
            handle.next_event().await,
            Some(WatchEvent::Completed(_))
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(handle.next_event().await.is_none());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_reports_message() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(JobReport::progress(JobStatus::Pending, 0.0, "Queued")),
            Ok(JobReport::progress(JobStatus::Failed, 0.3, "Model quota exceeded")),
        ]));
        let mut handle = watcher(&source).start("abc").unwrap();

        match handle.next_event().await {
            Some(WatchEvent::Failed { message }) => assert_eq!(message, "Model quota exceeded"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(handle.snapshot().phase, WatchPhase::Failed);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(JobReport::progress(
            JobStatus::Cancelled,
            0.0,
            "Task cancelled",
        ))]));
        let mut handle = watcher(&source).start("abc").unwrap();

        assert!(matches!(
            handle.next_event().await,
            Some(WatchEvent::Cancelled { .. })
        ));
        assert!(!handle.snapshot().is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_stops_without_retry() {
        let source = Arc::new(ScriptedSource::new(vec![Err(api_error())]));
        let mut handle = watcher(&source).start("abc").unwrap();

        assert!(matches!(
            handle.next_event().await,
            Some(WatchEvent::Errored(FetchError::Api { code: 102, .. }))
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(handle.snapshot().phase, WatchPhase::Errored);
        assert!(!handle.snapshot().is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_tolerates_failures() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(api_error()),
            Ok(JobReport::completed("done", vec![])),
        ]));
        let config = WatchConfig {
            retry_limit: 1,
            ..Default::default()
        };
        let mut handle = ProgressWatcher::new(source.clone(), config)
            .start("abc")
            .unwrap();

        assert!(matches!(
            handle.next_event().await,
            Some(WatchEvent::Completed(_))
        ));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_response() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource {
            gate: Some(gate.clone()),
            ..ScriptedSource::new(vec![Ok(JobReport::completed("late", vec![]))])
        });
        let mut handle = watcher(&source).start("abc").unwrap();

        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        handle.stop();
        gate.notify_one();

        assert!(handle.next_event().await.is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(handle.snapshot(), WatchSnapshot::polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let handle = watcher(&source).start("abc").unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(source.calls(), 3);
        drop(handle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_cadence_from_loop_start() {
        let source = Arc::new(ScriptedSource {
            latency: Some(Duration::from_millis(500)),
            ..ScriptedSource::new(vec![])
        });
        let handle = watcher(&source).start("abc").unwrap();

        tokio::time::sleep(Duration::from_millis(6100)).await;
        handle.stop();

        let times = source.fetched_at.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
        }
    }
}
