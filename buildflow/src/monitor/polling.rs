//! Periodic condition polling with timeout enforcement.
//!
//! Each monitor runs its own ticker task that evaluates the condition on a
//! fixed-delay schedule starting immediately. Timeouts are enforced by one
//! shared sweeper task scanning every registered monitor at a fixed period,
//! so a ticker delayed by a slow condition cannot postpone its own timeout.

use crate::config::MonitorConfig;
use crate::errors::MonitorError;
use dashmap::DashMap;
use futures::Future;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

type MonitorOutcome = Result<(), MonitorError>;

struct RunningTask {
    id: u64,
    started: Instant,
    timeout: Duration,
    done: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    sender: Mutex<Option<oneshot::Sender<MonitorOutcome>>>,
}

impl RunningTask {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.timeout
    }

    /// Signals the outcome. Only the first caller wins.
    fn finish(&self, outcome: MonitorOutcome) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        if let Some(sender) = self.sender.lock().take() {
            // The receiver may already be gone; nobody is waiting then.
            let _ = sender.send(outcome);
        }
        true
    }
}

struct MonitorInner {
    tasks: DashMap<u64, Arc<RunningTask>>,
    next_id: AtomicU64,
    config: MonitorConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MonitorInner {
    fn complete(&self, task: &RunningTask, outcome: MonitorOutcome) -> bool {
        let finished = task.finish(outcome);
        if finished {
            self.tasks.remove(&task.id);
        }
        finished
    }

    fn sweep(&self) {
        let now = Instant::now();
        // Collect first; removing while iterating would deadlock the shard.
        let expired: Vec<Arc<RunningTask>> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        for task in expired {
            debug!(monitor_id = task.id, timeout = ?task.timeout, "Monitor timed out");
            self.complete(
                &task,
                Err(MonitorError::Timeout {
                    timeout: task.timeout,
                }),
            );
        }
    }
}

/// A shared polling monitor.
///
/// Cloning is cheap; all clones share one registry and one sweeper.
/// [`PollingMonitor::monitor`] must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct PollingMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for PollingMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PollingMonitor {
    /// Creates a monitor. The sweeper starts with the first registration.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                config,
                sweeper: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Polls `condition` every `check_interval` until it returns `Ok(true)`.
    ///
    /// The handle resolves to `Ok(())` on success, to
    /// [`MonitorError::Timeout`] once `timeout` has elapsed, and to
    /// [`MonitorError::Condition`] the first time the condition fails. The
    /// condition is never evaluated again after the handle resolves. Dropping
    /// the handle does not stop polling; use [`MonitorHandle::canceller`].
    pub fn monitor<F, Fut>(
        &self,
        mut condition: F,
        check_interval: Duration,
        timeout: Duration,
    ) -> MonitorHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(RunningTask {
            id,
            started: Instant::now(),
            timeout,
            done: AtomicBool::new(false),
            ticker: Mutex::new(None),
            sender: Mutex::new(Some(sender)),
        });
        let canceller = MonitorCanceller {
            task: task.clone(),
            inner: Arc::downgrade(&self.inner),
        };

        if self.inner.shut_down.load(Ordering::SeqCst) {
            task.finish(Err(MonitorError::Cancelled));
            return MonitorHandle {
                receiver,
                canceller,
            };
        }

        self.ensure_sweeper();
        self.inner.tasks.insert(id, task.clone());

        let inner = self.inner.clone();
        let ticking = task.clone();
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(check_interval.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if ticking.is_done() {
                    break;
                }
                match condition().await {
                    Ok(true) => {
                        inner.complete(&ticking, Ok(()));
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(monitor_id = ticking.id, error = %format!("{e:#}"), "Monitored condition failed");
                        inner.complete(&ticking, Err(MonitorError::Condition(format!("{e:#}"))));
                        break;
                    }
                }
            }
        });
        if task.is_done() {
            ticker.abort();
        } else {
            *task.ticker.lock() = Some(ticker);
            // A concurrent finish may have missed the handle.
            if task.is_done() {
                if let Some(ticker) = task.ticker.lock().take() {
                    ticker.abort();
                }
            }
        }

        MonitorHandle {
            receiver,
            canceller,
        }
    }

    /// Number of monitors still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Stops the sweeper and cancels every registered monitor.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        let tasks: Vec<Arc<RunningTask>> =
            self.inner.tasks.iter().map(|e| e.value().clone()).collect();
        for task in tasks {
            self.inner.complete(&task, Err(MonitorError::Cancelled));
        }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_period().max(Duration::from_millis(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep();
            }
        }));
    }
}

impl std::fmt::Debug for PollingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingMonitor")
            .field("active", &self.active())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Cancels one monitor. Safe to call from any thread, any number of times.
#[derive(Clone)]
pub struct MonitorCanceller {
    task: Arc<RunningTask>,
    inner: Weak<MonitorInner>,
}

impl MonitorCanceller {
    /// Cancels the monitor. Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.complete(&self.task, Err(MonitorError::Cancelled)),
            None => self.task.finish(Err(MonitorError::Cancelled)),
        }
    }

    /// Returns true once the monitor has resolved.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_done()
    }
}

impl std::fmt::Debug for MonitorCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorCanceller")
            .field("id", &self.task.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Resolves once the monitored condition holds, fails or times out.
#[must_use = "a monitor handle does nothing unless awaited or cancelled"]
pub struct MonitorHandle {
    receiver: oneshot::Receiver<MonitorOutcome>,
    canceller: MonitorCanceller,
}

impl MonitorHandle {
    /// Returns a canceller that can be moved to other tasks.
    #[must_use]
    pub fn canceller(&self) -> MonitorCanceller {
        self.canceller.clone()
    }

    /// Cancels the monitor.
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }
}

impl Future for MonitorHandle {
    type Output = MonitorOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(MonitorError::Cancelled)))
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("canceller", &self.canceller)
            .finish()
    }
}
