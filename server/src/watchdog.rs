//! Script execution watchdog
//!
//! The main loop marks the start of every script call. A tokio task polls
//! the start instant and raises the abort flag when a call runs past the
//! limit; script hosts check the flag between statements.

use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_SCRIPT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Inner {
    started: Mutex<Option<Instant>>,
    abort: AtomicBool,
    limit: Duration,
}

/// Shared between the main loop and the polling task
#[derive(Debug, Clone)]
pub struct ScriptWatchdog {
    inner: Arc<Inner>,
}

impl ScriptWatchdog {
    pub fn new(limit: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Mutex::new(None),
                abort: AtomicBool::new(false),
                limit,
            }),
        }
    }

    fn started(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.inner.started.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A script call is starting
    pub fn begin(&self) {
        *self.started() = Some(Instant::now());
        self.inner.abort.store(false, Ordering::SeqCst);
    }

    /// The script call returned; true when it had been aborted
    pub fn end(&self) -> bool {
        *self.started() = None;
        self.inner.abort.swap(false, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.started().is_some()
    }

    pub fn should_abort(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    /// Raises the abort flag when the running call is over the limit
    pub fn check(&self, now: Instant) -> bool {
        let mut started = self.started();
        let Some(start) = *started else {
            return false;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed <= self.inner.limit {
            return false;
        }
        *started = None;
        self.inner.abort.store(true, Ordering::SeqCst);
        warn!("Script ran for {:?}, requesting abort", elapsed);
        true
    }

    /// Starts the polling task
    pub fn spawn(&self, poll: Duration) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                watchdog.check(Instant::now());
            }
        })
    }
}

impl Default for ScriptWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_LIMIT)
    }
}
