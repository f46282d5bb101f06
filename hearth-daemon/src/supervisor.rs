//! Idle watchdog and exit deadline.
//!
//! [`Activity`] counts in-flight work and remembers when the last unit of
//! work finished. The server's idle watchdog shuts it down once nothing has
//! happened for the configured idle timeout.
//!
//! [`ExitDeadline`] bounds every process's lifetime after it has delivered
//! its result: once armed, the process is terminated with the decided exit
//! code after a short delay, whatever else is still running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::runtime::Shutdown;

pub struct Activity {
    in_flight: AtomicUsize,
    last: Mutex<Instant>,
    drained: Notify,
}

impl Default for Activity {
    fn default() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last: Mutex::new(Instant::now()),
            drained: Notify::new(),
        }
    }
}

impl Activity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark one unit of work as started. It ends when the guard drops.
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard {
            activity: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Time since work last started or finished. Zero while work is in flight.
    pub fn idle_for(&self) -> Duration {
        if self.in_flight() > 0 {
            return Duration::ZERO;
        }
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Wait until nothing is in flight, for at most `grace`. Returns whether
    /// the server drained in time.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

pub struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.touch();
        if self.activity.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.activity.drained.notify_waiters();
        }
    }
}

/// Request a graceful shutdown once the server has been idle for `idle_timeout`.
pub async fn idle_watchdog(
    activity: Arc<Activity>,
    idle_timeout: Duration,
    shutdown_tx: broadcast::Sender<Shutdown>,
    mut shutdown_rx: broadcast::Receiver<Shutdown>,
) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            tracing::info!(idle_secs = idle.as_secs(), "idle timeout reached, shutting down");
            let _ = shutdown_tx.send(Shutdown::Graceful);
            return;
        }
        // Re-check at the earliest moment the timeout could expire.
        let wait = (idle_timeout - idle).max(Duration::from_millis(50));
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

type Terminator = Arc<dyn Fn(i32) + Send + Sync>;

/// Unconditional process termination, armed after the result is delivered.
pub struct ExitDeadline {
    delay: Duration,
    terminate: Terminator,
}

impl ExitDeadline {
    /// A deadline that ends the process with [`std::process::exit`].
    pub fn new(delay: Duration) -> Self {
        Self::with_terminator(delay, |code| {
            std::process::exit(code);
        })
    }

    pub fn with_terminator(delay: Duration, terminate: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            delay,
            terminate: Arc::new(terminate),
        }
    }

    /// Start the countdown. Call only after output is flushed and `code` is final.
    pub fn arm(self, code: i32) -> ArmedDeadline {
        let countdown = Arc::new(Countdown::default());
        let watched = countdown.clone();
        let spawned = std::thread::Builder::new()
            .name("exit-deadline".to_string())
            .spawn(move || {
                let cancelled = watched
                    .cancelled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let (cancelled, _) = watched
                    .wake
                    .wait_timeout_while(cancelled, self.delay, |cancelled| !*cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                let fire = !*cancelled;
                drop(cancelled);
                if fire {
                    (self.terminate)(code);
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "could not arm exit deadline");
        }
        ArmedDeadline { countdown }
    }
}

#[derive(Default)]
struct Countdown {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// A running countdown. Dropping it leaves the countdown running; only
/// [`disarm`](Self::disarm) stops it.
pub struct ArmedDeadline {
    countdown: Arc<Countdown>,
}

impl ArmedDeadline {
    pub fn disarm(self) {
        *self
            .countdown
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.countdown.wake.notify_all();
    }
}
