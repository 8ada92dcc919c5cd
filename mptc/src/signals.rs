/// Signal Tracking
use signal_hook as sigs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Signals which all result in a cooperative shutdown.
pub const SHUTDOWN_SIGNALS: [i32; 3] = [
    sigs::consts::SIGINT,
    sigs::consts::SIGHUP,
    sigs::consts::SIGTERM,
];

/// Process-wide shutdown coordinator.
///
/// The tracker is created by the main thread and cloned into every
/// worker/spawned thread, so all parties refer to the same flag.
/// Blocking waits go through wait_until() so they return as soon as
/// a shutdown is requested directly, and within WAIT_GRANULARITY when
/// the request arrives via a signal handler (which cannot notify a
/// condition variable).
#[derive(Debug, Clone)]
pub struct SignalTracker {
    shutdown: Arc<AtomicBool>,
    notice: Arc<(Mutex<()>, Condvar)>,
}

impl Default for SignalTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalTracker {
    pub fn new() -> SignalTracker {
        SignalTracker {
            shutdown: Arc::new(AtomicBool::new(false)),
            notice: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    /// Directly initiate a shutdown and wake anyone blocked in
    /// wait_until().
    pub fn request_shutdown(&self) {
        let (lock, cvar) = &*self.notice;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.shutdown.store(true, Ordering::SeqCst);
        cvar.notify_all();
    }

    /// True if a shutdown has been requested by any means.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Route INT, HUP, and TERM to our shutdown flag.
    ///
    /// ```
    /// use mptc::signals::SignalTracker;
    /// use signal_hook::low_level::raise;
    ///
    /// let tracker = SignalTracker::new();
    /// tracker.track_shutdown().expect("Signals Registered");
    ///
    /// raise(signal_hook::consts::SIGHUP).expect("Signal Sent");
    ///
    /// assert!(tracker.shutdown_requested());
    /// ```
    pub fn track_shutdown(&self) -> Result<(), String> {
        for sig in SHUTDOWN_SIGNALS {
            sigs::flag::register(sig, self.shutdown.clone())
                .map_err(|e| format!("Cannot register signal handler for {sig}: {e}"))?;
        }
        Ok(())
    }

    /// Block until the deadline passes or a shutdown is requested.
    ///
    /// Returns true if we woke because of a shutdown.
    ///
    /// ```
    /// use mptc::signals::SignalTracker;
    /// use std::time::{Duration, Instant};
    ///
    /// let tracker = SignalTracker::new();
    /// assert!(!tracker.wait_until(Instant::now() + Duration::from_millis(5)));
    ///
    /// tracker.request_shutdown();
    /// assert!(tracker.wait_until(Instant::now() + Duration::from_secs(60)));
    /// ```
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (lock, cvar) = &*self.notice;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.shutdown_requested() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let slice = (deadline - now).min(Duration::from_millis(crate::WAIT_GRANULARITY));

            guard = match cvar.wait_timeout(guard, slice) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Same as wait_until() with a relative timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}
