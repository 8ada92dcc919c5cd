//! Multi-threaded TCP server plumbing.
//!
//! A [`Server`] pulls requests from a [`RequestStream`] on the calling
//! thread and hands each one to an idle worker from a fixed-size pool.
//! Each worker owns one [`RequestHandler`] for its whole life.  All
//! waits observe a shared [`SignalTracker`] so the pool winds down
//! promptly on INT, HUP, or TERM.
#![forbid(unsafe_code)]

pub mod server;
pub mod signals;
pub mod worker;

pub use server::Server;
pub use signals::SignalTracker;

/// How often (milliseconds) the dispatcher and idle workers wake to
/// check for a shutdown signal when nothing else is happening.
pub const SIGNAL_POLL_INTERVAL: u64 = 1000;

/// Upper bound (milliseconds) on any single internal condition wait,
/// so waiters notice signal-driven shutdown requests promptly.
pub const WAIT_GRANULARITY: u64 = 100;

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 256;

/// One unit of work, e.g. an accepted connection.
pub trait Request: Send + std::any::Any {
    /// Lets a handler recover its concrete request type.
    /// Typically: fn as_any_mut(&mut self) -> &mut dyn Any { self }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Per-worker request processor.
pub trait RequestHandler: Send {
    /// Called from within each worker thread just after spawning.
    fn worker_start(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Called from within each worker thread just before the thread exits.
    fn worker_end(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Process a single request.
    ///
    /// Returns Err of String if request processing failed.  The error
    /// string will be logged and the worker moves on to the next
    /// request.
    fn process(&mut self, request: Box<dyn Request>) -> Result<(), String>;
}

pub trait RequestStream {
    /// Returns the next incoming request in the stream.
    ///
    /// Implementations should apply a timeout (typically
    /// SIGNAL_POLL_INTERVAL) and return Ok(None) after waking with
    /// nothing to process, so the server can check for shutdown.
    fn next(&mut self) -> Result<Option<Box<dyn Request>>, String>;

    /// Factory for creating new RequestHandler instances.
    fn new_handler(&mut self) -> Box<dyn RequestHandler>;

    /// Called once when the server leaves its accept loop.
    fn shutdown(&mut self) {}
}
