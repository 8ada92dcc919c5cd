use super::signals::SignalTracker;
use super::{Request, RequestHandler};
use std::fmt;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Idle,
    Active,
    Done,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "Idle",
            WorkerState::Active => "Active",
            WorkerState::Done => "Done",
        };
        f.write_str(name)
    }
}

pub struct WorkerStateEvent {
    worker_id: u64,
    state: WorkerState,
}

impl fmt::Display for WorkerStateEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "WorkerStateEvent worker={} state={}",
            self.worker_id, self.state
        )
    }
}

impl WorkerStateEvent {
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }
    pub fn state(&self) -> &WorkerState {
        &self.state
    }
}

/// The server's view of one worker thread.
pub struct WorkerInstance {
    pub worker_id: u64,
    pub state: WorkerState,
    pub join_handle: thread::JoinHandle<()>,

    /// Requests for this worker.  Dropping it tells the worker to exit.
    pub to_worker_tx: mpsc::Sender<Box<dyn Request>>,
}

impl WorkerInstance {
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Close the request channel and wait for the thread to exit.
    pub fn finish(self) {
        let WorkerInstance {
            worker_id,
            join_handle,
            to_worker_tx,
            ..
        } = self;

        // A worker blocked in recv() wakes with Disconnected.
        drop(to_worker_tx);

        if let Err(e) = join_handle.join() {
            log::error!("Worker {worker_id} join failed with: {e:?}");
        }
    }
}

pub struct Worker {
    worker_id: u64,
    request_count: usize,
    to_parent_tx: mpsc::Sender<WorkerStateEvent>,
    to_worker_rx: mpsc::Receiver<Box<dyn Request>>,
    signals: SignalTracker,
    handler: Box<dyn RequestHandler>,
}

impl Worker {
    pub fn new(
        worker_id: u64,
        to_parent_tx: mpsc::Sender<WorkerStateEvent>,
        to_worker_rx: mpsc::Receiver<Box<dyn Request>>,
        signals: SignalTracker,
        handler: Box<dyn RequestHandler>,
    ) -> Worker {
        Worker {
            worker_id,
            to_parent_tx,
            to_worker_rx,
            signals,
            request_count: 0,
            handler,
        }
    }

    fn set_state(&mut self, state: WorkerState) -> Result<(), String> {
        let evt = WorkerStateEvent {
            worker_id: self.worker_id,
            state,
        };

        self.to_parent_tx
            .send(evt)
            .map_err(|e| format!("Error notifying parent of state change: {e}"))
    }

    pub fn run(&mut self) {
        log::trace!("{self} starting");

        if let Err(e) = self.handler.worker_start() {
            log::error!("Error starting worker: {e}.  Exiting");
            self.set_state(WorkerState::Done).ok();
            return;
        }

        loop {
            if let Err(e) = self.set_state(WorkerState::Idle) {
                log::debug!("{self} exiting on set_state() failure: {e}");
                break;
            }

            let request = match self.next_request() {
                Some(r) => r,
                None => break,
            };

            self.request_count += 1;

            // Failures are local to the request.  Keep going.
            if let Err(e) = self.handler.process(request) {
                log::debug!("{self} request failed: {e}");
            }
        }

        log::debug!("{self} exiting");

        self.set_state(WorkerState::Done).ok(); // we're done.  ignore errors.

        if let Err(e) = self.handler.worker_end() {
            log::error!("{self} handler returned on error on exit: {e}");
        }
    }

    /// Wait for the next request from the server.
    ///
    /// Returns None if it's time to exit.
    fn next_request(&mut self) -> Option<Box<dyn Request>> {
        let poll = Duration::from_millis(super::SIGNAL_POLL_INTERVAL);

        loop {
            if self.signals.shutdown_requested() {
                return None;
            }

            match self.to_worker_rx.recv_timeout(poll) {
                Ok(r) => return Some(r),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Worker id={} requests={}",
            self.worker_id, self.request_count
        )
    }
}
