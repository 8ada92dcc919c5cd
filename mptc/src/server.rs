use super::signals::SignalTracker;
use super::worker::{Worker, WorkerInstance, WorkerState, WorkerStateEvent};
use super::{Request, RequestStream};
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Accepts requests from a RequestStream and hands each one to an idle
/// worker from a fixed-size pool.
///
/// When every worker is busy the server stops pulling from the stream
/// until one frees up, so pending connections wait in the listen
/// backlog instead of growing the thread count.
pub struct Server {
    worker_id_gen: u64,
    workers: HashMap<u64, WorkerInstance>,

    to_parent_rx: mpsc::Receiver<WorkerStateEvent>,
    to_parent_tx: mpsc::Sender<WorkerStateEvent>,

    worker_count: usize,

    signals: SignalTracker,

    /// All inbound requests arrive via this stream.
    stream: Box<dyn RequestStream>,
}

impl Server {
    pub fn new(stream: Box<dyn RequestStream>, signals: SignalTracker) -> Server {
        let (tx, rx): (
            mpsc::Sender<WorkerStateEvent>,
            mpsc::Receiver<WorkerStateEvent>,
        ) = mpsc::channel();

        Server {
            stream,
            signals,
            workers: HashMap::new(),
            worker_id_gen: 0,
            to_parent_tx: tx,
            to_parent_rx: rx,
            worker_count: super::DEFAULT_WORKERS,
        }
    }

    pub fn set_worker_count(&mut self, v: usize) {
        self.worker_count = v.max(1);
    }

    fn next_worker_id(&mut self) -> u64 {
        self.worker_id_gen += 1;
        self.worker_id_gen
    }

    fn start_workers(&mut self) {
        while self.workers.len() < self.worker_count {
            if self.start_one_worker().is_none() {
                // Thread creation is failing; run with what we have.
                break;
            }
        }
    }

    fn start_one_worker(&mut self) -> Option<u64> {
        let worker_id = self.next_worker_id();
        let to_parent_tx = self.to_parent_tx.clone();
        let signals = self.signals.clone();
        let handler = self.stream.new_handler();

        let (tx, rx): (
            mpsc::Sender<Box<dyn Request>>,
            mpsc::Receiver<Box<dyn Request>>,
        ) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name(format!("http-{worker_id}"))
            .spawn(move || {
                let mut w = Worker::new(worker_id, to_parent_tx, rx, signals, handler);
                w.run();
            });

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                log::error!("server: cannot spawn worker thread: {e}");
                return None;
            }
        };

        // Considered busy until the thread reports in as Idle.
        let instance = WorkerInstance {
            worker_id,
            state: WorkerState::Active,
            join_handle: handle,
            to_worker_tx: tx,
        };

        self.workers.insert(worker_id, instance);

        Some(worker_id)
    }

    fn idle_worker_count(&self) -> usize {
        self.workers
            .values()
            .filter(|v| v.state == WorkerState::Idle)
            .count()
    }

    fn remove_worker(&mut self, worker_id: &u64, respawn: bool) {
        log::trace!("server: removing worker {}", worker_id);

        if let Some(worker) = self.workers.remove(worker_id) {
            worker.finish();
        }

        if respawn && !self.signals.shutdown_requested() {
            self.start_workers();
        }
    }

    /// Set the state of our thread worker based on the state reported
    /// to us by the thread.
    fn handle_worker_event(&mut self, evt: &WorkerStateEvent) {
        log::trace!("server received WorkerStateEvent: {evt}");

        let worker_id = evt.worker_id();

        let worker = match self.workers.get_mut(&worker_id) {
            Some(w) => w,
            None => {
                log::debug!("No worker found with id {worker_id}");
                return;
            }
        };

        if evt.state() == &WorkerState::Done {
            // Keep the pool at its configured size.
            self.remove_worker(&worker_id, true);
        } else {
            worker.state = evt.state().clone();
        }
    }

    // Check for threads that panic!ed and were unable to send any
    // worker state info to us.
    fn check_failed_threads(&mut self) {
        let failed: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, v)| v.join_handle.is_finished())
            .map(|(k, _)| *k)
            .collect();

        for worker_id in failed {
            log::warn!("Found a thread that exited ungracefully: {worker_id}");
            self.remove_worker(&worker_id, true);
        }
    }

    /// Returns true if the it's time to shut down.
    ///
    /// * `block` - Continue performing housekeeping until an idle worker
    ///   becomes available or a shutdown signal is received.
    fn housekeeping(&mut self, block: bool) -> bool {
        loop {
            if self.signals.shutdown_requested() {
                log::debug!("We received a stop signal, exiting");
                return true;
            }

            if block {
                // Wait a bit for a worker state event, then resume
                // housekeeping.
                let poll = Duration::from_millis(super::WAIT_GRANULARITY);
                if let Ok(evt) = self.to_parent_rx.recv_timeout(poll) {
                    self.handle_worker_event(&evt);
                }
            }

            // Pull all state events from the channel.
            while let Ok(evt) = self.to_parent_rx.try_recv() {
                self.handle_worker_event(&evt);
            }

            // Finally clean up any threads that panic!ed before they
            // could send a state event.
            self.check_failed_threads();

            if !block || self.idle_worker_count() > 0 {
                return false;
            }
        }
    }

    pub fn run(&mut self) {
        self.start_workers();

        log::info!("server: started {} workers", self.workers.len());

        loop {
            if self.housekeeping(false) {
                break;
            }

            match self.stream.next() {
                Ok(Some(request)) => self.dispatch_request(request),
                Ok(None) => {} // timed out.
                Err(e) => {
                    log::error!("Exiting on stream error: {e}");
                    self.signals.request_shutdown();
                    break;
                }
            }
        }

        self.stream.shutdown();

        let ids: Vec<u64> = self.workers.keys().copied().collect();
        for id in ids {
            log::debug!("Server cleaning up worker {}", id);
            self.remove_worker(&id, false);
        }

        log::info!("server: all workers exited");
    }

    fn dispatch_request(&mut self, request: Box<dyn Request>) {
        let wid = match self.next_idle_worker() {
            Some(w) => w,
            None => return, // shutting down; request is dropped.
        };

        if let Some(worker) = self.workers.get_mut(&wid) {
            worker.state = WorkerState::Active;

            if let Err(e) = worker.to_worker_tx.send(request) {
                // Only happens if the worker died in between.  The
                // logs will tell.
                log::error!("Error sending data to worker: {e}");
            }
        }
    }

    fn find_idle_worker(&self) -> Option<u64> {
        self.workers
            .iter()
            .find(|(_, w)| w.state() == &WorkerState::Idle)
            .map(|(k, _)| *k)
    }

    fn next_idle_worker(&mut self) -> Option<u64> {
        if let Some(id) = self.find_idle_worker() {
            return Some(id);
        }

        log::debug!("All {} workers busy; waiting", self.workers.len());

        loop {
            if self.housekeeping(true) {
                return None;
            }

            if let Some(id) = self.find_idle_worker() {
                return Some(id);
            }
        }
    }
}
