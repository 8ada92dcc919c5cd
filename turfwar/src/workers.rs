//! Background threads: claim persistence, leaderboard and recent
//! activity regeneration, the Date cache timer, and the asset poller.
//!
//! Every loop here waits through the SignalTracker rather than
//! sleeping, so a shutdown is noticed at the next wait boundary.
use crate::asset::{self, AssetGeneration};
use crate::claim::{is_valid_nick, Claim};
use crate::now;
use crate::queue::BATCH_MAX;
use crate::result::{TurfError, TurfResult};
use crate::server::ServerContext;
use crate::store::{ClaimStore, RecentRow, ScoreRow, StoreConnector, RECENT_LIMIT};
use json::JsonValue;
use mptc::signals::SignalTracker;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How often (milliseconds) static files are checked for changes.
pub const POLL_ASSETS_MS: u64 = 250;

/// How often (milliseconds) the leaderboard is rebuilt.
pub const SCORE_UPDATE_MS: u64 = 15_000;

/// Pause (milliseconds) between storage reconnect attempts.
pub const STORE_RETRY_MS: u64 = 1000;

/// Wakes the recent activity regenerator after claims are committed.
///
/// Notifications which arrive while a regeneration is running are
/// folded into one pending flag, so every commit is followed by at
/// least one regeneration.
pub struct RecentTrigger {
    pending: Mutex<bool>,
    cvar: Condvar,
    signals: SignalTracker,
}

impl RecentTrigger {
    pub fn new(signals: SignalTracker) -> RecentTrigger {
        RecentTrigger {
            pending: Mutex::new(false),
            cvar: Condvar::new(),
            signals,
        }
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.cvar.notify_one();
    }

    /// Block until notified.  Returns false on shutdown.
    pub fn wait(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.signals.shutdown_requested() {
                return false;
            }

            if *pending {
                *pending = false;
                return true;
            }

            pending = match self
                .cvar
                .wait_timeout(pending, Duration::from_millis(mptc::WAIT_GRANULARITY))
            {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Wake the waiter so it sees a shutdown immediately.
    pub fn interrupt(&self) {
        let _pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.cvar.notify_all();
    }
}

/// A lazily opened store connection owned by one worker.
///
/// Any failure drops the connection so the next use starts over
/// with a fresh one.
struct StoreSession {
    connector: Arc<dyn StoreConnector>,
    store: Option<Box<dyn ClaimStore>>,
}

impl StoreSession {
    fn new(connector: Arc<dyn StoreConnector>) -> StoreSession {
        StoreSession {
            connector,
            store: None,
        }
    }

    fn with<T, F>(&mut self, f: F) -> TurfResult<T>
    where
        F: FnOnce(&mut dyn ClaimStore) -> TurfResult<T>,
    {
        if self.store.is_none() {
            self.store = Some(self.connector.connect()?);
        }

        let store = match self.store.as_mut() {
            Some(s) => s,
            None => return Err(TurfError::Storage("No store connection".to_string())),
        };

        let result = f(store.as_mut());

        if result.is_err() {
            self.store = None;
        }

        result
    }
}

/// [seconds, nanoseconds] since the epoch.
fn now_pair(t: SystemTime) -> JsonValue {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let (secs, nanos) = (since.as_secs(), since.subsec_nanos());
    json::array![secs, nanos]
}

/// Leaderboard document.  Rows arrive grouped by nickname.
///
/// ```
/// use std::time::{Duration, UNIX_EPOCH};
/// use turfwar::store::ScoreRow;
/// use turfwar::workers::score_document;
///
/// let rows = vec![
///     ScoreRow { nick: "amy".to_string(), prefix: 10, count: 3 },
///     ScoreRow { nick: "amy".to_string(), prefix: 11, count: 1 },
///     ScoreRow { nick: "bo b".to_string(), prefix: 1, count: 1 },
/// ];
///
/// let doc = score_document(&rows, UNIX_EPOCH + Duration::new(5, 7)).unwrap();
/// assert_eq!(doc.dump(), r#"{"now":[5,7],"score":{"amy":[[10,3],[11,1]]}}"#);
/// ```
pub fn score_document(rows: &[ScoreRow], now: SystemTime) -> TurfResult<JsonValue> {
    let mut score = JsonValue::new_object();

    for row in rows {
        if !is_valid_nick(&row.nick) {
            log::debug!("Skipping score row with invalid nick {:?}", row.nick);
            continue;
        }

        if !score.has_key(&row.nick) {
            score[row.nick.as_str()] = JsonValue::new_array();
        }

        let (prefix, count) = (row.prefix, row.count);

        score[row.nick.as_str()]
            .push(json::array![prefix, count])
            .map_err(|e| format!("Cannot build score document: {e}"))?;
    }

    let now = now_pair(now);

    Ok(json::object! {
        now: now,
        score: score,
    })
}

/// Recent activity document, newest first.
///
/// ```
/// use std::time::{Duration, UNIX_EPOCH};
/// use turfwar::store::RecentRow;
/// use turfwar::workers::recent_document;
///
/// let rows = vec![RecentRow { ip: 16909060, nick: "Alice".to_string(), created: 1670000000 }];
///
/// let doc = recent_document(&rows, UNIX_EPOCH + Duration::new(9, 0)).unwrap();
/// assert_eq!(doc.dump(), r#"{"now":[9,0],"recent":[[16909060,"Alice",1670000000]]}"#);
/// ```
pub fn recent_document(rows: &[RecentRow], now: SystemTime) -> TurfResult<JsonValue> {
    let mut recent = JsonValue::new_array();

    for row in rows {
        let (ip, nick, created) = (row.ip, row.nick.as_str(), row.created);

        recent
            .push(json::array![ip, nick, created])
            .map_err(|e| format!("Cannot build recent document: {e}"))?;
    }

    let now = now_pair(now);

    Ok(json::object! {
        now: now,
        recent: recent,
    })
}

fn json_generation(doc: JsonValue, cache_control: &str, now: SystemTime) -> TurfResult<AssetGeneration> {
    let mut text = doc.dump();
    text.push('\n');
    AssetGeneration::new(text.into_bytes(), asset::JSON_TYPE, cache_control, now)
}

/// Build a fresh leaderboard generation from the store.
pub fn generate_score(store: &mut dyn ClaimStore) -> TurfResult<AssetGeneration> {
    log::debug!("Generating score");
    let now = SystemTime::now();
    let rows = store.score_rows()?;
    json_generation(score_document(&rows, now)?, asset::SCORE_CACHE, now)
}

/// Build a fresh recent activity generation from the store.
pub fn generate_recent(store: &mut dyn ClaimStore) -> TurfResult<AssetGeneration> {
    log::debug!("Generating recent");
    let now = SystemTime::now();
    let rows = store.recent_rows(RECENT_LIMIT)?;
    json_generation(recent_document(&rows, now)?, asset::RECENT_CACHE, now)
}

/// Documents served until the store has been read once.
pub fn empty_score() -> TurfResult<AssetGeneration> {
    let now = SystemTime::now();
    json_generation(score_document(&[], now)?, asset::SCORE_CACHE, now)
}

pub fn empty_recent() -> TurfResult<AssetGeneration> {
    let now = SystemTime::now();
    json_generation(recent_document(&[], now)?, asset::RECENT_CACHE, now)
}

/// First leaderboard and recent documents, read synchronously at
/// startup.  An unreachable store is not fatal: we start with empty
/// documents and the workers fill them in once it comes back.
pub fn initial_documents(connector: &dyn StoreConnector) -> TurfResult<(AssetGeneration, AssetGeneration)> {
    let generated = connector
        .connect()
        .and_then(|mut store| Ok((generate_score(store.as_mut())?, generate_recent(store.as_mut())?)));

    match generated {
        Ok(docs) => Ok(docs),
        Err(e) => {
            log::warn!("Starting with empty score and recent documents: {e}");
            Ok((empty_score()?, empty_recent()?))
        }
    }
}

/// Call the tick function once per period, measured from a fixed
/// schedule, until shutdown.
fn run_periodic<F>(signals: &SignalTracker, period: Duration, mut tick: F)
where
    F: FnMut(),
{
    let mut deadline = Instant::now();

    loop {
        deadline += period;

        if signals.wait_until(deadline) {
            break;
        }

        // Fell behind schedule.  Don't try to catch up.
        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }

        tick();
    }
}

/// Keeps the Date header cache fresh.
pub fn now_worker(ctx: Arc<ServerContext>) {
    run_periodic(&ctx.signals, Duration::from_millis(now::DATE_UPDATE_MS), || {
        ctx.now.update()
    });
}

/// Hot-reloads static files whose modification time advanced.
pub fn asset_worker(ctx: Arc<ServerContext>) {
    log::info!("Asset worker started");

    run_periodic(&ctx.signals, Duration::from_millis(POLL_ASSETS_MS), || {
        for asset in ctx.assets.disk_assets() {
            if let Err(e) = asset.reload() {
                log::warn!("Cannot reload {}: {e}", asset.name());
            }
        }
    });

    log::info!("Asset worker exiting");
}

pub fn score_worker(ctx: Arc<ServerContext>, connector: Arc<dyn StoreConnector>) {
    log::info!("Score worker started");

    let mut session = StoreSession::new(connector);

    run_periodic(&ctx.signals, Duration::from_millis(SCORE_UPDATE_MS), || {
        let generation = session.with(generate_score);
        if let Err(e) = ctx.assets.score.replace(|| generation) {
            log::error!("Score generation failed: {e}");
        }
    });

    log::info!("Score worker exiting");
}

/// Rebuilds the recent activity document each time claims are
/// committed.
pub fn recent_worker(ctx: Arc<ServerContext>, connector: Arc<dyn StoreConnector>) {
    log::info!("Recent worker started");

    let mut session = StoreSession::new(connector);

    while ctx.recent.wait() {
        let generation = session.with(generate_recent);
        if let Err(e) = ctx.assets.recent.replace(|| generation) {
            log::error!("Recent generation failed: {e}");
        }
    }

    log::info!("Recent worker exiting");
}

/// Drain and store claims until the queue reports shutdown, or the
/// store fails.  A batch which could not be committed stays in
/// `pending` for the next attempt.
fn persist_claims(
    ctx: &ServerContext,
    connector: &dyn StoreConnector,
    pending: &mut Vec<Claim>,
) -> TurfResult<()> {
    let mut store = connector.connect()?;

    loop {
        if pending.is_empty() {
            *pending = ctx.claims.drain_up_to(BATCH_MAX, None);

            if pending.is_empty() {
                // Only happens at shutdown once the queue is empty.
                return Ok(());
            }
        }

        store.upsert_claims(pending)?;

        log::debug!("Committed {} claims", pending.len());
        pending.clear();

        ctx.recent.notify();
    }
}

/// The one consumer of the claim queue.
///
/// Storage errors close the connection, pause, and start over with a
/// new one.  Only a shutdown ends the loop.
pub fn claim_worker(ctx: Arc<ServerContext>, connector: Arc<dyn StoreConnector>) {
    log::info!("Claim worker started");

    let mut pending: Vec<Claim> = Vec::with_capacity(BATCH_MAX);

    loop {
        match persist_claims(&ctx, connector.as_ref(), &mut pending) {
            Ok(()) => break,
            Err(e) => {
                log::error!(
                    "Claim worker storage failure with {} claims pending: {e}",
                    pending.len()
                );

                if ctx.signals.wait(Duration::from_millis(STORE_RETRY_MS)) {
                    if !pending.is_empty() {
                        log::warn!("Abandoning {} unsaved claims at shutdown", pending.len());
                    }
                    break;
                }
            }
        }
    }

    log::info!("Claim worker exiting");
}

/// Join handles for the background threads.
pub struct BackgroundWorkers {
    handles: Vec<thread::JoinHandle<()>>,
}

impl BackgroundWorkers {
    /// Spawn the claim, score, recent, and Date threads.  The asset
    /// poller is left to the caller, which typically runs it in place.
    pub fn spawn(
        ctx: &Arc<ServerContext>,
        connector: Arc<dyn StoreConnector>,
    ) -> TurfResult<BackgroundWorkers> {
        let mut workers = BackgroundWorkers {
            handles: Vec::new(),
        };

        let (c, s) = (ctx.clone(), connector.clone());
        workers.spawn_one("claim-worker", move || claim_worker(c, s))?;

        let (c, s) = (ctx.clone(), connector.clone());
        workers.spawn_one("recent-worker", move || recent_worker(c, s))?;

        let (c, s) = (ctx.clone(), connector);
        workers.spawn_one("score-worker", move || score_worker(c, s))?;

        let c = ctx.clone();
        workers.spawn_one("now-worker", move || now_worker(c))?;

        Ok(workers)
    }

    /// Spawn the asset poller as well, for callers that do not run it
    /// on their own thread.
    pub fn spawn_asset_worker(&mut self, ctx: &Arc<ServerContext>) -> TurfResult<()> {
        let c = ctx.clone();
        self.spawn_one("asset-worker", move || asset_worker(c))
    }

    fn spawn_one<F>(&mut self, name: &str, f: F) -> TurfResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .map_err(|e| format!("Cannot spawn {name}: {e}"))?;

        self.handles.push(handle);

        Ok(())
    }

    /// Wake anything blocked and wait for every thread to exit.
    /// Call after a shutdown has been requested.
    pub fn join(self, ctx: &ServerContext) {
        ctx.claims.interrupt();
        ctx.recent.interrupt();

        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::scratch_dir;
    use crate::asset::AssetStore;
    use crate::store::MemoryStore;
    use std::fs;
    use std::net::Ipv4Addr;

    fn context(name: &str) -> Arc<ServerContext> {
        let dir = scratch_dir(name);
        for file in ["index.html", "about.html", "user.html", "favicon.ico"] {
            fs::write(dir.join(file), file).unwrap();
        }

        let assets = AssetStore::load(&dir, empty_score().unwrap(), empty_recent().unwrap()).unwrap();

        Arc::new(ServerContext::new(
            assets,
            Duration::from_millis(1000),
            SignalTracker::new(),
        ))
    }

    #[test]
    fn trigger_coalesces_notifications() {
        let trigger = RecentTrigger::new(SignalTracker::new());
        trigger.notify();
        trigger.notify();
        assert!(trigger.wait());

        let signals = SignalTracker::new();
        let trigger = Arc::new(RecentTrigger::new(signals.clone()));
        let waiter = {
            let trigger = trigger.clone();
            thread::spawn(move || trigger.wait())
        };

        thread::sleep(Duration::from_millis(50));
        signals.request_shutdown();
        trigger.interrupt();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn session_reconnects_after_failure() {
        let store = MemoryStore::new();
        let connector: Arc<dyn StoreConnector> = Arc::new(store.clone());
        let mut session = StoreSession::new(connector);

        let claim = Claim::new(Ipv4Addr::new(1, 2, 3, 4), 10, "Alice").unwrap();

        store.fail_next_writes(1);
        assert!(session.with(|s| s.upsert_claims(&[claim.clone()])).is_err());
        assert!(session.with(|s| s.upsert_claims(&[claim.clone()])).is_ok());

        assert_eq!(store.connect_count(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn generated_documents_are_json() {
        let store = MemoryStore::new();
        let mut conn = store.connect().unwrap();

        conn.upsert_claims(&[
            Claim::new(Ipv4Addr::new(1, 2, 3, 4), 100, "Alice").unwrap(),
            Claim::new(Ipv4Addr::new(1, 9, 9, 9), 200, "Alice").unwrap(),
        ])
        .unwrap();

        let score = generate_score(conn.as_mut()).unwrap();
        assert_eq!(score.content_type(), asset::JSON_TYPE);
        assert_eq!(score.cache_control(), asset::SCORE_CACHE);

        let parsed = json::parse(std::str::from_utf8(score.data()).unwrap()).unwrap();
        assert_eq!(parsed["score"]["Alice"][0][0], 1);
        assert_eq!(parsed["score"]["Alice"][0][1], 2);

        let recent = generate_recent(conn.as_mut()).unwrap();
        let parsed = json::parse(std::str::from_utf8(recent.data()).unwrap()).unwrap();
        assert_eq!(parsed["recent"].len(), 2);
        assert_eq!(parsed["recent"][0][1], "Alice");
        assert_eq!(parsed["recent"][0][2], 200);
    }

    #[test]
    fn periodic_stops_on_shutdown() {
        let signals = SignalTracker::new();
        let ticks = Arc::new(Mutex::new(0));

        let handle = {
            let signals = signals.clone();
            let ticks = ticks.clone();
            thread::spawn(move || {
                run_periodic(&signals, Duration::from_millis(10), || {
                    *ticks.lock().unwrap() += 1;
                })
            })
        };

        thread::sleep(Duration::from_millis(200));
        signals.request_shutdown();
        handle.join().unwrap();

        assert!(*ticks.lock().unwrap() > 2);
    }

    #[test]
    fn no_claim_accepted_after_final_drain() {
        let ctx = context("late-claim");
        let store = MemoryStore::new();
        let connector: Arc<dyn StoreConnector> = Arc::new(store.clone());

        let workers = BackgroundWorkers::spawn(&ctx, connector).unwrap();

        let early = Claim::new(Ipv4Addr::new(1, 2, 3, 4), 10, "Alice").unwrap();
        assert!(ctx.claims.enqueue(early, Instant::now() + Duration::from_millis(100)));

        ctx.signals.request_shutdown();
        workers.join(&ctx);

        // Claims queued before shutdown were drained and stored.
        assert_eq!(store.owner(0x01020304).unwrap().0, "Alice");

        // An HTTP worker still finishing a request must not be told
        // its claim was taken.
        let late = Claim::new(Ipv4Addr::new(5, 6, 7, 8), 20, "Bob").unwrap();
        assert!(!ctx.claims.enqueue(late, Instant::now() + Duration::from_millis(100)));
        assert!(ctx.claims.is_empty());
        assert!(store.owner(0x05060708).is_none());
    }
}
