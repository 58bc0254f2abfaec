//! The production watcher: OS notifications plus an optional poll ticker.
//!
//! Raw notifications arrive on the notify backend's own thread and are
//! bridged into an internal channel; a dedicated task translates and routes
//! them to the registered sinks. When polling is enabled, a ticker task
//! synthesises an `Update` event for every watched path on each tick, so
//! the tailer makes progress even when notifications are late or missing.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EVENT_STREAM_CAPACITY, Result, Watcher, route};
use crate::metrics;
use crate::types::Event;

/// Fallback polling cadence used when OS notifications are unavailable and
/// the caller did not configure an interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the bridge channel between the notify callback thread and
/// the events task. Bounded so a slow consumer paces the backend instead of
/// buffering an unbounded backlog.
const RAW_STREAM_CAPACITY: usize = 64;

/// Watches real filesystems.
pub struct LogWatcher {
    shared: Arc<Shared>,
    /// Notify backend; `None` when OS notifications are disabled or could
    /// not be constructed.
    backend: Mutex<Option<RecommendedWatcher>>,
    stream: Mutex<Option<mpsc::Receiver<Event>>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    ticker_task: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    closed: AtomicBool,
}

/// State shared with the events and ticker tasks.
struct Shared {
    /// Watched paths, each bound to the sink its events are routed to.
    watched: RwLock<HashMap<PathBuf, mpsc::Sender<Event>>>,
    /// The sink backing `observe`; taken on close so the stream terminates.
    sink: Mutex<Option<mpsc::Sender<Event>>>,
}

impl LogWatcher {
    /// Creates a watcher.
    ///
    /// With `enable_fs_events`, OS notifications are used; if the backend
    /// cannot be constructed the failure is logged and the watcher carries
    /// on without it. With no backend and a zero `poll_interval`, a default
    /// of 250 ms is substituted so events still flow. Any non-zero
    /// `poll_interval` starts a ticker that emits a synthetic `Update` for
    /// every watched path on each tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(poll_interval: Duration, enable_fs_events: bool) -> Result<LogWatcher> {
        let (sink, stream) = mpsc::channel(EVENT_STREAM_CAPACITY);
        let shared = Arc::new(Shared {
            watched: RwLock::new(HashMap::new()),
            sink: Mutex::new(Some(sink)),
        });
        let stop = CancellationToken::new();

        let mut backend = None;
        let mut events_task = None;
        if enable_fs_events {
            let (raw_tx, raw_rx) = mpsc::channel(RAW_STREAM_CAPACITY);
            // The callback runs on the notify backend's thread; blocking_send
            // paces it against the events task.
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = raw_tx.blocking_send(res);
            }) {
                Ok(watcher) => {
                    backend = Some(watcher);
                    events_task = Some(tokio::spawn(run_events(
                        Arc::clone(&shared),
                        raw_rx,
                        stop.clone(),
                    )));
                }
                Err(err) => {
                    warn!(error = %err, "OS notifications unavailable, continuing without them");
                }
            }
        }

        let mut poll_interval = poll_interval;
        if backend.is_none() && poll_interval.is_zero() {
            poll_interval = DEFAULT_POLL_INTERVAL;
        }
        let ticker_task = if poll_interval.is_zero() {
            None
        } else {
            Some(tokio::spawn(run_ticks(
                Arc::clone(&shared),
                poll_interval,
                stop.clone(),
            )))
        };

        Ok(LogWatcher {
            shared,
            backend: Mutex::new(backend),
            stream: Mutex::new(Some(stream)),
            events_task: Mutex::new(events_task),
            ticker_task: Mutex::new(ticker_task),
            stop,
            closed: AtomicBool::new(false),
        })
    }
}

impl Watcher for LogWatcher {
    fn add(&self, path: &Path) -> Result<()> {
        let abs = std::path::absolute(path)?;
        if self.is_watching(&abs) {
            return Ok(());
        }
        let Some(sink) = self.shared.sink.lock().clone() else {
            debug!(path = %abs.display(), "add on a closed watcher, ignoring");
            return Ok(());
        };
        info!(path = %abs.display(), "adding watch");
        if let Some(backend) = self.backend.lock().as_mut() {
            if let Err(err) = backend.watch(&abs, RecursiveMode::NonRecursive) {
                if is_permission_denied(&err) {
                    // A later chmod arrives as an update and recovers the
                    // path, so it must still be recorded as watched.
                    info!(path = %abs.display(), "permission denied adding watch, will rely on later events");
                } else {
                    return Err(err.into());
                }
            }
        }
        self.shared.watched.write().insert(abs, sink);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let abs = std::path::absolute(path)?;
        if self.shared.watched.write().remove(&abs).is_none() {
            return Ok(());
        }
        if let Some(backend) = self.backend.lock().as_mut() {
            if let Err(err) = backend.unwatch(&abs) {
                debug!(path = %abs.display(), error = %err, "backend unwatch failed");
            }
        }
        Ok(())
    }

    fn is_watching(&self, path: &Path) -> bool {
        match std::path::absolute(path) {
            Ok(abs) => self.shared.watched.read().contains_key(&abs),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "could not resolve path");
                false
            }
        }
    }

    fn observe(&self) -> mpsc::Receiver<Event> {
        match self.stream.lock().take() {
            Some(stream) => stream,
            None => {
                warn!("observe called more than once, returning a closed stream");
                mpsc::channel(1).1
            }
        }
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            // Dropping the backend stops its thread and closes the raw
            // channel, which ends the events task once it has drained.
            let backend = self.backend.lock().take();
            drop(backend);
            self.stop.cancel();
            let events_task = self.events_task.lock().take();
            if let Some(task) = events_task {
                let _ = task.await;
            }
            let ticker_task = self.ticker_task.lock().take();
            if let Some(task) = ticker_task {
                let _ = task.await;
            }
            info!("closing watcher event stream");
            self.shared.watched.write().clear();
            drop(self.shared.sink.lock().take());
            Ok(())
        }
    }
}

/// Consumes the bridged raw notification stream: errors are counted and
/// logged, events are translated and routed to the registered sinks. The
/// task ends when the backend is dropped and the bridge channel drains.
async fn run_events(
    shared: Arc<Shared>,
    mut raw: mpsc::Receiver<notify::Result<notify::Event>>,
    stop: CancellationToken,
) {
    while let Some(res) = raw.recv().await {
        match res {
            Ok(raw_event) => {
                for event in translate(&raw_event) {
                    metrics::EVENT_COUNT.add(&event.pathname.to_string_lossy(), 1);
                    dispatch(&shared, &stop, event).await;
                }
            }
            Err(err) => {
                metrics::ERROR_COUNT.add(1);
                error!(error = %err, "notification backend error");
            }
        }
    }
    debug!("watcher events task finished");
}

/// Emits a synthetic `Update` for every watched path on each tick. The
/// watched map is snapshotted under the read lock and released before any
/// send, so registration is never blocked by a slow consumer.
async fn run_ticks(shared: Arc<Shared>, poll_interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot: Vec<(PathBuf, mpsc::Sender<Event>)> = {
                    let watched = shared.watched.read();
                    watched
                        .iter()
                        .map(|(path, sink)| (path.clone(), sink.clone()))
                        .collect()
                };
                for (path, sink) in snapshot {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        sent = sink.send(Event::update(path)) => {
                            if sent.is_err() {
                                debug!("event stream closed, stopping poll ticker");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
    debug!("poll ticker stopped");
}

async fn dispatch(shared: &Shared, stop: &CancellationToken, event: Event) {
    let sink = {
        let watched = shared.watched.read();
        route(&watched, &event.pathname).cloned()
    };
    match sink {
        Some(sink) => {
            let pathname = event.pathname.clone();
            // An in-flight send is abandoned on shutdown so close() never
            // waits on a consumer that has already stopped draining.
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(path = %pathname.display(), "shutdown during dispatch, dropping event");
                }
                sent = sink.send(event) => {
                    if sent.is_err() {
                        debug!("event stream closed, dropping event");
                    }
                }
            }
        }
        None => {
            debug!(path = %event.pathname.display(), "no watch registered for path, dropping event");
        }
    }
}

/// Translates a raw notification into zero or more watcher events.
///
/// A rename is reported as a `Delete` of the source name; the target name,
/// if watched, produces its own `Create`. Access notifications are ignored.
/// Unclassified ops are counted as errors and skipped rather than aborting.
fn translate(raw: &notify::Event) -> Vec<Event> {
    let mut events = Vec::new();
    match raw.kind {
        notify::EventKind::Create(_) => {
            events.extend(raw.paths.iter().map(Event::create));
        }
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            events.extend(raw.paths.iter().map(Event::create));
        }
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // Source first, then target.
            if let Some(from) = raw.paths.first() {
                events.push(Event::delete(from));
            }
            if let Some(to) = raw.paths.get(1) {
                events.push(Event::create(to));
            }
        }
        notify::EventKind::Modify(ModifyKind::Name(_)) => {
            events.extend(raw.paths.iter().map(Event::delete));
        }
        notify::EventKind::Modify(_) => {
            // Content writes and metadata changes (chmod) both arrive here.
            events.extend(raw.paths.iter().map(Event::update));
        }
        notify::EventKind::Remove(_) => {
            events.extend(raw.paths.iter().map(Event::delete));
        }
        notify::EventKind::Access(_) => {}
        notify::EventKind::Any | notify::EventKind::Other => {
            metrics::ERROR_COUNT.add(1);
            warn!(event = ?raw, "unclassified notification op, skipping");
        }
    }
    events
}

fn is_permission_denied(err: &notify::Error) -> bool {
    matches!(
        &err.kind,
        notify::ErrorKind::Io(io_err) if io_err.kind() == std::io::ErrorKind::PermissionDenied
    )
}
