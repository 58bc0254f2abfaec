//! A deterministic watcher for tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{EVENT_STREAM_CAPACITY, Result, Watcher, route};
use crate::types::{Event, EventKind};

/// A watcher whose events are injected by the test itself.
///
/// The `inject_*` methods deliver an event through the same
/// dispatch-by-pathname rule as the production watcher and return only once
/// the consumer has taken the event off the stream, so a test can
/// interleave filesystem mutations and event delivery deterministically.
pub struct FakeWatcher {
    watched: RwLock<HashMap<PathBuf, mpsc::Sender<Event>>>,
    sink: Mutex<Option<mpsc::Sender<Event>>>,
    stream: Mutex<Option<mpsc::Receiver<Event>>>,
    closed: AtomicBool,
}

impl FakeWatcher {
    pub fn new() -> FakeWatcher {
        let (sink, stream) = mpsc::channel(EVENT_STREAM_CAPACITY);
        FakeWatcher {
            watched: RwLock::new(HashMap::new()),
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        }
    }

    /// Delivers a `Create` event for `path`, waiting until it is consumed.
    pub async fn inject_create(&self, path: &Path) {
        self.inject(EventKind::Create, path).await;
    }

    /// Delivers an `Update` event for `path`, waiting until it is consumed.
    pub async fn inject_update(&self, path: &Path) {
        self.inject(EventKind::Update, path).await;
    }

    /// Delivers a `Delete` event for `path`, waiting until it is consumed.
    pub async fn inject_delete(&self, path: &Path) {
        self.inject(EventKind::Delete, path).await;
    }

    async fn inject(&self, kind: EventKind, path: &Path) {
        let abs = match std::path::absolute(path) {
            Ok(abs) => abs,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "could not resolve injected path");
                return;
            }
        };
        let sink = {
            let watched = self.watched.read();
            route(&watched, &abs).cloned()
        };
        let Some(sink) = sink else {
            info!(path = %abs.display(), "no watch registered for path, dropping injected event");
            return;
        };
        if sink.send(Event::new(kind, abs)).await.is_err() {
            return;
        }
        // The stream has capacity 1, so a send permit becomes available
        // exactly when the event above has been taken off the channel.
        if let Ok(permit) = sink.reserve().await {
            drop(permit);
        }
    }
}

impl Default for FakeWatcher {
    fn default() -> Self {
        FakeWatcher::new()
    }
}

impl Watcher for FakeWatcher {
    fn add(&self, path: &Path) -> Result<()> {
        let abs = std::path::absolute(path)?;
        let Some(sink) = self.sink.lock().clone() else {
            debug!(path = %abs.display(), "add on a closed watcher, ignoring");
            return Ok(());
        };
        self.watched.write().insert(abs, sink);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let abs = std::path::absolute(path)?;
        self.watched.write().remove(&abs);
        Ok(())
    }

    fn is_watching(&self, path: &Path) -> bool {
        match std::path::absolute(path) {
            Ok(abs) => self.watched.read().contains_key(&abs),
            Err(_) => false,
        }
    }

    fn observe(&self) -> mpsc::Receiver<Event> {
        match self.stream.lock().take() {
            Some(stream) => stream,
            None => mpsc::channel(1).1,
        }
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.watched.write().clear();
            drop(self.sink.lock().take());
            Ok(())
        }
    }
}
