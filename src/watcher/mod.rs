//! Filesystem watching.
//!
//! A [`Watcher`] emits [`Event`]s for a set of registered paths. Two
//! variants exist: [`LogWatcher`] drives real OS notifications (optionally
//! supplemented by a polling ticker), and [`FakeWatcher`] lets tests inject
//! events deterministically. They share nothing beyond the
//! dispatch-by-pathname rule in [`route`].
//!
//! # Dispatch
//!
//! When an event arrives for path `P`, it is routed to the sink registered
//! at `P`; if there is none, to the sink registered at `P`'s parent
//! directory; otherwise it is logged and dropped. Callers register
//! directories to catch files that only start matching a pattern after the
//! watch was set up.

mod fake;
mod log_watcher;

pub use fake::FakeWatcher;
pub use log_watcher::LogWatcher;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::Event;

/// Capacity of a watcher's event stream. Kept small so producers are paced
/// by the consumer rather than buffering a backlog of stale notifications.
pub(crate) const EVENT_STREAM_CAPACITY: usize = 1;

/// Errors from watcher operations.
#[derive(Debug, Error)]
pub enum WatchError {
    /// IO error, typically from path canonicalisation.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The OS notification backend rejected an operation.
    #[error("notification backend error: {0}")]
    Notify(#[from] notify::Error),
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// A source of filesystem change events for a set of registered paths.
///
/// Implementations must be safe to call from any number of concurrent
/// callers. The stream returned by [`observe`](Watcher::observe) is
/// single-consumer and terminates after [`close`](Watcher::close); `close`
/// is idempotent and only its first invocation performs teardown.
pub trait Watcher: Send + Sync + 'static {
    /// Starts emitting events for `path` (canonicalised to an absolute
    /// form). Adding an already-watched path is a no-op. A permission-denied
    /// error is not fatal: it is logged and the path is still recorded as
    /// watched, so a later chmod-then-update can recover.
    fn add(&self, path: &Path) -> Result<()>;

    /// Stops observing `path`. Idempotent.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Whether `path` (after canonicalisation) is currently watched.
    fn is_watching(&self, path: &Path) -> bool;

    /// Returns the single-consumer stream of events. A second call yields a
    /// stream that is already closed.
    fn observe(&self) -> mpsc::Receiver<Event>;

    /// Shuts the watcher down, waiting for its tasks to exit and dropping
    /// every sink handle so the observed stream drains and terminates.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Resolves the sink for an event at `path`: the sink registered at the
/// path itself, falling back to the one registered at its parent directory.
pub(crate) fn route<'a>(
    watched: &'a HashMap<PathBuf, mpsc::Sender<Event>>,
    path: &Path,
) -> Option<&'a mpsc::Sender<Event>> {
    watched
        .get(path)
        .or_else(|| path.parent().and_then(|dir| watched.get(dir)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> mpsc::Sender<Event> {
        mpsc::channel(1).0
    }

    #[test]
    fn route_prefers_exact_path() {
        let mut watched = HashMap::new();
        let file_sink = sink();
        let dir_sink = sink();
        watched.insert(PathBuf::from("/logs/app.log"), file_sink.clone());
        watched.insert(PathBuf::from("/logs"), dir_sink.clone());

        let resolved = route(&watched, Path::new("/logs/app.log")).unwrap();
        assert!(resolved.same_channel(&file_sink));
    }

    #[test]
    fn route_falls_back_to_parent_directory() {
        let mut watched = HashMap::new();
        let dir_sink = sink();
        watched.insert(PathBuf::from("/logs"), dir_sink.clone());

        let resolved = route(&watched, Path::new("/logs/new.log")).unwrap();
        assert!(resolved.same_channel(&dir_sink));
    }

    #[test]
    fn route_drops_unknown_paths() {
        let mut watched = HashMap::new();
        watched.insert(PathBuf::from("/logs"), sink());

        assert!(route(&watched, Path::new("/other/app.log")).is_none());
        assert!(route(&watched, Path::new("/logs/sub/deep.log")).is_none());
    }
}
