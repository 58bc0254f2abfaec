//! Filesystem change events delivered by a watcher.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of change a watcher observed at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A file appeared at the path.
    Create,
    /// The file's content or metadata changed. Also synthesised by polling
    /// watchers for every watched path on each tick.
    Update,
    /// The file was removed, or renamed away from the path.
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Create => write!(f, "create"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single filesystem change notification.
///
/// `pathname` is absolute, in the watcher's canonical form. Events carry no
/// ordering tag; consumers may not rely on ordering across distinct paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub pathname: PathBuf,
}

impl Event {
    pub fn new(kind: EventKind, pathname: impl Into<PathBuf>) -> Self {
        Event {
            kind,
            pathname: pathname.into(),
        }
    }

    pub fn create(pathname: impl Into<PathBuf>) -> Self {
        Event::new(EventKind::Create, pathname)
    }

    pub fn update(pathname: impl Into<PathBuf>) -> Self {
        Event::new(EventKind::Update, pathname)
    }

    pub fn delete(pathname: impl Into<PathBuf>) -> Self {
        Event::new(EventKind::Delete, pathname)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.pathname.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_kind_tags() {
        // Lock the wire format for the kind tags.
        assert_eq!(
            serde_json::to_string(&EventKind::Create).unwrap(),
            r#""create""#
        );
        assert_eq!(
            serde_json::to_string(&EventKind::Update).unwrap(),
            r#""update""#
        );
        assert_eq!(
            serde_json::to_string(&EventKind::Delete).unwrap(),
            r#""delete""#
        );
    }

    #[test]
    fn serde_roundtrip() {
        let event = Event::update("/var/log/app.log");
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn display_format() {
        let event = Event::delete("/var/log/app.log");
        assert_eq!(format!("{}", event), "delete /var/log/app.log");
    }
}
