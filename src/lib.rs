//! Robust tailing of append-mostly log files.
//!
//! Files are followed across truncation, rotation (even when the rename is
//! signalled out of order), deletion and re-creation, and transient
//! permission errors. Complete lines are emitted to a channel as
//! [`types::LogLine`] records; filesystem change notifications come from a
//! pluggable [`watcher::Watcher`] with a production implementation and a
//! deterministic fake for tests.

pub mod metrics;
pub mod tailer;
pub mod types;
pub mod watcher;
