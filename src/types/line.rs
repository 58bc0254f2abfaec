//! The record emitted to downstream consumers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single newline-terminated record read from a tailed file.
///
/// `text` never contains the terminating newline; a single carriage return
/// immediately before it is stripped as well. `pathname` is the absolute
/// registration path, which stays stable across rotations of the underlying
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Absolute path of the file the line was read from.
    pub pathname: PathBuf,
    /// Line text, without the terminating newline.
    pub text: String,
}

impl LogLine {
    pub fn new(pathname: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        LogLine {
            pathname: pathname.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pathname.display(), self.text)
    }
}
