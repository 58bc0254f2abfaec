//! Glob pattern handling for log discovery.
//!
//! Patterns are shell-style globs (`*`, `?`, `[…]`; no brace expansion).
//! They are expanded against the filesystem once, at registration time;
//! files that appear later are caught by watching the pattern's base
//! directory and re-matching Create events against the stored patterns.

use std::path::{Component, Path, PathBuf};

/// Returns the deepest directory prefix of `pattern` that contains no glob
/// metacharacters. For a fully literal pattern this is the parent
/// directory. Watching this directory catches files that only start
/// matching the pattern after it was registered.
pub(super) fn base_dir(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut base = PathBuf::new();
    let mut saw_meta = false;
    for component in path.components() {
        if let Component::Normal(part) = component
            && has_meta(&part.to_string_lossy())
        {
            saw_meta = true;
            break;
        }
        base.push(component.as_os_str());
    }
    if !saw_meta {
        base.pop();
    }
    base
}

/// Whether `part` contains glob metacharacters.
fn has_meta(part: &str) -> bool {
    part.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_stops_at_first_meta_component() {
        assert_eq!(base_dir("/var/log/*.log"), PathBuf::from("/var/log"));
        assert_eq!(base_dir("/var/*/app.log"), PathBuf::from("/var"));
        assert_eq!(base_dir("/var/log/app.?"), PathBuf::from("/var/log"));
        assert_eq!(base_dir("/var/log/app[12].log"), PathBuf::from("/var/log"));
    }

    #[test]
    fn base_dir_of_literal_path_is_its_parent() {
        assert_eq!(base_dir("/var/log/app.log"), PathBuf::from("/var/log"));
    }

    #[test]
    fn base_dir_of_root_level_pattern() {
        assert_eq!(base_dir("/*.log"), PathBuf::from("/"));
    }
}
