//! Canonical-path containment checks.
//!
//! A path matches a grant iff its canonical form equals a granted path or
//! descends from a granted directory. Canonicalization resolves symlinks
//! through the deepest existing ancestor, so a symlink that points outside
//! every granted root is denied even when the final component does not
//! exist yet.

use crate::scope::{PermissionSet, Scope};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Canonicalize with a lenient tail: the deepest existing ancestor is
/// resolved through the filesystem (symlinks included); the remaining
/// components are appended and `.`/`..` in them squashed lexically.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }

    for ancestor in path.ancestors().skip(1) {
        if let Ok(resolved) = std::fs::canonicalize(ancestor) {
            let tail = path.strip_prefix(ancestor).unwrap_or(path);
            return squash_dots(&resolved.join(tail));
        }
    }
    squash_dots(path)
}

fn squash_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_granted(scope: &Scope, canonical: &Path) -> bool {
    match scope {
        Scope::All => true,
        Scope::None => false,
        Scope::Set(granted) => granted.iter().any(|g| {
            let root = Path::new(g);
            canonical == root || canonical.starts_with(root)
        }),
    }
}

impl PermissionSet {
    /// Resolve a check input against this set's own base dir.
    fn resolve_input(&self, p: &Path) -> PathBuf {
        let joined = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        };
        canonicalize_lenient(&joined)
    }

    pub fn can_read(&self, p: impl AsRef<Path>) -> bool {
        let canonical = self.resolve_input(p.as_ref());
        let ok = path_granted(&self.read, &canonical);
        if !ok {
            debug!(path = %canonical.display(), "read denied");
        }
        ok
    }

    pub fn can_write(&self, p: impl AsRef<Path>) -> bool {
        let canonical = self.resolve_input(p.as_ref());
        let ok = path_granted(&self.write, &canonical);
        if !ok {
            debug!(path = %canonical.display(), "write denied");
        }
        ok
    }

    pub fn can_run_path(&self, p: impl AsRef<Path>) -> bool {
        let canonical = self.resolve_input(p.as_ref());
        path_granted(&self.run.paths, &canonical)
    }

    pub fn can_run_command(&self, command: &str) -> bool {
        self.run.commands.allows_token(command)
    }

    pub fn can_access_net(&self, host: &str) -> bool {
        self.net.allows_token(host)
    }

    pub fn can_read_env(&self, name: &str) -> bool {
        self.env.allows_token(name)
    }
}
