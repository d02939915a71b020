//! Compact interned path handles (spec §3, "Interned path").
//!
//! All paths handled by the core are absolute and syntactically normalized;
//! the table does not normalize on your behalf, it asserts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A compact handle into a process-wide path interning table.
///
/// Two `PathId`s are equal iff their canonical string forms are equal under
/// the platform's path comparison (case-insensitive on Windows,
/// case-sensitive elsewhere) — equality is therefore always checked through
/// the owning [`PathTable`], never by comparing the raw index, since two
/// different tables could assign the same index to different paths.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PathId(u32);

impl PathId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(windows)]
fn canonical_key(s: &str) -> String {
    s.to_ascii_lowercase()
}

#[cfg(not(windows))]
fn canonical_key(s: &str) -> String {
    s.to_owned()
}

fn assert_absolute_normalized(path: &Path) {
    assert!(
        path.is_absolute(),
        "PathTable only accepts absolute paths, got {path:?}"
    );
    assert!(
        !path.components().any(|c| matches!(
            c,
            std::path::Component::CurDir | std::path::Component::ParentDir
        )),
        "PathTable only accepts syntactically normalized paths, got {path:?}"
    );
}

struct Inner {
    strings: Vec<Arc<str>>,
    by_key: HashMap<String, PathId>,
}

/// A process-wide table interning absolute, normalized paths into
/// [`PathId`] handles.
///
/// Shared by reference (`Arc<PathTable>`) across every pip in the same
/// process tree; construction is cheap and the table only grows.
pub struct PathTable {
    inner: RwLock<Inner>,
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        PathTable {
            inner: RwLock::new(Inner {
                strings: Vec::new(),
                by_key: HashMap::new(),
            }),
        }
    }

    /// Interns `path`, returning its [`PathId`]. Interning the same path
    /// (under platform comparison rules) twice returns the same id.
    pub fn intern(&self, path: &Path) -> PathId {
        assert_absolute_normalized(path);
        let s = path.to_string_lossy();
        let key = canonical_key(&s);

        if let Some(id) = self.inner.read().unwrap().by_key.get(&key) {
            return *id;
        }

        let mut inner = self.inner.write().unwrap();
        // Re-check under the write lock: another thread may have interned
        // the same path while we didn't hold any lock.
        if let Some(id) = inner.by_key.get(&key) {
            return *id;
        }
        let id = PathId(inner.strings.len() as u32);
        inner.strings.push(Arc::from(s.into_owned()));
        inner.by_key.insert(key, id);
        id
    }

    /// Expands `id` back to its full string form.
    pub fn expand_to_string(&self, id: PathId) -> String {
        self.inner.read().unwrap().strings[id.index()].to_string()
    }

    fn expand_path(&self, id: PathId) -> PathBuf {
        PathBuf::from(self.expand_to_string(id))
    }

    /// The parent directory of `id`, if any (absent only for a filesystem
    /// root).
    pub fn parent(&self, id: PathId) -> Option<PathId> {
        let path = self.expand_path(id);
        path.parent().map(|p| self.intern(p))
    }

    /// The final path component of `id`.
    pub fn leaf_name(&self, id: PathId) -> String {
        let path = self.expand_path(id);
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Appends `leaf` onto `id`, interning the result.
    pub fn combine(&self, id: PathId, leaf: &str) -> PathId {
        let mut path = self.expand_path(id);
        path.push(leaf);
        self.intern(&path)
    }

    /// Relocates `id`, which must be within `from_root`, to the
    /// corresponding path under `to_root`, preserving the relative depth.
    ///
    /// E.g. relocating `/a/b/c` from `/a` to `/x` yields `/x/b/c`.
    pub fn relocate(&self, id: PathId, from_root: PathId, to_root: PathId) -> Option<PathId> {
        if !self.is_within(id, from_root) {
            return None;
        }
        let path = self.expand_path(id);
        let from = self.expand_path(from_root);
        let suffix = path.strip_prefix(&from).ok()?;
        let mut result = self.expand_path(to_root);
        result.push(suffix);
        Some(self.intern(&result))
    }

    /// True iff `id` is `ancestor` itself or a descendant of it, under the
    /// platform's path comparison.
    pub fn is_within(&self, id: PathId, ancestor: PathId) -> bool {
        let path = self.expand_path(id);
        let ancestor_path = self.expand_path(ancestor);
        path.starts_with(&ancestor_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn interning_round_trips() {
        let table = PathTable::new();
        let id = table.intern(Path::new("/a/b/c"));
        assert_eq!(table.expand_to_string(id), "/a/b/c");
        assert_eq!(table.leaf_name(id), "c");
    }

    #[cfg(unix)]
    #[test]
    fn same_path_interns_to_same_id() {
        let table = PathTable::new();
        let a = table.intern(Path::new("/a/b"));
        let b = table.intern(Path::new("/a/b"));
        assert_eq!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn parent_and_combine_are_inverse_ish() {
        let table = PathTable::new();
        let child = table.intern(Path::new("/a/b/c"));
        let parent = table.parent(child).unwrap();
        assert_eq!(table.expand_to_string(parent), "/a/b");
        let recombined = table.combine(parent, "c");
        assert_eq!(recombined, child);
    }

    #[cfg(unix)]
    #[test]
    fn relocate_preserves_relative_depth() {
        let table = PathTable::new();
        let original_root = table.intern(Path::new("/out"));
        let redirected_root = table.intern(Path::new("/redir/out_1"));
        let file = table.intern(Path::new("/out/nested/file.o"));
        let relocated = table.relocate(file, original_root, redirected_root).unwrap();
        assert_eq!(table.expand_to_string(relocated), "/redir/out_1/nested/file.o");
    }

    #[cfg(unix)]
    #[test]
    fn is_within_is_prefix_based() {
        let table = PathTable::new();
        let root = table.intern(Path::new("/out"));
        let inner = table.intern(Path::new("/out/a"));
        let sibling = table.intern(Path::new("/output/a"));
        assert!(table.is_within(inner, root));
        assert!(!table.is_within(sibling, root));
    }

    #[test]
    #[should_panic(expected = "absolute")]
    fn rejects_relative_paths() {
        let table = PathTable::new();
        table.intern(Path::new("relative/path"));
    }
}
