//! Path selection masks.
//!
//! Operations take two masks: a selection mask matched against file names
//! (never directories) and a subtree mask matched against full paths. Masks
//! compose with not/and/or.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A predicate over paths.
pub trait Mask {
    fn covers(&self, path: &Path) -> bool;
}

/// Mask with a constant answer.
pub struct BoolMask(pub bool);

impl Mask for BoolMask {
    fn covers(&self, _path: &Path) -> bool {
        self.0
    }
}

/// Shell glob mask over the file name, using the C library matcher.
pub struct GlobMask {
    pattern: CString,
}

impl GlobMask {
    /// Builds a mask from a glob pattern (`*`, `?`, `[...]`).
    ///
    /// Returns `None` when the pattern contains an interior NUL byte.
    pub fn new(pattern: &str) -> Option<Self> {
        CString::new(pattern).ok().map(|pattern| Self { pattern })
    }
}

impl Mask for GlobMask {
    fn covers(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(name) => name,
            None => return false,
        };
        let Ok(name) = CString::new(name.as_bytes()) else {
            return false;
        };
        unsafe { libc::fnmatch(self.pattern.as_ptr(), name.as_ptr(), 0) == 0 }
    }
}

/// Subtree mask: covers a path when it lies under the given root, or is one
/// of the root's ancestors (so a traversal can reach the subtree).
pub struct PathMask {
    root: PathBuf,
}

impl PathMask {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Mask for PathMask {
    fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.root) || self.root.starts_with(path)
    }
}

/// Negation of another mask.
pub struct NotMask(pub Box<dyn Mask>);

impl Mask for NotMask {
    fn covers(&self, path: &Path) -> bool {
        !self.0.covers(path)
    }
}

/// Conjunction: covers when every member covers. Empty means everything.
pub struct AndMask(pub Vec<Box<dyn Mask>>);

impl Mask for AndMask {
    fn covers(&self, path: &Path) -> bool {
        self.0.iter().all(|m| m.covers(path))
    }
}

/// Disjunction: covers when any member covers. Empty means nothing.
pub struct OrMask(pub Vec<Box<dyn Mask>>);

impl Mask for OrMask {
    fn covers(&self, path: &Path) -> bool {
        self.0.iter().any(|m| m.covers(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_file_name_only() {
        let m = GlobMask::new("*.txt").unwrap();
        assert!(m.covers(Path::new("/deep/dir/a.txt")));
        assert!(m.covers(Path::new("b.txt")));
        assert!(!m.covers(Path::new("/deep/dir.txt/binary")));
        assert!(!m.covers(Path::new("c.bin")));
    }

    #[test]
    fn glob_character_classes() {
        let m = GlobMask::new("slice.[0-9]").unwrap();
        assert!(m.covers(Path::new("slice.4")));
        assert!(!m.covers(Path::new("slice.x")));
    }

    #[test]
    fn path_mask_covers_subtree_and_ancestors() {
        let m = PathMask::new("/src/sub");
        assert!(m.covers(Path::new("/src/sub")));
        assert!(m.covers(Path::new("/src/sub/deep/file")));
        assert!(m.covers(Path::new("/src")));
        assert!(!m.covers(Path::new("/src/other")));
    }

    #[test]
    fn combinators() {
        let txt = Box::new(GlobMask::new("*.txt").unwrap());
        let all = AndMask(vec![txt, Box::new(BoolMask(true))]);
        assert!(all.covers(Path::new("x.txt")));
        assert!(!all.covers(Path::new("x.log")));

        let none = NotMask(Box::new(BoolMask(true)));
        assert!(!none.covers(Path::new("anything")));

        let either = OrMask(vec![
            Box::new(GlobMask::new("*.log").unwrap()),
            Box::new(GlobMask::new("*.txt").unwrap()),
        ]);
        assert!(either.covers(Path::new("x.log")));
        assert!(either.covers(Path::new("x.txt")));
        assert!(!either.covers(Path::new("x.bin")));
    }
}
