//! Thread, process and handle identifiers.

use smallvec::SmallVec;
use std::fmt;

/// Dense integer naming a previously-serialized object.
pub type Handle = u32;

/// Process identifier stamped on every trace segment.
pub type ProcessId = u32;

/// Hierarchical, deterministic thread identifier.
///
/// The root thread has the empty path. A thread spawned as the `n`-th child
/// of its parent gets the parent's path with `n` appended, so identifiers
/// depend only on spawn order and never on OS thread ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadPath(SmallVec<[u32; 4]>);

impl ThreadPath {
    /// The root (main) thread.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: &[u32]) -> Self {
        Self(SmallVec::from_slice(segments))
    }

    /// Path of this thread's `index`-th spawned child.
    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(index);
        Self(segments)
    }

    pub fn parent(&self) -> Option<ThreadPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(SmallVec::from_slice(&self.0[..self.0.len() - 1])))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Parse the display form (`main`, `0`, `0.2.1`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s == "main" {
            return Some(Self::root());
        }
        s.split('.')
            .map(|part| part.parse::<u32>().ok())
            .collect::<Option<SmallVec<[u32; 4]>>>()
            .map(Self)
    }
}

impl fmt::Display for ThreadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "main");
        }
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_paths_follow_spawn_order() {
        let root = ThreadPath::root();
        let first = root.child(0);
        let grandchild = first.child(1);

        assert!(root.is_root());
        assert_eq!(grandchild.segments(), &[0, 1]);
        assert_eq!(grandchild.parent(), Some(first.clone()));
        assert_eq!(first.parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn test_display_and_parse() {
        let path = ThreadPath::from_segments(&[0, 2, 1]);
        assert_eq!(path.to_string(), "0.2.1");
        assert_eq!(ThreadPath::parse("0.2.1"), Some(path));
        assert_eq!(ThreadPath::root().to_string(), "main");
        assert_eq!(ThreadPath::parse("main"), Some(ThreadPath::root()));
        assert_eq!(ThreadPath::parse("0.x"), None);
    }
}
