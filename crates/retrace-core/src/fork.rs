//! Fork coordination: branch selection and write stamps.
//!
//! During recording every append carries a [`Stamp`] naming the process and
//! the fork epoch it belongs to. A fork bumps the epoch, so a write prepared
//! before the fork and issued after it is rejected instead of landing in the
//! wrong segment.
//!
//! During replay a [`ForkPath`] decides, fork by fork, whether to follow the
//! parent or the child segment.

use std::fmt;
use std::str::FromStr;

use retrace_types::{ProcessId, ThreadPath};
use serde::{Deserialize, Serialize};

/// Process and fork epoch a write belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub pid: ProcessId,
    pub epoch: u64,
}

impl Stamp {
    pub fn new(pid: ProcessId) -> Self {
        Self { pid, epoch: 0 }
    }

    /// Stamp of one side of a fork.
    pub fn after_fork(self, pid: ProcessId) -> Self {
        Self {
            pid,
            epoch: self.epoch + 1,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} epoch {}", self.pid, self.epoch)
    }
}

/// Which side of a fork the replay follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    /// Continue as the parent; the recorded child pid is returned to the
    /// program as the fork result.
    Parent { child_pid: ProcessId },
    /// Continue as the child, whose fork result is 0.
    Child { pid: ProcessId },
}

impl ForkSide {
    /// Value the program's fork call returns.
    pub fn fork_result(&self) -> ProcessId {
        match self {
            ForkSide::Parent { child_pid } => *child_pid,
            ForkSide::Child { .. } => 0,
        }
    }

    pub fn is_child(&self) -> bool {
        matches!(self, ForkSide::Child { .. })
    }
}

/// Recorded state handed from `prepare_fork` to the resume calls.
#[derive(Debug)]
pub struct ForkToken {
    pub(crate) stamp: Stamp,
    pub(crate) thread: ThreadPath,
    pub(crate) spawned: u32,
}

impl ForkToken {
    pub fn thread(&self) -> &ThreadPath {
        &self.thread
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }
}

/// Longest fork path accepted, in forks.
pub const MAX_FORKS: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkPathError {
    Empty(String),
    BadCount(String),
    BadSide(String),
    TooLong(usize),
}

impl fmt::Display for ForkPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkPathError::Empty(s) => write!(f, "fork path {:?} has no run lengths", s),
            ForkPathError::BadCount(s) => write!(f, "invalid run length {:?} in fork path", s),
            ForkPathError::BadSide(s) => {
                write!(f, "fork path must start with 'child' or 'parent', got {:?}", s)
            }
            ForkPathError::TooLong(n) => {
                write!(f, "fork path covers {} forks, at most {} are supported", n, MAX_FORKS)
            }
        }
    }
}

impl std::error::Error for ForkPathError {}

/// Branch selection for successive forks.
///
/// Accepted notations:
///
/// - `""` or `"parent"`: always follow the parent
/// - `"child"`: always follow the child
/// - `"1101"`: one digit per fork in order, `1` = child, `0` = parent
/// - `"child-2-1-1"`: run lengths of alternating sides, starting with the
///   named one (`1101`)
///
/// Forks beyond the end of an explicit path follow the parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ForkPath {
    #[default]
    AlwaysParent,
    AlwaysChild,
    Bits(Vec<bool>),
}

impl ForkPath {
    pub fn parse(s: &str) -> Result<Self, ForkPathError> {
        let s = s.trim();
        match s {
            "" | "parent" => return Ok(ForkPath::AlwaysParent),
            "child" => return Ok(ForkPath::AlwaysChild),
            _ => {}
        }
        if s.chars().all(|c| c == '0' || c == '1') {
            if s.len() > MAX_FORKS {
                return Err(ForkPathError::TooLong(s.len()));
            }
            return Ok(ForkPath::Bits(s.chars().map(|c| c == '1').collect()));
        }
        let mut parts = s.split('-');
        let mut bit = match parts.next() {
            Some("child") => true,
            Some("parent") => false,
            other => return Err(ForkPathError::BadSide(other.unwrap_or_default().to_string())),
        };
        let mut bits = Vec::new();
        let mut runs = 0;
        for count in parts {
            let n: usize = count
                .parse()
                .map_err(|_| ForkPathError::BadCount(count.to_string()))?;
            let total = bits.len().saturating_add(n);
            if total > MAX_FORKS {
                return Err(ForkPathError::TooLong(total));
            }
            bits.extend(std::iter::repeat(bit).take(n));
            bit = !bit;
            runs += 1;
        }
        if runs == 0 {
            return Err(ForkPathError::Empty(s.to_string()));
        }
        Ok(ForkPath::Bits(bits))
    }

    /// Whether fork number `index` (0-based) follows the child.
    pub fn follows_child(&self, index: usize) -> bool {
        match self {
            ForkPath::AlwaysParent => false,
            ForkPath::AlwaysChild => true,
            ForkPath::Bits(bits) => bits.get(index).copied().unwrap_or(false),
        }
    }

    /// Expanded bit string (`"child"` for the unbounded child path).
    pub fn expanded(&self) -> String {
        match self {
            ForkPath::AlwaysParent => String::new(),
            ForkPath::AlwaysChild => "child".to_string(),
            ForkPath::Bits(bits) => bits.iter().map(|b| if *b { '1' } else { '0' }).collect(),
        }
    }
}

impl fmt::Display for ForkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkPath::AlwaysParent => write!(f, "parent"),
            other => write!(f, "{}", other.expanded()),
        }
    }
}

impl FromStr for ForkPath {
    type Err = ForkPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ForkPath {
    type Error = ForkPathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ForkPath> for String {
    fn from(path: ForkPath) -> Self {
        path.to_string()
    }
}
