//! Side-channel records: stack frames, monitor events and call failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One frame of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl Frame {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// Kind of a fine-grained monitor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Call,
    Return,
    NativeCall,
    Line,
}

impl MonitorKind {
    /// Lowest monitor level at which this kind is recorded.
    ///
    /// - 1: function calls and returns
    /// - 2: adds calls into native code
    /// - 3: adds line events
    pub fn min_level(self) -> u8 {
        match self {
            MonitorKind::Call | MonitorKind::Return => 1,
            MonitorKind::NativeCall => 2,
            MonitorKind::Line => 3,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MonitorKind::Call => 0,
            MonitorKind::Return => 1,
            MonitorKind::NativeCall => 2,
            MonitorKind::Line => 3,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MonitorKind::Call),
            1 => Some(MonitorKind::Return),
            2 => Some(MonitorKind::NativeCall),
            3 => Some(MonitorKind::Line),
            _ => None,
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorKind::Call => "call",
            MonitorKind::Return => "return",
            MonitorKind::NativeCall => "native_call",
            MonitorKind::Line => "line",
        };
        write!(f, "{}", name)
    }
}

/// Function-boundary fingerprint used to localize divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub kind: MonitorKind,
    pub qualname: String,
    pub file: String,
    pub line: u32,
}

impl MonitorEvent {
    pub fn call(qualname: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            kind: MonitorKind::Call,
            qualname: qualname.into(),
            file: file.into(),
            line,
        }
    }

    pub fn ret(qualname: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            kind: MonitorKind::Return,
            qualname: qualname.into(),
            file: file.into(),
            line,
        }
    }

    pub fn with_kind(mut self, kind: MonitorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}:{})", self.kind, self.qualname, self.file, self.line)
    }
}

/// Failure raised by an intercepted operation.
///
/// This is recorded data, not an engine error: recording captures it as an
/// ERROR message and replay re-raises the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: String,
    pub message: String,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_levels() {
        assert_eq!(MonitorKind::Call.min_level(), 1);
        assert_eq!(MonitorKind::Return.min_level(), 1);
        assert_eq!(MonitorKind::NativeCall.min_level(), 2);
        assert_eq!(MonitorKind::Line.min_level(), 3);
        for kind in [MonitorKind::Call, MonitorKind::Return, MonitorKind::NativeCall, MonitorKind::Line] {
            assert_eq!(MonitorKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MonitorKind::from_u8(9), None);
    }

    #[test]
    fn test_call_error_display() {
        let err = CallError::new("ConnectionRefusedError", "[Errno 111] refused");
        assert_eq!(err.to_string(), "ConnectionRefusedError: [Errno 111] refused");
    }
}
