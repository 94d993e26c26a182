//! Fatal error taxonomy for record and replay.
//!
//! | Code | Variant | Meaning |
//! |------|---------|---------|
//! | R100 | `TruncatedTrace` | input exhausted or malformed mid-message |
//! | R200 | `ProtocolViolation` | bind/pending-bind misuse, stale fork stamp |
//! | R300 | `ReplayDivergence` | checkpoint, monitor or control-flow mismatch |
//! | R400 | `SchedulingTimeout` | a thread missed its turn on the tape |
//! | R500 | `EnvironmentMismatch` | header fingerprint differs from the live one |
//! | R600 | `Io` | sink or source failure |
//!
//! None of these are recoverable. Every variant carries enough context to
//! locate the failure in the trace without re-running.

use std::fmt;
use std::time::Duration;

use crate::event::Frame;
use crate::thread::{ProcessId, ThreadPath};
use crate::value::Value;

pub type Result<T> = std::result::Result<T, RetraceError>;

/// Where in the trace an error was detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// Index of the message being processed (0-based, per stream).
    pub message_index: u64,
    /// Byte offset of that message in the decoded payload stream.
    pub byte_offset: u64,
    pub thread: Option<ThreadPath>,
    pub pid: Option<ProcessId>,
}

impl TraceContext {
    pub fn at(message_index: u64, byte_offset: u64) -> Self {
        Self {
            message_index,
            byte_offset,
            ..Default::default()
        }
    }

    pub fn with_thread(mut self, thread: ThreadPath) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_pid(mut self, pid: ProcessId) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message {} at byte {}", self.message_index, self.byte_offset)?;
        if let Some(thread) = &self.thread {
            write!(f, ", thread {}", thread)?;
        }
        if let Some(pid) = self.pid {
            write!(f, ", pid {}", pid)?;
        }
        Ok(())
    }
}

/// Recorded and replayed stacks split at their common root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDifference {
    pub common: Vec<Frame>,
    pub recorded: Vec<Frame>,
    pub replayed: Vec<Frame>,
}

impl StackDifference {
    /// Split two outermost-first stacks at the first differing frame.
    pub fn between(recorded: &[Frame], replayed: &[Frame]) -> Self {
        let shared = recorded
            .iter()
            .zip(replayed.iter())
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            common: recorded[..shared].to_vec(),
            recorded: recorded[shared..].to_vec(),
            replayed: replayed[shared..].to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty() && self.replayed.is_empty()
    }
}

impl fmt::Display for StackDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "common root ({} frames):", self.common.len())?;
        for frame in &self.common {
            writeln!(f, "    {}", frame)?;
        }
        writeln!(f, "recorded:")?;
        for frame in &self.recorded {
            writeln!(f, "  - {}", frame)?;
        }
        writeln!(f, "replayed:")?;
        for frame in &self.replayed {
            writeln!(f, "  + {}", frame)?;
        }
        Ok(())
    }
}

/// Full description of a replay divergence.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceReport {
    /// What was being compared (`"checkpoint"`, `"monitor"`, `"result"`, ...).
    pub what: String,
    pub expected: Value,
    pub actual: Value,
    pub context: TraceContext,
    /// Rendered recorded messages surrounding the failure point.
    pub window: Vec<String>,
    pub stack: Option<StackDifference>,
}

impl DivergenceReport {
    pub fn new(what: impl Into<String>, expected: Value, actual: Value, context: TraceContext) -> Self {
        Self {
            what: what.into(),
            expected,
            actual,
            context,
            window: Vec::new(),
            stack: None,
        }
    }

    pub fn with_window(mut self, window: Vec<String>) -> Self {
        self.window = window;
        self
    }

    pub fn with_stack(mut self, stack: StackDifference) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Multi-line rendering for terminal output.
    pub fn render(&self) -> String {
        let mut out = format!(
            "TRACE DIVERGENCE at event {} ({})\n  {} mismatch\n  expected: {}\n  actual:   {}\n",
            self.context.message_index, self.context, self.what, self.expected, self.actual
        );
        if !self.window.is_empty() {
            out.push_str("  recorded messages:\n");
            for line in &self.window {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
        if let Some(stack) = &self.stack {
            out.push_str(&stack.to_string());
        }
        out
    }
}

/// Demultiplexer state captured when a thread gives up waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    pub thread: ThreadPath,
    pub pid: ProcessId,
    pub waited: Duration,
    /// Index of the last message delivered to any thread.
    pub last_matched: Option<u64>,
    /// Owner of the message at the cursor when the wait expired.
    pub cursor_owner: Option<ThreadPath>,
    /// Messages buffered per thread, in path order.
    pub buffered: Vec<(ThreadPath, usize)>,
    /// Last thread seen in each process segment.
    pub last_thread_per_segment: Vec<(ProcessId, ThreadPath)>,
}

impl fmt::Display for TimeoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread {} (pid {}) waited {:?}; last matched message: ",
            self.thread, self.pid, self.waited
        )?;
        match self.last_matched {
            Some(index) => write!(f, "{}", index)?,
            None => write!(f, "none")?,
        }
        if let Some(owner) = &self.cursor_owner {
            write!(f, "; cursor owned by {}", owner)?;
        }
        for (thread, count) in &self.buffered {
            write!(f, "; {} buffered for {}", count, thread)?;
        }
        for (pid, thread) in &self.last_thread_per_segment {
            write!(f, "; segment {} last on {}", pid, thread)?;
        }
        Ok(())
    }
}

/// Engine error.
#[derive(Debug)]
pub enum RetraceError {
    /// Input ended or was malformed in the middle of a message.
    TruncatedTrace { reason: String, context: TraceContext },

    /// Bind-table or stamp misuse; signals an engine bug.
    ProtocolViolation { reason: String, context: TraceContext },

    /// Live and recorded values disagree.
    ReplayDivergence(Box<DivergenceReport>),

    /// A thread did not reach its next message in time.
    SchedulingTimeout(Box<TimeoutReport>),

    /// The trace header fingerprint does not match the live environment.
    EnvironmentMismatch { differences: Vec<String> },

    /// Sink or source I/O failure.
    Io {
        operation: String,
        source: std::io::Error,
    },
}

impl RetraceError {
    pub fn truncated(reason: impl Into<String>, context: TraceContext) -> Self {
        RetraceError::TruncatedTrace {
            reason: reason.into(),
            context,
        }
    }

    pub fn protocol(reason: impl Into<String>, context: TraceContext) -> Self {
        RetraceError::ProtocolViolation {
            reason: reason.into(),
            context,
        }
    }

    pub fn divergence(report: DivergenceReport) -> Self {
        RetraceError::ReplayDivergence(Box::new(report))
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        RetraceError::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            RetraceError::TruncatedTrace { .. } => "R100",
            RetraceError::ProtocolViolation { .. } => "R200",
            RetraceError::ReplayDivergence(_) => "R300",
            RetraceError::SchedulingTimeout(_) => "R400",
            RetraceError::EnvironmentMismatch { .. } => "R500",
            RetraceError::Io { .. } => "R600",
        }
    }

    pub fn divergence_report(&self) -> Option<&DivergenceReport> {
        match self {
            RetraceError::ReplayDivergence(report) => Some(report),
            _ => None,
        }
    }

    pub fn timeout_report(&self) -> Option<&TimeoutReport> {
        match self {
            RetraceError::SchedulingTimeout(report) => Some(report),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&TraceContext> {
        match self {
            RetraceError::TruncatedTrace { context, .. }
            | RetraceError::ProtocolViolation { context, .. } => Some(context),
            RetraceError::ReplayDivergence(report) => Some(&report.context),
            _ => None,
        }
    }

    /// Attach thread/pid to a context that lacks them.
    pub fn located(mut self, thread: &ThreadPath, pid: ProcessId) -> Self {
        let context = match &mut self {
            RetraceError::TruncatedTrace { context, .. }
            | RetraceError::ProtocolViolation { context, .. } => Some(context),
            RetraceError::ReplayDivergence(report) => Some(&mut report.context),
            _ => None,
        };
        if let Some(context) = context {
            if context.thread.is_none() {
                context.thread = Some(thread.clone());
            }
            if context.pid.is_none() {
                context.pid = Some(pid);
            }
        }
        self
    }
}

impl fmt::Display for RetraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetraceError::TruncatedTrace { reason, context } => {
                write!(f, "[{}] truncated trace: {} ({})", self.code(), reason, context)
            }
            RetraceError::ProtocolViolation { reason, context } => {
                write!(f, "[{}] protocol violation: {} ({})", self.code(), reason, context)
            }
            RetraceError::ReplayDivergence(report) => {
                write!(
                    f,
                    "[{}] replay divergence in {}: expected {}, got {} ({})",
                    self.code(),
                    report.what,
                    report.expected,
                    report.actual,
                    report.context
                )
            }
            RetraceError::SchedulingTimeout(report) => {
                write!(f, "[{}] scheduling timeout: {}", self.code(), report)
            }
            RetraceError::EnvironmentMismatch { differences } => {
                write!(f, "[{}] environment mismatch:", self.code())?;
                for line in differences {
                    write!(f, "\n{}", line)?;
                }
                Ok(())
            }
            RetraceError::Io { operation, source } => {
                write!(f, "[{}] I/O error during {}: {}", self.code(), operation, source)
            }
        }
    }
}

impl std::error::Error for RetraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetraceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_difference_splits_at_common_root() {
        let main = Frame::new("app.rs", 1, "main");
        let fetch = Frame::new("app.rs", 10, "fetch");
        let retry = Frame::new("app.rs", 20, "retry");
        let parse = Frame::new("app.rs", 30, "parse");

        let diff = StackDifference::between(
            &[main.clone(), fetch.clone(), retry.clone()],
            &[main.clone(), fetch.clone(), parse.clone()],
        );
        assert_eq!(diff.common, vec![main, fetch]);
        assert_eq!(diff.recorded, vec![retry]);
        assert_eq!(diff.replayed, vec![parse]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_error_codes_and_display() {
        let err = RetraceError::protocol("handle 3 bound twice", TraceContext::at(7, 120));
        assert_eq!(err.code(), "R200");
        assert!(err.to_string().contains("handle 3 bound twice"));
        assert!(err.to_string().contains("message 7 at byte 120"));

        let located = err.located(&ThreadPath::from_segments(&[1]), 42);
        let context = located.context().cloned().unwrap();
        assert_eq!(context.thread, Some(ThreadPath::from_segments(&[1])));
        assert_eq!(context.pid, Some(42));
    }

    #[test]
    fn test_divergence_render_lists_window() {
        let report = DivergenceReport::new(
            "checkpoint",
            Value::Int(1),
            Value::Int(2),
            TraceContext::at(4, 64),
        )
        .with_window(vec!["#3 SYNC".into(), "#4 CHECKPOINT 1".into()]);

        let text = report.render();
        assert!(text.starts_with("TRACE DIVERGENCE at event 4"));
        assert!(text.contains("expected: 1"));
        assert!(text.contains("actual:   2"));
        assert!(text.contains("#4 CHECKPOINT 1"));
    }
}
