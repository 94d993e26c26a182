//! Session configuration.
//!
//! Both configs implement `Default`, chained `with_*` builders and serde, so
//! they can be loaded from a JSON file. `from_env()` applies `RETRACE_*`
//! overrides on top of the defaults:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `RETRACE_MONITOR` | monitor level 0..=3 (record) |
//! | `RETRACE_STACKTRACES` | record a stack before each crossing result |
//! | `RETRACE_CHECKPOINT_CALLS` | checkpoint every call descriptor |
//! | `RETRACE_READ_TIMEOUT_MS` | fixed scheduling timeout (replay) |
//! | `RETRACE_FORK_PATH` | branch selection (replay) |
//! | `RETRACE_VERBOSE` | log every routed message at debug level |

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use retrace_types::env_utils::{env_flag, env_string, env_var};
use retrace_types::{Frame, ProcessId};
use retrace_wire::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fork::ForkPath;

/// Default wait for a thread's next message (matches the 1s read timeout of
/// earlier tooling).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Default ceiling for adaptive waits.
pub const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

/// Bytes buffered by the writer before a frame is flushed to the sink.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Highest monitor level (line events).
pub const MAX_MONITOR_LEVEL: u8 = 3;

/// Captures the current call stack, outermost frame first.
pub trait StackProvider: Send + Sync {
    fn capture(&self) -> Vec<Frame>;
}

/// How long a replaying thread may wait for its next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fail after a fixed wait.
    Fixed { timeout_ms: u64 },
    /// Fail after `idle_ms` without progress by any thread, or `max_ms` in
    /// total. Waits restart whenever some thread consumes a message.
    Adaptive { idle_ms: u64, max_ms: u64 },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Adaptive {
            idle_ms: DEFAULT_READ_TIMEOUT_MS,
            max_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl TimeoutPolicy {
    pub fn fixed(timeout: Duration) -> Self {
        TimeoutPolicy::Fixed {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn adaptive(idle: Duration, max: Duration) -> Self {
        TimeoutPolicy::Adaptive {
            idle_ms: idle.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Longest wait without progress.
    pub fn idle(&self) -> Duration {
        match self {
            TimeoutPolicy::Fixed { timeout_ms } => Duration::from_millis(*timeout_ms),
            TimeoutPolicy::Adaptive { idle_ms, .. } => Duration::from_millis(*idle_ms),
        }
    }

    /// Longest wait overall.
    pub fn max(&self) -> Duration {
        match self {
            TimeoutPolicy::Fixed { timeout_ms } => Duration::from_millis(*timeout_ms),
            TimeoutPolicy::Adaptive { max_ms, .. } => Duration::from_millis(*max_ms),
        }
    }

    /// Whether progress by other threads restarts the idle wait.
    pub fn resets_on_progress(&self) -> bool {
        matches!(self, TimeoutPolicy::Adaptive { .. })
    }
}

/// Recording settings. Everything except the process id ends up in the
/// trace header and binds the replay.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Monitor granularity: 0 = off, 1 = calls/returns, 2 = + native
    /// calls, 3 = + lines (default: 0).
    pub monitor_level: u8,

    /// Record a STACKTRACE before each crossing result (default: false).
    pub stacktraces: bool,

    /// Checkpoint the normalized call descriptor of every crossing
    /// (default: false).
    ///
    /// Catches replays that reach the right crossing with different
    /// arguments.
    pub checkpoint_calls: bool,

    /// Writer buffer size that triggers a frame flush.
    pub flush_threshold: usize,

    /// Environment fingerprint written into the header.
    pub fingerprint: Fingerprint,

    #[serde(default)]
    pub argv: Vec<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Process id stamped on the root segment (default: this process).
    pub pid: ProcessId,

    /// Source of STACKTRACE frames when `stacktraces` is on.
    #[serde(skip)]
    pub stack_provider: Option<Arc<dyn StackProvider>>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            monitor_level: 0,
            stacktraces: false,
            checkpoint_calls: false,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            fingerprint: Fingerprint::current(),
            argv: Vec::new(),
            metadata: BTreeMap::new(),
            pid: std::process::id(),
            stack_provider: None,
        }
    }
}

impl std::fmt::Debug for RecordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordConfig")
            .field("monitor_level", &self.monitor_level)
            .field("stacktraces", &self.stacktraces)
            .field("checkpoint_calls", &self.checkpoint_calls)
            .field("flush_threshold", &self.flush_threshold)
            .field("fingerprint", &self.fingerprint)
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .field("stack_provider", &self.stack_provider.is_some())
            .finish()
    }
}

impl RecordConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `RETRACE_*` overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(level) = env_var::<u8>("RETRACE_MONITOR") {
            self.monitor_level = level.min(MAX_MONITOR_LEVEL);
        }
        if let Some(on) = env_flag("RETRACE_STACKTRACES") {
            self.stacktraces = on;
        }
        if let Some(on) = env_flag("RETRACE_CHECKPOINT_CALLS") {
            self.checkpoint_calls = on;
        }
        self
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading record config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing record config {}", path.display()))?;
        let level = config.monitor_level;
        Ok(config.with_monitor_level(level))
    }

    /// Builder method: set monitor level (clamped to 0..=3).
    pub fn with_monitor_level(mut self, level: u8) -> Self {
        self.monitor_level = level.min(MAX_MONITOR_LEVEL);
        self
    }

    pub fn with_stacktraces(mut self, provider: Arc<dyn StackProvider>) -> Self {
        self.stacktraces = true;
        self.stack_provider = Some(provider);
        self
    }

    pub fn with_checkpoint_calls(mut self, on: bool) -> Self {
        self.checkpoint_calls = on;
        self
    }

    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_pid(mut self, pid: ProcessId) -> Self {
        self.pid = pid;
        self
    }
}

/// Replay settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub timeout: TimeoutPolicy,

    /// Branch selection at forks (default: parent).
    #[serde(default)]
    pub fork_path: ForkPath,

    /// Live environment fingerprint compared against the header.
    pub fingerprint: Fingerprint,

    /// Log every routed message at debug level.
    #[serde(default)]
    pub verbose: bool,

    /// Compare recorded stacks against this provider's, when recorded.
    #[serde(skip)]
    pub stack_provider: Option<Arc<dyn StackProvider>>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutPolicy::default(),
            fork_path: ForkPath::default(),
            fingerprint: Fingerprint::current(),
            verbose: false,
            stack_provider: None,
        }
    }
}

impl std::fmt::Debug for ReplayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayConfig")
            .field("timeout", &self.timeout)
            .field("fork_path", &self.fork_path)
            .field("fingerprint", &self.fingerprint)
            .field("verbose", &self.verbose)
            .field("stack_provider", &self.stack_provider.is_some())
            .finish()
    }
}

impl ReplayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_var::<u64>("RETRACE_READ_TIMEOUT_MS") {
            self.timeout = TimeoutPolicy::Fixed { timeout_ms: ms };
        }
        if let Some(raw) = env_string("RETRACE_FORK_PATH") {
            match ForkPath::parse(&raw) {
                Ok(path) => self.fork_path = path,
                Err(e) => warn!(value = %raw, error = %e, "ignoring RETRACE_FORK_PATH"),
            }
        }
        if let Some(on) = env_flag("RETRACE_VERBOSE") {
            self.verbose = on;
        }
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing replay config {}", path.display()))
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fork_path(mut self, path: ForkPath) -> Self {
        self.fork_path = path;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_stack_provider(mut self, provider: Arc<dyn StackProvider>) -> Self {
        self.stack_provider = Some(provider);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
