//! In-memory record-then-replay harness.
//!
//! ```ignore
//! let runner = TestRunner::new(policy);
//! let recording = runner.record(|s| program(s))?;
//! let replayed = runner.replay(&recording, |s| program(s))?;
//! ```
//!
//! Replay fails with `ReplayDivergence` when the program's outcome differs
//! from the recorded one (error vs. success, or a different value) or when
//! recorded messages are left unconsumed.

use retrace_types::{DivergenceReport, Result, RetraceError, TraceContext, Value};
use tracing::debug;

use crate::config::{RecordConfig, ReplayConfig};
use crate::policy::{CallResult, PolicyTable};
use crate::session::Session;
use crate::sink::MemoryTape;

/// A finished in-memory recording.
#[derive(Clone)]
pub struct Recording {
    tape: MemoryTape,
    outcome: CallResult,
}

impl Recording {
    pub fn tape(&self) -> &MemoryTape {
        &self.tape
    }

    /// What the program returned while recording.
    pub fn outcome(&self) -> &CallResult {
        &self.outcome
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestRunner {
    policy: PolicyTable,
    record: RecordConfig,
    replay: ReplayConfig,
}

impl TestRunner {
    pub fn new(policy: PolicyTable) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn with_record_config(mut self, config: RecordConfig) -> Self {
        self.record = config;
        self
    }

    pub fn with_replay_config(mut self, config: ReplayConfig) -> Self {
        self.replay = config;
        self
    }

    /// Run `program` against a fresh recording session.
    pub fn record<F>(&self, program: F) -> Result<Recording>
    where
        F: FnOnce(&Session) -> Result<CallResult>,
    {
        let tape = MemoryTape::new();
        let session = Session::begin_recording(tape.writer(), self.record.clone(), self.policy.clone())?;
        let outcome = program(&session)?;
        session.finish()?;
        debug!(bytes = tape.len(), "recorded");
        Ok(Recording { tape, outcome })
    }

    /// Run `program` against a replay of `recording` and check that it ends
    /// the way the recording did.
    pub fn replay<F>(&self, recording: &Recording, program: F) -> Result<CallResult>
    where
        F: FnOnce(&Session) -> Result<CallResult>,
    {
        let session = Session::begin_replay(
            recording.tape.reader(),
            self.replay.clone(),
            self.policy.clone(),
        )?;
        let outcome = program(&session)?;
        compare_outcomes(&session, &recording.outcome, &outcome)?;
        session.finish()?;
        Ok(outcome)
    }

    /// Record, then replay the same program.
    pub fn run<F>(&self, program: F) -> Result<CallResult>
    where
        F: Fn(&Session) -> Result<CallResult>,
    {
        let recording = self.record(&program)?;
        self.replay(&recording, &program)
    }
}

fn compare_outcomes(session: &Session, recorded: &CallResult, replayed: &CallResult) -> Result<()> {
    let (what, expected, actual) = match (recorded, replayed) {
        (Ok(a), Ok(b)) if a == b => return Ok(()),
        (Err(a), Err(b)) if a == b => return Ok(()),
        (Ok(a), Ok(b)) => ("return value", a.clone(), b.clone()),
        (Ok(a), Err(b)) => ("outcome", a.clone(), Value::Str(format!("raised {}", b))),
        (Err(a), Ok(b)) => ("outcome", Value::Str(format!("raised {}", a)), b.clone()),
        (Err(a), Err(b)) => ("raised error", Value::Str(a.to_string()), Value::Str(b.to_string())),
    };
    let report = DivergenceReport::new(what, expected, actual, TraceContext::default().with_pid(session.pid()));
    Err(match session.detector() {
        Some(detector) => detector.diverge(report),
        None => RetraceError::divergence(report),
    })
}
