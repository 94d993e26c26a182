//! Checkpoint/divergence detector.
//!
//! ```text
//!   NORMAL --(mismatch)--> DIVERGED
//! ```
//!
//! DIVERGED is terminal: the first report is kept and every later replay
//! operation fails with it, so one divergence is never masked by the
//! knock-on failures it causes.

use parking_lot::Mutex;
use retrace_types::{
    DivergenceReport, Frame, MonitorEvent, Result, RetraceError, StackDifference, TraceContext,
    Value,
};
use tracing::error;

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorState {
    Normal,
    Diverged(Box<DivergenceReport>),
}

pub struct Detector {
    state: Mutex<DetectorState>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DetectorState::Normal),
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state.lock().clone()
    }

    pub fn is_diverged(&self) -> bool {
        matches!(*self.state.lock(), DetectorState::Diverged(_))
    }

    /// Fail with the stored report once diverged.
    pub fn ensure_normal(&self) -> Result<()> {
        match &*self.state.lock() {
            DetectorState::Normal => Ok(()),
            DetectorState::Diverged(report) => Err(RetraceError::divergence((**report).clone())),
        }
    }

    /// Enter DIVERGED (first report wins) and return the error to raise.
    pub fn diverge(&self, report: DivergenceReport) -> RetraceError {
        let mut state = self.state.lock();
        if let DetectorState::Diverged(first) = &*state {
            return RetraceError::divergence((**first).clone());
        }
        error!(
            what = %report.what,
            expected = %report.expected,
            actual = %report.actual,
            message_index = report.context.message_index,
            thread = ?report.context.thread,
            "replay diverged"
        );
        *state = DetectorState::Diverged(Box::new(report.clone()));
        RetraceError::divergence(report)
    }

    /// Compare a recorded value with the live one.
    pub fn compare(
        &self,
        what: &str,
        recorded: &Value,
        live: &Value,
        context: &TraceContext,
        window: impl FnOnce() -> Vec<String>,
    ) -> Result<()> {
        self.ensure_normal()?;
        if recorded == live {
            return Ok(());
        }
        let report = DivergenceReport::new(what, recorded.clone(), live.clone(), context.clone())
            .with_window(window());
        Err(self.diverge(report))
    }

    /// Compare recorded and live monitor events.
    pub fn compare_monitor(
        &self,
        recorded: &MonitorEvent,
        live: &MonitorEvent,
        context: &TraceContext,
        window: impl FnOnce() -> Vec<String>,
    ) -> Result<()> {
        self.ensure_normal()?;
        if recorded == live {
            return Ok(());
        }
        let what = format!("monitor at {} boundary of {}", live.kind, live.qualname);
        let report = DivergenceReport::new(
            what,
            Value::Str(recorded.to_string()),
            Value::Str(live.to_string()),
            context.clone(),
        )
        .with_window(window());
        Err(self.diverge(report))
    }

    /// Compare recorded and live stacks, reporting where they split.
    pub fn compare_stacks(
        &self,
        recorded: &[Frame],
        live: &[Frame],
        context: &TraceContext,
        window: impl FnOnce() -> Vec<String>,
    ) -> Result<()> {
        self.ensure_normal()?;
        if recorded == live {
            return Ok(());
        }
        let difference = StackDifference::between(recorded, live);
        let top = |frames: &[Frame]| {
            frames
                .last()
                .map(|f| Value::Str(f.to_string()))
                .unwrap_or(Value::None)
        };
        let report = DivergenceReport::new(
            "stacktrace",
            top(&difference.recorded),
            top(&difference.replayed),
            context.clone(),
        )
        .with_window(window())
        .with_stack(difference);
        Err(self.diverge(report))
    }
}
