//! Deterministic record/replay of program boundary crossings.
//!
//! The engine lives in three crates re-exported here:
//!
//! - [`types`]: values, thread paths and the error taxonomy
//! - [`wire`]: the binary trace format
//! - the session engine itself ([`Session`], [`PolicyTable`], ...)
//!
//! [`inspect`] backs the `retrace` trace-inspection binary.
//!
//! ## Example
//!
//! ```no_run
//! use retrace::{CallDescriptor, PolicyTable, RecordConfig, Session, Value};
//!
//! # fn main() -> retrace::Result<()> {
//! let file = std::fs::File::create("run.trace").map_err(|e| retrace::RetraceError::io("create", e))?;
//! let session = Session::begin_recording(file, RecordConfig::from_env(), PolicyTable::new())?;
//! let now = session
//!     .call(&CallDescriptor::new("time.time"), &mut |_: &CallDescriptor| Ok(Value::Float(1.5)))?
//!     .into_result();
//! session.finish()?;
//! # let _ = now;
//! # Ok(())
//! # }
//! ```

pub mod inspect;

pub use retrace_core::*;
pub use retrace_types::{
    CallError, DivergenceReport, External, Frame, MonitorEvent, MonitorKind, ObjRef, ProcessId,
    Result, RetraceError, ThreadPath, TimeoutReport, TraceContext, Value, ValueMap,
};

pub mod types {
    pub use retrace_types::*;
}

pub mod wire {
    pub use retrace_wire::*;
}
