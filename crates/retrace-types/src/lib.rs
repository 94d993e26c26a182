//! Shared types for the retrace workspace.
//!
//! This crate holds the vocabulary every other crate speaks, breaking the
//! dependency chain between the wire codec and the replay engine:
//!
//! - [`value`]: trace values and identity-bearing object references
//! - [`thread`]: hierarchical thread paths, handles and process ids
//! - [`event`]: stack frames, monitor events and recorded call failures
//! - [`error`]: the engine's fatal error taxonomy
//! - [`env_utils`]: typed `RETRACE_*` environment parsing

pub mod env_utils;
pub mod error;
pub mod event;
pub mod thread;
pub mod value;

pub use error::{
    DivergenceReport, Result, RetraceError, StackDifference, TimeoutReport, TraceContext,
};
pub use event::{CallError, Frame, MonitorEvent, MonitorKind};
pub use thread::{Handle, ProcessId, ThreadPath};
pub use value::{External, ObjRef, Object, ObjectKind, Value, ValueMap, WeakObjRef};
