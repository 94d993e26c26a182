//! Record/replay engine.
//!
//! ## Recording
//!
//! [`Session::begin_recording`] writes a trace to any sink. Every crossing
//! of the program boundary goes through [`Session::call`], which consults
//! the [`PolicyTable`] and either runs the live operation and captures its
//! outcome, or lets it through untraced.
//!
//! ## Replay
//!
//! [`Session::begin_replay`] reads the trace back. Crossings are satisfied
//! from the tape; the [`demux::Demux`] hands every logical thread its own
//! messages in recorded order, and the [`detector::Detector`] turns the
//! first mismatch into a fatal `ReplayDivergence`.
//!
//! ## Forks
//!
//! Recording brackets a fork with [`Session::prepare_fork`] and
//! [`Session::resume_parent`] / [`Session::resume_child`] (or branches
//! in-process with [`Session::fork`]). Replay calls [`Session::replay_fork`]
//! at the same point and follows whichever side the [`ForkPath`] selects.

pub mod config;
pub mod demux;
pub mod detector;
pub mod fork;
pub mod policy;
pub mod runner;
pub mod session;
pub mod sink;
pub mod threads;
pub mod writer;

pub use config::{RecordConfig, ReplayConfig, StackProvider, TimeoutPolicy};
pub use detector::{Detector, DetectorState};
pub use fork::{ForkPath, ForkPathError, ForkSide, ForkToken, Stamp};
pub use policy::{
    CallDescriptor, CallResult, Directive, Dispatcher, ExternalRegistry, LiveCall, PolicyTable, Shim,
};
pub use runner::{Recording, TestRunner};
pub use session::{Outcome, Session};
pub use sink::MemoryTape;
pub use threads::ThreadRegistry;
