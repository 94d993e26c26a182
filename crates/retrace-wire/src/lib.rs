//! Binary trace format for retrace.
//!
//! - [`encode`] / [`decode`]: values and control markers to and from bytes
//! - [`bind`]: identity/bind table, writer and reader halves
//! - [`header`]: trace header preamble and environment fingerprint
//! - [`tape`]: pid-stamped frames and per-process segment reading
//!
//! A trace is `[header][frame]*`; each frame carries whole messages of one
//! process segment.

pub mod bind;
pub mod decode;
pub mod encode;
pub mod header;
pub mod message;
pub mod tags;
pub mod tape;

pub use bind::{BindError, BindReader, BindWriter, ExternalResolver, Lookup, NoExternals, SharedResolver};
pub use decode::Decoder;
pub use encode::Encoder;
pub use header::{checksum_dir, checksum_file, Fingerprint, Header, ENGINE_VERSION, FORMAT_VERSION};
pub use message::{Message, MessageKind};
pub use tape::{list_pids, Positioned, SegmentReader, TapeReader, TapeWriter, MAX_FRAME};
