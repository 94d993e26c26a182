//! Offline trace inspection.
//!
//! Listings decode frames without a live environment: externally bound
//! objects and handles bound in a parent segment show up as placeholders.

use std::io::Read;

use retrace_types::{ProcessId, Result, ThreadPath};
use retrace_wire::{Decoder, Header, Message, TapeReader};
use serde::Serialize;

/// One decoded message in a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpEntry {
    pub pid: ProcessId,
    /// Index within the process segment.
    pub index: u64,
    /// Byte offset within the process segment's payload stream.
    pub offset: u64,
    pub thread: String,
    pub kind: &'static str,
    pub message: String,
}

/// Header of a trace.
pub fn header<R: Read>(input: R) -> Result<Header> {
    Ok(TapeReader::open(input)?.header().clone())
}

/// Decode every message of one process segment (the root segment when
/// `pid` is `None`).
pub fn dump<R: Read>(input: R, pid: Option<ProcessId>) -> Result<Vec<DumpEntry>> {
    let mut tape = TapeReader::open(input)?;
    let pid = pid.unwrap_or(tape.header().root_pid);
    let mut decoder = Decoder::inspecting();
    let mut thread = ThreadPath::root();
    let mut entries = Vec::new();
    while let Some((frame_pid, payload)) = tape.next_frame()? {
        if frame_pid != pid {
            continue;
        }
        decoder.feed(&payload);
        loop {
            let (index, offset) = (decoder.message_index(), decoder.offset());
            let Some(message) = decoder.read()? else {
                break;
            };
            if let Message::ThreadSwitch(path) = &message {
                thread = path.clone();
            }
            entries.push(DumpEntry {
                pid,
                index,
                offset,
                thread: thread.to_string(),
                kind: message.kind().name(),
                message: message.to_string(),
            });
        }
    }
    Ok(entries)
}
