//! Process-segment framing.
//!
//! After the header the tape is a sequence of frames:
//!
//! ```text
//! pid (u32 LE) | payload length (u32 LE) | payload
//! ```
//!
//! Every payload holds whole messages of one process segment. A forked
//! child shares the parent's sink, so frames of different processes
//! interleave; [`SegmentReader`] follows one process at a time and parks
//! frames of processes it may switch to later.
//!
//! A fork also writes a lineage record ahead of the child's first frame:
//!
//! ```text
//! child pid (u32 LE) | 0xFFFFFFFF | parent pid (u32 LE)
//! ```
//!
//! so abandoning a process abandons everything forked from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};

use retrace_types::{ProcessId, Result, RetraceError, TraceContext};
use tracing::debug;

use crate::bind::SharedResolver;
use crate::decode::Decoder;
use crate::header::Header;
use crate::message::Message;

const FRAME_HEADER: usize = 8;
/// Largest payload a frame may carry.
pub const MAX_FRAME: usize = 256 * 1024 * 1024;
/// Length field of a lineage record; never a valid payload length.
const LINEAGE: u32 = u32::MAX;

/// Writes the header and pid-stamped frames.
pub struct TapeWriter<W: Write> {
    out: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> TapeWriter<W> {
    pub fn create(mut out: W, header: &Header) -> Result<Self> {
        header.write_to(&mut out)?;
        Ok(Self {
            out,
            frames: 0,
            bytes: 0,
        })
    }

    /// Wrap a sink whose header was already written.
    pub fn resume(out: W) -> Self {
        Self {
            out,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn write_frame(&mut self, pid: ProcessId, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > MAX_FRAME {
            return Err(RetraceError::protocol(
                format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    MAX_FRAME
                ),
                TraceContext::default().with_pid(pid),
            ));
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&pid.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.out
            .write_all(&frame)
            .map_err(|e| RetraceError::io("writing trace frame", e))?;
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    /// Record that `child` was forked from `parent`.
    pub fn write_lineage(&mut self, child: ProcessId, parent: ProcessId) -> Result<()> {
        let mut record = [0u8; FRAME_HEADER + 4];
        record[..4].copy_from_slice(&child.to_le_bytes());
        record[4..8].copy_from_slice(&LINEAGE.to_le_bytes());
        record[8..].copy_from_slice(&parent.to_le_bytes());
        self.out
            .write_all(&record)
            .map_err(|e| RetraceError::io("writing trace lineage", e))?;
        self.bytes += record.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| RetraceError::io("flushing trace", e))
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads the header and frames, in file order.
pub struct TapeReader<R: Read> {
    input: R,
    header: Header,
    frames: u64,
    lineage: Vec<(ProcessId, ProcessId)>,
}

impl<R: Read> TapeReader<R> {
    pub fn open(mut input: R) -> Result<Self> {
        let header = Header::read_from(&mut input)?;
        Ok(Self {
            input,
            header,
            frames: 0,
            lineage: Vec::new(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Next frame, or `None` at a clean end between frames.
    ///
    /// Lineage records are collected on the way, see
    /// [`TapeReader::take_lineage`].
    pub fn next_frame(&mut self) -> Result<Option<(ProcessId, Vec<u8>)>> {
        loop {
            let mut fixed = [0u8; FRAME_HEADER];
            if !self.fill(&mut fixed, "frame header")? {
                return Ok(None);
            }
            let pid = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
            let len = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
            if len == LINEAGE {
                let mut parent = [0u8; 4];
                if !self.fill(&mut parent, "lineage record")? {
                    return Err(self.truncated("input ended inside lineage record"));
                }
                self.lineage.push((pid, u32::from_le_bytes(parent)));
                continue;
            }
            if len as usize > MAX_FRAME {
                return Err(self.truncated(&format!("frame of {} bytes", len)));
            }
            let mut payload = vec![0u8; len as usize];
            self.input.read_exact(&mut payload).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    self.truncated("input ended inside frame payload")
                } else {
                    RetraceError::io("reading trace frame", e)
                }
            })?;
            self.frames += 1;
            return Ok(Some((pid, payload)));
        }
    }

    /// `(child, parent)` pairs read since the last call.
    pub fn take_lineage(&mut self) -> Vec<(ProcessId, ProcessId)> {
        std::mem::take(&mut self.lineage)
    }

    /// Fill `buf`; `false` on a clean end before its first byte.
    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .input
                .read(&mut buf[filled..])
                .map_err(|e| RetraceError::io("reading trace frame", e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(self.truncated(&format!("input ended inside {}", what)));
            }
            filled += n;
        }
        Ok(true)
    }

    fn truncated(&self, reason: &str) -> RetraceError {
        RetraceError::truncated(
            format!("{} (frame {})", reason, self.frames),
            TraceContext::default(),
        )
    }
}

/// Every process id owning at least one frame, in order of first appearance.
pub fn list_pids<R: Read>(input: R) -> Result<Vec<ProcessId>> {
    let mut tape = TapeReader::open(input)?;
    let mut seen = HashSet::new();
    let mut pids = Vec::new();
    while let Some((pid, _)) = tape.next_frame()? {
        if seen.insert(pid) {
            pids.push(pid);
        }
    }
    Ok(pids)
}

/// Decoded message with its position in the followed segment.
#[derive(Debug, Clone)]
pub struct Positioned {
    pub message: Message,
    pub context: TraceContext,
}

/// Message stream of one process, switchable at fork points.
pub struct SegmentReader<R: Read> {
    tape: TapeReader<R>,
    pid: ProcessId,
    decoder: Decoder,
    parked: HashMap<ProcessId, VecDeque<Vec<u8>>>,
    abandoned: HashSet<ProcessId>,
    /// child → parent, from lineage records
    parents: HashMap<ProcessId, ProcessId>,
    exhausted: bool,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(tape: TapeReader<R>, resolver: SharedResolver) -> Self {
        let pid = tape.header().root_pid;
        Self {
            tape,
            pid,
            decoder: Decoder::new(resolver),
            parked: HashMap::new(),
            abandoned: HashSet::new(),
            parents: HashMap::new(),
            exhausted: false,
        }
    }

    pub fn header(&self) -> &Header {
        self.tape.header()
    }

    /// Process currently followed.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn message_index(&self) -> u64 {
        self.decoder.message_index()
    }

    pub fn offset(&self) -> u64 {
        self.decoder.offset()
    }

    /// Next message of the followed process, or `None` at the end of tape.
    pub fn next_message(&mut self) -> Result<Option<Positioned>> {
        loop {
            let context = TraceContext::at(self.decoder.message_index(), self.decoder.offset())
                .with_pid(self.pid);
            if let Some(message) = self.decoder.read().map_err(|e| self.with_pid(e))? {
                return Ok(Some(Positioned { message, context }));
            }
            if let Some(frame) = self.parked.get_mut(&self.pid).and_then(VecDeque::pop_front) {
                self.decoder.feed(&frame);
                continue;
            }
            if self.exhausted {
                return Ok(None);
            }
            let frame = self.tape.next_frame()?;
            self.absorb_lineage();
            match frame {
                None => self.exhausted = true,
                Some((pid, payload)) if pid == self.pid => self.decoder.feed(&payload),
                Some((pid, payload)) => {
                    if !self.abandoned.contains(&pid) {
                        self.parked.entry(pid).or_default().push_back(payload);
                    }
                }
            }
        }
    }

    /// Switch to `pid` at a fork point.
    ///
    /// Undecoded bytes of the current process are dropped, the current
    /// process is abandoned and parked frames of `pid` are decoded next. The
    /// bind table carries over: the child's segment continues from the
    /// parent's state at the fork.
    pub fn follow(&mut self, pid: ProcessId) {
        if pid == self.pid {
            return;
        }
        let dropped = self.decoder.discard_unread();
        let previous = self.pid;
        // later forks of the previous process are dropped as their
        // lineage shows up; earlier ones were already decided
        self.abandoned.insert(previous);
        self.abandoned.remove(&pid);
        self.pid = pid;
        debug!(from = previous, to = pid, dropped_bytes = dropped, "following process segment");
    }

    /// Stop parking frames of `pid` and of every process forked from it.
    pub fn abandon(&mut self, pid: ProcessId) {
        let mut pending = vec![pid];
        while let Some(pid) = pending.pop() {
            if pid == self.pid || !self.abandoned.insert(pid) {
                continue;
            }
            self.parked.remove(&pid);
            pending.extend(
                self.parents
                    .iter()
                    .filter(|(_, parent)| **parent == pid)
                    .map(|(child, _)| *child),
            );
        }
    }

    /// Number of processes with frames kept for a later switch.
    pub fn parked_processes(&self) -> usize {
        self.parked.len()
    }

    fn absorb_lineage(&mut self) {
        for (child, parent) in self.tape.take_lineage() {
            self.parents.insert(child, parent);
            if self.abandoned.contains(&parent) {
                self.abandon(child);
            }
        }
    }

    fn with_pid(&self, err: RetraceError) -> RetraceError {
        match err {
            RetraceError::TruncatedTrace { reason, context } => {
                RetraceError::TruncatedTrace {
                    reason,
                    context: context.with_pid(self.pid),
                }
            }
            RetraceError::ProtocolViolation { reason, context } => {
                RetraceError::ProtocolViolation {
                    reason,
                    context: context.with_pid(self.pid),
                }
            }
            other => other,
        }
    }
}
