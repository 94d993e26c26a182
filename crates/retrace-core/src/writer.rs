//! Record-side trace writer.
//!
//! Crossings from any number of threads append through one short-lived
//! state lock. Thread switches are detected inside the same append: the
//! writer remembers the last thread it wrote for and emits THREAD_SWITCH
//! when the appending thread differs. Thread identities are shared `Arc`s,
//! so the common single-thread case costs one pointer comparison.
//!
//! Encoded bytes are flushed as pid-stamped frames. A flush takes the sink
//! lock before releasing the state lock (lock order: state, then sink) and
//! performs the write outside the state lock, so frames reach the sink in
//! encoding order without holding the state lock across I/O.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use retrace_types::{ObjRef, ProcessId, Result, RetraceError, ThreadPath, TraceContext};
use retrace_wire::{Encoder, Message, TapeWriter, MAX_FRAME};
use tracing::{debug, trace};

use crate::fork::Stamp;

/// Sink shared by a process and any children branched from it.
pub type SharedSink = Arc<Mutex<TapeWriter<Box<dyn Write + Send>>>>;

struct WriterState {
    encoder: Encoder,
    last_thread: Option<Arc<ThreadPath>>,
    stamp: Stamp,
    /// Set between `suspend` and `resume`: no appends allowed.
    suspended: bool,
    closed: bool,
}

pub struct TraceWriter {
    state: Mutex<WriterState>,
    sink: SharedSink,
    flush_threshold: usize,
}

impl TraceWriter {
    pub fn new(sink: SharedSink, stamp: Stamp, flush_threshold: usize) -> Self {
        Self {
            state: Mutex::new(WriterState {
                encoder: Encoder::new(),
                last_thread: None,
                stamp,
                suspended: false,
                closed: false,
            }),
            sink,
            flush_threshold,
        }
    }

    pub fn stamp(&self) -> Stamp {
        self.state.lock().stamp
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Append messages for `thread`, all under one lock.
    pub fn append(&self, thread: &Arc<ThreadPath>, stamp: Stamp, messages: &[Message]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state, stamp)?;
        let switched = match &state.last_thread {
            Some(last) => !Arc::ptr_eq(last, thread) && **last != **thread,
            None => !thread.is_root(),
        };
        let switch = switched.then(|| Message::ThreadSwitch((**thread).clone()));
        state.last_thread = Some(thread.clone());
        for message in switch.iter().chain(messages) {
            let pending = state.encoder.pending_len();
            if pending > 0 && pending + state.encoder.encoded_len(message) > MAX_FRAME {
                self.drain(&mut state)?;
            }
            state.encoder.write(message)?;
        }
        trace!(thread = %thread, count = messages.len(), "appended");
        if state.encoder.pending_len() >= self.flush_threshold {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    /// Bind a process-global object by key. Thread-independent.
    pub fn ext_bind(&self, stamp: Stamp, object: &ObjRef, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state, stamp)?;
        state.encoder.ext_bind(object, key);
        Ok(())
    }

    /// Retire handles of objects that have died.
    pub fn collect(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.encoder.collect();
        }
        Ok(())
    }

    /// Push all buffered bytes to the sink.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        self.flush_locked(state)
    }

    /// Write out buffered bytes without giving up the state lock.
    fn drain(&self, state: &mut WriterState) -> Result<()> {
        let payload = state.encoder.take();
        self.sink.lock().write_frame(state.stamp.pid, &payload)
    }

    /// Announce this writer's process as forked from `parent`.
    pub fn write_lineage(&self, parent: ProcessId) -> Result<()> {
        let state = self.state.lock();
        let child = state.stamp.pid;
        let mut sink = self.sink.lock();
        drop(state);
        sink.write_lineage(child, parent)
    }

    fn flush_locked(&self, mut state: parking_lot::MutexGuard<'_, WriterState>) -> Result<()> {
        let payload = state.encoder.take();
        let pid = state.stamp.pid;
        let mut sink = self.sink.lock();
        drop(state);
        sink.write_frame(pid, &payload)?;
        sink.flush()
    }

    /// Drain and stop accepting writes until `resume`.
    pub fn suspend(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.suspended = true;
        let payload = state.encoder.take();
        let pid = state.stamp.pid;
        let mut sink = self.sink.lock();
        drop(state);
        sink.write_frame(pid, &payload)?;
        sink.flush()?;
        debug!(pid, "writer suspended for fork");
        Ok(())
    }

    /// Resume under a new stamp.
    pub fn resume(&self, stamp: Stamp) {
        let mut state = self.state.lock();
        state.stamp = stamp;
        state.suspended = false;
    }

    /// Independent writer for a forked child, continuing from this
    /// writer's encoder state.
    pub fn branch(&self, stamp: Stamp) -> Self {
        let state = self.state.lock();
        Self {
            state: Mutex::new(WriterState {
                encoder: state.encoder.clone(),
                last_thread: state.last_thread.clone(),
                stamp,
                suspended: false,
                closed: false,
            }),
            sink: self.sink.clone(),
            flush_threshold: self.flush_threshold,
        }
    }

    /// Final flush; later appends are protocol violations.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.encoder.collect();
        state.closed = true;
        self.flush_locked(state)
    }

    pub fn message_count(&self) -> u64 {
        self.state.lock().encoder.message_count()
    }

    fn check_writable(state: &WriterState, stamp: Stamp) -> Result<()> {
        let context = || {
            TraceContext::at(state.encoder.message_count(), state.encoder.offset())
                .with_pid(state.stamp.pid)
        };
        if state.closed {
            return Err(RetraceError::protocol("write after session finished", context()));
        }
        if state.suspended {
            return Err(RetraceError::protocol("write while a fork is in progress", context()));
        }
        if stamp != state.stamp {
            return Err(RetraceError::protocol(
                format!("stale write stamped {} (writer is at {})", stamp, state.stamp),
                context(),
            ));
        }
        Ok(())
    }
}
