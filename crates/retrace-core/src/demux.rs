//! Replay-side thread demultiplexer.
//!
//! One shared tape, many logical threads. Each thread asks for its next
//! message; the demux hands it out in recorded order:
//!
//! 1. a message already buffered for the thread is returned at once
//! 2. otherwise the cursor advances, buffering messages owned by other
//!    threads, until one owned by the requester appears
//!
//! Ownership follows THREAD_SWITCH: every message belongs to the most
//! recent switch target. SYNC messages are scheduling gates: the cursor
//! never advances past a SYNC until its owner has taken it. That is what
//! orders crossings across threads. Without it a thread whose crossing was
//! recorded later could buffer past an earlier thread's crossing and
//! resolve first.
//!
//! Only one thread reads from the tape at a time (the `advancing` flag),
//! and it reads with the state lock released. Everyone else waits on a
//! condition variable with a bounded timeout; a thread that misses its turn
//! fails with `SchedulingTimeout` carrying a snapshot of the demux state.

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use retrace_types::{
    DivergenceReport, ProcessId, Result, RetraceError, ThreadPath, TimeoutReport, TraceContext,
    Value,
};
use retrace_wire::{Message, MessageKind, Positioned, SegmentReader};
use tracing::{debug, warn};

use crate::config::TimeoutPolicy;

/// Replay input.
pub type Source = Box<dyn Read + Send>;

/// Recorded messages kept for divergence reports.
const WINDOW: usize = 12;

/// A message routed to a thread.
#[derive(Debug, Clone)]
pub struct Routed {
    pub message: Message,
    /// Carries the owning thread and process.
    pub context: TraceContext,
}

struct DemuxState {
    buffers: BTreeMap<ThreadPath, VecDeque<Routed>>,
    owner: ThreadPath,
    gate: Option<Routed>,
    advancing: bool,
    finished: bool,
    fault: Option<String>,
    pid: ProcessId,
    last_matched: Option<u64>,
    last_thread_per_segment: BTreeMap<ProcessId, ThreadPath>,
    recent: VecDeque<String>,
    progress: u64,
}

impl DemuxState {
    fn gate_owner(&self) -> Option<&ThreadPath> {
        self.gate.as_ref().and_then(|g| g.context.thread.as_ref())
    }
}

pub struct Demux {
    state: Mutex<DemuxState>,
    reader: Mutex<SegmentReader<Source>>,
    ready: Condvar,
    timeout: TimeoutPolicy,
    verbose: bool,
}

impl Demux {
    pub fn new(reader: SegmentReader<Source>, timeout: TimeoutPolicy, verbose: bool) -> Self {
        let pid = reader.pid();
        let mut last_thread_per_segment = BTreeMap::new();
        last_thread_per_segment.insert(pid, ThreadPath::root());
        Self {
            state: Mutex::new(DemuxState {
                buffers: BTreeMap::new(),
                owner: ThreadPath::root(),
                gate: None,
                advancing: false,
                finished: false,
                fault: None,
                pid,
                last_matched: None,
                last_thread_per_segment,
                recent: VecDeque::with_capacity(WINDOW),
                progress: 0,
            }),
            reader: Mutex::new(reader),
            ready: Condvar::new(),
            timeout,
            verbose,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.state.lock().pid
    }

    /// Next message owned by `thread`, blocking until its turn.
    ///
    /// `wanted` only feeds diagnostics.
    pub fn next_for(&self, thread: &ThreadPath, wanted: MessageKind) -> Result<Routed> {
        let started = Instant::now();
        let mut state = self.state.lock();
        let mut idle_since = started;
        let mut seen = state.progress;
        loop {
            if let Some(routed) = state.buffers.get_mut(thread).and_then(VecDeque::pop_front) {
                return Ok(self.deliver(&mut state, routed));
            }
            if state.gate_owner() == Some(thread) {
                if let Some(routed) = state.gate.take() {
                    return Ok(self.deliver(&mut state, routed));
                }
            }
            if let Some(fault) = &state.fault {
                return Err(RetraceError::truncated(
                    format!("tape reader failed on another thread: {}", fault),
                    TraceContext::default().with_thread(thread.clone()).with_pid(state.pid),
                ));
            }
            if state.gate.is_none() && !state.finished && !state.advancing {
                self.advance(&mut state)?;
                continue;
            }
            if state.finished && state.gate.is_none() {
                return Err(self.exhausted(&state, thread, wanted));
            }

            if state.progress != seen {
                seen = state.progress;
                if self.timeout.resets_on_progress() {
                    idle_since = Instant::now();
                }
            }
            let now = Instant::now();
            let deadline = (idle_since + self.timeout.idle()).min(started + self.timeout.max());
            if now >= deadline {
                return Err(self.timed_out(&state, thread, now - started));
            }
            self.ready.wait_for(&mut state, deadline - now);
        }
    }

    /// Read one message from the tape with the state lock released.
    fn advance(&self, state: &mut MutexGuard<'_, DemuxState>) -> Result<()> {
        state.advancing = true;
        let next = MutexGuard::unlocked(state, || self.reader.lock().next_message());
        state.advancing = false;
        state.progress += 1;
        let outcome = match next {
            Ok(Some(positioned)) => {
                self.route(state, positioned);
                Ok(())
            }
            Ok(None) => {
                state.finished = true;
                Ok(())
            }
            Err(err) => {
                state.fault = Some(err.to_string());
                Err(err)
            }
        };
        self.ready.notify_all();
        outcome
    }

    fn route(&self, state: &mut DemuxState, positioned: Positioned) {
        let Positioned { message, context } = positioned;
        let pid = context.pid.unwrap_or(state.pid);
        if let Message::ThreadSwitch(path) = &message {
            state.owner = path.clone();
        }
        let owner = state.owner.clone();
        let context = context.with_thread(owner.clone()).with_pid(pid);

        let line = format!("#{} pid {} [{}] {}", context.message_index, pid, owner, message);
        if self.verbose {
            debug!(target: "retrace::demux", "{}", line);
        }
        if state.recent.len() == WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(line);
        state.last_thread_per_segment.insert(pid, owner.clone());

        match message {
            // applied to the bind table by the decoder
            m if m.is_bind_family() => {}
            Message::ThreadSwitch(_) => {}
            Message::Sync => state.gate = Some(Routed { message, context }),
            other => state.buffers.entry(owner).or_default().push_back(Routed {
                message: other,
                context,
            }),
        }
    }

    fn deliver(&self, state: &mut DemuxState, routed: Routed) -> Routed {
        state.last_matched = Some(routed.context.message_index);
        state.progress += 1;
        self.ready.notify_all();
        routed
    }

    fn exhausted(&self, state: &DemuxState, thread: &ThreadPath, wanted: MessageKind) -> RetraceError {
        let context = TraceContext::at(state.last_matched.map_or(0, |i| i + 1), 0)
            .with_thread(thread.clone())
            .with_pid(state.pid);
        let report = DivergenceReport::new(
            "control flow",
            Value::from("end of recorded trace"),
            Value::Str(format!("{} on thread {}", wanted, thread)),
            context,
        )
        .with_window(state.recent.iter().cloned().collect());
        RetraceError::divergence(report)
    }

    fn timed_out(&self, state: &DemuxState, thread: &ThreadPath, waited: Duration) -> RetraceError {
        let report = TimeoutReport {
            thread: thread.clone(),
            pid: state.pid,
            waited,
            last_matched: state.last_matched,
            cursor_owner: Some(state.gate_owner().unwrap_or(&state.owner).clone()),
            buffered: state
                .buffers
                .iter()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(path, queue)| (path.clone(), queue.len()))
                .collect(),
            last_thread_per_segment: state
                .last_thread_per_segment
                .iter()
                .map(|(pid, path)| (*pid, path.clone()))
                .collect(),
        };
        warn!(thread = %thread, waited_ms = waited.as_millis() as u64, "scheduling timeout");
        RetraceError::SchedulingTimeout(Box::new(report))
    }

    /// Recently routed messages, oldest first.
    pub fn window(&self) -> Vec<String> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Switch to a forked child's segment, continuing as `thread`.
    pub fn follow(&self, pid: ProcessId, thread: &ThreadPath) {
        let mut state = self.state.lock();
        while state.advancing {
            self.ready.wait(&mut state);
        }
        self.reader.lock().follow(pid);
        state.buffers.clear();
        state.gate = None;
        state.finished = false;
        state.owner = thread.clone();
        state.pid = pid;
        state.last_thread_per_segment.insert(pid, thread.clone());
        state.progress += 1;
        self.ready.notify_all();
    }

    /// Stop keeping frames of a process that will not be followed.
    pub fn abandon(&self, pid: ProcessId) {
        self.reader.lock().abandon(pid);
    }

    /// Every recorded message nobody consumed, rendered for reports.
    ///
    /// Bind bookkeeping and bare thread switches do not count.
    pub fn unconsumed(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        while state.advancing {
            self.ready.wait(&mut state);
        }
        let render = |r: &Routed| {
            format!(
                "#{} [{}] {}",
                r.context.message_index,
                r.context.thread.as_ref().map(ToString::to_string).unwrap_or_default(),
                r.message
            )
        };
        let mut left: Vec<(u64, String)> = state
            .buffers
            .values()
            .flatten()
            .chain(state.gate.iter())
            .map(|r| (r.context.message_index, render(r)))
            .collect();
        if !state.finished {
            state.advancing = true;
            let rest = MutexGuard::unlocked(&mut state, || -> Result<Vec<Positioned>> {
                let mut reader = self.reader.lock();
                let mut rest = Vec::new();
                while let Some(positioned) = reader.next_message()? {
                    rest.push(positioned);
                }
                Ok(rest)
            });
            state.advancing = false;
            state.finished = true;
            self.ready.notify_all();
            let mut owner = state.owner.clone();
            for positioned in rest? {
                match &positioned.message {
                    Message::ThreadSwitch(path) => owner = path.clone(),
                    m if m.is_bind_family() => {}
                    m => left.push((
                        positioned.context.message_index,
                        format!("#{} [{}] {}", positioned.context.message_index, owner, m),
                    )),
                }
            }
        }
        left.sort_by_key(|(index, _)| *index);
        Ok(left.into_iter().map(|(_, line)| line).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryTape;
    use retrace_wire::{Encoder, Header, NoExternals, TapeReader, TapeWriter};
    use std::sync::Arc;

    fn demux_over(messages: &[Message], timeout: TimeoutPolicy) -> Demux {
        let tape = MemoryTape::new();
        let mut writer = TapeWriter::create(tape.writer(), &Header::new(1)).unwrap();
        let mut enc = Encoder::new();
        for m in messages {
            enc.write(m).unwrap();
        }
        writer.write_frame(1, &enc.take()).unwrap();
        let source: Source = Box::new(tape.reader());
        let reader = SegmentReader::new(TapeReader::open(source).unwrap(), Arc::new(NoExternals));
        Demux::new(reader, timeout, false)
    }

    fn worker() -> ThreadPath {
        ThreadPath::from_segments(&[0])
    }

    #[test]
    fn test_buffers_other_threads_results() -> Result<()> {
        let demux = demux_over(
            &[
                Message::Sync,
                Message::ThreadSwitch(worker()),
                Message::Sync,
                Message::Result(Value::Int(2)),
                Message::ThreadSwitch(ThreadPath::root()),
                Message::Result(Value::Int(1)),
            ],
            TimeoutPolicy::fixed(Duration::from_millis(200)),
        );
        let main = ThreadPath::root();

        assert_eq!(demux.next_for(&main, MessageKind::Sync)?.message, Message::Sync);
        assert_eq!(demux.next_for(&worker(), MessageKind::Sync)?.message, Message::Sync);
        // main advances past the worker's RESULT, buffering it
        let first = demux.next_for(&main, MessageKind::Result)?;
        assert_eq!(first.message, Message::Result(Value::Int(1)));
        assert_eq!(first.context.thread, Some(main));
        assert_eq!(
            demux.next_for(&worker(), MessageKind::Result)?.message,
            Message::Result(Value::Int(2))
        );
        assert!(demux.unconsumed()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_sync_gate_blocks_later_thread() -> Result<()> {
        let demux = Arc::new(demux_over(
            &[
                Message::Sync,
                Message::Result(Value::Int(1)),
                Message::ThreadSwitch(worker()),
                Message::Sync,
                Message::Result(Value::Int(2)),
            ],
            TimeoutPolicy::fixed(Duration::from_millis(100)),
        ));

        // The worker cannot pass main's SYNC on its own.
        let d = demux.clone();
        let err = std::thread::spawn(move || d.next_for(&worker(), MessageKind::Sync))
            .join()
            .unwrap_or_else(|_| panic!("worker panicked"))
            .unwrap_err();
        let report = err.timeout_report().cloned().unwrap();
        assert_eq!(report.thread, worker());
        assert_eq!(report.cursor_owner, Some(ThreadPath::root()));
        assert_eq!(report.last_matched, None);

        // Once main crosses, the worker proceeds.
        demux.next_for(&ThreadPath::root(), MessageKind::Sync)?;
        assert_eq!(demux.next_for(&worker(), MessageKind::Sync)?.message, Message::Sync);
        let left = demux.unconsumed()?;
        assert_eq!(left.len(), 2);
        assert!(left[0].contains("RESULT 1"));
        Ok(())
    }

    #[test]
    fn test_end_of_trace_is_divergence() {
        let demux = demux_over(&[Message::Sync], TimeoutPolicy::fixed(Duration::from_millis(100)));
        let main = ThreadPath::root();
        demux.next_for(&main, MessageKind::Sync).unwrap();
        let err = demux.next_for(&main, MessageKind::Result).unwrap_err();
        let report = err.divergence_report().cloned().unwrap();
        assert_eq!(report.what, "control flow");
        assert_eq!(report.expected, Value::from("end of recorded trace"));
        assert!(!report.window.is_empty());
    }
}
