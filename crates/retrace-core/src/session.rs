//! Record/replay session: the interception core.
//!
//! A [`Session`] is the explicit context object for one run. It owns the
//! bind tables (inside the writer or the tape reader), the thread registry,
//! the capability dispatcher and, when replaying, the demultiplexer and the
//! divergence detector. Clones share the same session.
//!
//! Every crossing is laid out on the tape as
//!
//! ```text
//!   SYNC [CHECKPOINT call] [STACKTRACE frames] (RESULT value | ERROR error)
//! ```
//!
//! Recording runs the live operation between the two appends. Replay reads
//! the same sequence for the calling thread and never runs the operation.
//!
//! Fork protocol (recording):
//!
//! ```text
//!   prepare_fork     SYNC, drain, suspend writes
//!   resume_parent    new epoch for the parent pid, RESULT(child_pid)
//!   resume_child     new epoch for the child pid,  RESULT(0)
//! ```

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use retrace_types::{
    DivergenceReport, MonitorEvent, ObjRef, ProcessId, Result, RetraceError,
    ThreadPath, TraceContext, Value, ValueMap,
};
use retrace_wire::{Header, Message, MessageKind, SegmentReader, SharedResolver, TapeReader, TapeWriter};
use tracing::{debug, info, warn};

use crate::config::{RecordConfig, ReplayConfig, StackProvider};
use crate::demux::{Demux, Routed, Source};
use crate::detector::Detector;
use crate::fork::{ForkPath, ForkSide, ForkToken, Stamp};
use crate::policy::{CallDescriptor, CallResult, Directive, Dispatcher, ExternalRegistry, LiveCall, PolicyTable};
use crate::threads::ThreadRegistry;
use crate::writer::TraceWriter;

/// What happened at a crossing.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Recording: the live operation ran and its outcome is on the tape.
    ExecutedAndCaptured(CallResult),
    /// Replay: the recorded outcome stands in for the operation.
    Substituted(CallResult),
    /// Immutable capability: ran live, nothing traced.
    Live(CallResult),
}

impl Outcome {
    pub fn result(&self) -> &CallResult {
        match self {
            Outcome::ExecutedAndCaptured(r) | Outcome::Substituted(r) | Outcome::Live(r) => r,
        }
    }

    pub fn into_result(self) -> CallResult {
        match self {
            Outcome::ExecutedAndCaptured(r) | Outcome::Substituted(r) | Outcome::Live(r) => r,
        }
    }

    pub fn is_substituted(&self) -> bool {
        matches!(self, Outcome::Substituted(_))
    }
}

struct Recorder {
    writer: TraceWriter,
    stacks: Option<Arc<dyn StackProvider>>,
}

struct Replayer {
    demux: Demux,
    detector: Detector,
    fork_path: ForkPath,
    forks: AtomicUsize,
    stacks: Option<Arc<dyn StackProvider>>,
}

enum Engine {
    Record(Recorder),
    Replay(Replayer),
}

struct SessionInner {
    engine: Engine,
    header: Header,
    dispatcher: Dispatcher,
    externals: Arc<ExternalRegistry>,
    threads: ThreadRegistry,
    finished: Mutex<bool>,
}

/// Handle to a record or replay session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start recording to `sink`. The calling thread becomes the root thread.
    pub fn begin_recording<W>(sink: W, config: RecordConfig, policy: PolicyTable) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let mut header = Header::new(config.pid);
        header.monitor_level = config.monitor_level;
        header.stacktraces = config.stacktraces;
        header.checkpoint_calls = config.checkpoint_calls;
        header.fingerprint = config.fingerprint.clone();
        header.argv = config.argv.clone();
        header.metadata = config.metadata.clone();

        let sink: Box<dyn Write + Send> = Box::new(sink);
        let tape = TapeWriter::create(sink, &header)?;
        let writer = TraceWriter::new(
            Arc::new(Mutex::new(tape)),
            Stamp::new(config.pid),
            config.flush_threshold,
        );
        info!(
            session = %header.session_id,
            pid = config.pid,
            monitor_level = header.monitor_level,
            stacktraces = header.stacktraces,
            "recording started"
        );
        let stacks = if config.stacktraces {
            config.stack_provider.clone()
        } else {
            None
        };
        Ok(Self::assemble(
            Engine::Record(Recorder { writer, stacks }),
            header,
            policy,
            Arc::new(ExternalRegistry::new()),
            ThreadRegistry::with_current_as_root(),
        ))
    }

    /// Start replaying `source`. Refuses to start when the recorded
    /// environment fingerprint differs from `config.fingerprint`.
    pub fn begin_replay<R>(source: R, config: ReplayConfig, policy: PolicyTable) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let source: Source = Box::new(source);
        let tape = TapeReader::open(source)?;
        let header = tape.header().clone();
        if let Err(err) = header.fingerprint.verify(&config.fingerprint) {
            warn!(session = %header.session_id, "environment differs from recording");
            return Err(err);
        }

        let externals = Arc::new(ExternalRegistry::new());
        let resolver: SharedResolver = externals.clone();
        let reader = SegmentReader::new(tape, resolver);
        let demux = Demux::new(reader, config.timeout, config.verbose);
        info!(
            session = %header.session_id,
            root_pid = header.root_pid,
            fork_path = %config.fork_path,
            "replay started"
        );
        Ok(Self::assemble(
            Engine::Replay(Replayer {
                demux,
                detector: Detector::new(),
                fork_path: config.fork_path,
                forks: AtomicUsize::new(0),
                stacks: config.stack_provider,
            }),
            header,
            policy,
            externals,
            ThreadRegistry::with_current_as_root(),
        ))
    }

    fn assemble(
        engine: Engine,
        header: Header,
        policy: PolicyTable,
        externals: Arc<ExternalRegistry>,
        threads: ThreadRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine,
                header,
                dispatcher: Dispatcher::new(policy),
                externals,
                threads,
                finished: Mutex::new(false),
            }),
        }
    }

    /// End the session.
    ///
    /// Recording flushes the tape. Replay fails if the run diverged or left
    /// recorded messages unconsumed.
    pub fn finish(&self) -> Result<()> {
        let mut finished = self.inner.finished.lock();
        if *finished {
            return Ok(());
        }
        *finished = true;
        match &self.inner.engine {
            Engine::Record(rec) => {
                rec.writer.close()?;
                info!(messages = rec.writer.message_count(), "recording finished");
                Ok(())
            }
            Engine::Replay(rep) => {
                rep.detector.ensure_normal()?;
                let left = rep.demux.unconsumed()?;
                if let Some(first) = left.first() {
                    let report = DivergenceReport::new(
                        "unconsumed messages",
                        Value::Str(first.clone()),
                        Value::from("session finished"),
                        TraceContext::default().with_pid(rep.demux.pid()),
                    )
                    .with_window(left.iter().take(12).cloned().collect());
                    return Err(rep.detector.diverge(report));
                }
                info!("replay finished");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn is_replaying(&self) -> bool {
        matches!(self.inner.engine, Engine::Replay(_))
    }

    pub fn header(&self) -> &Header {
        &self.inner.header
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Process segment currently written or followed.
    pub fn pid(&self) -> ProcessId {
        match &self.inner.engine {
            Engine::Record(rec) => rec.writer.stamp().pid,
            Engine::Replay(rep) => rep.demux.pid(),
        }
    }

    /// Logical identity of the calling thread.
    pub fn current_thread(&self) -> Result<ThreadPath> {
        Ok((*self.inner.threads.current_path()?).clone())
    }

    /// Replay detector state; `None` while recording.
    pub fn detector(&self) -> Option<&Detector> {
        match &self.inner.engine {
            Engine::Record(_) => None,
            Engine::Replay(rep) => Some(&rep.detector),
        }
    }

    // ========================================================================
    // Crossings
    // ========================================================================

    /// Cross the boundary according to the policy for `call`.
    pub fn call(&self, call: &CallDescriptor, live: LiveCall<'_>) -> Result<Outcome> {
        match self.inner.dispatcher.resolve(call) {
            Directive::Intercept => self.intercept(call, live),
            Directive::Immutable => Ok(Outcome::Live(live(call))),
            Directive::Bind => self.bind_call(call, live),
            Directive::Custom(name) => {
                let shim = self.inner.dispatcher.table().shim(&name).ok_or_else(|| {
                    RetraceError::protocol(
                        format!("no shim named {:?} for {}", name, call.capability),
                        TraceContext::default(),
                    )
                })?;
                let result = shim.call(self, call, live)?;
                Ok(self.outcome(result))
            }
        }
    }

    /// Execute and capture when recording, substitute when replaying.
    pub fn intercept(&self, call: &CallDescriptor, live: LiveCall<'_>) -> Result<Outcome> {
        let entry = self.inner.threads.current()?;
        match &self.inner.engine {
            Engine::Record(rec) => {
                let stamp = rec.writer.stamp();
                rec.writer
                    .append(&entry.path, stamp, &self.crossing_preamble(rec, call))?;
                let result = live(call).map(|value| self.wrap(value));
                rec.writer.append(&entry.path, stamp, &[result_message(&result)])?;
                Ok(Outcome::ExecutedAndCaptured(result))
            }
            Engine::Replay(rep) => {
                let thread = &*entry.path;
                rep.detector.ensure_normal()?;
                self.replay_preamble(rep, thread, call)?;
                let result = self.replay_result(rep, thread)?;
                Ok(Outcome::Substituted(result))
            }
        }
    }

    fn crossing_preamble(&self, rec: &Recorder, call: &CallDescriptor) -> Vec<Message> {
        let mut messages = vec![Message::Sync];
        if self.inner.header.checkpoint_calls {
            messages.push(Message::Checkpoint(call.normalized()));
        }
        if self.inner.header.stacktraces {
            let frames = rec.stacks.as_ref().map(|p| p.capture()).unwrap_or_default();
            messages.push(Message::Stacktrace(frames));
        }
        messages
    }

    fn replay_preamble(&self, rep: &Replayer, thread: &ThreadPath, call: &CallDescriptor) -> Result<()> {
        rep.expect_sync(thread)?;
        if self.inner.header.checkpoint_calls {
            let routed = rep.next(thread, MessageKind::Checkpoint)?;
            match &routed.message {
                Message::Checkpoint(recorded) => rep.detector.compare(
                    &format!("call {}", call.capability),
                    recorded,
                    &call.normalized(),
                    &routed.context,
                    || rep.demux.window(),
                )?,
                _ => return Err(rep.mismatch(thread, MessageKind::Checkpoint, routed)),
            }
        }
        if self.inner.header.stacktraces {
            let routed = rep.next(thread, MessageKind::Stacktrace)?;
            match &routed.message {
                Message::Stacktrace(recorded) => {
                    if let Some(provider) = &rep.stacks {
                        rep.detector.compare_stacks(
                            recorded,
                            &provider.capture(),
                            &routed.context,
                            || rep.demux.window(),
                        )?;
                    }
                }
                _ => return Err(rep.mismatch(thread, MessageKind::Stacktrace, routed)),
            }
        }
        Ok(())
    }

    fn replay_result(&self, rep: &Replayer, thread: &ThreadPath) -> Result<CallResult> {
        let routed = rep.next(thread, MessageKind::Result)?;
        match routed.message {
            Message::Result(value) => Ok(Ok(value)),
            Message::Error(err) => Ok(Err(err)),
            _ => Err(rep.mismatch(thread, MessageKind::Result, routed)),
        }
    }

    /// Process-global object bound by identity under the capability name.
    ///
    /// The object itself is always obtained live; the tape only records
    /// which crossing produced it.
    fn bind_call(&self, call: &CallDescriptor, live: LiveCall<'_>) -> Result<Outcome> {
        let entry = self.inner.threads.current()?;
        let result = live(call);
        match &self.inner.engine {
            Engine::Record(rec) => {
                let stamp = rec.writer.stamp();
                rec.writer.append(&entry.path, stamp, &[Message::Sync])?;
                if let Ok(value) = &result {
                    let object = bound_object(call, value)?;
                    self.inner.externals.register(call.capability.clone(), object.clone());
                    rec.writer.ext_bind(stamp, object, &call.capability)?;
                }
                rec.writer.append(&entry.path, stamp, &[result_message(&result)])?;
                Ok(Outcome::ExecutedAndCaptured(result))
            }
            Engine::Replay(rep) => {
                let thread = &*entry.path;
                rep.detector.ensure_normal()?;
                // registered before our SYNC is taken: the EXT_BIND behind it
                // cannot be decoded earlier
                if let Ok(value) = &result {
                    let object = bound_object(call, value)?;
                    self.inner.externals.register(call.capability.clone(), object.clone());
                }
                rep.expect_sync(thread)?;
                Ok(Outcome::Substituted(self.replay_result(rep, thread)?))
            }
        }
    }

    /// Make a process-global object addressable by `key` on both sides.
    pub fn register_external(&self, key: &str, object: ObjRef) -> Result<()> {
        self.inner.externals.register(key, object.clone());
        let entry = self.inner.threads.current()?;
        match &self.inner.engine {
            Engine::Record(rec) => {
                let stamp = rec.writer.stamp();
                rec.writer.append(&entry.path, stamp, &[Message::Sync])?;
                rec.writer.ext_bind(stamp, &object, key)
            }
            Engine::Replay(rep) => rep.expect_sync(&entry.path),
        }
    }

    /// Record or replay a bare value outside any crossing.
    pub fn exchange(&self, live: impl FnOnce() -> Value) -> Result<Value> {
        let entry = self.inner.threads.current()?;
        match &self.inner.engine {
            Engine::Record(rec) => {
                let value = self.wrap(live());
                rec.writer
                    .append(&entry.path, rec.writer.stamp(), &[Message::Value(value.clone())])?;
                Ok(value)
            }
            Engine::Replay(rep) => {
                rep.detector.ensure_normal()?;
                let routed = rep.next(&entry.path, MessageKind::Value)?;
                match routed.message {
                    Message::Value(value) => Ok(value),
                    _ => Err(rep.mismatch(&entry.path, MessageKind::Value, routed)),
                }
            }
        }
    }

    /// Side-channel consistency check.
    pub fn checkpoint(&self, value: &Value) -> Result<()> {
        let entry = self.inner.threads.current()?;
        let value = value.normalized();
        match &self.inner.engine {
            Engine::Record(rec) => {
                rec.writer
                    .append(&entry.path, rec.writer.stamp(), &[Message::Checkpoint(value)])
            }
            Engine::Replay(rep) => {
                rep.detector.ensure_normal()?;
                let routed = rep.next(&entry.path, MessageKind::Checkpoint)?;
                match &routed.message {
                    Message::Checkpoint(recorded) => rep.detector.compare(
                        "checkpoint",
                        recorded,
                        &value,
                        &routed.context,
                        || rep.demux.window(),
                    ),
                    _ => Err(rep.mismatch(&entry.path, MessageKind::Checkpoint, routed)),
                }
            }
        }
    }

    /// Function-boundary fingerprint, kept when the recorded monitor level
    /// covers the event kind.
    pub fn monitor(&self, event: MonitorEvent) -> Result<()> {
        if event.kind.min_level() > self.inner.header.monitor_level {
            return Ok(());
        }
        let entry = self.inner.threads.current()?;
        match &self.inner.engine {
            Engine::Record(rec) => {
                rec.writer
                    .append(&entry.path, rec.writer.stamp(), &[Message::Monitor(event)])
            }
            Engine::Replay(rep) => {
                rep.detector.ensure_normal()?;
                let routed = rep.next(&entry.path, MessageKind::Monitor)?;
                match &routed.message {
                    Message::Monitor(recorded) => rep.detector.compare_monitor(
                        recorded,
                        &event,
                        &routed.context,
                        || rep.demux.window(),
                    ),
                    _ => Err(rep.mismatch(&entry.path, MessageKind::Monitor, routed)),
                }
            }
        }
    }

    /// Replace live objects of immutable types by their snapshots. Other
    /// live objects stay proxies, so calls through them cross again.
    ///
    /// Map keys keep their proxies when their snapshots would collide.
    fn wrap(&self, value: Value) -> Value {
        match value {
            Value::List(items) => Value::List(items.into_iter().map(|v| self.wrap(v)).collect()),
            Value::Map(map) => {
                let pairs: Vec<(Value, Value)> = map
                    .into_pairs()
                    .into_iter()
                    .map(|(k, v)| (k, self.wrap(v)))
                    .collect();
                let snapshotted = pairs
                    .iter()
                    .map(|(k, v)| (self.wrap(k.clone()), v.clone()))
                    .collect();
                match ValueMap::from_pairs(snapshotted) {
                    Ok(wrapped) => Value::Map(wrapped),
                    Err(_) => Value::Map(ValueMap::from_pairs(pairs).unwrap_or_default()),
                }
            }
            Value::Object(object)
                if object.is_live()
                    && self.inner.dispatcher.resolve_type(object.type_name()) == Directive::Immutable =>
            {
                match object.snapshot() {
                    Some(snapshot) => snapshot,
                    None => Value::Object(object),
                }
            }
            other => other,
        }
    }

    fn outcome(&self, result: CallResult) -> Outcome {
        match self.inner.engine {
            Engine::Record(_) => Outcome::ExecutedAndCaptured(result),
            Engine::Replay(_) => Outcome::Substituted(result),
        }
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Spawn a thread that participates in the session.
    ///
    /// The child's path is reserved on the calling thread, so identities
    /// follow spawn order rather than OS scheduling.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(Session) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.inner.threads.current()?.next_child();
        let session = self.clone();
        debug!(thread = %path, "spawning session thread");
        std::thread::Builder::new()
            .name(format!("retrace-{}", path))
            .spawn(move || {
                session.inner.threads.register_current(path);
                let out = f(session.clone());
                session.inner.threads.unregister_current();
                out
            })
            .map_err(|e| RetraceError::io("spawning session thread", e))
    }

    // ========================================================================
    // Forks
    // ========================================================================

    /// Recording: mark the fork point and drain the writer. No thread may
    /// write until one of the resume calls.
    pub fn prepare_fork(&self) -> Result<ForkToken> {
        let rec = self.recorder("prepare_fork")?;
        let entry = self.inner.threads.current()?;
        let stamp = rec.writer.stamp();
        // dead handles retire once, ahead of the fork, not on both branches
        rec.writer.collect()?;
        rec.writer.append(&entry.path, stamp, &[Message::Sync])?;
        rec.writer.suspend()?;
        debug!(pid = stamp.pid, thread = %entry.path, "fork prepared");
        Ok(ForkToken {
            stamp,
            thread: (*entry.path).clone(),
            spawned: entry.spawned(),
        })
    }

    /// Recording, parent side of a fork.
    pub fn resume_parent(&self, token: ForkToken, child_pid: ProcessId) -> Result<()> {
        let rec = self.recorder("resume_parent")?;
        let stamp = token.stamp.after_fork(token.stamp.pid);
        rec.writer.resume(stamp);
        let thread = self.inner.threads.current_path()?;
        rec.writer
            .append(&thread, stamp, &[Message::Result(Value::Int(child_pid as i64))])?;
        rec.writer.flush()?;
        info!(pid = stamp.pid, child_pid, "fork recorded (parent)");
        Ok(())
    }

    /// Recording, child side of a fork (in the child process).
    pub fn resume_child(&self, token: ForkToken, child_pid: ProcessId) -> Result<()> {
        let rec = self.recorder("resume_child")?;
        let stamp = token.stamp.after_fork(child_pid);
        rec.writer.resume(stamp);
        rec.writer.write_lineage(token.stamp.pid)?;
        let thread = self.inner.threads.current_path()?;
        rec.writer
            .append(&thread, stamp, &[Message::Result(Value::Int(0))])?;
        info!(pid = child_pid, parent_pid = token.stamp.pid, "fork recorded (child)");
        Ok(())
    }

    /// Recording: branch the session in-process.
    ///
    /// This session continues as the parent. The returned session is the
    /// child: it writes its own segment stamped `child_pid` to the same sink
    /// and keeps the forking thread's identity on whichever thread first
    /// uses it.
    pub fn fork(&self, child_pid: ProcessId) -> Result<Session> {
        let token = self.prepare_fork()?;
        let rec = self.recorder("fork")?;
        let child_stamp = token.stamp.after_fork(child_pid);
        let child_writer = rec.writer.branch(child_stamp);
        child_writer.write_lineage(token.stamp.pid)?;
        child_writer.append(
            &Arc::new(token.thread.clone()),
            child_stamp,
            &[Message::Result(Value::Int(0))],
        )?;
        let child = Self::assemble(
            Engine::Record(Recorder {
                writer: child_writer,
                stacks: rec.stacks.clone(),
            }),
            self.inner.header.clone(),
            self.inner.dispatcher.table().clone(),
            Arc::new(self.inner.externals.snapshot()),
            ThreadRegistry::adopting(token.thread.clone(), token.spawned),
        );
        self.resume_parent(token, child_pid)?;
        Ok(child)
    }

    /// Replay a fork point, following the branch the fork path selects.
    pub fn replay_fork(&self) -> Result<ForkSide> {
        let rep = match &self.inner.engine {
            Engine::Replay(rep) => rep,
            Engine::Record(_) => {
                return Err(RetraceError::protocol(
                    "replay_fork on a recording session",
                    TraceContext::default(),
                ))
            }
        };
        let entry = self.inner.threads.current()?;
        let thread = &*entry.path;
        rep.detector.ensure_normal()?;
        rep.expect_sync(thread)?;

        let routed = rep.next(thread, MessageKind::Result)?;
        let child_pid = match &routed.message {
            Message::Result(Value::Int(pid)) if *pid > 0 => *pid as ProcessId,
            _ => return Err(rep.mismatch(thread, MessageKind::Result, routed)),
        };
        let index = rep.forks.fetch_add(1, Ordering::SeqCst);
        if !rep.fork_path.follows_child(index) {
            rep.demux.abandon(child_pid);
            debug!(fork = index, child_pid, "following parent");
            return Ok(ForkSide::Parent { child_pid });
        }

        rep.demux.follow(child_pid, thread);
        let routed = rep.next(thread, MessageKind::Result)?;
        match &routed.message {
            Message::Result(Value::Int(0)) => {}
            _ => return Err(rep.mismatch(thread, MessageKind::Result, routed)),
        }
        info!(fork = index, pid = child_pid, "following child");
        Ok(ForkSide::Child { pid: child_pid })
    }

    fn recorder(&self, operation: &str) -> Result<&Recorder> {
        match &self.inner.engine {
            Engine::Record(rec) => Ok(rec),
            Engine::Replay(_) => Err(RetraceError::protocol(
                format!("{} on a replay session", operation),
                TraceContext::default(),
            )),
        }
    }
}

impl Replayer {
    fn next(&self, thread: &ThreadPath, wanted: MessageKind) -> Result<Routed> {
        self.demux.next_for(thread, wanted).map_err(|err| match err {
            RetraceError::ReplayDivergence(report) => self.detector.diverge(*report),
            other => other,
        })
    }

    fn expect_sync(&self, thread: &ThreadPath) -> Result<()> {
        let routed = self.next(thread, MessageKind::Sync)?;
        match routed.message {
            Message::Sync => Ok(()),
            _ => Err(self.mismatch(thread, MessageKind::Sync, routed)),
        }
    }

    /// The live run asked for a different message than the one recorded.
    fn mismatch(&self, thread: &ThreadPath, wanted: MessageKind, routed: Routed) -> RetraceError {
        let report = DivergenceReport::new(
            "control flow",
            Value::Str(routed.message.to_string()),
            Value::Str(format!("{} on thread {}", wanted, thread)),
            routed.context,
        )
        .with_window(self.demux.window());
        self.detector.diverge(report)
    }
}

fn result_message(result: &CallResult) -> Message {
    match result {
        Ok(value) => Message::Result(value.clone()),
        Err(err) => Message::Error(err.clone()),
    }
}

fn bound_object<'a>(call: &CallDescriptor, value: &'a Value) -> Result<&'a ObjRef> {
    value.as_object().ok_or_else(|| {
        RetraceError::protocol(
            format!(
                "bind capability {} returned a {}, not an object",
                call.capability,
                value.type_label()
            ),
            TraceContext::default(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutPolicy;
    use crate::sink::MemoryTape;
    use crate::policy::Shim;
    use retrace_types::{CallError, External, MonitorKind};
    use retrace_wire::{BindWriter, Decoder};
    use std::any::Any;
    use std::time::Duration;

    fn replay_config() -> ReplayConfig {
        ReplayConfig::new().with_timeout(TimeoutPolicy::fixed(Duration::from_millis(500)))
    }

    fn no_live(_: &CallDescriptor) -> CallResult {
        panic!("live operation ran during replay")
    }

    fn record(tape: &MemoryTape, config: RecordConfig, policy: PolicyTable) -> Result<Session> {
        Session::begin_recording(tape.writer(), config.with_pid(100), policy)
    }

    fn replay(tape: &MemoryTape, config: ReplayConfig, policy: PolicyTable) -> Result<Session> {
        Session::begin_replay(tape.reader(), config, policy)
    }

    struct Socket;

    impl External for Socket {
        fn type_name(&self) -> &str {
            "socket.socket"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Delta(i64);

    impl External for Delta {
        fn type_name(&self) -> &str {
            "datetime.timedelta"
        }

        fn snapshot(&self) -> Option<Value> {
            Some(Value::Int(self.0))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_errors_are_recorded_and_reraised() -> Result<()> {
        let tape = MemoryTape::new();
        let call = CallDescriptor::new("os.stat").arg("/missing");
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        let outcome = session.intercept(&call, &mut |_: &CallDescriptor| {
            Err(CallError::new("FileNotFoundError", "/missing"))
        })?;
        assert!(matches!(outcome, Outcome::ExecutedAndCaptured(Err(_))));
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        let outcome = session.intercept(&call, &mut no_live)?;
        assert_eq!(
            outcome,
            Outcome::Substituted(Err(CallError::new("FileNotFoundError", "/missing")))
        );
        session.finish()
    }

    #[test]
    fn test_transitive_wrapping() -> Result<()> {
        let tape = MemoryTape::new();
        let policy = PolicyTable::new().with("datetime.timedelta", Directive::Immutable);
        let open = CallDescriptor::new("socket.create_connection");

        let session = record(&tape, RecordConfig::new(), policy.clone())?;
        let sock = session
            .call(&open, &mut |_: &CallDescriptor| Ok(Value::Object(ObjRef::live(Socket))))?
            .into_result()
            .unwrap();
        let elapsed = session
            .call(&CallDescriptor::new("time.elapsed"), &mut |_: &CallDescriptor| {
                Ok(Value::Object(ObjRef::live(Delta(5))))
            })?
            .into_result()
            .unwrap();
        // immutable types leave the crossing by value
        assert_eq!(elapsed, Value::Int(5));

        let recv = CallDescriptor::method(sock.as_object().unwrap(), "recv").arg(1024i64);
        session.call(&recv, &mut |_: &CallDescriptor| Ok(Value::Bytes(b"pong".to_vec())))?;
        session.finish()?;

        let session = replay(&tape, replay_config(), policy)?;
        let stub = session
            .call(&open, &mut no_live)?
            .into_result()
            .unwrap();
        let stub = stub.as_object().unwrap().clone();
        assert_eq!(stub.type_name(), "socket.socket");
        assert!(!stub.is_live());
        session.call(&CallDescriptor::new("time.elapsed"), &mut no_live)?;

        // a method call through the stub crosses again and is substituted
        let outcome = session.call(
            &CallDescriptor::method(&stub, "recv").arg(1024i64),
            &mut no_live,
        )?;
        assert_eq!(outcome, Outcome::Substituted(Ok(Value::Bytes(b"pong".to_vec()))));
        session.finish()
    }

    #[test]
    fn test_immutable_calls_are_not_traced() -> Result<()> {
        let tape = MemoryTape::new();
        let policy = PolicyTable::new().with("math.sqrt", Directive::Immutable);
        let session = record(&tape, RecordConfig::new(), policy.clone())?;
        let outcome = session.call(&CallDescriptor::new("math.sqrt").arg(4i64), &mut |_: &CallDescriptor| {
            Ok(Value::Float(2.0))
        })?;
        assert_eq!(outcome, Outcome::Live(Ok(Value::Float(2.0))));
        session.finish()?;

        // nothing to consume on replay; the live call runs again
        let session = replay(&tape, replay_config(), policy)?;
        let outcome = session.call(&CallDescriptor::new("math.sqrt").arg(4i64), &mut |_: &CallDescriptor| {
            Ok(Value::Float(2.0))
        })?;
        assert!(!outcome.is_substituted());
        session.finish()
    }

    #[test]
    fn test_bind_directive_resolves_live_global() -> Result<()> {
        let tape = MemoryTape::new();
        let policy = PolicyTable::new().with("sys.stdout", Directive::Bind);
        let get = CallDescriptor::new("sys.stdout");

        let session = record(&tape, RecordConfig::new(), policy.clone())?;
        let stdout = ObjRef::live(Socket);
        let returned = session.call(&get, &mut |_: &CallDescriptor| Ok(Value::Object(stdout.clone())))?;
        assert_eq!(returned, Outcome::ExecutedAndCaptured(Ok(Value::Object(stdout.clone()))));
        session.finish()?;

        let session = replay(&tape, replay_config(), policy)?;
        let replay_stdout = ObjRef::live(Socket);
        let outcome = session.call(&get, &mut |_: &CallDescriptor| Ok(Value::Object(replay_stdout.clone())))?;
        let object = outcome.into_result().unwrap();
        assert!(object.as_object().unwrap().ptr_eq(&replay_stdout));
        session.finish()
    }

    #[test]
    fn test_monitor_level_gates_events() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new().with_monitor_level(1), PolicyTable::new())?;
        session.monitor(MonitorEvent::call("app.main", "app.py", 1))?;
        session.monitor(MonitorEvent::call("app.main", "app.py", 2).with_kind(MonitorKind::Line))?;
        session.monitor(MonitorEvent::ret("app.main", "app.py", 9))?;
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        assert_eq!(session.header().monitor_level, 1);
        session.monitor(MonitorEvent::call("app.main", "app.py", 1))?;
        session.monitor(MonitorEvent::call("app.main", "app.py", 2).with_kind(MonitorKind::Line))?;
        let err = session
            .monitor(MonitorEvent::ret("app.helper", "app.py", 9))
            .unwrap_err();
        assert_eq!(
            err.divergence_report().unwrap().what,
            "monitor at return boundary of app.helper"
        );
        Ok(())
    }

    #[test]
    fn test_call_checkpoints_catch_changed_arguments() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new().with_checkpoint_calls(true), PolicyTable::new())?;
        session.intercept(&CallDescriptor::new("net.get").arg("/a"), &mut |_: &CallDescriptor| {
            Ok(Value::None)
        })?;
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        let err = session
            .intercept(&CallDescriptor::new("net.get").arg("/b"), &mut |_: &CallDescriptor| {
                Ok(Value::None)
            })
            .unwrap_err();
        let report = err.divergence_report().unwrap();
        assert_eq!(report.what, "call net.get");
        assert_eq!(
            report.expected,
            Value::List(vec![Value::from("net.get"), Value::from("/a")])
        );
        // the session stays diverged
        assert!(session.finish().is_err());
        Ok(())
    }

    #[test]
    fn test_exchange_and_unconsumed_messages() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        assert_eq!(session.exchange(|| Value::from("HOME=/root"))?, Value::from("HOME=/root"));
        session.checkpoint(&Value::Int(1))?;
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        assert_eq!(
            session.exchange(|| panic!("live value requested"))?,
            Value::from("HOME=/root")
        );
        let err = session.finish().unwrap_err();
        let report = err.divergence_report().unwrap();
        assert_eq!(report.what, "unconsumed messages");
        assert!(report.window[0].contains("CHECKPOINT"));
        Ok(())
    }

    #[test]
    fn test_replay_only_operations_rejected_when_recording() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        assert_eq!(session.replay_fork().unwrap_err().code(), "R200");
        assert!(!session.is_replaying());
        assert!(session.detector().is_none());
        Ok(())
    }

    struct Doubling;

    impl Shim for Doubling {
        fn call(&self, session: &Session, call: &CallDescriptor, live: LiveCall<'_>) -> Result<CallResult> {
            let result = session.intercept(call, live)?.into_result();
            Ok(result.map(|value| match value {
                Value::Int(i) => Value::Int(i * 2),
                other => other,
            }))
        }
    }

    #[test]
    fn test_custom_directive_runs_named_shim() -> Result<()> {
        let tape = MemoryTape::new();
        let roll = CallDescriptor::new("random.roll");
        let policy = PolicyTable::new()
            .with("random.roll", Directive::Custom("doubling".to_string()))
            .with_shim("doubling", Arc::new(Doubling));

        let session = record(&tape, RecordConfig::new(), policy.clone())?;
        let outcome = session.call(&roll, &mut |_: &CallDescriptor| Ok(Value::Int(3)))?;
        assert_eq!(outcome, Outcome::ExecutedAndCaptured(Ok(Value::Int(6))));
        session.finish()?;

        let session = replay(&tape, replay_config(), policy)?;
        let outcome = session.call(&roll, &mut no_live)?;
        assert_eq!(outcome, Outcome::Substituted(Ok(Value::Int(6))));
        session.finish()?;

        let missing = PolicyTable::new().with("random.roll", Directive::Custom("absent".to_string()));
        let session = record(&MemoryTape::new(), RecordConfig::new(), missing)?;
        let err = session.call(&roll, &mut |_: &CallDescriptor| Ok(Value::Int(3))).unwrap_err();
        assert_eq!(err.code(), "R200");
        assert!(err.to_string().contains("no shim named \"absent\""));
        Ok(())
    }

    #[test]
    fn test_registered_external_resolves_to_replay_object() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        let stdout = ObjRef::live(Socket);
        session.register_external("sys.stdout", stdout.clone())?;
        let seen = session.exchange(|| Value::Object(stdout.clone()))?;
        assert!(seen.as_object().unwrap().ptr_eq(&stdout));
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        let replay_stdout = ObjRef::live(Socket);
        session.register_external("sys.stdout", replay_stdout.clone())?;
        let seen = session.exchange(|| panic!("live value requested"))?;
        assert!(seen.as_object().unwrap().ptr_eq(&replay_stdout));
        session.finish()
    }

    #[test]
    fn test_prepare_and_resume_parent_without_branching() -> Result<()> {
        let tape = MemoryTape::new();
        let now = CallDescriptor::new("time.time");
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        session.intercept(&now, &mut |_: &CallDescriptor| Ok(Value::Float(1.0)))?;
        let token = session.prepare_fork()?;
        let err = session
            .intercept(&now, &mut |_: &CallDescriptor| Ok(Value::Float(1.5)))
            .unwrap_err();
        assert!(err.to_string().contains("fork is in progress"));
        session.resume_parent(token, 7)?;
        session.intercept(&now, &mut |_: &CallDescriptor| Ok(Value::Float(2.0)))?;
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        assert_eq!(session.intercept(&now, &mut no_live)?.into_result(), Ok(Value::Float(1.0)));
        assert_eq!(session.replay_fork()?, ForkSide::Parent { child_pid: 7 });
        assert_eq!(session.intercept(&now, &mut no_live)?.into_result(), Ok(Value::Float(2.0)));
        session.finish()
    }

    #[test]
    fn test_resume_child_restamps_the_segment() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        let token = session.prepare_fork()?;
        session.resume_child(token, 101)?;
        assert_eq!(session.pid(), 101);
        session.exchange(|| Value::from("child"))?;
        session.finish()?;

        let mut reader = TapeReader::open(tape.reader())?;
        let mut decoder = Decoder::default();
        let mut frames = Vec::new();
        while let Some((pid, payload)) = reader.next_frame()? {
            decoder.feed(&payload);
            while let Some(message) = decoder.read()? {
                frames.push((pid, message));
            }
        }
        assert_eq!(reader.take_lineage(), vec![(101, 100)]);
        assert_eq!(
            frames,
            vec![
                (100, Message::Sync),
                (101, Message::Result(Value::Int(0))),
                (101, Message::Value(Value::from("child"))),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_sweep_at_fork_replays_on_both_branches() -> Result<()> {
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        let kept = ObjRef::data(Value::from("kept"));
        session.exchange(|| Value::Object(kept.clone()))?;
        // enough short-lived binds to make a sweep due at the fork
        for i in 1..BindWriter::DEFAULT_SWEEP_INTERVAL {
            session.exchange(|| Value::Object(ObjRef::data(Value::Int(i64::from(i)))))?;
        }
        let child = session.fork(101)?;
        let fresh = ObjRef::data(Value::from("child object"));
        child.exchange(|| Value::Object(fresh.clone()))?;
        child.exchange(|| Value::Object(kept.clone()))?;
        child.finish()?;
        let parent_object = ObjRef::data(Value::from("parent object"));
        session.exchange(|| Value::Object(parent_object.clone()))?;
        session.finish()?;

        let mut reader = TapeReader::open(tape.reader())?;
        let mut decoder = Decoder::default();
        let mut deletes = 0;
        while let Some((_, payload)) = reader.next_frame()? {
            decoder.feed(&payload);
            while let Some(message) = decoder.read()? {
                if matches!(message, Message::Delete(_)) {
                    deletes += 1;
                }
            }
        }
        assert_eq!(deletes, BindWriter::DEFAULT_SWEEP_INTERVAL - 1);

        for follow_child in [true, false] {
            let path = if follow_child { ForkPath::AlwaysChild } else { ForkPath::AlwaysParent };
            let session = replay(&tape, replay_config().with_fork_path(path), PolicyTable::new())?;
            let kept = session.exchange(|| panic!("live value requested"))?;
            for i in 1..BindWriter::DEFAULT_SWEEP_INTERVAL {
                let temp = session.exchange(|| panic!("live value requested"))?;
                assert_eq!(temp.as_object().unwrap().snapshot(), Some(Value::Int(i64::from(i))));
            }
            session.replay_fork()?;
            let fresh = session.exchange(|| panic!("live value requested"))?;
            if follow_child {
                // bound right after the branch switch
                assert_eq!(fresh.as_object().unwrap().snapshot(), Some(Value::from("child object")));
                let again = session.exchange(|| panic!("live value requested"))?;
                assert!(again.as_object().unwrap().ptr_eq(kept.as_object().unwrap()));
            } else {
                assert_eq!(fresh.as_object().unwrap().snapshot(), Some(Value::from("parent object")));
            }
            session.finish()?;
        }
        Ok(())
    }

    #[test]
    fn test_checkpoint_with_keys_colliding_after_normalization() -> Result<()> {
        let keys = || {
            Value::Map(
                ValueMap::from_pairs(vec![
                    (Value::Object(ObjRef::data(Value::Int(1))), Value::from("a")),
                    (Value::Int(1), Value::from("b")),
                ])
                .unwrap(),
            )
        };
        let tape = MemoryTape::new();
        let session = record(&tape, RecordConfig::new(), PolicyTable::new())?;
        session.checkpoint(&keys())?;
        session.finish()?;

        let session = replay(&tape, replay_config(), PolicyTable::new())?;
        session.checkpoint(&keys())?;
        session.finish()
    }

    #[test]
    fn test_wrapped_map_keeps_colliding_key_proxies() -> Result<()> {
        let tape = MemoryTape::new();
        let policy = PolicyTable::new().with("datetime.timedelta", Directive::Immutable);
        let durations = CallDescriptor::new("stats.durations");
        let session = record(&tape, RecordConfig::new(), policy.clone())?;
        let result = session
            .intercept(&durations, &mut |_: &CallDescriptor| {
                let pairs = vec![
                    (Value::Object(ObjRef::live(Delta(1))), Value::from("a")),
                    (Value::Int(1), Value::from("b")),
                ];
                Ok(Value::Map(ValueMap::from_pairs(pairs).unwrap()))
            })?
            .into_result()
            .unwrap();
        session.finish()?;
        match result {
            Value::Map(map) => {
                assert_eq!(map.len(), 2);
                assert_eq!(map.get(&Value::Int(1)), Some(&Value::from("b")));
            }
            other => panic!("unexpected {}", other),
        }

        let session = replay(&tape, replay_config(), policy)?;
        match session.intercept(&durations, &mut no_live)?.into_result().unwrap() {
            Value::Map(map) => assert_eq!(map.len(), 2),
            other => panic!("unexpected {}", other),
        }
        session.finish()
    }
}
