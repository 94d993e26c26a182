//! Decoded trace messages.

use std::fmt;

use retrace_types::{CallError, Frame, Handle, MonitorEvent, ObjRef, ThreadPath, Value};

/// One ordered unit of the trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Bare value exchanged outside a crossing.
    Value(Value),
    /// Crossing delimiter.
    Sync,
    Result(Value),
    Error(CallError),
    /// First sighting of an object. Emitted by the bind table only.
    Bind { handle: Handle, object: ObjRef },
    /// Object identified by an external key. Emitted by the bind table only.
    ExtBind { handle: Handle, key: String },
    /// Handle retirement. Emitted by the bind table only.
    Delete(Handle),
    ThreadSwitch(ThreadPath),
    Stacktrace(Vec<Frame>),
    Checkpoint(Value),
    Monitor(MonitorEvent),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Value(_) => MessageKind::Value,
            Message::Sync => MessageKind::Sync,
            Message::Result(_) => MessageKind::Result,
            Message::Error(_) => MessageKind::Error,
            Message::Bind { .. } => MessageKind::Bind,
            Message::ExtBind { .. } => MessageKind::ExtBind,
            Message::Delete(_) => MessageKind::Delete,
            Message::ThreadSwitch(_) => MessageKind::ThreadSwitch,
            Message::Stacktrace(_) => MessageKind::Stacktrace,
            Message::Checkpoint(_) => MessageKind::Checkpoint,
            Message::Monitor(_) => MessageKind::Monitor,
        }
    }

    /// Bind-table bookkeeping, applied by the decoder and never routed to
    /// a thread.
    pub fn is_bind_family(&self) -> bool {
        matches!(
            self,
            Message::Bind { .. } | Message::ExtBind { .. } | Message::Delete(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Value,
    Sync,
    Result,
    Error,
    Bind,
    ExtBind,
    Delete,
    ThreadSwitch,
    Stacktrace,
    Checkpoint,
    Monitor,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Value => "VALUE",
            MessageKind::Sync => "SYNC",
            MessageKind::Result => "RESULT",
            MessageKind::Error => "ERROR",
            MessageKind::Bind => "BIND",
            MessageKind::ExtBind => "EXT_BIND",
            MessageKind::Delete => "DELETE",
            MessageKind::ThreadSwitch => "THREAD_SWITCH",
            MessageKind::Stacktrace => "STACKTRACE",
            MessageKind::Checkpoint => "CHECKPOINT",
            MessageKind::Monitor => "MONITOR",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.kind().name();
        match self {
            Message::Sync => write!(f, "{}", name),
            Message::Value(v) | Message::Result(v) | Message::Checkpoint(v) => {
                write!(f, "{} {}", name, v)
            }
            Message::Error(err) => write!(f, "{} {}", name, err),
            Message::Bind { handle, object } => {
                write!(f, "{} #{} {}", name, handle, Value::Object(object.clone()))
            }
            Message::ExtBind { handle, key } => write!(f, "{} #{} {:?}", name, handle, key),
            Message::Delete(handle) => write!(f, "{} #{}", name, handle),
            Message::ThreadSwitch(path) => write!(f, "{} {}", name, path),
            Message::Stacktrace(frames) => match frames.last() {
                Some(top) => write!(f, "{} {} frames, top {}", name, frames.len(), top),
                None => write!(f, "{} empty", name),
            },
            Message::Monitor(event) => write!(f, "{} {}", name, event),
        }
    }
}
