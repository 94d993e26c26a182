//! Message encoder.
//!
//! The encoder owns the writer-side bind table so that every object a
//! message references is bound, in a separate BIND message, before the
//! message itself. Nested objects are bound innermost-first.

use std::collections::HashSet;
use std::ops::Range;

use retrace_types::{
    Frame, Handle, MonitorEvent, ObjRef, ObjectKind, Result, RetraceError, ThreadPath,
    TraceContext, Value,
};

use crate::bind::{BindWriter, Lookup};
use crate::message::{Message, MessageKind};
use crate::tags;
use crate::tape::MAX_FRAME;

/// Encodes messages into an in-memory byte stream.
///
/// Offsets returned by the `write*` methods are positions in the logical
/// stream: they keep increasing across [`Encoder::take`].
///
/// Cloning an encoder forks its bind table: both copies continue from the
/// same handles.
#[derive(Clone)]
pub struct Encoder {
    buf: Vec<u8>,
    taken: u64,
    binds: BindWriter,
    messages: u64,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_binds(BindWriter::new())
    }

    pub fn with_binds(binds: BindWriter) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            taken: 0,
            binds,
            messages: 0,
        }
    }

    /// Logical offset of the next byte to be written.
    pub fn offset(&self) -> u64 {
        self.taken + self.buf.len() as u64
    }

    /// Number of messages written so far, bind bookkeeping included.
    pub fn message_count(&self) -> u64 {
        self.messages
    }

    /// Bytes written but not yet taken.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn binds(&self) -> &BindWriter {
        &self.binds
    }

    /// Drain buffered bytes. Always ends on a message boundary.
    pub fn take(&mut self) -> Vec<u8> {
        self.taken += self.buf.len() as u64;
        std::mem::take(&mut self.buf)
    }

    /// Bytes `write(message)` would add, binds of objects not yet bound
    /// included. Handle retirements are not counted.
    pub fn encoded_len(&self, message: &Message) -> usize {
        let mut seen = HashSet::new();
        match message {
            Message::Value(value) => self.value_len(value, &mut seen),
            Message::Result(value) | Message::Checkpoint(value) => {
                1 + self.value_len(value, &mut seen)
            }
            Message::Sync => 1,
            Message::Error(err) => 1 + str_len(&err.kind) + str_len(&err.message),
            Message::ThreadSwitch(path) => 5 + 4 * path.depth(),
            Message::Stacktrace(frames) => {
                5 + frames
                    .iter()
                    .map(|f| str_len(&f.file) + 4 + str_len(&f.function))
                    .sum::<usize>()
            }
            Message::Monitor(event) => 6 + str_len(&event.qualname) + str_len(&event.file),
            Message::Bind { .. } | Message::ExtBind { .. } | Message::Delete(_) => 0,
        }
    }

    fn value_len(&self, value: &Value, seen: &mut HashSet<usize>) -> usize {
        match value {
            Value::None | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 9,
            Value::Str(s) => 1 + str_len(s),
            Value::Bytes(b) => 5 + b.len(),
            Value::List(items) => 5 + items.iter().map(|v| self.value_len(v, seen)).sum::<usize>(),
            Value::Map(map) => {
                5 + map
                    .iter()
                    .map(|(k, v)| self.value_len(k, seen) + self.value_len(v, seen))
                    .sum::<usize>()
            }
            Value::Object(object) => {
                if self.binds.handle_of(object).is_some() || !seen.insert(object.addr()) {
                    return 5;
                }
                // REF plus BIND tag, handle and kind
                11 + match object.kind() {
                    ObjectKind::Data(inner) => self.value_len(inner, seen),
                    ObjectKind::Proxy { type_name } => str_len(type_name),
                }
            }
        }
    }

    /// Refuse messages that could not be framed, before any byte or
    /// handle is committed.
    fn check_len(&self, kind: MessageKind, len: usize) -> Result<()> {
        if len > MAX_FRAME {
            return Err(RetraceError::protocol(
                format!("{} of {} bytes exceeds the {} byte frame limit", kind, len, MAX_FRAME),
                self.context(),
            ));
        }
        Ok(())
    }

    /// Write a bare VALUE message.
    pub fn write_value(&mut self, value: &Value) -> Result<Range<u64>> {
        let start = self.offset();
        self.check_len(MessageKind::Value, self.value_len(value, &mut HashSet::new()))?;
        self.prepare(value)?;
        self.put_value(value)?;
        self.messages += 1;
        Ok(start..self.offset())
    }

    /// Write one message, preceded by any binds it needs.
    pub fn write(&mut self, message: &Message) -> Result<Range<u64>> {
        let start = self.offset();
        if !matches!(message, Message::Value(_)) {
            self.check_len(message.kind(), self.encoded_len(message))?;
        }
        match message {
            Message::Value(value) => return self.write_value(value),
            Message::Result(value) | Message::Checkpoint(value) => {
                self.prepare(value)?;
                self.buf.push(match message {
                    Message::Result(_) => tags::RESULT,
                    _ => tags::CHECKPOINT,
                });
                self.put_value(value)?;
            }
            Message::Sync => self.buf.push(tags::SYNC),
            Message::Error(err) => {
                self.buf.push(tags::ERROR);
                self.put_str(&err.kind);
                self.put_str(&err.message);
            }
            Message::ThreadSwitch(path) => {
                self.buf.push(tags::THREAD_SWITCH);
                self.put_path(path);
            }
            Message::Stacktrace(frames) => {
                self.buf.push(tags::STACKTRACE);
                self.put_frames(frames);
            }
            Message::Monitor(event) => {
                self.buf.push(tags::MONITOR);
                self.put_monitor(event);
            }
            Message::Bind { .. } | Message::ExtBind { .. } | Message::Delete(_) => {
                return Err(RetraceError::protocol(
                    format!("{} is emitted by the bind table, not by callers", message.kind()),
                    self.context(),
                ));
            }
        }
        self.messages += 1;
        Ok(start..self.offset())
    }

    /// Bind a process-global object under an external key.
    ///
    /// Returns an empty range if the object is already bound.
    pub fn ext_bind(&mut self, object: &ObjRef, key: &str) -> Range<u64> {
        let start = self.offset();
        if let Lookup::New { handle, retired } = self.binds.lookup_or_assign(object) {
            if let Some(old) = retired {
                self.put_delete(old);
            }
            self.buf.push(tags::EXT_BIND);
            self.put_u32(handle);
            self.put_str(key);
            self.messages += 1;
        }
        start..self.offset()
    }

    /// Emit DELETE for every bound object that has died.
    pub fn collect(&mut self) -> Range<u64> {
        let start = self.offset();
        for handle in self.binds.sweep() {
            self.put_delete(handle);
        }
        start..self.offset()
    }

    fn context(&self) -> TraceContext {
        TraceContext::at(self.messages, self.offset())
    }

    fn prepare(&mut self, value: &Value) -> Result<()> {
        if self.binds.sweep_due() {
            self.collect();
        }
        self.bind_objects(value)
    }

    fn bind_objects(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::List(items) => {
                for item in items {
                    self.bind_objects(item)?;
                }
            }
            Value::Map(map) => {
                for (k, v) in map.iter() {
                    self.bind_objects(k)?;
                    self.bind_objects(v)?;
                }
            }
            Value::Object(object) => {
                if self.binds.handle_of(object).is_some() {
                    return Ok(());
                }
                if let ObjectKind::Data(inner) = object.kind() {
                    self.bind_objects(inner)?;
                }
                if let Lookup::New { handle, retired } = self.binds.lookup_or_assign(object) {
                    if let Some(old) = retired {
                        self.put_delete(old);
                    }
                    self.put_bind(handle, object)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn put_bind(&mut self, handle: Handle, object: &ObjRef) -> Result<()> {
        self.buf.push(tags::BIND);
        self.put_u32(handle);
        match object.kind() {
            ObjectKind::Data(inner) => {
                self.buf.push(tags::BIND_DATA);
                self.put_value(inner)?;
            }
            ObjectKind::Proxy { type_name } => {
                self.buf.push(tags::BIND_PROXY);
                self.put_str(type_name);
            }
        }
        self.messages += 1;
        Ok(())
    }

    fn put_delete(&mut self, handle: Handle) {
        self.buf.push(tags::DELETE);
        self.put_u32(handle);
        self.messages += 1;
    }

    fn put_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::None => self.buf.push(tags::NONE),
            Value::Bool(false) => self.buf.push(tags::FALSE),
            Value::Bool(true) => self.buf.push(tags::TRUE),
            Value::Int(i) => {
                self.buf.push(tags::INT);
                self.buf.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(x) => {
                self.buf.push(tags::FLOAT);
                self.buf.extend_from_slice(&x.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                self.buf.push(tags::STR);
                self.put_str(s);
            }
            Value::Bytes(b) => {
                self.buf.push(tags::BYTES);
                self.put_u32(b.len() as u32);
                self.buf.extend_from_slice(b);
            }
            Value::List(items) => {
                self.buf.push(tags::LIST);
                self.put_u32(items.len() as u32);
                for item in items {
                    self.put_value(item)?;
                }
            }
            Value::Map(map) => {
                self.buf.push(tags::MAP);
                self.put_u32(map.len() as u32);
                for (k, v) in map.iter() {
                    self.put_value(k)?;
                    self.put_value(v)?;
                }
            }
            Value::Object(object) => {
                let handle = self.binds.handle_of(object).ok_or_else(|| {
                    RetraceError::protocol(
                        format!("reference to unbound {}", object.type_name()),
                        self.context(),
                    )
                })?;
                self.buf.push(tags::REF);
                self.put_u32(handle);
            }
        }
        Ok(())
    }

    fn put_u32(&mut self, n: u32) {
        self.buf.extend_from_slice(&n.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn put_path(&mut self, path: &ThreadPath) {
        self.put_u32(path.depth() as u32);
        for segment in path.segments() {
            self.put_u32(*segment);
        }
    }

    fn put_frames(&mut self, frames: &[Frame]) {
        self.put_u32(frames.len() as u32);
        for frame in frames {
            self.put_str(&frame.file);
            self.put_u32(frame.line);
            self.put_str(&frame.function);
        }
    }

    fn put_monitor(&mut self, event: &MonitorEvent) {
        self.buf.push(event.kind.as_u8());
        self.put_str(&event.qualname);
        self.put_str(&event.file);
        self.put_u32(event.line);
    }
}

fn str_len(s: &str) -> usize {
    4 + s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_little_endian_ints() {
        let mut enc = Encoder::new();
        let range = enc.write_value(&Value::Int(1)).unwrap();
        assert_eq!(range, 0..9);
        assert_eq!(enc.take(), vec![tags::INT, 1, 0, 0, 0, 0, 0, 0, 0]);

        // Offsets continue across take().
        let range = enc.write(&Message::Sync).unwrap();
        assert_eq!(range, 9..10);
        assert_eq!(enc.message_count(), 2);
    }

    #[test]
    fn test_repeated_object_binds_once() {
        let shared = ObjRef::data(Value::from("payload"));
        let mut enc = Encoder::new();
        enc.write_value(&Value::Object(shared.clone())).unwrap();
        enc.write_value(&Value::Object(shared.clone())).unwrap();
        let bytes = enc.take();

        let binds = bytes.iter().filter(|b| **b == tags::BIND).count();
        assert_eq!(binds, 1);
        // BIND + first REF + second REF
        assert_eq!(enc.message_count(), 3);
        assert_eq!(bytes[0], tags::BIND);
    }

    #[test]
    fn test_callers_cannot_write_bind_family() {
        let mut enc = Encoder::new();
        let err = enc.write(&Message::Delete(0)).unwrap_err();
        assert_eq!(err.code(), "R200");
    }

    #[test]
    fn test_ext_bind_is_idempotent() {
        let stdout = ObjRef::stub("io.TextIOWrapper");
        let mut enc = Encoder::new();
        let first = enc.ext_bind(&stdout, "sys.stdout");
        let second = enc.ext_bind(&stdout, "sys.stdout");
        assert!(!first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn test_encoded_len_matches_written_bytes() {
        let shared = ObjRef::data(Value::from("payload"));
        let value = Value::List(vec![
            Value::Object(shared.clone()),
            Value::Object(shared.clone()),
            Value::Object(ObjRef::stub("socket.socket")),
            Value::Bytes(vec![1, 2, 3]),
        ]);
        let mut enc = Encoder::new();
        for message in [Message::Result(value.clone()), Message::Checkpoint(value), Message::Sync] {
            let expected = enc.encoded_len(&message);
            let range = enc.write(&message).unwrap();
            assert_eq!((range.end - range.start) as usize, expected);
        }
    }

    #[test]
    fn test_oversized_message_rejected_before_encoding() {
        let mut enc = Encoder::new();
        enc.write(&Message::Sync).unwrap();
        let huge = Value::Bytes(vec![0; MAX_FRAME + 1]);

        let err = enc.write(&Message::Result(huge.clone())).unwrap_err();
        assert_eq!(err.code(), "R200");
        assert!(err.to_string().contains("frame limit"));
        let err = enc.write_value(&Value::Object(ObjRef::data(huge))).unwrap_err();
        assert_eq!(err.code(), "R200");

        assert_eq!(enc.message_count(), 1);
        assert_eq!(enc.pending_len(), 1);
        assert!(enc.binds().is_empty());
    }
}
