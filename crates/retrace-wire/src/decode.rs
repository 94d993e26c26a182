//! Message decoder.
//!
//! The decoder is fed whole frames and yields one [`Message`] per call to
//! [`Decoder::read`]. Bind-family messages are applied to the reader-side
//! bind table as they are decoded and are still returned, so listings can
//! show them; consumers that route messages simply skip them.
//!
//! Running out of bytes at a message boundary is a clean end (`Ok(None)`).
//! Running out in the middle of a message, or meeting an unknown tag, is a
//! `TruncatedTrace` error.

use std::collections::HashSet;
use std::sync::Arc;

use retrace_types::{
    CallError, Frame, Handle, MonitorEvent, MonitorKind, ObjRef, Result, RetraceError, ThreadPath,
    TraceContext, Value, ValueMap,
};

use crate::bind::{BindError, BindReader, NoExternals, SharedResolver};
use crate::message::Message;
use crate::tags;

enum Fault {
    Short(&'static str),
    Malformed(String),
    Bind(BindError),
}

impl From<BindError> for Fault {
    fn from(err: BindError) -> Self {
        Fault::Bind(err)
    }
}

type Parse<T> = std::result::Result<T, Fault>;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Parse<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return Err(Fault::Short(what));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Parse<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Parse<u32> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Parse<u64> {
        let raw = self.take(8, what)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(raw);
        Ok(u64::from_le_bytes(word))
    }

    /// Length prefix, bounded by the bytes actually present.
    fn len(&mut self, what: &'static str) -> Parse<usize> {
        let n = self.u32(what)? as usize;
        if n > self.bytes.len() - self.pos {
            return Err(Fault::Short(what));
        }
        Ok(n)
    }

    fn str(&mut self, what: &'static str) -> Parse<String> {
        let n = self.len(what)?;
        let raw = self.take(n, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Fault::Malformed(format!("{} is not utf-8", what)))
    }
}

/// Decodes one process segment's payload stream.
pub struct Decoder {
    buf: Vec<u8>,
    pos: usize,
    consumed: u64,
    binds: BindReader,
    resolver: SharedResolver,
    messages: u64,
    inspecting: bool,
    unresolved: HashSet<Handle>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Arc::new(NoExternals))
    }
}

impl Decoder {
    pub fn new(resolver: SharedResolver) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            consumed: 0,
            binds: BindReader::new(),
            resolver,
            messages: 0,
            inspecting: false,
            unresolved: HashSet::new(),
        }
    }

    /// Lenient decoder for trace listings.
    ///
    /// A segment that starts after a fork references handles bound in its
    /// parent's segment. In inspection mode such references decode to
    /// placeholder stubs and out-of-sequence binds are accepted.
    pub fn inspecting() -> Self {
        Self {
            inspecting: true,
            ..Self::default()
        }
    }

    /// Append one frame's payload.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.consumed += self.pos as u64;
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Drop bytes fed but not yet decoded.
    pub fn discard_unread(&mut self) -> usize {
        let dropped = self.buf.len() - self.pos;
        self.consumed += self.buf.len() as u64;
        self.buf.clear();
        self.pos = 0;
        dropped
    }

    pub fn has_unread(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Logical byte offset of the next message.
    pub fn offset(&self) -> u64 {
        self.consumed + self.pos as u64
    }

    /// Index of the next message.
    pub fn message_index(&self) -> u64 {
        self.messages
    }

    pub fn binds(&self) -> &BindReader {
        &self.binds
    }

    /// Handles referenced before any bind was seen (inspection mode only).
    pub fn unresolved(&self) -> usize {
        self.unresolved.len()
    }

    /// Decode the next message, or `None` at a clean end of the fed bytes.
    pub fn read(&mut self) -> Result<Option<Message>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let context = TraceContext::at(self.messages, self.offset());
        let mut cursor = Cursor {
            bytes: &self.buf,
            pos: self.pos,
        };
        let parsed = Self::parse(
            &mut cursor,
            &mut self.binds,
            self.resolver.as_ref(),
            self.inspecting,
            &mut self.unresolved,
        );
        match parsed {
            Ok(message) => {
                self.pos = cursor.pos;
                self.messages += 1;
                Ok(Some(message))
            }
            Err(fault) => {
                self.binds.abort_bind();
                Err(match fault {
                    Fault::Short(what) => {
                        RetraceError::truncated(format!("input ended inside {}", what), context)
                    }
                    Fault::Malformed(reason) => RetraceError::truncated(reason, context),
                    Fault::Bind(err) => RetraceError::protocol(err.to_string(), context),
                })
            }
        }
    }

    fn parse(
        cur: &mut Cursor<'_>,
        binds: &mut BindReader,
        resolver: &dyn crate::bind::ExternalResolver,
        inspecting: bool,
        unresolved: &mut HashSet<Handle>,
    ) -> Parse<Message> {
        let tag = cur.u8("message tag")?;
        if tags::is_value_tag(tag) {
            binds.check_not_pending()?;
            let value = Self::value_body(tag, cur, binds, inspecting, unresolved)?;
            return Ok(Message::Value(value));
        }
        let message = match tag {
            tags::SYNC => Message::Sync,
            tags::RESULT => Message::Result(Self::value(cur, binds, inspecting, unresolved)?),
            tags::CHECKPOINT => Message::Checkpoint(Self::value(cur, binds, inspecting, unresolved)?),
            tags::ERROR => {
                let kind = cur.str("error kind")?;
                let message = cur.str("error message")?;
                Message::Error(CallError { kind, message })
            }
            tags::BIND => {
                let handle = cur.u32("bind handle")?;
                if inspecting {
                    binds.abort_bind();
                    let _ = binds.delete(handle);
                    Self::force_next(binds, handle);
                }
                binds.begin_bind(handle)?;
                let object = match cur.u8("bind kind")? {
                    tags::BIND_DATA => {
                        ObjRef::data(Self::value(cur, binds, inspecting, unresolved)?)
                    }
                    tags::BIND_PROXY => ObjRef::stub(cur.str("proxy type name")?),
                    other => return Err(Fault::Malformed(format!("unknown bind kind {:#04x}", other))),
                };
                binds.complete_bind(object.clone())?;
                unresolved.remove(&handle);
                Message::Bind { handle, object }
            }
            tags::EXT_BIND => {
                let handle = cur.u32("ext bind handle")?;
                let key = cur.str("ext bind key")?;
                if inspecting {
                    let _ = binds.delete(handle);
                    Self::force_next(binds, handle);
                    let object = resolver
                        .resolve(&key)
                        .unwrap_or_else(|| ObjRef::stub(format!("extern {}", key)));
                    binds.begin_bind(handle)?;
                    binds.complete_bind(object)?;
                } else {
                    binds.bind_external(handle, &key, resolver)?;
                }
                Message::ExtBind { handle, key }
            }
            tags::DELETE => {
                let handle = cur.u32("delete handle")?;
                if let Err(err) = binds.delete(handle) {
                    if !inspecting {
                        return Err(err.into());
                    }
                }
                Message::Delete(handle)
            }
            tags::THREAD_SWITCH => {
                let depth = cur.len("thread path")?;
                let mut segments = Vec::with_capacity(depth);
                for _ in 0..depth {
                    segments.push(cur.u32("thread path segment")?);
                }
                Message::ThreadSwitch(ThreadPath::from_segments(&segments))
            }
            tags::STACKTRACE => {
                let count = cur.len("stacktrace")?;
                let mut frames = Vec::with_capacity(count);
                for _ in 0..count {
                    let file = cur.str("frame file")?;
                    let line = cur.u32("frame line")?;
                    let function = cur.str("frame function")?;
                    frames.push(Frame { file, line, function });
                }
                Message::Stacktrace(frames)
            }
            tags::MONITOR => {
                let raw = cur.u8("monitor kind")?;
                let kind = MonitorKind::from_u8(raw)
                    .ok_or_else(|| Fault::Malformed(format!("unknown monitor kind {}", raw)))?;
                let qualname = cur.str("monitor qualname")?;
                let file = cur.str("monitor file")?;
                let line = cur.u32("monitor line")?;
                Message::Monitor(MonitorEvent {
                    kind,
                    qualname,
                    file,
                    line,
                })
            }
            other => return Err(Fault::Malformed(format!("unknown message tag {:#04x}", other))),
        };
        Ok(message)
    }

    /// Re-sync the expected handle counter in inspection mode.
    fn force_next(binds: &mut BindReader, handle: Handle) {
        binds.resequence(handle);
    }

    fn value(
        cur: &mut Cursor<'_>,
        binds: &BindReader,
        inspecting: bool,
        unresolved: &mut HashSet<Handle>,
    ) -> Parse<Value> {
        let tag = cur.u8("value tag")?;
        Self::value_body(tag, cur, binds, inspecting, unresolved)
    }

    fn value_body(
        tag: u8,
        cur: &mut Cursor<'_>,
        binds: &BindReader,
        inspecting: bool,
        unresolved: &mut HashSet<Handle>,
    ) -> Parse<Value> {
        let value = match tag {
            tags::NONE => Value::None,
            tags::FALSE => Value::Bool(false),
            tags::TRUE => Value::Bool(true),
            tags::INT => Value::Int(cur.u64("int")? as i64),
            tags::FLOAT => Value::Float(f64::from_bits(cur.u64("float")?)),
            tags::STR => Value::Str(cur.str("str")?),
            tags::BYTES => {
                let n = cur.len("bytes")?;
                Value::Bytes(cur.take(n, "bytes")?.to_vec())
            }
            tags::LIST => {
                let count = cur.len("list")?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Self::value(cur, binds, inspecting, unresolved)?);
                }
                Value::List(items)
            }
            tags::MAP => {
                let count = cur.len("map")?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let k = Self::value(cur, binds, inspecting, unresolved)?;
                    let v = Self::value(cur, binds, inspecting, unresolved)?;
                    pairs.push((k, v));
                }
                let map = ValueMap::from_pairs(pairs)
                    .map_err(|key| Fault::Malformed(format!("duplicate map key {}", key)))?;
                Value::Map(map)
            }
            tags::REF => {
                let handle = cur.u32("ref handle")?;
                match binds.resolve(handle) {
                    Ok(object) => Value::Object(object),
                    Err(BindError::Unbound(h)) if inspecting => {
                        unresolved.insert(h);
                        Value::Object(ObjRef::stub(format!("#{}", h)))
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            other => return Err(Fault::Malformed(format!("unknown value tag {:#04x}", other))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Encoder;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Message>> {
        let mut dec = Decoder::default();
        dec.feed(bytes);
        let mut out = Vec::new();
        while let Some(message) = dec.read()? {
            out.push(message);
        }
        Ok(out)
    }

    #[test]
    fn test_values_decode_bit_for_bit() -> Result<()> {
        let map = ValueMap::from_pairs(vec![
            (Value::from("b"), Value::Int(-1)),
            (Value::from("a"), Value::Bytes(vec![0, 255])),
        ])
        .map_err(|_| RetraceError::truncated("dup", TraceContext::default()))?;
        let values = vec![
            Value::None,
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::Float(f64::NAN),
            Value::Float(-0.0),
            Value::from("héllo"),
            Value::List(vec![Value::Int(1), Value::List(vec![])]),
            Value::Map(map),
        ];

        let mut enc = Encoder::new();
        for v in &values {
            enc.write_value(v)?;
        }
        let decoded = decode_all(&enc.take())?;
        let expected: Vec<Message> = values.into_iter().map(Message::Value).collect();
        assert_eq!(decoded, expected);
        Ok(())
    }

    #[test]
    fn test_markers_round_trip() -> Result<()> {
        let messages = vec![
            Message::Sync,
            Message::Result(Value::Int(3)),
            Message::Error(CallError::new("OSError", "boom")),
            Message::ThreadSwitch(ThreadPath::from_segments(&[0, 1])),
            Message::Stacktrace(vec![Frame::new("a.py", 3, "f")]),
            Message::Checkpoint(Value::from("state")),
            Message::Monitor(MonitorEvent::call("mod.f", "a.py", 3)),
        ];
        let mut enc = Encoder::new();
        for m in &messages {
            enc.write(m)?;
        }
        assert_eq!(decode_all(&enc.take())?, messages);
        Ok(())
    }

    #[test]
    fn test_shared_object_decodes_to_one_identity() -> Result<()> {
        let shared = ObjRef::data(Value::List(vec![Value::Int(7)]));
        let mut enc = Encoder::new();
        enc.write(&Message::Result(Value::Object(shared.clone())))?;
        enc.write(&Message::Result(Value::Object(shared)))?;

        let decoded = decode_all(&enc.take())?;
        assert_eq!(decoded.len(), 3);
        let bound = match &decoded[0] {
            Message::Bind { handle: 0, object } => object.clone(),
            other => panic!("expected BIND #0, got {}", other),
        };
        for message in &decoded[1..] {
            match message {
                Message::Result(Value::Object(obj)) => assert!(obj.ptr_eq(&bound)),
                other => panic!("expected RESULT ref, got {}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn test_clean_end_versus_truncation() {
        let mut enc = Encoder::new();
        enc.write_value(&Value::from("abcdef")).unwrap();
        let bytes = enc.take();

        let mut dec = Decoder::default();
        dec.feed(&bytes);
        assert!(dec.read().unwrap().is_some());
        assert!(dec.read().unwrap().is_none());

        let mut dec = Decoder::default();
        dec.feed(&bytes[..bytes.len() - 2]);
        let err = dec.read().unwrap_err();
        assert_eq!(err.code(), "R100");
        assert_eq!(err.context().map(|c| c.byte_offset), Some(0));
    }

    #[test]
    fn test_unknown_tag_and_duplicate_key_are_truncation() {
        let err = decode_all(&[0x7F]).unwrap_err();
        assert_eq!(err.code(), "R100");

        // MAP with two entries keyed by NONE
        let dup = [tags::MAP, 2, 0, 0, 0, tags::NONE, tags::TRUE, tags::NONE, tags::FALSE];
        let err = decode_all(&dup).unwrap_err();
        assert!(matches!(err, RetraceError::TruncatedTrace { .. }));
    }

    #[test]
    fn test_dangling_ref_is_protocol_violation() {
        let err = decode_all(&[tags::REF, 4, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code(), "R200");

        let mut dec = Decoder::inspecting();
        dec.feed(&[tags::REF, 4, 0, 0, 0]);
        match dec.read().unwrap() {
            Some(Message::Value(Value::Object(obj))) => assert_eq!(obj.type_name(), "#4"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rebind_is_protocol_violation() {
        let bind0 = [tags::BIND, 0, 0, 0, 0, tags::BIND_DATA, tags::NONE];
        let mut bytes = bind0.to_vec();
        bytes.extend_from_slice(&bind0);
        let mut dec = Decoder::default();
        dec.feed(&bytes);
        assert!(dec.read().is_ok());
        let err = dec.read().unwrap_err();
        assert_eq!(err.code(), "R200");
        assert!(err.to_string().contains("already bound"));
    }
}
