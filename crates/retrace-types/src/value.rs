//! Trace values and identity-bearing object references.
//!
//! A [`Value`] is anything that can cross the boundary between program code
//! and the outside world. Plain variants are compared structurally (floats
//! bit-for-bit, so `NaN` round-trips). [`Value::Object`] wraps an [`ObjRef`],
//! which has *identity*: the bind table keys on the allocation, not on
//! equality, so the same object serialized twice becomes one BIND and one
//! reference.
//!
//! Objects come in two kinds:
//!
//! - [`ObjectKind::Data`]: an immutable payload shared by identity
//! - [`ObjectKind::Proxy`]: an external object whose behaviour is itself
//!   interceptable (a socket, a file handle). During recording the proxy
//!   carries the live object; during replay it is a stub with the same type
//!   name and no backing.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// A live external object that can be wrapped in a proxy.
///
/// Implementors are discovered at runtime; the engine only needs the type
/// name (the capability key looked up in the policy table) and, for types
/// declared immutable, a by-value snapshot.
pub trait External: Any + Send + Sync {
    /// Capability key of this object's type (e.g. `"socket.socket"`).
    fn type_name(&self) -> &str;

    /// Snapshot used when the policy treats this type as an immutable value.
    fn snapshot(&self) -> Option<Value> {
        None
    }

    /// Upcast for downcasting back to the concrete live type.
    fn as_any(&self) -> &dyn Any;
}

/// What an object holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    /// Immutable payload shared by identity.
    Data(Value),
    /// Interceptable external object, identified by its type name.
    Proxy { type_name: String },
}

/// Heap cell behind an [`ObjRef`].
pub struct Object {
    kind: ObjectKind,
    live: Option<Box<dyn External>>,
}

impl Object {
    /// What this object holds.
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Whether a live external object backs this proxy.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("kind", &self.kind)
            .field("live", &self.live.is_some())
            .finish()
    }
}

/// Shared, identity-bearing reference to an [`Object`].
#[derive(Clone)]
pub struct ObjRef(Arc<Object>);

impl ObjRef {
    /// Immutable data shared by identity.
    pub fn data(value: Value) -> Self {
        Self(Arc::new(Object {
            kind: ObjectKind::Data(value),
            live: None,
        }))
    }

    /// Replay-side proxy stub with no live backing.
    pub fn stub(type_name: impl Into<String>) -> Self {
        Self(Arc::new(Object {
            kind: ObjectKind::Proxy {
                type_name: type_name.into(),
            },
            live: None,
        }))
    }

    /// Record-side proxy wrapping a live external object.
    pub fn live<T: External>(external: T) -> Self {
        let type_name = external.type_name().to_string();
        Self(Arc::new(Object {
            kind: ObjectKind::Proxy { type_name },
            live: Some(Box::new(external)),
        }))
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    /// Type name used as the capability key for dispatch.
    ///
    /// Data objects report `"data"`.
    pub fn type_name(&self) -> &str {
        match &self.0.kind {
            ObjectKind::Data(_) => "data",
            ObjectKind::Proxy { type_name } => type_name,
        }
    }

    pub fn is_live(&self) -> bool {
        self.0.is_live()
    }

    /// Downcast the live backing object, if any.
    pub fn live_ref<T: External>(&self) -> Option<&T> {
        self.0
            .live
            .as_deref()
            .and_then(|ext| ext.as_any().downcast_ref::<T>())
    }

    /// By-value snapshot of the live object, if it offers one.
    pub fn snapshot(&self) -> Option<Value> {
        match &self.0.kind {
            ObjectKind::Data(value) => Some(value.clone()),
            ObjectKind::Proxy { .. } => self.0.live.as_deref().and_then(|ext| ext.snapshot()),
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Allocation address, the identity key used by the bind table.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakObjRef {
        WeakObjRef(Arc::downgrade(&self.0))
    }
}

/// Same object, or structurally identical contents (a replay stub equals
/// the live proxy it stands in for).
impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.kind() == other.kind()
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            ObjectKind::Data(value) => write!(f, "ObjRef(data {:?})", value),
            ObjectKind::Proxy { type_name } => {
                write!(f, "ObjRef(proxy {}{})", type_name, if self.is_live() { ", live" } else { "" })
            }
        }
    }
}

/// Weak counterpart used by the writer-side bind table to notice retirement.
#[derive(Clone)]
pub struct WeakObjRef(Weak<Object>);

impl WeakObjRef {
    pub fn upgrade(&self) -> Option<ObjRef> {
        self.0.upgrade().map(ObjRef)
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakObjRef(dead: {})", self.is_dead())
    }
}

/// Insertion-ordered mapping with unique keys.
///
/// Order is part of the value: two maps with the same entries in a different
/// order encode to different bytes, so they compare unequal.
///
/// Keys are told apart with [`Value::same_key`]: object keys are distinct
/// unless they are the same allocation, which is what survives a trip
/// through the bind table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, rejecting the first duplicated key.
    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> std::result::Result<Self, Value> {
        let mut map = Self {
            entries: Vec::with_capacity(pairs.len()),
        };
        for (key, value) in pairs {
            if map.contains_key(&key) {
                return Err(key);
            }
            map.entries.push((key, value));
        }
        Ok(map)
    }

    /// Insert, replacing an existing key in place.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k.same_key(&key)) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.same_key(key)).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.iter().any(|(k, _)| k.same_key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn into_pairs(self) -> Vec<(Value, Value)> {
        self.entries
    }
}

/// A value crossing the program boundary.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
    Object(ObjRef),
}

impl Value {
    /// Short label for diagnostics.
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Key identity used by [`ValueMap`].
    ///
    /// Structural like `==`, except that two objects are the same key only
    /// when they are the same allocation.
    pub fn same_key(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_key(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                        ka.same_key(kb) && va.same_key(vb)
                    })
            }
            _ => self == other,
        }
    }

    /// Identity-free rendition for checkpoints.
    ///
    /// Proxies collapse to their type name and data objects to their payload,
    /// so a checkpoint never creates bind-table traffic. A map whose keys
    /// collide once normalized becomes a list of `[key, value]` pairs.
    pub fn normalized(&self) -> Value {
        match self {
            Value::List(items) => Value::List(items.iter().map(Value::normalized).collect()),
            Value::Map(map) => {
                let pairs: Vec<(Value, Value)> = map
                    .iter()
                    .map(|(k, v)| (k.normalized(), v.normalized()))
                    .collect();
                match ValueMap::from_pairs(pairs.clone()) {
                    Ok(normalized) => Value::Map(normalized),
                    Err(_) => Value::List(
                        pairs
                            .into_iter()
                            .map(|(k, v)| Value::List(vec![k, v]))
                            .collect(),
                    ),
                }
            }
            Value::Object(obj) => match obj.kind() {
                ObjectKind::Data(inner) => inner.normalized(),
                ObjectKind::Proxy { type_name } => Value::Str(format!("<{}>", type_name)),
            },
            other => other.clone(),
        }
    }

    /// Walk every object reference reachable from this value, depth-first.
    pub fn visit_objects<F: FnMut(&ObjRef)>(&self, f: &mut F) {
        match self {
            Value::List(items) => items.iter().for_each(|v| v.visit_objects(f)),
            Value::Map(map) => map.iter().for_each(|(k, v)| {
                k.visit_objects(f);
                v.visit_objects(f);
            }),
            Value::Object(obj) => {
                f(obj);
                if let ObjectKind::Data(inner) = obj.kind() {
                    inner.visit_objects(f);
                }
            }
            _ => {}
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) if b.len() <= 16 => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Object(obj) => match obj.kind() {
                ObjectKind::Data(inner) => write!(f, "&{}", inner),
                ObjectKind::Proxy { type_name } => write!(f, "<{}>", type_name),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ObjRef> for Value {
    fn from(obj: ObjRef) -> Self {
        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Socket {
        fd: i64,
    }

    impl External for Socket {
        fn type_name(&self) -> &str {
            "socket.socket"
        }

        fn snapshot(&self) -> Option<Value> {
            Some(Value::Int(self.fd))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_map_rejects_duplicate_keys() {
        let dup = ValueMap::from_pairs(vec![
            (Value::from("a"), Value::Int(1)),
            (Value::from("a"), Value::Int(2)),
        ]);
        assert_eq!(dup.unwrap_err(), Value::from("a"));

        let mut map = ValueMap::new();
        assert!(map.insert(Value::from("k"), Value::Int(1)).is_none());
        assert_eq!(map.insert(Value::from("k"), Value::Int(2)), Some(Value::Int(1)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&Value::from("k")), Some(&Value::Int(2)));
    }

    #[test]
    fn test_live_proxy_downcast_and_snapshot() {
        let obj = ObjRef::live(Socket { fd: 7 });
        assert_eq!(obj.type_name(), "socket.socket");
        assert!(obj.is_live());
        assert_eq!(obj.live_ref::<Socket>().map(|s| s.fd), Some(7));
        assert_eq!(obj.snapshot(), Some(Value::Int(7)));

        let stub = ObjRef::stub("socket.socket");
        assert!(!stub.is_live());
        assert!(stub.live_ref::<Socket>().is_none());
        // Stubs and live proxies of the same type compare equal structurally.
        assert_eq!(Value::Object(obj.clone()), Value::Object(stub.clone()));
        assert!(!obj.ptr_eq(&stub));
    }

    #[test]
    fn test_normalized_strips_identity() {
        let shared = ObjRef::data(Value::Int(3));
        let value = Value::List(vec![
            Value::Object(shared),
            Value::Object(ObjRef::stub("file")),
        ]);
        assert_eq!(
            value.normalized(),
            Value::List(vec![Value::Int(3), Value::from("<file>")])
        );
    }

    #[test]
    fn test_objref_equality_and_key_identity() {
        let a = ObjRef::data(Value::Int(1));
        let b = ObjRef::data(Value::Int(1));
        assert_eq!(a, b);
        assert_ne!(a, ObjRef::data(Value::Int(2)));
        assert_eq!(ObjRef::stub("file"), ObjRef::stub("file"));

        // equal contents, distinct allocations: two keys
        assert!(!Value::Object(a.clone()).same_key(&Value::Object(b.clone())));
        assert!(Value::Object(a.clone()).same_key(&Value::Object(a.clone())));
        let map = ValueMap::from_pairs(vec![
            (Value::Object(a.clone()), Value::from("a")),
            (Value::Object(b), Value::from("b")),
        ]);
        assert_eq!(map.map(|m| m.len()), Ok(2));
        assert!(ValueMap::from_pairs(vec![
            (Value::Object(a.clone()), Value::None),
            (Value::Object(a), Value::None),
        ])
        .is_err());
    }

    #[test]
    fn test_normalized_map_with_colliding_keys_becomes_pairs() {
        let map = ValueMap::from_pairs(vec![
            (Value::Object(ObjRef::data(Value::Int(1))), Value::from("a")),
            (Value::Int(1), Value::from("b")),
        ])
        .unwrap();
        assert_eq!(
            Value::Map(map).normalized(),
            Value::List(vec![
                Value::List(vec![Value::Int(1), Value::from("a")]),
                Value::List(vec![Value::Int(1), Value::from("b")]),
            ])
        );

        let plain = ValueMap::from_pairs(vec![(
            Value::Object(ObjRef::data(Value::from("k"))),
            Value::Int(2),
        )])
        .unwrap();
        let expected = ValueMap::from_pairs(vec![(Value::from("k"), Value::Int(2))]).unwrap();
        assert_eq!(Value::Map(plain).normalized(), Value::Map(expected));
    }

    #[test]
    fn test_weak_ref_notices_drop() {
        let obj = ObjRef::data(Value::None);
        let weak = obj.downgrade();
        assert!(!weak.is_dead());
        drop(obj);
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
    }
}
