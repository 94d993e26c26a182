//! Identity/bind table.
//!
//! The writer half maps object identity (allocation address plus a weak
//! reference to detect reuse) to dense handles. The reader half maps handles
//! back to objects. Both sides assign handles from the same monotonic
//! counter, so the reader can verify every BIND names exactly the handle it
//! expects next. Handles are never reused, even after DELETE.
//!
//! The reader's pending-bind state exists only between a BIND tag and its
//! payload:
//!
//! ```text
//!   idle --begin_bind(h)--> pending(h) --complete_bind(obj)--> idle
//! ```
//!
//! Any other transition is a protocol violation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use retrace_types::{Handle, ObjRef, WeakObjRef};

/// Bind-table protocol misuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// BIND started while another bind is still pending.
    AlreadyPending { pending: Handle, attempted: Handle },
    /// `complete_bind` with no BIND in flight.
    NotPending,
    /// A plain value read while a bind payload is expected.
    ValueWhilePending(Handle),
    /// BIND for a handle that is already live.
    Rebind(Handle),
    /// BIND out of sequence.
    UnexpectedHandle { expected: Handle, found: Handle },
    /// Reference or DELETE naming an unknown or retired handle.
    Unbound(Handle),
    /// Reference to the handle whose payload is being decoded.
    SelfReference(Handle),
    /// EXT_BIND key unknown to the resolver.
    UnknownExternal(String),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::AlreadyPending { pending, attempted } => write!(
                f,
                "bind of handle {} started while handle {} is pending",
                attempted, pending
            ),
            BindError::NotPending => write!(f, "bind completed with no bind pending"),
            BindError::ValueWhilePending(h) => {
                write!(f, "plain value read while bind of handle {} is pending", h)
            }
            BindError::Rebind(h) => write!(f, "handle {} is already bound", h),
            BindError::UnexpectedHandle { expected, found } => {
                write!(f, "expected bind of handle {}, found {}", expected, found)
            }
            BindError::Unbound(h) => write!(f, "handle {} is not bound", h),
            BindError::SelfReference(h) => {
                write!(f, "bind payload of handle {} references itself", h)
            }
            BindError::UnknownExternal(key) => write!(f, "unknown external object {:?}", key),
        }
    }
}

impl std::error::Error for BindError {}

/// Resolves EXT_BIND keys to process-global objects on the replay side.
pub trait ExternalResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<ObjRef>;
}

/// Resolver that knows no keys.
pub struct NoExternals;

impl ExternalResolver for NoExternals {
    fn resolve(&self, _key: &str) -> Option<ObjRef> {
        None
    }
}

pub type SharedResolver = Arc<dyn ExternalResolver>;

// =============================================================================
// Writer side
// =============================================================================

/// Result of looking an object up in the writer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Already bound: emit a reference.
    Bound(Handle),
    /// Newly assigned: emit BIND first. `retired` carries a handle whose
    /// object died and whose address was reused; it needs a DELETE.
    New { handle: Handle, retired: Option<Handle> },
}

#[derive(Clone)]
struct WriterEntry {
    handle: Handle,
    weak: WeakObjRef,
}

/// Writer-side identity table.
#[derive(Clone)]
pub struct BindWriter {
    entries: HashMap<usize, WriterEntry>,
    next: Handle,
    binds_since_sweep: u32,
    sweep_interval: u32,
}

impl Default for BindWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BindWriter {
    pub const DEFAULT_SWEEP_INTERVAL: u32 = 64;

    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 0,
            binds_since_sweep: 0,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: u32) -> Self {
        self.sweep_interval = interval.max(1);
        self
    }

    /// Handle of a live, already-bound object.
    pub fn handle_of(&self, obj: &ObjRef) -> Option<Handle> {
        self.entries
            .get(&obj.addr())
            .filter(|entry| !entry.weak.is_dead())
            .map(|entry| entry.handle)
    }

    /// Find the object's handle or assign the next one.
    pub fn lookup_or_assign(&mut self, obj: &ObjRef) -> Lookup {
        let addr = obj.addr();
        let mut retired = None;
        if let Some(entry) = self.entries.get(&addr) {
            if !entry.weak.is_dead() {
                return Lookup::Bound(entry.handle);
            }
            retired = Some(entry.handle);
        }
        let handle = self.next;
        self.next += 1;
        self.binds_since_sweep += 1;
        self.entries.insert(
            addr,
            WriterEntry {
                handle,
                weak: obj.downgrade(),
            },
        );
        Lookup::New { handle, retired }
    }

    /// Whether enough binds have happened since the last sweep.
    pub fn sweep_due(&self) -> bool {
        self.binds_since_sweep >= self.sweep_interval
    }

    /// Drop entries whose objects died; returns their handles in order.
    pub fn sweep(&mut self) -> Vec<Handle> {
        self.binds_since_sweep = 0;
        let mut retired: Vec<Handle> = Vec::new();
        self.entries.retain(|_, entry| {
            if entry.weak.is_dead() {
                retired.push(entry.handle);
                false
            } else {
                true
            }
        });
        retired.sort_unstable();
        retired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_handle(&self) -> Handle {
        self.next
    }
}

// =============================================================================
// Reader side
// =============================================================================

/// Reader-side handle table.
#[derive(Default)]
pub struct BindReader {
    objects: HashMap<Handle, ObjRef>,
    next: Handle,
    pending: Option<Handle>,
}

impl BindReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_bind(&mut self, handle: Handle) -> Result<(), BindError> {
        if let Some(pending) = self.pending {
            return Err(BindError::AlreadyPending {
                pending,
                attempted: handle,
            });
        }
        if self.objects.contains_key(&handle) {
            return Err(BindError::Rebind(handle));
        }
        if handle != self.next {
            return Err(BindError::UnexpectedHandle {
                expected: self.next,
                found: handle,
            });
        }
        self.pending = Some(handle);
        Ok(())
    }

    pub fn complete_bind(&mut self, object: ObjRef) -> Result<Handle, BindError> {
        let handle = self.pending.take().ok_or(BindError::NotPending)?;
        self.objects.insert(handle, object);
        self.next = handle + 1;
        Ok(handle)
    }

    /// Abandon a bind whose payload failed to decode.
    pub fn abort_bind(&mut self) {
        self.pending = None;
    }

    /// Expect `next` as the following bind handle.
    pub(crate) fn resequence(&mut self, next: Handle) {
        self.next = next;
    }

    /// Fails when a plain value is read mid-bind.
    pub fn check_not_pending(&self) -> Result<(), BindError> {
        match self.pending {
            Some(handle) => Err(BindError::ValueWhilePending(handle)),
            None => Ok(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bind an externally-identified object in one step.
    pub fn bind_external(
        &mut self,
        handle: Handle,
        key: &str,
        resolver: &dyn ExternalResolver,
    ) -> Result<ObjRef, BindError> {
        let object = resolver
            .resolve(key)
            .ok_or_else(|| BindError::UnknownExternal(key.to_string()))?;
        self.begin_bind(handle)?;
        self.complete_bind(object.clone())?;
        Ok(object)
    }

    pub fn resolve(&self, handle: Handle) -> Result<ObjRef, BindError> {
        if self.pending == Some(handle) {
            return Err(BindError::SelfReference(handle));
        }
        self.objects
            .get(&handle)
            .cloned()
            .ok_or(BindError::Unbound(handle))
    }

    pub fn delete(&mut self, handle: Handle) -> Result<(), BindError> {
        self.objects
            .remove(&handle)
            .map(|_| ())
            .ok_or(BindError::Unbound(handle))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
