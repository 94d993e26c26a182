//! Deterministic thread identities.
//!
//! OS thread ids differ between runs; [`ThreadPath`]s do not. The registry
//! maps the OS id of every participating thread to its path and hands out
//! child indices in spawn order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};
use retrace_types::{Result, RetraceError, ThreadPath, TraceContext};

/// A registered thread.
#[derive(Debug)]
pub struct ThreadEntry {
    pub path: Arc<ThreadPath>,
    spawned: AtomicU32,
}

impl ThreadEntry {
    fn new(path: ThreadPath, spawned: u32) -> Arc<Self> {
        Arc::new(Self {
            path: Arc::new(path),
            spawned: AtomicU32::new(spawned),
        })
    }

    /// Children spawned so far.
    pub fn spawned(&self) -> u32 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Reserve the path of this thread's next child.
    pub fn next_child(&self) -> ThreadPath {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        self.path.child(index)
    }
}

/// OS thread → logical thread map for one session.
pub struct ThreadRegistry {
    threads: RwLock<HashMap<ThreadId, Arc<ThreadEntry>>>,
    /// Path claimed by the first unregistered thread to show up.
    adoptable: Mutex<Option<(ThreadPath, u32)>>,
}

impl ThreadRegistry {
    /// Registry whose calling thread is the root thread.
    pub fn with_current_as_root() -> Self {
        let registry = Self {
            threads: RwLock::new(HashMap::new()),
            adoptable: Mutex::new(None),
        };
        registry.register_current(ThreadPath::root());
        registry
    }

    /// Registry where the first thread to use it becomes `path`, with
    /// `spawned` children already handed out.
    ///
    /// Used for forked children, which continue on whichever thread runs
    /// them but must keep the forking thread's identity and spawn count.
    pub fn adopting(path: ThreadPath, spawned: u32) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            adoptable: Mutex::new(Some((path, spawned))),
        }
    }

    pub fn register_current(&self, path: ThreadPath) -> Arc<ThreadEntry> {
        self.insert_current(ThreadEntry::new(path, 0))
    }

    fn insert_current(&self, entry: Arc<ThreadEntry>) -> Arc<ThreadEntry> {
        self.threads
            .write()
            .insert(std::thread::current().id(), entry.clone());
        entry
    }

    pub fn unregister_current(&self) {
        self.threads.write().remove(&std::thread::current().id());
    }

    /// Entry of the calling thread.
    pub fn current(&self) -> Result<Arc<ThreadEntry>> {
        let id = std::thread::current().id();
        if let Some(entry) = self.threads.read().get(&id) {
            return Ok(entry.clone());
        }
        let adopted = self.adoptable.lock().take();
        match adopted {
            Some((path, spawned)) => Ok(self.insert_current(ThreadEntry::new(path, spawned))),
            None => Err(RetraceError::protocol(
                format!("{:?} is not registered with this session", id),
                TraceContext::default(),
            )),
        }
    }

    pub fn current_path(&self) -> Result<Arc<ThreadPath>> {
        Ok(self.current()?.path.clone())
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_children() -> Result<()> {
        let registry = Arc::new(ThreadRegistry::with_current_as_root());
        let root = registry.current()?;
        assert!(root.path.is_root());

        let first = root.next_child();
        let second = root.next_child();
        assert_eq!(first, ThreadPath::from_segments(&[0]));
        assert_eq!(second, ThreadPath::from_segments(&[1]));

        let reg = registry.clone();
        let seen = std::thread::spawn(move || {
            reg.register_current(first);
            let path = reg.current_path().map(|p| (*p).clone());
            reg.unregister_current();
            path
        })
        .join()
        .unwrap_or_else(|_| panic!("thread panicked"))?;
        assert_eq!(seen, ThreadPath::from_segments(&[0]));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_unregistered_thread_is_rejected() {
        let registry = Arc::new(ThreadRegistry::with_current_as_root());
        let reg = registry.clone();
        let outcome = std::thread::spawn(move || reg.current().map(|_| ()))
            .join()
            .unwrap_or_else(|_| panic!("thread panicked"));
        assert_eq!(outcome.unwrap_err().code(), "R200");
    }

    #[test]
    fn test_adoption_happens_once() -> Result<()> {
        let fork_thread = ThreadPath::from_segments(&[2]);
        let registry = Arc::new(ThreadRegistry::adopting(fork_thread.clone(), 3));
        let reg = registry.clone();
        let (adopted, next) = std::thread::spawn(move || {
            reg.current().map(|e| ((*e.path).clone(), e.next_child()))
        })
        .join()
        .unwrap_or_else(|_| panic!("thread panicked"))?;
        assert_eq!(adopted, fork_thread);
        // the spawn count carries over from the forking thread
        assert_eq!(next, ThreadPath::from_segments(&[2, 3]));
        // the adopting thread is gone, nobody else may claim the identity
        assert!(registry.current().is_err());
        Ok(())
    }
}
