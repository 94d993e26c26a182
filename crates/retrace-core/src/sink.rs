//! In-memory trace storage.

use std::io::{Cursor, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Growable byte buffer usable as a recording sink and a replay source.
///
/// Clones share the same bytes, so a recording written through one handle
/// can be replayed through another.
#[derive(Clone, Default)]
pub struct MemoryTape {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryTape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Appending writer over the shared buffer.
    pub fn writer(&self) -> MemoryTapeWriter {
        MemoryTapeWriter {
            bytes: self.bytes.clone(),
        }
    }

    /// Reader over a snapshot of the current contents.
    pub fn reader(&self) -> Cursor<Vec<u8>> {
        Cursor::new(self.bytes())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }
}

pub struct MemoryTapeWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemoryTapeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_clones_share_bytes() {
        let tape = MemoryTape::new();
        let mut w = tape.clone().writer();
        w.write_all(b"abc").unwrap();

        let mut out = String::new();
        tape.reader().read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
        assert_eq!(tape.len(), 3);
    }
}
