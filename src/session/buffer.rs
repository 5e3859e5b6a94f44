// Stream buffer - contiguous reassembly buffer for incremental parsing
// Inbound bytes append at the back; parsers consume from an advancing read
// cursor. A reclamation pass moves the live tail to the front once the dead
// prefix grows large, so steady-state streaming does not reallocate.

/// Dead-prefix size that triggers reclamation, provided the prefix also
/// outweighs the live bytes.
const RECLAIM_THRESHOLD: usize = 16 * 1024;

#[derive(Default)]
pub struct StreamBuffer {
    buf: Vec<u8>,
    start: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed byte count.
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append inbound bytes, reclaiming front space first when worthwhile.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.start >= RECLAIM_THRESHOLD && self.start >= self.len() {
            self.buf.copy_within(self.start.., 0);
            self.buf.truncate(self.len());
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// The unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Advance the read cursor past `n` bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n.min(self.len());
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }
}
