//! Fixed-capacity overwrite-oldest byte buffer.
//!
//! Bounds the memory used to capture command output. Long-running producers
//! like `yes` or a large `cat` can emit far more than any analysis snapshot
//! needs; when the buffer is full the oldest byte is silently discarded
//! before the newest is written.
//!
//! The buffer is deliberately not synchronized: every access path in the
//! engine already holds the owning session's lock.

/// Default capacity: 64 KiB captures most command outputs.
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Fixed-size circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    head: usize, // write position
    tail: usize, // read position
    full: bool,
}

impl RingBuffer {
    /// Creates a buffer with the given capacity (bytes).
    ///
    /// A zero capacity falls back to [`DEFAULT_RING_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_RING_CAPACITY
        } else {
            capacity
        };
        Self {
            buf: vec![0; capacity],
            capacity,
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// Appends bytes, overwriting the oldest data when full.
    pub fn write(&mut self, data: &[u8]) {
        for &b in data {
            if self.full {
                // Overwrite: advance tail past the oldest byte.
                self.tail = (self.tail + 1) % self.capacity;
            }
            self.buf[self.head] = b;
            self.head = (self.head + 1) % self.capacity;
            if self.head == self.tail {
                self.full = true;
            }
        }
    }

    /// Returns the buffered bytes in write order.
    pub fn to_vec(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }

        if self.full && self.head == self.tail {
            let mut out = Vec::with_capacity(self.capacity);
            out.extend_from_slice(&self.buf[self.tail..]);
            out.extend_from_slice(&self.buf[..self.head]);
            return out;
        }

        if self.head > self.tail {
            return self.buf[self.tail..self.head].to_vec();
        }

        // Wrap-around: tail -> end, then start -> head.
        let mut out = Vec::with_capacity((self.capacity - self.tail) + self.head);
        out.extend_from_slice(&self.buf[self.tail..]);
        out.extend_from_slice(&self.buf[..self.head]);
        out
    }

    /// Returns the buffered bytes as a (lossy) UTF-8 string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Number of bytes currently buffered. Never exceeds the capacity.
    pub fn len(&self) -> usize {
        if self.full {
            return self.capacity;
        }
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            (self.capacity - self.tail) + self.head
        }
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    /// Returns the fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.full = false;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}
