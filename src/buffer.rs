// ABOUTME: Linear, compactable byte buffer used by the command-pipe reader's drain/fill loop.

/// A growable byte buffer with a `(start, used)` cursor pair instead of a
/// true ring buffer: the consumed prefix is dropped by shifting remaining
/// bytes down ("packing") rather than wrapping indices. Simpler, and the
/// command-pipe reader's working set is small enough that the copy is cheap.
#[derive(Debug, Default)]
pub struct LinearBuffer {
    mem: Vec<u8>,
    start: usize,
    used: usize,
}

impl LinearBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mem: vec![0u8; capacity],
            start: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Bytes available to read without growing.
    pub fn free(&self) -> usize {
        self.mem.len() - (self.start + self.used)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem[self.start..self.start + self.used]
    }

    /// Drop the consumed prefix by shifting the remaining `used` bytes to
    /// offset 0. Call before a fill phase that needs trailing free space.
    pub fn pack(&mut self) {
        if self.start == 0 {
            return;
        }
        self.mem.copy_within(self.start..self.start + self.used, 0);
        self.start = 0;
    }

    /// Ensure at least `min_free` contiguous bytes are available at the tail,
    /// packing first and growing the backing store if packing isn't enough.
    pub fn ensure_free_space(&mut self, min_free: usize) {
        if self.free() >= min_free {
            return;
        }
        self.pack();
        if self.free() < min_free {
            let needed = min_free - self.free();
            self.mem.resize(self.mem.len() + needed, 0);
        }
    }

    /// Mutable slice at the tail, sized `ensure_free_space` was called with,
    /// for a backend `read()` call to fill directly.
    pub fn write_tail_mut(&mut self, want: usize) -> &mut [u8] {
        self.ensure_free_space(want);
        let begin = self.start + self.used;
        &mut self.mem[begin..begin + want]
    }

    /// Record that `n` bytes were just written into the tail slice.
    pub fn commit_write(&mut self, n: usize) {
        self.used += n;
    }

    /// Drop `n` bytes from the front (already-processed data).
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        let n = n.min(self.used);
        self.start += n;
        self.used -= n;
        if self.used == 0 {
            self.start = 0;
        }
    }

    /// Peek the word at byte offset `word_index * 4` within the buffered
    /// region, little-endian, if fully present.
    pub fn view_u32(&self, word_index: usize) -> Option<u32> {
        let byte_off = word_index * 4;
        if byte_off + 4 > self.used {
            return None;
        }
        let s = self.as_slice();
        Some(u32::from_le_bytes([
            s[byte_off],
            s[byte_off + 1],
            s[byte_off + 2],
            s[byte_off + 3],
        ]))
    }

    /// Number of complete 32-bit words currently buffered.
    pub fn word_count(&self) -> usize {
        self.used / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_consume_pack_roundtrip() {
        let mut buf = LinearBuffer::with_capacity(16);
        {
            let tail = buf.write_tail_mut(8);
            tail[..4].copy_from_slice(&0x11111111u32.to_le_bytes());
            tail[4..].copy_from_slice(&0xAABBCCDDu32.to_le_bytes());
        }
        buf.commit_write(8);
        assert_eq!(buf.word_count(), 2);
        buf.consume(4);
        assert_eq!(buf.word_count(), 1);
        buf.pack();
        assert_eq!(buf.view_u32(0), Some(0xAABBCCDD));
    }

    #[test]
    fn ensure_free_space_grows_when_packing_insufficient() {
        let mut buf = LinearBuffer::with_capacity(4);
        buf.commit_write(0);
        buf.ensure_free_space(10);
        assert!(buf.capacity() >= 10);
    }
}
