//! Append-and-consume receive buffer with amortized compaction

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempted to consume more bytes than buffered")]
pub struct OutOfRange;

/// Consumed bytes stay in `storage` until a later append decides that
/// moving the live tail is cheaper than growing. The decision mirrors
/// three cases: append in place, memmove live bytes to the front, or
/// reallocate to 1.5x rounded up to a page.
pub struct Buffer {
    storage: Vec<u8>,
    offset: usize,
}

/// Live bytes small enough that moving them is near free
const MOVE_SIZE_LIMIT: usize = 4096;

/// Consumed-prefix size beyond which an unforced move pays off
const MOVE_OFFSET_LIMIT: usize = 4096 * 16;

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Vec::with_capacity(capacity),
            offset: 0,
        }
    }

    /// Number of unconsumed bytes
    pub fn size(&self) -> usize {
        self.storage.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append `data`, preserving all unconsumed bytes
    pub fn append(&mut self, data: &[u8]) {
        let capacity = self.storage.capacity();
        let avail = capacity - self.storage.len();

        if data.len() > avail {
            // reallocate or move
            if self.size() + data.len() <= capacity {
                // live bytes plus the new data fit if we reclaim the
                // consumed prefix (forced move)
                self.storage.copy_within(self.offset.., 0);
                self.storage.truncate(self.storage.len() - self.offset);
                self.offset = 0;
            } else {
                let reserve = (((self.size() + data.len()) * 3 / 2) + 4095) & !4095;
                let mut new_storage = Vec::with_capacity(reserve);
                new_storage.extend_from_slice(&self.storage[self.offset..]);
                self.offset = 0;
                self.storage = new_storage;
            }
        } else if self.size() <= MOVE_SIZE_LIMIT
            && self.offset > MOVE_OFFSET_LIMIT
            && self.offset >= capacity / 2
        {
            // little to move, and far enough into the buffer that
            // reclaiming now avoids a future realloc (unforced move)
            self.storage.copy_within(self.offset.., 0);
            self.storage.truncate(self.storage.len() - self.offset);
            self.offset = 0;
        }

        self.storage.extend_from_slice(data);
    }

    /// Borrow the first `count` unconsumed bytes without consuming them
    pub fn span(&self, count: usize) -> &[u8] {
        let count = count.min(self.size());
        &self.storage[self.offset..self.offset + count]
    }

    /// Consume `count` bytes and return them; the view stays valid until
    /// the next mutating call
    pub fn carve(&mut self, count: usize) -> Result<&[u8], OutOfRange> {
        if count > self.size() {
            return Err(OutOfRange);
        }
        let begin = self.offset;
        self.offset += count;
        let view = &self.storage[begin..begin + count];
        // cannot reset here: the view borrows storage
        Ok(view)
    }

    /// Discard `count` unconsumed bytes
    pub fn erase(&mut self, count: usize) -> Result<(), OutOfRange> {
        if count > self.size() {
            return Err(OutOfRange);
        }
        self.offset += count;
        if self.offset == self.storage.len() {
            self.storage.clear();
            self.offset = 0;
        }
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
