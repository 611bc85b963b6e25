//! The swap ring: two watcher-owned read buffers lent to requests that
//! supplied none of their own.
//!
//! Exactly two buffers suffice because the loop flushes the in-progress
//! result batch the moment a completion references a swap buffer, so at
//! most one lent view is ever outstanding with the consumer. Completion views are
//! `split_to(n).freeze()` slices of the backing `BytesMut`; `reserve`
//! reclaims the region once the consumer has dropped the view, and falls
//! back to a fresh allocation if the consumer wrongly retained it, so a
//! contract violation degrades to an extra allocation instead of bytes
//! changing under the consumer.

use bytes::{Bytes, BytesMut};

pub(crate) struct SwapRing {
    bufs: [BytesMut; 2],
    next: usize,
    size: usize,
}

impl SwapRing {
    pub(crate) fn new(size: usize) -> Self {
        let mut make = || {
            let mut b = BytesMut::with_capacity(size);
            b.resize(size, 0);
            b
        };
        SwapRing {
            bufs: [make(), make()],
            next: 0,
            size,
        }
    }

    /// The buffer the next read will fill, restored to full length.
    pub(crate) fn lend(&mut self) -> &mut [u8] {
        let size = self.size;
        let buf = &mut self.bufs[self.next];
        if buf.len() < size {
            buf.reserve(size - buf.len());
            buf.resize(size, 0);
        }
        &mut buf[..]
    }

    /// Freeze the first `n` bytes of the lent buffer as the completion view
    /// and advance the cursor to the other buffer.
    pub(crate) fn complete(&mut self, n: usize) -> Bytes {
        let view = self.bufs[self.next].split_to(n).freeze();
        self.next = (self.next + 1) % self.bufs.len();
        view
    }
}
