//! Deadline tracking: an index-tracked binary min-heap over the request
//! slab.
//!
//! Every heap entry stores its own position back into the request record
//! (`Aiocb::heap_idx`), so a request completed by I/O can be deleted from
//! the middle of the heap in O(log n) without a search. The root's deadline
//! drives the loop's single shared timer.

use std::time::Instant;

use slab::Slab;

use crate::request::Aiocb;

/// Sentinel for `Aiocb::heap_idx` while the request is off the heap.
pub(crate) const NOT_QUEUED: usize = usize::MAX;

pub(crate) struct TimerHeap {
    entries: Vec<Entry>,
}

struct Entry {
    deadline: Instant,
    id: usize,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        TimerHeap {
            entries: Vec::new(),
        }
    }

    /// Deadline of the earliest entry, if any.
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Whether `id` sits at the root after the most recent mutation.
    pub(crate) fn is_root(&self, id: usize) -> bool {
        self.entries.first().map(|e| e.id) == Some(id)
    }

    /// Push a request that carries a deadline. The request's `heap_idx` is
    /// kept in sync from here on.
    pub(crate) fn push(&mut self, requests: &mut Slab<Aiocb>, id: usize) {
        let Some(deadline) = requests[id].deadline else {
            return;
        };
        let idx = self.entries.len();
        self.entries.push(Entry { deadline, id });
        requests[id].heap_idx = idx;
        self.sift_up(requests, idx);
    }

    /// Pop the earliest entry, returning its request id.
    pub(crate) fn pop(&mut self, requests: &mut Slab<Aiocb>) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(requests, 0))
    }

    /// Delete the entry at heap position `idx` (typically a request's
    /// stored `heap_idx`), returning its request id.
    pub(crate) fn remove_at(&mut self, requests: &mut Slab<Aiocb>, idx: usize) -> usize {
        let entry = self.entries.swap_remove(idx);
        requests[entry.id].heap_idx = NOT_QUEUED;
        if idx < self.entries.len() {
            requests[self.entries[idx].id].heap_idx = idx;
            self.sift_down(requests, idx);
            self.sift_up(requests, idx);
        }
        entry.id
    }

    fn sift_up(&mut self, requests: &mut Slab<Aiocb>, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[idx].deadline >= self.entries[parent].deadline {
                break;
            }
            self.swap_entries(requests, idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, requests: &mut Slab<Aiocb>, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < self.entries.len()
                && self.entries[left].deadline < self.entries[smallest].deadline
            {
                smallest = left;
            }
            if right < self.entries.len()
                && self.entries[right].deadline < self.entries[smallest].deadline
            {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap_entries(requests, idx, smallest);
            idx = smallest;
        }
    }

    fn swap_entries(&mut self, requests: &mut Slab<Aiocb>, a: usize, b: usize) {
        self.entries.swap(a, b);
        requests[self.entries[a].id].heap_idx = a;
        requests[self.entries[b].id].heap_idx = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RawStream;
    use crate::request::{OpKind, ReqBuf};
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::Arc;
    use std::time::Duration;

    struct NullStream;

    impl AsRawFd for NullStream {
        fn as_raw_fd(&self) -> RawFd {
            0
        }
    }

    fn request(deadline: Instant) -> Aiocb {
        let conn: Arc<dyn RawStream> = Arc::new(NullStream);
        Aiocb::new(OpKind::Read, 0, conn, ReqBuf::Swap, Some(deadline))
    }

    fn indices_consistent(heap: &TimerHeap, requests: &Slab<Aiocb>) {
        for (idx, entry) in heap.entries.iter().enumerate() {
            assert_eq!(requests[entry.id].heap_idx, idx, "stale index for {idx}");
        }
    }

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let mut requests = Slab::new();
        let mut heap = TimerHeap::new();

        let offsets = [40u64, 10, 30, 20, 50, 5];
        for &ms in &offsets {
            let id = requests.insert(request(base + Duration::from_millis(ms)));
            heap.push(&mut requests, id);
            indices_consistent(&heap, &requests);
        }

        let mut popped = Vec::new();
        while let Some(id) = heap.pop(&mut requests) {
            assert_eq!(requests[id].heap_idx, NOT_QUEUED);
            popped.push(requests[id].deadline.expect("deadline set"));
            indices_consistent(&heap, &requests);
        }
        let mut sorted = popped.clone();
        sorted.sort();
        assert_eq!(popped, sorted);
    }

    #[test]
    fn removal_from_the_middle_keeps_order() {
        let base = Instant::now();
        let mut requests = Slab::new();
        let mut heap = TimerHeap::new();

        let mut ids = Vec::new();
        for ms in [15u64, 35, 25, 45, 5, 55] {
            let id = requests.insert(request(base + Duration::from_millis(ms)));
            heap.push(&mut requests, id);
            ids.push(id);
        }

        // Delete the 35ms and 5ms entries by their stored indices.
        for &victim in &[ids[1], ids[4]] {
            let idx = requests[victim].heap_idx;
            let removed = heap.remove_at(&mut requests, idx);
            assert_eq!(removed, victim);
            assert_eq!(requests[victim].heap_idx, NOT_QUEUED);
            indices_consistent(&heap, &requests);
        }

        let mut remaining = Vec::new();
        while let Some(id) = heap.pop(&mut requests) {
            remaining.push(requests[id].deadline.expect("deadline set"));
        }
        let expected: Vec<Instant> = [15u64, 25, 45, 55]
            .iter()
            .map(|&ms| base + Duration::from_millis(ms))
            .collect();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn new_root_is_reported() {
        let base = Instant::now();
        let mut requests = Slab::new();
        let mut heap = TimerHeap::new();

        let late = requests.insert(request(base + Duration::from_millis(100)));
        heap.push(&mut requests, late);
        assert!(heap.is_root(late));

        let early = requests.insert(request(base + Duration::from_millis(1)));
        heap.push(&mut requests, early);
        assert!(heap.is_root(early));
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_millis(1)));
    }

    #[test]
    fn push_without_deadline_is_ignored() {
        let mut requests = Slab::new();
        let mut heap = TimerHeap::new();
        let conn: Arc<dyn RawStream> = Arc::new(NullStream);
        let id = requests.insert(Aiocb::new(OpKind::Read, 0, conn, ReqBuf::Swap, None));
        heap.push(&mut requests, id);
        assert!(heap.peek_deadline().is_none());
        assert_eq!(requests[id].heap_idx, NOT_QUEUED);
    }
}
