//! The watcher event loop: the single-threaded coordinator that owns every
//! descriptor, per-descriptor FIFO, the deadline heap, the swap ring, and
//! the result batcher.
//!
//! The loop waits on exactly five sources: pending submissions, readiness
//! batches from the poller thread, the deadline timer, the dropped-handle
//! sweep tick, and shutdown. All of its state is thread-confined; the only
//! shared structure is the pending vec, touched briefly under its mutex by
//! submitters and by one drain step here.
//!
//! Completion delivery blocks on a rendezvous channel. A slow consumer
//! therefore backpressures the loop and suspends all further I/O progress
//! until the batch is accepted or shutdown is signalled; this keeps memory
//! bounded and is what makes the two-buffer swap ring sufficient.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, at, never, select, tick};
use slab::Slab;
use tracing::{debug, trace};

use crate::buffer::SwapRing;
use crate::config::Config;
use crate::connection::{FD_READABLE, FD_WRITABLE, FdDesc, dup_stream};
use crate::error::Error;
use crate::metrics;
use crate::poller::{Event, MAX_EVENTS, Poller};
use crate::request::{Aiocb, OpKind, OpResult, ReqBuf};
use crate::sys;
use crate::timeout::{NOT_QUEUED, TimerHeap};
use crate::watcher::{Shared, lock};

/// What one iteration of the five-way wait produced.
enum Wake {
    Pending,
    Events(Vec<Event>),
    Timer,
    Sweep,
    Shutdown,
}

pub(crate) struct EventLoop {
    poller: Arc<Poller>,
    shared: Arc<Shared>,
    pending_rx: Receiver<()>,
    events_rx: Receiver<Vec<Event>>,
    /// Re-armed to the heap root's deadline; `never()` while the heap is
    /// empty.
    timer_rx: Receiver<Instant>,
    sweep_rx: Receiver<Instant>,
    die: Receiver<()>,
    completion_tx: Sender<Vec<OpResult>>,

    /// ident → per-descriptor state.
    descs: HashMap<RawFd, FdDesc>,
    /// handle identity → ident. The inverse of the `ptr` field in `FdDesc`.
    conn_idents: HashMap<usize, RawFd>,
    /// Arena for enqueued requests; FIFO and heap entries are keys into it.
    requests: Slab<Aiocb>,
    timeouts: TimerHeap,
    swap: SwapRing,
    /// Results accumulated during the current readiness batch.
    batch: Vec<OpResult>,
    /// Reusable drain buffer for the pending swap.
    pending_scratch: Vec<Aiocb>,
}

impl EventLoop {
    pub(crate) fn new(
        poller: Arc<Poller>,
        shared: Arc<Shared>,
        pending_rx: Receiver<()>,
        events_rx: Receiver<Vec<Event>>,
        completion_tx: Sender<Vec<OpResult>>,
        die: Receiver<()>,
        config: &Config,
    ) -> Self {
        EventLoop {
            poller,
            shared,
            pending_rx,
            events_rx,
            timer_rx: never(),
            sweep_rx: tick(config.sweep_interval),
            die,
            completion_tx,
            descs: HashMap::new(),
            conn_idents: HashMap::new(),
            requests: Slab::new(),
            timeouts: TimerHeap::new(),
            swap: SwapRing::new(config.swap_buffer_size),
            batch: Vec::with_capacity(MAX_EVENTS),
            pending_scratch: Vec::new(),
        }
    }

    /// Loop thread body. Returns after shutdown has released every
    /// descriptor.
    pub(crate) fn run(mut self) {
        debug!("watcher loop started");
        loop {
            let wake = select! {
                recv(self.pending_rx) -> msg => {
                    match msg {
                        Ok(()) => Wake::Pending,
                        Err(_) => Wake::Shutdown,
                    }
                }
                recv(self.events_rx) -> msg => {
                    match msg {
                        Ok(events) => Wake::Events(events),
                        Err(_) => Wake::Shutdown,
                    }
                }
                recv(self.timer_rx) -> _ => Wake::Timer,
                recv(self.sweep_rx) -> _ => Wake::Sweep,
                recv(self.die) -> _ => Wake::Shutdown,
            };
            let alive = match wake {
                Wake::Pending => self.handle_pending(),
                Wake::Events(events) => self.handle_events(events),
                Wake::Timer => self.handle_expired(),
                Wake::Sweep => {
                    self.sweep();
                    true
                }
                Wake::Shutdown => false,
            };
            if !alive {
                break;
            }
        }
        self.teardown();
    }

    // ── Pending submissions ─────────────────────────────────────────────

    fn handle_pending(&mut self) -> bool {
        let mut local = std::mem::take(&mut self.pending_scratch);
        {
            let mut queue = lock(&self.shared.pending);
            std::mem::swap(&mut *queue, &mut local);
        }
        let mut alive = true;
        for cb in local.drain(..) {
            if !self.submit_request(cb) {
                alive = false;
                break;
            }
        }
        self.pending_scratch = local;
        alive
    }

    /// Process one submitted request: resolve or create the descriptor
    /// binding, run the fast path when a readiness edge is standing, and
    /// otherwise enqueue on the per-direction FIFO (and deadline heap).
    fn submit_request(&mut self, cb: Aiocb) -> bool {
        let mut known = self.conn_idents.get(&cb.ptr).copied();

        // An allocation address can be reused by a new handle after the old
        // one was dropped but before the sweep ran. A binding whose handle
        // is dead cannot belong to the submitted connection; release it and
        // register afresh.
        if let Some(ident) = known {
            let stale = self
                .descs
                .get(&ident)
                .is_none_or(|desc| desc.conn.strong_count() == 0);
            if stale {
                self.release_conn(ident);
                known = None;
            }
        }

        if cb.op == OpKind::Free {
            if let Some(ident) = known {
                self.release_conn(ident);
            }
            return true;
        }

        let ident = match known {
            Some(ident) => ident,
            None => match self.register_conn(&cb) {
                Ok(ident) => ident,
                Err(err) => {
                    // Setup failure: surfaced as a single-element batch for
                    // this request, then forgotten.
                    return self.deliver(vec![cb.into_error_result(err)]);
                }
            },
        };

        let is_read = cb.op == OpKind::Read;
        let (queue_empty, ready) = {
            let desc = &self.descs[&ident];
            if is_read {
                (desc.readers.is_empty(), desc.status & FD_READABLE != 0)
            } else {
                (desc.writers.is_empty(), desc.status & FD_WRITABLE != 0)
            }
        };

        // Fast path: nothing queued ahead and the last reported edge has
        // not been consumed, so attempt the transfer immediately.
        let mut cb = cb;
        if queue_empty && ready {
            let done = if is_read {
                try_read(&mut self.swap, ident, &mut cb)
            } else {
                try_write(ident, &mut cb)
            };
            if done {
                let fatal = cb.is_fatal();
                record_transfer(&cb);
                if !self.deliver(vec![cb.into_result()]) {
                    return false;
                }
                if fatal {
                    self.release_conn(ident);
                }
                return true;
            }
            // Edge consumed without completing; wait for the next one.
            if let Some(desc) = self.descs.get_mut(&ident) {
                desc.status &= if is_read { !FD_READABLE } else { !FD_WRITABLE };
            }
        }

        let has_deadline = cb.deadline.is_some();
        let id = self.requests.insert(cb);
        if let Some(desc) = self.descs.get_mut(&ident) {
            if is_read {
                desc.readers.push_back(id);
            } else {
                desc.writers.push_back(id);
            }
        }
        if has_deadline {
            self.timeouts.push(&mut self.requests, id);
            if self.timeouts.is_root(id) {
                self.rearm_timer();
            }
        }
        true
    }

    /// Duplicate the handle's descriptor, register it with the poller, and
    /// install both identity bindings.
    fn register_conn(&mut self, cb: &Aiocb) -> Result<RawFd, Error> {
        let ident = dup_stream(&cb.conn)?;
        if let Err(e) = self.poller.watch(ident) {
            sys::close(ident);
            return Err(Error::Io(e));
        }
        debug_assert!(!self.descs.contains_key(&ident));
        self.descs.insert(ident, FdDesc::new(cb.ptr, &cb.conn));
        self.conn_idents.insert(cb.ptr, ident);
        metrics::CONNECTIONS_REGISTERED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        trace!(ident, "registered connection");
        Ok(ident)
    }

    // ── Readiness ───────────────────────────────────────────────────────

    fn handle_events(&mut self, events: Vec<Event>) -> bool {
        for ev in events {
            // Events may still be in flight for a descriptor released in a
            // previous tick (or earlier in this batch); ignore them.
            if !self.descs.contains_key(&ev.ident) {
                continue;
            }

            let mut release = false;
            if ev.readable {
                if let Some(desc) = self.descs.get_mut(&ev.ident) {
                    desc.status |= FD_READABLE;
                }
                match self.drain_readers(ev.ident) {
                    Ok(fatal) => release = fatal,
                    Err(()) => return false,
                }
            }
            if ev.writable && !release {
                if let Some(desc) = self.descs.get_mut(&ev.ident) {
                    desc.status |= FD_WRITABLE;
                }
                match self.drain_writers(ev.ident) {
                    Ok(fatal) => release = fatal,
                    Err(()) => return false,
                }
            }
            if release {
                self.release_conn(ev.ident);
            }
        }
        self.flush_batch()
    }

    /// Drain the readers FIFO in order until would-block, a fatal outcome,
    /// or the queue empties. `Ok(true)` means the descriptor must be
    /// released; `Err(())` means shutdown interrupted a delivery.
    fn drain_readers(&mut self, ident: RawFd) -> Result<bool, ()> {
        loop {
            let id = {
                let Some(desc) = self.descs.get_mut(&ident) else {
                    return Ok(false);
                };
                let Some(&id) = desc.readers.front() else {
                    return Ok(false);
                };
                id
            };

            if !try_read(&mut self.swap, ident, &mut self.requests[id]) {
                if let Some(desc) = self.descs.get_mut(&ident) {
                    desc.status &= !FD_READABLE;
                }
                return Ok(false);
            }

            if let Some(desc) = self.descs.get_mut(&ident) {
                desc.readers.pop_front();
            }
            let heap_idx = self.requests[id].heap_idx;
            if heap_idx != NOT_QUEUED {
                self.timeouts.remove_at(&mut self.requests, heap_idx);
            }
            let cb = self.requests.remove(id);
            let fatal = cb.is_fatal();
            let used_swap = matches!(cb.buf, ReqBuf::Frozen(_));
            record_transfer(&cb);
            self.batch.push(cb.into_result());

            // A swap-buffer completion pins one of the two shared buffers:
            // the batch must reach the consumer before the ring can wrap
            // back around to it.
            if used_swap && !self.flush_batch() {
                return Err(());
            }
            if fatal {
                return Ok(true);
            }
        }
    }

    /// Symmetric drain over the writers FIFO; writes never touch the swap
    /// ring, so there is no mid-drain flush.
    fn drain_writers(&mut self, ident: RawFd) -> Result<bool, ()> {
        loop {
            let id = {
                let Some(desc) = self.descs.get_mut(&ident) else {
                    return Ok(false);
                };
                let Some(&id) = desc.writers.front() else {
                    return Ok(false);
                };
                id
            };

            if !try_write(ident, &mut self.requests[id]) {
                if let Some(desc) = self.descs.get_mut(&ident) {
                    desc.status &= !FD_WRITABLE;
                }
                return Ok(false);
            }

            if let Some(desc) = self.descs.get_mut(&ident) {
                desc.writers.pop_front();
            }
            let heap_idx = self.requests[id].heap_idx;
            if heap_idx != NOT_QUEUED {
                self.timeouts.remove_at(&mut self.requests, heap_idx);
            }
            let cb = self.requests.remove(id);
            let fatal = cb.is_fatal();
            record_transfer(&cb);
            self.batch.push(cb.into_result());
            if fatal {
                return Ok(true);
            }
        }
    }

    // ── Deadlines ───────────────────────────────────────────────────────

    fn handle_expired(&mut self) -> bool {
        loop {
            let Some(deadline) = self.timeouts.peek_deadline() else {
                break;
            };
            if Instant::now() < deadline {
                break;
            }
            let Some(id) = self.timeouts.pop(&mut self.requests) else {
                break;
            };

            // The request is done: unlink its FIFO entry so later readiness
            // never attempts the transfer, then deliver the deadline error.
            self.unlink_from_fifo(id);
            let cb = self.requests.remove(id);
            metrics::DEADLINES_EXPIRED.increment();
            if !self.deliver(vec![cb.into_error_result(Error::Deadline)]) {
                return false;
            }
        }
        self.rearm_timer();
        true
    }

    /// Remove a request's per-descriptor FIFO entry when it completes by a
    /// path other than the drain itself (deadline firing).
    fn unlink_from_fifo(&mut self, id: usize) {
        let cb = &self.requests[id];
        let Some(&ident) = self.conn_idents.get(&cb.ptr) else {
            return;
        };
        let Some(desc) = self.descs.get_mut(&ident) else {
            return;
        };
        let queue = match cb.op {
            OpKind::Read => &mut desc.readers,
            OpKind::Write => &mut desc.writers,
            OpKind::Free => return,
        };
        if let Some(pos) = queue.iter().position(|&queued| queued == id) {
            queue.remove(pos);
        }
    }

    fn rearm_timer(&mut self) {
        self.timer_rx = match self.timeouts.peek_deadline() {
            Some(deadline) => at(deadline),
            None => never(),
        };
    }

    // ── Dropped handles ─────────────────────────────────────────────────

    /// Release every descriptor whose user handle has no strong references
    /// left. Queued requests hold strong clones, so a connection with
    /// outstanding work is never swept.
    fn sweep(&mut self) {
        let dropped: Vec<RawFd> = self
            .descs
            .iter()
            .filter(|(_, desc)| desc.conn.strong_count() == 0)
            .map(|(&ident, _)| ident)
            .collect();
        for ident in dropped {
            trace!(ident, "releasing dropped connection handle");
            self.release_conn(ident);
        }
    }

    // ── Release and teardown ────────────────────────────────────────────

    /// Drop the descriptor and everything queued on it. Requests still in
    /// the FIFOs are discarded without completions.
    fn release_conn(&mut self, ident: RawFd) {
        let Some(desc) = self.descs.remove(&ident) else {
            return;
        };
        for &id in desc.readers.iter().chain(desc.writers.iter()) {
            let heap_idx = self.requests[id].heap_idx;
            if heap_idx != NOT_QUEUED {
                self.timeouts.remove_at(&mut self.requests, heap_idx);
            }
            self.requests.remove(id);
        }
        self.conn_idents.remove(&desc.ptr);
        // The caller's original descriptor keeps the file description open,
        // so the registration must be dropped explicitly before close.
        if let Err(e) = self.poller.unwatch(ident) {
            debug!(ident, error = %e, "deregister failed during release");
        }
        sys::close(ident);
        metrics::CONNECTIONS_RELEASED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        trace!(
            ident,
            discarded = desc.readers.len() + desc.writers.len(),
            "released connection"
        );
    }

    fn teardown(&mut self) {
        let idents: Vec<RawFd> = self.descs.keys().copied().collect();
        for ident in idents {
            self.release_conn(ident);
        }
        debug!("watcher loop stopped");
    }

    // ── Delivery ────────────────────────────────────────────────────────

    /// Blocking delivery of one batch. Returns false when shutdown is the
    /// only way out.
    fn deliver(&mut self, results: Vec<OpResult>) -> bool {
        metrics::COMPLETIONS_DELIVERED.add(results.len() as u64);
        metrics::BATCHES_DELIVERED.increment();
        select! {
            send(self.completion_tx, results) -> res => res.is_ok(),
            recv(self.die) -> _ => false,
        }
    }

    fn flush_batch(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(MAX_EVENTS));
        self.deliver(batch)
    }
}

// ── Transfer attempts ───────────────────────────────────────────────────

/// Attempt a read for `cb` on `ident`. Returns false when the descriptor is
/// not ready; true means the request completed (success, clean EOF, or
/// error) with the outcome recorded in `cb`.
fn try_read(swap: &mut SwapRing, ident: RawFd, cb: &mut Aiocb) -> bool {
    if matches!(cb.buf, ReqBuf::Swap) {
        loop {
            match sys::read(ident, swap.lend()) {
                Ok(n) => {
                    cb.size = n;
                    cb.err = None;
                    cb.buf = ReqBuf::Frozen(swap.complete(n));
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    cb.size = 0;
                    cb.err = Some(Error::Io(e));
                    return true;
                }
            }
        }
    }

    // Read requests only ever carry Swap or Owned slots.
    let ReqBuf::Owned(buf) = &mut cb.buf else {
        debug_assert!(false, "read request with a write/completed buffer");
        return true;
    };
    loop {
        match sys::read(ident, &mut buf[..]) {
            Ok(n) => {
                buf.truncate(n);
                cb.size = n;
                cb.err = None;
                return true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.truncate(0);
                cb.size = 0;
                cb.err = Some(Error::Io(e));
                return true;
            }
        }
    }
}

/// Attempt one write for `cb` on `ident`, resuming at the partial-write
/// offset. Returns true only when the payload is fully sent or an error was
/// recorded; a short write waits for the next WRITABLE edge.
fn try_write(ident: RawFd, cb: &mut Aiocb) -> bool {
    let ReqBuf::Payload(buf) = &cb.buf else {
        debug_assert!(false, "write request without a payload buffer");
        return true;
    };
    match sys::write(ident, &buf[cb.size..]) {
        Ok(n) => {
            cb.size += n;
            cb.err = None;
            cb.size == buf.len()
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => {
            cb.err = Some(Error::Io(e));
            true
        }
    }
}

fn record_transfer(cb: &Aiocb) {
    if cb.err.is_none() {
        match cb.op {
            OpKind::Read => {
                metrics::BYTES_READ.add(cb.size as u64);
            }
            OpKind::Write => {
                metrics::BYTES_WRITTEN.add(cb.size as u64);
            }
            OpKind::Free => {}
        }
    }
}
