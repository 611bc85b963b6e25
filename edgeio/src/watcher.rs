//! The public watcher: submission facade, completion wait, shutdown.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::config::Config;
use crate::connection::RawStream;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::poller::Poller;
use crate::request::{Aiocb, OpKind, OpResult, ReqBuf};

/// Lock a mutex, recovering the data from a poisoned lock. Submitters only
/// push onto a vec under this lock, so a panicked submitter cannot leave the
/// queue in a torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared between submitters and the loop thread.
pub(crate) struct Shared {
    pub(crate) pending: Mutex<Vec<Aiocb>>,
}

/// An asynchronous I/O watcher for stream sockets.
///
/// Submit read and write requests against a connection handle; the watcher
/// duplicates the handle's descriptor once, performs the transfers on its
/// own event loop when the kernel reports readiness, and delivers completed
/// operations in batches through [`wait_io`](Watcher::wait_io).
///
/// The watcher is `Send + Sync`; clone an `Arc<Watcher>` to submit from
/// multiple threads. Requests on one connection complete in submission
/// order per direction.
pub struct Watcher {
    shared: Arc<Shared>,
    pending_tx: Sender<()>,
    completion_rx: Receiver<Vec<OpResult>>,
    die_rx: Receiver<()>,
    /// Present until `close` runs; dropping the sender is the shutdown
    /// signal every thread observes.
    die_tx: Mutex<Option<Sender<()>>>,
    poller: Arc<Poller>,
}

impl Watcher {
    /// Create a watcher whose internal swap buffers hold `bufsize` bytes.
    /// Reads submitted without a buffer receive at most `bufsize` bytes per
    /// completion.
    pub fn new(bufsize: usize) -> io::Result<Watcher> {
        Self::with_config(Config {
            swap_buffer_size: bufsize,
            ..Config::default()
        })
    }

    /// Create a watcher from a full [`Config`].
    pub fn with_config(mut config: Config) -> io::Result<Watcher> {
        config.swap_buffer_size = config.swap_buffer_size.max(1);

        let (poller, waiter) = Poller::open()?;
        let poller = Arc::new(poller);

        let (pending_tx, pending_rx) = bounded(1);
        let (events_tx, events_rx) = bounded(0);
        let (completion_tx, completion_rx) = bounded(0);
        let (die_tx, die_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
        });

        {
            let die = die_rx.clone();
            thread::Builder::new()
                .name("edgeio-poller".to_string())
                .spawn(move || waiter.run(events_tx, die))?;
        }
        {
            let event_loop = EventLoop::new(
                poller.clone(),
                shared.clone(),
                pending_rx,
                events_rx,
                completion_tx,
                die_rx.clone(),
                &config,
            );
            thread::Builder::new()
                .name("edgeio-loop".to_string())
                .spawn(move || event_loop.run())?;
        }

        Ok(Watcher {
            shared,
            pending_tx,
            completion_rx,
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
            poller,
        })
    }

    /// Submit an asynchronous read on `conn` with caller context `ctx`.
    ///
    /// With `None` (or a zero-capacity buffer) the watcher lends one of its
    /// internal swap buffers at I/O time; the completion's buffer is then a
    /// shared view the caller must consume before the next `wait_io` call.
    pub fn read(
        &self,
        ctx: u64,
        conn: &Arc<dyn RawStream>,
        buf: Option<BytesMut>,
    ) -> Result<(), Error> {
        self.submit(OpKind::Read, ctx, conn, read_buf(buf), None)
    }

    /// Like [`read`](Watcher::read), expected to complete before `deadline`;
    /// otherwise the completion carries [`Error::Deadline`].
    pub fn read_timeout(
        &self,
        ctx: u64,
        conn: &Arc<dyn RawStream>,
        buf: Option<BytesMut>,
        deadline: Instant,
    ) -> Result<(), Error> {
        self.submit(OpKind::Read, ctx, conn, read_buf(buf), Some(deadline))
    }

    /// Submit an asynchronous write of `buf` on `conn`. Partial writes are
    /// resumed internally; the single completion reports the full payload
    /// length on success.
    pub fn write(&self, ctx: u64, conn: &Arc<dyn RawStream>, buf: Bytes) -> Result<(), Error> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        self.submit(OpKind::Write, ctx, conn, ReqBuf::Payload(buf), None)
    }

    /// Like [`write`](Watcher::write) with a completion deadline.
    pub fn write_timeout(
        &self,
        ctx: u64,
        conn: &Arc<dyn RawStream>,
        buf: Bytes,
        deadline: Instant,
    ) -> Result<(), Error> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        self.submit(OpKind::Write, ctx, conn, ReqBuf::Payload(buf), Some(deadline))
    }

    /// Release the watcher's resources for `conn` immediately: the
    /// duplicated descriptor is closed and every outstanding request on the
    /// connection is discarded without a completion.
    pub fn free(&self, conn: &Arc<dyn RawStream>) -> Result<(), Error> {
        self.submit(OpKind::Free, 0, conn, ReqBuf::Swap, None)
    }

    /// Block until the loop delivers a completion batch, or until the
    /// watcher shuts down (`Err(WatcherClosed)`). Each call returns exactly
    /// one batch produced by one loop iteration; batches are never coalesced
    /// across calls.
    pub fn wait_io(&self) -> Result<Vec<OpResult>, Error> {
        select! {
            recv(self.completion_rx) -> msg => msg.map_err(|_| Error::WatcherClosed),
            recv(self.die_rx) -> _ => Err(Error::WatcherClosed),
        }
    }

    /// Begin shutdown: wake the poller, stop the loop, and release every
    /// descriptor. Idempotent. In-flight requests receive no completion.
    pub fn close(&self) -> io::Result<()> {
        let tx = lock(&self.die_tx).take();
        if let Some(tx) = tx {
            drop(tx);
            self.poller.wake()?;
        }
        Ok(())
    }

    fn submit(
        &self,
        op: OpKind,
        ctx: u64,
        conn: &Arc<dyn RawStream>,
        buf: ReqBuf,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if lock(&self.die_tx).is_none() {
            return Err(Error::WatcherClosed);
        }
        lock(&self.shared.pending).push(Aiocb::new(op, ctx, conn.clone(), buf, deadline));
        // Capacity-1 notification: if one is already pending the loop will
        // see this entry when it services it.
        let _ = self.pending_tx.try_send(());
        metrics::REQUESTS_SUBMITTED.increment();
        Ok(())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Normalize a caller read buffer: anything without capacity means "lend a
/// swap buffer at I/O time". A caller buffer is restored to its full
/// capacity so the transfer can fill it.
fn read_buf(buf: Option<BytesMut>) -> ReqBuf {
    match buf {
        Some(mut b) if b.capacity() > 0 => {
            let cap = b.capacity();
            b.resize(cap, 0);
            ReqBuf::Owned(b)
        }
        _ => ReqBuf::Swap,
    }
}
