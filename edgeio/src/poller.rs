//! Readiness facility over epoll/kqueue via mio.
//!
//! Registration is edge-triggered: a readiness event is reported once per
//! transition from not-ready to ready, and the event loop is responsible for
//! draining until would-block. The wait side runs on its own thread and
//! hands event batches to the loop over a rendezvous channel; `wake()`
//! unblocks a concurrent wait so the thread can observe shutdown.

use std::io;
use std::os::fd::RawFd;

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Maximum events drained per wait; a tick with more ready descriptors
/// spreads across consecutive waits.
pub(crate) const MAX_EVENTS: usize = 1024;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// One readiness event. `ident` is the watcher-owned descriptor; error and
/// hang-up conditions are folded into both direction bits so the next
/// transfer attempt surfaces the condition as errno or EOF.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) ident: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Registration handle shared with the event loop.
pub(crate) struct Poller {
    registry: Registry,
    waker: Waker,
}

/// The blocking wait side, owned by the poller thread.
pub(crate) struct PollerWaiter {
    poll: Poll,
}

impl Poller {
    pub(crate) fn open() -> io::Result<(Poller, PollerWaiter)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;
        Ok((Poller { registry, waker }, PollerWaiter { poll }))
    }

    /// Register `ident` for both read and write readiness.
    pub(crate) fn watch(&self, ident: RawFd) -> io::Result<()> {
        self.registry.register(
            &mut SourceFd(&ident),
            Token(ident as usize),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Remove `ident` from the readiness set. Required before closing the
    /// descriptor: the caller's original handle keeps the open file
    /// description alive, so close alone would not drop the registration.
    pub(crate) fn unwatch(&self, ident: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&ident))
    }

    /// Unblock a concurrent wait.
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl PollerWaiter {
    /// Thread body: wait for readiness, batch, push to the loop. Exits when
    /// the die channel disconnects or the loop goes away.
    pub(crate) fn run(mut self, tx: Sender<Vec<Event>>, die: Receiver<()>) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return;
            }

            let mut batch = Vec::with_capacity(events.iter().count());
            for ev in events.iter() {
                if ev.token() == WAKE_TOKEN {
                    continue;
                }
                let err = ev.is_error();
                batch.push(Event {
                    ident: ev.token().0 as RawFd,
                    readable: ev.is_readable() || ev.is_read_closed() || err,
                    writable: ev.is_writable() || ev.is_write_closed() || err,
                });
            }

            if matches!(die.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }
            if batch.is_empty() {
                continue;
            }

            select! {
                send(tx, batch) -> res => {
                    if res.is_err() {
                        return;
                    }
                }
                recv(die) -> _ => return,
            }
        }
    }
}
