//! Connection handles and per-descriptor state.
//!
//! Callers hand the watcher an `Arc<dyn RawStream>`. The `Arc` allocation
//! address is the connection's identity, and the watcher never performs I/O
//! on the caller's descriptor: it duplicates it once at registration and
//! exclusively owns the duplicate (the "ident") from then on. The caller may
//! drop every clone of the handle at any time; the sweep in the event loop
//! notices and releases the ident.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use crate::error::Error;
use crate::sys;

/// A stream-socket handle the watcher can adopt.
///
/// Blanket-implemented for anything that exposes a raw descriptor and can
/// cross threads, so `TcpStream` and `UnixStream` work directly. The
/// descriptor must belong to a stream socket; the watcher performs
/// `recv(2)`/`send(2)` on a duplicate of it.
pub trait RawStream: AsRawFd + Send + Sync {}

impl<T: AsRawFd + Send + Sync> RawStream for T {}

/// Identity of a connection handle: the `Arc` allocation address. Clones of
/// the same `Arc` agree; distinct allocations never collide.
pub(crate) fn ident_of(conn: &Arc<dyn RawStream>) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

/// Duplicate the handle's descriptor for exclusive watcher ownership.
///
/// The `&self` borrow of the handle keeps its descriptor valid for the
/// duration of the duplicate syscall. The duplicate shares its open file
/// description (and so its file-status flags) with the caller's handle;
/// the loop therefore performs every transfer with per-call non-blocking
/// semantics instead of setting O_NONBLOCK, which would leak onto the
/// caller's handle.
pub(crate) fn dup_stream(conn: &Arc<dyn RawStream>) -> Result<RawFd, Error> {
    let raw = conn.as_raw_fd();
    if raw < 0 {
        return Err(Error::Unsupported);
    }
    let fd = sys::dup(raw)?;
    Ok(fd)
}

/// Readiness bit: the descriptor's most recent READABLE edge has not yet
/// been drained to would-block.
pub(crate) const FD_READABLE: u8 = 1;
/// Readiness bit: same, for WRITABLE.
pub(crate) const FD_WRITABLE: u8 = 2;

/// Per-descriptor state owned by the event loop.
///
/// The FIFOs hold request-slab keys; order is submission order per
/// direction. `status` records readiness edges reported by the poller that
/// have not yet been consumed by attempted transfers.
pub(crate) struct FdDesc {
    pub(crate) status: u8,
    pub(crate) readers: VecDeque<usize>,
    pub(crate) writers: VecDeque<usize>,
    /// Identity of the owning handle, for the inverse binding.
    pub(crate) ptr: usize,
    /// Weak reference for the dropped-handle sweep. Queued requests hold
    /// strong clones, so a descriptor with outstanding work is never swept.
    pub(crate) conn: Weak<dyn RawStream>,
}

impl FdDesc {
    pub(crate) fn new(ptr: usize, conn: &Arc<dyn RawStream>) -> Self {
        FdDesc {
            status: 0,
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            ptr,
            conn: Arc::downgrade(conn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn ident_stable_across_clones() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let stream = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let a: Arc<dyn RawStream> = Arc::new(stream);
        let b = a.clone();
        assert_eq!(ident_of(&a), ident_of(&b));
    }

    #[test]
    fn distinct_handles_distinct_idents() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let a: Arc<dyn RawStream> = Arc::new(TcpStream::connect(addr).expect("connect"));
        let b: Arc<dyn RawStream> = Arc::new(TcpStream::connect(addr).expect("connect"));
        assert_ne!(ident_of(&a), ident_of(&b));
    }

    struct BadHandle;

    impl AsRawFd for BadHandle {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    #[test]
    fn invalid_descriptor_is_unsupported() {
        let conn: Arc<dyn RawStream> = Arc::new(BadHandle);
        match dup_stream(&conn) {
            Err(Error::Unsupported) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
