//! Request records and completion results.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::connection::RawStream;
use crate::error::Error;
use crate::timeout::NOT_QUEUED;

/// Kind of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Receive bytes from the connection.
    Read,
    /// Send bytes to the connection.
    Write,
    /// Release the connection's descriptor and discard its queued requests.
    /// Free requests never produce a completion.
    Free,
}

/// Buffer slot of a request, tracking ownership through its lifecycle.
pub(crate) enum ReqBuf {
    /// Read submitted without a caller buffer; a swap buffer is selected at
    /// I/O time.
    Swap,
    /// Caller-supplied read buffer. The transfer fills up to its capacity.
    Owned(BytesMut),
    /// Write payload. `Aiocb::size` tracks how much of it has been sent.
    Payload(Bytes),
    /// Completed swap read: the frozen view handed to the consumer.
    Frozen(Bytes),
}

impl ReqBuf {
    /// Consume the slot into the completion's buffer. For reads the result
    /// is exactly the received bytes; for writes, the original payload.
    pub(crate) fn into_bytes(self, size: usize) -> Bytes {
        match self {
            ReqBuf::Swap => Bytes::new(),
            ReqBuf::Owned(mut b) => {
                b.truncate(size);
                b.freeze()
            }
            ReqBuf::Payload(b) => b,
            ReqBuf::Frozen(b) => b,
        }
    }
}

/// A submitted request, alive from submission until its completion is
/// delivered (or it is discarded by a release).
pub(crate) struct Aiocb {
    pub(crate) op: OpKind,
    /// Caller context, copied through to the completion unchanged.
    pub(crate) ctx: u64,
    /// Identity of the target connection handle.
    pub(crate) ptr: usize,
    pub(crate) conn: Arc<dyn RawStream>,
    pub(crate) buf: ReqBuf,
    /// Bytes transferred so far; partial-write progress for writes.
    pub(crate) size: usize,
    /// Error recorded by the most recent transfer attempt.
    pub(crate) err: Option<Error>,
    /// Absolute deadline; `None` means the request never times out.
    pub(crate) deadline: Option<Instant>,
    /// Index into the deadline heap, `NOT_QUEUED` while off the heap.
    pub(crate) heap_idx: usize,
}

impl Aiocb {
    pub(crate) fn new(
        op: OpKind,
        ctx: u64,
        conn: Arc<dyn RawStream>,
        buf: ReqBuf,
        deadline: Option<Instant>,
    ) -> Self {
        let ptr = crate::connection::ident_of(&conn);
        Aiocb {
            op,
            ctx,
            ptr,
            conn,
            buf,
            size: 0,
            err: None,
            deadline,
            heap_idx: NOT_QUEUED,
        }
    }

    /// Whether the recorded outcome must release the descriptor: any error,
    /// or a clean EOF (zero-byte successful read).
    pub(crate) fn is_fatal(&self) -> bool {
        match self.op {
            OpKind::Read => self.err.is_some() || self.size == 0,
            OpKind::Write => self.err.is_some(),
            OpKind::Free => false,
        }
    }

    /// Consume the record into its completion result.
    pub(crate) fn into_result(self) -> OpResult {
        OpResult {
            op: self.op,
            ctx: self.ctx,
            conn: self.conn,
            buffer: self.buf.into_bytes(self.size),
            size: self.size,
            err: self.err,
        }
    }

    /// Consume the record into a completion carrying `err`, leaving the
    /// transfer state untouched (used for setup failures and deadlines).
    pub(crate) fn into_error_result(mut self, err: Error) -> OpResult {
        self.err = Some(err);
        self.into_result()
    }
}

/// The result of one asynchronous operation, delivered by
/// [`Watcher::wait_io`](crate::Watcher::wait_io).
pub struct OpResult {
    /// Operation kind.
    pub op: OpKind,
    /// Caller context from the submission, unchanged.
    pub ctx: u64,
    /// The connection handle the request named.
    pub conn: Arc<dyn RawStream>,
    /// For reads, exactly the received bytes, possibly a view of an
    /// internal swap buffer that the caller must consume before the next
    /// `wait_io` call. For writes, the original payload.
    pub buffer: Bytes,
    /// Bytes received or sent.
    pub size: usize,
    /// `None` on success. A zero-byte read with no error is a clean EOF.
    pub err: Option<Error>,
}

impl fmt::Debug for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpResult")
            .field("op", &self.op)
            .field("ctx", &self.ctx)
            .field("size", &self.size)
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}
