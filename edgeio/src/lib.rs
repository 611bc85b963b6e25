//! edgeio: proactor-style async I/O for stream sockets.
//!
//! Callers submit read and write requests naming a connection handle, an
//! opaque context, and an optional deadline; the watcher performs the byte
//! transfer when the kernel reports readiness and delivers results in
//! batches through a blocking completion call. Callers never touch the
//! descriptor, never poll readiness, and never retry would-block; this is
//! the inverse of the usual reactor arrangement.
//!
//! One watcher runs two threads: a poller blocked on epoll/kqueue and the
//! single-threaded event loop that owns every descriptor, queue, and
//! buffer. The watcher duplicates each connection's descriptor at first
//! submission, so the caller's own handle can be dropped at any time
//! without disturbing in-flight operations; dropping every clone of the
//! handle releases the watcher's descriptor too.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! use edgeio::{RawStream, Watcher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let watcher = Watcher::new(64 * 1024)?;
//!
//!     let conn: Arc<dyn RawStream> = Arc::new(TcpStream::connect("127.0.0.1:7878")?);
//!     watcher.write(1, &conn, bytes::Bytes::from_static(b"ping"))?;
//!     watcher.read(2, &conn, None)?;
//!
//!     loop {
//!         for result in watcher.wait_io()? {
//!             println!("ctx={} size={} err={:?}", result.ctx, result.size, result.err);
//!         }
//!     }
//! }
//! ```
//!
//! # Ordering
//!
//! Per connection and direction, completions arrive in submission order.
//! Nothing is guaranteed across directions or across connections, and the
//! order of results inside one batch is not part of the contract.
//!
//! # Platform
//!
//! Unix only: readiness comes from epoll (Linux) or kqueue (BSD, macOS)
//! with edge-triggered registration.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod event_loop;
pub(crate) mod poller;
pub(crate) mod request;
pub(crate) mod sys;
pub(crate) mod timeout;
pub(crate) mod watcher;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;

/// Watcher configuration.
pub use config::Config;
/// Handle trait for connections the watcher can adopt.
pub use connection::RawStream;
/// Errors surfaced by submissions and completions.
pub use error::Error;
/// Kind of a submitted operation.
pub use request::OpKind;
/// One completed operation, delivered by [`Watcher::wait_io`].
pub use request::OpResult;
/// The watcher itself.
pub use watcher::Watcher;
