//! Thin wrappers over the raw syscalls the loop performs on descriptors it
//! owns. Errors come back as `io::Error` with the errno preserved.

use std::io;
use std::os::fd::RawFd;

/// Duplicate `fd` with close-on-exec set. The caller owns the returned
/// descriptor.
pub(crate) fn dup(fd: RawFd) -> io::Result<RawFd> {
    // F_DUPFD_CLOEXEC avoids the race between dup(2) and a separate
    // FD_CLOEXEC fcntl.
    let newfd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if newfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(newfd)
}

/// Receive from a stream socket without blocking. MSG_DONTWAIT makes the
/// single call non-blocking; the duplicate shares its open file description
/// (and thus O_NONBLOCK) with the caller's handle, so the file-status flags
/// must stay untouched.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send to a stream socket without blocking; same MSG_DONTWAIT rationale as
/// [`read`].
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
