//! Thin non-blocking fd helpers
//!
//! Raw syscall wrappers used by the resource layer. Everything here
//! returns errno-style results; mapping to task-visible error values
//! happens in the callers.

use std::os::unix::io::RawFd;

/// Outcome of one non-blocking read or write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStep {
    /// Transferred this many bytes (> 0)
    Did(usize),

    /// End of stream (read returned 0)
    Eof,

    /// The operation would block; suspend and wait for readiness
    WouldBlock,

    /// Hard failure with errno
    Err(i32),
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Human-readable message for an errno, for task-visible error values.
pub(crate) fn errno_msg(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> IoStep {
    if buf.is_empty() {
        return IoStep::WouldBlock;
    }
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        IoStep::Did(n as usize)
    } else if n == 0 {
        IoStep::Eof
    } else {
        match last_errno() {
            libc::EAGAIN | libc::EINTR => IoStep::WouldBlock,
            e => IoStep::Err(e),
        }
    }
}

pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> IoStep {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n > 0 {
        IoStep::Did(n as usize)
    } else if n == 0 {
        IoStep::Eof
    } else {
        match last_errno() {
            libc::EAGAIN | libc::EINTR => IoStep::WouldBlock,
            e => IoStep::Err(e),
        }
    }
}

pub(crate) fn close_fd(fd: RawFd) -> Result<(), i32> {
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(last_errno())
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), i32> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(last_errno());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

/// A peer that vanished mid-transfer reads as "closed", not as an error.
#[inline]
pub(crate) fn is_disconnect(errno: i32) -> bool {
    errno == libc::ECONNRESET || errno == libc::EPIPE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (r, w) = pipe_pair();
        assert_eq!(write_fd(w, b"ping"), IoStep::Did(4));

        let mut buf = [0u8; 16];
        assert_eq!(read_fd(r, &mut buf), IoStep::Did(4));
        assert_eq!(&buf[..4], b"ping");

        // Nothing left: would block
        assert_eq!(read_fd(r, &mut buf), IoStep::WouldBlock);

        close_fd(w).unwrap();
        assert_eq!(read_fd(r, &mut buf), IoStep::Eof);
        close_fd(r).unwrap();
    }

    #[test]
    fn test_errno_msg_is_nonempty() {
        assert!(!errno_msg(libc::ECONNRESET).is_empty());
    }
}
