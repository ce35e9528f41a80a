//! Byte-stream resources
//!
//! Non-blocking fd halves driven by the reactor. A socket or pipe opened
//! read-write yields a linked pair of halves ("twins") sharing one fd:
//! closing one half just detaches it, closing the last closes the fd.
//!
//! Every operation follows the bridge protocol: try the syscall
//! synchronously first and return results directly when it completes (no
//! allocation, no reactor registration); otherwise register for readiness,
//! record the calling task as owner, and suspend. While an operation is
//! outstanding the resource is busy and rejects further operations.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use evma_core::buffer::InputBuf;
use evma_core::parser::{CloseReason, ParseStatus, Parser};
use evma_core::parsers::abort_values;
use evma_core::value::Value;
use evma_core::{kdebug, kwarn};

use crate::fdio::{self, errno_msg, IoStep};
use crate::poller::{Interest, WatchId, WatchVerdict};
use crate::runtime::Runtime;
use crate::task::{Progress, TaskHandle, Wait};

pub(crate) struct IStreamInner {
    fd: RawFd,
    owner: Option<TaskHandle>,
    watch: Option<WatchId>,
    twin: Option<Weak<RefCell<OStreamInner>>>,
    buf: InputBuf,
    parser: Option<Box<dyn Parser + Send>>,
}

pub(crate) struct OStreamInner {
    fd: RawFd,
    owner: Option<TaskHandle>,
    watch: Option<WatchId>,
    twin: Option<Weak<RefCell<IStreamInner>>>,
    /// Bytes still to send while a write is suspended
    data: Vec<u8>,
    pos: usize,
}

/// The readable half of a stream.
#[derive(Clone)]
pub struct IStream(pub(crate) Rc<RefCell<IStreamInner>>);

/// The writable half of a stream.
#[derive(Clone)]
pub struct OStream(pub(crate) Rc<RefCell<OStreamInner>>);

impl IStreamInner {
    fn new(fd: RawFd) -> Self {
        IStreamInner {
            fd,
            owner: None,
            watch: None,
            twin: None,
            buf: InputBuf::new(),
            parser: None,
        }
    }

    /// Give the fd up: detach from a live twin, or actually close.
    fn release_fd(&mut self) -> Result<(), i32> {
        let fd = self.fd;
        self.fd = -1;
        if let Some(twin) = self.twin.take().and_then(|w| w.upgrade()) {
            twin.borrow_mut().twin = None;
            Ok(())
        } else {
            fdio::close_fd(fd)
        }
    }
}

impl OStreamInner {
    fn new(fd: RawFd) -> Self {
        OStreamInner {
            fd,
            owner: None,
            watch: None,
            twin: None,
            data: Vec::new(),
            pos: 0,
        }
    }

    fn release_fd(&mut self) -> Result<(), i32> {
        let fd = self.fd;
        self.fd = -1;
        if let Some(twin) = self.twin.take().and_then(|w| w.upgrade()) {
            twin.borrow_mut().twin = None;
            Ok(())
        } else {
            fdio::close_fd(fd)
        }
    }
}

impl Drop for IStreamInner {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = self.release_fd();
        }
    }
}

impl Drop for OStreamInner {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = self.release_fd();
        }
    }
}

/// Outcome of driving a read-decode as far as it will go right now.
enum ReadDrive {
    /// Decode finished (result values or an error pair)
    Complete(Vec<Value>),

    /// Decode needs more bytes and the fd has none
    WouldBlock,
}

/// Greedy fill-and-parse loop shared by the fast path and the readiness
/// handler. On EOF or a hard error the fd is released and the parser gets
/// its one `finish` chance.
fn drive_read(s: &mut IStreamInner, parser: &mut Box<dyn Parser + Send>) -> ReadDrive {
    loop {
        match parser.process(&mut s.buf) {
            Ok(ParseStatus::Done(vals)) => return ReadDrive::Complete(vals),
            Err(e) => return ReadDrive::Complete(abort_values(e)),
            Ok(ParseStatus::More) => {
                if s.buf.is_full() {
                    // No retired prefix and nowhere to put more bytes
                    return ReadDrive::Complete(Value::err_pair("out of buffer space"));
                }
            }
        }

        match fdio::read_fd(s.fd, s.buf.space()) {
            IoStep::Did(n) => {
                kdebug!("read {} bytes from fd {}", n, s.fd);
                s.buf.advance_end(n);
            }
            IoStep::WouldBlock => return ReadDrive::WouldBlock,
            IoStep::Eof => return ReadDrive::Complete(read_teardown(s, parser, None)),
            IoStep::Err(e) => return ReadDrive::Complete(read_teardown(s, parser, Some(e))),
        }
    }
}

fn read_teardown(
    s: &mut IStreamInner,
    parser: &mut Box<dyn Parser + Send>,
    errno: Option<i32>,
) -> Vec<Value> {
    let _ = s.release_fd();
    let (reason, msg) = match errno {
        None => (CloseReason::Closed, "closed".to_owned()),
        Some(e) if fdio::is_disconnect(e) => (CloseReason::Closed, "closed".to_owned()),
        Some(e) => (CloseReason::Error, errno_msg(e)),
    };
    if let Some(vals) = parser.finish(&mut s.buf, reason) {
        return vals;
    }
    vec![Value::Nil, Value::Str(msg)]
}

fn istream_ready(rt: &mut Runtime, inner: &Rc<RefCell<IStreamInner>>) -> WatchVerdict {
    let (owner, vals) = {
        let mut s = inner.borrow_mut();
        let Some(mut parser) = s.parser.take() else {
            kwarn!("read readiness with no decode in progress");
            return WatchVerdict::Remove;
        };
        match drive_read(&mut s, &mut parser) {
            ReadDrive::WouldBlock => {
                s.parser = Some(parser);
                return WatchVerdict::Keep;
            }
            ReadDrive::Complete(vals) => {
                s.watch = None;
                (s.owner.take(), vals)
            }
        }
    };
    if let Some(owner) = owner {
        rt.requeue(&owner, vals);
    }
    WatchVerdict::Remove
}

impl IStream {
    /// Wrap an fd opened for reading. The fd is put into non-blocking mode.
    pub fn from_raw_fd(fd: RawFd) -> IStream {
        let _ = fdio::set_nonblocking(fd);
        IStream(Rc::new(RefCell::new(IStreamInner::new(fd))))
    }

    /// True once the underlying fd is gone.
    pub fn closed(&self) -> bool {
        self.0.borrow().fd < 0
    }

    /// True while a read is outstanding.
    pub fn busy(&self) -> bool {
        self.0.borrow().owner.is_some()
    }

    /// Incrementally decode one value through `parser`.
    ///
    /// Completes synchronously when the buffered bytes (plus whatever the
    /// fd yields without blocking) finish the decode; otherwise suspends
    /// until readable.
    pub fn readp(&self, rt: &mut Runtime, parser: Box<dyn Parser + Send>) -> Progress {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };

        let mut parser = parser;
        let fd = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Runtime::op_error("closed");
            }
            if s.owner.is_some() {
                return Runtime::op_error("busy");
            }

            match drive_read(&mut s, &mut parser) {
                ReadDrive::Complete(vals) => return Progress::Complete(vals),
                ReadDrive::WouldBlock => {
                    s.parser = Some(parser);
                    s.owner = Some(task.clone());
                    s.fd
                }
            }
        };

        let inner = self.0.clone();
        let id = rt.poller.register(
            fd,
            Interest::Read,
            Box::new(move |rt| istream_ready(rt, &inner)),
        );
        self.0.borrow_mut().watch = Some(id);
        task.set_wait(Wait::Reactor);
        Progress::Suspended
    }

    /// Force early resolution of an outstanding read: the waiting task is
    /// resumed with `[nil, "interrupted"]` and the registration removed.
    pub fn interrupt(&self, rt: &mut Runtime) -> Vec<Value> {
        let owner = {
            let mut s = self.0.borrow_mut();
            let Some(owner) = s.owner.take() else {
                return Value::err_pair("not busy");
            };
            if let Some(w) = s.watch.take() {
                rt.poller.deregister(w);
            }
            s.parser = None;
            owner
        };
        kdebug!("interrupting read");
        rt.requeue(&owner, Value::err_pair("interrupted"));
        vec![Value::Bool(true)]
    }

    /// Close this half. An outstanding read is interrupted first; the fd
    /// itself is closed only once both halves are gone.
    pub fn close(&self, rt: &mut Runtime) -> Vec<Value> {
        let pending = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Value::err_pair("closed");
            }
            s.owner.take().map(|owner| {
                if let Some(w) = s.watch.take() {
                    rt.poller.deregister(w);
                }
                s.parser = None;
                owner
            })
        };
        if let Some(owner) = pending {
            kdebug!("interrupting read before close");
            rt.requeue(&owner, Value::err_pair("interrupted"));
        }

        match self.0.borrow_mut().release_fd() {
            Ok(()) => vec![Value::Bool(true)],
            Err(e) => vec![Value::Nil, Value::Str(errno_msg(e))],
        }
    }
}

fn ostream_ready(rt: &mut Runtime, inner: &Rc<RefCell<OStreamInner>>) -> WatchVerdict {
    let (owner, vals) = {
        let mut s = inner.borrow_mut();
        loop {
            match fdio::write_fd(s.fd, &s.data[s.pos..]) {
                IoStep::Did(n) => {
                    s.pos += n;
                    if s.pos == s.data.len() {
                        s.data.clear();
                        s.pos = 0;
                        s.watch = None;
                        break (s.owner.take(), vec![Value::Bool(true)]);
                    }
                }
                IoStep::WouldBlock => return WatchVerdict::Keep,
                IoStep::Eof => {
                    s.watch = None;
                    let _ = s.release_fd();
                    break (s.owner.take(), Value::err_pair("closed"));
                }
                IoStep::Err(e) => {
                    s.watch = None;
                    let _ = s.release_fd();
                    let msg = if fdio::is_disconnect(e) {
                        "closed".to_owned()
                    } else {
                        errno_msg(e)
                    };
                    break (s.owner.take(), vec![Value::Nil, Value::Str(msg)]);
                }
            }
        }
    };
    if let Some(owner) = owner {
        rt.requeue(&owner, vals);
    }
    WatchVerdict::Remove
}

impl OStream {
    /// Wrap an fd opened for writing. The fd is put into non-blocking mode.
    pub fn from_raw_fd(fd: RawFd) -> OStream {
        let _ = fdio::set_nonblocking(fd);
        OStream(Rc::new(RefCell::new(OStreamInner::new(fd))))
    }

    /// True once the underlying fd is gone.
    pub fn closed(&self) -> bool {
        self.0.borrow().fd < 0
    }

    /// True while a write is outstanding.
    pub fn busy(&self) -> bool {
        self.0.borrow().owner.is_some()
    }

    /// Write all of `data`. Completes synchronously if the kernel takes
    /// everything without blocking; otherwise suspends until writable and
    /// resumes with `[true]` (or an error pair).
    pub fn write(&self, rt: &mut Runtime, data: Vec<u8>) -> Progress {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };
        if data.is_empty() {
            return Progress::Complete(vec![Value::Bool(true)]);
        }

        let fd = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Runtime::op_error("closed");
            }
            if s.owner.is_some() {
                return Runtime::op_error("busy");
            }

            let mut pos = 0;
            loop {
                match fdio::write_fd(s.fd, &data[pos..]) {
                    IoStep::Did(n) => {
                        pos += n;
                        if pos == data.len() {
                            return Progress::Complete(vec![Value::Bool(true)]);
                        }
                    }
                    IoStep::WouldBlock => {
                        s.data = data;
                        s.pos = pos;
                        s.owner = Some(task.clone());
                        break s.fd;
                    }
                    IoStep::Eof => {
                        let _ = s.release_fd();
                        return Runtime::op_error("closed");
                    }
                    IoStep::Err(e) => {
                        let _ = s.release_fd();
                        let msg = if fdio::is_disconnect(e) {
                            "closed".to_owned()
                        } else {
                            errno_msg(e)
                        };
                        return Progress::Complete(vec![Value::Nil, Value::Str(msg)]);
                    }
                }
            }
        };

        let inner = self.0.clone();
        let id = rt.poller.register(
            fd,
            Interest::Write,
            Box::new(move |rt| ostream_ready(rt, &inner)),
        );
        self.0.borrow_mut().watch = Some(id);
        task.set_wait(Wait::Reactor);
        Progress::Suspended
    }

    /// Force early resolution of an outstanding write.
    pub fn interrupt(&self, rt: &mut Runtime) -> Vec<Value> {
        let owner = {
            let mut s = self.0.borrow_mut();
            let Some(owner) = s.owner.take() else {
                return Value::err_pair("not busy");
            };
            if let Some(w) = s.watch.take() {
                rt.poller.deregister(w);
            }
            s.data.clear();
            s.pos = 0;
            owner
        };
        kdebug!("interrupting write");
        rt.requeue(&owner, Value::err_pair("interrupted"));
        vec![Value::Bool(true)]
    }

    /// Close this half, interrupting an outstanding write first.
    pub fn close(&self, rt: &mut Runtime) -> Vec<Value> {
        let pending = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Value::err_pair("closed");
            }
            s.owner.take().map(|owner| {
                if let Some(w) = s.watch.take() {
                    rt.poller.deregister(w);
                }
                s.data.clear();
                s.pos = 0;
                owner
            })
        };
        if let Some(owner) = pending {
            kdebug!("interrupting write before close");
            rt.requeue(&owner, Value::err_pair("interrupted"));
        }

        match self.0.borrow_mut().release_fd() {
            Ok(()) => vec![Value::Bool(true)],
            Err(e) => vec![Value::Nil, Value::Str(errno_msg(e))],
        }
    }
}

/// Build a linked read/write pair over one fd (socket, chardev, FIFO).
pub fn stream_pair(fd: RawFd) -> (IStream, OStream) {
    let _ = fdio::set_nonblocking(fd);
    let is = Rc::new(RefCell::new(IStreamInner::new(fd)));
    let os = Rc::new(RefCell::new(OStreamInner::new(fd)));
    is.borrow_mut().twin = Some(Rc::downgrade(&os));
    os.borrow_mut().twin = Some(Rc::downgrade(&is));
    (IStream(is), OStream(os))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::task::Outcome;
    use evma_core::parsers::Line;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default()).expect("runtime construction")
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_readp_fast_path_no_suspension() {
        let mut rt = rt();
        let (r, w) = pipe_pair();
        unsafe {
            libc::write(w, b"line\nrest".as_ptr() as *const libc::c_void, 9);
            libc::close(w);
        }

        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let is = IStream::from_raw_fd(r);
        rt.spawn_fn(move |rt, _| {
            match is.readp(rt, Box::new(Line::new(b'\n'))) {
                Progress::Complete(vals) => {
                    *got2.borrow_mut() = Some(vals);
                    Outcome::Finished
                }
                Progress::Suspended => panic!("buffered data must complete synchronously"),
            }
        });
        rt.run();

        let got = got.borrow();
        let vals = got.as_ref().unwrap();
        assert_eq!(vals[0].as_bytes(), Some(b"line".as_ref()));
    }

    #[test]
    fn test_write_fast_path() {
        let mut rt = rt();
        let (r, w) = pipe_pair();

        let os = OStream::from_raw_fd(w);
        rt.spawn_fn(move |rt, _| match os.write(rt, b"out".to_vec()) {
            Progress::Complete(vals) => {
                assert_eq!(vals[0], Value::Bool(true));
                Outcome::Finished
            }
            Progress::Suspended => panic!("small pipe write must complete synchronously"),
        });
        rt.run();

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(&buf[..n as usize], b"out");
        unsafe { libc::close(r) };
    }

    #[test]
    fn test_close_twice_reports_closed() {
        let mut rt = rt();
        let (r, w) = pipe_pair();
        unsafe { libc::close(w) };

        let is = IStream::from_raw_fd(r);
        rt.spawn_fn(move |rt, _| {
            assert_eq!(is.close(rt)[0], Value::Bool(true));
            let second = is.close(rt);
            assert!(second[0].is_nil());
            assert_eq!(second[1].as_str(), Some("closed"));
            Outcome::Finished
        });
        rt.run();
    }

    #[test]
    fn test_twin_detach_then_real_close() {
        let mut rt = rt();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (near, far) = (fds[0], fds[1]);

        let (is, os) = stream_pair(near);
        rt.spawn_fn(move |rt, _| {
            // Close the read half: only a detach, the fd must stay usable
            assert_eq!(is.close(rt)[0], Value::Bool(true));
            match os.write(rt, b"still here".to_vec()) {
                Progress::Complete(vals) => assert_eq!(vals[0], Value::Bool(true)),
                Progress::Suspended => panic!("socketpair write must not block"),
            }
            // Closing the second half actually closes the fd
            assert_eq!(os.close(rt)[0], Value::Bool(true));
            Outcome::Finished
        });
        rt.run();

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(far, buf.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(&buf[..n as usize], b"still here");
        // Peer closed: EOF
        let n = unsafe { libc::read(far, buf.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(n, 0);
        unsafe { libc::close(far) };
    }
}
