//! Regular-file resources
//!
//! Disk I/O has no useful readiness notification, so every file operation
//! runs as a worker-pool job: the file's fd and input buffer travel into
//! the job, the blocking syscall happens on a worker thread, and the
//! completion reaction puts them back and resumes the owner on the
//! scheduler thread. While a job is in flight the file is busy; worker
//! suspensions cannot be interrupted, so closing a busy file reports
//! "busy" and the caller waits for natural completion.

use std::cell::RefCell;
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use evma_core::buffer::{InputBuf, INPUTBUF_SIZE};
use evma_core::id::TaskId;
use evma_core::parser::{CloseReason, ParseStatus, Parser};
use evma_core::parsers::abort_values;
use evma_core::value::Value;
use evma_core::{kdebug, kwarn};

use crate::fdio::{self, errno_msg};
use crate::pool::AsyncJob;
use crate::runtime::{PendingResource, PendingWorker, Runtime};
use crate::stream::{stream_pair, IStream, OStream};
use crate::task::{Progress, Wait};

/// The movable guts of a file: whatever a worker job needs.
pub(crate) struct FileInner {
    fd: RawFd,
    buf: InputBuf,
}

/// A file is either idle (holding its guts), busy (guts inside a job), or
/// closed.
pub(crate) enum FileSlot {
    Idle(FileInner),
    Busy,
    Closed,
}

/// A regular file handle with worker-thread I/O.
#[derive(Clone)]
pub struct File(pub(crate) Rc<RefCell<FileSlot>>);

impl File {
    /// Wrap an already-open fd of a regular or block file.
    pub fn from_raw_fd(fd: RawFd) -> File {
        File(Rc::new(RefCell::new(FileSlot::Idle(FileInner {
            fd,
            buf: InputBuf::new(),
        }))))
    }

    pub fn closed(&self) -> bool {
        matches!(*self.0.borrow(), FileSlot::Closed)
    }

    pub fn busy(&self) -> bool {
        matches!(*self.0.borrow(), FileSlot::Busy)
    }

    /// Close the file. Rejected with "busy" while a job is in flight.
    pub fn close(&self, _rt: &mut Runtime) -> Vec<Value> {
        let mut slot = self.0.borrow_mut();
        match &*slot {
            FileSlot::Closed => Value::err_pair("closed"),
            FileSlot::Busy => Value::err_pair("busy"),
            FileSlot::Idle(inner) => {
                let fd = inner.fd;
                *slot = FileSlot::Closed;
                match fdio::close_fd(fd) {
                    Ok(()) => vec![Value::Bool(true)],
                    Err(e) => vec![Value::Nil, Value::Str(errno_msg(e))],
                }
            }
        }
    }

    /// Incrementally decode one value through `parser`, reading on a
    /// worker thread. Completes synchronously if leftover buffered bytes
    /// already finish the decode.
    pub fn readp(&self, rt: &mut Runtime, parser: Box<dyn Parser + Send>) -> Progress {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };

        let mut parser = parser;
        let inner = {
            let mut slot = self.0.borrow_mut();
            {
                let inner = match &mut *slot {
                    FileSlot::Closed => return Runtime::op_error("closed"),
                    FileSlot::Busy => return Runtime::op_error("busy"),
                    FileSlot::Idle(inner) => inner,
                };
                match parser.process(&mut inner.buf) {
                    Ok(ParseStatus::Done(vals)) => return Progress::Complete(vals),
                    Err(e) => return Progress::Complete(abort_values(e)),
                    Ok(ParseStatus::More) => {
                        if inner.buf.is_full() {
                            return Progress::Complete(Value::err_pair("out of buffer space"));
                        }
                    }
                }
            }
            core::mem::replace(&mut *slot, FileSlot::Busy)
        };
        let FileSlot::Idle(inner) = inner else {
            unreachable!("checked above");
        };

        let owner = task.id();
        self.suspend_on(
            rt,
            task,
            Box::new(ReadJob {
                inner,
                parser,
                owner,
                result: ReadResult::Data,
            }),
        );
        Progress::Suspended
    }

    /// Write all of `data` on a worker thread; resumes with `[true]` or an
    /// error pair.
    pub fn write(&self, rt: &mut Runtime, data: Vec<u8>) -> Progress {
        self.simple_job(rt, move |inner| {
            let mut pos = 0;
            while pos < data.len() {
                match fdio::write_fd(inner.fd, &data[pos..]) {
                    fdio::IoStep::Did(n) => pos += n,
                    fdio::IoStep::WouldBlock => continue,
                    fdio::IoStep::Eof => return Err("closed".to_owned()),
                    fdio::IoStep::Err(e) => return Err(errno_msg(e)),
                }
            }
            Ok(JobOk::True)
        })
    }

    /// Fetch the file size (fstat on a worker thread).
    pub fn size(&self, rt: &mut Runtime) -> Progress {
        self.simple_job(rt, |inner| {
            let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
            if unsafe { libc::fstat(inner.fd, st.as_mut_ptr()) } != 0 {
                return Err(errno_msg(fdio::last_errno()));
            }
            let st = unsafe { st.assume_init() };
            Ok(JobOk::Int(st.st_size as i64))
        })
    }

    /// Reposition the file offset; resumes with the new offset.
    ///
    /// Seeking drops any bytes left over from earlier decodes.
    pub fn seek(&self, rt: &mut Runtime, from: SeekFrom) -> Progress {
        let (offset, whence) = match from {
            SeekFrom::Start(o) => (o as i64, libc::SEEK_SET),
            SeekFrom::Current(o) => (o, libc::SEEK_CUR),
            SeekFrom::End(o) => (o, libc::SEEK_END),
        };
        self.simple_job(rt, move |inner| {
            let pos = unsafe { libc::lseek(inner.fd, offset as libc::off_t, whence) };
            if pos < 0 {
                return Err(errno_msg(fdio::last_errno()));
            }
            inner.buf.clear();
            Ok(JobOk::Int(pos as i64))
        })
    }

    /// Shared shape of write/size/seek: one blocking closure on a worker,
    /// its result threaded straight back to the owner.
    fn simple_job<F>(&self, rt: &mut Runtime, work: F) -> Progress
    where
        F: FnOnce(&mut FileInner) -> JobResult + Send + 'static,
    {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };

        let inner = {
            let mut slot = self.0.borrow_mut();
            match &*slot {
                FileSlot::Closed => return Runtime::op_error("closed"),
                FileSlot::Busy => return Runtime::op_error("busy"),
                FileSlot::Idle(_) => {}
            }
            core::mem::replace(&mut *slot, FileSlot::Busy)
        };
        let FileSlot::Idle(inner) = inner else {
            unreachable!("checked above");
        };

        let owner = task.id();
        self.suspend_on(
            rt,
            task,
            Box::new(CallJob {
                inner: Some(inner),
                work: Some(work),
                result: Ok(JobOk::True),
                owner,
            }),
        );
        Progress::Suspended
    }

    fn suspend_on(&self, rt: &mut Runtime, task: crate::task::TaskHandle, job: Box<dyn AsyncJob>) {
        task.set_wait(Wait::Worker);
        rt.add_pending(PendingWorker {
            task,
            resource: PendingResource::File(self.0.clone()),
        });
        let _ = rt.submit(job);
    }
}

/// Completion side shared by the file jobs: fetch the pending record, hand
/// the guts back, enqueue the owner.
fn finish_file_job(rt: &mut Runtime, owner: TaskId, inner: Option<FileInner>, vals: Vec<Value>) {
    let Some(pending) = rt.take_pending(owner) else {
        kwarn!("worker completion for unknown task {}", owner);
        return;
    };
    let PendingResource::File(slot) = pending.resource else {
        kwarn!("worker completion with mismatched resource for task {}", owner);
        return;
    };
    *slot.borrow_mut() = match inner {
        Some(inner) => FileSlot::Idle(inner),
        None => FileSlot::Closed,
    };
    rt.requeue(&pending.task, vals);
}

enum ReadResult {
    Data,
    Eof,
    Err(i32),
}

struct ReadJob {
    inner: FileInner,
    parser: Box<dyn Parser + Send>,
    owner: TaskId,
    result: ReadResult,
}

impl AsyncJob for ReadJob {
    fn work(&mut self) {
        let inner = &mut self.inner;
        loop {
            match fdio::read_fd(inner.fd, &mut inner.buf.buf[inner.buf.end..INPUTBUF_SIZE]) {
                fdio::IoStep::Did(n) => {
                    kdebug!("read {} bytes from fd {}", n, inner.fd);
                    inner.buf.advance_end(n);
                    self.result = ReadResult::Data;
                    return;
                }
                fdio::IoStep::Eof => {
                    self.result = ReadResult::Eof;
                    return;
                }
                // Regular files do not block, but a chardev routed here
                // might; retrying keeps the job semantics simple
                fdio::IoStep::WouldBlock => continue,
                fdio::IoStep::Err(e) => {
                    let _ = fdio::close_fd(inner.fd);
                    inner.fd = -1;
                    self.result = ReadResult::Err(e);
                    return;
                }
            }
        }
    }

    fn reap(mut self: Box<Self>, rt: &mut Runtime) {
        match self.result {
            ReadResult::Eof => {
                let vals = self
                    .parser
                    .finish(&mut self.inner.buf, CloseReason::Closed)
                    .unwrap_or_else(|| Value::err_pair("eof"));
                finish_file_job(rt, self.owner, Some(self.inner), vals);
            }
            ReadResult::Err(e) => {
                let vals = self
                    .parser
                    .finish(&mut self.inner.buf, CloseReason::Error)
                    .unwrap_or_else(|| vec![Value::Nil, Value::Str(errno_msg(e))]);
                // The fd was closed on the worker
                finish_file_job(rt, self.owner, None, vals);
            }
            ReadResult::Data => match self.parser.process(&mut self.inner.buf) {
                Ok(ParseStatus::Done(vals)) => {
                    finish_file_job(rt, self.owner, Some(self.inner), vals)
                }
                Err(e) => finish_file_job(rt, self.owner, Some(self.inner), abort_values(e)),
                Ok(ParseStatus::More) => {
                    if self.inner.buf.is_full() {
                        // No retired prefix and nowhere to put more bytes
                        let vals = Value::err_pair("out of buffer space");
                        finish_file_job(rt, self.owner, Some(self.inner), vals);
                        return;
                    }
                    // Decode unfinished: back to the pool for another read.
                    // The pending record still holds the task and the slot.
                    let _ = rt.submit(self);
                }
            },
        }
    }
}

/// What a blocking closure may produce. `Value` itself cannot cross
/// threads (resource handles are `Rc`-based), so jobs carry this and the
/// reap converts on the scheduler side.
enum JobOk {
    True,
    Int(i64),
}

type JobResult = Result<JobOk, String>;

fn job_values(result: JobResult) -> Vec<Value> {
    match result {
        Ok(JobOk::True) => vec![Value::Bool(true)],
        Ok(JobOk::Int(n)) => vec![Value::Int(n)],
        Err(msg) => vec![Value::Nil, Value::Str(msg)],
    }
}

/// One blocking closure plus its result.
struct CallJob<F>
where
    F: FnOnce(&mut FileInner) -> JobResult + Send,
{
    inner: Option<FileInner>,
    work: Option<F>,
    result: JobResult,
    owner: TaskId,
}

impl<F> AsyncJob for CallJob<F>
where
    F: FnOnce(&mut FileInner) -> JobResult + Send,
{
    fn work(&mut self) {
        if let (Some(work), Some(inner)) = (self.work.take(), self.inner.as_mut()) {
            self.result = work(inner);
        }
    }

    fn reap(mut self: Box<Self>, rt: &mut Runtime) {
        let result = core::mem::replace(&mut self.result, Ok(JobOk::True));
        finish_file_job(rt, self.owner, self.inner.take(), job_values(result));
    }
}

// ---- open ---------------------------------------------------------------

/// Parse an fopen-style mode string into open(2) flags.
fn mode_to_flags(mode: &str) -> Option<i32> {
    let mut chars = mode.bytes();
    let mut omode;
    let mut oflags;

    match chars.next()? {
        b'r' => {
            omode = libc::O_RDONLY;
            oflags = 0;
        }
        b'w' => {
            omode = libc::O_WRONLY;
            oflags = libc::O_CREAT | libc::O_TRUNC;
        }
        b'a' => {
            omode = libc::O_WRONLY;
            oflags = libc::O_CREAT | libc::O_APPEND;
        }
        _ => return None,
    }

    for c in chars {
        match c {
            b'+' => omode = libc::O_RDWR,
            // meaningless on unix, but not an error
            b'b' => {}
            b'x' => oflags |= libc::O_EXCL,
            _ => return None,
        }
    }

    Some(omode | oflags)
}

/// What kind of resource an opened fd should become.
enum OpenKind {
    File,
    Stream,
    Invalid,
}

struct OpenJob {
    path: CString,
    flags: i32,
    owner: TaskId,
    fd: RawFd,
    kind: OpenKind,
    errno: i32,
}

impl AsyncJob for OpenJob {
    fn work(&mut self) {
        let fd = unsafe {
            libc::open(
                self.path.as_ptr(),
                self.flags | libc::O_NONBLOCK,
                (libc::S_IRUSR | libc::S_IWUSR | libc::S_IRGRP | libc::S_IROTH) as libc::c_uint,
            )
        };
        if fd < 0 {
            self.errno = fdio::last_errno();
            return;
        }

        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
            self.errno = fdio::last_errno();
            let _ = fdio::close_fd(fd);
            return;
        }
        let st = unsafe { st.assume_init() };

        self.fd = fd;
        self.kind = match st.st_mode & libc::S_IFMT {
            libc::S_IFSOCK | libc::S_IFCHR | libc::S_IFIFO => OpenKind::Stream,
            libc::S_IFREG | libc::S_IFBLK => OpenKind::File,
            _ => OpenKind::Invalid,
        };
    }

    fn reap(self: Box<Self>, rt: &mut Runtime) {
        let Some(pending) = rt.take_pending(self.owner) else {
            kwarn!("open completion for unknown task {}", self.owner);
            return;
        };

        let vals = if self.errno != 0 {
            vec![Value::Nil, Value::Str(errno_msg(self.errno))]
        } else {
            match self.kind {
                OpenKind::Invalid => {
                    let _ = fdio::close_fd(self.fd);
                    Value::err_pair("invalid type")
                }
                OpenKind::File => {
                    vec![Value::Opaque(Rc::new(File::from_raw_fd(self.fd)))]
                }
                OpenKind::Stream => {
                    let write_only = self.flags & libc::O_ACCMODE == libc::O_WRONLY;
                    let read_write = self.flags & libc::O_ACCMODE == libc::O_RDWR;
                    if read_write {
                        let (is, os) = stream_pair(self.fd);
                        vec![
                            Value::Opaque(Rc::new(is)),
                            Value::Opaque(Rc::new(os)),
                        ]
                    } else if write_only {
                        vec![Value::Opaque(Rc::new(OStream::from_raw_fd(self.fd)))]
                    } else {
                        vec![Value::Opaque(Rc::new(IStream::from_raw_fd(self.fd)))]
                    }
                }
            }
        };

        rt.requeue(&pending.task, vals);
    }
}

/// Open `path` with an fopen-style mode string ("r", "w", "a", with "+",
/// "b", "x" suffixes). Runs on a worker thread; the task resumes with a
/// [`File`] handle for regular/block files, an [`IStream`]/[`OStream`]
/// (pair for "+") for sockets, chardevs, and FIFOs, or an error pair.
pub fn open(rt: &mut Runtime, path: &str, mode: &str) -> Progress {
    let Some(task) = rt.current() else {
        return Runtime::op_error("not in a task");
    };
    let Some(flags) = mode_to_flags(mode) else {
        return Runtime::op_error("invalid mode string");
    };
    let Ok(path) = CString::new(path) else {
        return Runtime::op_error("invalid path");
    };

    rt.add_pending(PendingWorker {
        task: task.clone(),
        resource: PendingResource::None,
    });
    let _ = rt.submit(Box::new(OpenJob {
        path,
        flags,
        owner: task.id(),
        fd: -1,
        kind: OpenKind::Invalid,
        errno: 0,
    }));
    task.set_wait(Wait::Worker);
    Progress::Suspended
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_to_flags() {
        assert_eq!(mode_to_flags("r"), Some(libc::O_RDONLY));
        assert_eq!(
            mode_to_flags("w"),
            Some(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)
        );
        assert_eq!(
            mode_to_flags("a+"),
            Some(libc::O_RDWR | libc::O_CREAT | libc::O_APPEND)
        );
        assert_eq!(
            mode_to_flags("wx"),
            Some(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL)
        );
        assert_eq!(mode_to_flags("rb"), Some(libc::O_RDONLY));
        assert_eq!(mode_to_flags("q"), None);
        assert_eq!(mode_to_flags(""), None);
    }

    #[test]
    fn test_closed_file_rejects_ops() {
        let mut rt = Runtime::new(crate::config::RuntimeConfig::default()).unwrap();
        let f = File(Rc::new(RefCell::new(FileSlot::Closed)));
        rt.spawn_fn(move |rt, _| {
            match f.readp(rt, Box::new(evma_core::parsers::Available)) {
                Progress::Complete(vals) => {
                    assert_eq!(vals[1].as_str(), Some("closed"));
                }
                Progress::Suspended => panic!("closed file must not suspend"),
            }
            crate::task::Outcome::Finished
        });
        rt.run();
    }
}
