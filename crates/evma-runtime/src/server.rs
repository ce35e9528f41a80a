//! Listening-socket resource
//!
//! Accepts connections through the reactor. `accept` hands back one
//! connection per call; `autospawn` keeps the registration alive and
//! spawns a fresh task per connection, resuming the listening task only if
//! accepting fails outright.

use std::cell::RefCell;
use std::net::TcpListener;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

use evma_core::error::{RtError, RtResult};
use evma_core::value::Value;
use evma_core::{kdebug, kwarn};

use crate::fdio::{self, errno_msg};
use crate::poller::{Interest, WatchId, WatchVerdict};
use crate::runtime::Runtime;
use crate::stream::{stream_pair, IStream, OStream};
use crate::task::{Progress, Task, TaskHandle, Wait};

pub(crate) struct ServerInner {
    fd: RawFd,
    owner: Option<TaskHandle>,
    watch: Option<WatchId>,
}

/// A listening socket.
#[derive(Clone)]
pub struct Server(Rc<RefCell<ServerInner>>);

/// One accept attempt.
enum AcceptStep {
    /// A connection, already non-blocking
    Conn(RawFd),

    /// Nothing usable now (would block, or one of the transient
    /// per-connection failures accept is allowed to shrug off)
    Retry,

    /// Hard failure
    Err(i32),
}

fn try_accept(fd: RawFd) -> AcceptStep {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            let sock = unsafe {
                libc::accept4(
                    fd,
                    core::ptr::null_mut(),
                    core::ptr::null_mut(),
                    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                )
            };
        } else {
            let sock = unsafe { libc::accept(fd, core::ptr::null_mut(), core::ptr::null_mut()) };
            if sock >= 0 {
                let _ = fdio::set_nonblocking(sock);
            }
        }
    }

    if sock >= 0 {
        return AcceptStep::Conn(sock);
    }

    match fdio::last_errno() {
        libc::EAGAIN
        | libc::EINTR
        | libc::ECONNABORTED
        | libc::ENETDOWN
        | libc::EPROTO
        | libc::EHOSTDOWN
        | libc::EHOSTUNREACH
        | libc::EOPNOTSUPP
        | libc::ENETUNREACH => AcceptStep::Retry,
        e => AcceptStep::Err(e),
    }
}

fn connection_values(sock: RawFd) -> Vec<Value> {
    let (is, os) = stream_pair(sock);
    vec![Value::Opaque(Rc::new(is)), Value::Opaque(Rc::new(os))]
}

impl Server {
    /// Wrap a bound-and-listening std listener.
    pub fn from_listener(listener: TcpListener) -> RtResult<Server> {
        listener
            .set_nonblocking(true)
            .map_err(|e| RtError::Os(e.raw_os_error().unwrap_or(0)))?;
        Ok(Server(Rc::new(RefCell::new(ServerInner {
            fd: listener.into_raw_fd(),
            owner: None,
            watch: None,
        }))))
    }

    /// Bind and listen on `addr` ("host:port").
    pub fn listen(addr: &str) -> RtResult<Server> {
        let listener =
            TcpListener::bind(addr).map_err(|e| RtError::Os(e.raw_os_error().unwrap_or(0)))?;
        Server::from_listener(listener)
    }

    pub fn closed(&self) -> bool {
        self.0.borrow().fd < 0
    }

    pub fn busy(&self) -> bool {
        self.0.borrow().owner.is_some()
    }

    /// Accept one connection; resumes with an `[istream, ostream]` pair.
    pub fn accept(&self, rt: &mut Runtime) -> Progress {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };

        let fd = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Runtime::op_error("closed");
            }
            if s.owner.is_some() {
                return Runtime::op_error("busy");
            }

            match try_accept(s.fd) {
                AcceptStep::Conn(sock) => {
                    return Progress::Complete(connection_values(sock));
                }
                AcceptStep::Err(e) => {
                    return Progress::Complete(vec![
                        Value::Nil,
                        Value::Str(format!("error accepting connection: {}", errno_msg(e))),
                    ]);
                }
                AcceptStep::Retry => {
                    s.owner = Some(task.clone());
                    s.fd
                }
            }
        };

        let inner = self.0.clone();
        let id = rt.poller.register(
            fd,
            Interest::Read,
            Box::new(move |rt| accept_ready(rt, &inner)),
        );
        self.0.borrow_mut().watch = Some(id);
        task.set_wait(Wait::Reactor);
        Progress::Suspended
    }

    /// Accept forever, spawning `factory(istream, ostream)` as a fresh task
    /// per connection. The listening task stays suspended and is resumed
    /// only with an error pair if accepting fails outright.
    pub fn autospawn<F>(&self, rt: &mut Runtime, factory: F) -> Progress
    where
        F: FnMut(IStream, OStream) -> Box<dyn Task> + 'static,
    {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };

        let fd = {
            let mut s = self.0.borrow_mut();
            if s.fd < 0 {
                return Runtime::op_error("closed");
            }
            if s.owner.is_some() {
                return Runtime::op_error("busy");
            }
            s.owner = Some(task.clone());
            s.fd
        };

        let inner = self.0.clone();
        let mut factory = factory;
        let id = rt.poller.register(
            fd,
            Interest::Read,
            Box::new(move |rt| autospawn_ready(rt, &inner, &mut factory)),
        );
        self.0.borrow_mut().watch = Some(id);
        task.set_wait(Wait::Reactor);
        Progress::Suspended
    }

    /// Force early resolution of an outstanding accept.
    pub fn interrupt(&self, rt: &mut Runtime) -> Vec<Value> {
        let owner = {
            let mut s = self.0.borrow_mut();
            let Some(owner) = s.owner.take() else {
                return Value::err_pair("not busy");
            };
            if let Some(w) = s.watch.take() {
                rt.poller.deregister(w);
            }
            owner
        };
        kdebug!("interrupting accept");
        rt.requeue(&owner, Value::err_pair("interrupted"));
        vec![Value::Bool(true)]
    }

    /// Close the listening socket, interrupting an outstanding accept
    /// first.
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
                owner
            })
        };
        if let Some(owner) = pending {
            kdebug!("interrupting accept before close");
            rt.requeue(&owner, Value::err_pair("interrupted"));
        }

        let fd = {
            let mut s = self.0.borrow_mut();
            let fd = s.fd;
            s.fd = -1;
            fd
        };
        match fdio::close_fd(fd) {
            Ok(()) => vec![Value::Bool(true)],
            Err(e) => vec![Value::Nil, Value::Str(errno_msg(e))],
        }
    }
}

fn accept_ready(rt: &mut Runtime, inner: &Rc<RefCell<ServerInner>>) -> WatchVerdict {
    let (owner, vals) = {
        let mut s = inner.borrow_mut();
        match try_accept(s.fd) {
            AcceptStep::Retry => return WatchVerdict::Keep,
            AcceptStep::Conn(sock) => {
                s.watch = None;
                (s.owner.take(), connection_values(sock))
            }
            AcceptStep::Err(e) => {
                s.watch = None;
                (
                    s.owner.take(),
                    vec![
                        Value::Nil,
                        Value::Str(format!("error accepting connection: {}", errno_msg(e))),
                    ],
                )
            }
        }
    };
    if let Some(owner) = owner {
        rt.requeue(&owner, vals);
    } else {
        kwarn!("accept completion with no owner");
    }
    WatchVerdict::Remove
}

fn autospawn_ready<F>(
    rt: &mut Runtime,
    inner: &Rc<RefCell<ServerInner>>,
    factory: &mut F,
) -> WatchVerdict
where
    F: FnMut(IStream, OStream) -> Box<dyn Task>,
{
    loop {
        let step = {
            let s = inner.borrow();
            if s.fd < 0 {
                return WatchVerdict::Remove;
            }
            try_accept(s.fd)
        };
        match step {
            AcceptStep::Retry => return WatchVerdict::Keep,
            AcceptStep::Conn(sock) => {
                let (is, os) = stream_pair(sock);
                rt.spawn(factory(is, os));
            }
            AcceptStep::Err(e) => {
                let owner = {
                    let mut s = inner.borrow_mut();
                    s.watch = None;
                    s.owner.take()
                };
                if let Some(owner) = owner {
                    rt.requeue(
                        &owner,
                        vec![
                            Value::Nil,
                            Value::Str(format!("error accepting connection: {}", errno_msg(e))),
                        ],
                    );
                }
                return WatchVerdict::Remove;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_and_state_accessors() {
        let srv = Server::listen("127.0.0.1:0").expect("bind");
        assert!(!srv.closed());
        assert!(!srv.busy());
    }
}
