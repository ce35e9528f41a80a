//! Worker pool for blocking syscalls
//!
//! A bounded-growth, bounded-shrink set of OS threads draining a shared job
//! list. Workers exist solely to run blocking work off the scheduler
//! thread; they never touch application state, only the opaque job they
//! were handed.
//!
//! Protocol per job:
//! 1. the scheduler appends it to the pending list (O(1) tail append) and
//!    possibly spawns one thread;
//! 2. exactly one worker detaches it and runs its blocking `work`;
//! 3. the worker pushes it onto the done list (spinlock, pointer moves
//!    only) and signals the scheduler through the wakeup fd;
//! 4. the scheduler swaps the whole done list out and runs each job's
//!    `reap` with no locks held. `reap` is the only place results re-enter
//!    scheduler-owned state.
//!
//! Sizing policy: a thread above the configured floor that finds no work
//! within `delay` exits; threads at or below the floor wait forever.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use evma_core::error::{RtError, RtResult};
use evma_core::kdebug;
use evma_core::spinlock::SpinLock;

use crate::fdio::last_errno;
use crate::poller::WatchId;
use crate::runtime::Runtime;

/// One unit of blocking work plus its completion reaction.
pub trait AsyncJob: Send {
    /// Runs on a worker thread. The only place blocking syscalls happen.
    fn work(&mut self);

    /// Runs on the scheduler thread after `work` completes. Typically
    /// enqueues the owning task with result values; may resubmit the job.
    fn reap(self: Box<Self>, rt: &mut Runtime);
}

/// Cross-thread wakeup channel the event loop can poll.
///
/// Multiple signals before a drain coalesce into one wakeup.
pub(crate) struct WakeupFd {
    read_fd: RawFd,
    write_fd: RawFd,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        impl WakeupFd {
            pub fn new() -> RtResult<WakeupFd> {
                let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if fd < 0 {
                    return Err(RtError::WakeupSetup(last_errno()));
                }
                Ok(WakeupFd { read_fd: fd, write_fd: fd })
            }
        }
    } else {
        impl WakeupFd {
            pub fn new() -> RtResult<WakeupFd> {
                let mut fds = [0 as RawFd; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                    return Err(RtError::WakeupSetup(last_errno()));
                }
                for fd in fds {
                    unsafe {
                        libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                }
                Ok(WakeupFd { read_fd: fds[0], write_fd: fds[1] })
            }
        }
    }
}

impl WakeupFd {
    /// The fd the event loop watches for readability.
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.read_fd
    }

    /// Wake the scheduler. Called from worker threads.
    ///
    /// EAGAIN means a signal is already pending, which is exactly as good.
    pub fn signal(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                core::mem::size_of::<u64>(),
            );
        }
    }

    /// Clear pending signals before reaping.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
            // A pipe may hold more than one token; an eventfd never does
            if (n as usize) < buf.len() {
                break;
            }
        }
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

/// Pending-list state guarded by the pool mutex.
pub(crate) struct PoolState {
    pub jobs: VecDeque<Box<dyn AsyncJob>>,
    pub threads: usize,
    pub min: usize,
    pub max: usize,
    pub delay: Duration,
    pub shutdown: bool,
}

/// State shared between the scheduler thread and the workers.
pub(crate) struct PoolShared {
    pub q: Mutex<PoolState>,
    pub cond: Condvar,
    /// Completed jobs; swapped out wholesale by the scheduler
    pub done: SpinLock<Vec<Box<dyn AsyncJob>>>,
    pub wakeup: WakeupFd,
}

/// Scheduler-side pool handle. The in-flight counter and wakeup watch are
/// only ever touched on the scheduler thread.
pub(crate) struct Pool {
    pub shared: Arc<PoolShared>,
    /// Jobs submitted and not yet reaped
    pub in_flight: usize,
    /// Wakeup-fd registration while jobs are in flight
    pub watch: Option<WatchId>,
}

impl Pool {
    pub fn new(delay: Duration, min: usize, max: usize) -> RtResult<Pool> {
        Ok(Pool {
            shared: Arc::new(PoolShared {
                q: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    threads: 0,
                    min,
                    max,
                    delay,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                done: SpinLock::new(Vec::new()),
                wakeup: WakeupFd::new()?,
            }),
            in_flight: 0,
            watch: None,
        })
    }

    /// Spawn one worker thread. The caller has already incremented the
    /// live-thread count under the lock.
    pub fn spawn_thread(shared: Arc<PoolShared>) -> RtResult<()> {
        std::thread::Builder::new()
            .name("evma-worker".into())
            .spawn(move || worker_loop(shared))
            .map(drop)
            .map_err(RtError::ThreadSpawn)
    }

    /// Current live thread count.
    pub fn threads(&self) -> usize {
        self.shared.q.lock().unwrap().threads
    }

    /// Ask every worker to exit once the pending list drains.
    pub fn shutdown(&self) {
        self.shared.q.lock().unwrap().shutdown = true;
        self.shared.cond.notify_all();
    }
}

/// Main loop of one worker thread.
fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let mut job = {
            let mut guard = shared.q.lock().unwrap();
            loop {
                if guard.shutdown {
                    guard.threads -= 1;
                    return;
                }
                if let Some(job) = guard.jobs.pop_front() {
                    break job;
                }
                if guard.threads <= guard.min {
                    // At or below the floor: never self-terminate
                    guard = shared.cond.wait(guard).unwrap();
                    continue;
                }
                let delay = guard.delay;
                let (g, res) = shared.cond.wait_timeout(guard, delay).unwrap();
                guard = g;
                if res.timed_out()
                    && guard.jobs.is_empty()
                    && !guard.shutdown
                    && guard.threads > guard.min
                {
                    guard.threads -= 1;
                    return;
                }
            }
        };

        kdebug!("running job");
        job.work();

        shared.done.lock().push(job);
        shared.wakeup.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountJob(Arc<AtomicUsize>);

    impl AsyncJob for CountJob {
        fn work(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn reap(self: Box<Self>, _rt: &mut Runtime) {}
    }

    #[test]
    fn test_wakeup_signal_drain() {
        let w = WakeupFd::new().unwrap();
        w.signal();
        w.signal();
        w.drain();
        // Drained: a read now would block; just ensure drain again is a no-op
        w.drain();
    }

    #[test]
    fn test_worker_runs_job_and_pushes_done() {
        let pool = Pool::new(Duration::from_secs(1), 0, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let mut st = pool.shared.q.lock().unwrap();
            st.jobs.push_back(Box::new(CountJob(counter.clone())));
            st.threads += 1;
        }
        Pool::spawn_thread(pool.shared.clone()).unwrap();
        pool.shared.cond.notify_one();

        // Wait for the job to land on the done list
        let mut spins = 0;
        loop {
            if !pool.shared.done.lock().is_empty() {
                break;
            }
            spins += 1;
            assert!(spins < 500, "job never completed");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn test_idle_worker_above_floor_exits() {
        let pool = Pool::new(Duration::from_millis(50), 0, 4).unwrap();
        {
            let mut st = pool.shared.q.lock().unwrap();
            st.threads += 1;
        }
        Pool::spawn_thread(pool.shared.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.threads(), 0);
    }
}
