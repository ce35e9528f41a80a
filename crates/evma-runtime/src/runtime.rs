//! The scheduler and event loop
//!
//! One `Runtime` owns everything: the run queue, the poller, the worker
//! pool, and the bookkeeping for suspended tasks. Exactly one OS thread
//! drives it; worker threads only ever touch the jobs they were handed.
//!
//! The loop interleaves three duties per iteration: sleep in `poll(2)`
//! until something is ready (zero timeout while resumptions are pending),
//! dispatch readiness and timer callbacks, and drain one run-queue entry.
//! Draining one entry per iteration keeps I/O dispatch interleaved with
//! task execution under load.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use evma_core::error::{RtError, RtResult};
use evma_core::id::TaskId;
use evma_core::value::Value;
use evma_core::{kdebug, kerror};

use crate::config::RuntimeConfig;
use crate::fdio::{errno_msg, last_errno};
use crate::file::FileSlot;
use crate::poller::{Interest, Poller, WatchId, WatchVerdict};
use crate::pool::{AsyncJob, Pool};
use crate::runqueue::RunQueue;
use crate::task::{Outcome, Progress, Task, TaskHandle, TaskRecord, Wait};

/// Clean exit status
pub const EXIT_SUCCESS: i32 = 0;

/// Fatal-error exit status
pub const EXIT_FAILURE: i32 = 1;

/// Scheduler-side record of a task suspended on a worker job, holding the
/// strong task handle and the resource whose guts travelled into the job.
pub(crate) struct PendingWorker {
    pub task: TaskHandle,
    pub resource: PendingResource,
}

pub(crate) enum PendingResource {
    /// Nothing to hand back (e.g. an open in progress)
    None,

    /// A file whose fd and buffer are inside the job
    File(Rc<RefCell<FileSlot>>),
}

/// The event machine.
pub struct Runtime {
    rq: RunQueue,
    pub(crate) poller: Poller,
    pub(crate) pool: Pool,
    pending: HashMap<TaskId, PendingWorker>,
    current: Option<TaskHandle>,
    err_handler: Option<Rc<dyn Fn(Value) -> Box<dyn Task>>>,
    next_task: u64,
    stop: Option<i32>,
}

impl Runtime {
    /// Build a runtime. Fails on invalid configuration or if the pool's
    /// wakeup channel cannot be created; both are startup-fatal.
    pub fn new(config: RuntimeConfig) -> RtResult<Runtime> {
        config.validate().map_err(RtError::InvalidConfig)?;

        #[cfg(unix)]
        {
            use nix::sys::signal::{signal, SigHandler, Signal};
            // A peer closing mid-write must surface as EPIPE, not kill us
            unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
                .map_err(|e| RtError::Os(e as i32))?;
        }

        let mut rt = Runtime {
            rq: RunQueue::new(),
            poller: Poller::new(),
            pool: Pool::new(config.pool_delay, config.pool_min, config.pool_max)?,
            pending: HashMap::new(),
            current: None,
            err_handler: None,
            next_task: 0,
            stop: None,
        };

        if config.pool_min > 0 {
            rt.configure_pool(config.pool_delay, config.pool_min, config.pool_max)?;
        }

        Ok(rt)
    }

    // ---- tasks ----------------------------------------------------------

    /// Spawn a new logical thread; it runs on the next drain step.
    pub fn spawn(&mut self, body: Box<dyn Task>) -> TaskHandle {
        let id = TaskId::new(self.next_task);
        self.next_task += 1;
        let task = TaskRecord::new(id, body);
        kdebug!("spawned task {}", id);
        // A fresh task cannot be queued yet
        let _ = self.enqueue(&task, Vec::new());
        task
    }

    /// Spawn from a closure.
    pub fn spawn_fn<F>(&mut self, f: F) -> TaskHandle
    where
        F: FnMut(&mut Runtime, Vec<Value>) -> Outcome + 'static,
    {
        self.spawn(Box::new(f))
    }

    /// The task currently being resumed, if any.
    pub fn current(&self) -> Option<TaskHandle> {
        self.current.clone()
    }

    /// Append a pending resumption.
    ///
    /// A task may be in the run queue at most once; a second enqueue before
    /// it runs is a contract violation reported as `AlreadyQueued`.
    pub fn enqueue(&mut self, task: &TaskHandle, vals: Vec<Value>) -> RtResult<()> {
        if !task.mark_queued() {
            return Err(RtError::AlreadyQueued);
        }
        kdebug!("enqueueing task {} with {} arguments", task.id(), vals.len());
        let nargs = vals.len();
        task.set_args(vals);
        self.rq.push(task.clone(), nargs);
        Ok(())
    }

    /// Bridge-internal enqueue: the busy-rejection protocol makes a double
    /// enqueue impossible here, so one happening means a broken invariant.
    pub(crate) fn requeue(&mut self, task: &TaskHandle, vals: Vec<Value>) {
        if self.enqueue(task, vals).is_err() {
            kerror!("task {} enqueued twice", task.id());
            self.exit(EXIT_FAILURE);
        }
    }

    /// Resume another task with the given values.
    ///
    /// Returns `[true]`, or `[nil, "already queued"]` if the target is
    /// already pending.
    pub fn resume(&mut self, target: &TaskHandle, vals: Vec<Value>) -> Vec<Value> {
        match self.enqueue(target, vals) {
            Ok(()) => vec![Value::Bool(true)],
            Err(_) => Value::err_pair("already queued"),
        }
    }

    /// Re-enqueue the current task and hand control back to the scheduler.
    /// The caller must return [`Outcome::Suspended`] afterwards.
    pub fn yield_now(&mut self) {
        if let Some(task) = self.current.clone() {
            // Already queued (self-resumed) is fine: it will run again
            let _ = self.enqueue(&task, Vec::new());
        }
    }

    /// Park the current task until something holding its handle calls
    /// [`resume`](Runtime::resume). The caller must return
    /// [`Outcome::Suspended`] afterwards.
    pub fn park(&mut self) {
        if let Some(task) = self.current.as_ref() {
            task.set_wait(Wait::Parked);
        }
    }

    /// Install the uncaught-error handler: a factory invoked with the error
    /// value, returning a fresh task to run. With no handler installed an
    /// uncaught error is fatal to the loop.
    pub fn set_error_handler<F>(&mut self, f: F)
    where
        F: Fn(Value) -> Box<dyn Task> + 'static,
    {
        self.err_handler = Some(Rc::new(f));
    }

    /// Remove the uncaught-error handler.
    pub fn clear_error_handler(&mut self) {
        self.err_handler = None;
    }

    /// Request loop shutdown with the given status.
    pub fn exit(&mut self, status: i32) {
        self.stop = Some(status);
    }

    // ---- worker pool ----------------------------------------------------

    /// Hand a blocking job to the worker pool. Never blocks; spawns one
    /// worker if the backlog outgrew the live threads and the cap allows.
    /// Worker-spawn failure is fatal to the loop.
    pub fn submit(&mut self, job: Box<dyn AsyncJob>) -> RtResult<()> {
        if self.pool.watch.is_none() {
            let fd = self.pool.shared.wakeup.raw();
            let id = self.poller.register(
                fd,
                Interest::Read,
                Box::new(|rt| {
                    rt.reap_done();
                    WatchVerdict::Keep
                }),
            );
            self.pool.watch = Some(id);
        }
        self.pool.in_flight += 1;

        let spawn = {
            let mut st = self.pool.shared.q.lock().unwrap();
            st.jobs.push_back(job);
            if self.pool.in_flight > st.threads && st.threads < st.max {
                st.threads += 1;
                true
            } else {
                false
            }
        };
        self.pool.shared.cond.notify_one();

        if spawn {
            if let Err(e) = Pool::spawn_thread(self.pool.shared.clone()) {
                kerror!("{}", e);
                self.exit(EXIT_FAILURE);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Update pool sizing. May spawn threads up to the new floor right
    /// away; shrinking only happens through idle timeouts.
    pub fn configure_pool(&mut self, delay: Duration, min: usize, max: usize) -> RtResult<()> {
        if max == 0 {
            return Err(RtError::InvalidConfig("pool max must be at least 1"));
        }
        if max < min {
            return Err(RtError::InvalidConfig("pool max must not be below pool min"));
        }

        let spawn = {
            let mut st = self.pool.shared.q.lock().unwrap();
            st.delay = delay;
            st.min = min;
            st.max = max;
            let need = min.saturating_sub(st.threads);
            st.threads += need;
            need
        };

        for _ in 0..spawn {
            if let Err(e) = Pool::spawn_thread(self.pool.shared.clone()) {
                kerror!("{}", e);
                self.exit(EXIT_FAILURE);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Live worker-thread count.
    pub fn pool_threads(&self) -> usize {
        self.pool.threads()
    }

    /// Jobs submitted and not yet reaped.
    pub fn pool_in_flight(&self) -> usize {
        self.pool.in_flight
    }

    /// Drain the done list: run each completed job's reaction on this
    /// thread, then stop watching the wakeup fd once nothing is in flight.
    fn reap_done(&mut self) {
        self.pool.shared.wakeup.drain();
        let done: Vec<Box<dyn AsyncJob>> = core::mem::take(&mut *self.pool.shared.done.lock());
        for job in done {
            self.pool.in_flight -= 1;
            job.reap(self);
        }
        if self.pool.in_flight == 0 {
            if let Some(id) = self.pool.watch.take() {
                self.poller.deregister(id);
            }
        }
    }

    pub(crate) fn add_pending(&mut self, pending: PendingWorker) {
        self.pending.insert(pending.task.id(), pending);
    }

    pub(crate) fn take_pending(&mut self, id: TaskId) -> Option<PendingWorker> {
        self.pending.remove(&id)
    }

    // ---- the loop -------------------------------------------------------

    /// Drive the machine until nothing can make progress anymore or
    /// [`exit`](Runtime::exit) is called. Returns the exit status.
    pub fn run(&mut self) -> i32 {
        let mut pfds: Vec<libc::pollfd> = Vec::new();
        let mut ids: Vec<WatchId> = Vec::new();

        loop {
            if let Some(status) = self.stop.take() {
                kdebug!("loop stopped with status {}", status);
                return status;
            }

            // Out of work entirely: the machine is done. In-flight jobs
            // keep the wakeup watch registered, so they count as work.
            if self.rq.is_empty() && !self.poller.has_watches() && !self.poller.has_timers() {
                return EXIT_SUCCESS;
            }

            let timeout_ms: i32 = if !self.rq.is_empty() {
                0
            } else if let Some(deadline) = self.poller.next_deadline() {
                let now = Instant::now();
                if deadline <= now {
                    0
                } else {
                    deadline
                        .duration_since(now)
                        .as_millis()
                        .saturating_add(1)
                        .min(i32::MAX as u128) as i32
                }
            } else {
                -1
            };

            self.poller.fill_pollfds(&mut pfds, &mut ids);
            let n = unsafe {
                libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms)
            };
            if n < 0 {
                let e = last_errno();
                if e != libc::EINTR {
                    kerror!("poll failed: {}", errno_msg(e));
                    return EXIT_FAILURE;
                }
            } else if n > 0 {
                for i in 0..pfds.len() {
                    if pfds[i].revents != 0 {
                        self.dispatch_watch(ids[i]);
                    }
                }
            }

            let due = self.poller.take_due(Instant::now());
            for cb in due {
                cb(self);
            }

            self.drain_one();
        }
    }

    fn dispatch_watch(&mut self, id: WatchId) {
        // The watch may have died earlier in this dispatch round
        let Some(mut cb) = self.poller.begin_dispatch(id) else {
            return;
        };
        let verdict = cb(self);
        self.poller.end_dispatch(id, cb, verdict);
    }

    /// Pop and resume the oldest pending task.
    fn drain_one(&mut self) {
        let Some((task, nargs)) = self.rq.pop() else {
            return;
        };
        task.clear_queued();
        let args = task.take_args();
        debug_assert_eq!(args.len(), nargs);

        kdebug!("resuming task {} with {} arguments", task.id(), nargs);
        self.current = Some(task.clone());
        let outcome = {
            let mut body = task.body.borrow_mut();
            body.resume(self, args)
        };
        self.current = None;

        match outcome {
            Outcome::Finished => {
                kdebug!("task {} finished", task.id());
                // Last strong handle drops with the queue entry
            }
            Outcome::Suspended => {
                // The wait must have been arranged during the resume;
                // "suspended on nothing" is a broken invariant.
                if !task.is_queued() && task.wait() == Wait::None {
                    kerror!("task {} suspended without a pending wait", task.id());
                    self.exit(EXIT_FAILURE);
                }
            }
            Outcome::Errored(err) => {
                kdebug!("task {} errored", task.id());
                self.dispatch_error(err);
            }
        }
    }

    fn dispatch_error(&mut self, err: Value) {
        match self.err_handler.clone() {
            Some(handler) => {
                let body = handler(err);
                let _ = self.spawn(body);
            }
            None => {
                kerror!("uncaught task error: {:?}", err);
                self.exit(EXIT_FAILURE);
            }
        }
    }

    /// Fast-path helper for operations: complete with an error-value pair.
    pub(crate) fn op_error(msg: &'static str) -> Progress {
        Progress::Complete(Value::err_pair(msg))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
