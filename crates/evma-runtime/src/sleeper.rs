//! Timed suspension
//!
//! A sleeper is the degenerate bridge resource: a timer stands in for the
//! fd. Sleeping suspends the task; it is resumed either by the timer
//! firing (`[nil, "timeout"]`) or by another task calling `wakeup` with
//! replacement values — which path enqueued it tells the sleeper apart.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use evma_core::value::Value;

use crate::poller::TimerId;
use crate::runtime::Runtime;
use crate::task::{Progress, TaskHandle, Wait};

pub(crate) struct SleeperInner {
    owner: Option<TaskHandle>,
    timer: Option<TimerId>,
}

/// A reusable sleep/wakeup cell.
#[derive(Clone)]
pub struct Sleeper(Rc<RefCell<SleeperInner>>);

impl Sleeper {
    pub fn new() -> Sleeper {
        Sleeper(Rc::new(RefCell::new(SleeperInner {
            owner: None,
            timer: None,
        })))
    }

    /// True while a task is sleeping on this cell.
    pub fn busy(&self) -> bool {
        self.0.borrow().owner.is_some()
    }

    /// Suspend the current task for `delay` (or forever with `None`,
    /// until woken). Resumes with `[nil, "timeout"]` on expiry.
    ///
    /// A non-positive delay still yields the task once through the run
    /// queue before delivering the timeout.
    pub fn sleep(&self, rt: &mut Runtime, delay: Option<f64>) -> Progress {
        let Some(task) = rt.current() else {
            return Runtime::op_error("not in a task");
        };
        if self.0.borrow().owner.is_some() {
            return Runtime::op_error("busy");
        }

        if let Some(d) = delay {
            if d <= 0.0 {
                rt.requeue(&task, Value::err_pair("timeout"));
                return Progress::Suspended;
            }

            let inner = self.0.clone();
            let id = rt.poller.register_timer(
                Duration::from_secs_f64(d),
                Box::new(move |rt| timer_fired(rt, &inner)),
            );
            self.0.borrow_mut().timer = Some(id);
        }

        self.0.borrow_mut().owner = Some(task.clone());
        task.set_wait(Wait::Timer);
        Progress::Suspended
    }

    /// Wake the sleeping task early, resuming it with `vals` instead of
    /// the timeout pair. Returns `[true]`, or `[nil, "not sleeping"]`.
    pub fn wakeup(&self, rt: &mut Runtime, vals: Vec<Value>) -> Vec<Value> {
        let owner = {
            let mut s = self.0.borrow_mut();
            let Some(owner) = s.owner.take() else {
                return Value::err_pair("not sleeping");
            };
            if let Some(t) = s.timer.take() {
                rt.poller.cancel_timer(t);
            }
            owner
        };
        rt.requeue(&owner, vals);
        vec![Value::Bool(true)]
    }
}

impl Default for Sleeper {
    fn default() -> Self {
        Sleeper::new()
    }
}

fn timer_fired(rt: &mut Runtime, inner: &Rc<RefCell<SleeperInner>>) {
    let owner = {
        let mut s = inner.borrow_mut();
        s.timer = None;
        s.owner.take()
    };
    if let Some(owner) = owner {
        rt.requeue(&owner, Value::err_pair("timeout"));
    }
}
