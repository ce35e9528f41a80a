//! Readiness bookkeeping for the event loop
//!
//! Tracks fd watches (read/write interest plus a resumption callback) and
//! one-shot timers. The loop in `runtime` snapshots the active watches into
//! a `pollfd` array, sleeps in `poll(2)`, then dispatches whatever fired.
//!
//! Watch ids are generation-stamped so a slot freed and reused during a
//! dispatch round can never be confused with the watch that was armed when
//! the round began.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::runtime::Runtime;

/// Readiness condition a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// What a readiness callback wants done with its watch afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchVerdict {
    /// Stay registered; fire again on the next readiness.
    Keep,

    /// Deregister; the operation completed or failed.
    Remove,
}

pub(crate) type FdCallback = Box<dyn FnMut(&mut Runtime) -> WatchVerdict>;
pub(crate) type TimerCallback = Box<dyn FnOnce(&mut Runtime)>;

/// Handle to a registered fd watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchId {
    idx: u32,
    gen: u32,
}

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

enum SlotState {
    Free,
    Active(FdCallback),
    /// Callback temporarily taken out for dispatch
    Running,
    /// Deregistered while its callback was running
    Cancelled,
}

struct Slot {
    gen: u32,
    fd: RawFd,
    interest: Interest,
    state: SlotState,
}

pub(crate) struct Poller {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Watches alive (Active, Running, or Cancelled-pending-cleanup)
    active: usize,
    /// Min-heap of (deadline, timer id); stale entries are skipped lazily
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_cbs: HashMap<u64, TimerCallback>,
    next_timer: u64,
}

impl Poller {
    pub fn new() -> Self {
        Poller {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
            timers: BinaryHeap::new(),
            timer_cbs: HashMap::new(),
            next_timer: 0,
        }
    }

    /// True if any fd watch is alive.
    #[inline]
    pub fn has_watches(&self) -> bool {
        self.active > 0
    }

    /// True if any timer is pending.
    #[inline]
    pub fn has_timers(&self) -> bool {
        !self.timer_cbs.is_empty()
    }

    /// Register interest in `fd`; `cb` runs on readiness.
    pub fn register(&mut self, fd: RawFd, interest: Interest, cb: FdCallback) -> WatchId {
        self.active += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.fd = fd;
            slot.interest = interest;
            slot.state = SlotState::Active(cb);
            WatchId { idx, gen: slot.gen }
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                gen: 0,
                fd,
                interest,
                state: SlotState::Active(cb),
            });
            WatchId { idx, gen: 0 }
        }
    }

    /// Drop a watch. Safe against stale ids; returns whether it was alive.
    pub fn deregister(&mut self, id: WatchId) -> bool {
        let Some(slot) = self.slots.get_mut(id.idx as usize) else {
            return false;
        };
        if slot.gen != id.gen {
            return false;
        }
        match slot.state {
            SlotState::Active(_) => {
                slot.state = SlotState::Free;
                self.free_slot(id.idx);
                true
            }
            SlotState::Running => {
                // Mid-dispatch: the loop finishes the cleanup
                slot.state = SlotState::Cancelled;
                true
            }
            _ => false,
        }
    }

    fn free_slot(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.gen = slot.gen.wrapping_add(1);
        slot.fd = -1;
        self.free.push(idx);
        self.active -= 1;
    }

    /// Snapshot the active watches for one poll round.
    pub fn fill_pollfds(&self, pfds: &mut Vec<libc::pollfd>, ids: &mut Vec<WatchId>) {
        pfds.clear();
        ids.clear();
        for (idx, slot) in self.slots.iter().enumerate() {
            if let SlotState::Active(_) = slot.state {
                let events = match slot.interest {
                    Interest::Read => libc::POLLIN,
                    Interest::Write => libc::POLLOUT,
                };
                pfds.push(libc::pollfd {
                    fd: slot.fd,
                    events,
                    revents: 0,
                });
                ids.push(WatchId {
                    idx: idx as u32,
                    gen: slot.gen,
                });
            }
        }
    }

    /// Take a watch's callback out for dispatch. `None` if the watch died
    /// since the poll snapshot was taken.
    pub fn begin_dispatch(&mut self, id: WatchId) -> Option<FdCallback> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        match core::mem::replace(&mut slot.state, SlotState::Running) {
            SlotState::Active(cb) => Some(cb),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Put a callback back (or drop the watch) after dispatch.
    pub fn end_dispatch(&mut self, id: WatchId, cb: FdCallback, verdict: WatchVerdict) {
        let Some(slot) = self.slots.get_mut(id.idx as usize) else {
            return;
        };
        if slot.gen != id.gen {
            return;
        }
        match slot.state {
            SlotState::Cancelled => {
                slot.state = SlotState::Free;
                self.free_slot(id.idx);
            }
            SlotState::Running => match verdict {
                WatchVerdict::Keep => slot.state = SlotState::Active(cb),
                WatchVerdict::Remove => {
                    slot.state = SlotState::Free;
                    self.free_slot(id.idx);
                }
            },
            _ => {}
        }
    }

    /// Arm a one-shot timer.
    pub fn register_timer(&mut self, delay: Duration, cb: TimerCallback) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Reverse((Instant::now() + delay, id)));
        self.timer_cbs.insert(id, cb);
        TimerId(id)
    }

    /// Cancel a timer before it fires. Returns whether it was still armed.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        // The heap entry goes stale and is skipped when it surfaces
        self.timer_cbs.remove(&id.0).is_some()
    }

    /// Deadline of the nearest armed timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((when, id))) = self.timers.peek().copied() {
            if self.timer_cbs.contains_key(&id) {
                return Some(when);
            }
            self.timers.pop();
        }
        None
    }

    /// Detach every timer due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(Reverse((when, id))) = self.timers.peek().copied() {
            if when > now {
                break;
            }
            self.timers.pop();
            if let Some(cb) = self.timer_cbs.remove(&id) {
                due.push(cb);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FdCallback {
        Box::new(|_| WatchVerdict::Remove)
    }

    #[test]
    fn test_register_deregister() {
        let mut p = Poller::new();
        assert!(!p.has_watches());

        let id = p.register(0, Interest::Read, noop());
        assert!(p.has_watches());
        assert!(p.deregister(id));
        assert!(!p.has_watches());

        // Stale id is rejected
        assert!(!p.deregister(id));
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut p = Poller::new();
        let a = p.register(0, Interest::Read, noop());
        p.deregister(a);
        let b = p.register(1, Interest::Write, noop());
        assert!(!p.deregister(a));
        assert!(p.deregister(b));
    }

    #[test]
    fn test_fill_pollfds_skips_freed() {
        let mut p = Poller::new();
        let a = p.register(3, Interest::Read, noop());
        let _b = p.register(4, Interest::Write, noop());
        p.deregister(a);

        let mut pfds = Vec::new();
        let mut ids = Vec::new();
        p.fill_pollfds(&mut pfds, &mut ids);
        assert_eq!(pfds.len(), 1);
        assert_eq!(pfds[0].fd, 4);
        assert_eq!(pfds[0].events, libc::POLLOUT);
    }

    #[test]
    fn test_cancelled_while_running_is_freed_on_end() {
        let mut p = Poller::new();
        let id = p.register(5, Interest::Read, noop());
        let cb = p.begin_dispatch(id).unwrap();
        assert!(p.deregister(id));
        p.end_dispatch(id, cb, WatchVerdict::Keep);
        assert!(!p.has_watches());
    }

    #[test]
    fn test_timer_cancel_goes_stale() {
        let mut p = Poller::new();
        let t1 = p.register_timer(Duration::from_millis(10), Box::new(|_| {}));
        let _t2 = p.register_timer(Duration::from_millis(20), Box::new(|_| {}));
        assert!(p.cancel_timer(t1));
        assert!(!p.cancel_timer(t1));

        // t1's heap entry is skipped; the nearest deadline is t2's
        let dl = p.next_deadline().unwrap();
        assert!(dl >= Instant::now());
        let due = p.take_due(Instant::now() + Duration::from_millis(50));
        assert_eq!(due.len(), 1);
        assert!(!p.has_timers());
    }
}
