//! Scheduling strategies. Exactly one of the `policy-*` Cargo features is
//! enabled for any given build; `ActivePolicy` resolves to whichever one it
//! is. This replaces the source's `#ifdef SCHEDULER==...` sprawl with a
//! single trait and one small struct per policy.
//!
//! Every `pick()` returns the chosen slot's index with its lock already
//! held (mirroring the scan-acquire-compare-release discipline a spinlock
//! based process table requires); `None` means nothing runnable and no
//! lock is held.

use crate::param::NPROC;
use crate::proc::{Proc, Procstate, PROCS, TICKS};

pub trait SchedPolicy {
    /// Called whenever a slot transitions into RUNNABLE (fork, wakeup,
    /// yield_, kill-induced wake). The slot's lock is held by the caller.
    fn on_become_runnable(_idx: usize) {}

    /// Called whenever a slot transitions into RUNNING, just after
    /// `scheduler()` picks it. The slot's lock is held by the caller.
    fn on_become_running(_idx: usize) {}

    /// Called on every timer tick while `idx` is the running process.
    /// Returns whether the caller should yield the CPU. Acquires and
    /// releases the slot's lock itself; the caller must not be holding it.
    fn on_tick(_idx: usize) -> bool {
        false
    }

    /// Called once per tick (by `clockintr` on CPU 0), independent of
    /// which process if any is running. Most policies have nothing to do
    /// here; MLFQ uses it for ageing.
    fn on_global_tick() {}

    /// Scan the process table for the next process to run, returning its
    /// index with the slot lock held, or `None` if nothing is RUNNABLE.
    fn pick() -> Option<usize>;
}

pub struct Rr;
pub struct Fcfs;
#[cfg(feature = "policy-lbs")]
pub struct Lbs;
#[cfg(feature = "policy-pbs")]
pub struct Pbs;
#[cfg(feature = "policy-mlfq")]
pub struct Mlfq;

impl SchedPolicy for Rr {
    fn on_tick(_idx: usize) -> bool {
        true
    }

    fn pick() -> Option<usize> {
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            if p.runnable() {
                return Some(i);
            }
            p.lock.release();
        }
        None
    }
}

impl SchedPolicy for Fcfs {
    fn pick() -> Option<usize> {
        let mut best: Option<usize> = None;

        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();

            if p.runnable() {
                let take = match best {
                    None => true,
                    Some(b) => p.in_tick < unsafe { PROCS[b].in_tick },
                };
                if take {
                    if let Some(b) = best {
                        unsafe { PROCS[b].lock.release() };
                    }
                    best = Some(i);
                    continue;
                }
            }
            p.lock.release();
        }

        best
    }
}

#[cfg(feature = "policy-lbs")]
mod lbs {
    use super::*;
    use crate::proc::{rand, TOTAL_TICKETS};

    impl SchedPolicy for Lbs {
        fn on_become_runnable(idx: usize) {
            let tickets = unsafe { PROCS[idx].tickets } as i64;
            unsafe {
                TOTAL_TICKETS += tickets;
            }
        }

        fn on_become_running(idx: usize) {
            let tickets = unsafe { PROCS[idx].tickets } as i64;
            unsafe {
                TOTAL_TICKETS -= tickets;
            }
        }

        fn on_tick(_idx: usize) -> bool {
            true
        }

        fn pick() -> Option<usize> {
            let total = unsafe { TOTAL_TICKETS };
            if total < 0 {
                panic!("lbs: negative ticket total");
            }
            if total == 0 {
                return None;
            }

            let x = rand().rem_euclid(total) + 1;
            let mut prefix: i64 = 0;
            let mut winner = None;

            for i in 0..NPROC {
                let p = unsafe { &mut PROCS[i] };
                p.lock.acquire();

                if p.runnable() {
                    prefix += p.tickets as i64;
                    if x <= prefix {
                        winner = Some(i);
                        continue;
                    }
                }
                p.lock.release();
            }

            winner
        }
    }
}

#[cfg(feature = "policy-pbs")]
mod pbs {
    use super::*;

    fn dynamic_priority(p: &Proc) -> i32 {
        let niceness = if p.num_sched == 0 {
            5
        } else {
            let denom = p.running_ticks + p.sleeping_ticks;
            if denom == 0 {
                5
            } else {
                ((p.sleeping_ticks * 10) / denom) as i32
            }
        };
        (p.priority - niceness + 5).clamp(0, 100)
    }

    impl SchedPolicy for Pbs {
        fn on_become_running(idx: usize) {
            let p = unsafe { &mut PROCS[idx] };
            p.num_sched += 1;
            p.running_ticks = 0;
            p.sleeping_ticks = 0;
        }

        fn pick() -> Option<usize> {
            let mut best: Option<usize> = None;

            for i in 0..NPROC {
                let p = unsafe { &mut PROCS[i] };
                p.lock.acquire();

                if p.runnable() {
                    let key = (dynamic_priority(p), p.num_sched, p.in_tick);
                    let take = match best {
                        None => true,
                        Some(b) => {
                            let bp = unsafe { &PROCS[b] };
                            key < (dynamic_priority(bp), bp.num_sched, bp.in_tick)
                        }
                    };
                    if take {
                        if let Some(b) = best {
                            unsafe { PROCS[b].lock.release() };
                        }
                        best = Some(i);
                        continue;
                    }
                }
                p.lock.release();
            }

            best
        }
    }
}

#[cfg(feature = "policy-mlfq")]
mod mlfq {
    use super::*;
    use crate::param::MLFQ_AGE_LIMIT;

    impl SchedPolicy for Mlfq {
        fn on_become_runnable(idx: usize) {
            let p = unsafe { &mut PROCS[idx] };
            p.num_ticks = 0;
            p.last_tick = unsafe { TICKS };
        }

        fn on_tick(idx: usize) -> bool {
            let p = unsafe { &mut PROCS[idx] };
            p.lock.acquire();
            p.num_ticks += 1;
            let quantum = 1u64 << p.queue;
            let mut yield_now = false;

            if p.num_ticks >= quantum && p.queue < 4 {
                p.queue += 1;
                p.num_ticks = 0;
                p.last_tick = unsafe { TICKS };
                yield_now = true;
            }
            let my_queue = p.queue;
            p.lock.release();

            if yield_now {
                return true;
            }

            // Even before the quantum expires, a RUNNABLE process in a
            // strictly higher-priority queue preempts.
            for i in 0..NPROC {
                if i == idx {
                    continue;
                }
                let q = unsafe { &mut PROCS[i] };
                q.lock.acquire();
                let better = q.runnable() && q.queue < my_queue;
                q.lock.release();
                if better {
                    return true;
                }
            }

            false
        }

        fn on_global_tick() {
            let now = unsafe { TICKS };
            for i in 0..NPROC {
                let p = unsafe { &mut PROCS[i] };
                p.lock.acquire();
                if p.runnable() && p.queue > 0 {
                    let since_runnable = now - p.in_tick;
                    let quantum = 1u64 << p.queue;
                    if p.queue < 4 && since_runnable >= quantum {
                        p.queue -= 1;
                        p.in_tick = now;
                    } else if now - p.last_tick >= MLFQ_AGE_LIMIT {
                        p.queue -= 1;
                        p.last_tick = now;
                    }
                }
                p.lock.release();
            }
        }

        fn pick() -> Option<usize> {
            let mut best: Option<usize> = None;

            for i in 0..NPROC {
                let p = unsafe { &mut PROCS[i] };
                p.lock.acquire();

                if p.runnable() {
                    let key = (p.queue, p.in_tick);
                    let take = match best {
                        None => true,
                        Some(b) => {
                            let bp = unsafe { &PROCS[b] };
                            key < (bp.queue, bp.in_tick)
                        }
                    };
                    if take {
                        if let Some(b) = best {
                            unsafe { PROCS[b].lock.release() };
                        }
                        best = Some(i);
                        continue;
                    }
                }
                p.lock.release();
            }

            best
        }
    }
}

#[cfg(feature = "policy-rr")]
pub type ActivePolicy = Rr;
#[cfg(feature = "policy-fcfs")]
pub type ActivePolicy = Fcfs;
#[cfg(feature = "policy-lbs")]
pub type ActivePolicy = Lbs;
#[cfg(feature = "policy-pbs")]
pub type ActivePolicy = Pbs;
#[cfg(feature = "policy-mlfq")]
pub type ActivePolicy = Mlfq;

#[cfg(test)]
mod tests {
    use super::*;

    // These exercise the selection laws directly on the static process
    // table, since the kernel binary itself cannot run under `cargo test`.

    fn reset_table() {
        for i in 0..NPROC {
            unsafe {
                PROCS[i] = Proc::default();
            }
        }
    }

    #[test]
    fn fcfs_picks_earliest_arrival() {
        reset_table();
        unsafe {
            PROCS[0].state = Procstate::Runnable;
            PROCS[0].in_tick = 5;
            PROCS[1].state = Procstate::Runnable;
            PROCS[1].in_tick = 2;
        }
        let picked = Fcfs::pick().unwrap();
        assert_eq!(picked, 1);
        unsafe { PROCS[picked].lock.release() };
    }

    #[test]
    fn rr_prefers_first_runnable_slot() {
        reset_table();
        unsafe {
            PROCS[3].state = Procstate::Runnable;
        }
        let picked = Rr::pick().unwrap();
        assert_eq!(picked, 3);
        unsafe { PROCS[picked].lock.release() };
    }

    #[cfg(feature = "policy-lbs")]
    #[test]
    fn lbs_total_tickets_tracks_runnable_set() {
        use crate::proc::TOTAL_TICKETS;

        reset_table();
        unsafe {
            TOTAL_TICKETS = 0;
        }

        unsafe {
            PROCS[0].tickets = 3;
            PROCS[1].tickets = 7;
        }
        Lbs::on_become_runnable(0);
        Lbs::on_become_runnable(1);
        assert_eq!(unsafe { TOTAL_TICKETS }, 10);

        // moving a ticket holder to RUNNING removes its stake from the pool,
        // mirroring how pick() only ever draws over the runnable set.
        Lbs::on_become_running(1);
        assert_eq!(unsafe { TOTAL_TICKETS }, 3);
    }

    #[cfg(feature = "policy-pbs")]
    #[test]
    fn pbs_lower_dynamic_priority_wins() {
        reset_table();
        unsafe {
            PROCS[0].state = Procstate::Runnable;
            PROCS[0].priority = 60;
            PROCS[0].num_sched = 1;

            PROCS[1].state = Procstate::Runnable;
            PROCS[1].priority = 20;
            PROCS[1].num_sched = 1;
        }
        let picked = Pbs::pick().unwrap();
        assert_eq!(picked, 1);
        unsafe { PROCS[picked].lock.release() };
    }

    #[cfg(feature = "policy-pbs")]
    #[test]
    fn pbs_ties_break_by_num_sched_then_arrival() {
        reset_table();
        unsafe {
            PROCS[0].state = Procstate::Runnable;
            PROCS[0].priority = 60;
            PROCS[0].num_sched = 5;
            PROCS[0].in_tick = 1;

            PROCS[1].state = Procstate::Runnable;
            PROCS[1].priority = 60;
            PROCS[1].num_sched = 2;
            PROCS[1].in_tick = 9;
        }
        // equal dynamic priority (both niceness 5 since num_sched picks the
        // default path below), fewer past scheduling rounds wins the tie.
        let picked = Pbs::pick().unwrap();
        assert_eq!(picked, 1);
        unsafe { PROCS[picked].lock.release() };
    }

    #[cfg(feature = "policy-mlfq")]
    #[test]
    fn mlfq_demotes_on_quantum_exhaustion() {
        reset_table();
        unsafe {
            TICKS = 0;
            PROCS[0].state = Procstate::Running;
            PROCS[0].queue = 0;
            PROCS[0].num_ticks = 0;
        }
        // queue 0's quantum is 2^0 == 1 tick.
        let should_yield = Mlfq::on_tick(0);
        assert!(should_yield);
        unsafe {
            assert_eq!(PROCS[0].queue, 1);
            assert_eq!(PROCS[0].num_ticks, 0);
        }
    }

    #[cfg(feature = "policy-mlfq")]
    #[test]
    fn mlfq_prefers_lower_queue_number() {
        reset_table();
        unsafe {
            PROCS[0].state = Procstate::Runnable;
            PROCS[0].queue = 3;
            PROCS[1].state = Procstate::Runnable;
            PROCS[1].queue = 1;
        }
        let picked = Mlfq::pick().unwrap();
        assert_eq!(picked, 1);
        unsafe { PROCS[picked].lock.release() };
    }
}
