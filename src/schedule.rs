//! The time-partitioned scheduler.
//!
//! `slots[hart][slot]` is a static map from wall-clock time slots to
//! `(pid, end_slot)`: the process owning the slot and the slot just past
//! its contiguous run. The table is only ever rewritten through Time
//! capability operations (derive, move, delete, revoke), so a process
//! can read its Time capability and know exactly when it will run.
//!
//! Readers are lock-free. Writers publish with a store fence and bump a
//! timestamp; a dispatch decision computed from older reads detects the
//! race and retries.

use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use array_macro::array;

use crate::hal::Plat;
use crate::kassert;
use crate::param::{MIN_HARTID, N_HART, N_PROC, N_SLOT, SLACK, SLOT_LEN};
use crate::proc::Proc;

/// Entry owner marking an unowned slot.
const PID_NONE: u32 = 0xffff;

const fn pack(pid: u32, end: u32) -> u32 {
    pid << 16 | end
}

pub struct Schedule {
    /// `(pid << 16 | end_slot)` per hart and slot.
    slots: [[AtomicU32; N_SLOT]; N_HART],
    /// Publication time of the latest edit.
    timestamp: AtomicU64,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            slots: array![_ => array![_ => AtomicU32::new(pack(PID_NONE, 0)); N_SLOT]; N_HART],
            timestamp: AtomicU64::new(0),
        }
    }

    /// Boot schedule: process 0 owns every round on every hart.
    pub fn init(&self) {
        for hartid in MIN_HARTID..MIN_HARTID + N_HART {
            self.update(0, 0, N_SLOT as u64, hartid as u64, 0, N_SLOT as u64);
        }
    }

    fn hart_row(&self, hartid: u64) -> &[AtomicU32; N_SLOT] {
        let i = hartid as usize - MIN_HARTID;
        kassert!(i < N_HART);
        &self.slots[i]
    }

    /// The owner of `slot` on `hartid`, or `None` for an unowned slot.
    pub fn entry(&self, hartid: u64, slot: usize) -> Option<(usize, usize)> {
        let e = self.hart_row(hartid)[slot].load(Ordering::SeqCst);
        let pid = e >> 16;
        if pid == PID_NONE {
            None
        } else {
            Some((pid as usize, (e & 0xffff) as usize))
        }
    }

    /// Hands slots `[from, to)` of `hartid` to `pid`, recording
    /// `end_at` as the end of the run. `now` is the publication time.
    pub fn update(&self, now: u64, pid: usize, end_at: u64, hartid: u64, from: u64, to: u64) {
        kassert!(pid < N_PROC && to <= N_SLOT as u64);
        let row = self.hart_row(hartid);
        let entry = pack(pid as u32, end_at as u32);
        for slot in from..to {
            row[slot as usize].store(entry, Ordering::Relaxed);
        }
        self.publish(now);
    }

    /// Marks slots `[from, to)` of `hartid` unowned.
    pub fn remove(&self, now: u64, hartid: u64, from: u64, to: u64) {
        kassert!(to <= N_SLOT as u64);
        let row = self.hart_row(hartid);
        for slot in from..to {
            row[slot as usize].store(pack(PID_NONE, 0), Ordering::Relaxed);
        }
        self.publish(now);
    }

    fn publish(&self, now: u64) {
        fence(Ordering::SeqCst);
        let _ = self.timestamp.fetch_max(now, Ordering::SeqCst);
    }

    /// Among all harts whose table names `pid` at `slot`, exactly one
    /// may dispatch it: the one whose run extends longest, lowest hart
    /// id on ties. Without this rule a Time capability spanning a slot
    /// on two harts could be double-scheduled.
    fn is_winner(&self, hartid: u64, slot: usize, pid: usize, end: usize) -> bool {
        for other in MIN_HARTID as u64..(MIN_HARTID + N_HART) as u64 {
            if other == hartid {
                continue;
            }
            if let Some((opid, oend)) = self.entry(other, slot) {
                if opid != pid {
                    continue;
                }
                if oend > end || (oend == end && other < hartid) {
                    return false;
                }
            }
        }
        true
    }

    /// Picks the next process to run on `hartid`, waits out its start
    /// delay and programs the slice-end timer. Returns with the process
    /// acquired and its PMP shadow loaded into hardware.
    pub fn pick<'p>(
        &self,
        plat: &dyn Plat,
        procs: &'p [Proc; N_PROC],
        hartid: u64,
    ) -> &'p Proc {
        loop {
            let now = plat.time_now();
            let quantum = (now + SLACK) / SLOT_LEN;
            let slot = quantum as usize % N_SLOT;

            let (pid, end) = match self.entry(hartid, slot) {
                Some(e) => e,
                None => {
                    plat.wfi();
                    continue;
                }
            };

            // An edit may have landed between the slot computation and
            // the entry read; its fence makes the timestamp visible.
            if self.timestamp.load(Ordering::SeqCst) > now {
                plat.wfi();
                continue;
            }

            if !self.is_winner(hartid, slot, pid, end) {
                plat.wfi();
                continue;
            }

            let proc = &procs[pid];
            if !proc.acquire() {
                continue;
            }

            let quantum_start = quantum * SLOT_LEN;
            let quantum_end = quantum_start + (end - slot) as u64 * SLOT_LEN;
            let sleep = proc.sleep_until();
            if sleep >= quantum_end {
                proc.release();
                plat.wfi();
                continue;
            }
            let start = if sleep > quantum_start { sleep } else { quantum_start };

            // SAFETY: the process was just acquired.
            let data = unsafe { proc.data() };
            data.start_time = start;
            data.end_time = quantum_end;

            plat.timer_set(hartid, start);
            while plat.time_now() < start {
                plat.wfi();
            }
            plat.timer_set(hartid, quantum_end);
            plat.pmp_write_hw(proc);
            return proc;
        }
    }

    /// Gives up the rest of the current slice and dispatches anew.
    pub fn yield_to_next<'p>(
        &self,
        plat: &dyn Plat,
        procs: &'p [Proc; N_PROC],
        hartid: u64,
        current: &Proc,
    ) -> &'p Proc {
        current.release();
        self.pick(plat, procs, hartid)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use array_macro::array;

    use super::*;
    use crate::hal::Plat;

    struct StepClock {
        now: AtomicU64,
    }

    impl StepClock {
        fn at(now: u64) -> Self {
            Self { now: AtomicU64::new(now) }
        }
    }

    impl Plat for StepClock {
        fn time_now(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
        fn timer_set(&self, _hartid: u64, _when: u64) {}
        fn pmp_write_hw(&self, _proc: &Proc) {}
        fn putc(&self, _byte: u8) {}
        fn preempted(&self, _hartid: u64) -> bool {
            false
        }
        fn wfi(&self) {
            // Let time pass so unowned slots cannot spin forever.
            let _ = self.now.fetch_add(SLOT_LEN, Ordering::SeqCst);
        }
        fn payload(&self) -> u64 {
            0
        }
    }

    fn ready_procs() -> [Proc; N_PROC] {
        let procs = array![pid => Proc::new(pid); N_PROC];
        for p in &procs {
            p.resume();
        }
        procs
    }

    #[test]
    fn boot_schedule_runs_pid0_everywhere() {
        let s = Schedule::new();
        s.init();
        for slot in 0..N_SLOT {
            assert_eq!(s.entry(MIN_HARTID as u64, slot), Some((0, N_SLOT)));
        }
    }

    #[test]
    fn update_and_remove_rewrite_ranges() {
        let s = Schedule::new();
        s.init();
        let hart = MIN_HARTID as u64;
        s.update(10, 3, 32, hart, 0, 32);
        assert_eq!(s.entry(hart, 0), Some((3, 32)));
        assert_eq!(s.entry(hart, 31), Some((3, 32)));
        assert_eq!(s.entry(hart, 32), Some((0, N_SLOT)));
        s.remove(11, hart, 0, 16);
        assert_eq!(s.entry(hart, 0), None);
        assert_eq!(s.entry(hart, 16), Some((3, 32)));
    }

    #[test]
    fn pick_dispatches_the_slot_owner() {
        let s = Schedule::new();
        s.init();
        let procs = ready_procs();
        let plat = StepClock::at(1);
        let hart = MIN_HARTID as u64;
        let p = s.pick(&plat, &procs, hart);
        assert_eq!(p.pid(), 0);
        // Acquired: a second dispatcher cannot take it.
        assert!(!p.acquire());
        let data = unsafe { p.data() };
        assert_eq!(data.end_time, N_SLOT as u64 * SLOT_LEN);
    }

    #[test]
    fn pick_skips_sleepers_until_their_slot_ends() {
        let s = Schedule::new();
        s.init();
        let hart = MIN_HARTID as u64;
        // pid 1 owns the first half of the round but sleeps through it.
        s.update(0, 1, 32, hart, 0, 32);
        let procs = ready_procs();
        procs[1].set_sleep_until(32 * SLOT_LEN);
        let plat = StepClock::at(1);
        let p = s.pick(&plat, &procs, hart);
        assert_eq!(p.pid(), 0, "slept past its run, next owner dispatches");
        assert_eq!(procs[1].state(), 0, "sleeper was released");
    }

    #[test]
    fn pick_honors_a_start_delay() {
        let s = Schedule::new();
        s.init();
        let hart = MIN_HARTID as u64;
        let procs = ready_procs();
        procs[0].set_sleep_until(3 * SLOT_LEN);
        let plat = StepClock::at(1);
        let p = s.pick(&plat, &procs, hart);
        assert_eq!(p.pid(), 0);
        let data = unsafe { p.data() };
        assert_eq!(data.start_time, 3 * SLOT_LEN);
        assert!(plat.time_now() >= 3 * SLOT_LEN, "pick waited for the start");
    }

    #[test]
    fn longest_run_wins_across_harts() {
        let s = Schedule::new();
        let h0 = MIN_HARTID as u64;
        let h1 = h0 + 1;
        // pid 2 is named at slot 0 on both harts, but hart 1's run is
        // longer, so hart 0 must stand down.
        s.update(0, 2, 8, h0, 0, 8);
        s.update(0, 2, 16, h1, 0, 16);
        assert!(!s.is_winner(h0, 0, 2, 8));
        assert!(s.is_winner(h1, 0, 2, 16));
        // Equal runs: the lower hart id wins.
        s.update(1, 2, 16, h0, 0, 16);
        assert!(s.is_winner(h0, 0, 2, 16));
        assert!(!s.is_winner(h1, 0, 2, 16));
        // Different pids do not compete.
        s.update(2, 3, 16, h0, 0, 16);
        assert!(s.is_winner(h0, 0, 3, 16));
        assert!(s.is_winner(h1, 0, 2, 16));
    }

    #[test]
    fn yield_releases_and_redispatches() {
        let s = Schedule::new();
        s.init();
        let procs = ready_procs();
        let plat = StepClock::at(1);
        let hart = MIN_HARTID as u64;
        let p = s.pick(&plat, &procs, hart);
        let end = unsafe { p.data() }.end_time;
        p.set_sleep_until(end);
        let q = s.yield_to_next(&plat, &procs, hart, p);
        // Only pid 0 is in the schedule; it comes back once its sleep
        // has passed.
        assert_eq!(q.pid(), 0);
        assert!(unsafe { q.data() }.start_time >= end);
    }
}
