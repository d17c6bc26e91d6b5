//! The delay facility: SYS18 and the delay daemon. Sleepers sit on the
//! active delay list sorted by wake-up time; the daemon sweeps it once
//! per pseudo-clock tick and V's each expired sleeper's private
//! semaphore.

use lazy_static::lazy_static;
use spin::Mutex;

use super::syscalls::program_trap;
use super::{kcall, sup_mut, with_locked, SupId, GENERAL_EXCEPT};
use crate::machine::cp0::{InterruptGuard, ProcessorState, Status};
use crate::machine::tlb::EntryHi;
use crate::machine::{self, PAGE_SIZE, UPROC_MAX};
use crate::nucleus::scheduler;
use crate::nucleus::sem::{SemAddr, Semaphore};

const MICROS_PER_SEC: u64 = 1_000_000;

// ──────────────────────────────────────────────────────────────
//  Active delay list
// ──────────────────────────────────────────────────────────────

/// Eight sleeper nodes plus the two sentinels.
const ADL_NODES: usize = UPROC_MAX + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayId(u8);

impl DelayId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

const HEAD: DelayId = DelayId(0);
const TAIL: DelayId = DelayId(1);

#[derive(Clone, Copy)]
struct DelayNode {
    next: Option<DelayId>,
    wake_at: u64,
    /// The sleeper's private semaphore.
    wake_sem: SemAddr,
}

impl DelayNode {
    fn empty() -> DelayNode {
        DelayNode {
            next: None,
            wake_at: 0,
            wake_sem: SemAddr::from_raw(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdlExhausted;

/// Sorted singly-linked list of pending sleepers, bracketed by wake
/// times 0 and max.
pub struct Adl {
    nodes: [DelayNode; ADL_NODES],
    free_head: Option<DelayId>,
}

impl Adl {
    pub fn new() -> Adl {
        let mut adl = Adl {
            nodes: [DelayNode::empty(); ADL_NODES],
            free_head: None,
        };
        adl.nodes[HEAD.index()].next = Some(TAIL);
        adl.nodes[HEAD.index()].wake_at = 0;
        adl.nodes[TAIL.index()].next = None;
        adl.nodes[TAIL.index()].wake_at = u64::MAX;
        for i in 2..ADL_NODES {
            adl.free_node(DelayId(i as u8));
        }
        adl
    }

    fn free_node(&mut self, id: DelayId) {
        self.nodes[id.index()].next = self.free_head;
        self.free_head = Some(id);
    }

    fn alloc_node(&mut self) -> Option<DelayId> {
        let id = self.free_head?;
        self.free_head = self.nodes[id.index()].next;
        self.nodes[id.index()] = DelayNode::empty();
        Some(id)
    }

    /// Queue a sleeper, keeping the list sorted ascending on wake time.
    pub fn insert(&mut self, wake_at: u64, wake_sem: SemAddr) -> Result<(), AdlExhausted> {
        let node = self.alloc_node().ok_or(AdlExhausted)?;
        let mut prev = HEAD;
        loop {
            let cur = self.nodes[prev.index()].next.expect("delay list truncated");
            if self.nodes[cur.index()].wake_at >= wake_at {
                self.nodes[node.index()].wake_at = wake_at;
                self.nodes[node.index()].wake_sem = wake_sem;
                self.nodes[node.index()].next = Some(cur);
                self.nodes[prev.index()].next = Some(node);
                return Ok(());
            }
            prev = cur;
        }
    }

    /// Pop the earliest sleeper if its wake time has passed.
    pub fn pop_expired(&mut self, now: u64) -> Option<SemAddr> {
        let first = self.nodes[HEAD.index()].next.expect("delay list truncated");
        if first == TAIL || self.nodes[first.index()].wake_at > now {
            return None;
        }
        let sem = self.nodes[first.index()].wake_sem;
        self.nodes[HEAD.index()].next = self.nodes[first.index()].next;
        self.free_node(first);
        Some(sem)
    }
}

lazy_static! {
    static ref ADL: Mutex<Adl> = Mutex::new(Adl::new());
}

static ADL_MUTEX: Semaphore = Semaphore::new(1);

// ──────────────────────────────────────────────────────────────
//  Daemon
// ──────────────────────────────────────────────────────────────

/// Kernel-mode sweeper. Wakes on every pseudo-clock tick and releases
/// every sleeper whose time has come.
pub extern "C" fn delay_daemon() -> ! {
    loop {
        kcall::wait_clock();
        kcall::passeren(ADL_MUTEX.addr());
        let now = machine::tod_us();
        while let Some(sem) = with_locked(&ADL, |adl| adl.pop_expired(now)) {
            kcall::verhogen(sem);
        }
        kcall::verhogen(ADL_MUTEX.addr());
    }
}

/// Reset the list and launch the daemon (ASID 0, stack on the
/// second-to-last RAM page; the instantiator owns the last one).
pub fn init_adl() {
    with_locked(&ADL, |adl| *adl = Adl::new());
    ADL_MUTEX.addr().write(1);

    let mut state = ProcessorState::zeroed();
    state.set_entry(delay_daemon as *const () as u32);
    state.set_sp(machine::ram_top() - PAGE_SIZE as u32);
    state.status = (Status::IEP | Status::IM_ALL | Status::TE).bits();
    state.entry_hi = EntryHi::new(0, 0).0;

    if kcall::create_process(&state, None) < 0 {
        panic!("cannot create the delay daemon");
    }
}

// ──────────────────────────────────────────────────────────────
//  SYS18
// ──────────────────────────────────────────────────────────────

/// Put the caller to sleep for `a1` whole seconds. The list mutex is
/// released and the private semaphore taken in one unpreemptible pair,
/// so the wake-up V cannot slip in between.
pub fn sys_delay(sid: SupId) -> ! {
    let sup = sup_mut(sid);
    let seconds = sup.except_state[GENERAL_EXCEPT].a1() as i32;
    if seconds < 0 {
        program_trap(sid);
    }

    kcall::passeren(ADL_MUTEX.addr());
    let wake_at = machine::tod_us() + seconds as u64 * MICROS_PER_SEC;
    let queued = with_locked(&ADL, |adl| adl.insert(wake_at, sup.private_sem.addr()));
    if queued.is_err() {
        kcall::verhogen(ADL_MUTEX.addr());
        program_trap(sid);
    }

    {
        let _guard = InterruptGuard::acquire();
        kcall::verhogen(ADL_MUTEX.addr());
        kcall::passeren(sup.private_sem.addr());
    }

    scheduler::resume(&sup.except_state[GENERAL_EXCEPT])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sem(n: usize) -> SemAddr {
        SemAddr::from_raw(0x1000 + n * 4)
    }

    #[test]
    fn sleepers_pop_in_wake_order() {
        let mut adl = Adl::new();
        adl.insert(300, sem(3)).unwrap();
        adl.insert(100, sem(1)).unwrap();
        adl.insert(200, sem(2)).unwrap();

        assert_eq!(adl.pop_expired(99), None);
        assert_eq!(adl.pop_expired(100), Some(sem(1)));
        assert_eq!(adl.pop_expired(100), None);
        assert_eq!(adl.pop_expired(1000), Some(sem(2)));
        assert_eq!(adl.pop_expired(1000), Some(sem(3)));
        assert_eq!(adl.pop_expired(u64::MAX - 1), None);
    }

    #[test]
    fn capacity_matches_the_process_count() {
        let mut adl = Adl::new();
        for i in 0..UPROC_MAX {
            adl.insert(i as u64, sem(i)).unwrap();
        }
        assert_eq!(adl.insert(99, sem(99)), Err(AdlExhausted));
        // nodes recycle
        assert!(adl.pop_expired(u64::MAX - 1).is_some());
        assert!(adl.insert(7, sem(7)).is_ok());
    }

    proptest! {
        #[test]
        fn pops_are_sorted_and_never_early(wakes in proptest::collection::vec(0u64..10_000, 0..8)) {
            let mut adl = Adl::new();
            for (i, w) in wakes.iter().enumerate() {
                adl.insert(*w, sem(i)).unwrap();
            }
            let mut popped = Vec::new();
            let mut now = 0;
            while popped.len() < wakes.len() {
                now += 500;
                while let Some(s) = adl.pop_expired(now) {
                    popped.push((now, s));
                }
            }
            // never early
            for (at, s) in &popped {
                prop_assert!(wakes[(s.raw() - 0x1000) / 4] <= *at);
            }
            // drained in ascending wake order
            let order: Vec<u64> = popped.iter().map(|(_, s)| wakes[(s.raw() - 0x1000) / 4]).collect();
            let mut sorted = order.clone();
            sorted.sort();
            prop_assert_eq!(order, sorted);
        }
    }
}
