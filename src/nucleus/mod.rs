//! The nucleus: process abstraction, scheduler, exception and interrupt
//! dispatch, and the kernel-mode syscall services.

pub mod asl;
pub mod exceptions;
pub mod interrupts;
pub mod pcb;
pub mod scheduler;
pub mod sem;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::machine;
use crate::machine::cp0::Status;
use asl::Asl;
use pcb::{PcbId, PcbPool, ProcQueue};
use sem::{SemAddr, Semaphore};

pub use pcb::MAX_PROC;

/// Round-robin time slice in microseconds.
pub const QUANTUM_US: u64 = 5_000;
/// Interval-timer period: one pseudo-clock tick.
pub const TICK_US: u32 = 100_000;

// ──────────────────────────────────────────────────────────────
//  Device semaphores
// ──────────────────────────────────────────────────────────────

/// The 48 per-(sub)device semaphores plus the pseudo-clock semaphore.
pub struct DeviceSems {
    sems: [Semaphore; machine::NUM_DEVICES + 1],
}

impl DeviceSems {
    const fn new() -> DeviceSems {
        const ZERO: Semaphore = Semaphore::new(0);
        DeviceSems {
            sems: [ZERO; machine::NUM_DEVICES + 1],
        }
    }

    /// Semaphore index for a device: lines 3..=6 cover the four plain
    /// classes, terminal transmitters sit at 32..=39 and terminal
    /// receivers at 40..=47.
    pub fn index_of(line: usize, dev: usize, term_read: bool) -> usize {
        (line - machine::LINE_DISK + term_read as usize) * machine::DEV_PER_LINE + dev
    }

    pub fn at(&self, index: usize) -> &Semaphore {
        &self.sems[index]
    }

    pub fn pseudo_clock(&self) -> &Semaphore {
        &self.sems[machine::NUM_DEVICES]
    }

    /// True for the 48 real device semaphores (pseudo-clock excluded).
    pub fn is_device_sem(&self, addr: SemAddr) -> bool {
        let first = self.sems[0].addr().raw();
        let last = self.sems[machine::NUM_DEVICES - 1].addr().raw();
        addr.raw() >= first && addr.raw() <= last
    }

    pub fn is_pseudo_clock(&self, addr: SemAddr) -> bool {
        addr == self.pseudo_clock().addr()
    }
}

pub static DEVICE_SEMS: DeviceSems = DeviceSems::new();

// ──────────────────────────────────────────────────────────────
//  Nucleus state
// ──────────────────────────────────────────────────────────────

/// Everything the dispatcher mutates, behind one owner struct. Exception
/// paths run with interrupts masked, so the lock is never contended; it
/// is always dropped before any context switch.
pub struct Nucleus {
    pub pcbs: PcbPool,
    pub asl: Asl,
    pub ready: ProcQueue,
    pub current: Option<PcbId>,
    /// Started but not yet terminated processes.
    pub proc_count: usize,
    /// Live processes blocked on a device or pseudo-clock semaphore.
    pub soft_block_count: usize,
    /// Time-of-day when the running process's quantum began.
    pub quantum_start: u64,
}

impl Nucleus {
    pub fn new() -> Nucleus {
        Nucleus {
            pcbs: PcbPool::new(),
            asl: Asl::new(),
            ready: ProcQueue::new(),
            current: None,
            proc_count: 0,
            soft_block_count: 0,
            quantum_start: 0,
        }
    }

    /// Tear down the whole subtree rooted at `p`: each victim is unlinked
    /// from wherever it lives (current slot, ready queue or a semaphore
    /// queue) and its descriptor freed. A victim parked on a device
    /// semaphore only drops the soft-block count (the pending I/O will
    /// still complete and V the semaphore itself); any other semaphore
    /// gets its earlier P cancelled by re-incrementing.
    pub fn terminate_subtree(&mut self, p: PcbId) {
        while let Some(child) = self.pcbs.remove_first_child(p) {
            self.terminate_subtree(child);
        }

        if self.current == Some(p) {
            self.pcbs.unlink_child(p);
            self.current = None;
        } else if let Some(sem) = self.pcbs[p].blocked_on {
            if self.asl.out_blocked(&mut self.pcbs, p).is_none() {
                panic!("terminating a process missing from its semaphore queue");
            }
            if DEVICE_SEMS.is_device_sem(sem) {
                self.soft_block_count -= 1;
            } else if DEVICE_SEMS.is_pseudo_clock(sem) {
                self.soft_block_count -= 1;
                sem.increment();
            } else {
                sem.increment();
            }
        } else if self.ready.remove(&mut self.pcbs, p).is_none() {
            panic!("terminating a process that is in no queue");
        }

        self.pcbs.release(p);
        self.proc_count -= 1;
    }
}

lazy_static! {
    pub static ref NUCLEUS: Mutex<Nucleus> = Mutex::new(Nucleus::new());
}

// ──────────────────────────────────────────────────────────────
//  Boot
// ──────────────────────────────────────────────────────────────

/// The pass-up vector the exception ROM reads.
#[repr(C)]
struct PassUpVector {
    tlb_refill_handler: u32,
    tlb_refill_stack: u32,
    exception_handler: u32,
    exception_stack: u32,
}

/// Nucleus initialization: wire the pass-up vector, start the interval
/// timer, create the support-level instantiator as the first process and
/// hand over to the scheduler.
pub fn boot() -> ! {
    let vector = machine::PASS_UP_VECTOR as *mut PassUpVector;
    unsafe {
        core::ptr::write_volatile(
            vector,
            PassUpVector {
                tlb_refill_handler: exceptions::tlb_refill_handler as *const () as u32,
                tlb_refill_stack: machine::NUCLEUS_STACK_TOP as u32,
                exception_handler: exceptions::general_exception_handler as *const () as u32,
                exception_stack: machine::NUCLEUS_STACK_TOP as u32,
            },
        );
    }

    machine::load_interval_timer(TICK_US);

    {
        let mut nuc = NUCLEUS.lock();
        let n = &mut *nuc;
        let p = n.pcbs.alloc().expect("boot: pcb pool empty");
        // Fresh states set the previous-mode bits: the first load-state
        // pops them into place.
        n.pcbs[p].state.status = (Status::IEP | Status::IM_ALL | Status::TE).bits();
        n.pcbs[p].state.set_sp(machine::ram_top());
        n.pcbs[p].state.set_entry(crate::support::instantiate as *const () as u32);
        n.ready.enqueue(&mut n.pcbs, p);
        n.proc_count = 1;
    }

    crate::log_info!("nucleus up, dispatching the instantiator");
    scheduler::schedule()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{LINE_DISK, LINE_FLASH, LINE_PRINTER, LINE_TERMINAL};

    #[test]
    fn semaphore_map_indices() {
        assert_eq!(DeviceSems::index_of(LINE_DISK, 0, false), 0);
        assert_eq!(DeviceSems::index_of(LINE_DISK, 7, false), 7);
        assert_eq!(DeviceSems::index_of(LINE_FLASH, 0, false), 8);
        assert_eq!(DeviceSems::index_of(LINE_PRINTER, 3, false), 27);
        assert_eq!(DeviceSems::index_of(LINE_TERMINAL, 0, false), 32);
        assert_eq!(DeviceSems::index_of(LINE_TERMINAL, 7, false), 39);
        assert_eq!(DeviceSems::index_of(LINE_TERMINAL, 0, true), 40);
        assert_eq!(DeviceSems::index_of(LINE_TERMINAL, 7, true), 47);
    }

    #[test]
    fn device_sem_ranges() {
        let disk0 = DEVICE_SEMS.at(0).addr();
        let last = DEVICE_SEMS.at(machine::NUM_DEVICES - 1).addr();
        let pseudo = DEVICE_SEMS.pseudo_clock().addr();
        assert!(DEVICE_SEMS.is_device_sem(disk0));
        assert!(DEVICE_SEMS.is_device_sem(last));
        assert!(!DEVICE_SEMS.is_device_sem(pseudo));
        assert!(DEVICE_SEMS.is_pseudo_clock(pseudo));
    }

    #[test]
    fn cascaded_termination_empties_the_tree() {
        let mut n = Nucleus::new();
        let parent = n.pcbs.alloc().unwrap();
        n.current = Some(parent);
        n.proc_count = 1;

        // three children, two grandchildren each
        for _ in 0..3 {
            let c = n.pcbs.alloc().unwrap();
            n.pcbs.insert_child(parent, c);
            n.ready.enqueue(&mut n.pcbs, c);
            n.proc_count += 1;
            for _ in 0..2 {
                let g = n.pcbs.alloc().unwrap();
                n.pcbs.insert_child(c, g);
                n.ready.enqueue(&mut n.pcbs, g);
                n.proc_count += 1;
            }
        }
        assert_eq!(n.proc_count, 10);

        n.terminate_subtree(parent);
        assert_eq!(n.proc_count, 0);
        assert!(n.current.is_none());
        assert!(n.ready.is_empty());
        // the pool is whole again
        for _ in 0..MAX_PROC {
            assert!(n.pcbs.alloc().is_some());
        }
    }

    #[test]
    fn terminating_a_blocked_victim_adjusts_the_semaphore() {
        use crate::nucleus::sem::Semaphore;
        let mut n = Nucleus::new();
        let parent = n.pcbs.alloc().unwrap();
        n.current = Some(parent);
        n.proc_count = 1;

        let sem = Semaphore::new(-1);
        let child = n.pcbs.alloc().unwrap();
        n.pcbs.insert_child(parent, child);
        n.asl.insert_blocked(&mut n.pcbs, sem.addr(), child).unwrap();
        n.proc_count += 1;

        n.terminate_subtree(parent);
        assert_eq!(n.proc_count, 0);
        // the earlier P was cancelled
        assert_eq!(sem.addr().read(), 0);
    }

    #[test]
    fn terminating_a_device_waiter_only_drops_soft_block() {
        let mut n = Nucleus::new();
        let parent = n.pcbs.alloc().unwrap();
        n.current = Some(parent);
        n.proc_count = 1;

        let dev_sem = DEVICE_SEMS.at(5).addr();
        dev_sem.write(-1);
        let child = n.pcbs.alloc().unwrap();
        n.pcbs.insert_child(parent, child);
        n.asl.insert_blocked(&mut n.pcbs, dev_sem, child).unwrap();
        n.proc_count += 1;
        n.soft_block_count = 1;

        n.terminate_subtree(parent);
        assert_eq!(n.soft_block_count, 0);
        // the device semaphore is left for the completion interrupt
        assert_eq!(dev_sem.read(), -1);
        dev_sem.write(0);
    }
}
