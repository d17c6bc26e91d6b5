//! Logical semaphores in the shared segment (SYS19/SYS20). The integer
//! itself lives in user-visible shared memory; what the kernel keeps is
//! the active logical semaphore list of blocked waiters, FIFO per
//! address. Contending processes block on their private semaphores.

use lazy_static::lazy_static;
use spin::Mutex;

use super::syscalls::program_trap;
use super::{kcall, sup_mut, with_locked, SupId, GENERAL_EXCEPT};
use crate::machine::cp0::InterruptGuard;
use crate::machine::{self, UPROC_MAX};
use crate::nucleus::scheduler;
use crate::nucleus::sem::{SemAddr, Semaphore};

// ──────────────────────────────────────────────────────────────
//  Active logical semaphore list
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(u8);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy)]
struct WaiterNode {
    next: Option<NodeId>,
    prev: Option<NodeId>,
    /// Address of the shared semaphore being waited on.
    sem: SemAddr,
    /// The waiter's private semaphore.
    wake_sem: SemAddr,
}

impl WaiterNode {
    fn empty() -> WaiterNode {
        WaiterNode {
            next: None,
            prev: None,
            sem: SemAddr::from_raw(0),
            wake_sem: SemAddr::from_raw(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlslExhausted;

/// Circular doubly-linked list of waiters addressed by its tail, at most
/// one node per process, plus a free list.
pub struct Alsl {
    nodes: [WaiterNode; UPROC_MAX],
    free_head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl Alsl {
    pub fn new() -> Alsl {
        let mut alsl = Alsl {
            nodes: [WaiterNode::empty(); UPROC_MAX],
            free_head: None,
            tail: None,
        };
        for i in 0..UPROC_MAX {
            alsl.free_node(NodeId(i as u8));
        }
        alsl
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id.index()].next = self.free_head;
        self.free_head = Some(id);
    }

    fn alloc_node(&mut self) -> Option<NodeId> {
        let id = self.free_head?;
        self.free_head = self.nodes[id.index()].next;
        self.nodes[id.index()] = WaiterNode::empty();
        Some(id)
    }

    fn head(&self) -> Option<NodeId> {
        let tail = self.tail?;
        self.nodes[tail.index()].next
    }

    /// Enqueue a waiter at the tail.
    pub fn enqueue(&mut self, sem: SemAddr, wake_sem: SemAddr) -> Result<(), AlslExhausted> {
        let node = self.alloc_node().ok_or(AlslExhausted)?;
        self.nodes[node.index()].sem = sem;
        self.nodes[node.index()].wake_sem = wake_sem;
        match self.tail {
            None => {
                self.nodes[node.index()].next = Some(node);
                self.nodes[node.index()].prev = Some(node);
            }
            Some(tail) => {
                let head = self.nodes[tail.index()].next.expect("waiter list truncated");
                self.nodes[node.index()].next = Some(head);
                self.nodes[head.index()].prev = Some(node);
                self.nodes[tail.index()].next = Some(node);
                self.nodes[node.index()].prev = Some(tail);
            }
        }
        self.tail = Some(node);
        Ok(())
    }

    /// Remove the oldest waiter on `sem` and return its private
    /// semaphore.
    pub fn dequeue_first(&mut self, sem: SemAddr) -> Option<SemAddr> {
        let head = self.head()?;
        let mut cur = head;
        loop {
            if self.nodes[cur.index()].sem == sem {
                let wake = self.nodes[cur.index()].wake_sem;
                self.unlink(cur);
                self.free_node(cur);
                return Some(wake);
            }
            cur = self.nodes[cur.index()].next.expect("waiter list truncated");
            if cur == head {
                return None;
            }
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let next = self.nodes[id.index()].next.expect("waiter list truncated");
        let prev = self.nodes[id.index()].prev.expect("waiter list truncated");
        if next == id {
            // only node
            self.tail = None;
            return;
        }
        self.nodes[prev.index()].next = Some(next);
        self.nodes[next.index()].prev = Some(prev);
        if self.tail == Some(id) {
            self.tail = Some(prev);
        }
    }
}

lazy_static! {
    static ref ALSL: Mutex<Alsl> = Mutex::new(Alsl::new());
}

static ALSL_MUTEX: Semaphore = Semaphore::new(1);

pub fn init_alsl() {
    with_locked(&ALSL, |alsl| *alsl = Alsl::new());
    ALSL_MUTEX.addr().write(1);
}

// ──────────────────────────────────────────────────────────────
//  SYS19 / SYS20
// ──────────────────────────────────────────────────────────────

/// The semaphore argument must point into the shared segment.
fn shared_sem_arg(sid: SupId) -> SemAddr {
    let addr = sup_mut(sid).except_state[GENERAL_EXCEPT].a1();
    if !machine::is_shared_addr(addr) {
        program_trap(sid);
    }
    SemAddr::from_reg(addr)
}

/// SYS19: P on a shared-segment semaphore. The uncontended path touches
/// only the shared integer; the waiter list is involved only when the
/// caller must block.
pub fn sys_p_shared(sid: SupId) -> ! {
    let sem = shared_sem_arg(sid);
    let sup = sup_mut(sid);

    if sem.decrement() >= 0 {
        scheduler::resume(&sup.except_state[GENERAL_EXCEPT]);
    }

    kcall::passeren(ALSL_MUTEX.addr());
    let queued = with_locked(&ALSL, |alsl| alsl.enqueue(sem, sup.private_sem.addr()));
    if queued.is_err() {
        kcall::verhogen(ALSL_MUTEX.addr());
        program_trap(sid);
    }

    // Release the list and sleep in one unpreemptible pair so the V that
    // frees us cannot land first.
    {
        let _guard = InterruptGuard::acquire();
        kcall::verhogen(ALSL_MUTEX.addr());
        kcall::passeren(sup.private_sem.addr());
    }

    scheduler::resume(&sup.except_state[GENERAL_EXCEPT])
}

/// SYS20: V on a shared-segment semaphore; releases the oldest waiter,
/// if any.
pub fn sys_v_shared(sid: SupId) -> ! {
    let sem = shared_sem_arg(sid);
    let sup = sup_mut(sid);

    if sem.increment() > 0 {
        scheduler::resume(&sup.except_state[GENERAL_EXCEPT]);
    }

    kcall::passeren(ALSL_MUTEX.addr());
    let waiter = with_locked(&ALSL, |alsl| alsl.dequeue_first(sem));
    kcall::verhogen(ALSL_MUTEX.addr());

    if let Some(wake) = waiter {
        kcall::verhogen(wake);
    }

    scheduler::resume(&sup.except_state[GENERAL_EXCEPT])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sem(n: usize) -> SemAddr {
        SemAddr::from_raw(0xC000_0000 + n * 4)
    }

    fn waiter(n: usize) -> SemAddr {
        SemAddr::from_raw(0x5000 + n * 4)
    }

    #[test]
    fn waiters_on_one_address_release_fifo() {
        let mut alsl = Alsl::new();
        alsl.enqueue(sem(0), waiter(1)).unwrap();
        alsl.enqueue(sem(0), waiter(2)).unwrap();
        alsl.enqueue(sem(0), waiter(3)).unwrap();

        assert_eq!(alsl.dequeue_first(sem(0)), Some(waiter(1)));
        assert_eq!(alsl.dequeue_first(sem(0)), Some(waiter(2)));
        assert_eq!(alsl.dequeue_first(sem(0)), Some(waiter(3)));
        assert_eq!(alsl.dequeue_first(sem(0)), None);
    }

    #[test]
    fn addresses_do_not_cross_talk() {
        let mut alsl = Alsl::new();
        alsl.enqueue(sem(0), waiter(1)).unwrap();
        alsl.enqueue(sem(1), waiter(2)).unwrap();
        alsl.enqueue(sem(0), waiter(3)).unwrap();

        assert_eq!(alsl.dequeue_first(sem(1)), Some(waiter(2)));
        assert_eq!(alsl.dequeue_first(sem(1)), None);
        assert_eq!(alsl.dequeue_first(sem(0)), Some(waiter(1)));
        assert_eq!(alsl.dequeue_first(sem(0)), Some(waiter(3)));
    }

    #[test]
    fn one_node_per_process_and_recycling() {
        let mut alsl = Alsl::new();
        for i in 0..UPROC_MAX {
            alsl.enqueue(sem(0), waiter(i)).unwrap();
        }
        assert_eq!(alsl.enqueue(sem(0), waiter(99)), Err(AlslExhausted));
        assert!(alsl.dequeue_first(sem(0)).is_some());
        assert!(alsl.enqueue(sem(0), waiter(8)).is_ok());
    }
}
