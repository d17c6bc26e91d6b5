//! Process control blocks: a fixed pool of descriptors, circular
//! doubly-linked process queues with a tail pointer, and the process
//! tree (parent, first child, doubly-linked sibling chain).
//!
//! The pool owns all storage; everything else holds opaque `PcbId`
//! indices, so queue and tree surgery never touches a pointer.

use core::ops::{Index, IndexMut};

use super::sem::SemAddr;
use crate::machine::cp0::ProcessorState;
use crate::support::SupId;

pub const MAX_PROC: usize = 20;

/// Opaque index of a PCB in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcbId(u8);

impl PcbId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One process descriptor.
pub struct Pcb {
    // queue links
    next: Option<PcbId>,
    prev: Option<PcbId>,
    // tree links
    parent: Option<PcbId>,
    first_child: Option<PcbId>,
    next_sib: Option<PcbId>,
    prev_sib: Option<PcbId>,
    /// Saved processor state while not running.
    pub state: ProcessorState,
    /// Accumulated CPU time in microseconds.
    pub cpu_time: u64,
    /// The semaphore this process is blocked on, if any.
    pub blocked_on: Option<SemAddr>,
    /// Support structure of a user process.
    pub support: Option<SupId>,
}

impl Pcb {
    fn empty() -> Pcb {
        Pcb {
            next: None,
            prev: None,
            parent: None,
            first_child: None,
            next_sib: None,
            prev_sib: None,
            state: ProcessorState::zeroed(),
            cpu_time: 0,
            blocked_on: None,
            support: None,
        }
    }

    pub fn parent(&self) -> Option<PcbId> {
        self.parent
    }

    pub fn first_child(&self) -> Option<PcbId> {
        self.first_child
    }
}

// ──────────────────────────────────────────────────────────────
//  Pool
// ──────────────────────────────────────────────────────────────

/// The static pool of descriptors, with a free stack threaded through the
/// queue-next links.
pub struct PcbPool {
    slots: [Pcb; MAX_PROC],
    free_head: Option<PcbId>,
}

impl PcbPool {
    pub fn new() -> PcbPool {
        let mut pool = PcbPool {
            slots: core::array::from_fn(|_| Pcb::empty()),
            free_head: None,
        };
        for i in 0..MAX_PROC {
            pool.release(PcbId(i as u8));
        }
        pool
    }

    /// Take a descriptor off the free stack with every field cleared.
    /// Descriptors get reused, so no previous value may survive.
    pub fn alloc(&mut self) -> Option<PcbId> {
        let id = self.free_head?;
        self.free_head = self[id].next;
        self.slots[id.index()] = Pcb::empty();
        Some(id)
    }

    /// Push a descriptor back on the free stack.
    pub fn release(&mut self, id: PcbId) {
        self[id].next = self.free_head;
        self.free_head = Some(id);
    }

    // ── Process tree ─────────────────────────────────────────

    pub fn insert_child(&mut self, parent: PcbId, child: PcbId) {
        let first = self[parent].first_child;
        self[child].next_sib = first;
        if let Some(f) = first {
            self[f].prev_sib = Some(child);
        }
        self[child].prev_sib = None;
        self[child].parent = Some(parent);
        self[parent].first_child = Some(child);
    }

    /// Detach and return the first child of `parent`, if any.
    pub fn remove_first_child(&mut self, parent: PcbId) -> Option<PcbId> {
        let child = self[parent].first_child?;
        self.unlink_child(child)
    }

    /// Detach `child` from its parent, wherever it sits in the sibling
    /// chain. Returns `None` if it has no parent.
    pub fn unlink_child(&mut self, child: PcbId) -> Option<PcbId> {
        let parent = self[child].parent?;
        let prev = self[child].prev_sib;
        let next = self[child].next_sib;
        match prev {
            None => self[parent].first_child = next,
            Some(p) => self[p].next_sib = next,
        }
        if let Some(n) = next {
            self[n].prev_sib = prev;
        }
        self[child].parent = None;
        self[child].next_sib = None;
        self[child].prev_sib = None;
        Some(child)
    }
}

impl Index<PcbId> for PcbPool {
    type Output = Pcb;

    fn index(&self, id: PcbId) -> &Pcb {
        &self.slots[id.index()]
    }
}

impl IndexMut<PcbId> for PcbPool {
    fn index_mut(&mut self, id: PcbId) -> &mut Pcb {
        &mut self.slots[id.index()]
    }
}

// ──────────────────────────────────────────────────────────────
//  Process queues
// ──────────────────────────────────────────────────────────────

/// A circular doubly-linked queue of PCBs addressed by its tail:
/// the head is `tail.next`.
#[derive(Clone, Copy)]
pub struct ProcQueue {
    tail: Option<PcbId>,
}

impl ProcQueue {
    pub const fn new() -> ProcQueue {
        ProcQueue { tail: None }
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    pub fn head(&self, pool: &PcbPool) -> Option<PcbId> {
        let tail = self.tail?;
        pool[tail].next
    }

    /// Append at the tail.
    pub fn enqueue(&mut self, pool: &mut PcbPool, p: PcbId) {
        match self.tail {
            None => {
                pool[p].next = Some(p);
                pool[p].prev = Some(p);
            }
            Some(tail) => {
                let head = pool[tail].next.expect("process queue link missing");
                pool[p].next = Some(head);
                pool[head].prev = Some(p);
                pool[tail].next = Some(p);
                pool[p].prev = Some(tail);
            }
        }
        self.tail = Some(p);
    }

    /// Remove and return the head.
    pub fn dequeue(&mut self, pool: &mut PcbPool) -> Option<PcbId> {
        let head = self.head(pool)?;
        self.remove(pool, head)
    }

    /// Remove a specific PCB, wherever it sits in the queue. Returns
    /// `None` if the PCB is not actually in this queue.
    pub fn remove(&mut self, pool: &mut PcbPool, p: PcbId) -> Option<PcbId> {
        let tail = self.tail?;
        let head = pool[tail].next.expect("process queue link missing");
        let mut cur = head;
        loop {
            if cur == p {
                if pool[p].next == Some(p) {
                    // only element
                    self.tail = None;
                } else {
                    let prev = pool[p].prev.expect("process queue link missing");
                    let next = pool[p].next.expect("process queue link missing");
                    pool[prev].next = Some(next);
                    pool[next].prev = Some(prev);
                    if self.tail == Some(p) {
                        self.tail = Some(prev);
                    }
                }
                pool[p].next = None;
                pool[p].prev = None;
                return Some(p);
            }
            cur = pool[cur].next.expect("process queue link missing");
            if cur == head {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_exactly_max_proc_descriptors() {
        let mut pool = PcbPool::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_PROC {
            ids.push(pool.alloc().expect("pool ran dry early"));
        }
        assert!(pool.alloc().is_none());
        pool.release(ids.pop().unwrap());
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn alloc_clears_recycled_descriptors() {
        let mut pool = PcbPool::new();
        let p = pool.alloc().unwrap();
        pool[p].cpu_time = 99;
        pool[p].state.set_v0(7);
        pool.release(p);
        let q = pool.alloc().unwrap();
        assert_eq!(pool[q].cpu_time, 0);
        assert_eq!(pool[q].state.regs[crate::machine::cp0::reg::V0], 0);
        assert!(pool[q].blocked_on.is_none());
    }

    #[test]
    fn queue_is_fifo() {
        let mut pool = PcbPool::new();
        let mut q = ProcQueue::new();
        assert!(q.is_empty());
        assert!(q.dequeue(&mut pool).is_none());

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        q.enqueue(&mut pool, a);
        q.enqueue(&mut pool, b);
        q.enqueue(&mut pool, c);

        assert_eq!(q.head(&pool), Some(a));
        assert_eq!(q.dequeue(&mut pool), Some(a));
        assert_eq!(q.dequeue(&mut pool), Some(b));
        assert_eq!(q.dequeue(&mut pool), Some(c));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_from_the_middle_and_the_tail() {
        let mut pool = PcbPool::new();
        let mut q = ProcQueue::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        q.enqueue(&mut pool, a);
        q.enqueue(&mut pool, b);
        q.enqueue(&mut pool, c);

        assert_eq!(q.remove(&mut pool, b), Some(b));
        assert_eq!(q.remove(&mut pool, c), Some(c));
        assert_eq!(q.dequeue(&mut pool), Some(a));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_of_a_stranger_is_an_error() {
        let mut pool = PcbPool::new();
        let mut q = ProcQueue::new();
        let a = pool.alloc().unwrap();
        let stranger = pool.alloc().unwrap();
        q.enqueue(&mut pool, a);
        assert_eq!(q.remove(&mut pool, stranger), None);
        assert_eq!(q.head(&pool), Some(a));
    }

    #[test]
    fn tree_links_and_arbitrary_child_removal() {
        let mut pool = PcbPool::new();
        let parent = pool.alloc().unwrap();
        let c1 = pool.alloc().unwrap();
        let c2 = pool.alloc().unwrap();
        let c3 = pool.alloc().unwrap();
        pool.insert_child(parent, c1);
        pool.insert_child(parent, c2);
        pool.insert_child(parent, c3);

        // newest child is first
        assert_eq!(pool[parent].first_child(), Some(c3));

        // unlink the middle child
        assert_eq!(pool.unlink_child(c2), Some(c2));
        assert!(pool[c2].parent().is_none());

        assert_eq!(pool.remove_first_child(parent), Some(c3));
        assert_eq!(pool.remove_first_child(parent), Some(c1));
        assert_eq!(pool.remove_first_child(parent), None);
    }

    #[test]
    fn unlink_without_a_parent_is_an_error() {
        let mut pool = PcbPool::new();
        let orphan = pool.alloc().unwrap();
        assert_eq!(pool.unlink_child(orphan), None);
    }
}
