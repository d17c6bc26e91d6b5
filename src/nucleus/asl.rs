//! Active semaphore list: the set of semaphores that currently have
//! blocked waiters, sorted by semaphore address. A descriptor lives on
//! the list exactly as long as its waiter queue is non-empty; two dummy
//! descriptors with keys 0 and max bracket the list so traversal has no
//! special cases.

use super::pcb::{PcbId, PcbPool, ProcQueue, MAX_PROC};
use super::sem::SemAddr;

/// 20 descriptors plus the two sentinels.
pub const NUM_SEMD: usize = MAX_PROC + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SemdId(u8);

impl SemdId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

const HEAD: SemdId = SemdId(0);
const TAIL: SemdId = SemdId(1);

struct Semd {
    next: Option<SemdId>,
    key: SemAddr,
    queue: ProcQueue,
}

impl Semd {
    fn empty() -> Semd {
        Semd {
            next: None,
            key: SemAddr::from_raw(0),
            queue: ProcQueue::new(),
        }
    }
}

/// Raised when a waiter needs a fresh descriptor and the pool is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemdPoolExhausted;

pub struct Asl {
    descs: [Semd; NUM_SEMD],
    free_head: Option<SemdId>,
}

impl Asl {
    pub fn new() -> Asl {
        let mut asl = Asl {
            descs: core::array::from_fn(|_| Semd::empty()),
            free_head: None,
        };
        // sentinels
        asl.descs[HEAD.index()].next = Some(TAIL);
        asl.descs[HEAD.index()].key = SemAddr::from_raw(0);
        asl.descs[TAIL.index()].next = None;
        asl.descs[TAIL.index()].key = SemAddr::from_raw(usize::MAX);
        for i in 2..NUM_SEMD {
            asl.free_desc(SemdId(i as u8));
        }
        asl
    }

    fn free_desc(&mut self, d: SemdId) {
        self.descs[d.index()].next = self.free_head;
        self.free_head = Some(d);
    }

    fn alloc_desc(&mut self) -> Option<SemdId> {
        let d = self.free_head?;
        self.free_head = self.descs[d.index()].next;
        self.descs[d.index()] = Semd::empty();
        Some(d)
    }

    /// The descriptor just before where `key` sits (or would sit).
    fn find_prev(&self, key: SemAddr) -> SemdId {
        let mut prev = HEAD;
        loop {
            let cur = self.descs[prev.index()]
                .next
                .expect("semaphore list truncated");
            if self.descs[cur.index()].key >= key {
                return prev;
            }
            prev = cur;
        }
    }

    /// Unlink and recycle `d` if its queue drained.
    fn release_if_empty(&mut self, prev: SemdId, d: SemdId) {
        if self.descs[d.index()].queue.is_empty() {
            self.descs[prev.index()].next = self.descs[d.index()].next;
            self.free_desc(d);
        }
    }

    /// Append `p` to the waiter queue of the semaphore at `key`,
    /// allocating a descriptor if the semaphore is not yet active, and
    /// stamp the PCB's blocked-on field.
    pub fn insert_blocked(
        &mut self,
        pool: &mut PcbPool,
        key: SemAddr,
        p: PcbId,
    ) -> Result<(), SemdPoolExhausted> {
        let prev = self.find_prev(key);
        let mut d = self.descs[prev.index()].next.expect("semaphore list truncated");
        if self.descs[d.index()].key != key {
            d = self.alloc_desc().ok_or(SemdPoolExhausted)?;
            self.descs[d.index()].next = self.descs[prev.index()].next;
            self.descs[prev.index()].next = Some(d);
            self.descs[d.index()].key = key;
        }
        self.descs[d.index()].queue.enqueue(pool, p);
        pool[p].blocked_on = Some(key);
        Ok(())
    }

    /// Remove and return the head waiter of the semaphore at `key`,
    /// clearing its blocked-on field. Recycles the descriptor when the
    /// queue drains.
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, key: SemAddr) -> Option<PcbId> {
        let prev = self.find_prev(key);
        let d = self.descs[prev.index()].next.expect("semaphore list truncated");
        if self.descs[d.index()].key != key {
            return None;
        }
        let p = self.descs[d.index()].queue.dequeue(pool);
        if let Some(p) = p {
            pool[p].blocked_on = None;
        }
        self.release_if_empty(prev, d);
        p
    }

    /// Remove a specific waiter from its semaphore's queue. The blocked-on
    /// field is deliberately left in place (cascaded termination wants to
    /// know what the victim was blocked on). `None` if the PCB was not in
    /// the queue it claims to be in.
    pub fn out_blocked(&mut self, pool: &mut PcbPool, p: PcbId) -> Option<PcbId> {
        let key = pool[p].blocked_on?;
        let prev = self.find_prev(key);
        let d = self.descs[prev.index()].next.expect("semaphore list truncated");
        if self.descs[d.index()].key != key {
            return None;
        }
        let out = self.descs[d.index()].queue.remove(pool, p);
        self.release_if_empty(prev, d);
        out
    }

    /// Peek at the head waiter without removing it.
    pub fn head_blocked(&self, pool: &PcbPool, key: SemAddr) -> Option<PcbId> {
        let prev = self.find_prev(key);
        let d = self.descs[prev.index()].next.expect("semaphore list truncated");
        if self.descs[d.index()].key != key {
            return None;
        }
        self.descs[d.index()].queue.head(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nucleus::sem::Semaphore;

    fn setup() -> (PcbPool, Asl) {
        (PcbPool::new(), Asl::new())
    }

    #[test]
    fn waiters_are_released_in_arrival_order() {
        let (mut pool, mut asl) = setup();
        let sem = Semaphore::new(0);
        let key = sem.addr();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, key, a).unwrap();
        asl.insert_blocked(&mut pool, key, b).unwrap();
        asl.insert_blocked(&mut pool, key, c).unwrap();

        assert_eq!(asl.head_blocked(&pool, key), Some(a));
        assert_eq!(asl.remove_blocked(&mut pool, key), Some(a));
        assert_eq!(asl.remove_blocked(&mut pool, key), Some(b));
        assert_eq!(asl.remove_blocked(&mut pool, key), Some(c));
        assert_eq!(asl.remove_blocked(&mut pool, key), None);
    }

    #[test]
    fn remove_clears_blocked_on_and_recycles_the_descriptor() {
        let (mut pool, mut asl) = setup();
        let sem = Semaphore::new(0);
        let p = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, sem.addr(), p).unwrap();
        assert_eq!(pool[p].blocked_on, Some(sem.addr()));

        assert_eq!(asl.remove_blocked(&mut pool, sem.addr()), Some(p));
        assert!(pool[p].blocked_on.is_none());
        // descriptor is gone from the active list
        assert_eq!(asl.head_blocked(&pool, sem.addr()), None);
    }

    #[test]
    fn out_blocked_keeps_the_blocked_on_stamp() {
        let (mut pool, mut asl) = setup();
        let sem = Semaphore::new(0);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, sem.addr(), a).unwrap();
        asl.insert_blocked(&mut pool, sem.addr(), b).unwrap();

        assert_eq!(asl.out_blocked(&mut pool, b), Some(b));
        assert_eq!(pool[b].blocked_on, Some(sem.addr()));
        // a is still queued
        assert_eq!(asl.head_blocked(&pool, sem.addr()), Some(a));
    }

    #[test]
    fn out_blocked_on_a_non_member_is_an_error() {
        let (mut pool, mut asl) = setup();
        let sem = Semaphore::new(0);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        asl.insert_blocked(&mut pool, sem.addr(), a).unwrap();
        // b was never inserted; give it a stale stamp by hand
        pool[b].blocked_on = Some(sem.addr());
        asl.out_blocked(&mut pool, a).unwrap();
        assert_eq!(asl.out_blocked(&mut pool, b), None);
    }

    #[test]
    fn descriptors_sort_by_address_and_recycle() {
        let (mut pool, mut asl) = setup();
        let sems: Vec<Semaphore> = (0..10).map(|_| Semaphore::new(0)).collect();
        let mut ids = Vec::new();
        for sem in &sems {
            let p = pool.alloc().unwrap();
            asl.insert_blocked(&mut pool, sem.addr(), p).unwrap();
            ids.push(p);
        }
        for (sem, p) in sems.iter().zip(&ids) {
            assert_eq!(asl.remove_blocked(&mut pool, sem.addr()), Some(*p));
        }
        // every descriptor went back to the free list; run it again
        for sem in &sems {
            let p = pool.alloc().unwrap();
            asl.insert_blocked(&mut pool, sem.addr(), p).unwrap();
            asl.remove_blocked(&mut pool, sem.addr());
            pool.release(p);
        }
    }

    proptest::proptest! {
        /// Drive random P/V interleavings against one semaphore and check
        /// them against a straight queue model: blocked set, release
        /// order (P-arrival order) and the semaphore value all match.
        #[test]
        fn p_v_interleavings_release_in_arrival_order(
            init in 0i32..3,
            ops in proptest::collection::vec(proptest::bool::ANY, 0..64),
        ) {
            use std::collections::VecDeque;

            let (mut pool, mut asl) = setup();
            let sem = Semaphore::new(init);
            let key = sem.addr();
            let mut model_value = init;
            let mut model_blocked: VecDeque<PcbId> = VecDeque::new();

            for is_p in ops {
                if is_p {
                    let Some(p) = pool.alloc() else { continue };
                    model_value -= 1;
                    if key.decrement() < 0 {
                        asl.insert_blocked(&mut pool, key, p).unwrap();
                        model_blocked.push_back(p);
                    } else {
                        pool.release(p);
                    }
                } else {
                    model_value += 1;
                    if key.increment() <= 0 {
                        let released = asl.remove_blocked(&mut pool, key);
                        proptest::prop_assert_eq!(released, model_blocked.pop_front());
                        if let Some(p) = released {
                            pool.release(p);
                        }
                    }
                }
                proptest::prop_assert_eq!(key.read(), model_value);
            }
            proptest::prop_assert_eq!(
                asl.head_blocked(&pool, key),
                model_blocked.front().copied()
            );
        }
    }

    #[test]
    fn twenty_distinct_semaphores_fit_and_descriptors_recycle() {
        let (mut pool, mut asl) = setup();
        let sems: Vec<Semaphore> = (0..MAX_PROC).map(|_| Semaphore::new(0)).collect();
        for sem in &sems {
            let p = pool.alloc().unwrap();
            asl.insert_blocked(&mut pool, sem.addr(), p).unwrap();
        }
        for sem in &sems {
            assert!(asl.remove_blocked(&mut pool, sem.addr()).is_some());
        }
    }
}
