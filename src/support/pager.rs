//! The pager: TLB-invalid faults, the shared swap pool, and the traffic
//! between swap frames and the backing store on disk 0.

use lazy_static::lazy_static;
use spin::Mutex;

use super::syscalls::program_trap;
use super::{kcall, sup_mut, with_locked, SupId, DEV_MUTEX, PAGE_FAULT_EXCEPT};
use crate::machine::cp0::InterruptGuard;
use crate::machine::tlb::{self, EntryHi, EntryLo, PageTableEntry};
use crate::machine::{self, PageSlot, KUSEG_SHARE_PAGES, LINE_DISK, MAX_PAGES, PAGE_SIZE,
    SWAP_POOL_BASE, SWAP_POOL_FRAMES, UPROC_MAX, VPN_SHARE_BASE};
use crate::nucleus::scheduler;
use crate::nucleus::sem::Semaphore;
use crate::nucleus::DeviceSems;

/// Disk 0 backs every demand-paged frame.
pub const BACKING_DISK: usize = 0;

/// Sectors 0..256 back the eight private address spaces, 32 sectors
/// apiece; the shared segment starts right after.
pub const SHARED_SECTOR_BASE: u32 = (UPROC_MAX * MAX_PAGES) as u32;

/// Backing-store sector of private page-table slot `slot` of `asid`.
pub fn private_sector(asid: u8, slot: usize) -> u32 {
    (asid as u32 - 1) * MAX_PAGES as u32 + slot as u32
}

/// Backing-store sector of shared page `slot`.
pub fn shared_sector(slot: usize) -> u32 {
    SHARED_SECTOR_BASE + slot as u32
}

/// Physical address of swap frame `index`.
pub fn frame_addr(index: usize) -> u32 {
    (SWAP_POOL_BASE + index * PAGE_SIZE) as u32
}

// ──────────────────────────────────────────────────────────────
//  Swap pool
// ──────────────────────────────────────────────────────────────

/// Which page-table entry a swap frame currently backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteRef {
    Private(SupId, usize),
    Shared(usize),
}

/// An occupied swap frame: owner (ASID 0 for a shared page), the VPN it
/// holds, and the page-table entry mapping it.
#[derive(Debug, Clone, Copy)]
pub struct FrameEntry {
    pub asid: u8,
    pub vpn: u32,
    pub pte: PteRef,
}

pub struct SwapPool {
    pub entries: [Option<FrameEntry>; SWAP_POOL_FRAMES],
    cursor: usize,
    /// ASID currently inside the pager, so a death mid-fault can release
    /// the mutex.
    holder: Option<u8>,
}

impl SwapPool {
    pub fn new() -> SwapPool {
        SwapPool {
            entries: [None; SWAP_POOL_FRAMES],
            cursor: 0,
            holder: None,
        }
    }

    /// First unoccupied frame if any; otherwise strict FIFO through the
    /// single cursor.
    pub fn pick_frame(&mut self) -> usize {
        if let Some(i) = self.entries.iter().position(Option::is_none) {
            return i;
        }
        let victim = self.cursor;
        self.cursor = (self.cursor + 1) % SWAP_POOL_FRAMES;
        victim
    }

    /// Drop every frame owned by `asid` (called when the owner dies).
    pub fn release_frames_of(&mut self, asid: u8) {
        for entry in self.entries.iter_mut() {
            if matches!(entry, Some(e) if e.asid == asid) {
                *entry = None;
            }
        }
    }
}

lazy_static! {
    static ref SWAP_POOL: Mutex<SwapPool> = Mutex::new(SwapPool::new());

    /// The global table mapping the 32 shared-segment pages. Entries are
    /// global (ASID-blind) and start invalid.
    static ref SHARED_PT: Mutex<[PageTableEntry; KUSEG_SHARE_PAGES]> = {
        let mut pt = [PageTableEntry::zeroed(); KUSEG_SHARE_PAGES];
        for (i, entry) in pt.iter_mut().enumerate() {
            let mut lo = EntryLo::invalid_dirty();
            lo.set_global();
            *entry = PageTableEntry {
                hi: EntryHi::new(VPN_SHARE_BASE + i as u32, 0),
                lo,
            };
        }
        Mutex::new(pt)
    };
}

/// One semaphore serialises the whole pager.
static SWAP_SEM: Semaphore = Semaphore::new(1);

pub fn init_swap_structs() {
    with_locked(&SWAP_POOL, |pool| *pool = SwapPool::new());
    // Touch the shared table so its entries are built before any fault.
    let _ = shared_pte(0);
    SWAP_SEM.addr().write(1);
}

/// Snapshot of one shared-segment PTE.
pub fn shared_pte(slot: usize) -> PageTableEntry {
    with_locked(&SHARED_PT, |pt| pt[slot])
}

/// Apply `f` to the PTE behind `r` and return the updated entry.
fn pte_update(r: PteRef, f: impl FnOnce(&mut PageTableEntry)) -> PageTableEntry {
    match r {
        PteRef::Private(sid, i) => {
            let pte = &mut sup_mut(sid).page_table[i];
            f(pte);
            *pte
        }
        PteRef::Shared(i) => with_locked(&SHARED_PT, |pt| {
            f(&mut pt[i]);
            pt[i]
        }),
    }
}

fn sector_of(asid: u8, vpn: u32) -> u32 {
    match machine::page_slot(vpn).expect("swap frame maps an unmapped VPN") {
        PageSlot::Private(i) => private_sector(asid, i),
        PageSlot::Shared(i) => shared_sector(i),
    }
}

// ──────────────────────────────────────────────────────────────
//  Backing store I/O
// ──────────────────────────────────────────────────────────────

/// Move one page between a swap frame and disk 0. The frame itself is
/// the DMA target; only the disk-0 mutex is taken, never the other way
/// around the swap-pool mutex.
fn backing_transfer(sector: u32, frame: u32, dir: super::dma::Dir) -> super::dma::DevResult {
    let mutex = DEV_MUTEX.at(DeviceSems::index_of(LINE_DISK, BACKING_DISK, false));
    kcall::passeren(mutex.addr());
    let result = super::dma::disk_transfer(BACKING_DISK, sector, frame, dir);
    kcall::verhogen(mutex.addr());
    result
}

// ──────────────────────────────────────────────────────────────
//  Fault handling
// ──────────────────────────────────────────────────────────────

fn acquire_pager(asid: u8) {
    kcall::passeren(SWAP_SEM.addr());
    with_locked(&SWAP_POOL, |pool| pool.holder = Some(asid));
}

fn release_pager() {
    with_locked(&SWAP_POOL, |pool| pool.holder = None);
    kcall::verhogen(SWAP_SEM.addr());
}

/// If `asid` died inside the pager, put the mutex back.
pub fn release_if_holding(asid: u8) {
    let held = with_locked(&SWAP_POOL, |pool| {
        if pool.holder == Some(asid) {
            pool.holder = None;
            true
        } else {
            false
        }
    });
    if held {
        kcall::verhogen(SWAP_SEM.addr());
    }
}

/// Drop a dead process's frames.
pub fn release_frames_of(asid: u8) {
    with_locked(&SWAP_POOL, |pool| pool.release_frames_of(asid));
}

/// TLB-invalid fault service: bring the missing page into a swap frame,
/// evicting first if need be, and publish the new mapping.
pub fn handle_fault(sid: SupId) -> ! {
    let asid = sup_mut(sid).asid;
    let vpn = EntryHi(sup_mut(sid).except_state[PAGE_FAULT_EXCEPT].entry_hi).vpn();

    let slot = match machine::page_slot(vpn) {
        Some(slot) => slot,
        None => program_trap(sid),
    };

    acquire_pager(asid);

    // A shared page may have been brought in while this fault waited on
    // the mutex; nothing to do then.
    if let PageSlot::Shared(i) = slot {
        if shared_pte(i).lo.valid() {
            release_pager();
            scheduler::resume(&sup_mut(sid).except_state[PAGE_FAULT_EXCEPT]);
        }
    }

    let (frame, evicted) = with_locked(&SWAP_POOL, |pool| {
        let f = pool.pick_frame();
        (f, pool.entries[f])
    });
    let frame_pa = frame_addr(frame);

    if let Some(old) = evicted {
        // Unmap before the frame content leaves RAM: mark the old entry
        // invalid and fix any cached TLB copy in one unpreemptible step,
        // then write the frame back.
        {
            let _guard = InterruptGuard::acquire();
            let pte = pte_update(old.pte, |p| p.lo.set_valid(false));
            tlb::flush_cached(pte);
        }
        if backing_transfer(sector_of(old.asid, old.vpn), frame_pa, super::dma::Dir::Write)
            .is_err()
        {
            release_pager();
            program_trap(sid);
        }
    }

    let (owner, pte_ref) = match slot {
        PageSlot::Private(i) => (asid, PteRef::Private(sid, i)),
        PageSlot::Shared(i) => (0, PteRef::Shared(i)),
    };

    if backing_transfer(sector_of(owner, vpn), frame_pa, super::dma::Dir::Read).is_err() {
        release_pager();
        program_trap(sid);
    }

    with_locked(&SWAP_POOL, |pool| {
        pool.entries[frame] = Some(FrameEntry {
            asid: owner,
            vpn,
            pte: pte_ref,
        });
    });

    // Publish: page table first, then the TLB, in one unpreemptible step.
    {
        let _guard = InterruptGuard::acquire();
        let pte = pte_update(pte_ref, |p| {
            p.lo.set_pfn(frame_pa >> 12);
            p.lo.set_valid(true);
        });
        if tlb::probe(pte.hi) {
            tlb::write_indexed(pte);
        } else {
            tlb::write_random(pte);
        }
    }

    release_pager();
    scheduler::resume(&sup_mut(sid).except_state[PAGE_FAULT_EXCEPT])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(asid: u8, vpn: u32) -> Option<FrameEntry> {
        Some(FrameEntry {
            asid,
            vpn,
            pte: PteRef::Private(SupId::from_asid(asid), 0),
        })
    }

    #[test]
    fn free_frames_are_used_before_any_eviction() {
        let mut pool = SwapPool::new();
        assert_eq!(pool.pick_frame(), 0);
        pool.entries[0] = held(1, 0x80000);
        assert_eq!(pool.pick_frame(), 1);
        pool.entries[1] = held(2, 0x80000);
        // a hole left by a released frame is preferred over eviction
        pool.entries[0] = None;
        assert_eq!(pool.pick_frame(), 0);
    }

    #[test]
    fn full_pool_cycles_fifo_through_all_frames() {
        let mut pool = SwapPool::new();
        for i in 0..SWAP_POOL_FRAMES {
            let f = pool.pick_frame();
            assert_eq!(f, i);
            pool.entries[f] = held(1, 0x80000 + i as u32);
        }
        let mut victims = Vec::new();
        for _ in 0..SWAP_POOL_FRAMES {
            victims.push(pool.pick_frame());
        }
        let expected: Vec<usize> = (0..SWAP_POOL_FRAMES).collect();
        assert_eq!(victims, expected);
        // and it wraps
        assert_eq!(pool.pick_frame(), 0);
    }

    #[test]
    fn a_dead_process_loses_its_frames_but_not_shared_ones() {
        let mut pool = SwapPool::new();
        pool.entries[0] = held(3, 0x80000);
        pool.entries[1] = held(4, 0x80001);
        pool.entries[2] = Some(FrameEntry {
            asid: 0,
            vpn: VPN_SHARE_BASE,
            pte: PteRef::Shared(0),
        });
        pool.release_frames_of(3);
        assert!(pool.entries[0].is_none());
        assert!(pool.entries[1].is_some());
        assert!(pool.entries[2].is_some());
    }

    proptest::proptest! {
        /// Whatever the occupancy pattern, a free frame is always chosen
        /// over evicting someone.
        #[test]
        fn never_evicts_while_a_frame_is_free(
            occupied in proptest::collection::vec(proptest::bool::ANY, SWAP_POOL_FRAMES),
            spins in 0usize..40,
        ) {
            let mut pool = SwapPool::new();
            for _ in 0..spins {
                pool.pick_frame(); // scramble the cursor
            }
            for (i, occ) in occupied.iter().enumerate() {
                pool.entries[i] = if *occ { held(1, 0x80000 + i as u32) } else { None };
            }
            let picked = pool.pick_frame();
            if occupied.contains(&false) {
                proptest::prop_assert!(pool.entries[picked].is_none());
            } else {
                proptest::prop_assert!(picked < SWAP_POOL_FRAMES);
            }
        }
    }

    #[test]
    fn backing_sectors_never_collide() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for asid in 1..=UPROC_MAX as u8 {
            for slot in 0..MAX_PAGES {
                assert!(seen.insert(private_sector(asid, slot)));
            }
        }
        for slot in 0..KUSEG_SHARE_PAGES {
            assert!(seen.insert(shared_sector(slot)));
        }
        assert_eq!(seen.len(), 256 + 32);
    }

    #[test]
    fn swap_frames_sit_above_the_kernel_region() {
        assert_eq!(frame_addr(0), 0x2002_0000);
        assert_eq!(frame_addr(15), 0x2002_F000);
    }
}
