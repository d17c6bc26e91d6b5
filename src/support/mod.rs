//! The support level: demand paging, the user syscall surface, the delay
//! facility and shared-segment semaphores. Runs in kernel mode inside
//! each user process, entered through the nucleus pass-up mechanism, and
//! reaches back into the nucleus only through the SYSCALL trap (`kcall`).

pub mod chario;
pub mod delay;
pub mod dma;
pub mod kcall;
pub mod pager;
pub mod shared;
pub mod syscalls;

use core::cell::UnsafeCell;

use spin::Mutex;

use crate::machine::cp0::{Context, InterruptGuard, ProcessorState, Status};
use crate::machine::tlb::{EntryHi, EntryLo, PageTableEntry};
use crate::machine::{self, MAX_PAGES, STACK_PAGE, UPROC_MAX, VPN_STACK, VPN_TEXT_BASE};
use crate::nucleus::sem::Semaphore;

/// Pass-up slot indices inside a support structure.
pub const PAGE_FAULT_EXCEPT: usize = 0;
pub const GENERAL_EXCEPT: usize = 1;

const HANDLER_STACK_WORDS: usize = 500;

// ──────────────────────────────────────────────────────────────
//  Support structures
// ──────────────────────────────────────────────────────────────

/// Handle of a support structure; its value is the owning ASID (1..=8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupId(u8);

impl SupId {
    pub fn from_asid(asid: u8) -> SupId {
        SupId(asid)
    }

    /// Decode a handle from a register (0 means "none").
    pub fn from_reg(reg: u32) -> Option<SupId> {
        if (1..=UPROC_MAX as u32).contains(&reg) {
            Some(SupId(reg as u8))
        } else {
            None
        }
    }

    pub fn to_reg(self) -> u32 {
        self.0 as u32
    }

    pub fn asid(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

/// Per-user-process support state: the pass-up landing slots, the private
/// page table, the private semaphore, and the stacks its two handlers run
/// on.
#[repr(C)]
pub struct Support {
    pub asid: u8,
    pub except_state: [ProcessorState; 2],
    pub except_context: [Context; 2],
    pub page_table: [PageTableEntry; MAX_PAGES],
    /// Blocked on by the delay facility and the shared-semaphore lists.
    pub private_sem: Semaphore,
    tlb_stack: [u32; HANDLER_STACK_WORDS],
    gen_stack: [u32; HANDLER_STACK_WORDS],
}

impl Support {
    const fn empty() -> Support {
        Support {
            asid: 0,
            except_state: [ProcessorState::zeroed(); 2],
            except_context: [Context::zeroed(); 2],
            page_table: [PageTableEntry::zeroed(); MAX_PAGES],
            private_sem: Semaphore::new(0),
            tlb_stack: [0; HANDLER_STACK_WORDS],
            gen_stack: [0; HANDLER_STACK_WORDS],
        }
    }

    fn tlb_stack_top(&self) -> u32 {
        self.tlb_stack.as_ptr() as u32 + (HANDLER_STACK_WORDS * machine::WORD_LEN) as u32
    }

    fn gen_stack_top(&self) -> u32 {
        self.gen_stack.as_ptr() as u32 + (HANDLER_STACK_WORDS * machine::WORD_LEN) as u32
    }
}

struct SupportArena(UnsafeCell<[Support; UPROC_MAX]>);

// Uniprocessor: a support structure is touched by its owning process, or
// by the nucleus while that process sits trapped.
unsafe impl Sync for SupportArena {}

const EMPTY_SUPPORT: Support = Support::empty();

static ARENA: SupportArena = SupportArena(UnsafeCell::new([EMPTY_SUPPORT; UPROC_MAX]));

/// Fetch a support structure by handle.
pub fn sup_mut(id: SupId) -> &'static mut Support {
    unsafe { &mut (*ARENA.0.get())[id.index()] }
}

/// Free stack of support structures.
struct FreeStack {
    ids: [u8; UPROC_MAX],
    top: usize,
}

static FREE: Mutex<FreeStack> = Mutex::new(FreeStack {
    ids: [0; UPROC_MAX],
    top: 0,
});

pub fn alloc_support() -> Option<SupId> {
    with_locked(&FREE, |free| {
        if free.top == 0 {
            None
        } else {
            free.top -= 1;
            Some(SupId(free.ids[free.top]))
        }
    })
}

pub fn free_support(id: SupId) {
    with_locked(&FREE, |free| {
        free.ids[free.top] = id.0;
        free.top += 1;
    });
}

fn init_support_pool() {
    with_locked(&FREE, |free| {
        for asid in 1..=UPROC_MAX as u8 {
            free.ids[free.top] = asid;
            free.top += 1;
        }
    });
}

/// Take a spin lock with interrupts masked. Support code is preemptible;
/// holding a spin lock across a preemption would hang the machine.
pub fn with_locked<T, R>(m: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let _guard = InterruptGuard::acquire();
    let mut inner = m.lock();
    f(&mut inner)
}

// ──────────────────────────────────────────────────────────────
//  Support-level semaphores
// ──────────────────────────────────────────────────────────────

/// One mutex per (sub)device, serialising the device registers and the
/// DMA buffer row behind them.
pub struct DeviceMutexes {
    sems: [Semaphore; machine::NUM_DEVICES],
}

impl DeviceMutexes {
    const fn new() -> DeviceMutexes {
        const ONE: Semaphore = Semaphore::new(1);
        DeviceMutexes {
            sems: [ONE; machine::NUM_DEVICES],
        }
    }

    pub fn at(&self, index: usize) -> &Semaphore {
        &self.sems[index]
    }

    pub fn device(&self, line: usize, dev: usize) -> &Semaphore {
        self.at(crate::nucleus::DeviceSems::index_of(line, dev, false))
    }

    pub fn terminal_read(&self, dev: usize) -> &Semaphore {
        self.at(crate::nucleus::DeviceSems::index_of(
            machine::LINE_TERMINAL,
            dev,
            true,
        ))
    }
}

pub static DEV_MUTEX: DeviceMutexes = DeviceMutexes::new();

/// V-ed once per user process death; the instantiator collects all eight
/// before tearing everything down.
pub static MASTER_SEM: Semaphore = Semaphore::new(0);

// ──────────────────────────────────────────────────────────────
//  Page tables and process launch
// ──────────────────────────────────────────────────────────────

/// Fill a fresh private page table: pages 0..=30 back .text/.data, page
/// 31 backs the stack. Everything starts invalid and writable.
fn init_page_table(sup: &mut Support) {
    let asid = sup.asid;
    for i in 0..MAX_PAGES - 1 {
        sup.page_table[i] = PageTableEntry {
            hi: EntryHi::new(VPN_TEXT_BASE + i as u32, asid),
            lo: EntryLo::invalid_dirty(),
        };
    }
    sup.page_table[STACK_PAGE] = PageTableEntry {
        hi: EntryHi::new(VPN_STACK, asid),
        lo: EntryLo::invalid_dirty(),
    };
}

/// Status word for support-level handler contexts: kernel mode,
/// interrupts and the quantum timer enabled once the context is live.
fn handler_status() -> u32 {
    (Status::IEP | Status::IM_ALL | Status::TE).bits()
}

/// Build and launch one user process.
fn launch_uproc(asid: u8) {
    let sid = alloc_support().expect("support pool dry during instantiation");
    let sup = sup_mut(sid);
    sup.asid = asid;
    sup.private_sem.addr().write(0);
    init_page_table(sup);

    let tlb_stack_top = sup.tlb_stack_top();
    let gen_stack_top = sup.gen_stack_top();
    sup.except_context[PAGE_FAULT_EXCEPT] = Context {
        stack_ptr: tlb_stack_top,
        status: handler_status(),
        pc: syscalls::page_fault_handler as *const () as u32,
    };
    sup.except_context[GENERAL_EXCEPT] = Context {
        stack_ptr: gen_stack_top,
        status: handler_status(),
        pc: syscalls::general_handler as *const () as u32,
    };

    let mut state = ProcessorState::zeroed();
    state.set_entry(machine::UPROC_ENTRY_PC);
    state.set_sp(machine::UPROC_STACK_TOP);
    state.status = (Status::IEP | Status::KUP | Status::IM_ALL | Status::TE).bits();
    state.entry_hi = EntryHi::new(0, asid).0;

    if kcall::create_process(&state, Some(sid)) < 0 {
        panic!("no PCB for user process {}", asid);
    }
}

/// Copy each user process's executable image (the reserved low blocks of
/// its flash device) onto its private backing-store range on disk 0. The
/// pager then pages everything, text included, from the disk.
fn seed_backing_store() {
    for asid in 1..=UPROC_MAX as u8 {
        let dev = (asid - 1) as usize;
        let staging = (machine::FLASH_DMA_BASE + dev * machine::PAGE_SIZE) as u32;
        for block in 0..MAX_PAGES as u32 {
            if dma::flash_transfer(dev, block, staging, dma::Dir::Read).is_err() {
                panic!("backing store seed: flash {} block {} unreadable", dev, block);
            }
            let sector = pager::private_sector(asid, block as usize);
            if dma::disk_transfer(pager::BACKING_DISK, sector, staging, dma::Dir::Write).is_err() {
                panic!("backing store seed: disk write failed at sector {}", sector);
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  Instantiator
// ──────────────────────────────────────────────────────────────

/// The first process. Brings up every support-level facility, launches
/// the eight user processes, waits for all of them to finish, then
/// terminates - the cascade reaps the delay daemon and the machine halts.
pub extern "C" fn instantiate() -> ! {
    init_support_pool();
    pager::init_swap_structs();
    delay::init_adl();
    shared::init_alsl();
    seed_backing_store();
    crate::log_info!("support level up, launching {} user processes", UPROC_MAX);

    for asid in 1..=UPROC_MAX as u8 {
        launch_uproc(asid);
    }

    for _ in 0..UPROC_MAX {
        kcall::passeren(MASTER_SEM.addr());
    }

    crate::log_info!("all user processes done");
    kcall::terminate()
}
