//! Exception dispatch and the eight kernel-mode syscall services.
//!
//! Every handler computes what should happen next and performs the
//! privileged switch exactly once, at its tail, after the nucleus lock
//! has been dropped: resume the saved state, load a pass-up context, or
//! fall into the scheduler.

use super::interrupts;
use super::scheduler;
use super::sem::SemAddr;
use super::{DeviceSems, DEVICE_SEMS, NUCLEUS};
use crate::machine;
use crate::machine::cp0::{self, ProcessorState};
use crate::machine::tlb::{self, EntryHi};
use crate::machine::PageSlot;
use crate::support::{self, SupId};

/// Kernel syscall numbers (passed in a0, kernel-previous mode only).
pub const SYS_CREATE_PROCESS: u32 = 1;
pub const SYS_TERMINATE_PROCESS: u32 = 2;
pub const SYS_PASSEREN: u32 = 3;
pub const SYS_VERHOGEN: u32 = 4;
pub const SYS_WAIT_IO: u32 = 5;
pub const SYS_GET_CPU_TIME: u32 = 6;
pub const SYS_WAIT_CLOCK: u32 = 7;
pub const SYS_GET_SUPPORT: u32 = 8;

const ERR: u32 = u32::MAX; // -1
const OK: u32 = 0;

// ──────────────────────────────────────────────────────────────
//  Top-level dispatch
// ──────────────────────────────────────────────────────────────

/// Entry point for every non-refill exception. The exception mechanism
/// has parked the offender's state in the BIOS data page.
pub extern "C" fn general_exception_handler() -> ! {
    let saved = machine::saved_exception_state();
    let code = cp0::exc_code(saved.cause);
    match code {
        cp0::EXC_INTERRUPT => interrupts::handle(saved),
        1..=3 => pass_up_or_die(saved, support::PAGE_FAULT_EXCEPT),
        4..=7 | 9..=12 => pass_up_or_die(saved, support::GENERAL_EXCEPT),
        cp0::EXC_SYSCALL => syscall_handler(saved),
        _ => {
            crate::log_error!("unknown exception code {}", code);
            cp0::freeze()
        }
    }
}

fn syscall_handler(saved: &mut ProcessorState) -> ! {
    let num = saved.a0();
    if !(SYS_CREATE_PROCESS..=SYS_GET_SUPPORT).contains(&num) {
        pass_up_or_die(saved, support::GENERAL_EXCEPT);
    }
    if saved.from_user_mode() {
        // A kernel service requested from user mode becomes a
        // reserved-instruction trap.
        saved.cause = cp0::with_exc_code(saved.cause, cp0::EXC_RESERVED_INSTR);
        pass_up_or_die(saved, support::GENERAL_EXCEPT);
    }

    // Return control past the trapping instruction.
    saved.advance_pc();

    match num {
        SYS_CREATE_PROCESS => sys_create(saved),
        SYS_TERMINATE_PROCESS => sys_terminate(),
        SYS_PASSEREN => sys_passeren(saved),
        SYS_VERHOGEN => sys_verhogen(saved),
        SYS_WAIT_IO => sys_wait_io(saved),
        SYS_GET_CPU_TIME => sys_get_cpu_time(saved),
        SYS_WAIT_CLOCK => sys_wait_clock(saved),
        SYS_GET_SUPPORT => sys_get_support(saved),
        _ => unreachable!(),
    }
}

// ──────────────────────────────────────────────────────────────
//  Pass-up-or-die
// ──────────────────────────────────────────────────────────────

/// Hand the exception to the process's support level, or tear the
/// process (and its whole subtree) down if it never asked for one.
pub fn pass_up_or_die(saved: &ProcessorState, slot: usize) -> ! {
    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let cur = n.current.expect("exception with no current process");
    match n.pcbs[cur].support {
        None => {
            n.terminate_subtree(cur);
            drop(nuc);
            scheduler::schedule()
        }
        Some(sid) => {
            let sup = support::sup_mut(sid);
            sup.except_state[slot] = *saved;
            let ctx = sup.except_context[slot];
            drop(nuc);
            scheduler::load_context(ctx)
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  Services
// ──────────────────────────────────────────────────────────────

/// SYS1: birth a process from the state at a1, child of the caller.
/// v0 gets 0, or -1 when the descriptor pool is dry.
fn sys_create(saved: &mut ProcessorState) -> ! {
    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    match n.pcbs.alloc() {
        None => saved.set_v0(ERR),
        Some(p) => {
            let state = saved.a1() as *const ProcessorState;
            // Kernel-previous callers only; the pointer was vetted by the
            // support layer that issued the call.
            n.pcbs[p].state = unsafe { core::ptr::read(state) };
            n.pcbs[p].support = SupId::from_reg(saved.a2());
            n.pcbs[p].cpu_time = 0;
            n.pcbs[p].blocked_on = None;
            let parent = n.current.expect("SYS1 with no current process");
            n.ready.enqueue(&mut n.pcbs, p);
            n.pcbs.insert_child(parent, p);
            n.proc_count += 1;
            saved.set_v0(OK);
        }
    }
    drop(nuc);
    scheduler::resume(saved)
}

/// SYS2: cascade-terminate the caller and its progeny.
fn sys_terminate() -> ! {
    let mut nuc = NUCLEUS.lock();
    let cur = nuc.current.expect("SYS2 with no current process");
    nuc.terminate_subtree(cur);
    drop(nuc);
    scheduler::schedule()
}

/// Park the caller on `sem`: save its state, charge the running quantum,
/// queue it on the ASL and find something else to run.
fn block_current(saved: &ProcessorState, sem: SemAddr, soft: bool) -> ! {
    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let cur = n.current.take().expect("blocking with no current process");
    n.pcbs[cur].state = *saved;
    let now = machine::tod_us();
    n.pcbs[cur].cpu_time += now.saturating_sub(n.quantum_start);
    if soft {
        n.soft_block_count += 1;
    }
    if n.asl.insert_blocked(&mut n.pcbs, sem, cur).is_err() {
        // 20 descriptors for 20 processes: running dry means corruption.
        panic!("semaphore descriptor pool exhausted");
    }
    drop(nuc);
    scheduler::schedule()
}

/// SYS3: P.
fn sys_passeren(saved: &mut ProcessorState) -> ! {
    let sem = SemAddr::from_reg(saved.a1());
    if sem.decrement() < 0 {
        block_current(saved, sem, false);
    }
    scheduler::resume(saved)
}

/// SYS4: V.
fn sys_verhogen(saved: &mut ProcessorState) -> ! {
    let sem = SemAddr::from_reg(saved.a1());
    if sem.increment() <= 0 {
        let mut nuc = NUCLEUS.lock();
        let n = &mut *nuc;
        if let Some(p) = n.asl.remove_blocked(&mut n.pcbs, sem) {
            n.ready.enqueue(&mut n.pcbs, p);
        }
    }
    scheduler::resume(saved)
}

/// SYS5: wait for the identified device to interrupt. Always blocks; the
/// device status arrives in v0 when the interrupt handler releases us.
fn sys_wait_io(saved: &mut ProcessorState) -> ! {
    let line = saved.a1() as usize;
    let dev = saved.a2() as usize;
    let term_read = saved.a3() != 0;
    if !(machine::LINE_DISK..=machine::LINE_TERMINAL).contains(&line)
        || dev >= machine::DEV_PER_LINE
    {
        pass_up_or_die(saved, support::GENERAL_EXCEPT);
    }
    let sem = DEVICE_SEMS
        .at(DeviceSems::index_of(line, dev, term_read))
        .addr();
    sem.decrement();
    block_current(saved, sem, true)
}

/// SYS6: accumulated CPU time plus the running quantum, in microseconds.
fn sys_get_cpu_time(saved: &mut ProcessorState) -> ! {
    let nuc = NUCLEUS.lock();
    let cur = nuc.current.expect("SYS6 with no current process");
    let elapsed = machine::tod_us().saturating_sub(nuc.quantum_start);
    saved.set_v0((nuc.pcbs[cur].cpu_time + elapsed) as u32);
    drop(nuc);
    scheduler::resume(saved)
}

/// SYS7: block until the next pseudo-clock tick.
fn sys_wait_clock(saved: &mut ProcessorState) -> ! {
    let sem = DEVICE_SEMS.pseudo_clock().addr();
    sem.decrement();
    block_current(saved, sem, true)
}

/// SYS8: the caller's support structure handle (0 if it has none).
fn sys_get_support(saved: &mut ProcessorState) -> ! {
    let nuc = NUCLEUS.lock();
    let cur = nuc.current.expect("SYS8 with no current process");
    saved.set_v0(match nuc.pcbs[cur].support {
        Some(sid) => sid.to_reg(),
        None => 0,
    });
    drop(nuc);
    scheduler::resume(saved)
}

// ──────────────────────────────────────────────────────────────
//  TLB refill
// ──────────────────────────────────────────────────────────────

/// Fast path for a miss on an already-resident mapping: fetch the PTE
/// from the current process's private table (or the shared table) and
/// drop it into a random TLB slot. Anything that does not map (no
/// support structure, VPN outside the layout) kills the process.
pub extern "C" fn tlb_refill_handler() -> ! {
    let saved = machine::saved_exception_state();
    let vpn = EntryHi(saved.entry_hi).vpn();

    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let cur = n.current.expect("TLB refill with no current process");
    let sid = match n.pcbs[cur].support {
        Some(sid) => sid,
        None => {
            n.terminate_subtree(cur);
            drop(nuc);
            scheduler::schedule()
        }
    };
    let pte = match machine::page_slot(vpn) {
        Some(PageSlot::Private(i)) => support::sup_mut(sid).page_table[i],
        Some(PageSlot::Shared(i)) => support::pager::shared_pte(i),
        None => {
            n.terminate_subtree(cur);
            drop(nuc);
            scheduler::schedule()
        }
    };
    drop(nuc);

    tlb::write_random(pte);
    scheduler::resume(saved)
}
