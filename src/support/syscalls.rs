//! Support-level exception dispatch: the user syscall surface (SYS9-20)
//! and the program-trap funnel everything else drains into.

use super::{chario, delay, dma, free_support, kcall, pager, shared, sup_mut, SupId,
    GENERAL_EXCEPT, MASTER_SEM, PAGE_FAULT_EXCEPT};
use crate::machine;
use crate::machine::cp0;
use crate::nucleus::scheduler;

/// User syscall numbers (passed in a0, user-previous mode).
pub const SYS_TERMINATE: u32 = 9;
pub const SYS_GET_TOD: u32 = 10;
pub const SYS_WRITE_PRINTER: u32 = 11;
pub const SYS_WRITE_TERMINAL: u32 = 12;
pub const SYS_READ_TERMINAL: u32 = 13;
pub const SYS_DISK_WRITE: u32 = 14;
pub const SYS_DISK_READ: u32 = 15;
pub const SYS_FLASH_WRITE: u32 = 16;
pub const SYS_FLASH_READ: u32 = 17;
pub const SYS_DELAY: u32 = 18;
pub const SYS_P_SHARED: u32 = 19;
pub const SYS_V_SHARED: u32 = 20;

/// Landing point of the general pass-up context. Dispatches syscalls;
/// every other general exception is a program trap.
pub extern "C" fn general_handler() -> ! {
    let sid = kcall::get_support().expect("support handler without a support structure");
    let sup = sup_mut(sid);
    let state = &mut sup.except_state[GENERAL_EXCEPT];

    if cp0::exc_code(state.cause) != cp0::EXC_SYSCALL {
        program_trap(sid);
    }

    let num = state.a0();
    // Return past the syscall instruction once the service resumes us.
    state.advance_pc();

    match num {
        SYS_TERMINATE => sys_terminate(sid),
        SYS_GET_TOD => sys_get_tod(sid),
        SYS_WRITE_PRINTER => chario::sys_write_printer(sid),
        SYS_WRITE_TERMINAL => chario::sys_write_terminal(sid),
        SYS_READ_TERMINAL => chario::sys_read_terminal(sid),
        SYS_DISK_WRITE => dma::sys_disk_io(sid, dma::Dir::Write),
        SYS_DISK_READ => dma::sys_disk_io(sid, dma::Dir::Read),
        SYS_FLASH_WRITE => dma::sys_flash_io(sid, dma::Dir::Write),
        SYS_FLASH_READ => dma::sys_flash_io(sid, dma::Dir::Read),
        SYS_DELAY => delay::sys_delay(sid),
        SYS_P_SHARED => shared::sys_p_shared(sid),
        SYS_V_SHARED => shared::sys_v_shared(sid),
        _ => program_trap(sid),
    }
}

/// Landing point of the page-fault pass-up context. A TLB-modification
/// fault means a store to a read-only page and kills the process; real
/// invalid faults go to the pager.
pub extern "C" fn page_fault_handler() -> ! {
    let sid = kcall::get_support().expect("page fault without a support structure");
    let code = cp0::exc_code(sup_mut(sid).except_state[PAGE_FAULT_EXCEPT].cause);
    if code == cp0::EXC_TLB_MOD {
        program_trap(sid);
    }
    pager::handle_fault(sid)
}

/// Every protection violation ends here: clean up as SYS9 would and die.
pub fn program_trap(sid: SupId) -> ! {
    pager::release_if_holding(sup_mut(sid).asid);
    sys_terminate(sid)
}

/// SYS9: orderly death. Give back the swap frames, signal the
/// instantiator, return the support structure, then ask the nucleus to
/// reap us.
fn sys_terminate(sid: SupId) -> ! {
    let asid = sup_mut(sid).asid;
    pager::release_frames_of(asid);
    kcall::verhogen(MASTER_SEM.addr());
    free_support(sid);
    kcall::terminate()
}

/// SYS10: microseconds since boot.
fn sys_get_tod(sid: SupId) -> ! {
    let sup = sup_mut(sid);
    sup.except_state[GENERAL_EXCEPT].set_v0(machine::tod_us() as u32);
    scheduler::resume(&sup.except_state[GENERAL_EXCEPT])
}
