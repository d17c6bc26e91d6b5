//! Typed wrappers around the SYSCALL trap. This is the only road from
//! support-level code back into the nucleus.

use super::SupId;
use crate::machine::cp0::{self, ProcessorState};
use crate::nucleus::exceptions::{
    SYS_CREATE_PROCESS, SYS_GET_SUPPORT, SYS_PASSEREN, SYS_TERMINATE_PROCESS, SYS_VERHOGEN,
    SYS_WAIT_CLOCK, SYS_WAIT_IO,
};
use crate::nucleus::sem::SemAddr;

/// SYS1. Returns 0 on success, -1 when the PCB pool is dry.
pub fn create_process(state: &ProcessorState, sup: Option<SupId>) -> i32 {
    cp0::syscall(
        SYS_CREATE_PROCESS,
        state as *const ProcessorState as u32,
        sup.map_or(0, SupId::to_reg),
        0,
    ) as i32
}

/// SYS2. Tears down the caller and its subtree.
pub fn terminate() -> ! {
    cp0::syscall(SYS_TERMINATE_PROCESS, 0, 0, 0);
    unreachable!("terminated process kept running")
}

/// SYS3.
pub fn passeren(sem: SemAddr) {
    cp0::syscall(SYS_PASSEREN, sem.reg(), 0, 0);
}

/// SYS4.
pub fn verhogen(sem: SemAddr) {
    cp0::syscall(SYS_VERHOGEN, sem.reg(), 0, 0);
}

/// SYS5. Blocks until the device interrupts; returns its status word.
pub fn wait_io(line: usize, dev: usize, term_read: bool) -> u32 {
    cp0::syscall(SYS_WAIT_IO, line as u32, dev as u32, term_read as u32)
}

/// SYS7. Blocks until the next pseudo-clock tick.
pub fn wait_clock() {
    cp0::syscall(SYS_WAIT_CLOCK, 0, 0, 0);
}

/// SYS8.
pub fn get_support() -> Option<SupId> {
    SupId::from_reg(cp0::syscall(SYS_GET_SUPPORT, 0, 0, 0))
}
