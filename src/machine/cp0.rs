//! CP0 state, the saved processor state layout, and the ROM services the
//! board-support shim links in. Every privileged instruction the kernel
//! needs goes through the thin wrappers here.

use bit_field::BitField;
use bitflags::bitflags;

bitflags! {
    /// Status register bits. The c/p/o pairs form the three-deep
    /// interrupt/kernel-mode stack the exception mechanism pushes and pops.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const IEC = 1 << 0; // current global interrupt enable
        const KUC = 1 << 1; // current mode (0 = kernel, 1 = user)
        const IEP = 1 << 2; // previous interrupt enable
        const KUP = 1 << 3; // previous mode
        const IEO = 1 << 4;
        const KUO = 1 << 5;
        const IM_ALL = 0xFF00; // interrupt mask, lines 0-7
        const BEV = 1 << 22; // bootstrap exception vector
        const TE = 1 << 27; // per-processor timer enable
    }
}

/// Exception codes in the cause register.
pub const EXC_INTERRUPT: u32 = 0;
pub const EXC_TLB_MOD: u32 = 1;
pub const EXC_TLB_INVALID_LOAD: u32 = 2;
pub const EXC_TLB_INVALID_STORE: u32 = 3;
pub const EXC_SYSCALL: u32 = 8;
pub const EXC_RESERVED_INSTR: u32 = 10;

/// Extract the ExcCode field (bits 2..7) from a cause word.
pub fn exc_code(cause: u32) -> u32 {
    cause.get_bits(2..7)
}

/// Overwrite the ExcCode field of a cause word.
pub fn with_exc_code(cause: u32, code: u32) -> u32 {
    let mut c = cause;
    c.set_bits(2..7, code);
    c
}

/// True if interrupt line `line` is pending in a cause word.
pub fn interrupt_pending(cause: u32, line: usize) -> bool {
    cause.get_bit(8 + line)
}

// ──────────────────────────────────────────────────────────────
//  Saved processor state
// ──────────────────────────────────────────────────────────────

pub const NUM_REGS: usize = 29;

/// Named slots in the general-register file.
pub mod reg {
    pub const V0: usize = 1;
    pub const A0: usize = 3;
    pub const A1: usize = 4;
    pub const A2: usize = 5;
    pub const A3: usize = 6;
    pub const T9: usize = 24;
    pub const SP: usize = 26;
}

/// The processor state the exception mechanism saves and the load-state
/// service restores. Layout is fixed by the machine.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessorState {
    pub entry_hi: u32,
    pub cause: u32,
    pub status: u32,
    pub pc: u32,
    pub regs: [u32; NUM_REGS],
}

impl ProcessorState {
    pub const fn zeroed() -> Self {
        ProcessorState {
            entry_hi: 0,
            cause: 0,
            status: 0,
            pc: 0,
            regs: [0; NUM_REGS],
        }
    }

    pub fn a0(&self) -> u32 {
        self.regs[reg::A0]
    }

    pub fn a1(&self) -> u32 {
        self.regs[reg::A1]
    }

    pub fn a2(&self) -> u32 {
        self.regs[reg::A2]
    }

    pub fn a3(&self) -> u32 {
        self.regs[reg::A3]
    }

    pub fn set_v0(&mut self, v: u32) {
        self.regs[reg::V0] = v;
    }

    pub fn set_sp(&mut self, sp: u32) {
        self.regs[reg::SP] = sp;
    }

    /// Set the program counter. `t9` must mirror the PC whenever the PC is
    /// assigned from outside the running program.
    pub fn set_entry(&mut self, pc: u32) {
        self.pc = pc;
        self.regs[reg::T9] = pc;
    }

    /// Step past the instruction that raised the exception.
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(super::WORD_LEN as u32);
    }

    /// True if the exception was raised from user mode.
    pub fn from_user_mode(&self) -> bool {
        Status::from_bits_retain(self.status).contains(Status::KUP)
    }
}

/// A pass-up context: where the support level resumes when the nucleus
/// hands it an exception.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub stack_ptr: u32,
    pub status: u32,
    pub pc: u32,
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            stack_ptr: 0,
            status: 0,
            pc: 0,
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  ROM services
// ──────────────────────────────────────────────────────────────

#[cfg(not(test))]
mod rom {
    use super::{Context, ProcessorState};

    extern "C" {
        fn bsp_ldst(state: *const ProcessorState) -> !;
        fn bsp_ldcxt(stack_ptr: u32, status: u32, pc: u32) -> !;
        fn bsp_getstatus() -> u32;
        fn bsp_setstatus(status: u32);
        fn bsp_getcause() -> u32;
        fn bsp_settimer(ticks: u32);
        fn bsp_getentryhi() -> u32;
        fn bsp_setentryhi(value: u32);
        fn bsp_setentrylo(value: u32);
        fn bsp_getindex() -> u32;
        fn bsp_tlbwr();
        fn bsp_tlbwi();
        fn bsp_tlbp();
        fn bsp_wait();
        fn bsp_halt() -> !;
        fn bsp_panic() -> !;
        fn bsp_syscall(num: u32, a1: u32, a2: u32, a3: u32) -> u32;
    }

    /// Load a full processor state. The only way to hand the CPU to a
    /// process.
    ///
    /// The pointer must stay valid until the load completes; callers drop
    /// every lock first and pass a pointer into static kernel storage.
    pub fn load_state(state: *const ProcessorState) -> ! {
        unsafe { bsp_ldst(state) }
    }

    /// Load a pass-up context (stack pointer, status, entry point).
    pub fn load_context(ctx: Context) -> ! {
        unsafe { bsp_ldcxt(ctx.stack_ptr, ctx.status, ctx.pc) }
    }

    pub fn status() -> u32 {
        unsafe { bsp_getstatus() }
    }

    pub fn set_status(v: u32) {
        unsafe { bsp_setstatus(v) }
    }

    pub fn cause() -> u32 {
        unsafe { bsp_getcause() }
    }

    pub fn set_timer(ticks: u32) {
        unsafe { bsp_settimer(ticks) }
    }

    pub fn entry_hi() -> u32 {
        unsafe { bsp_getentryhi() }
    }

    pub fn set_entry_hi(v: u32) {
        unsafe { bsp_setentryhi(v) }
    }

    pub fn set_entry_lo(v: u32) {
        unsafe { bsp_setentrylo(v) }
    }

    pub fn index() -> u32 {
        unsafe { bsp_getindex() }
    }

    pub fn tlb_write_random() {
        unsafe { bsp_tlbwr() }
    }

    pub fn tlb_write_indexed() {
        unsafe { bsp_tlbwi() }
    }

    pub fn tlb_probe() {
        unsafe { bsp_tlbp() }
    }

    /// Park the processor until the next interrupt.
    pub fn wait() {
        unsafe { bsp_wait() }
    }

    pub fn halt() -> ! {
        unsafe { bsp_halt() }
    }

    pub fn freeze() -> ! {
        unsafe { bsp_panic() }
    }

    /// Trap into the nucleus syscall handler.
    pub fn syscall(num: u32, a1: u32, a2: u32, a3: u32) -> u32 {
        unsafe { bsp_syscall(num, a1, a2, a3) }
    }
}


pub use rom::{
    cause, entry_hi, freeze, halt, index, load_context, load_state, set_entry_hi, set_entry_lo,
    set_status, set_timer, status, syscall, tlb_probe, tlb_write_indexed, tlb_write_random, wait,
};

// ──────────────────────────────────────────────────────────────
//  Interrupt masking
// ──────────────────────────────────────────────────────────────

/// Masks interrupts on construction and restores the previous status word
/// when dropped, on every exit path. The narrow atomic windows (command
/// issue + wait, page-table + TLB update, release-mutex + block) all hang
/// off one of these.
pub struct InterruptGuard {
    saved: u32,
}

impl InterruptGuard {
    pub fn acquire() -> Self {
        let saved = status();
        set_status(saved & !Status::IEC.bits());
        InterruptGuard { saved }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        set_status(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exc_code_field_round_trips() {
        let cause = with_exc_code(0, EXC_SYSCALL);
        assert_eq!(exc_code(cause), EXC_SYSCALL);
        let cause = with_exc_code(cause, EXC_RESERVED_INSTR);
        assert_eq!(exc_code(cause), EXC_RESERVED_INSTR);
    }

    #[test]
    fn with_exc_code_preserves_other_bits() {
        let cause = 0xFF00 | (EXC_TLB_MOD << 2);
        let cause = with_exc_code(cause, EXC_RESERVED_INSTR);
        assert_eq!(cause & 0xFF00, 0xFF00);
        assert_eq!(exc_code(cause), EXC_RESERVED_INSTR);
    }

    #[test]
    fn pending_interrupt_lines() {
        let cause = 1 << (8 + 3) | 1 << (8 + 7);
        assert!(interrupt_pending(cause, 3));
        assert!(!interrupt_pending(cause, 4));
        assert!(interrupt_pending(cause, 7));
    }

    #[test]
    fn user_mode_is_read_from_the_previous_bit() {
        let mut s = ProcessorState::zeroed();
        assert!(!s.from_user_mode());
        s.status = Status::KUP.bits();
        assert!(s.from_user_mode());
    }

    #[test]
    fn set_entry_mirrors_pc_into_t9() {
        let mut s = ProcessorState::zeroed();
        s.set_entry(0x8000_00B0);
        assert_eq!(s.pc, 0x8000_00B0);
        assert_eq!(s.regs[reg::T9], 0x8000_00B0);
        s.advance_pc();
        assert_eq!(s.pc, 0x8000_00B4);
    }
}
