//! Round-robin scheduler. Strict FIFO over the ready queue, one fixed
//! quantum per turn. The two privileged context-switch services live
//! behind the wrappers here and nowhere else.

use super::{NUCLEUS, QUANTUM_US};
use crate::machine;
use crate::machine::cp0::{self, Context, ProcessorState, Status};

/// Hand the CPU to a saved processor state. Never returns.
pub fn resume(state: &ProcessorState) -> ! {
    cp0::load_state(state)
}

/// Enter a pass-up context (stack pointer, status, entry point).
pub fn load_context(ctx: Context) -> ! {
    cp0::load_context(ctx)
}

/// Dispatch the next ready process, or decide how the machine idles:
/// no live processes means a job well done (halt); live-but-soft-blocked
/// means wait for a device interrupt; live with nothing runnable and
/// nothing pending is a deadlock (panic).
pub fn schedule() -> ! {
    loop {
        let mut nuc = NUCLEUS.lock();
        let n = &mut *nuc;

        if let Some(p) = n.ready.dequeue(&mut n.pcbs) {
            n.current = Some(p);
            n.quantum_start = machine::tod_us();
            let state: *const ProcessorState = &n.pcbs[p].state;
            drop(nuc);
            machine::set_plt(QUANTUM_US);
            // The pointer targets the static pool; the lock is dropped and
            // nothing runs between here and the load.
            return unsafe { resume(&*state) };
        }

        let proc_count = n.proc_count;
        let soft_blocked = n.soft_block_count;
        drop(nuc);

        if proc_count == 0 {
            cp0::halt();
        }

        if soft_blocked > 0 {
            // Open the interrupt gate and stop the quantum timer, then
            // park. A device or interval-timer interrupt re-enters the
            // kernel through the exception vector; if the wait ever falls
            // through, just try again.
            let status = cp0::status();
            cp0::set_status((status | Status::IEC.bits()) & !Status::TE.bits());
            cp0::wait();
            cp0::set_status(status);
            continue;
        }

        crate::log_error!(
            "deadlock: {} live processes, none runnable, none soft-blocked",
            proc_count
        );
        cp0::freeze();
    }
}
