//! Interrupt handling: quantum expiry, the 100ms interval tick, and
//! device completion on lines 3 through 7.

use super::scheduler;
use super::{DEVICE_SEMS, NUCLEUS, TICK_US};
use crate::machine;
use crate::machine::cp0::{self, ProcessorState};

/// Route the highest-priority pending interrupt line.
pub fn handle(saved: &mut ProcessorState) -> ! {
    let cause = saved.cause;
    if cp0::interrupt_pending(cause, machine::LINE_PLT) {
        quantum_expired(saved)
    } else if cp0::interrupt_pending(cause, machine::LINE_INTERVAL) {
        interval_tick(saved)
    } else {
        for line in machine::LINE_DISK..=machine::LINE_TERMINAL {
            if cp0::interrupt_pending(cause, line) {
                device_interrupt(saved, line);
            }
        }
        // Spurious: nothing pending we recognise. Resume the interrupted
        // state.
        scheduler::resume(saved)
    }
}

/// Line 1: the running process used up its quantum. Charge it, requeue
/// it, dispatch the next one.
fn quantum_expired(saved: &ProcessorState) -> ! {
    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let cur = n
        .current
        .take()
        .expect("quantum expired with no current process");
    n.pcbs[cur].state = *saved;
    let now = machine::tod_us();
    n.pcbs[cur].cpu_time += now.saturating_sub(n.quantum_start);
    n.ready.enqueue(&mut n.pcbs, cur);
    drop(nuc);
    // The scheduler re-arms the timer when it dispatches.
    scheduler::schedule()
}

/// Line 2: pseudo-clock tick. Reload the interval timer, release every
/// process sleeping on the pseudo-clock semaphore and reset it to zero.
fn interval_tick(saved: &ProcessorState) -> ! {
    machine::load_interval_timer(TICK_US);

    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let sem = DEVICE_SEMS.pseudo_clock().addr();
    while let Some(p) = n.asl.remove_blocked(&mut n.pcbs, sem) {
        n.ready.enqueue(&mut n.pcbs, p);
        n.soft_block_count -= 1;
    }
    sem.write(0);
    let running = n.current.is_some();
    drop(nuc);

    if running {
        scheduler::resume(saved)
    } else {
        // The interrupt caught the scheduler in its wait loop.
        scheduler::schedule()
    }
}

/// Lines 3..=7: some device finished. Ack exactly one sub-device (the
/// lowest-numbered pending one, transmitter first on terminals), V its
/// semaphore and hand the completion status to the released waiter.
fn device_interrupt(saved: &ProcessorState, line: usize) -> ! {
    let bitmap = machine::interrupting_devices(line);
    if bitmap == 0 {
        scheduler::resume(saved);
    }
    let dev = bitmap.trailing_zeros() as usize;

    let (sem_index, status) = if line == machine::LINE_TERMINAL {
        ack_terminal(dev)
    } else {
        let reg = machine::device_register(line, dev);
        let status = reg.status.read();
        reg.command.write(machine::CMD_ACK);
        (
            super::DeviceSems::index_of(line, dev, false),
            status,
        )
    };

    let mut nuc = NUCLEUS.lock();
    let n = &mut *nuc;
    let sem = DEVICE_SEMS.at(sem_index).addr();
    if sem.increment() <= 0 {
        if let Some(p) = n.asl.remove_blocked(&mut n.pcbs, sem) {
            // Deliver the status word the device reported at completion.
            n.pcbs[p].state.set_v0(status);
            n.soft_block_count -= 1;
            n.ready.enqueue(&mut n.pcbs, p);
        }
    }
    let running = n.current.is_some();
    drop(nuc);

    if running {
        scheduler::resume(saved)
    } else {
        scheduler::schedule()
    }
}

/// A terminal is two sub-devices behind one register block; service the
/// transmitter first and ack only the side being serviced. A sub-device
/// has a completion pending when its status shows neither idle nor busy.
fn ack_terminal(dev: usize) -> (usize, u32) {
    let term = machine::terminal_register(dev);
    let tx_status = term.transm_status.read();
    let tx_pending = !matches!(
        tx_status & machine::TERM_STATUS_MASK,
        machine::STATUS_UNINSTALLED | machine::STATUS_READY | machine::STATUS_BUSY
    );
    if tx_pending {
        term.transm_command.write(machine::CMD_ACK);
        (
            super::DeviceSems::index_of(machine::LINE_TERMINAL, dev, false),
            tx_status,
        )
    } else {
        let rx_status = term.recv_status.read();
        term.recv_command.write(machine::CMD_ACK);
        (
            super::DeviceSems::index_of(machine::LINE_TERMINAL, dev, true),
            rx_status,
        )
    }
}
