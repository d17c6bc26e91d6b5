//! Kernel log. The machine has no out-of-band console, so log lines go
//! into a RAM ring buffer that the host debugger can inspect.

use crate::machine::cp0::InterruptGuard;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

const KLOG_SIZE: usize = 4096;

pub struct KernelLog {
    buf: [u8; KLOG_SIZE],
    /// Total bytes ever written; `pos % KLOG_SIZE` is the next slot.
    pos: usize,
}

impl KernelLog {
    fn new() -> KernelLog {
        KernelLog {
            buf: [0; KLOG_SIZE],
            pos: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.pos % KLOG_SIZE] = byte;
        self.pos = self.pos.wrapping_add(1);
    }

    /// Bytes logged so far (not capped to the buffer size).
    pub fn written(&self) -> usize {
        self.pos
    }
}

impl fmt::Write for KernelLog {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.push(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref KLOG: Mutex<KernelLog> = Mutex::new(KernelLog::new());
}

#[doc(hidden)]
pub fn _log(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Preemption while holding the log lock would spin the whole machine.
    let _guard = InterruptGuard::acquire();
    let _ = KLOG.lock().write_fmt(args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_log(format_args!("[INFO] "));
        $crate::klog::_log(format_args!($($arg)*));
        $crate::klog::_log(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_log(format_args!("[WARN] "));
        $crate::klog::_log(format_args!($($arg)*));
        $crate::klog::_log(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_log(format_args!("[ERROR] "));
        $crate::klog::_log(format_args!($($arg)*));
        $crate::klog::_log(format_args!("\n"));
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn ring_buffer_wraps() {
        let mut log = KernelLog::new();
        for _ in 0..KLOG_SIZE + 10 {
            log.push(b'x');
        }
        assert_eq!(log.written(), KLOG_SIZE + 10);
        let _ = write!(log, "tail");
        assert_eq!(log.written(), KLOG_SIZE + 14);
    }
}
