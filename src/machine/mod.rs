pub mod cp0;
pub mod tlb;

use volatile::Volatile;

// ──────────────────────────────────────────────────────────────
//  Bus register area
// ──────────────────────────────────────────────────────────────

pub const RAM_BASE_ADDR: usize = 0x1000_0000; // R: installed RAM base
pub const RAM_SIZE_ADDR: usize = 0x1000_0004; // R: installed RAM size
pub const TOD_LO_ADDR: usize = 0x1000_001C; // R: time-of-day clock, low word
pub const INTERVAL_TIMER_ADDR: usize = 0x1000_0020; // R/W: 100ms system tick
pub const TIME_SCALE_ADDR: usize = 0x1000_0024; // R: clock ticks per microsecond
pub const INT_BITMAP_ADDR: usize = 0x1000_0040; // R: per-line interrupting-device bitmaps
pub const DEV_REG_ADDR: usize = 0x1000_0054; // device registers, 16 bytes each

pub const BIOS_DATA_PAGE: usize = 0x0FFF_F000; // saved exception state lives here
pub const PASS_UP_VECTOR: usize = 0x0FFF_F900;

pub const RAM_START: usize = 0x2000_0000;
pub const NUCLEUS_STACK_TOP: usize = 0x2000_1000; // one page of kernel stack

pub const PAGE_SIZE: usize = 4096;
pub const WORD_LEN: usize = 4;

// ──────────────────────────────────────────────────────────────
//  Interrupt lines and device classes
// ──────────────────────────────────────────────────────────────

pub const LINE_PLT: usize = 1; // per-processor timer
pub const LINE_INTERVAL: usize = 2; // system-wide interval timer
pub const LINE_DISK: usize = 3;
pub const LINE_FLASH: usize = 4;
pub const LINE_NETWORK: usize = 5;
pub const LINE_PRINTER: usize = 6;
pub const LINE_TERMINAL: usize = 7;

pub const DEV_PER_LINE: usize = 8;
/// Disk, flash, network and printer classes plus the two terminal
/// sub-device classes (transmit and receive).
pub const NUM_DEVICES: usize = 6 * DEV_PER_LINE;
pub const DEV_REG_SIZE: usize = 16;

// ──────────────────────────────────────────────────────────────
//  Device status / command words
// ──────────────────────────────────────────────────────────────

pub const STATUS_UNINSTALLED: u32 = 0;
pub const STATUS_READY: u32 = 1;
pub const STATUS_BUSY: u32 = 3;
pub const STATUS_CHAR_RECEIVED: u32 = 5;
pub const STATUS_CHAR_TRANSMITTED: u32 = 5;

/// Terminal sub-device status codes occupy the low byte; the received
/// character sits in the byte above it.
pub const TERM_STATUS_MASK: u32 = 0xFF;
pub const BYTE_LEN: u32 = 8;

pub const CMD_RESET: u32 = 0;
pub const CMD_ACK: u32 = 1;
pub const CMD_PRINT_CHR: u32 = 2;
pub const CMD_TRANSMIT_CHAR: u32 = 2;
pub const CMD_RECEIVE_CHAR: u32 = 2;
pub const CMD_DISK_SEEK: u32 = 2;
pub const CMD_DISK_READ: u32 = 3;
pub const CMD_DISK_WRITE: u32 = 4;
pub const CMD_FLASH_READ: u32 = 2;
pub const CMD_FLASH_WRITE: u32 = 3;

pub const DISK_CYL_SHIFT: u32 = 8;
pub const DISK_HEAD_SHIFT: u32 = 16;
pub const DISK_SECT_SHIFT: u32 = 8;

// ──────────────────────────────────────────────────────────────
//  Physical memory layout
// ──────────────────────────────────────────────────────────────

/// The kernel region: code, data, kernel stacks and the semaphore array
/// occupy the first 32 frames of RAM.
pub const KERNEL_RESERVED_PAGES: usize = 32;
pub const SWAP_POOL_FRAMES: usize = 16;
pub const SWAP_POOL_BASE: usize = RAM_START + KERNEL_RESERVED_PAGES * PAGE_SIZE;
pub const FLASH_DMA_BASE: usize = SWAP_POOL_BASE + SWAP_POOL_FRAMES * PAGE_SIZE;
pub const DISK_DMA_BASE: usize = FLASH_DMA_BASE + DEV_PER_LINE * PAGE_SIZE;

// ──────────────────────────────────────────────────────────────
//  User logical address space
// ──────────────────────────────────────────────────────────────

pub const KUSEG_BASE: usize = 0x8000_0000;
pub const MAX_PAGES: usize = 32;
pub const STACK_PAGE: usize = MAX_PAGES - 1;
pub const UPROC_MAX: usize = 8;

pub const VPN_TEXT_BASE: u32 = 0x80000; // .text/.data pages 0..30
pub const TEXT_PAGE_COUNT: u32 = 31;
pub const VPN_STACK: u32 = 0xBFFFF; // page 31

/// The shared segment: 32 globally-mapped pages above the private range.
pub const KUSEG_SHARE_BASE: usize = 0xC000_0000;
pub const KUSEG_SHARE_PAGES: usize = 32;
pub const VPN_SHARE_BASE: u32 = (KUSEG_SHARE_BASE >> 12) as u32;

/// Where a fresh user process starts executing and where its stack grows
/// down from (the top of the stack page).
pub const UPROC_ENTRY_PC: u32 = 0x8000_00B0;
pub const UPROC_STACK_TOP: u32 = 0xC000_0000;

/// Which page-table slot a virtual page number maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSlot {
    /// Slot in the faulting process's private 32-entry table.
    Private(usize),
    /// Slot in the global shared-segment table.
    Shared(usize),
}

/// Map a VPN onto its page-table slot, or `None` for an address outside
/// the user address space layout.
pub fn page_slot(vpn: u32) -> Option<PageSlot> {
    if vpn == VPN_STACK || (vpn >= VPN_TEXT_BASE && vpn < VPN_TEXT_BASE + TEXT_PAGE_COUNT) {
        // Private pages fold onto 0..31: text base lands on slot 0 and the
        // stack VPN lands on slot 31.
        Some(PageSlot::Private((vpn % MAX_PAGES as u32) as usize))
    } else if vpn >= VPN_SHARE_BASE && vpn < VPN_SHARE_BASE + KUSEG_SHARE_PAGES as u32 {
        Some(PageSlot::Shared((vpn - VPN_SHARE_BASE) as usize))
    } else {
        None
    }
}

/// True if the address lies in the user segment (private or shared range).
pub fn is_user_addr(addr: u32) -> bool {
    addr as usize >= KUSEG_BASE
}

/// True if the address lies inside the shared segment.
pub fn is_shared_addr(addr: u32) -> bool {
    (addr as usize) >= KUSEG_SHARE_BASE
        && (addr as usize) < KUSEG_SHARE_BASE + KUSEG_SHARE_PAGES * PAGE_SIZE
}

// ──────────────────────────────────────────────────────────────
//  Device registers
// ──────────────────────────────────────────────────────────────

/// Register block of a non-terminal device.
#[repr(C)]
pub struct DeviceRegister {
    pub status: Volatile<u32>,
    pub command: Volatile<u32>,
    pub data0: Volatile<u32>,
    pub data1: Volatile<u32>,
}

/// Register block of a terminal: two independent sub-devices.
#[repr(C)]
pub struct TerminalRegister {
    pub recv_status: Volatile<u32>,
    pub recv_command: Volatile<u32>,
    pub transm_status: Volatile<u32>,
    pub transm_command: Volatile<u32>,
}

fn dev_reg_addr(line: usize, dev: usize) -> usize {
    DEV_REG_ADDR + ((line - LINE_DISK) * DEV_PER_LINE + dev) * DEV_REG_SIZE
}

/// The register block for device `dev` on interrupt line `line` (3..=6).
pub fn device_register(line: usize, dev: usize) -> &'static mut DeviceRegister {
    unsafe { &mut *(dev_reg_addr(line, dev) as *mut DeviceRegister) }
}

/// The register block for terminal `dev`.
pub fn terminal_register(dev: usize) -> &'static mut TerminalRegister {
    unsafe { &mut *(dev_reg_addr(LINE_TERMINAL, dev) as *mut TerminalRegister) }
}

/// The interrupting-device bitmap for line `line` (3..=7).
pub fn interrupting_devices(line: usize) -> u32 {
    let addr = INT_BITMAP_ADDR + (line - LINE_DISK) * WORD_LEN;
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

// ──────────────────────────────────────────────────────────────
//  Clocks
// ──────────────────────────────────────────────────────────────

fn bus_word(addr: usize) -> u32 {
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

/// Clock ticks per microsecond.
pub fn time_scale() -> u32 {
    bus_word(TIME_SCALE_ADDR)
}

/// Microseconds since boot.
pub fn tod_us() -> u64 {
    (bus_word(TOD_LO_ADDR) / time_scale()) as u64
}

/// Reload the system-wide interval timer with `us` microseconds.
pub fn load_interval_timer(us: u32) {
    unsafe {
        core::ptr::write_volatile(INTERVAL_TIMER_ADDR as *mut u32, us * time_scale());
    }
}

/// Arm the per-processor timer with `us` microseconds.
pub fn set_plt(us: u64) {
    cp0::set_timer(us as u32 * time_scale());
}

/// First address past installed RAM.
pub fn ram_top() -> u32 {
    bus_word(RAM_BASE_ADDR).wrapping_add(bus_word(RAM_SIZE_ADDR))
}

/// The processor state pushed by the exception mechanism.
pub fn saved_exception_state() -> &'static mut cp0::ProcessorState {
    unsafe { &mut *(BIOS_DATA_PAGE as *mut cp0::ProcessorState) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_vpns_fold_onto_their_slots() {
        assert_eq!(page_slot(VPN_TEXT_BASE), Some(PageSlot::Private(0)));
        assert_eq!(page_slot(VPN_TEXT_BASE + 30), Some(PageSlot::Private(30)));
        assert_eq!(page_slot(VPN_STACK), Some(PageSlot::Private(31)));
    }

    #[test]
    fn shared_vpns_map_by_offset() {
        assert_eq!(page_slot(VPN_SHARE_BASE), Some(PageSlot::Shared(0)));
        assert_eq!(page_slot(VPN_SHARE_BASE + 31), Some(PageSlot::Shared(31)));
    }

    #[test]
    fn wild_vpns_have_no_slot() {
        assert_eq!(page_slot(0), None);
        assert_eq!(page_slot(VPN_TEXT_BASE + TEXT_PAGE_COUNT), None);
        assert_eq!(page_slot(VPN_STACK - 1), None);
        assert_eq!(page_slot(VPN_SHARE_BASE + 32), None);
    }

    #[test]
    fn user_and_shared_address_ranges() {
        assert!(!is_user_addr(0x2000_0000));
        assert!(is_user_addr(0x8000_0000));
        assert!(is_shared_addr(0xC000_0000));
        assert!(is_shared_addr(0xC001_FFFF));
        assert!(!is_shared_addr(0xC002_0000));
        assert!(!is_shared_addr(0xBFFF_FFFF));
    }
}
