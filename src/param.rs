//! Build-time kernel configuration and the boot capability set.

use static_assertions::const_assert;

use crate::cap::{Cap, Rwx};

cfg_if::cfg_if! {
    if #[cfg(feature = "hifive")] {
        /// First hart the kernel manages. Hart 0 of the FU540 is the
        /// monitor core and never runs user code.
        pub const MIN_HARTID: usize = 1;

        /// Number of harts.
        pub const N_HART: usize = 4;

        /// RTC ticks per second.
        pub const TICKS_PER_SECOND: u64 = 1_000_000;

        /// Process 0's capabilities at boot.
        pub const INIT_CAPS: &[Cap] = &[
            // Boot memory [0x8001_0000, 0x8002_0000).
            Cap::pmp(crate::cap::napot_encode(0x8001_0000, 0x1_0000), Rwx::RWX),
            // Main memory [0x8002_0000, 0x800a_0000).
            Cap::memory(0x10, 0x20, 0xa0, Rwx::RWX),
            // UART [0x1001_0000, 0x1001_1000).
            Cap::memory(0x2, 0x10, 0x11, Rwx::RW),
            // CLINT time page [0x200_b000, 0x200_c000).
            Cap::memory(0x0, 0x200b, 0x200c, Rwx::R),
            Cap::time(1, 0, N_SLOT as u64),
            Cap::time(2, 0, N_SLOT as u64),
            Cap::time(3, 0, N_SLOT as u64),
            Cap::time(4, 0, N_SLOT as u64),
            Cap::monitor(0, N_PROC as u64),
            Cap::channel(0, N_CHANNEL as u64),
        ];
    } else {
        /// First hart the kernel manages.
        pub const MIN_HARTID: usize = 0;

        /// Number of harts.
        pub const N_HART: usize = 4;

        /// RTC ticks per second.
        pub const TICKS_PER_SECOND: u64 = 1_000_000;

        /// Process 0's capabilities at boot.
        pub const INIT_CAPS: &[Cap] = &[
            // Boot memory [0x8001_0000, 0x8002_0000).
            Cap::pmp(crate::cap::napot_encode(0x8001_0000, 0x1_0000), Rwx::RWX),
            // Main memory [0x8002_0000, 0x800a_0000).
            Cap::memory(0x10, 0x20, 0xa0, Rwx::RWX),
            // UART [0x1000_0000, 0x1000_1000).
            Cap::memory(0x2, 0x0, 0x1, Rwx::RW),
            // CLINT time page [0x200_b000, 0x200_c000).
            Cap::memory(0x0, 0x200b, 0x200c, Rwx::R),
            Cap::time(0, 0, N_SLOT as u64),
            Cap::time(1, 0, N_SLOT as u64),
            Cap::time(2, 0, N_SLOT as u64),
            Cap::time(3, 0, N_SLOT as u64),
            Cap::monitor(0, N_PROC as u64),
            Cap::channel(0, N_CHANNEL as u64),
        ];
    }
}

/// Number of user processes. Fixed at boot; processes are never destroyed.
pub const N_PROC: usize = 8;

/// Number of capability slots per process.
pub const N_CAP: usize = 32;

/// Number of IPC channels.
pub const N_CHANNEL: usize = 16;

/// Number of hardware PMP slots per hart.
pub const N_PMP: usize = 8;

/// Number of time slots per scheduling round.
pub const N_SLOT: usize = 64;

/// Length of one time slot in RTC ticks.
pub const SLOT_LEN: u64 = TICKS_PER_SECOND / N_SLOT as u64 / 100;

/// Ticks reserved at the end of each slot for computing the next
/// dispatch decision.
pub const SLACK: u64 = SLOT_LEN / 10;

/// Size of the per-process register save area: 32 general-purpose
/// registers plus the virtual trap/exception registers.
pub const REG_COUNT: usize = 38;

// The schedule entry and the capability word pack pids, slot indices,
// channel ids and PMP slot indices into 16-, 16-, 16- and 4-bit fields.
const_assert!(N_PROC < 0x1_0000);
const_assert!(N_SLOT <= 0x1_0000);
const_assert!(N_CHANNEL <= 0x1_0000);
const_assert!(N_PMP <= 16);
const_assert!(SLACK < SLOT_LEN);
// Slot links store `pid * N_CAP + cidx` in a u16.
const_assert!(N_PROC * N_CAP <= 0x1_0000);
