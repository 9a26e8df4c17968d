//! s3k: a capability-based separation kernel for RISC-V.
//!
//! Every privileged resource (CPU time, physical memory, PMP slots,
//! process control, IPC channels) is named by an unforgeable capability
//! held in a per-process table. The tables of all processes form a single
//! derivation tree, and the closed set of system calls in [`syscall`] is
//! the only way any of it changes.
//!
//! The crate contains no drivers and no trap trampolines. The embedder
//! supplies those through [`hal::Plat`] and runs one executor per hart:
//!
//! ```text
//! loop {
//!     let proc = kernel.schedule_pick(hartid);
//!     /* enter user mode, come back with saved registers */
//!     match kernel.handle_syscall(hartid, proc) { ... }
//! }
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cap;
pub mod ctable;
pub mod excpt;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod lock;
pub mod param;
pub mod proc;
pub mod schedule;
pub mod syscall;
pub mod trap;

#[cfg(test)]
mod tests_common;

pub use cap::Cap;
pub use excpt::Excpt;
pub use kernel::Kernel;
pub use syscall::Control;
