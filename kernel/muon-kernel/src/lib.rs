//! The Muon kernel proper.
//!
//! Everything above the subsystem crates lives here: machine-dependent
//! state ([`arch`]), the interrupt and IPI cores ([`intr`], [`ipi`]), the
//! device and driver frameworks ([`device`], [`driver`]), process
//! lifecycle with exec and signals ([`proc`], [`signal`]), the VSR
//! namespace ([`vsr`]), the syscall surface ([`syscall`], [`sysctl`]),
//! the built-in pseudo devices ([`dev`]), and bring-up ([`boot`]).
//!
//! The crate is `no_std + alloc` and deliberately free of mandatory
//! hardware access: the same bring-up that runs on metal runs on the
//! host over a heap arena (see `boot::kernel_init_hosted`), which is how
//! the integration tests under `tests/` drive whole-kernel scenarios.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod accnt;
pub mod arch;
pub mod boot;
pub mod config;
pub mod crypto;
pub mod dev;
pub mod device;
pub mod driver;
pub mod intr;
pub mod ipi;
pub mod ksched;
pub mod proc;
pub mod signal;
pub mod syscall;
pub mod sysctl;
pub mod trap;
pub mod usercopy;
pub mod vsr;

#[cfg(target_os = "none")]
pub mod rt;

pub use boot::{BootConfig, Kernel, kernel, kernel_init_hosted};
