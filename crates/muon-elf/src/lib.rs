//! Minimal ELF64 executable parser.
//!
//! Just enough ELF for the exec path: validate the identification bytes,
//! walk the program header table, and hand out `PT_LOAD` segments. Strictly
//! little-endian 64-bit System V executables; everything else is rejected
//! up front so the loader never has to second-guess a field.

#![cfg_attr(not(test), no_std)]

mod header;
mod segment;

pub use header::{Elf64Header, Elf64Phdr, ElfError, PF_R, PF_W, PF_X, PT_LOAD};
pub use segment::{ElfFile, LoadSegment};
