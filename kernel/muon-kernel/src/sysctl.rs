//! `sysctl`: small runtime kernel knobs.
//!
//! A flat MIB of integers and strings. Reads return the current value;
//! the only writable knob today is `KERN_VCACHE_TYPE`, which migrates the
//! vnode cache between per-process and global modes.

use alloc::vec::Vec;

use muon_core::cpu;
use muon_core::errno::Errno;
use muon_fs::vcache;

use crate::config::{OSRELEASE, OSTYPE};

/// OS name (string).
pub const KERN_OSTYPE: u32 = 0;
/// OS release (string).
pub const KERN_OSRELEASE: u32 = 1;
/// Full version line (string).
pub const KERN_VERSION: u32 = 2;
/// Vnode cache mode (u32, writable).
pub const KERN_VCACHE_TYPE: u32 = 3;
/// Online CPU count (u32).
pub const HW_NCPU: u32 = 4;
/// Base page size (u32).
pub const HW_PAGESIZE: u32 = 5;

/// Reads knob `name`, and with `new` also updates it first-write-wins.
/// Returns the (pre-update) value bytes.
///
/// # Errors
///
/// [`Errno::Inval`] for an unknown name, [`Errno::Acces`] for writing a
/// read-only knob; invalid new values propagate from the knob.
pub fn kernel_sysctl(name: u32, new: Option<&[u8]>) -> Result<Vec<u8>, Errno> {
    let old: Vec<u8> = match name {
        KERN_OSTYPE => OSTYPE.as_bytes().to_vec(),
        KERN_OSRELEASE => OSRELEASE.as_bytes().to_vec(),
        KERN_VERSION => {
            let mut v = Vec::new();
            v.extend_from_slice(OSTYPE.as_bytes());
            v.extend_from_slice(b" ");
            v.extend_from_slice(OSRELEASE.as_bytes());
            v
        }
        KERN_VCACHE_TYPE => (vcache::vcache_type() as u32).to_le_bytes().to_vec(),
        HW_NCPU => cpu::cpu_count().to_le_bytes().to_vec(),
        HW_PAGESIZE => (muon_core::PAGE_SIZE as u32).to_le_bytes().to_vec(),
        _ => return Err(Errno::Inval),
    };

    if let Some(new) = new {
        match name {
            KERN_VCACHE_TYPE => {
                let bytes: [u8; 4] = new.try_into().map_err(|_| Errno::Inval)?;
                vcache::vcache_migrate(u32::from_le_bytes(bytes))?;
            }
            _ => return Err(Errno::Acces),
        }
    }
    Ok(old)
}
