//! `/dev/beep`: the PC speaker.
//!
//! A write of one little-endian u32 `(duration_ms << 16) | freq_hz`
//! queues a tone. Without speaker hardware (or on the host) the tone is
//! just recorded, which is also what the tests observe.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::errno::Errno;
use muon_fs::CharDevSw;
use muon_fs::SioTxn;
use muon_fs::devfs::DevSw;

use crate::boot::kernel;

/// Last tone accepted, `(duration_ms << 16) | freq_hz` (0 = none yet).
static LAST_TONE: AtomicU32 = AtomicU32::new(0);

/// The last accepted tone, if any.
pub fn last_tone() -> Option<(u16, u16)> {
    match LAST_TONE.load(Ordering::Acquire) {
        0 => None,
        v => Some(((v >> 16) as u16, v as u16)),
    }
}

struct BeepDev;

impl CharDevSw for BeepDev {
    fn write(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let buf = txn.write_buf()?;
        let bytes: [u8; 4] = buf.try_into().map_err(|_| Errno::Inval)?;
        let tone = u32::from_le_bytes(bytes);
        if tone & 0xFFFF == 0 {
            return Err(Errno::Inval);
        }
        LAST_TONE.store(tone, Ordering::Release);
        log::debug!(
            target: "beep",
            "{} Hz for {} ms",
            tone & 0xFFFF,
            tone >> 16
        );
        Ok(4)
    }
}

/// Registers `/dev/beep`.
///
/// # Errors
///
/// Registration conflicts propagate.
pub fn init() -> Result<(), Errno> {
    let k = kernel();
    let major = k.devtab.alloc_major();
    let minor = k.devtab.alloc_minor(major);
    if major == 0 || minor == 0 {
        return Err(Errno::Nodev);
    }
    let sw = DevSw::Chr(Arc::new(BeepDev));
    k.devtab.register(major, minor, sw.clone())?;
    k.devfs.register("beep", major, minor, sw)?;
    Ok(())
}
