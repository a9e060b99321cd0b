//! `/dev/rtc`: wall-clock reads.
//!
//! Reads return six bytes `{sec, min, hour, day, month, year}` with the
//! year counted from 2000. The time source is pluggable: CMOS on x86
//! bare metal, a fixed epoch elsewhere.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use muon_core::errno::Errno;
use muon_fs::CharDevSw;
use muon_fs::SioTxn;
use muon_fs::ctlfs::read_bytes_at;
use muon_fs::devfs::DevSw;

use crate::boot::kernel;

/// A broken-down wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    /// Years since 2000.
    pub year: u8,
}

/// Registered hardware clock source.
static SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Installs the hardware clock source.
pub fn set_clock_source(f: fn() -> RtcTime) {
    SOURCE.store(f as usize, Ordering::Release);
}

fn read_clock() -> RtcTime {
    let raw = SOURCE.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Stored from a `fn() -> RtcTime` in `set_clock_source`.
        let f: fn() -> RtcTime = unsafe { core::mem::transmute::<usize, fn() -> RtcTime>(raw) };
        return f();
    }
    // No hardware clock yet: a fixed, obviously-synthetic time.
    RtcTime {
        sec: 0,
        min: 0,
        hour: 12,
        day: 1,
        month: 8,
        year: 26,
    }
}

struct RtcDev;

impl CharDevSw for RtcDev {
    fn read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let t = read_clock();
        let bytes = [t.sec, t.min, t.hour, t.day, t.month, t.year];
        read_bytes_at(&bytes, txn)
    }
}

/// Registers `/dev/rtc`.
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
    let sw = DevSw::Chr(Arc::new(RtcDev));
    k.devtab.register(major, minor, sw.clone())?;
    k.devfs.register("rtc", major, minor, sw)?;
    Ok(())
}
