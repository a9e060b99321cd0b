//! `/dev/rd0`: a small RAM-backed block device.
//!
//! Mostly a vehicle for the bdev half of the device framework (and the
//! deferred-driver path — it initializes on the post-boot driver thread,
//! not during boot proper). 512-byte blocks over a fixed in-memory
//! image.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;
use muon_fs::BlockDevSw;
use muon_fs::SioTxn;
use muon_fs::devfs::DevSw;

use crate::boot::kernel;

/// Image size: 64 KiB.
pub const RAMDISK_BYTES: usize = 64 * 1024;

/// Block size.
pub const RAMDISK_BSIZE: usize = 512;

struct Ramdisk {
    data: SpinLock<Vec<u8>>,
}

impl BlockDevSw for Ramdisk {
    fn read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let data = self.data.lock();
        let off = txn.offset as usize;
        let buf = txn.read_buf()?;
        let n = buf.len().min(data.len().saturating_sub(off));
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        let off = txn.offset as usize;
        let buf = txn.write_buf()?;
        if off >= data.len() {
            return Err(Errno::Nospc);
        }
        let n = buf.len().min(data.len() - off);
        data[off..off + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn bsize(&self) -> Result<usize, Errno> {
        Ok(RAMDISK_BSIZE)
    }
}

/// Registers `/dev/rd0`. Runs on the deferred driver thread.
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
    let sw = DevSw::Blk(Arc::new(Ramdisk {
        data: SpinLock::new(alloc::vec![0u8; RAMDISK_BYTES]),
    }));
    k.devtab.register(major, minor, sw.clone())?;
    k.devfs.register("rd0", major, minor, sw)?;
    Ok(())
}
