//! `/dev/fb0`: the boot framebuffer.
//!
//! The interesting capability is `mmap`: the device pager turns offsets
//! into physical framebuffer addresses so userland can map the pixels
//! directly. Geometry is published as a binary blob at `/ctl/fb0/attr`.

use alloc::sync::Arc;

use muon_core::addr::PhysAddr;
use muon_core::errno::Errno;
use muon_core::sync::Once;
use muon_fs::SioTxn;
use muon_fs::ctlfs::{CtlNode, read_bytes_at};
use muon_fs::devfs::DevSw;
use muon_fs::CharDevSw;

use crate::boot::kernel;

/// Framebuffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbAttr {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u32,
}

/// The framebuffer handed over by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FbInfo {
    /// Physical base of the pixel memory.
    pub base: PhysAddr,
    /// Geometry.
    pub attr: FbAttr,
}

static FB: Once<FbInfo> = Once::new();

/// Publishes the boot framebuffer. Call before `fbdev` initializes; with
/// none published a benign placeholder is used so the node still exists.
pub fn set_boot_framebuffer(info: FbInfo) {
    let _ = FB.set(info);
}

fn fb_info() -> FbInfo {
    *FB.get_or_init(|| FbInfo {
        base: PhysAddr::new(0xE000_0000),
        attr: FbAttr {
            width: 1024,
            height: 768,
            pitch: 1024 * 4,
            bpp: 32,
        },
    })
}

struct FbDev;

impl CharDevSw for FbDev {
    fn mmap(&self, off: u64) -> Option<PhysAddr> {
        let info = fb_info();
        let size = u64::from(info.attr.pitch) * u64::from(info.attr.height);
        (off < size).then(|| info.base + off)
    }
}

struct FbAttrNode;

impl CtlNode for FbAttrNode {
    fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let attr = fb_info().attr;
        let mut blob = [0u8; 16];
        blob[0..4].copy_from_slice(&attr.width.to_le_bytes());
        blob[4..8].copy_from_slice(&attr.height.to_le_bytes());
        blob[8..12].copy_from_slice(&attr.pitch.to_le_bytes());
        blob[12..16].copy_from_slice(&attr.bpp.to_le_bytes());
        read_bytes_at(&blob, txn)
    }
}

/// Registers `/dev/fb0` and `/ctl/fb0/attr`.
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
    let sw = DevSw::Chr(Arc::new(FbDev));
    k.devtab.register(major, minor, sw.clone())?;
    k.devfs.register("fb0", major, minor, sw)?;
    k.ctlfs.register("fb0", "attr", Arc::new(FbAttrNode))?;
    Ok(())
}
