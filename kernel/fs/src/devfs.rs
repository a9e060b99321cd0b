//! devfs: device nodes under `/dev`.
//!
//! A flat namespace of character and block device nodes. Drivers register
//! `(name, major, minor, devsw)`; lookups hand out `Chr`/`Blk` vnodes whose
//! read/write vops dispatch straight into the device switch.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use muon_core::addr::PhysAddr;
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::mount::VfsOps;
use crate::vnode::{VAttr, Vnode, VnodeType, Vops};
use crate::{BlockDevSw, CharDevSw, SioTxn};

/// The switch behind one device node.
#[derive(Clone)]
pub enum DevSw {
    /// Character device.
    Chr(Arc<dyn CharDevSw>),
    /// Block device.
    Blk(Arc<dyn BlockDevSw>),
}

/// One registered device node.
pub struct DevEntry {
    /// Device major number.
    pub major: u32,
    /// Device minor number.
    pub minor: u32,
    /// The device switch.
    pub sw: DevSw,
}

/// A devfs instance: name → entry.
pub struct Devfs {
    nodes: SpinLock<BTreeMap<String, Arc<Vnode>>>,
}

impl Devfs {
    /// An empty devfs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Builds the root vnode for this instance.
    pub fn root_vnode(self: &Arc<Self>) -> Arc<Vnode> {
        let vp = Vnode::alloc(VnodeType::Dir, Arc::new(DevfsVops));
        vp.set_data(Box::new(Arc::clone(self)));
        vp
    }

    /// Registers a device node.
    ///
    /// # Errors
    ///
    /// [`Errno::Exist`] if `name` is already registered.
    pub fn register(&self, name: &str, major: u32, minor: u32, sw: DevSw) -> Result<(), Errno> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(name) {
            return Err(Errno::Exist);
        }
        let vtype = match sw {
            DevSw::Chr(_) => VnodeType::Chr,
            DevSw::Blk(_) => VnodeType::Blk,
        };
        let vp = Vnode::alloc(vtype, Arc::new(DevfsVops));
        vp.set_data(Box::new(Arc::new(DevEntry { major, minor, sw })));
        nodes.insert(name.to_string(), vp);
        log::debug!(target: "devfs", "registered /dev/{name}");
        Ok(())
    }

    /// Whether `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.lock().contains_key(name)
    }
}

fn entry_of(vp: &Vnode) -> Result<Arc<DevEntry>, Errno> {
    vp.with_data::<Arc<DevEntry>, _>(Arc::clone).ok_or(Errno::Io)
}

/// Reaches the mmap hook of the character device behind `vp`, for the
/// device pager.
pub fn dev_mmap(vp: &Vnode, off: u64) -> Option<PhysAddr> {
    let entry = entry_of(vp).ok()?;
    match &entry.sw {
        DevSw::Chr(c) => c.mmap(off),
        DevSw::Blk(_) => None,
    }
}

struct DevfsVops;

impl Vops for DevfsVops {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>, Errno> {
        let fs = dir
            .with_data::<Arc<Devfs>, _>(Arc::clone)
            .ok_or(Errno::Io)?;
        let nodes = fs.nodes.lock();
        nodes.get(name).cloned().ok_or(Errno::Noent)
    }

    fn getattr(&self, vp: &Vnode) -> Result<VAttr, Errno> {
        if vp.vtype() == VnodeType::Dir {
            return Ok(VAttr {
                mode: 0o755,
                size: 0,
                vtype: VnodeType::Dir,
            });
        }
        let entry = entry_of(vp)?;
        Ok(VAttr {
            mode: 0o600,
            // Device "size" encodes the (major, minor) pair.
            size: (u64::from(entry.major) << 8) | u64::from(entry.minor),
            vtype: vp.vtype(),
        })
    }

    fn read(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        match &entry_of(vp)?.sw {
            DevSw::Chr(c) => c.read(txn),
            DevSw::Blk(b) => b.read(txn),
        }
    }

    fn write(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        match &entry_of(vp)?.sw {
            DevSw::Chr(c) => c.write(txn),
            DevSw::Blk(b) => b.write(txn),
        }
    }
}

/// Mountable devfs: `init` yields the root of a fresh instance. The
/// instance handle is also returned to the caller through
/// [`DevfsMount::instance`] so drivers can keep registering nodes.
pub struct DevfsMount {
    instance: Arc<Devfs>,
}

impl DevfsMount {
    /// A mountable wrapper around a new instance.
    pub fn new() -> Self {
        Self {
            instance: Devfs::new(),
        }
    }

    /// The underlying instance.
    pub fn instance(&self) -> Arc<Devfs> {
        Arc::clone(&self.instance)
    }
}

impl Default for DevfsMount {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsOps for DevfsMount {
    fn init(&self) -> Result<Arc<Vnode>, Errno> {
        Ok(self.instance.root_vnode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A byte-source device: reads yield a repeating pattern.
    struct PatternDev;
    impl CharDevSw for PatternDev {
        fn read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
            let buf = txn.read_buf()?;
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn register_lookup_read() {
        let fs = Devfs::new();
        let root = fs.root_vnode();
        fs.register("pattern", 3, 0, DevSw::Chr(Arc::new(PatternDev)))
            .unwrap();
        assert!(fs.contains("pattern"));
        assert_eq!(
            fs.register("pattern", 3, 1, DevSw::Chr(Arc::new(PatternDev)))
                .unwrap_err(),
            Errno::Exist
        );

        let vp = root.vop_lookup("pattern").unwrap();
        assert_eq!(vp.vtype(), VnodeType::Chr);
        let mut buf = [0u8; 4];
        assert_eq!(vp.vop_read(&mut SioTxn::read(&mut buf, 0)).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);

        // Writes were not provided: the stub refuses.
        assert_eq!(
            vp.vop_write(&mut SioTxn::write(b"x", 0)).unwrap_err(),
            Errno::Nosup
        );
    }

    #[test]
    fn missing_node_is_noent() {
        let fs = Devfs::new();
        let root = fs.root_vnode();
        assert_eq!(root.vop_lookup("nvme0").unwrap_err(), Errno::Noent);
    }

    #[test]
    fn mmap_hook_reaches_device() {
        struct Mappable;
        impl CharDevSw for Mappable {
            fn mmap(&self, off: u64) -> Option<PhysAddr> {
                Some(PhysAddr::new(0xE000_0000 + off))
            }
        }
        let fs = Devfs::new();
        fs.register("fb0", 1, 0, DevSw::Chr(Arc::new(Mappable))).unwrap();
        let vp = fs.root_vnode().vop_lookup("fb0").unwrap();
        assert_eq!(dev_mmap(&vp, 0x1000), Some(PhysAddr::new(0xE000_1000)));
    }
}
