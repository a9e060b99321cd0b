//! ctlfs: kernel control files under `/ctl`.
//!
//! Two-level namespace: `/ctl/<group>/<node>`. Subsystems register a
//! [`CtlNode`] per control file; reads return text or little-endian binary
//! blobs (the node decides), writes are optional.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::mount::VfsOps;
use crate::vnode::{VAttr, Vnode, VnodeType, Vops};
use crate::SioTxn;

/// One control file.
pub trait CtlNode: Send + Sync {
    /// Reads the node's current content.
    ///
    /// # Errors
    ///
    /// Node-specific.
    fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno>;

    /// Writes to the node.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the node is writable.
    fn ctl_write(&self, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }
}

/// Convenience: serves a fixed byte snapshot produced per read.
pub fn read_bytes_at(bytes: &[u8], txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
    let off = txn.offset as usize;
    let buf = txn.read_buf()?;
    let n = buf.len().min(bytes.len().saturating_sub(off));
    buf[..n].copy_from_slice(&bytes[off..off + n]);
    Ok(n)
}

/// A ctlfs instance: group → node name → node.
pub struct Ctlfs {
    groups: SpinLock<BTreeMap<String, BTreeMap<String, Arc<Vnode>>>>,
}

impl Ctlfs {
    /// An empty ctlfs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Builds the root vnode for this instance.
    pub fn root_vnode(self: &Arc<Self>) -> Arc<Vnode> {
        let vp = Vnode::alloc(VnodeType::Dir, Arc::new(CtlfsVops));
        vp.set_data(Box::new(CtlData::Root(Arc::clone(self))));
        vp
    }

    /// Registers `node` as `/ctl/<group>/<name>`.
    ///
    /// # Errors
    ///
    /// [`Errno::Exist`] on duplicates.
    pub fn register(&self, group: &str, name: &str, node: Arc<dyn CtlNode>) -> Result<(), Errno> {
        let mut groups = self.groups.lock();
        let entries = groups.entry(group.to_string()).or_default();
        if entries.contains_key(name) {
            return Err(Errno::Exist);
        }
        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(CtlfsVops));
        vp.set_data(Box::new(CtlData::Node(node)));
        entries.insert(name.to_string(), vp);
        Ok(())
    }
}

/// Private data of ctlfs vnodes.
enum CtlData {
    /// The instance root.
    Root(Arc<Ctlfs>),
    /// A group directory.
    Group(Arc<Ctlfs>, String),
    /// A leaf control file.
    Node(Arc<dyn CtlNode>),
}

struct CtlfsVops;

fn data_of(vp: &Vnode, f: impl FnOnce(&CtlData) -> Result<Arc<Vnode>, Errno>) -> Result<Arc<Vnode>, Errno> {
    vp.with_data::<CtlData, _>(f).ok_or(Errno::Io)?
}

impl Vops for CtlfsVops {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>, Errno> {
        data_of(dir, |data| match data {
            CtlData::Root(fs) => {
                let groups = fs.groups.lock();
                if !groups.contains_key(name) {
                    return Err(Errno::Noent);
                }
                let vp = Vnode::alloc(VnodeType::Dir, Arc::new(CtlfsVops));
                vp.set_data(Box::new(CtlData::Group(Arc::clone(fs), name.to_string())));
                Ok(vp)
            }
            CtlData::Group(fs, group) => {
                let groups = fs.groups.lock();
                let entries = groups.get(group).ok_or(Errno::Noent)?;
                entries.get(name).cloned().ok_or(Errno::Noent)
            }
            CtlData::Node(_) => Err(Errno::Io),
        })
    }

    fn getattr(&self, vp: &Vnode) -> Result<VAttr, Errno> {
        Ok(VAttr {
            mode: if vp.vtype() == VnodeType::Dir { 0o555 } else { 0o644 },
            size: 0,
            vtype: vp.vtype(),
        })
    }

    fn read(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        vp.with_data::<CtlData, _>(|data| match data {
            CtlData::Node(node) => node.ctl_read(txn),
            _ => Err(Errno::Io),
        })
        .ok_or(Errno::Io)?
    }

    fn write(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        vp.with_data::<CtlData, _>(|data| match data {
            CtlData::Node(node) => node.ctl_write(txn),
            _ => Err(Errno::Io),
        })
        .ok_or(Errno::Io)?
    }
}

/// Mountable ctlfs, handing the instance back for registrations.
pub struct CtlfsMount {
    instance: Arc<Ctlfs>,
}

impl CtlfsMount {
    /// A mountable wrapper around a new instance.
    pub fn new() -> Self {
        Self {
            instance: Ctlfs::new(),
        }
    }

    /// The underlying instance.
    pub fn instance(&self) -> Arc<Ctlfs> {
        Arc::clone(&self.instance)
    }
}

impl Default for CtlfsMount {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsOps for CtlfsMount {
    fn init(&self) -> Result<Arc<Vnode>, Errno> {
        Ok(self.instance.root_vnode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FourBytes;
    impl CtlNode for FourBytes {
        fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
            read_bytes_at(&0xDEAD_BEEFu32.to_le_bytes(), txn)
        }
    }

    #[test]
    fn two_level_lookup_and_read() {
        let fs = Ctlfs::new();
        fs.register("vm", "stat", Arc::new(FourBytes)).unwrap();
        assert_eq!(
            fs.register("vm", "stat", Arc::new(FourBytes)).unwrap_err(),
            Errno::Exist
        );

        let root = fs.root_vnode();
        let group = root.vop_lookup("vm").unwrap();
        assert_eq!(group.vtype(), VnodeType::Dir);
        let node = group.vop_lookup("stat").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(node.vop_read(&mut SioTxn::read(&mut buf, 0)).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(buf), 0xDEAD_BEEF);

        // Offset reads work for blobs.
        let mut tail = [0u8; 2];
        assert_eq!(node.vop_read(&mut SioTxn::read(&mut tail, 2)).unwrap(), 2);

        assert_eq!(root.vop_lookup("net").unwrap_err(), Errno::Noent);
        assert_eq!(group.vop_lookup("other").unwrap_err(), Errno::Noent);
    }

    #[test]
    fn nodes_default_to_read_only() {
        let fs = Ctlfs::new();
        fs.register("sched", "stat", Arc::new(FourBytes)).unwrap();
        let node = fs
            .root_vnode()
            .vop_lookup("sched")
            .unwrap()
            .vop_lookup("stat")
            .unwrap();
        assert_eq!(
            node.vop_write(&mut SioTxn::write(b"no", 0)).unwrap_err(),
            Errno::Nosup
        );
    }
}
