//! tmpfs: RAM-backed read/write filesystem, mounted at `/tmp` (and doing
//! double duty as the root filesystem).
//!
//! Every node is a [`TmpNode`] hung off the vnode's private data:
//! directories carry a name → vnode map, regular files a growable byte
//! buffer. Per-vnode serialization comes from the node's own locks.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::mount::VfsOps;
use crate::SioTxn;
use crate::vnode::{VAttr, Vnode, VnodeType, Vops};

/// One tmpfs node.
pub struct TmpNode {
    vtype: VnodeType,
    /// Directory entries (empty for files).
    children: SpinLock<BTreeMap<String, Arc<Vnode>>>,
    /// File content (empty for directories).
    content: SpinLock<Vec<u8>>,
}

impl TmpNode {
    fn new(vtype: VnodeType) -> Arc<Self> {
        Arc::new(Self {
            vtype,
            children: SpinLock::new(BTreeMap::new()),
            content: SpinLock::new(Vec::new()),
        })
    }
}

/// The tmpfs vops table (one shared instance).
struct TmpfsVops;

fn node_of(vp: &Vnode) -> Result<Arc<TmpNode>, Errno> {
    vp.with_data::<Arc<TmpNode>, _>(Arc::clone).ok_or(Errno::Io)
}

fn make_vnode(vtype: VnodeType) -> Arc<Vnode> {
    let vp = Vnode::alloc(vtype, Arc::new(TmpfsVops));
    vp.set_data(Box::new(TmpNode::new(vtype)));
    vp
}

impl Vops for TmpfsVops {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>, Errno> {
        let node = node_of(dir)?;
        if node.vtype != VnodeType::Dir {
            return Err(Errno::Io);
        }
        let children = node.children.lock();
        children.get(name).cloned().ok_or(Errno::Noent)
    }

    fn create(&self, dir: &Arc<Vnode>, name: &str, vtype: VnodeType) -> Result<Arc<Vnode>, Errno> {
        let node = node_of(dir)?;
        if node.vtype != VnodeType::Dir {
            return Err(Errno::Io);
        }
        let mut children = node.children.lock();
        if children.contains_key(name) {
            return Err(Errno::Exist);
        }
        let vp = make_vnode(vtype);
        children.insert(name.to_string(), Arc::clone(&vp));
        Ok(vp)
    }

    fn getattr(&self, vp: &Vnode) -> Result<VAttr, Errno> {
        let node = node_of(vp)?;
        Ok(match node.vtype {
            VnodeType::Dir => VAttr {
                mode: 0o755,
                size: node.children.lock().len() as u64,
                vtype: VnodeType::Dir,
            },
            _ => VAttr {
                mode: 0o644,
                size: node.content.lock().len() as u64,
                vtype: node.vtype,
            },
        })
    }

    fn read(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let node = node_of(vp)?;
        if node.vtype != VnodeType::Reg {
            return Err(Errno::Io);
        }
        let content = node.content.lock();
        let off = txn.offset as usize;
        let buf = txn.read_buf()?;
        let n = buf.len().min(content.len().saturating_sub(off));
        buf[..n].copy_from_slice(&content[off..off + n]);
        Ok(n)
    }

    fn write(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let node = node_of(vp)?;
        if node.vtype != VnodeType::Reg {
            return Err(Errno::Io);
        }
        let mut content = node.content.lock();
        let off = txn.offset as usize;
        let buf = txn.write_buf()?;
        if content.len() < off + buf.len() {
            content.resize(off + buf.len(), 0);
        }
        content[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// The tmpfs filesystem.
pub struct Tmpfs;

impl Tmpfs {
    /// Builds a fresh tmpfs and returns its root directory vnode.
    pub fn new_root() -> Arc<Vnode> {
        make_vnode(VnodeType::Dir)
    }
}

impl VfsOps for Tmpfs {
    fn init(&self) -> Result<Arc<Vnode>, Errno> {
        Ok(Self::new_root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_rw_roundtrip() {
        let root = Tmpfs::new_root();
        let f = root.vop_create("note", VnodeType::Reg).unwrap();
        assert_eq!(root.vop_create("note", VnodeType::Reg).unwrap_err(), Errno::Exist);

        let hit = root.vop_lookup("note").unwrap();
        assert!(Arc::ptr_eq(&hit, &f));

        let mut txn = SioTxn::write(b"sealed in ram", 0);
        assert_eq!(f.vop_write(&mut txn).unwrap(), 13);

        let mut buf = [0u8; 13];
        let mut txn = SioTxn::read(&mut buf, 0);
        assert_eq!(f.vop_read(&mut txn).unwrap(), 13);
        assert_eq!(&buf, b"sealed in ram");

        let attr = f.vop_getattr().unwrap();
        assert_eq!(attr.size, 13);
        assert_eq!(attr.vtype, VnodeType::Reg);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let root = Tmpfs::new_root();
        let f = root.vop_create("sparse", VnodeType::Reg).unwrap();
        let mut txn = SioTxn::write(b"x", 10);
        f.vop_write(&mut txn).unwrap();

        let mut buf = [0xFFu8; 11];
        let mut txn = SioTxn::read(&mut buf, 0);
        assert_eq!(f.vop_read(&mut txn).unwrap(), 11);
        assert!(buf[..10].iter().all(|&b| b == 0));
        assert_eq!(buf[10], b'x');
    }

    #[test]
    fn read_past_eof_is_zero_length() {
        let root = Tmpfs::new_root();
        let f = root.vop_create("short", VnodeType::Reg).unwrap();
        f.vop_write(&mut SioTxn::write(b"ab", 0)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.vop_read(&mut SioTxn::read(&mut buf, 2)).unwrap(), 0);
        assert_eq!(f.vop_read(&mut SioTxn::read(&mut buf, 100)).unwrap(), 0);
    }

    #[test]
    fn files_reject_dir_ops_and_vice_versa() {
        let root = Tmpfs::new_root();
        let f = root.vop_create("plain", VnodeType::Reg).unwrap();
        assert_eq!(f.vop_lookup("x").unwrap_err(), Errno::Io);
        let mut buf = [0u8; 1];
        assert_eq!(
            root.vop_read(&mut SioTxn::read(&mut buf, 0)).unwrap_err(),
            Errno::Io
        );
    }
}
