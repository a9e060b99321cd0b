//! procfs: read-only text entries under `/proc`.
//!
//! Flat namespace; subsystems register a [`ProcNode`] that renders its
//! content per read (`/proc/version`, `/proc/memstat`,
//! `/proc/interrupts`).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::SioTxn;
use crate::ctlfs::read_bytes_at;
use crate::mount::VfsOps;
use crate::vnode::{VAttr, Vnode, VnodeType, Vops};

/// One procfs entry: renders its full text on demand.
pub trait ProcNode: Send + Sync {
    /// Produces the entry's current content.
    fn render(&self) -> String;
}

/// A procfs instance.
pub struct Procfs {
    entries: SpinLock<BTreeMap<String, Arc<Vnode>>>,
}

impl Procfs {
    /// An empty procfs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Builds the root vnode for this instance.
    pub fn root_vnode(self: &Arc<Self>) -> Arc<Vnode> {
        let vp = Vnode::alloc(VnodeType::Dir, Arc::new(ProcfsVops));
        vp.set_data(Box::new(ProcData::Root(Arc::clone(self))));
        vp
    }

    /// Registers `/proc/<name>`.
    ///
    /// # Errors
    ///
    /// [`Errno::Exist`] on duplicates.
    pub fn add_entry(&self, name: &str, node: Arc<dyn ProcNode>) -> Result<(), Errno> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(Errno::Exist);
        }
        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(ProcfsVops));
        vp.set_data(Box::new(ProcData::Node(node)));
        entries.insert(name.to_string(), vp);
        Ok(())
    }
}

enum ProcData {
    Root(Arc<Procfs>),
    Node(Arc<dyn ProcNode>),
}

struct ProcfsVops;

impl Vops for ProcfsVops {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>, Errno> {
        dir.with_data::<ProcData, _>(|data| match data {
            ProcData::Root(fs) => fs.entries.lock().get(name).cloned().ok_or(Errno::Noent),
            ProcData::Node(_) => Err(Errno::Io),
        })
        .ok_or(Errno::Io)?
    }

    fn getattr(&self, vp: &Vnode) -> Result<VAttr, Errno> {
        let size = vp
            .with_data::<ProcData, _>(|data| match data {
                ProcData::Node(node) => node.render().len() as u64,
                ProcData::Root(_) => 0,
            })
            .ok_or(Errno::Io)?;
        Ok(VAttr {
            mode: if vp.vtype() == VnodeType::Dir { 0o555 } else { 0o444 },
            size,
            vtype: vp.vtype(),
        })
    }

    fn read(&self, vp: &Vnode, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        vp.with_data::<ProcData, _>(|data| match data {
            ProcData::Node(node) => read_bytes_at(node.render().as_bytes(), txn),
            ProcData::Root(_) => Err(Errno::Io),
        })
        .ok_or(Errno::Io)?
    }
}

/// Mountable procfs, handing the instance back for registrations.
pub struct ProcfsMount {
    instance: Arc<Procfs>,
}

impl ProcfsMount {
    /// A mountable wrapper around a new instance.
    pub fn new() -> Self {
        Self {
            instance: Procfs::new(),
        }
    }

    /// The underlying instance.
    pub fn instance(&self) -> Arc<Procfs> {
        Arc::clone(&self.instance)
    }
}

impl Default for ProcfsMount {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsOps for ProcfsMount {
    fn init(&self) -> Result<Arc<Vnode>, Errno> {
        Ok(self.instance.root_vnode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Version;
    impl ProcNode for Version {
        fn render(&self) -> String {
            "Muon/amd64 v0.3.0: 2026-08-01 (main)\n".to_string()
        }
    }

    #[test]
    fn entries_render_text() {
        let fs = Procfs::new();
        fs.add_entry("version", Arc::new(Version)).unwrap();
        assert_eq!(
            fs.add_entry("version", Arc::new(Version)).unwrap_err(),
            Errno::Exist
        );

        let root = fs.root_vnode();
        let vp = root.vop_lookup("version").unwrap();
        let mut buf = [0u8; 64];
        let n = vp.vop_read(&mut SioTxn::read(&mut buf, 0)).unwrap();
        assert!(core::str::from_utf8(&buf[..n]).unwrap().starts_with("Muon/amd64"));

        // Entries are read-only text.
        assert_eq!(
            vp.vop_write(&mut SioTxn::write(b"w", 0)).unwrap_err(),
            Errno::Io
        );
        assert_eq!(root.vop_lookup("cmdline").unwrap_err(), Errno::Noent);
    }

    #[test]
    fn getattr_reports_rendered_size() {
        let fs = Procfs::new();
        fs.add_entry("version", Arc::new(Version)).unwrap();
        let vp = fs.root_vnode().vop_lookup("version").unwrap();
        let attr = vp.vop_getattr().unwrap();
        assert_eq!(attr.size as usize, Version.render().len());
        assert_eq!(attr.mode, 0o444);
    }
}
