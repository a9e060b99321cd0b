//! The mount namespace.
//!
//! A [`Namespace`] is the root vnode plus the mount table: named
//! filesystems hashed by mount name, each remembering which vnode it
//! covers. Lookup crosses a mount point by swapping the covered vnode for
//! the mounted filesystem's root.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::errno::Errno;
use muon_core::hash::fnv1;
use muon_core::sync::SpinLock;

use crate::NAME_MAX;
use crate::vnode::Vnode;

/// Mount table bucket count.
const MOUNTLIST_SIZE: usize = 8;

/// How a filesystem plugs into the namespace: `init` builds the instance
/// and hands back its root vnode, which the namespace installs at the
/// mount point.
pub trait VfsOps: Send + Sync {
    /// Creates the filesystem instance, returning its root.
    ///
    /// # Errors
    ///
    /// Filesystem-specific; a failed `init` aborts the mount.
    fn init(&self) -> Result<Arc<Vnode>, Errno>;
}

/// One mounted filesystem.
pub struct Mount {
    /// Mount name, e.g. `"tmp"` for `/tmp`.
    pub name: String,
    /// Root vnode of the mounted filesystem.
    pub root: Arc<Vnode>,
    /// The vnode this mount overlays, if any.
    pub covered: Option<Arc<Vnode>>,
}

/// Root vnode + mount table.
pub struct Namespace {
    root: SpinLock<Option<Arc<Vnode>>>,
    buckets: [SpinLock<Vec<Arc<Mount>>>; MOUNTLIST_SIZE],
}

impl Namespace {
    /// An empty namespace (no root, nothing mounted).
    pub const fn new() -> Self {
        Self {
            root: SpinLock::new(None),
            buckets: [const { SpinLock::new(Vec::new()) }; MOUNTLIST_SIZE],
        }
    }

    /// Installs the process-global root vnode. The namespace holds one
    /// reference.
    pub fn set_root(&self, vp: Arc<Vnode>) {
        vp.vref();
        *self.root.lock() = Some(vp);
    }

    /// The root vnode.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] before a root is installed.
    pub fn root(&self) -> Result<Arc<Vnode>, Errno> {
        self.root.lock().clone().ok_or(Errno::Io)
    }

    /// Registers `fs_root` as the filesystem mounted at `name`, overlaying
    /// `covered`.
    ///
    /// # Errors
    ///
    /// [`Errno::Nametoolong`] / [`Errno::Exist`] on bad or duplicate names.
    pub fn mount(
        &self,
        name: &str,
        fs_root: Arc<Vnode>,
        covered: Option<Arc<Vnode>>,
    ) -> Result<(), Errno> {
        if name.len() > NAME_MAX {
            return Err(Errno::Nametoolong);
        }
        if self.lookup_mount(name).is_some() {
            return Err(Errno::Exist);
        }
        // The table owns a reference to both sides of the overlay.
        fs_root.vref();
        if let Some(vp) = &covered {
            vp.vref();
        }

        let bucket = fnv1(name) as usize % MOUNTLIST_SIZE;
        self.buckets[bucket].lock().push(Arc::new(Mount {
            name: name.to_string(),
            root: fs_root,
            covered,
        }));
        log::info!(target: "vfs", "mounted /{name}");
        Ok(())
    }

    /// Finds a mount by name.
    pub fn lookup_mount(&self, name: &str) -> Option<Arc<Mount>> {
        let bucket = fnv1(name) as usize % MOUNTLIST_SIZE;
        self.buckets[bucket]
            .lock()
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    /// If `vp` is a mount point, returns the root of the filesystem
    /// mounted over it.
    pub fn mount_crossing(&self, vp: &Arc<Vnode>) -> Option<Arc<Vnode>> {
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for m in bucket.iter() {
                if let Some(covered) = &m.covered {
                    if Arc::ptr_eq(covered, vp) {
                        return Some(Arc::clone(&m.root));
                    }
                }
            }
        }
        None
    }

    /// Initializes a filesystem through its [`VfsOps`] and mounts it at
    /// `name`, overlaying `covered`. Returns the new filesystem's root.
    ///
    /// # Errors
    ///
    /// Propagates `init` and [`Namespace::mount`] failures.
    pub fn mount_fs(
        &self,
        name: &str,
        ops: &dyn VfsOps,
        covered: Option<Arc<Vnode>>,
    ) -> Result<Arc<Vnode>, Errno> {
        let fs_root = ops.init()?;
        self.mount(name, Arc::clone(&fs_root), covered)?;
        Ok(fs_root)
    }

    /// All mount names, unordered (for diagnostics).
    pub fn mount_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for bucket in &self.buckets {
            names.extend(bucket.lock().iter().map(|m| m.name.clone()));
        }
        names
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}
