//! Per-process file-descriptor tables.
//!
//! A fixed array of `PROC_MAX_FILEDES` slots; `open` takes the lowest free
//! one. Each descriptor pairs a referenced vnode with its own offset and
//! open flags; `close` gives the reference back through the vnode-cache
//! release path.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::mount::Namespace;
use crate::namei::{namei, namei_parent};
use crate::vcache::{Vcache, release_vnode};
use crate::vnode::{VAttr, Vnode, VnodeType};
use crate::SioTxn;

/// File descriptors per process.
pub const PROC_MAX_FILEDES: usize = 256;

bitflags! {
    /// Open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Reads allowed.
        const READ   = 1 << 0;
        /// Writes allowed.
        const WRITE  = 1 << 1;
        /// Create the file if missing.
        const CREATE = 1 << 2;
    }
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute offset.
    Set,
    /// Relative to the current offset.
    Cur,
    /// Relative to end of file.
    End,
}

impl Whence {
    /// Decodes the syscall integer encoding.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// One open descriptor.
pub struct FileDesc {
    /// The open vnode (holding one reference).
    pub vnode: Arc<Vnode>,
    /// Current file offset.
    pub offset: u64,
    /// Flags given at open.
    pub flags: OpenFlags,
}

/// The per-process descriptor array.
pub struct FdTable {
    slots: Vec<Option<FileDesc>>,
}

impl FdTable {
    /// An empty table.
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(PROC_MAX_FILEDES, || None);
        Self { slots }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Shared access to a descriptor.
    pub fn get(&self, fd: usize) -> Result<&FileDesc, Errno> {
        self.slots.get(fd).and_then(Option::as_ref).ok_or(Errno::Badf)
    }

    /// Mutable access to a descriptor.
    pub fn get_mut(&mut self, fd: usize) -> Result<&mut FileDesc, Errno> {
        self.slots.get_mut(fd).and_then(Option::as_mut).ok_or(Errno::Badf)
    }

    /// Opens `path`, allocating the lowest free descriptor.
    ///
    /// With [`OpenFlags::CREATE`], a missing final component is created as
    /// a regular file in its parent directory.
    ///
    /// # Errors
    ///
    /// Path resolution errors propagate; a full table reports
    /// [`Errno::Nospc`].
    pub fn open(&mut self, ns: &Namespace, path: &str, flags: OpenFlags) -> Result<usize, Errno> {
        let vnode = match namei(ns, path) {
            Ok(vp) => vp,
            Err(Errno::Noent) if flags.contains(OpenFlags::CREATE) => {
                let (dir, name) = namei_parent(ns, path)?;
                dir.vop_create(name, VnodeType::Reg)?
            }
            Err(e) => return Err(e),
        };

        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Errno::Nospc)?;
        vnode.vref();
        self.slots[fd] = Some(FileDesc {
            vnode,
            offset: 0,
            flags,
        });
        Ok(fd)
    }

    /// Closes `fd`, releasing the vnode reference.
    ///
    /// # Errors
    ///
    /// [`Errno::Badf`] for a bad descriptor; release failures propagate.
    pub fn close(&mut self, fd: usize, proc_cache: Option<&SpinLock<Vcache>>) -> Result<(), Errno> {
        let desc = self
            .slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(Errno::Badf)?;
        release_vnode(&desc.vnode, proc_cache)
    }

    /// Reads from `fd` at its current offset, advancing it.
    ///
    /// # Errors
    ///
    /// [`Errno::Badf`] / [`Errno::Acces`] / filesystem errors.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        let desc = self.get_mut(fd)?;
        if !desc.flags.contains(OpenFlags::READ) {
            return Err(Errno::Acces);
        }
        let mut txn = SioTxn::read(buf, desc.offset);
        let n = desc.vnode.vop_read(&mut txn)?;
        desc.offset += n as u64;
        Ok(n)
    }

    /// Writes to `fd` at its current offset, advancing it.
    ///
    /// # Errors
    ///
    /// [`Errno::Badf`] / [`Errno::Acces`] / filesystem errors.
    pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize, Errno> {
        let desc = self.get_mut(fd)?;
        if !desc.flags.contains(OpenFlags::WRITE) {
            return Err(Errno::Acces);
        }
        let mut txn = SioTxn::write(buf, desc.offset);
        let n = desc.vnode.vop_write(&mut txn)?;
        desc.offset += n as u64;
        Ok(n)
    }

    /// Repositions `fd`'s offset.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for an offset that would go negative; `End` seeks
    /// need a working `getattr`.
    pub fn lseek(&mut self, fd: usize, off: i64, whence: Whence) -> Result<u64, Errno> {
        let desc = self.get_mut(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => desc.offset as i64,
            Whence::End => desc.vnode.vop_getattr()?.size as i64,
        };
        let target = base.checked_add(off).ok_or(Errno::Inval)?;
        if target < 0 {
            return Err(Errno::Inval);
        }
        desc.offset = target as u64;
        Ok(desc.offset)
    }

    /// Attributes of the object behind `fd`.
    ///
    /// # Errors
    ///
    /// [`Errno::Badf`] / filesystem errors.
    pub fn stat(&self, fd: usize) -> Result<VAttr, Errno> {
        self.get(fd)?.vnode.vop_getattr()
    }

    /// Duplicates the table for a forked child, taking a reference per
    /// open descriptor.
    pub fn clone_for_fork(&self) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(PROC_MAX_FILEDES, || None);
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(desc) = slot {
                desc.vnode.vref();
                slots[i] = Some(FileDesc {
                    vnode: Arc::clone(&desc.vnode),
                    offset: desc.offset,
                    flags: desc.flags,
                });
            }
        }
        Self { slots }
    }

    /// Closes every descriptor (process exit).
    pub fn close_all(&mut self, proc_cache: Option<&SpinLock<Vcache>>) {
        for fd in 0..PROC_MAX_FILEDES {
            let _ = self.close(fd, proc_cache);
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::Tmpfs;

    fn fixture() -> Namespace {
        let ns = Namespace::new();
        let root = Tmpfs::new_root();
        root.vop_create("etc", VnodeType::Dir)
            .unwrap()
            .vop_create("hostname", VnodeType::Reg)
            .unwrap()
            .vop_write(&mut SioTxn::write(b"muon\n", 0))
            .unwrap();
        ns.set_root(root);
        ns
    }

    #[test]
    fn open_read_close_roundtrip() {
        let ns = fixture();
        let mut fds = FdTable::new();

        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        assert_eq!(fd, 0);
        let mut buf = [0u8; 16];
        assert_eq!(fds.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"muon\n");
        // Offset advanced: next read hits EOF.
        assert_eq!(fds.read(fd, &mut buf).unwrap(), 0);

        fds.close(fd, None).unwrap();
        assert_eq!(fds.read(fd, &mut buf).unwrap_err(), Errno::Badf);
        assert_eq!(fds.open_count(), 0);
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let ns = fixture();
        let mut fds = FdTable::new();
        let a = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        let b = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        let c = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        fds.close(b, None).unwrap();
        assert_eq!(fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap(), b);
    }

    #[test]
    fn open_close_leaves_vnode_refcount_intact() {
        let ns = fixture();
        let vp = namei(&ns, "/etc/hostname").unwrap();
        let before = vp.refcount();

        let mut fds = FdTable::new();
        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        assert_eq!(vp.refcount(), before + 1);
        fds.close(fd, None).unwrap();
        assert_eq!(vp.refcount(), before);
    }

    #[test]
    fn create_flag_makes_missing_files() {
        let ns = fixture();
        let mut fds = FdTable::new();
        assert_eq!(
            fds.open(&ns, "/fresh", OpenFlags::WRITE).unwrap_err(),
            Errno::Noent
        );
        let fd = fds
            .open(&ns, "/fresh", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        assert_eq!(fds.write(fd, b"data").unwrap(), 4);
        assert!(namei(&ns, "/fresh").is_ok());
    }

    #[test]
    fn access_mode_is_enforced() {
        let ns = fixture();
        let mut fds = FdTable::new();
        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        assert_eq!(fds.write(fd, b"x").unwrap_err(), Errno::Acces);
        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::WRITE).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fds.read(fd, &mut buf).unwrap_err(), Errno::Acces);
    }

    #[test]
    fn lseek_whences() {
        let ns = fixture();
        let mut fds = FdTable::new();
        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();

        assert_eq!(fds.lseek(fd, 2, Whence::Set).unwrap(), 2);
        assert_eq!(fds.lseek(fd, 1, Whence::Cur).unwrap(), 3);
        assert_eq!(fds.lseek(fd, -1, Whence::End).unwrap(), 4);
        assert_eq!(fds.lseek(fd, -10, Whence::Cur).unwrap_err(), Errno::Inval);

        let mut buf = [0u8; 4];
        assert_eq!(fds.read(fd, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'\n');
    }

    #[test]
    fn fork_duplicates_descriptors_with_refs() {
        let ns = fixture();
        let vp = namei(&ns, "/etc/hostname").unwrap();
        let mut fds = FdTable::new();
        let fd = fds.open(&ns, "/etc/hostname", OpenFlags::READ).unwrap();
        let before = vp.refcount();

        let mut child = fds.clone_for_fork();
        assert_eq!(vp.refcount(), before + 1);
        let mut buf = [0u8; 2];
        child.read(fd, &mut buf).unwrap();

        child.close_all(None);
        assert_eq!(vp.refcount(), before);
    }
}
