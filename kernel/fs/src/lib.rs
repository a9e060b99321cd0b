//! Muon virtual filesystem layer.
//!
//! The [`vnode`] module carries the core abstraction: a reference-counted
//! in-memory handle to a filesystem object with a capability table of
//! operations ([`Vops`]). Around it:
//!
//! - [`mount`] — the mount namespace ([`Namespace`]): root vnode, mount
//!   table, mount-point crossing.
//! - [`namei`] — component-by-component path resolution.
//! - [`vcache`] — the recyclable-vnode queue (global or per-process,
//!   switchable at run time through sysctl).
//! - [`fd`] — per-process file-descriptor tables.
//! - [`tmpfs`] / [`devfs`] / [`ctlfs`] / [`procfs`] — the built-in pseudo
//!   filesystems.
//!
//! I/O is described by a [`SioTxn`]: an offset plus a directional buffer.
//! Filesystems see one call per transaction and serialize per-vnode through
//! the locks in their private data.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ctlfs;
pub mod devfs;
pub mod fd;
pub mod mount;
pub mod namei;
pub mod procfs;
pub mod tmpfs;
pub mod vcache;
pub mod vnode;

pub use fd::{FdTable, OpenFlags, PROC_MAX_FILEDES, Whence};
pub use mount::{Mount, Namespace, VfsOps};
pub use namei::namei;
pub use vcache::{Vcache, VcacheType};
pub use vnode::{VAttr, Vnode, VnodeType, Vops};

use muon_core::errno::Errno;

/// Longest single path component, in bytes.
pub const NAME_MAX: usize = 256;

/// Longest full path, in bytes.
pub const PATH_MAX: usize = 1024;

/// The buffer side of a [`SioTxn`].
pub enum SioBuf<'a> {
    /// Data flows from the file into this buffer.
    Read(&'a mut [u8]),
    /// Data flows from this buffer into the file.
    Write(&'a [u8]),
}

/// A simple I/O transaction: `{buf, len, offset}`.
pub struct SioTxn<'a> {
    /// Byte offset into the file or device.
    pub offset: u64,
    /// Directional buffer.
    pub buf: SioBuf<'a>,
}

impl<'a> SioTxn<'a> {
    /// A read transaction filling `buf` from `offset`.
    pub fn read(buf: &'a mut [u8], offset: u64) -> Self {
        Self {
            offset,
            buf: SioBuf::Read(buf),
        }
    }

    /// A write transaction storing `buf` at `offset`.
    pub fn write(buf: &'a [u8], offset: u64) -> Self {
        Self {
            offset,
            buf: SioBuf::Write(buf),
        }
    }

    /// Transaction length in bytes.
    pub fn len(&self) -> usize {
        match &self.buf {
            SioBuf::Read(b) => b.len(),
            SioBuf::Write(b) => b.len(),
        }
    }

    /// Whether the transaction is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The destination buffer of a read transaction.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] if this is a write transaction.
    pub fn read_buf(&mut self) -> Result<&mut [u8], Errno> {
        match &mut self.buf {
            SioBuf::Read(b) => Ok(b),
            SioBuf::Write(_) => Err(Errno::Inval),
        }
    }

    /// The source buffer of a write transaction.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] if this is a read transaction.
    pub fn write_buf(&self) -> Result<&[u8], Errno> {
        match &self.buf {
            SioBuf::Write(b) => Ok(b),
            SioBuf::Read(_) => Err(Errno::Inval),
        }
    }
}

/// Character device switch: the operations a character device exposes to
/// devfs and, through `mmap`, to the device pager.
///
/// The default methods are the `noread`/`nowrite` stubs — a driver only
/// fills in what its hardware supports.
pub trait CharDevSw: Send + Sync {
    /// Reads from the device.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the driver overrides.
    fn read(&self, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }

    /// Writes to the device.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the driver overrides.
    fn write(&self, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }

    /// Physical address backing byte `off` of the device, for mmap-capable
    /// devices (framebuffers). `None` means the device cannot be mapped.
    fn mmap(&self, _off: u64) -> Option<muon_core::addr::PhysAddr> {
        None
    }
}

/// Block device switch.
pub trait BlockDevSw: Send + Sync {
    /// Reads sectors.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the driver overrides.
    fn read(&self, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }

    /// Writes sectors.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the driver overrides.
    fn write(&self, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }

    /// Device block size in bytes.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] unless the driver overrides (the `nobsize` stub).
    fn bsize(&self) -> Result<usize, Errno> {
        Err(Errno::Nosup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_directions() {
        let mut buf = [0u8; 8];
        let mut rd = SioTxn::read(&mut buf, 16);
        assert_eq!(rd.len(), 8);
        assert_eq!(rd.offset, 16);
        assert!(rd.read_buf().is_ok());
        assert_eq!(rd.write_buf().unwrap_err(), Errno::Inval);

        let wr = SioTxn::write(b"abc", 0);
        assert_eq!(wr.len(), 3);
        assert!(wr.write_buf().is_ok());
    }

    struct Bare;
    impl CharDevSw for Bare {}
    impl BlockDevSw for Bare {}

    #[test]
    fn devsw_stubs_refuse() {
        let mut buf = [0u8; 4];
        let mut txn = SioTxn::read(&mut buf, 0);
        assert_eq!(CharDevSw::read(&Bare, &mut txn).unwrap_err(), Errno::Nosup);
        assert_eq!(BlockDevSw::bsize(&Bare).unwrap_err(), Errno::Nosup);
        assert!(CharDevSw::mmap(&Bare, 0).is_none());
    }
}
