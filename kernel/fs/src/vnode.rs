//! Vnodes: reference-counted in-memory filesystem objects.
//!
//! A vnode couples a type tag, a capability table of operations
//! ([`Vops`]), filesystem-private data, and (lazily) an embedded VM object
//! so regular files can back memory mappings. Lifetime is explicit
//! refcounting in the classic style: [`vref`](Vnode::vref) takes a
//! reference, [`release`](crate::vcache::release_vnode) drops one and
//! reclaims + caches the vnode at zero. The `Arc` underneath is a storage
//! detail; the vnode refcount is the protocol.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;
use muon_mm::pmap::Prot;
use muon_mm::{PagerBackend, Pmm, VmObject};

use crate::SioTxn;

/// Vnode type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Uninitialized (cached/recycled).
    Non,
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Character device.
    Chr,
    /// Block device.
    Blk,
}

/// Attributes reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VAttr {
    /// Permission bits, `0o`-style.
    pub mode: u32,
    /// Object size in bytes.
    pub size: u64,
    /// Object type.
    pub vtype: VnodeType,
}

/// The capability table of a vnode.
///
/// Every method has a refusing default, so a filesystem implements exactly
/// the operations it supports; a missing operation reads as an I/O error to
/// callers, matching the dispatch contract.
pub trait Vops: Send + Sync {
    /// Looks `name` up in directory `dir`.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] when unsupported.
    fn lookup(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::Io)
    }

    /// Creates `name` in directory `dir`.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] when the filesystem is read-only.
    fn create(&self, _dir: &Arc<Vnode>, _name: &str, _vtype: VnodeType) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::Nosup)
    }

    /// Reports attributes.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] when unsupported.
    fn getattr(&self, _vp: &Vnode) -> Result<VAttr, Errno> {
        Err(Errno::Io)
    }

    /// Transfers data out of the object.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] when unsupported.
    fn read(&self, _vp: &Vnode, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Io)
    }

    /// Transfers data into the object.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] when unsupported.
    fn write(&self, _vp: &Vnode, _txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        Err(Errno::Io)
    }

    /// Tears down private state when the last reference drops.
    ///
    /// # Errors
    ///
    /// Filesystems may refuse, which aborts caching of the vnode.
    fn reclaim(&self, _vp: &Vnode) -> Result<(), Errno> {
        Ok(())
    }
}

/// Mutable vnode state, guarded by one per-vnode spinlock.
struct VnodeState {
    vtype: VnodeType,
    vops: Option<Arc<dyn Vops>>,
    data: Option<Box<dyn Any + Send + Sync>>,
    /// Embedded VM object for file-backed mappings, created on first use.
    vobj: Option<Arc<VmObject>>,
}

/// An in-memory reference to a filesystem object.
pub struct Vnode {
    refcount: AtomicU32,
    state: SpinLock<VnodeState>,
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("refcount", &self.refcount)
            .finish_non_exhaustive()
    }
}

impl Vnode {
    /// Allocates a fresh vnode with one reference.
    pub fn alloc(vtype: VnodeType, vops: Arc<dyn Vops>) -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicU32::new(1),
            state: SpinLock::new(VnodeState {
                vtype,
                vops: Some(vops),
                data: None,
                vobj: None,
            }),
        })
    }

    /// Re-initializes a recycled vnode in place (refcount back to one,
    /// previous identity gone).
    pub(crate) fn reinit(&self, vtype: VnodeType, vops: Arc<dyn Vops>) {
        let mut st = self.state.lock();
        st.vtype = vtype;
        st.vops = Some(vops);
        st.data = None;
        st.vobj = None;
        self.refcount.store(1, Ordering::Release);
    }

    /// Marks the vnode inert after reclaim, before it enters the cache.
    pub(crate) fn clear(&self) {
        let mut st = self.state.lock();
        st.vtype = VnodeType::Non;
        st.vops = None;
        st.data = None;
        st.vobj = None;
    }

    /// Current type tag.
    pub fn vtype(&self) -> VnodeType {
        self.state.lock().vtype
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes one reference.
    pub fn vref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics if the count was already zero — that is a bad-refcount
    /// invariant break, not an error to report.
    pub(crate) fn unref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "vnode: refcount underflow");
        prev - 1
    }

    /// Installs filesystem-private data.
    pub fn set_data(&self, data: Box<dyn Any + Send + Sync>) {
        self.state.lock().data = Some(data);
    }

    /// Borrows the private data, downcast to `T`, through `f`.
    pub fn with_data<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let st = self.state.lock();
        st.data.as_ref()?.downcast_ref::<T>().map(f)
    }

    /// The vops table, if the vnode is live.
    fn vops(&self) -> Result<Arc<dyn Vops>, Errno> {
        self.state.lock().vops.clone().ok_or(Errno::Io)
    }

    // ── vop dispatch ────────────────────────────────────────────────

    /// Dispatches `lookup`.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] if the vnode has no table or the op is unsupported.
    pub fn vop_lookup(self: &Arc<Self>, name: &str) -> Result<Arc<Vnode>, Errno> {
        self.vops()?.lookup(self, name)
    }

    /// Dispatches `create`.
    ///
    /// # Errors
    ///
    /// As the filesystem reports.
    pub fn vop_create(self: &Arc<Self>, name: &str, vtype: VnodeType) -> Result<Arc<Vnode>, Errno> {
        self.vops()?.create(self, name, vtype)
    }

    /// Dispatches `getattr`.
    ///
    /// # Errors
    ///
    /// [`Errno::Io`] if the vnode has no table or the op is unsupported.
    pub fn vop_getattr(&self) -> Result<VAttr, Errno> {
        self.vops()?.getattr(self)
    }

    /// Dispatches `read`.
    ///
    /// # Errors
    ///
    /// As the filesystem reports; negative transfer is impossible by type.
    pub fn vop_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        self.vops()?.read(self, txn)
    }

    /// Dispatches `write`.
    ///
    /// # Errors
    ///
    /// As the filesystem reports.
    pub fn vop_write(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        self.vops()?.write(self, txn)
    }

    /// Dispatches `reclaim`.
    ///
    /// # Errors
    ///
    /// As the filesystem reports.
    pub fn vop_reclaim(&self) -> Result<(), Errno> {
        self.vops()?.reclaim(self)
    }

    /// The embedded VM object backing memory mappings of this vnode,
    /// created on first request.
    ///
    /// # Errors
    ///
    /// [`Errno::Nodev`] for vnode types that cannot back memory.
    pub fn object(self: &Arc<Self>, pmm: &Arc<Pmm>) -> Result<Arc<VmObject>, Errno> {
        let mut st = self.state.lock();
        if let Some(obj) = &st.vobj {
            return Ok(Arc::clone(obj));
        }
        if st.vtype != VnodeType::Reg {
            return Err(Errno::Nodev);
        }
        let backend = Arc::new(VnodeBackend {
            vnode: Arc::clone(self),
        });
        let obj = VmObject::new_backed(
            Arc::clone(pmm),
            backend,
            Prot::READ | Prot::WRITE | Prot::EXEC | Prot::USER,
        );
        st.vobj = Some(Arc::clone(&obj));
        Ok(obj)
    }
}

/// Adapter giving the VM layer's backed pager a vnode to talk to.
struct VnodeBackend {
    vnode: Arc<Vnode>,
}

impl PagerBackend for VnodeBackend {
    fn backing_read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        let mut txn = SioTxn::read(buf, off);
        self.vnode.vop_read(&mut txn)
    }

    fn backing_write(&self, buf: &[u8], off: u64) -> Result<usize, Errno> {
        let mut txn = SioTxn::write(buf, off);
        self.vnode.vop_write(&mut txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;
    impl Vops for NullOps {}

    #[test]
    fn missing_ops_read_as_io_error() {
        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(NullOps));
        let mut buf = [0u8; 4];
        let mut txn = SioTxn::read(&mut buf, 0);
        assert_eq!(vp.vop_read(&mut txn).unwrap_err(), Errno::Io);
        assert_eq!(vp.vop_getattr().unwrap_err(), Errno::Io);
        assert_eq!(vp.vop_lookup("x").unwrap_err(), Errno::Io);
    }

    #[test]
    fn refcounting_protocol() {
        let vp = Vnode::alloc(VnodeType::Dir, Arc::new(NullOps));
        assert_eq!(vp.refcount(), 1);
        vp.vref();
        assert_eq!(vp.refcount(), 2);
        assert_eq!(vp.unref(), 1);
        assert_eq!(vp.unref(), 0);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn underflow_is_fatal() {
        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(NullOps));
        vp.unref();
        vp.unref();
    }

    #[test]
    fn private_data_downcasts() {
        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(NullOps));
        vp.set_data(Box::new(41u64));
        assert_eq!(vp.with_data::<u64, _>(|v| *v + 1), Some(42));
        assert_eq!(vp.with_data::<u32, _>(|v| *v), None);
    }

    #[test]
    fn embedded_object_is_singular_and_reg_only() {
        use alloc::vec;
        use muon_mm::{PhysMemoryRegion, Pmm};

        // A tiny arena so the object has a real allocator behind it.
        let layout = core::alloc::Layout::from_size_align(16 * 4096, 4096).unwrap();
        // SAFETY: non-zero layout.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let regions = vec![PhysMemoryRegion {
            start: muon_core::PhysAddr::zero(),
            size: 16 * 4096,
            usable: true,
        }];
        // SAFETY: the fresh allocation really is writable at base + pa.
        let pmm = Arc::new(unsafe { Pmm::new(&regions, base as u64).unwrap() });

        let vp = Vnode::alloc(VnodeType::Reg, Arc::new(NullOps));
        let a = vp.object(&pmm).unwrap();
        let b = vp.object(&pmm).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // The vnode's own hold plus our two handles.
        assert!(a.refcount() >= 3);

        let dir = Vnode::alloc(VnodeType::Dir, Arc::new(NullOps));
        assert_eq!(dir.object(&pmm).unwrap_err(), Errno::Nodev);
    }
}
