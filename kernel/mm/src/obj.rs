//! `VmObject`: a named collection of pages with a pluggable pager.
//!
//! Three pager capabilities:
//!
//! - **Anon** — zero-fill on first touch, nothing to write back.
//! - **Backed** — read-through/write-through against a [`PagerBackend`]
//!   (in practice: a vnode's read/write vops). Transfers use the page's
//!   direct-map address and page-aligned lengths.
//! - **Device** — pages are conjured from the device's own `mmap` hook;
//!   their frames never belong to the frame allocator.
//!
//! The object spinlock covers the page tree for the duration of `get` and
//! `store`. A page already busied by another CPU is waited on with a
//! bounded spin (≈200 ms); running out of patience surfaces as
//! [`Errno::Timedout`] rather than a hang.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::{PAGE_SIZE, PhysAddr};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::page::{PG_CLEAN, PG_DEVICE, PG_VALID, VmPage};
use crate::pmap::Prot;
use crate::pmm::Pmm;

/// How long `get`/`store` will wait on a busy page before giving up.
pub const PAGE_BUSY_TIMEOUT_USEC: u64 = 200_000;

/// Zero the freshly allocated page (the frame allocator already does, but
/// recycled object pages may not be).
pub const PALLOC_ZERO: u32 = 1 << 0;

/// Live `VmObject` count, for `/proc/memstat`.
static OBJECT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of live VM objects.
pub fn object_count() -> u64 {
    OBJECT_COUNT.load(Ordering::Relaxed)
}

/// Backing store used by the backed pager: read/write at byte granularity
/// against whatever sits behind the object (a vnode, in practice).
pub trait PagerBackend: Send + Sync {
    /// Fills `buf` from the store at `off`; returns bytes read.
    fn backing_read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno>;

    /// Writes `buf` to the store at `off`; returns bytes written.
    fn backing_write(&self, buf: &[u8], off: u64) -> Result<usize, Errno>;
}

/// Device mapping hook used by the device pager: byte offset in, physical
/// address out.
pub trait DevMmap: Send + Sync {
    /// Physical address backing `off`, or `None` if the device cannot.
    fn dev_mmap(&self, off: u64) -> Option<PhysAddr>;
}

/// The pager capability of an object.
pub enum Pager {
    /// Zero-fill anonymous memory.
    Anon,
    /// Read/write-through to a backing store.
    Backed(Arc<dyn PagerBackend>),
    /// Frames supplied by a device's `mmap` hook.
    Device(Arc<dyn DevMmap>),
}

struct ObjInner {
    /// Resident pages keyed by byte offset.
    pages: BTreeMap<u64, Arc<VmPage>>,
}

/// A named collection of pages.
///
/// Reference counting is the `Arc` strong count: one per mapping that points
/// here plus one for an owning vnode. Destruction returns every
/// allocator-owned page to the [`Pmm`].
pub struct VmObject {
    inner: SpinLock<ObjInner>,
    pager: Pager,
    prot: Prot,
    pmm: Arc<Pmm>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("prot", &self.prot)
            .finish_non_exhaustive()
    }
}

impl VmObject {
    /// Creates an anonymous (zero-fill) object.
    pub fn new_anon(pmm: Arc<Pmm>, prot: Prot) -> Arc<Self> {
        Self::build(pmm, Pager::Anon, prot)
    }

    /// Creates an object backed by a store (vnode pager).
    pub fn new_backed(pmm: Arc<Pmm>, backend: Arc<dyn PagerBackend>, prot: Prot) -> Arc<Self> {
        Self::build(pmm, Pager::Backed(backend), prot)
    }

    /// Creates an object whose pages come from a device `mmap` hook.
    pub fn new_device(pmm: Arc<Pmm>, dev: Arc<dyn DevMmap>, prot: Prot) -> Arc<Self> {
        Self::build(pmm, Pager::Device(dev), prot)
    }

    fn build(pmm: Arc<Pmm>, pager: Pager, prot: Prot) -> Arc<Self> {
        OBJECT_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            inner: SpinLock::new(ObjInner {
                pages: BTreeMap::new(),
            }),
            pager,
            prot,
            pmm,
        })
    }

    /// The protection this object was created with.
    pub fn prot(&self) -> Prot {
        self.prot
    }

    /// The allocator backing this object's pages.
    pub fn pmm(&self) -> &Arc<Pmm> {
        &self.pmm
    }

    /// Current reference count (mappings + vnode owner + transient).
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Looks up the resident page at `off` (page aligned down).
    pub fn pagelookup(&self, off: u64) -> Option<Arc<VmPage>> {
        let off = off & !(PAGE_SIZE as u64 - 1);
        self.inner.lock().pages.get(&off).cloned()
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Allocates (or returns) the page at `off`.
    ///
    /// # Errors
    ///
    /// [`Errno::Nomem`] if the frame allocator is exhausted.
    pub fn pagealloc(&self, off: u64, flags: u32) -> Result<Arc<VmPage>, Errno> {
        let off = off & !(PAGE_SIZE as u64 - 1);
        let mut inner = self.inner.lock();
        if let Some(pg) = inner.pages.get(&off) {
            return Ok(Arc::clone(pg));
        }
        let frame = if flags & PALLOC_ZERO != 0 {
            self.pmm.alloc_pageframe(1)
        } else {
            self.pmm.alloc_frame(1)
        };
        if frame.is_zero() {
            return Err(Errno::Nomem);
        }
        let pg = Arc::new(VmPage::new(frame, off, PG_VALID | PG_CLEAN));
        inner.pages.insert(off, Arc::clone(&pg));
        Ok(pg)
    }

    /// Evicts the page at `off`, returning its frame to the allocator.
    pub fn pagefree(&self, pg: &Arc<VmPage>) {
        let mut inner = self.inner.lock();
        if inner.pages.remove(&pg.offset()).is_some() && !pg.is_device() {
            self.pmm.free_frame(pg.phys(), 1);
        }
    }

    /// Pager `get`: makes the page at `off` resident and returns it.
    ///
    /// # Errors
    ///
    /// Backend I/O errors propagate; a busy page that stays busy past the
    /// timeout yields [`Errno::Timedout`]; a device refusing the offset
    /// yields [`Errno::Fault`].
    pub fn get(&self, off: u64) -> Result<Arc<VmPage>, Errno> {
        let off = off & !(PAGE_SIZE as u64 - 1);
        match &self.pager {
            Pager::Anon => self.pagealloc(off, PALLOC_ZERO),
            Pager::Backed(backend) => {
                if let Some(pg) = self.pagelookup(off) {
                    return Ok(pg);
                }
                let pg = self.pagealloc(off, PALLOC_ZERO)?;
                let res = self.with_busy_page(&pg, |slice| {
                    backend.backing_read(slice, off).map(|_| ())
                });
                if let Err(e) = res {
                    self.pagefree(&pg);
                    return Err(e);
                }
                Ok(pg)
            }
            Pager::Device(dev) => {
                if let Some(pg) = self.pagelookup(off) {
                    return Ok(pg);
                }
                let pa = dev.dev_mmap(off).ok_or(Errno::Fault)?;
                let pg = Arc::new(VmPage::new(pa, off, PG_VALID | PG_CLEAN | PG_DEVICE));
                self.inner.lock().pages.insert(off, Arc::clone(&pg));
                Ok(pg)
            }
        }
    }

    /// Pager `store`: writes the page at `off` back to the backing store.
    ///
    /// Anonymous pages have no store and succeed trivially; device pages
    /// cannot be stored.
    pub fn store(&self, off: u64) -> Result<(), Errno> {
        let off = off & !(PAGE_SIZE as u64 - 1);
        match &self.pager {
            Pager::Anon => Ok(()),
            Pager::Backed(backend) => {
                let pg = self.pagelookup(off).ok_or(Errno::Noent)?;
                self.with_busy_page(&pg, |slice| {
                    backend.backing_write(slice, off).map(|_| ())
                })?;
                pg.set_flags(PG_CLEAN);
                Ok(())
            }
            Pager::Device(_) => Err(Errno::Nosup),
        }
    }

    /// Runs `io` on the page's direct-mapped bytes while holding its busy
    /// lock, waiting out a current holder up to the pager timeout.
    fn with_busy_page(
        &self,
        pg: &Arc<VmPage>,
        io: impl FnOnce(&mut [u8]) -> Result<(), Errno>,
    ) -> Result<(), Errno> {
        let guard = match pg.busy.try_lock() {
            Some(g) => g,
            None => pg.busy.lock_usleep(PAGE_BUSY_TIMEOUT_USEC)?,
        };
        // SAFETY: The busy lock gives us exclusive use of the frame, which
        // the page owns.
        let slice = unsafe { self.pmm.frame_slice(pg.phys()) };
        let res = io(slice);
        drop(guard);
        res
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for (_, pg) in core::mem::take(&mut inner.pages) {
            if !pg.is_device() {
                self.pmm.free_frame(pg.phys(), 1);
            }
        }
        OBJECT_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pmm_fixture;

    /// A backend over an in-memory file image.
    struct VecBackend {
        data: SpinLock<Vec<u8>>,
    }

    impl PagerBackend for VecBackend {
        fn backing_read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
            let data = self.data.lock();
            let off = off as usize;
            let n = buf.len().min(data.len().saturating_sub(off));
            buf[..n].copy_from_slice(&data[off..off + n]);
            Ok(n)
        }

        fn backing_write(&self, buf: &[u8], off: u64) -> Result<usize, Errno> {
            let mut data = self.data.lock();
            let off = off as usize;
            if data.len() < off + buf.len() {
                data.resize(off + buf.len(), 0);
            }
            data[off..off + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn anon_pages_zero_fill_and_dedupe() {
        let (_arena, pmm) = pmm_fixture(64);
        let obj = VmObject::new_anon(Arc::clone(&pmm), Prot::READ | Prot::WRITE);
        let pg = obj.get(0x3123).unwrap();
        assert_eq!(pg.offset(), 0x3000);
        // SAFETY: Test owns the object.
        let bytes = unsafe { pmm.frame_slice(pg.phys()) };
        assert!(bytes.iter().all(|&b| b == 0));

        let again = obj.get(0x3000).unwrap();
        assert!(Arc::ptr_eq(&pg, &again));
        assert_eq!(obj.resident_pages(), 1);
    }

    #[test]
    fn page_tree_has_one_entry_per_offset() {
        let (_arena, pmm) = pmm_fixture(64);
        let obj = VmObject::new_anon(Arc::clone(&pmm), Prot::READ);
        for off in [0u64, 0x1000, 0x2000, 0x1000, 0] {
            obj.get(off).unwrap();
        }
        assert_eq!(obj.resident_pages(), 3);
        for off in [0u64, 0x1000, 0x2000] {
            let pg = obj.pagelookup(off).unwrap();
            assert_eq!(pg.offset(), off);
        }
    }

    #[test]
    fn backed_get_reads_through_and_store_writes_back() {
        let (_arena, pmm) = pmm_fixture(64);
        let mut image = vec![0u8; 2 * PAGE_SIZE];
        image[..5].copy_from_slice(b"hello");
        image[PAGE_SIZE] = 0xEE;
        let backend = Arc::new(VecBackend {
            data: SpinLock::new(image),
        });
        let obj = VmObject::new_backed(
            Arc::clone(&pmm),
            backend.clone(),
            Prot::READ | Prot::WRITE,
        );

        let pg = obj.get(0).unwrap();
        // SAFETY: Test owns the object.
        let bytes = unsafe { pmm.frame_slice(pg.phys()) };
        assert_eq!(&bytes[..5], b"hello");

        bytes[..5].copy_from_slice(b"HELLO");
        obj.store(0).unwrap();
        assert_eq!(&backend.data.lock()[..5], b"HELLO");

        let pg1 = obj.get(PAGE_SIZE as u64).unwrap();
        // SAFETY: Test owns the object.
        let bytes1 = unsafe { pmm.frame_slice(pg1.phys()) };
        assert_eq!(bytes1[0], 0xEE);
    }

    #[test]
    fn device_pager_uses_mmap_hook() {
        struct FixedDev;
        impl DevMmap for FixedDev {
            fn dev_mmap(&self, off: u64) -> Option<PhysAddr> {
                (off < 0x4000).then(|| PhysAddr::new(0xFD00_0000 + off))
            }
        }
        let (_arena, pmm) = pmm_fixture(16);
        let used = pmm.mem_used();
        let obj = VmObject::new_device(Arc::clone(&pmm), Arc::new(FixedDev), Prot::READ);
        let pg = obj.get(0x2000).unwrap();
        assert_eq!(pg.phys(), PhysAddr::new(0xFD00_2000));
        assert!(pg.is_device());
        // Device frames never came from the allocator.
        assert_eq!(pmm.mem_used(), used);
        assert_eq!(obj.get(0x9000).unwrap_err(), Errno::Fault);
        assert_eq!(obj.store(0x2000).unwrap_err(), Errno::Nosup);
        drop(obj);
        assert_eq!(pmm.mem_used(), used);
    }

    #[test]
    fn destruction_releases_frames() {
        let (_arena, pmm) = pmm_fixture(64);
        let used = pmm.mem_used();
        {
            let obj = VmObject::new_anon(Arc::clone(&pmm), Prot::READ);
            for i in 0..4u64 {
                obj.get(i * PAGE_SIZE as u64).unwrap();
            }
            assert_eq!(pmm.mem_used(), used + 4 * PAGE_SIZE as u64);
        }
        assert_eq!(pmm.mem_used(), used);
    }
}
