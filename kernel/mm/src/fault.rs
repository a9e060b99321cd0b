//! Page-fault servicing: demand paging and copy-on-write.
//!
//! The trap layer hands us the faulting address and the attempted access;
//! everything else comes from the process's ledger. A `Fault`/`Acces`
//! error from here means the access was bogus and the owning thread gets a
//! SIGSEGV; `Nomem`/`Io`/`Timedout` mean the pager could not deliver and
//! are reported the same way, never panicked on.

use alloc::sync::Arc;

use muon_core::addr::{PAGE_SIZE, VirtAddr};
use muon_core::errno::Errno;

use crate::map::MmapLedger;
use crate::obj::{PALLOC_ZERO, VmObject};
use crate::pmap::{Prot, Vas};

/// Services a fault at `va` for an attempted `access`.
///
/// On success the covering page is resident and mapped in `vas` with
/// whatever protection the entry allows (write access may be withheld to
/// arm a later copy-on-write fault).
///
/// # Errors
///
/// [`Errno::Fault`] if no reservation covers `va`; [`Errno::Acces`] if the
/// access contradicts the reservation's protection; pager failures
/// propagate.
pub fn vm_fault(
    vas: &Vas,
    ledger: &mut MmapLedger,
    va: VirtAddr,
    access: Prot,
) -> Result<(), Errno> {
    let va_base = va.align_down(PAGE_SIZE as u64);
    let pmm = Arc::clone(vas.pmm());

    let entry = ledger.lookup_mut(va_base).ok_or(Errno::Fault)?;
    if !entry.prot.contains(access & (Prot::READ | Prot::WRITE | Prot::EXEC)) {
        return Err(Errno::Acces);
    }

    // Hold our own reference across the pager call; a concurrent munmap on
    // another thread must not tear the object down under us.
    let object = Arc::clone(&entry.object);

    let delta = va_base.as_u64() - entry.start.as_u64();
    let obj_off = entry.obj_off + delta;

    if entry.cow && access.contains(Prot::WRITE) {
        // Write to a COW page: copy into the private shadow and map it
        // with full permissions.
        let shadow = entry
            .shadow
            .get_or_insert_with(|| VmObject::new_anon(Arc::clone(&pmm), entry.prot));

        if shadow.pagelookup(delta).is_none() {
            let dst = shadow.pagealloc(delta, PALLOC_ZERO)?;
            let src = match object.get(obj_off) {
                Ok(src) => src,
                Err(e) => {
                    // Do not leave a zero page masking the real data.
                    shadow.pagefree(&dst);
                    return Err(e);
                }
            };
            // SAFETY: Both frames are owned by their respective objects and
            // direct-mapped through the same allocator.
            unsafe {
                pmm.frame_slice(dst.phys())
                    .copy_from_slice(pmm.frame_slice(src.phys()));
            }
        }
        let pg = shadow.pagelookup(delta).ok_or(Errno::Fault)?;
        return vas.map(va_base, pg.phys(), entry.prot);
    }

    // Read/exec (or non-COW write): shadowed pages win, then the object.
    if let Some(shadow) = &entry.shadow {
        if let Some(pg) = shadow.pagelookup(delta) {
            return vas.map(va_base, pg.phys(), entry.prot);
        }
    }

    let pg = object.get(obj_off)?;
    let prot = if entry.cow {
        // Keep COW armed: the shared page goes in read-only.
        entry.prot & !Prot::WRITE
    } else {
        entry.prot
    };
    vas.map(va_base, pg.phys(), prot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{MapFlags, MmapLedger};
    use crate::obj::PagerBackend;
    use crate::testutil::pmm_fixture;
    use muon_core::sync::SpinLock;

    fn rw() -> Prot {
        Prot::READ | Prot::WRITE | Prot::USER
    }

    #[test]
    fn demand_pages_anon_mapping() {
        let (_arena, pmm) = pmm_fixture(128);
        let vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let mut lgdr = MmapLedger::new();
        let base = lgdr
            .map_at(
                &pmm,
                VirtAddr::zero(),
                2 * PAGE_SIZE,
                rw(),
                MapFlags::ANON | MapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();

        // Nothing is mapped until the fault.
        assert_eq!(vas.translate(base), None);
        vm_fault(&vas, &mut lgdr, base + 5, Prot::READ).unwrap();
        let pa = vas.translate(base).expect("resident after fault");

        // The page reads back zero.
        // SAFETY: The frame is owned by the entry's object.
        let bytes = unsafe { pmm.frame_slice(pa.align_down(PAGE_SIZE as u64)) };
        assert!(bytes.iter().all(|&b| b == 0));

        // Writes are allowed in place (no COW armed for plain anon).
        vm_fault(&vas, &mut lgdr, base, Prot::WRITE).unwrap();
        assert!(vas.protection(base).unwrap().contains(Prot::WRITE));
    }

    #[test]
    fn unmapped_and_forbidden_accesses_are_rejected() {
        let (_arena, pmm) = pmm_fixture(64);
        let vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let mut lgdr = MmapLedger::new();
        let base = lgdr
            .map_at(
                &pmm,
                VirtAddr::zero(),
                PAGE_SIZE,
                Prot::READ | Prot::USER,
                MapFlags::ANON | MapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();

        assert_eq!(
            vm_fault(&vas, &mut lgdr, VirtAddr::new(0x10), Prot::READ),
            Err(Errno::Fault)
        );
        assert_eq!(
            vm_fault(&vas, &mut lgdr, base, Prot::WRITE),
            Err(Errno::Acces)
        );
    }

    /// Backend that refuses all I/O, standing in for a dead disk.
    struct FailingBackend;
    impl PagerBackend for FailingBackend {
        fn backing_read(&self, _buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
            Err(Errno::Io)
        }
        fn backing_write(&self, _buf: &[u8], _off: u64) -> Result<usize, Errno> {
            Err(Errno::Io)
        }
    }

    #[test]
    fn pager_errors_propagate() {
        let (_arena, pmm) = pmm_fixture(64);
        let vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let mut lgdr = MmapLedger::new();
        let obj = VmObject::new_backed(Arc::clone(&pmm), Arc::new(FailingBackend), rw());
        let base = lgdr
            .map_at(
                &pmm,
                VirtAddr::zero(),
                PAGE_SIZE,
                rw(),
                MapFlags::SHARED,
                Some(obj),
                0,
            )
            .unwrap();
        assert_eq!(vm_fault(&vas, &mut lgdr, base, Prot::READ), Err(Errno::Io));
    }

    /// Backend over a shared byte image (a stand-in for a file's vnode).
    struct ImageBackend {
        data: SpinLock<Vec<u8>>,
    }
    impl PagerBackend for ImageBackend {
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
    fn private_file_mapping_copies_on_write() {
        let (_arena, pmm) = pmm_fixture(128);
        let vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let mut lgdr = MmapLedger::new();

        let mut image = vec![0u8; PAGE_SIZE];
        image[..4].copy_from_slice(b"file");
        let backend = Arc::new(ImageBackend {
            data: SpinLock::new(image),
        });
        let obj = VmObject::new_backed(Arc::clone(&pmm), backend.clone(), rw());
        let file_obj = Arc::clone(&obj);

        let base = lgdr
            .map_at(
                &pmm,
                VirtAddr::zero(),
                PAGE_SIZE,
                rw(),
                MapFlags::PRIVATE,
                Some(obj),
                0,
            )
            .unwrap();

        // Read fault: shared page arrives read-only (COW armed).
        vm_fault(&vas, &mut lgdr, base, Prot::READ).unwrap();
        assert!(!vas.protection(base).unwrap().contains(Prot::WRITE));

        // Write fault: the page is copied into the shadow, writable.
        vm_fault(&vas, &mut lgdr, base, Prot::WRITE).unwrap();
        assert!(vas.protection(base).unwrap().contains(Prot::WRITE));
        let pa = vas.translate(base).unwrap();
        // SAFETY: The shadow page belongs to the entry.
        let bytes = unsafe { pmm.frame_slice(pa) };
        assert_eq!(&bytes[..4], b"file");

        // Scribble on the shadow copy; the file object's page is untouched.
        bytes[..4].copy_from_slice(b"MINE");
        let orig = file_obj.pagelookup(0).unwrap();
        // SAFETY: The file page belongs to the file object.
        let orig_bytes = unsafe { pmm.frame_slice(orig.phys()) };
        assert_eq!(&orig_bytes[..4], b"file");
    }

    #[test]
    fn forked_anon_entry_cow_isolates_parent_and_child() {
        let (_arena, pmm) = pmm_fixture(128);
        let parent_vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let child_vas = Vas::new(Arc::clone(&pmm), true).unwrap();
        let mut parent = MmapLedger::new();

        let base = parent
            .map_at(
                &pmm,
                VirtAddr::zero(),
                PAGE_SIZE,
                rw(),
                MapFlags::ANON | MapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();

        // Parent touches the page and writes a marker.
        vm_fault(&parent_vas, &mut parent, base, Prot::WRITE).unwrap();
        let pa = parent_vas.translate(base).unwrap();
        // SAFETY: Frame owned by the parent's object.
        unsafe { pmm.frame_slice(pa)[..2].copy_from_slice(b"pa") };

        let mut child = parent.clone_for_fork(&parent_vas, &pmm).unwrap();

        // The parent's page went read-only.
        assert!(!parent_vas.protection(base).unwrap().contains(Prot::WRITE));

        // Child read sees the parent's data.
        vm_fault(&child_vas, &mut child, base, Prot::READ).unwrap();
        let child_pa = child_vas.translate(base).unwrap();
        // SAFETY: Frame shared COW at this point.
        assert_eq!(unsafe { &pmm.frame_slice(child_pa)[..2] }, b"pa");

        // Child write diverges.
        vm_fault(&child_vas, &mut child, base, Prot::WRITE).unwrap();
        let child_pa = child_vas.translate(base).unwrap();
        // SAFETY: Now the child's own shadow frame.
        unsafe { pmm.frame_slice(child_pa)[..2].copy_from_slice(b"ch") };

        // Parent write also diverges, into its own shadow.
        vm_fault(&parent_vas, &mut parent, base, Prot::WRITE).unwrap();
        let parent_pa = parent_vas.translate(base).unwrap();
        assert_ne!(parent_pa, child_pa);
        // SAFETY: Parent's shadow frame.
        assert_eq!(unsafe { &pmm.frame_slice(parent_pa)[..2] }, b"pa");
    }
}
