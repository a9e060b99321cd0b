//! Per-process mmap ledger.
//!
//! Every live virtual-memory reservation of a process is one [`MmapEntry`]
//! in an ordered tree keyed by start address. Entries never overlap; the
//! ledger enforces that on insert. Mapping is lazy — `map_at` only records
//! the reservation and the fault handler populates pages on demand.
//!
//! Copy-on-write layering: a private entry that must not write the shared
//! object (`cow`) grows a per-entry anonymous *shadow* object; write faults
//! copy the backing page into the shadow, and lookups consult the shadow
//! first. Forking shares the base object, marks both sides `cow`, and gives
//! the child eager copies of the parent's already-shadowed pages.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use bitflags::bitflags;
use muon_core::addr::{PAGE_SIZE, VirtAddr};
use muon_core::errno::Errno;

use crate::obj::{PALLOC_ZERO, VmObject};
use crate::pmap::{Prot, Vas, shootdown};
use crate::pmm::Pmm;

/// Sentinel returned to userland when `mmap` fails.
pub const MAP_FAILED: u64 = u64::MAX;

/// Default search base for address-less requests.
pub const MMAP_BASE: u64 = 0x0000_4000_0000;

/// Top of the user mmap region.
pub const MMAP_END: u64 = 0x0000_7F00_0000_0000;

bitflags! {
    /// `mmap` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Writes are carried through to the underlying object.
        const SHARED  = 0x0001;
        /// Writes stay private to this process (copy-on-write).
        const PRIVATE = 0x0002;
        /// No backing file; fresh zero-fill object.
        const ANON    = 0x0010;
        /// The supplied address is mandatory.
        const FIXED   = 0x0020;
    }
}

/// One live reservation.
pub struct MmapEntry {
    /// First mapped address (page aligned).
    pub start: VirtAddr,
    /// Length in bytes (page rounded).
    pub len: usize,
    /// Allowed access.
    pub prot: Prot,
    /// Request flags.
    pub flags: MapFlags,
    /// Backing object.
    pub object: Arc<VmObject>,
    /// Byte offset of `start` within `object`.
    pub obj_off: u64,
    /// Copy-on-write armed: writes must not reach `object`.
    pub cow: bool,
    /// Private overlay holding COW'd pages, keyed by offset from `start`.
    pub shadow: Option<Arc<VmObject>>,
}

impl MmapEntry {
    /// Whether `va` falls inside this reservation.
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start && va.as_u64() < self.start.as_u64() + self.len as u64
    }
}

/// The per-process reservation tree.
#[derive(Default)]
pub struct MmapLedger {
    entries: BTreeMap<u64, MmapEntry>,
}

impl MmapLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live reservations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry covering `va`, if any.
    pub fn lookup(&self, va: VirtAddr) -> Option<&MmapEntry> {
        let (_, entry) = self.entries.range(..=va.as_u64()).next_back()?;
        entry.contains(va).then_some(entry)
    }

    /// Mutable access to the entry covering `va`.
    pub fn lookup_mut(&mut self, va: VirtAddr) -> Option<&mut MmapEntry> {
        let (&key, _) = self.entries.range(..=va.as_u64()).next_back()?;
        let entry = self.entries.get_mut(&key)?;
        entry.contains(va).then_some(entry)
    }

    /// Iterates all entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &MmapEntry> {
        self.entries.values()
    }

    /// Whether `[start, start+len)` is free of reservations.
    fn range_free(&self, start: u64, len: u64) -> bool {
        if let Some((_, prev)) = self.entries.range(..=start).next_back() {
            if prev.start.as_u64() + prev.len as u64 > start {
                return false;
            }
        }
        if let Some((&next, _)) = self.entries.range(start..).next() {
            if next < start + len {
                return false;
            }
        }
        true
    }

    /// Lowest free range of `len` bytes at or above [`MMAP_BASE`].
    fn find_free(&self, len: u64) -> Option<u64> {
        let mut candidate = MMAP_BASE;
        for entry in self.entries.range(MMAP_BASE..) {
            let (start, e) = (*entry.0, entry.1);
            if candidate + len <= start {
                break;
            }
            candidate = candidate.max(start + e.len as u64);
        }
        (candidate + len <= MMAP_END).then_some(candidate)
    }

    /// Reserves a range in this ledger.
    ///
    /// `object` must be given unless `flags` contains
    /// [`MapFlags::ANON`]. The request must name exactly one of `SHARED`
    /// and `PRIVATE`. Lengths round up to whole pages; a non-`FIXED`
    /// address is a hint the ledger may ignore.
    ///
    /// Returns the chosen base address.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for a zero length, a missing object, or a bad
    /// `FIXED` address; [`Errno::Exist`] when a `FIXED` range overlaps;
    /// [`Errno::Nomem`] when the address space is exhausted.
    pub fn map_at(
        &mut self,
        pmm: &Arc<Pmm>,
        addr: VirtAddr,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        object: Option<Arc<VmObject>>,
        off: u64,
    ) -> Result<VirtAddr, Errno> {
        if len == 0 {
            return Err(Errno::Inval);
        }
        if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
            return Err(Errno::Inval);
        }
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let object = if flags.contains(MapFlags::ANON) {
            VmObject::new_anon(Arc::clone(pmm), prot)
        } else {
            object.ok_or(Errno::Inval)?
        };

        let start = if flags.contains(MapFlags::FIXED) {
            let base = addr.align_down(PAGE_SIZE as u64).as_u64();
            if base == 0 {
                return Err(Errno::Inval);
            }
            if !self.range_free(base, len as u64) {
                return Err(Errno::Exist);
            }
            base
        } else {
            let hint = addr.align_down(PAGE_SIZE as u64).as_u64();
            if hint != 0 && self.range_free(hint, len as u64) {
                hint
            } else {
                self.find_free(len as u64).ok_or(Errno::Nomem)?
            }
        };

        // File-backed private mappings must never write the file's pages.
        let cow = flags.contains(MapFlags::PRIVATE) && !flags.contains(MapFlags::ANON);

        self.entries.insert(
            start,
            MmapEntry {
                start: VirtAddr::new(start),
                len,
                prot,
                flags,
                object,
                obj_off: off & !(PAGE_SIZE as u64 - 1),
                cow,
                shadow: None,
            },
        );
        Ok(VirtAddr::new(start))
    }

    /// Drops the reservation starting at `addr`.
    ///
    /// Every covered page is unmapped from `vas` (with a TLB shootdown for
    /// CPUs sharing it) and the entry's object reference is released —
    /// destroying the object, and returning its pages, when this was the
    /// last reference.
    ///
    /// # Errors
    ///
    /// [`Errno::Noent`] if no reservation starts at `addr`;
    /// [`Errno::Inval`] if `len` does not cover the whole reservation.
    pub fn unmap_at(&mut self, vas: &Vas, addr: VirtAddr, len: usize) -> Result<(), Errno> {
        let base = addr.align_down(PAGE_SIZE as u64).as_u64();
        let entry = self.entries.get(&base).ok_or(Errno::Noent)?;
        if len.div_ceil(PAGE_SIZE) * PAGE_SIZE != entry.len {
            return Err(Errno::Inval);
        }

        let pages = entry.len / PAGE_SIZE;
        for i in 0..pages {
            let va = entry.start + (i * PAGE_SIZE) as u64;
            if vas.unmap(va).is_ok() {
                shootdown(va);
            }
        }
        self.entries.remove(&base);
        Ok(())
    }

    /// Clears every reservation, unmapping pages from `vas`. Used by
    /// `execve` and final process teardown.
    pub fn clear(&mut self, vas: &Vas) {
        let starts: alloc::vec::Vec<u64> = self.entries.keys().copied().collect();
        for base in starts {
            let len = self.entries[&base].len;
            let _ = self.unmap_at(vas, VirtAddr::new(base), len);
        }
    }

    /// Duplicates this ledger for a forked child.
    ///
    /// Shared entries share the object outright. Private entries switch to
    /// copy-on-write on both sides: the parent's resident writable pages
    /// are downgraded to read-only in `parent_vas`, and the child receives
    /// eager copies of any pages the parent had already shadowed.
    ///
    /// # Errors
    ///
    /// [`Errno::Nomem`] if shadow page copies cannot be allocated.
    pub fn clone_for_fork(&mut self, parent_vas: &Vas, pmm: &Arc<Pmm>) -> Result<Self, Errno> {
        let mut child = Self::new();
        for entry in self.entries.values_mut() {
            let private = entry.flags.contains(MapFlags::PRIVATE);

            if private && !entry.cow {
                // Arm COW on the parent: future writes must fault.
                entry.cow = true;
                let ro = entry.prot & !Prot::WRITE;
                let pages = entry.len / PAGE_SIZE;
                for i in 0..pages {
                    let va = entry.start + (i * PAGE_SIZE) as u64;
                    if let Some(pa) = parent_vas.translate(va) {
                        parent_vas.map(va, pa.align_down(PAGE_SIZE as u64), ro)?;
                        shootdown(va);
                    }
                }
            }

            // The child starts from the parent's current view: base object
            // shared, shadowed pages copied.
            let child_shadow = match &entry.shadow {
                None => None,
                Some(shadow) => {
                    let fresh = VmObject::new_anon(Arc::clone(pmm), entry.prot);
                    let mut delta = 0u64;
                    while (delta as usize) < entry.len {
                        if let Some(src) = shadow.pagelookup(delta) {
                            let dst = fresh.pagealloc(delta, PALLOC_ZERO)?;
                            // SAFETY: Both frames are owned by their objects
                            // and direct-mapped.
                            unsafe {
                                pmm.frame_slice(dst.phys())
                                    .copy_from_slice(pmm.frame_slice(src.phys()));
                            }
                        }
                        delta += PAGE_SIZE as u64;
                    }
                    Some(fresh)
                }
            };

            child.entries.insert(
                entry.start.as_u64(),
                MmapEntry {
                    start: entry.start,
                    len: entry.len,
                    prot: entry.prot,
                    flags: entry.flags,
                    object: Arc::clone(&entry.object),
                    obj_off: entry.obj_off,
                    cow: entry.cow || private,
                    shadow: child_shadow,
                },
            );
        }
        Ok(child)
    }
}
