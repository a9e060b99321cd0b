//! Machine-dependent page-table driver.
//!
//! A [`Vas`] is one page-table tree: four levels of 512-entry tables in the
//! x86-64 long-mode format, manipulated exclusively through the owning
//! [`Pmm`]'s direct-map window. Table frames come from (and return to) that
//! same allocator; leaf frames belong to whoever mapped them and are never
//! touched by teardown.
//!
//! Only `activate()` and the TLB flushes are actual hardware operations, so
//! everything else runs — and is tested — on the host. Unmap flushes the
//! local TLB only; invalidation on other CPUs sharing the space is the VM
//! layer's job (it raises a shootdown through the hook installed with
//! [`set_shootdown_fn`]).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use muon_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::pmm::Pmm;

bitflags! {
    /// Mapping protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Readable.
        const READ  = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC  = 1 << 2;
        /// Accessible from user mode.
        const USER  = 1 << 3;
    }
}

/// Cacheability of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Strong uncachable (MMIO registers).
    Uncachable,
    /// Write-through (framebuffers).
    WriteThrough,
}

/// x86-64 page-table entry bits.
mod pte {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const PWT: u64 = 1 << 3;
    pub const PCD: u64 = 1 << 4;
    pub const DIRTY: u64 = 1 << 6;
    pub const NX: u64 = 1 << 63;
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

/// Number of entries per table at every level.
const TABLE_ENTRIES: usize = 512;

/// Levels walked from the root to the leaf table (root index 3).
const ROOT_LEVEL: usize = 3;

/// Encodes protection bits into a leaf entry.
fn prot_to_pte(prot: Prot) -> u64 {
    let mut bits = pte::PRESENT;
    if prot.contains(Prot::WRITE) {
        bits |= pte::WRITABLE;
    }
    if prot.contains(Prot::USER) {
        bits |= pte::USER;
    }
    if !prot.contains(Prot::EXEC) {
        bits |= pte::NX;
    }
    bits
}

/// Cross-CPU TLB shootdown hook, installed by the interrupt layer once IPIs
/// work. Until then unmaps only invalidate locally, which is correct for a
/// single CPU.
static SHOOTDOWN_FN: AtomicUsize = AtomicUsize::new(0);

/// Installs the shootdown routine invoked after each page unmap.
pub fn set_shootdown_fn(f: fn(VirtAddr)) {
    SHOOTDOWN_FN.store(f as usize, Ordering::Release);
}

/// Raises a cross-CPU shootdown for `va`, if a routine is installed.
pub fn shootdown(va: VirtAddr) {
    let raw = SHOOTDOWN_FN.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Stored from a `fn(VirtAddr)` in `set_shootdown_fn`.
        let f: fn(VirtAddr) = unsafe { core::mem::transmute::<usize, fn(VirtAddr)>(raw) };
        f(va);
    }
}

/// Invalidates the local TLB entry for `va`.
#[inline]
fn flush_local(va: VirtAddr) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: invlpg has no side effects beyond TLB invalidation.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    let _ = va;
}

/// A virtual address space: one page-table root plus the allocator that
/// backs its table frames.
pub struct Vas {
    root: PhysAddr,
    user: bool,
    pmm: Arc<Pmm>,
    /// Serializes structural changes to the tree.
    lock: SpinLock<()>,
}

impl Vas {
    /// Allocates a fresh address space.
    ///
    /// `user` spaces get user-accessible intermediate tables; the kernel
    /// space does not.
    ///
    /// # Errors
    ///
    /// [`Errno::Nomem`] when no frame is available for the root table.
    pub fn new(pmm: Arc<Pmm>, user: bool) -> Result<Self, Errno> {
        let root = pmm.alloc_pageframe(1);
        if root.is_zero() {
            return Err(Errno::Nomem);
        }
        Ok(Self {
            root,
            user,
            pmm,
            lock: SpinLock::new(()),
        })
    }

    /// Physical address of the root table (goes into CR3 / TTBR0).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// The allocator backing this space's table frames.
    pub fn pmm(&self) -> &Arc<Pmm> {
        &self.pmm
    }

    /// Loads this address space on the current CPU.
    pub fn activate(&self) {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        // SAFETY: `root` is a valid top-level table built by this driver.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.root.as_u64(), options(nostack));
        }
    }

    /// Installs a single-page mapping `va -> pa`.
    ///
    /// Replaces any previous mapping of `va` (the caller flushes remote
    /// TLBs if that matters).
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for unaligned addresses, [`Errno::Nomem`] if an
    /// intermediate table cannot be allocated.
    pub fn map(&self, va: VirtAddr, pa: PhysAddr, prot: Prot) -> Result<(), Errno> {
        if !va.is_aligned(PAGE_SIZE as u64) || !pa.is_aligned(PAGE_SIZE as u64) {
            return Err(Errno::Inval);
        }
        let _g = self.lock.lock();
        let leaf_table = self.walk_alloc(va)?;
        let entry = prot_to_pte(prot) | (pa.as_u64() & pte::ADDR_MASK);
        // SAFETY: walk_alloc returned a table frame owned by this tree.
        unsafe { self.table_mut(leaf_table)[va.pt_index(0)] = entry };
        // The slot may have held a previous mapping (COW remap).
        flush_local(va);
        Ok(())
    }

    /// Removes the mapping of `va` and invalidates the local TLB.
    ///
    /// # Errors
    ///
    /// [`Errno::Noent`] if `va` was not mapped.
    pub fn unmap(&self, va: VirtAddr) -> Result<(), Errno> {
        let _g = self.lock.lock();
        let leaf_table = self.walk(va).ok_or(Errno::Noent)?;
        // SAFETY: walk returned a table frame owned by this tree.
        let table = unsafe { self.table_mut(leaf_table) };
        let slot = &mut table[va.pt_index(0)];
        if *slot & pte::PRESENT == 0 {
            return Err(Errno::Noent);
        }
        *slot = 0;
        flush_local(va);
        Ok(())
    }

    /// Resolves `va` to its backing physical address, if mapped.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let _g = self.lock.lock();
        let entry = self.entry(va)?;
        Some(PhysAddr::new((entry & pte::ADDR_MASK) | va.page_offset()))
    }

    /// Current protection of the mapping at `va`, if mapped.
    pub fn protection(&self, va: VirtAddr) -> Option<Prot> {
        let _g = self.lock.lock();
        let entry = self.entry(va)?;
        let mut prot = Prot::READ;
        if entry & pte::WRITABLE != 0 {
            prot |= Prot::WRITE;
        }
        if entry & pte::USER != 0 {
            prot |= Prot::USER;
        }
        if entry & pte::NX == 0 {
            prot |= Prot::EXEC;
        }
        Some(prot)
    }

    /// Selects the cacheability of an existing mapping.
    ///
    /// # Errors
    ///
    /// [`Errno::Noent`] if `va` is not mapped.
    pub fn set_cache(&self, va: VirtAddr, cache: CacheType) -> Result<(), Errno> {
        self.update_entry(va, |entry| {
            match cache {
                CacheType::Uncachable => entry | pte::PCD | pte::PWT,
                CacheType::WriteThrough => (entry & !pte::PCD) | pte::PWT,
            }
        })
    }

    /// Returns `true` if the page at `va` has not been written through this
    /// mapping since the last [`mark_clean`](Self::mark_clean).
    ///
    /// # Errors
    ///
    /// [`Errno::Noent`] if `va` is not mapped.
    pub fn is_clean(&self, va: VirtAddr) -> Result<bool, Errno> {
        let _g = self.lock.lock();
        let entry = self.entry(va).ok_or(Errno::Noent)?;
        Ok(entry & pte::DIRTY == 0)
    }

    /// Clears the hardware dirty bit for `va`.
    ///
    /// # Errors
    ///
    /// [`Errno::Noent`] if `va` is not mapped.
    pub fn mark_clean(&self, va: VirtAddr) -> Result<(), Errno> {
        self.update_entry(va, |entry| entry & !pte::DIRTY)
    }

    /// Maps `bytes` worth of pages `va -> pa`, unwinding the already-mapped
    /// prefix if any page fails.
    pub fn map_range(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Prot,
        bytes: usize,
    ) -> Result<(), Errno> {
        let pages = bytes.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let off = (i * PAGE_SIZE) as u64;
            if let Err(e) = self.map(va + off, pa + off, prot) {
                for j in 0..i {
                    let _ = self.unmap(va + (j * PAGE_SIZE) as u64);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmaps `bytes` worth of pages starting at `va`; missing pages are
    /// skipped.
    pub fn unmap_range(&self, va: VirtAddr, bytes: usize) {
        let pages = bytes.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let _ = self.unmap(va + (i * PAGE_SIZE) as u64);
        }
    }

    // ── tree internals ──────────────────────────────────────────────

    /// Leaf PTE for `va`, if present. Caller holds the lock.
    fn entry(&self, va: VirtAddr) -> Option<u64> {
        let leaf_table = self.walk(va)?;
        // SAFETY: walk returned a table frame owned by this tree.
        let entry = unsafe { self.table_mut(leaf_table)[va.pt_index(0)] };
        (entry & pte::PRESENT != 0).then_some(entry)
    }

    fn update_entry(&self, va: VirtAddr, f: impl FnOnce(u64) -> u64) -> Result<(), Errno> {
        let _g = self.lock.lock();
        let leaf_table = self.walk(va).ok_or(Errno::Noent)?;
        // SAFETY: walk returned a table frame owned by this tree.
        let table = unsafe { self.table_mut(leaf_table) };
        let slot = &mut table[va.pt_index(0)];
        if *slot & pte::PRESENT == 0 {
            return Err(Errno::Noent);
        }
        *slot = f(*slot);
        flush_local(va);
        Ok(())
    }

    /// Walks to the leaf table, allocating missing levels.
    fn walk_alloc(&self, va: VirtAddr) -> Result<PhysAddr, Errno> {
        let mut table_pa = self.root;
        for lvl in (1..=ROOT_LEVEL).rev() {
            let idx = va.pt_index(lvl);
            // SAFETY: `table_pa` is a table frame owned by this tree.
            let table = unsafe { self.table_mut(table_pa) };
            let entry = table[idx];
            table_pa = if entry & pte::PRESENT != 0 {
                PhysAddr::new(entry & pte::ADDR_MASK)
            } else {
                let fresh = self.pmm.alloc_pageframe(1);
                if fresh.is_zero() {
                    return Err(Errno::Nomem);
                }
                let mut bits = pte::PRESENT | pte::WRITABLE;
                if self.user {
                    bits |= pte::USER;
                }
                table[idx] = bits | fresh.as_u64();
                fresh
            };
        }
        Ok(table_pa)
    }

    /// Walks to the leaf table without allocating.
    fn walk(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut table_pa = self.root;
        for lvl in (1..=ROOT_LEVEL).rev() {
            // SAFETY: `table_pa` is a table frame owned by this tree.
            let entry = unsafe { self.table_mut(table_pa)[va.pt_index(lvl)] };
            if entry & pte::PRESENT == 0 {
                return None;
            }
            table_pa = PhysAddr::new(entry & pte::ADDR_MASK);
        }
        Some(table_pa)
    }

    /// Direct-mapped view of one table frame.
    ///
    /// # Safety
    ///
    /// `pa` must be a table frame owned by this tree and the caller must
    /// hold the structural lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, pa: PhysAddr) -> &mut [u64; TABLE_ENTRIES] {
        // SAFETY: Forwarded to the caller.
        unsafe { &mut *(self.pmm.phys_to_virt(pa) as *mut [u64; TABLE_ENTRIES]) }
    }

}

impl Drop for Vas {
    fn drop(&mut self) {
        let _g = self.lock.lock();
        // Free levels 3..1; level-0 tables are freed by the recursion's
        // lvl==1 pass, leaf frames are not ours.
        self.free_tables_from_root();
    }
}

impl Vas {
    fn free_tables_from_root(&self) {
        // SAFETY: Drop holds the only reference.
        let root = unsafe { self.table_mut(self.root) };
        for idx in 0..TABLE_ENTRIES {
            let entry = root[idx];
            if entry & pte::PRESENT != 0 {
                self.free_intermediate(PhysAddr::new(entry & pte::ADDR_MASK), ROOT_LEVEL - 1);
            }
        }
        self.pmm.free_frame(self.root, 1);
    }

    fn free_intermediate(&self, table_pa: PhysAddr, lvl: usize) {
        if lvl > 0 {
            // SAFETY: Drop holds the only reference.
            let table = unsafe { self.table_mut(table_pa) };
            for idx in 0..TABLE_ENTRIES {
                let entry = table[idx];
                if entry & pte::PRESENT != 0 {
                    self.free_intermediate(PhysAddr::new(entry & pte::ADDR_MASK), lvl - 1);
                }
            }
        }
        self.pmm.free_frame(table_pa, 1);
    }
}
