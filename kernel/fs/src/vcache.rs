//! The vnode cache: a FIFO of reclaimed vnodes awaiting reuse.
//!
//! Releasing the last reference to a vnode runs its `reclaim` vop and
//! parks the husk here instead of freeing it; the next allocation recycles
//! the storage. The cache runs in one of two modes — one global queue, or
//! one queue per process — and the mode is a live kernel knob reachable
//! through `sysctl` (`KERN_VCACHE_TYPE`).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

use crate::vnode::{Vnode, VnodeType, Vops};

/// Cache capacity, in vnodes.
pub const VCACHE_SIZE: usize = 64;

/// Where released vnodes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VcacheType {
    /// No caching; released vnodes free immediately.
    None = 0,
    /// One cache per process.
    Proc = 1,
    /// One shared cache.
    Global = 2,
}

impl VcacheType {
    /// Decodes the sysctl integer encoding.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Proc),
            2 => Some(Self::Global),
            _ => None,
        }
    }
}

/// A FIFO of recyclable vnodes.
pub struct Vcache {
    q: VecDeque<Arc<Vnode>>,
    max: usize,
}

impl Vcache {
    /// An empty cache of the default capacity.
    pub const fn new() -> Self {
        Self {
            q: VecDeque::new(),
            max: VCACHE_SIZE,
        }
    }

    /// Current population.
    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Parks a reclaimed vnode; returns `false` (dropping the vnode) when
    /// the cache is full.
    pub fn enter(&mut self, vp: Arc<Vnode>) -> bool {
        if self.q.len() >= self.max {
            return false;
        }
        self.q.push_back(vp);
        true
    }

    /// Pops the oldest recyclable vnode whose storage is exclusively ours.
    pub fn recycle(&mut self) -> Option<Arc<Vnode>> {
        while let Some(vp) = self.q.pop_front() {
            if Arc::strong_count(&vp) == 1 {
                return Some(vp);
            }
            // Someone still holds the Arc; the husk is unusable, let the
            // last holder free it.
        }
        None
    }

    /// Drops every cached vnode.
    pub fn drain(&mut self) {
        self.q.clear();
    }
}

impl Default for Vcache {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared cache used in [`VcacheType::Global`] mode.
static GLOBAL_VCACHE: SpinLock<Vcache> = SpinLock::new(Vcache::new());

/// Current cache mode.
static MODE: AtomicU32 = AtomicU32::new(VcacheType::Proc as u32);

/// The active cache mode.
pub fn vcache_type() -> VcacheType {
    VcacheType::from_u32(MODE.load(Ordering::Acquire)).unwrap_or(VcacheType::None)
}

/// Switches the cache mode at run time.
///
/// Leaving global mode drains the shared cache; per-process caches are
/// dropped with their processes.
///
/// # Errors
///
/// [`Errno::Inval`] for an unknown mode value.
pub fn vcache_migrate(new: u32) -> Result<(), Errno> {
    let new = VcacheType::from_u32(new).ok_or(Errno::Inval)?;
    let old = vcache_type();
    if old == VcacheType::Global && new != VcacheType::Global {
        GLOBAL_VCACHE.lock().drain();
    }
    MODE.store(new as u32, Ordering::Release);
    log::debug!(target: "vfs", "vcache mode {:?} -> {:?}", old, new);
    Ok(())
}

/// Allocates a vnode, recycling cached storage when possible.
///
/// `proc_cache` is the calling process's cache, used in per-process mode;
/// kernel contexts without one pass `None`.
pub fn alloc_vnode(
    vtype: VnodeType,
    vops: Arc<dyn Vops>,
    proc_cache: Option<&SpinLock<Vcache>>,
) -> Arc<Vnode> {
    let recycled = match vcache_type() {
        VcacheType::None => None,
        VcacheType::Global => GLOBAL_VCACHE.lock().recycle(),
        VcacheType::Proc => proc_cache.and_then(|c| c.lock().recycle()),
    };
    match recycled {
        Some(vp) => {
            vp.reinit(vtype, vops);
            vp
        }
        None => Vnode::alloc(vtype, vops),
    }
}

/// Drops one reference to `vp`; at zero, reclaims the vnode and parks it
/// on the mode-appropriate cache (or frees it when no cache applies).
///
/// # Errors
///
/// [`Errno::Io`] for a release of an already-dead vnode (bad refcount);
/// reclaim failures propagate.
pub fn release_vnode(vp: &Arc<Vnode>, proc_cache: Option<&SpinLock<Vcache>>) -> Result<(), Errno> {
    if vp.refcount() == 0 {
        log::error!(target: "vfs", "release of dead vnode");
        return Err(Errno::Io);
    }
    if vp.unref() > 0 {
        return Ok(());
    }

    vp.vop_reclaim()?;
    vp.clear();

    match vcache_type() {
        VcacheType::None => {}
        VcacheType::Global => {
            GLOBAL_VCACHE.lock().enter(Arc::clone(vp));
        }
        VcacheType::Proc => {
            if let Some(cache) = proc_cache {
                cache.lock().enter(Arc::clone(vp));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;
    impl Vops for NullOps {}

    #[test]
    fn fifo_enter_recycle() {
        let mut cache = Vcache::new();
        let a = Vnode::alloc(VnodeType::Non, Arc::new(NullOps));
        let b = Vnode::alloc(VnodeType::Non, Arc::new(NullOps));
        assert!(cache.enter(Arc::clone(&a)));
        assert!(cache.enter(Arc::clone(&b)));
        drop((a, b));

        let first = cache.recycle().expect("cached");
        let second = cache.recycle().expect("cached");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(cache.recycle().is_none());
    }

    #[test]
    fn full_cache_refuses() {
        let mut cache = Vcache::new();
        for _ in 0..VCACHE_SIZE {
            assert!(cache.enter(Vnode::alloc(VnodeType::Non, Arc::new(NullOps))));
        }
        assert!(!cache.enter(Vnode::alloc(VnodeType::Non, Arc::new(NullOps))));
        assert_eq!(cache.len(), VCACHE_SIZE);
    }

    #[test]
    fn shared_storage_is_skipped() {
        let mut cache = Vcache::new();
        let vp = Vnode::alloc(VnodeType::Non, Arc::new(NullOps));
        cache.enter(Arc::clone(&vp));
        // `vp` still held here: the husk must not be recycled.
        assert!(cache.recycle().is_none());
    }

    #[test]
    fn release_reclaims_and_recycles_through_proc_cache() {
        let cache = SpinLock::new(Vcache::new());
        let vp = alloc_vnode(VnodeType::Reg, Arc::new(NullOps), Some(&cache));
        assert_eq!(vp.refcount(), 1);

        release_vnode(&vp, Some(&cache)).unwrap();
        assert_eq!(vp.vtype(), VnodeType::Non);

        // Only in per-process mode does the husk land in our cache.
        if vcache_type() == VcacheType::Proc {
            let held = Arc::strong_count(&vp);
            assert!(held >= 2, "husk parked in cache");
        }
    }

    #[test]
    fn migrate_validates_and_switches() {
        assert_eq!(vcache_migrate(99).unwrap_err(), Errno::Inval);
        // Valid transitions succeed; restore per-process mode after.
        vcache_migrate(VcacheType::Global as u32).unwrap();
        vcache_migrate(VcacheType::Proc as u32).unwrap();
        assert_eq!(vcache_type(), VcacheType::Proc);
    }
}
