//! Virtual System Resource (VSR) namespace.
//!
//! Each process owns a small array of domains indexed by a type tag (only
//! `VSR_FILE` is defined today). A domain is a fixed-size capsule
//! hashtable, FNV-1 over the capsule name with collision chains. A
//! capsule pairs a globally shared payload with an optional per-process
//! shadow; the access-mode bits decide which one a read or write touches,
//! and the shadow materializes on the first non-global write — the local
//! view is copy-on-write over the global one.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use muon_core::errno::Errno;
use muon_core::sync::{Mutex, SpinLock};

use crate::config::VSR_MAX_CAPSULE;

/// Domain tag: resources represented by files.
pub const VSR_FILE: usize = 0;

/// Number of defined domains.
pub const VSR_MAX_DOMAIN: usize = 1;

bitflags! {
    /// Capsule access semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VsrMode: u32 {
        /// Writes land on the global payload.
        const GLOB_WRITE = 1 << 0;
        /// Reads come from the global payload.
        const GLOB_READ  = 1 << 1;
        /// Global access is gated by credentials.
        const GLOB_CRED  = 1 << 2;
    }
}

/// The payload bytes of a capsule side.
type Payload = Vec<u8>;

/// Globally shared capsule state, common to every process that looks the
/// capsule up by name.
#[derive(Debug)]
pub struct VsrGlobal {
    /// Capsule name.
    pub name: String,
    /// Access semantics.
    pub mode: VsrMode,
    /// The shared payload.
    data: Mutex<Payload>,
    /// Optional cleanup hook run when a process drops its capsule.
    reclaim: Option<fn(&str)>,
}

/// A process's view of one capsule: the shared state plus the local
/// shadow (created by the first non-global write).
#[derive(Debug)]
pub struct VsrCapsule {
    /// Shared side.
    pub global: Arc<VsrGlobal>,
    /// Local shadow payload, if this process has diverged.
    shadow: Mutex<Option<Payload>>,
}

impl VsrCapsule {
    fn new(global: Arc<VsrGlobal>) -> Self {
        Self {
            global,
            shadow: Mutex::new("vsr-shadow", None),
        }
    }

    /// Reads the capsule payload per the access mode: global when
    /// `GLOB_READ`, otherwise the shadow (falling back to the global
    /// payload while no shadow exists).
    pub fn read(&self) -> Payload {
        if self.global.mode.contains(VsrMode::GLOB_READ) {
            return self.global.data.lock().clone();
        }
        let shadow = self.shadow.lock();
        match &*shadow {
            Some(local) => local.clone(),
            None => self.global.data.lock().clone(),
        }
    }

    /// Writes the capsule payload per the access mode: global when
    /// `GLOB_WRITE`, otherwise into the process-local shadow, creating it
    /// from the bytes written.
    pub fn write(&self, bytes: &[u8]) {
        if self.global.mode.contains(VsrMode::GLOB_WRITE) {
            *self.global.data.lock() = bytes.to_vec();
        } else {
            *self.shadow.lock() = Some(bytes.to_vec());
        }
    }

    /// Whether this process has a diverged local view.
    pub fn has_shadow(&self) -> bool {
        self.shadow.lock().is_some()
    }
}

/// One domain: the capsule hashtable.
pub struct VsrDomain {
    /// Domain type tag.
    pub tag: usize,
    table: [Vec<Arc<VsrCapsule>>; VSR_MAX_CAPSULE],
}

impl VsrDomain {
    fn new(tag: usize) -> Self {
        Self {
            tag,
            table: [const { Vec::new() }; VSR_MAX_CAPSULE],
        }
    }
}

/// The per-process domain array.
pub struct VsrDomains {
    domains: [Option<VsrDomain>; VSR_MAX_DOMAIN],
}

/// The kernel-wide name → global-capsule registry, so capsules with one
/// name share one global payload across processes.
static GLOBAL_REGISTRY: SpinLock<Vec<Arc<VsrGlobal>>> = SpinLock::new(Vec::new());

fn global_for(name: &str, mode: VsrMode, reclaim: Option<fn(&str)>) -> Arc<VsrGlobal> {
    let mut reg = GLOBAL_REGISTRY.lock();
    if let Some(g) = reg.iter().find(|g| g.name == name) {
        return Arc::clone(g);
    }
    let g = Arc::new(VsrGlobal {
        name: name.to_string(),
        mode,
        data: Mutex::new("vsr-glob", Vec::new()),
        reclaim,
    });
    reg.push(Arc::clone(&g));
    g
}

impl VsrDomains {
    /// Lazily populated domain table (domains appear on first use).
    pub fn new() -> Self {
        Self {
            domains: [const { None }; VSR_MAX_DOMAIN],
        }
    }

    /// Ensures the domain for `tag` exists.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for an unknown tag.
    pub fn init_domain(&mut self, tag: usize) -> Result<&mut VsrDomain, Errno> {
        if tag >= VSR_MAX_DOMAIN {
            return Err(Errno::Inval);
        }
        Ok(self.domains[tag].get_or_insert_with(|| VsrDomain::new(tag)))
    }

    /// Creates a capsule named `name` in `tag`'s domain with the given
    /// access mode. Two processes creating the same name share the global
    /// payload.
    ///
    /// # Errors
    ///
    /// [`Errno::Exist`] if this process already holds the capsule;
    /// [`Errno::Inval`] for a bad domain.
    pub fn new_capsule(
        &mut self,
        tag: usize,
        name: &str,
        mode: VsrMode,
        reclaim: Option<fn(&str)>,
    ) -> Result<Arc<VsrCapsule>, Errno> {
        let domain = self.init_domain(tag)?;
        let bucket = fnv_bucket(name);
        if domain.table[bucket].iter().any(|c| c.global.name == name) {
            return Err(Errno::Exist);
        }
        let capsule = Arc::new(VsrCapsule::new(global_for(name, mode, reclaim)));
        domain.table[bucket].push(Arc::clone(&capsule));
        Ok(capsule)
    }

    /// Finds this process's capsule `name` in `tag`'s domain.
    pub fn lookup_capsule(&self, tag: usize, name: &str) -> Option<Arc<VsrCapsule>> {
        let domain = self.domains.get(tag)?.as_ref()?;
        domain.table[fnv_bucket(name)]
            .iter()
            .find(|c| c.global.name == name)
            .cloned()
    }

    /// Tears down every domain, running capsule reclaim hooks.
    pub fn destroy(&mut self) {
        for slot in &mut self.domains {
            if let Some(domain) = slot.take() {
                for chain in &domain.table {
                    for capsule in chain {
                        if let Some(reclaim) = capsule.global.reclaim {
                            reclaim(&capsule.global.name);
                        }
                    }
                }
            }
        }
    }

    /// Duplicates the table for a forked child: capsules are shared by
    /// global identity, shadows are copied as they stand.
    pub fn clone_for_fork(&self) -> Self {
        let mut child = Self::new();
        for (tag, slot) in self.domains.iter().enumerate() {
            if let Some(domain) = slot {
                let dst = child.domains[tag].get_or_insert_with(|| VsrDomain::new(tag));
                for (i, chain) in domain.table.iter().enumerate() {
                    for capsule in chain {
                        let dup = VsrCapsule::new(Arc::clone(&capsule.global));
                        *dup.shadow.lock() = capsule.shadow.lock().clone();
                        dst.table[i].push(Arc::new(dup));
                    }
                }
            }
        }
        child
    }
}

impl Default for VsrDomains {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv_bucket(name: &str) -> usize {
    muon_core::hash::fnv1(name) as usize % VSR_MAX_CAPSULE
}
