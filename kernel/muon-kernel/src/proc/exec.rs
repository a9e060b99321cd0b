//! `execve`: replace a thread's user image with an ELF64 executable.
//!
//! The loader validates the image, maps each `PT_LOAD` segment into a
//! fresh address space with the segment's own protection, records the
//! load ranges, builds a new user stack carrying `argv`, `envp`, and the
//! auxiliary vector, resets signal state, and points the thread's trap
//! frame at the entry point. The previous address space (and stack) die
//! with the swap.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use muon_core::errno::Errno;
use muon_elf::{ElfFile, PF_W, PF_X};
use muon_fs::namei;
use muon_mm::pmap::Prot;
use muon_mm::Vas;

use super::Proc;
use crate::boot::kernel;
use crate::config::PROC_STACK_PAGES;
use crate::signal::SignalState;

/// Top of the user stack; grows down.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Auxv keys (SysV).
pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_EXECFN: u64 = 31;

/// One mapped load range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRange {
    /// First mapped address.
    pub start: u64,
    /// One past the last mapped address.
    pub end: u64,
    /// Mapping protection.
    pub prot: Prot,
    /// Backing frames (owned by this image).
    pub phys: PhysAddr,
    /// Frame count.
    pub pages: usize,
}

/// The record of a loaded image. Owns the physical frames of its
/// segments and stack; they return to the allocator when the image is
/// replaced or the process exits.
#[derive(Debug, Clone)]
pub struct ExecProg {
    /// Path the image came from.
    pub pathname: String,
    /// Entry point.
    pub entry: u64,
    /// Mapped segments.
    pub loadmap: Vec<LoadRange>,
    /// Stack pointer handed to userland.
    pub stack_ptr: u64,
    /// Backing frames of the user stack.
    pub stack_phys: PhysAddr,
}

fn seg_prot(flags: u32) -> Prot {
    let mut prot = Prot::READ | Prot::USER;
    if flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

/// Reads the whole file at `path` through the VFS.
fn read_image(path: &str) -> Result<Vec<u8>, Errno> {
    let k = kernel();
    let vp = namei(&k.ns, path)?;
    let size = vp.vop_getattr()?.size as usize;
    let mut data = alloc::vec![0u8; size];
    let n = vp.vop_read(&mut muon_fs::SioTxn::read(&mut data, 0))?;
    data.truncate(n);
    Ok(data)
}

/// Maps one segment: allocates frames, copies file bytes, zero-fills the
/// tail, maps with the segment's protection. Returns the mapped range.
fn map_segment(
    vas: &Vas,
    vaddr: u64,
    file_data: &[u8],
    memsz: u64,
    prot: Prot,
) -> Result<LoadRange, Errno> {
    let k = kernel();
    let page = PAGE_SIZE as u64;
    let start = vaddr & !(page - 1);
    let head = (vaddr - start) as usize;
    let end = (vaddr + memsz + page - 1) & !(page - 1);
    let pages = ((end - start) / page) as usize;

    let base = k.pmm.alloc_pageframe(pages);
    if base.is_zero() {
        return Err(Errno::Nomem);
    }

    // Copy the file-backed bytes at the in-page offset of `vaddr`.
    // SAFETY: The frames were just allocated for this segment.
    let dst = unsafe {
        core::slice::from_raw_parts_mut(k.pmm.phys_to_virt(base), pages * PAGE_SIZE)
    };
    // filesz can exceed memsz only in a hostile image; clamp.
    let copy = file_data.len().min(dst.len().saturating_sub(head));
    dst[head..head + copy].copy_from_slice(&file_data[..copy]);

    if let Err(e) = vas.map_range(VirtAddr::new(start), base, prot, pages * PAGE_SIZE) {
        k.pmm.free_frame(base, pages);
        return Err(e);
    }
    Ok(LoadRange {
        start,
        end,
        prot,
        phys: base,
        pages,
    })
}

/// Builds the user stack: strings and pointer vectors for `argv`/`envp`
/// plus the auxv, laid out SysV-style with `argc` at the final stack
/// pointer. Returns that stack pointer and the stack's backing frames.
fn build_stack(
    vas: &Vas,
    elf: &ElfFile<'_>,
    pathname: &str,
    argv: &[&str],
    envp: &[&str],
) -> Result<(u64, PhysAddr), Errno> {
    let k = kernel();
    let stack_bytes = PROC_STACK_PAGES * PAGE_SIZE;
    let stack_low = USER_STACK_TOP - stack_bytes as u64;

    let base = k.pmm.alloc_pageframe(PROC_STACK_PAGES);
    if base.is_zero() {
        return Err(Errno::Nomem);
    }
    if let Err(e) = vas.map_range(
        VirtAddr::new(stack_low),
        base,
        Prot::READ | Prot::WRITE | Prot::USER,
        stack_bytes,
    ) {
        k.pmm.free_frame(base, PROC_STACK_PAGES);
        return Err(e);
    }

    // SAFETY: The stack frames were just allocated for this thread.
    let mem = unsafe { core::slice::from_raw_parts_mut(k.pmm.phys_to_virt(base), stack_bytes) };

    // Strings grow down from the very top.
    let mut str_top = stack_bytes;
    let mut push_str = |mem: &mut [u8], s: &str| -> u64 {
        let bytes = s.as_bytes();
        str_top -= bytes.len() + 1;
        mem[str_top..str_top + bytes.len()].copy_from_slice(bytes);
        mem[str_top + bytes.len()] = 0;
        stack_low + str_top as u64
    };

    let execfn_ptr = push_str(mem, pathname);
    let argv_ptrs: Vec<u64> = argv.iter().map(|s| push_str(mem, s)).collect();
    let envp_ptrs: Vec<u64> = envp.iter().map(|s| push_str(mem, s)).collect();

    let (phent, phnum) = elf.phdr_geometry();
    let auxv: [(u64, u64); 6] = [
        (AT_ENTRY, elf.entry_point()),
        (AT_PHDR, elf.phdr_offset()),
        (AT_PHENT, u64::from(phent)),
        (AT_PHNUM, u64::from(phnum)),
        (AT_PAGESZ, PAGE_SIZE as u64),
        (AT_EXECFN, execfn_ptr),
    ];

    // Word vectors below the strings: argc, argv..., 0, envp..., 0,
    // auxv pairs, AT_NULL pair.
    let words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1 + (auxv.len() + 1) * 2;
    let mut sp = (str_top - words * 8) & !0xF;
    let final_sp = stack_low + sp as u64;

    let mut push_word = |mem: &mut [u8], w: u64| {
        mem[sp..sp + 8].copy_from_slice(&w.to_le_bytes());
        sp += 8;
    };

    push_word(mem, argv_ptrs.len() as u64);
    for p in &argv_ptrs {
        push_word(mem, *p);
    }
    push_word(mem, 0);
    for p in &envp_ptrs {
        push_word(mem, *p);
    }
    push_word(mem, 0);
    for (key, val) in auxv {
        push_word(mem, key);
        push_word(mem, val);
    }
    push_word(mem, AT_NULL);
    push_word(mem, 0);

    Ok((final_sp, base))
}

/// Replaces `td`'s user image with the executable at `pathname`.
///
/// # Errors
///
/// Image validation failures map to [`Errno::Noent`]/[`Errno::Nosup`]
/// (bad path vs. bad format); allocation failures to [`Errno::Nomem`].
/// On error the thread keeps its previous image.
pub fn execve(td: &Arc<Proc>, pathname: &str, argv: &[&str], envp: &[&str]) -> Result<(), Errno> {
    let k = kernel();
    let image = read_image(pathname)?;
    let elf = ElfFile::parse(&image).map_err(|e| {
        log::warn!(target: "exec", "{pathname}: {e}");
        Errno::Nosup
    })?;

    let vas = Arc::new(Vas::new(Arc::clone(&k.pmm), true)?);
    let mut loadmap: Vec<LoadRange> = Vec::new();

    // Map segments, unwinding the successful prefix on failure.
    let (stack_ptr, stack_phys) = {
        let res: Result<(u64, PhysAddr), Errno> = (|| {
            for seg in elf.load_segments() {
                loadmap.push(map_segment(
                    &vas,
                    seg.vaddr,
                    seg.data,
                    seg.memsz,
                    seg_prot(seg.flags),
                )?);
            }
            build_stack(&vas, &elf, pathname, argv, envp)
        })();
        match res {
            Ok(v) => v,
            Err(e) => {
                for range in &loadmap {
                    k.pmm.free_frame(range.phys, range.pages);
                }
                return Err(e);
            }
        }
    };

    // Point of no return: swap in the new image. The previous image's
    // frames (segments + user stack) and address space are released.
    {
        let old_vas = td.vas.lock().take();
        if let Some(old) = old_vas {
            td.mlgdr.lock().clear(&old);
        }
    }
    release_loadmap(td);
    *td.vas.lock() = Some(vas);
    *td.sig.lock() = SignalState::new();
    *td.exec.lock() = Some(ExecProg {
        pathname: pathname.to_string(),
        entry: elf.entry_point(),
        loadmap,
        stack_ptr,
        stack_phys,
    });
    td.set_flags(super::PROC_EXEC);
    td.tf.lock().set_entry(elf.entry_point(), stack_ptr);
    log::info!(target: "exec", "pid {}: {pathname} entry {:#x}", td.pid, elf.entry_point());
    Ok(())
}

/// Releases the physical frames owned by `td`'s current exec image
/// (segments and user stack). Called when the image is replaced and at
/// final process teardown.
pub fn release_loadmap(td: &Proc) {
    let k = kernel();
    let prog = td.exec.lock().take();
    if let Some(prog) = prog {
        for range in &prog.loadmap {
            k.pmm.free_frame(range.phys, range.pages);
        }
        if !prog.stack_phys.is_zero() {
            k.pmm.free_frame(prog.stack_phys, PROC_STACK_PAGES);
        }
    }
}
