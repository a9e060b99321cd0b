//! Copying between user and kernel memory.
//!
//! User pointers are only ever dereferenced here. For a thread with a
//! user address space, the buffer is resolved page by page through the
//! thread's page tables and copied via the direct map — an unmapped page
//! is `Fault`, never a wild read. Kernel threads have no user space;
//! their "user" pointers are kernel addresses and are taken at face
//! value, which is also what lets the hosted harness drive syscalls with
//! ordinary references.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::{PAGE_SIZE, VirtAddr};
use muon_core::errno::Errno;
use muon_mm::Vas;

use crate::boot::kernel;
use crate::proc::Proc;

fn user_vas(td: &Proc) -> Option<Arc<Vas>> {
    td.vas.lock().clone()
}

/// Copies `dst.len()` bytes in from user address `uva`.
///
/// # Errors
///
/// [`Errno::Fault`] for an unmapped user page.
pub fn copyin(td: &Proc, uva: u64, dst: &mut [u8]) -> Result<(), Errno> {
    match user_vas(td) {
        Some(vas) => {
            let mut done = 0usize;
            while done < dst.len() {
                let va = VirtAddr::new_truncate(uva + done as u64);
                let pa = vas.translate(va).ok_or(Errno::Fault)?;
                let in_page = PAGE_SIZE - va.page_offset() as usize;
                let n = in_page.min(dst.len() - done);
                // SAFETY: translate proved the page is mapped; the direct
                // map covers all of RAM.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        kernel().pmm.phys_to_virt(pa),
                        dst[done..].as_mut_ptr(),
                        n,
                    );
                }
                done += n;
            }
            Ok(())
        }
        None => {
            if uva == 0 {
                return Err(Errno::Fault);
            }
            // SAFETY: Kernel threads pass kernel addresses.
            unsafe {
                core::ptr::copy_nonoverlapping(uva as *const u8, dst.as_mut_ptr(), dst.len());
            }
            Ok(())
        }
    }
}

/// Copies `src` out to user address `uva`.
///
/// # Errors
///
/// [`Errno::Fault`] for an unmapped user page.
pub fn copyout(td: &Proc, uva: u64, src: &[u8]) -> Result<(), Errno> {
    match user_vas(td) {
        Some(vas) => {
            let mut done = 0usize;
            while done < src.len() {
                let va = VirtAddr::new_truncate(uva + done as u64);
                let pa = vas.translate(va).ok_or(Errno::Fault)?;
                let in_page = PAGE_SIZE - va.page_offset() as usize;
                let n = in_page.min(src.len() - done);
                // SAFETY: translate proved the page is mapped.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src[done..].as_ptr(),
                        kernel().pmm.phys_to_virt(pa),
                        n,
                    );
                }
                done += n;
            }
            Ok(())
        }
        None => {
            if uva == 0 {
                return Err(Errno::Fault);
            }
            // SAFETY: Kernel threads pass kernel addresses.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), uva as *mut u8, src.len());
            }
            Ok(())
        }
    }
}

/// Copies a NUL-terminated string in from user address `uva`.
///
/// # Errors
///
/// [`Errno::Nametoolong`] past `max` bytes without a NUL,
/// [`Errno::Inval`] for non-UTF-8, [`Errno::Fault`] as [`copyin`].
pub fn copyinstr(td: &Proc, uva: u64, max: usize) -> Result<String, Errno> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    for i in 0..max {
        copyin(td, uva + i as u64, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| Errno::Inval);
        }
        bytes.push(byte[0]);
    }
    Err(Errno::Nametoolong)
}
