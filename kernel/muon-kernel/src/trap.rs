//! Fault entry points shared by the architecture trap stubs.

use alloc::sync::Arc;

use muon_core::addr::VirtAddr;
use muon_mm::fault::vm_fault;
use muon_mm::pmap::Prot;

use crate::proc::{Proc, proc_fatal};
use crate::signal::SIGSEGV;
use crate::syscall::dispatch_signals;

/// Services a page fault at `va` for `access` on behalf of `td`.
///
/// Returns `true` when the fault was resolved and the thread may resume.
/// Otherwise the thread has been sent SIGSEGV (with a coredump) and the
/// signal was delivered; the caller must not return to the faulting
/// context.
pub fn trap_page_fault(td: &Arc<Proc>, va: VirtAddr, access: Prot) -> bool {
    let vas = td.vas.lock().clone();
    let Some(vas) = vas else {
        // A kernel thread faulting on user memory is hopeless.
        proc_fatal(td, SIGSEGV, va.as_u64());
        dispatch_signals(td);
        return false;
    };

    let res = {
        let mut ledger = td.mlgdr.lock();
        vm_fault(&vas, &mut ledger, va, access)
    };
    match res {
        Ok(()) => true,
        Err(e) => {
            log::debug!(
                target: "trap",
                "pid {}: fault at {va:#x} not resolvable ({e})",
                td.pid
            );
            proc_fatal(td, SIGSEGV, va.as_u64());
            dispatch_signals(td);
            false
        }
    }
}

/// A vector with no handler. This is an invariant break.
pub fn trap_unknown(vector: u8) -> ! {
    panic!("unknown trap vector {vector:#04x}");
}
