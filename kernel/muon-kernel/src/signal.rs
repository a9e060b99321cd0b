//! Signals: sets, queues, delivery.
//!
//! Each thread carries a queue of [`KsigInfo`] nodes plus a
//! `PROC_SIGMAX`-slot table of registered actions. `sendsig` enqueues one
//! node per signal in the given set, atomically under the thread's signal
//! lock; `dispatch_signals` drains the queue at every return-to-user
//! boundary, running registered handlers or the defaults. SIGKILL and
//! SIGSEGV terminate through `exit1` and cannot be handled away.

use alloc::collections::VecDeque;

use muon_core::errno::Errno;

use crate::config::PROC_SIGMAX;

/// Kill (unblockable).
pub const SIGKILL: usize = 9;
/// Segmentation violation.
pub const SIGSEGV: usize = 11;
/// Floating-point exception.
pub const SIGFPE: usize = 8;
/// Termination request.
pub const SIGTERM: usize = 15;

/// A set of signal numbers (bit N = signal N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct SigSet(pub u64);

/// Clears every signal in `set`.
pub fn sigemptyset(set: &mut SigSet) {
    set.0 = 0;
}

/// Adds every valid signal to `set`.
pub fn sigfillset(set: &mut SigSet) {
    set.0 = !0 >> (64 - PROC_SIGMAX);
}

/// Adds `signo` to `set`.
///
/// # Errors
///
/// [`Errno::Inval`] for a signal number out of range.
pub fn sigaddset(set: &mut SigSet, signo: usize) -> Result<(), Errno> {
    if signo == 0 || signo >= PROC_SIGMAX {
        return Err(Errno::Inval);
    }
    set.0 |= 1 << signo;
    Ok(())
}

/// Removes `signo` from `set`.
///
/// # Errors
///
/// [`Errno::Inval`] for a signal number out of range.
pub fn sigdelset(set: &mut SigSet, signo: usize) -> Result<(), Errno> {
    if signo == 0 || signo >= PROC_SIGMAX {
        return Err(Errno::Inval);
    }
    set.0 &= !(1 << signo);
    Ok(())
}

/// Whether `signo` is in `set`.
pub fn sigismember(set: &SigSet, signo: usize) -> bool {
    signo > 0 && signo < PROC_SIGMAX && set.0 & (1 << signo) != 0
}

/// What delivering a signal did (or would do).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDisposition {
    /// A registered handler ran.
    Handled,
    /// Default action: terminate the process.
    Terminate,
    /// Default action: ignore.
    Ignore,
}

/// A registered handler.
#[derive(Clone, Copy, Default)]
pub struct SigAction {
    /// Handler entry point (user VA once userland registers; kernel fn
    /// pointer for kernel threads). `None` selects the default action.
    pub handler: Option<fn(usize)>,
}

/// One queued signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KsigInfo {
    /// Signal number.
    pub signo: usize,
    /// Origin code (0 = kernel, 1 = user request, 2 = fault).
    pub sigcode: u32,
}

/// Per-thread signal state: the queue and the action table. Embedded in
/// `Proc` behind its `ksigq` lock.
pub struct SignalState {
    /// Queued, undelivered signals.
    pub ksigq: VecDeque<KsigInfo>,
    /// Registered actions by signal number.
    pub actions: [SigAction; PROC_SIGMAX],
}

impl SignalState {
    /// Empty queue, all-default actions.
    pub fn new() -> Self {
        Self {
            ksigq: VecDeque::new(),
            actions: [SigAction::default(); PROC_SIGMAX],
        }
    }

    /// Enqueues one [`KsigInfo`] per signal in `set`.
    pub fn sendsig(&mut self, set: SigSet, sigcode: u32) {
        for signo in 1..PROC_SIGMAX {
            if sigismember(&set, signo) {
                self.ksigq.push_back(KsigInfo { signo, sigcode });
            }
        }
    }

    /// Removes every queued instance of `signo`.
    pub fn delsig(&mut self, signo: usize) {
        self.ksigq.retain(|k| k.signo != signo);
    }

    /// Registers `action` for `signo`.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for out-of-range numbers; SIGKILL and SIGSEGV
    /// keep their defaults.
    pub fn set_action(&mut self, signo: usize, action: SigAction) -> Result<(), Errno> {
        if signo == 0 || signo >= PROC_SIGMAX {
            return Err(Errno::Inval);
        }
        if signo == SIGKILL || signo == SIGSEGV {
            return Err(Errno::Inval);
        }
        self.actions[signo] = action;
        Ok(())
    }

    /// Pops the next queued signal and resolves its disposition. The
    /// caller (the return-to-user path) loops until `None` and performs
    /// terminations.
    pub fn dispatch_one(&mut self) -> Option<(KsigInfo, SigDisposition)> {
        let ksig = self.ksigq.pop_front()?;
        let disp = match self.actions[ksig.signo].handler {
            // KILL and SEGV are never handleable (set_action refuses), so
            // a registered handler always runs here.
            Some(handler) => {
                handler(ksig.signo);
                SigDisposition::Handled
            }
            None => default_disposition(ksig.signo),
        };
        Some((ksig, disp))
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// The default action for `signo`.
pub fn default_disposition(signo: usize) -> SigDisposition {
    match signo {
        SIGKILL | SIGSEGV | SIGFPE | SIGTERM => SigDisposition::Terminate,
        _ => SigDisposition::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let mut set = SigSet::default();
        sigemptyset(&mut set);
        assert_eq!(set.0, 0);
        sigaddset(&mut set, SIGTERM).unwrap();
        assert!(sigismember(&set, SIGTERM));
        assert!(!sigismember(&set, SIGKILL));
        sigdelset(&mut set, SIGTERM).unwrap();
        assert_eq!(set.0, 0);

        sigfillset(&mut set);
        assert!(sigismember(&set, 1));
        assert!(sigismember(&set, PROC_SIGMAX - 1));
        assert_eq!(sigaddset(&mut set, 0).unwrap_err(), Errno::Inval);
        assert_eq!(sigaddset(&mut set, PROC_SIGMAX).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn send_then_del_leaves_queue_empty() {
        let mut st = SignalState::new();
        let mut set = SigSet::default();
        sigaddset(&mut set, SIGTERM).unwrap();
        st.sendsig(set, 0);
        assert_eq!(st.ksigq.len(), 1);
        st.delsig(SIGTERM);
        assert!(st.ksigq.is_empty());
    }

    #[test]
    fn queue_preserves_send_order() {
        let mut st = SignalState::new();
        let mut set = SigSet::default();
        sigaddset(&mut set, SIGFPE).unwrap();
        sigaddset(&mut set, SIGTERM).unwrap();
        st.sendsig(set, 2);

        let (first, _) = st.dispatch_one().unwrap();
        assert_eq!(first.signo, SIGFPE);
        let (second, disp) = st.dispatch_one().unwrap();
        assert_eq!(second.signo, SIGTERM);
        assert_eq!(disp, SigDisposition::Terminate);
        assert!(st.dispatch_one().is_none());
    }

    #[test]
    fn registered_handler_preempts_default() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static LAST: AtomicUsize = AtomicUsize::new(0);
        fn noted(signo: usize) {
            LAST.store(signo, Ordering::SeqCst);
        }

        let mut st = SignalState::new();
        st.set_action(SIGTERM, SigAction { handler: Some(noted) }).unwrap();

        let mut set = SigSet::default();
        sigaddset(&mut set, SIGTERM).unwrap();
        st.sendsig(set, 1);

        let (_, disp) = st.dispatch_one().unwrap();
        assert_eq!(disp, SigDisposition::Handled);
        assert_eq!(LAST.load(Ordering::SeqCst), SIGTERM);
    }

    #[test]
    fn kill_and_segv_are_not_handleable() {
        let mut st = SignalState::new();
        assert_eq!(
            st.set_action(SIGKILL, SigAction { handler: None }).unwrap_err(),
            Errno::Inval
        );
        assert_eq!(
            st.set_action(SIGSEGV, SigAction { handler: None }).unwrap_err(),
            Errno::Inval
        );
        assert_eq!(default_disposition(SIGKILL), SigDisposition::Terminate);
        assert_eq!(default_disposition(SIGSEGV), SigDisposition::Terminate);
    }
}
