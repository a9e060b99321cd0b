//! Per-CPU run queues and the dispatch core.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use muon_core::cpu::{self, CpuId};
use muon_core::sync::SpinLock;

use crate::{SCHED_NQUEUE, SchedPolicy, Schedulable, kick_cpu, sched_policy};

/// One CPU's scheduler state.
pub struct CpuQueue<T> {
    /// Run queues, level 0 highest. FIFO within a level.
    queues: SpinLock<[VecDeque<Arc<T>>; SCHED_NQUEUE]>,
    /// The thread currently on this CPU.
    current: SpinLock<Option<Arc<T>>>,
    /// Context switches performed.
    nswitch: AtomicU32,
    /// Times the dispatcher found nothing to run.
    nhlt: AtomicU32,
    /// Whether the CPU takes part in dispatch.
    online: AtomicBool,
}

impl<T> CpuQueue<T> {
    fn new() -> Self {
        Self {
            queues: SpinLock::new([const { VecDeque::new() }; SCHED_NQUEUE]),
            current: SpinLock::new(None),
            nswitch: AtomicU32::new(0),
            nhlt: AtomicU32::new(0),
            online: AtomicBool::new(true),
        }
    }

    /// Context switches performed on this CPU.
    pub fn nswitch(&self) -> u32 {
        self.nswitch.load(Ordering::Relaxed)
    }

    /// Idle dispatch attempts on this CPU.
    pub fn nhlt(&self) -> u32 {
        self.nhlt.load(Ordering::Relaxed)
    }

    /// Queued (not running) threads on this CPU.
    pub fn queued(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    /// The thread currently running on this CPU.
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.lock().clone()
    }
}

/// The machine-wide scheduler: one [`CpuQueue`] per logical CPU.
pub struct Scheduler<T: Schedulable> {
    cpus: Vec<CpuQueue<T>>,
    policy: SchedPolicy,
    /// Live threads known to the scheduler (running + queued + sleeping).
    nthreads: AtomicU64,
    /// Round-robin placement cursor for unpinned threads.
    placement: AtomicU32,
}

impl<T: Schedulable> Scheduler<T> {
    /// A scheduler for `ncpu` logical CPUs with the build-time policy.
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu >= 1);
        let mut cpus = Vec::with_capacity(ncpu);
        for _ in 0..ncpu {
            cpus.push(CpuQueue::new());
        }
        Self {
            cpus,
            policy: sched_policy(),
            nthreads: AtomicU64::new(0),
            placement: AtomicU32::new(0),
        }
    }

    /// Number of CPUs the scheduler dispatches on.
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    /// The active policy.
    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    /// Per-CPU state.
    pub fn cpu(&self, id: CpuId) -> &CpuQueue<T> {
        &self.cpus[id.index()]
    }

    /// Threads currently tracked (running + queued + sleeping).
    pub fn nthreads(&self) -> u64 {
        self.nthreads.load(Ordering::Relaxed)
    }

    /// Registers a brand-new thread and queues it.
    pub fn admit(&self, td: Arc<T>) {
        self.nthreads.fetch_add(1, Ordering::Relaxed);
        self.enqueue(td);
    }

    /// Forgets an exiting thread (it must no longer be queued).
    pub fn retire(&self) {
        self.nthreads.fetch_sub(1, Ordering::Relaxed);
    }

    /// Queues `td` on its pinned CPU, or the next CPU in placement order.
    /// Queuing onto a remote CPU raises the kick hook so that CPU
    /// reschedules promptly.
    pub fn enqueue(&self, td: Arc<T>) {
        let target = match td.pinned_cpu() {
            Some(pin) if pin.index() < self.cpus.len() => pin,
            _ => {
                let n = self.placement.fetch_add(1, Ordering::Relaxed);
                CpuId(n % self.cpus.len() as u32)
            }
        };
        self.enqueue_on(target, td);
    }

    /// Queues `td` at the tail of its level on `cpu`.
    pub fn enqueue_on(&self, target: CpuId, td: Arc<T>) {
        let prio = td.priority().min(SCHED_NQUEUE - 1);
        self.cpus[target.index()].queues.lock()[prio].push_back(td);
        if target != cpu::current_cpu() {
            kick_cpu(target);
        }
    }

    /// Picks the next thread for `cpu`: highest non-empty level, FIFO
    /// within the level. Pinned-elsewhere threads are bounced to their
    /// CPU; non-runnable threads fall out of the queues here.
    pub fn dequeue_td(&self, me: CpuId) -> Option<Arc<T>> {
        let cq = &self.cpus[me.index()];
        if !cq.online.load(Ordering::Acquire) {
            return None;
        }
        let mut bounced: Vec<Arc<T>> = Vec::new();
        let picked = {
            let mut queues = cq.queues.lock();
            let mut found = None;
            'levels: for level in queues.iter_mut() {
                while let Some(td) = level.pop_front() {
                    if !td.is_runnable() {
                        // Sleeping or dying: leave it out; its waker will
                        // re-enqueue.
                        continue;
                    }
                    match td.pinned_cpu() {
                        Some(pin) if pin != me => bounced.push(td),
                        _ => {
                            found = Some(td);
                            break 'levels;
                        }
                    }
                }
            }
            found
        };

        for td in bounced {
            self.enqueue(td);
        }

        match picked {
            Some(td) => {
                cq.nswitch.fetch_add(1, Ordering::Relaxed);
                *cq.current.lock() = Some(Arc::clone(&td));
                Some(td)
            }
            None => {
                cq.nhlt.fetch_add(1, Ordering::Relaxed);
                *cq.current.lock() = None;
                None
            }
        }
    }

    /// Timeslice expiry for the running thread of `cpu`: re-queues it (one
    /// level lower under MLFQ) and returns the next thread to run.
    pub fn slice_expired(&self, me: CpuId) -> Option<Arc<T>> {
        let cq = &self.cpus[me.index()];
        if let Some(td) = cq.current.lock().take() {
            if self.policy == SchedPolicy::Mlfq {
                td.set_priority((td.priority() + 1).min(SCHED_NQUEUE - 1));
            }
            if td.is_runnable() {
                self.enqueue_on(me, td);
            }
        }
        self.dequeue_td(me)
    }

    /// Voluntary yield: like an expiry but without the MLFQ demotion.
    pub fn yield_current(&self, me: CpuId) -> Option<Arc<T>> {
        let cq = &self.cpus[me.index()];
        if let Some(td) = cq.current.lock().take() {
            if td.is_runnable() {
                self.enqueue_on(me, td);
            }
        }
        self.dequeue_td(me)
    }

    /// Re-queues a thread whose sleep ended.
    pub fn wakeup(&self, td: Arc<T>) {
        self.enqueue(td);
    }

    /// Takes `cpu` out of (or back into) dispatch.
    pub fn set_online(&self, target: CpuId, online: bool) {
        self.cpus[target.index()].online.store(online, Ordering::Release);
        log::info!(target: "sched", "cpu{} {}", target.0, if online { "online" } else { "offline" });
    }

    /// Sum of queued threads over all CPUs.
    pub fn total_queued(&self) -> usize {
        self.cpus.iter().map(CpuQueue::queued).sum()
    }

    /// Number of CPUs with a running thread.
    pub fn total_running(&self) -> usize {
        self.cpus
            .iter()
            .filter(|c| c.current.lock().is_some())
            .count()
    }
}
