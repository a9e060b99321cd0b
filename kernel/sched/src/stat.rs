//! Scheduler statistics for `/ctl/sched/stat`.

use alloc::vec::Vec;

use muon_core::cpu::CpuId;

use crate::queue::Scheduler;
use crate::{DEFAULT_TIMESLICE_USEC, Schedulable};

/// A point-in-time scheduler snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedStat {
    /// Threads known to the scheduler.
    pub nproc: u64,
    /// CPUs dispatched on.
    pub ncpu: u32,
    /// Preemption quantum in microseconds.
    pub quantum_usec: u32,
    /// Idle dispatch attempts, summed over CPUs.
    pub nhlt: u32,
    /// Context switches, one entry per CPU.
    pub nswitch: Vec<u32>,
}

impl SchedStat {
    /// Samples `sched`.
    pub fn sample<T: Schedulable>(sched: &Scheduler<T>) -> Self {
        let ncpu = sched.ncpu() as u32;
        let mut nhlt = 0u32;
        let mut nswitch = Vec::with_capacity(ncpu as usize);
        for i in 0..ncpu {
            let cq = sched.cpu(CpuId(i));
            nhlt = nhlt.wrapping_add(cq.nhlt());
            nswitch.push(cq.nswitch());
        }
        Self {
            nproc: sched.nthreads(),
            ncpu,
            quantum_usec: DEFAULT_TIMESLICE_USEC,
            nhlt,
            nswitch,
        }
    }

    /// Encodes the `/ctl/sched/stat` blob:
    /// `{nproc u64, ncpu u32, quantum_usec u32, nhlt u32, nswitch[ncpu] u32}`,
    /// all little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + 4 * self.nswitch.len());
        out.extend_from_slice(&self.nproc.to_le_bytes());
        out.extend_from_slice(&self.ncpu.to_le_bytes());
        out.extend_from_slice(&self.quantum_usec.to_le_bytes());
        out.extend_from_slice(&self.nhlt.to_le_bytes());
        for ns in &self.nswitch {
            out.extend_from_slice(&ns.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Td(AtomicUsize);
    impl Schedulable for Td {
        fn priority(&self) -> usize {
            self.0.load(Ordering::Relaxed)
        }
        fn set_priority(&self, p: usize) {
            self.0.store(p, Ordering::Relaxed);
        }
        fn pinned_cpu(&self) -> Option<CpuId> {
            None
        }
        fn is_runnable(&self) -> bool {
            true
        }
    }

    #[test]
    fn blob_layout() {
        let sched: Scheduler<Td> = Scheduler::new(2);
        sched.admit(Arc::new(Td(AtomicUsize::new(0))));
        let _ = sched.dequeue_td(CpuId(0));

        let stat = SchedStat::sample(&sched);
        assert_eq!(stat.nproc, 1);
        assert_eq!(stat.ncpu, 2);
        assert_eq!(stat.quantum_usec, DEFAULT_TIMESLICE_USEC);

        let blob = stat.encode();
        assert_eq!(blob.len(), 20 + 8);
        assert_eq!(u64::from_le_bytes(blob[0..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(blob[12..16].try_into().unwrap()),
            DEFAULT_TIMESLICE_USEC
        );
    }
}
