//! VM statistics snapshot.
//!
//! One struct serves both consumers: the binary blob at `/ctl/vm/stat`
//! (`avail`, `used`, `total`) and the labelled text at `/proc/memstat`.

use crate::obj;
use crate::pmm::Pmm;

/// A point-in-time view of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStat {
    /// Bytes of usable RAM.
    pub mem_total: u64,
    /// Bytes currently allocated.
    pub mem_used: u64,
    /// Bytes currently free.
    pub mem_avail: u64,
    /// Bytes reserved at boot (holes, firmware, allocator metadata).
    pub mem_reserved: u64,
    /// Live `VmObject` count.
    pub object_count: u64,
}

/// Samples the allocator's counters.
pub fn vm_stat(pmm: &Pmm) -> VmStat {
    VmStat {
        mem_total: pmm.mem_total(),
        mem_used: pmm.mem_used(),
        mem_avail: pmm.mem_free(),
        mem_reserved: pmm.mem_reserved(),
        object_count: obj::object_count(),
    }
}

/// Encodes the `/ctl/vm/stat` blob: `{mem_avail, mem_used, mem_total}`,
/// little-endian u64 each.
pub fn encode_ctl_blob(stat: &VmStat) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0..8].copy_from_slice(&stat.mem_avail.to_le_bytes());
    buf[8..16].copy_from_slice(&stat.mem_used.to_le_bytes());
    buf[16..24].copy_from_slice(&stat.mem_total.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pmm_fixture;

    #[test]
    fn snapshot_sums_and_blob_layout() {
        let (_arena, pmm) = pmm_fixture(64);
        let stat = vm_stat(&pmm);
        assert_eq!(stat.mem_total, stat.mem_used + stat.mem_avail);

        let blob = encode_ctl_blob(&stat);
        assert_eq!(u64::from_le_bytes(blob[0..8].try_into().unwrap()), stat.mem_avail);
        assert_eq!(u64::from_le_bytes(blob[16..24].try_into().unwrap()), stat.mem_total);
    }
}
