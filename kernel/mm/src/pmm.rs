//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, bit set = allocated or reserved. The bitmap
//! itself is carved out of the first usable region and addressed through the
//! direct-map window, so the allocator costs no heap. Word-at-a-time scans
//! with `trailing_zeros()` keep single-frame allocation cheap; contiguous
//! runs fall back to a bit-by-bit scan.
//!
//! The allocator also keeps the counters behind `/ctl/vm/stat` and
//! `/proc/memstat`: total, used, reserved, and an "allocated-above"
//! watermark recording the highest frame ever handed out.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::{PAGE_SIZE, PhysAddr};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

const BITS_PER_WORD: usize = 64;

/// One boot-time physical memory region.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// First byte of the region.
    pub start: PhysAddr,
    /// Region size in bytes.
    pub size: u64,
    /// Whether the region may be allocated from.
    pub usable: bool,
}

struct PmmInner {
    /// The reservation map, one bit per frame, living in direct-mapped RAM.
    bitmap: &'static mut [u64],
    /// Frames tracked by the bitmap.
    total_frames: usize,
    /// Frames currently free.
    free_frames: usize,
    /// Frames backing usable RAM (free at boot).
    usable_frames: usize,
    /// Word index where the next single-frame scan starts.
    search_hint: usize,
    /// Highest frame index ever allocated, plus one.
    alloc_watermark: usize,
}

/// The physical frame allocator.
///
/// All public methods take `&self`; the reservation map sits behind a
/// spinlock. Handed around as `Arc<Pmm>` — address spaces and VM objects
/// keep a reference so teardown can return frames without reaching for a
/// global.
pub struct Pmm {
    inner: SpinLock<PmmInner>,
    dmap_offset: u64,
    /// Bytes of usable RAM, fixed after construction.
    mem_total: u64,
    /// Bytes currently allocated.
    mem_used: AtomicU64,
}

// SAFETY: The bitmap slice is only touched under the spinlock.
unsafe impl Send for Pmm {}
unsafe impl Sync for Pmm {}

impl Pmm {
    /// Builds the allocator over `regions`.
    ///
    /// # Safety
    ///
    /// `dmap_offset + pa` must be a valid, writable virtual address for
    /// every byte of every usable region, for the allocator's lifetime.
    /// Must be called once per distinct memory map.
    pub unsafe fn new(regions: &[PhysMemoryRegion], dmap_offset: u64) -> Result<Self, Errno> {
        let frame_size = PAGE_SIZE as u64;

        let max_phys = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.start.as_u64() + r.size)
            .max()
            .unwrap_or(0);
        if max_phys == 0 {
            return Err(Errno::Nomem);
        }

        let total_frames = (max_phys / frame_size) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = bitmap_words * 8;
        let bitmap_frames = (bitmap_bytes as u64).div_ceil(frame_size);

        // The bitmap lives in the first usable region able to hold it.
        let bitmap_start = regions
            .iter()
            .filter(|r| r.usable && r.size >= bitmap_bytes as u64)
            .map(|r| r.start)
            .next()
            .ok_or(Errno::Nomem)?;

        // SAFETY: Per the caller contract, this range is direct-mapped RAM
        // and nobody else is using it yet.
        let bitmap = unsafe {
            let ptr = (dmap_offset + bitmap_start.as_u64()) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };

        // All reserved until proven usable.
        bitmap.fill(u64::MAX);

        let mut usable_frames = 0usize;
        for region in regions.iter().filter(|r| r.usable) {
            let first = (region.start.as_u64() / frame_size) as usize;
            let count = (region.size / frame_size) as usize;
            for frame in first..first + count {
                if frame < total_frames {
                    bitmap[frame / BITS_PER_WORD] &= !(1u64 << (frame % BITS_PER_WORD));
                    usable_frames += 1;
                }
            }
        }

        // Re-reserve the bitmap's own frames.
        let mut free_frames = usable_frames;
        let bitmap_first = (bitmap_start.as_u64() / frame_size) as usize;
        for frame in bitmap_first..bitmap_first + bitmap_frames as usize {
            if frame < total_frames {
                let word = frame / BITS_PER_WORD;
                let bit = 1u64 << (frame % BITS_PER_WORD);
                if bitmap[word] & bit == 0 {
                    bitmap[word] |= bit;
                    free_frames -= 1;
                }
            }
        }

        log::info!(
            target: "pmm",
            "{} KiB usable, bitmap {} KiB",
            usable_frames * PAGE_SIZE / 1024,
            bitmap_bytes / 1024
        );

        Ok(Self {
            inner: SpinLock::new(PmmInner {
                bitmap,
                total_frames,
                free_frames,
                usable_frames,
                search_hint: 0,
                alloc_watermark: 0,
            }),
            dmap_offset,
            mem_total: usable_frames as u64 * frame_size,
            mem_used: AtomicU64::new((usable_frames - free_frames) as u64 * frame_size),
        })
    }

    /// Allocates `count` physically contiguous frames.
    ///
    /// Returns the base address, or the zero address on exhaustion — large
    /// runs may fail even when enough scattered frames remain.
    pub fn alloc_frame(&self, count: usize) -> PhysAddr {
        if count == 0 {
            return PhysAddr::zero();
        }
        let mut inner = self.inner.lock();
        if inner.free_frames < count {
            return PhysAddr::zero();
        }

        let frame = if count == 1 {
            self.scan_single(&mut inner)
        } else {
            self.scan_run(&mut inner, count)
        };
        let Some(frame) = frame else {
            return PhysAddr::zero();
        };

        for f in frame..frame + count {
            inner.bitmap[f / BITS_PER_WORD] |= 1u64 << (f % BITS_PER_WORD);
        }
        inner.free_frames -= count;
        inner.alloc_watermark = inner.alloc_watermark.max(frame + count);
        self.mem_used
            .fetch_add((count * PAGE_SIZE) as u64, Ordering::Relaxed);
        PhysAddr::new((frame * PAGE_SIZE) as u64)
    }

    /// Allocates `count` contiguous frames and zeroes them.
    ///
    /// This is the variant user-visible pages come from, so stale kernel
    /// data never leaks into a process.
    pub fn alloc_pageframe(&self, count: usize) -> PhysAddr {
        let pa = self.alloc_frame(count);
        if !pa.is_zero() {
            // SAFETY: The frames were just allocated and are direct-mapped.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(pa), 0, count * PAGE_SIZE);
            }
        }
        pa
    }

    /// Returns `count` frames starting at `pa` to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if any frame is already free (double free) or out of range —
    /// both are invariant breaks, not recoverable errors.
    pub fn free_frame(&self, pa: PhysAddr, count: usize) {
        assert!(pa.is_aligned(PAGE_SIZE as u64), "free_frame: unaligned");
        let first = (pa.as_u64() / PAGE_SIZE as u64) as usize;
        let mut inner = self.inner.lock();
        assert!(
            first + count <= inner.total_frames,
            "free_frame: out of range"
        );
        for f in first..first + count {
            let word = f / BITS_PER_WORD;
            let bit = 1u64 << (f % BITS_PER_WORD);
            assert!(
                inner.bitmap[word] & bit != 0,
                "free_frame: double free of frame {f:#x}"
            );
            inner.bitmap[word] &= !bit;
        }
        inner.free_frames += count;
        inner.search_hint = first / BITS_PER_WORD;
        self.mem_used
            .fetch_sub((count * PAGE_SIZE) as u64, Ordering::Relaxed);
    }

    /// Total bytes of usable RAM.
    pub fn mem_total(&self) -> u64 {
        self.mem_total
    }

    /// Bytes currently allocated.
    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Bytes currently free.
    pub fn mem_free(&self) -> u64 {
        self.mem_total - self.mem_used()
    }

    /// Bytes of address space below `mem_total`'s span that were reserved
    /// at boot (holes, firmware, the bitmap itself).
    pub fn mem_reserved(&self) -> u64 {
        let inner = self.inner.lock();
        ((inner.total_frames - inner.usable_frames) * PAGE_SIZE) as u64
    }

    /// Highest physical address ever handed out (the allocation watermark).
    pub fn alloc_watermark(&self) -> PhysAddr {
        let inner = self.inner.lock();
        PhysAddr::new((inner.alloc_watermark * PAGE_SIZE) as u64)
    }

    /// Translates a physical address through the direct-map window.
    #[inline]
    pub fn phys_to_virt(&self, pa: PhysAddr) -> *mut u8 {
        (self.dmap_offset + pa.as_u64()) as *mut u8
    }

    /// A whole direct-mapped frame as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must own the frame and ensure no aliasing access.
    #[inline]
    pub unsafe fn frame_slice(&self, pa: PhysAddr) -> &mut [u8] {
        // SAFETY: Forwarded to the caller.
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_virt(pa), PAGE_SIZE) }
    }

    fn scan_single(&self, inner: &mut PmmInner) -> Option<usize> {
        let words = inner.bitmap.len();
        let start = inner.search_hint;
        for off in 0..words {
            let word_idx = (start + off) % words;
            let word = inner.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame = word_idx * BITS_PER_WORD + bit;
            if frame >= inner.total_frames {
                continue;
            }
            inner.search_hint = word_idx;
            return Some(frame);
        }
        None
    }

    fn scan_run(&self, inner: &mut PmmInner, count: usize) -> Option<usize> {
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..inner.total_frames {
            let free = inner.bitmap[frame / BITS_PER_WORD] & (1u64 << (frame % BITS_PER_WORD)) == 0;
            if free {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pmm_fixture;

    #[test]
    fn single_frames_are_distinct_and_reusable() {
        let (_arena, pmm) = pmm_fixture(64);
        let a = pmm.alloc_frame(1);
        let b = pmm.alloc_frame(1);
        assert!(!a.is_zero() && !b.is_zero());
        assert_ne!(a, b);

        let used = pmm.mem_used();
        pmm.free_frame(a, 1);
        pmm.free_frame(b, 1);
        assert_eq!(pmm.mem_used(), used - 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn contiguous_runs_are_contiguous() {
        let (_arena, pmm) = pmm_fixture(64);
        let run = pmm.alloc_frame(8);
        assert!(!run.is_zero());
        assert!(run.is_aligned(PAGE_SIZE as u64));
        // Every frame of the run is owned: freeing the whole run works and
        // freeing it again panics (checked in a separate test).
        pmm.free_frame(run, 8);
    }

    #[test]
    fn exhaustion_returns_zero() {
        let (_arena, pmm) = pmm_fixture(16);
        // Ask for more than the arena can possibly hold.
        assert!(pmm.alloc_frame(4096).is_zero());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (_arena, pmm) = pmm_fixture(32);
        let pa = pmm.alloc_frame(1);
        pmm.free_frame(pa, 1);
        pmm.free_frame(pa, 1);
    }

    #[test]
    fn pageframe_is_zeroed() {
        let (_arena, pmm) = pmm_fixture(32);
        // Dirty a frame, free it, then expect alloc_pageframe to hand back
        // zeroed memory (possibly the same frame).
        let pa = pmm.alloc_frame(1);
        // SAFETY: We own the frame.
        unsafe { pmm.frame_slice(pa).fill(0xAB) };
        pmm.free_frame(pa, 1);

        let pa = pmm.alloc_pageframe(1);
        // SAFETY: We own the frame.
        let slice = unsafe { pmm.frame_slice(pa) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn watermark_tracks_high_allocation() {
        let (_arena, pmm) = pmm_fixture(32);
        let before = pmm.alloc_watermark();
        let pa = pmm.alloc_frame(4);
        assert!(pmm.alloc_watermark().as_u64() >= pa.as_u64() + 4 * PAGE_SIZE as u64);
        assert!(pmm.alloc_watermark() >= before);
        pmm.free_frame(pa, 4);
    }

    #[test]
    fn totals_are_consistent() {
        let (_arena, pmm) = pmm_fixture(64);
        assert_eq!(pmm.mem_total(), pmm.mem_used() + pmm.mem_free());
    }
}
