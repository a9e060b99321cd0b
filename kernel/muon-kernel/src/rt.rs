//! Bare-metal runtime glue: kernel heap, panic handler, serial log sink.
//!
//! Nothing here is reachable from hosted builds — the host brings its own
//! allocator and panic machinery.

use core::panic::PanicInfo;

use linked_list_allocator::LockedHeap;

/// Early heap backing store (2 MiB in `.bss`); enough to carry boot until
/// a real VM-backed heap could take over.
const EARLY_HEAP_SIZE: usize = 2 * 1024 * 1024;

#[repr(align(4096))]
struct EarlyHeap([u8; EARLY_HEAP_SIZE]);

static mut EARLY_HEAP: EarlyHeap = EarlyHeap([0; EARLY_HEAP_SIZE]);

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hands the early heap to the allocator. First thing the boot entry
/// does, before any allocation.
///
/// # Safety
///
/// Call exactly once, before the first allocation.
pub unsafe fn heap_init() {
    // SAFETY: The static buffer is reserved solely for the heap and this
    // runs once.
    unsafe {
        HEAP.lock()
            .init(core::ptr::addr_of_mut!(EARLY_HEAP.0).cast::<u8>(), EARLY_HEAP_SIZE);
    }
}

#[cfg(target_arch = "x86_64")]
mod serial {
    use alloc::sync::Arc;
    use log::LevelFilter;
    use muon_core::klog::{self, LogSink};
    use muon_core::sync::SpinLock;
    use uart_16550::SerialPort;

    /// COM1 log sink.
    struct SerialSink {
        port: SpinLock<SerialPort>,
    }

    impl LogSink for SerialSink {
        fn write_str(&self, s: &str) {
            let mut port = self.port.lock();
            for b in s.bytes() {
                if b == b'\n' {
                    port.send(b'\r');
                }
                port.send(b);
            }
        }

        fn max_level(&self) -> LevelFilter {
            LevelFilter::Debug
        }

        fn name(&self) -> &str {
            "com1"
        }
    }

    /// Brings up COM1 and registers it as a log sink.
    pub fn init() {
        // SAFETY: Standard COM1 I/O port base.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        klog::add_sink(Arc::new(SerialSink {
            port: SpinLock::new(port),
        }));
    }
}

#[cfg(target_arch = "x86_64")]
pub use serial::init as serial_init;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    log::error!(target: "panic", "{info}");
    // Other CPUs would be halted with an IPI here; then park this one.
    loop {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: cli/hlt parks the CPU.
        unsafe {
            core::arch::asm!("cli; hlt")
        };
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}
