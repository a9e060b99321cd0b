//! Sink-based kernel logger behind the `log` facade.
//!
//! Subsystems log through the ordinary `log` macros with a subsystem target
//! (`log::info!(target: "vm", ...)`). [`KernelLog`] fans each record out to
//! the registered [`LogSink`]s, each with its own maximum level. The boot
//! path installs a serial sink first thing; tests can install a capturing
//! sink.
//!
//! Formatting happens per-sink with no allocation, so the logger works from
//! the earliest boot stages and from the panic path.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record};

use crate::sync::SpinLock;

/// A dyn-compatible output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Write a string fragment to this sink.
    fn write_str(&self, s: &str);

    /// Maximum level this sink accepts.
    fn max_level(&self) -> LevelFilter;

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// The global fan-out logger.
pub struct KernelLog {
    sinks: SpinLock<Vec<Arc<dyn LogSink>>>,
}

static KLOG: KernelLog = KernelLog {
    sinks: SpinLock::new(Vec::new()),
};

/// Adapter so `write!` can target a sink without allocating.
struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            if record.level() > sink.max_level() {
                continue;
            }
            let mut w = SinkWriter(&**sink);
            let _ = writeln!(
                w,
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger as the `log` facade backend.
///
/// Idempotent: a second call (e.g. from another test binary in the same
/// process) is a no-op.
pub fn init() {
    if log::set_logger(&KLOG).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Registers an output sink.
pub fn add_sink(sink: Arc<dyn LogSink>) {
    KLOG.sinks.lock().push(sink);
}

/// Removes all sinks whose [`LogSink::name`] equals `name`.
pub fn remove_sink(name: &str) {
    KLOG.sinks.lock().retain(|s| s.name() != name);
}
