//! Compile-time kernel tunables.

use static_assertions::const_assert;

/// Pages in a freshly spawned thread's kernel-visible stack.
pub const PROC_STACK_PAGES: usize = 8;

/// Highest signal number, exclusive.
pub const PROC_SIGMAX: usize = 64;

/// Capsules per VSR domain table.
pub const VSR_MAX_CAPSULE: usize = 16;

/// Buckets in the driver blacklist.
pub const BLACKLIST_SIZE: usize = 64;

/// Device major/minor ceilings.
pub const MAX_MAJOR: usize = 256;
/// Minors per major.
pub const MAX_MINOR: usize = 256;

/// OS name reported by `/proc/version` and `sysctl`.
pub const OSTYPE: &str = "Muon";

/// Release string.
pub const OSRELEASE: &str = "0.3.0";

/// Build date baked into `/proc/version`.
pub const BUILDDATE: &str = "2026-08-01";

/// Branch baked into `/proc/version`.
pub const BRANCH: &str = "main";

const_assert!(PROC_STACK_PAGES >= 2);
const_assert!(PROC_SIGMAX <= 64);
