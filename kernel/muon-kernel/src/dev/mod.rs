//! Built-in pseudo-device drivers.
//!
//! Each module exposes an `init` that the boot path hangs on the driver
//! registry: allocate device numbers, register the devsw, publish the
//! devfs node (and any ctlfs attribute files).

pub mod beep;
pub mod clock;
pub mod dmi;
pub mod fbdev;
pub mod ramdisk;
pub mod random;
pub mod rtc;
