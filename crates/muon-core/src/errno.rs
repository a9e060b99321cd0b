//! Kernel error taxonomy.
//!
//! Every fallible kernel path reports one of these codes. At the syscall
//! boundary they are encoded as small negative integers; inside the kernel
//! they travel as `Result<T, Errno>` and propagate with `?`.

use core::fmt;

/// A kernel error code.
///
/// The numeric values follow the usual Unix assignments so coredumps and
/// userland strace-alikes stay legible, but nothing in the kernel depends on
/// the specific numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such process.
    Srch = 3,
    /// Input/output error.
    Io = 5,
    /// Bad file descriptor.
    Badf = 9,
    /// No child processes.
    Child = 10,
    /// Resource temporarily unavailable.
    Again = 11,
    /// Out of memory.
    Nomem = 12,
    /// Permission denied.
    Acces = 13,
    /// Bad address.
    Fault = 14,
    /// File exists.
    Exist = 17,
    /// No such device.
    Nodev = 19,
    /// Invalid argument.
    Inval = 22,
    /// No space left on device.
    Nospc = 28,
    /// File name too long.
    Nametoolong = 36,
    /// No such file or directory.
    Noent = 2,
    /// Operation not supported.
    Nosup = 95,
    /// Operation timed out.
    Timedout = 110,
}

impl Errno {
    /// Encodes this error as a negative return value for the syscall ABI.
    #[inline]
    pub const fn as_neg(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Decodes a negative syscall return value back into an `Errno`.
    ///
    /// Returns `None` for non-negative values or unknown codes.
    pub const fn from_neg(val: i64) -> Option<Self> {
        match -val {
            2 => Some(Self::Noent),
            3 => Some(Self::Srch),
            5 => Some(Self::Io),
            9 => Some(Self::Badf),
            10 => Some(Self::Child),
            11 => Some(Self::Again),
            12 => Some(Self::Nomem),
            13 => Some(Self::Acces),
            14 => Some(Self::Fault),
            17 => Some(Self::Exist),
            19 => Some(Self::Nodev),
            22 => Some(Self::Inval),
            28 => Some(Self::Nospc),
            36 => Some(Self::Nametoolong),
            95 => Some(Self::Nosup),
            110 => Some(Self::Timedout),
            _ => None,
        }
    }

    /// Short lowercase mnemonic, handy for log lines.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Srch => "srch",
            Self::Io => "io",
            Self::Badf => "badf",
            Self::Child => "child",
            Self::Again => "again",
            Self::Nomem => "nomem",
            Self::Acces => "acces",
            Self::Fault => "fault",
            Self::Exist => "exist",
            Self::Nodev => "nodev",
            Self::Inval => "inval",
            Self::Nospc => "nospc",
            Self::Nametoolong => "nametoolong",
            Self::Noent => "noent",
            Self::Nosup => "nosup",
            Self::Timedout => "timedout",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as i32)
    }
}

/// Collapses a `Result<usize, Errno>` into the signed syscall encoding.
#[inline]
pub fn syscall_ret(res: Result<usize, Errno>) -> i64 {
    match res {
        Ok(n) => n as i64,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neg_roundtrip() {
        for e in [
            Errno::Noent,
            Errno::Io,
            Errno::Badf,
            Errno::Nomem,
            Errno::Inval,
            Errno::Timedout,
            Errno::Nosup,
        ] {
            assert!(e.as_neg() < 0);
            assert_eq!(Errno::from_neg(e.as_neg()), Some(e));
        }
        assert_eq!(Errno::from_neg(0), None);
        assert_eq!(Errno::from_neg(-1000), None);
    }

    #[test]
    fn syscall_encoding() {
        assert_eq!(syscall_ret(Ok(42)), 42);
        assert_eq!(syscall_ret(Err(Errno::Badf)), -9);
    }
}
