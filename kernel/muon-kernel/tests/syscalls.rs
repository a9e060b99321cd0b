//! The syscall surface, driven through the dispatcher the way the trap
//! stub would.

mod common;

use common::{install_test_clock, kinit, ktd, write_file};
use muon_core::errno::Errno;
use muon_kernel::syscall::{
    NSYSCALL, SYS_ACCESS, SYS_CLOSE, SYS_GETPID, SYS_GETPPID, SYS_GETUID, SYS_INJECT, SYS_LSEEK,
    SYS_OPEN, SYS_READ, SYS_REBOOT, SYS_SETUID, SYS_SLEEP, SYS_STAT, SYS_SYSCTL, SYS_WRITE,
    syscall_dispatch,
};
use muon_kernel::sysctl::KERN_OSTYPE;

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

const O_READ: usize = 1;
const O_WRITE: usize = 2;
const O_CREATE: usize = 4;

/// Every hosted test thread is "CPU 0"; the dispatcher's IPL
/// raise/restore pairing is per-CPU state, so dispatcher use is
/// serialized.
static DISPATCH_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[test]
fn file_io_round_trip() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let k = kinit();
    let td = ktd();
    write_file(k, "/etc/hostname", b"muon\n");

    let path = cstr("/etc/hostname");
    let fd = syscall_dispatch(&td, SYS_OPEN, [path.as_ptr() as usize, O_READ, 0, 0, 0, 0]);
    assert!(fd >= 0);

    let mut buf = [0u8; 16];
    let n = syscall_dispatch(
        &td,
        SYS_READ,
        [fd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"muon\n");

    // stat: {mode u32, vtype u32, size u64}
    let mut statbuf = [0u8; 16];
    let rc = syscall_dispatch(
        &td,
        SYS_STAT,
        [fd as usize, statbuf.as_mut_ptr() as usize, 0, 0, 0, 0],
    );
    assert_eq!(rc, 0);
    assert_eq!(u64::from_le_bytes(statbuf[8..16].try_into().unwrap()), 5);

    // lseek back and reread one byte.
    assert_eq!(syscall_dispatch(&td, SYS_LSEEK, [fd as usize, 1, 0, 0, 0, 0]), 1);
    let n = syscall_dispatch(
        &td,
        SYS_READ,
        [fd as usize, buf.as_mut_ptr() as usize, 1, 0, 0, 0],
    );
    assert_eq!(n, 1);
    assert_eq!(buf[0], b'u');

    assert_eq!(syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]), 0);
    assert_eq!(
        syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]),
        Errno::Badf.as_neg()
    );
}

#[test]
fn write_creates_and_access_sees_it() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let _k = kinit();
    let td = ktd();

    let path = cstr("/tmp/note");
    let missing = syscall_dispatch(&td, SYS_ACCESS, [path.as_ptr() as usize, 0, 0, 0, 0, 0]);
    assert_eq!(missing, Errno::Noent.as_neg());

    let fd = syscall_dispatch(
        &td,
        SYS_OPEN,
        [path.as_ptr() as usize, O_WRITE | O_CREATE, 0, 0, 0, 0],
    );
    assert!(fd >= 0);
    let n = syscall_dispatch(
        &td,
        SYS_WRITE,
        [fd as usize, b"hello".as_ptr() as usize, 5, 0, 0, 0],
    );
    assert_eq!(n, 5);
    syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]);

    assert_eq!(
        syscall_dispatch(&td, SYS_ACCESS, [path.as_ptr() as usize, 0, 0, 0, 0, 0]),
        0
    );
}

#[test]
fn identity_and_credentials() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let _k = kinit();
    let td = ktd();
    assert_eq!(
        syscall_dispatch(&td, SYS_GETPID, [0; 6]),
        i64::from(td.pid)
    );
    assert_eq!(syscall_dispatch(&td, SYS_GETPPID, [0; 6]), 0);
    assert_eq!(syscall_dispatch(&td, SYS_GETUID, [0; 6]), 0);

    // Root may change uid; afterwards the change is irrevocable.
    assert_eq!(syscall_dispatch(&td, SYS_SETUID, [1000, 0, 0, 0, 0, 0]), 0);
    assert_eq!(syscall_dispatch(&td, SYS_GETUID, [0; 6]), 1000);
    assert_eq!(
        syscall_dispatch(&td, SYS_SETUID, [0, 0, 0, 0, 0, 0]),
        Errno::Acces.as_neg()
    );
}

#[test]
fn sysctl_reads_the_ostype() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let _k = kinit();
    let td = ktd();
    let mut out = [0u8; 16];
    let mut len = (out.len() as u64).to_le_bytes();
    let rc = syscall_dispatch(
        &td,
        SYS_SYSCTL,
        [
            KERN_OSTYPE as usize,
            out.as_mut_ptr() as usize,
            len.as_mut_ptr() as usize,
            0,
            0,
            0,
        ],
    );
    assert_eq!(rc, 0);
    assert_eq!(u64::from_le_bytes(len), 4);
    assert_eq!(&out[..4], b"Muon");
}

#[test]
fn device_nodes_through_the_fd_layer() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let _k = kinit();
    let td = ktd();

    // /dev/beep accepts one LE u32 tone word.
    let path = cstr("/dev/beep");
    let fd = syscall_dispatch(&td, SYS_OPEN, [path.as_ptr() as usize, O_WRITE, 0, 0, 0, 0]);
    assert!(fd >= 0);
    let tone = ((250u32 << 16) | 880).to_le_bytes();
    assert_eq!(
        syscall_dispatch(&td, SYS_WRITE, [fd as usize, tone.as_ptr() as usize, 4, 0, 0, 0]),
        4
    );
    assert_eq!(muon_kernel::dev::beep::last_tone(), Some((250, 880)));
    // Zero frequency is rejected.
    let bad = 0u32.to_le_bytes();
    assert!(syscall_dispatch(&td, SYS_WRITE, [fd as usize, bad.as_ptr() as usize, 4, 0, 0, 0]) < 0);
    syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]);

    // /dev/random yields bytes and refuses writes.
    let path = cstr("/dev/random");
    let fd = syscall_dispatch(&td, SYS_OPEN, [path.as_ptr() as usize, O_READ, 0, 0, 0, 0]);
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    assert_eq!(
        syscall_dispatch(&td, SYS_READ, [fd as usize, a.as_mut_ptr() as usize, 32, 0, 0, 0]),
        32
    );
    assert_eq!(
        syscall_dispatch(&td, SYS_READ, [fd as usize, b.as_mut_ptr() as usize, 32, 0, 0, 0]),
        32
    );
    assert_ne!(a, b, "keystream must advance");
    syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]);

    // /dev/rtc reports six time bytes (month is in range).
    let path = cstr("/dev/rtc");
    let fd = syscall_dispatch(&td, SYS_OPEN, [path.as_ptr() as usize, O_READ, 0, 0, 0, 0]);
    let mut t = [0u8; 6];
    assert_eq!(
        syscall_dispatch(&td, SYS_READ, [fd as usize, t.as_mut_ptr() as usize, 6, 0, 0, 0]),
        6
    );
    assert!((1..=12).contains(&t[4]));
    syscall_dispatch(&td, SYS_CLOSE, [fd as usize, 0, 0, 0, 0, 0]);
}

#[test]
fn misc_calls_behave() {
    let _g = DISPATCH_LOCK.lock().unwrap();
    let _k = kinit();
    let td = ktd();

    // Unknown syscall number.
    assert_eq!(
        syscall_dispatch(&td, NSYSCALL + 3, [0; 6]),
        Errno::Inval.as_neg()
    );

    // Reboot without a mode is invalid; hosted reboot cannot happen.
    assert_eq!(syscall_dispatch(&td, SYS_REBOOT, [0; 6]), Errno::Inval.as_neg());
    assert_eq!(
        syscall_dispatch(&td, SYS_REBOOT, [1, 0, 0, 0, 0, 0]),
        Errno::Nosup.as_neg()
    );

    // Blacklist injection is accepted while boot is still open.
    let name = cstr("rtl8139");
    assert_eq!(
        syscall_dispatch(&td, SYS_INJECT, [name.as_ptr() as usize, 0, 0, 0, 0, 0]),
        0
    );
    assert!(muon_kernel::driver::driver_blacklist_check("rtl8139"));

    // Sleep with a clock installed actually waits.
    install_test_clock();
    let start = std::time::Instant::now();
    assert_eq!(syscall_dispatch(&td, SYS_SLEEP, [20_000, 0, 0, 0, 0, 0]), 0);
    assert!(start.elapsed().as_micros() >= 15_000);
}
