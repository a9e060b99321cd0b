//! Interrupt registration and `/proc/interrupts`, kernel-wide.

mod common;

use common::{kinit, read_file};
use muon_kernel::intr::{IPL_BIO, IntrRequest, intr_dispatch, intr_register};

use std::sync::atomic::{AtomicU64, Ordering};

static KBD_HITS: AtomicU64 = AtomicU64::new(0);

fn kbd_handler(data: u64) {
    KBD_HITS.fetch_add(1, Ordering::SeqCst);
    assert_eq!(data, 0x60);
}

#[test]
fn irq_registration_and_accounting() {
    let k = kinit();

    // IRQ 1 at IPL BIO: the vector lands in BIO's band and is nonzero.
    let hand = intr_register(
        "i8042",
        &IntrRequest {
            func: kbd_handler,
            ipl: IPL_BIO,
            irq: 1,
            data: 0x60,
        },
    )
    .expect("register");
    assert_ne!(hand.vector, 0);
    assert!((0x10..=0x1F).contains(&hand.vector));

    // Simulated keystrokes bump the handler's counter.
    for _ in 0..5 {
        intr_dispatch(hand.vector);
    }
    assert_eq!(hand.nintr(), 5);
    assert_eq!(KBD_HITS.load(Ordering::SeqCst), 5);

    // The registry renders into /proc/interrupts via the VFS.
    let text = String::from_utf8(read_file(k, "/proc/interrupts")).unwrap();
    let row = text
        .lines()
        .find(|l| l.ends_with("i8042"))
        .expect("i8042 row");
    assert!(row.contains("\t5\t"), "row was: {row}");
    assert!(row.contains("ioapic"));
}
