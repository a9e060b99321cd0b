//! `/dev/random`: ChaCha20 keystream bytes. Writes are rejected.

use alloc::sync::Arc;

use muon_core::errno::Errno;
use muon_core::sync::SpinLock;
use muon_core::time;
use muon_fs::CharDevSw;
use muon_fs::SioTxn;
use muon_fs::devfs::DevSw;

use crate::boot::kernel;
use crate::crypto::chacha20::ChaCha20;

struct RandomDev {
    stream: SpinLock<ChaCha20>,
}

impl CharDevSw for RandomDev {
    fn read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let buf = txn.read_buf()?;
        self.stream.lock().keystream(buf);
        Ok(buf.len())
    }
}

/// Registers `/dev/random`.
///
/// # Errors
///
/// Registration conflicts propagate.
pub fn init() -> Result<(), Errno> {
    let k = kernel();
    let major = k.devtab.alloc_major();
    let minor = k.devtab.alloc_minor(major);
    if major == 0 || minor == 0 {
        return Err(Errno::Nodev);
    }

    // Seed: build-unique constant stirred with the timer when one is
    // already up. A hardware entropy source would feed in here.
    let mut key = [0x5au8; 32];
    if let Some(usec) = time::monotonic_usec() {
        key[..8].copy_from_slice(&usec.to_le_bytes());
    }
    let nonce = [0x77u8; 12];

    let sw = DevSw::Chr(Arc::new(RandomDev {
        stream: SpinLock::new(ChaCha20::new(&key, &nonce)),
    }));
    k.devtab.register(major, minor, sw.clone())?;
    k.devfs.register("random", major, minor, sw)?;
    Ok(())
}
