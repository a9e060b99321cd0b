//! `/ctl/dmi/board`: board identification strings.
//!
//! Five NUL-terminated text fields: CPU manufacturer, CPU version,
//! product, vendor, firmware version. Firmware table parsing (SMBIOS)
//! would feed [`set_board_info`]; until something does, the fields read
//! `unknown`.

use alloc::string::{String, ToString};
use alloc::sync::Arc;

use muon_core::errno::Errno;
use muon_core::sync::Once;
use muon_fs::SioTxn;
use muon_fs::ctlfs::{CtlNode, read_bytes_at};

use crate::boot::kernel;

/// Board identification.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    pub cpu_manuf: String,
    pub cpu_version: String,
    pub product: String,
    pub vendor: String,
    pub version: String,
}

impl Default for BoardInfo {
    fn default() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            cpu_manuf: unknown(),
            cpu_version: unknown(),
            product: unknown(),
            vendor: unknown(),
            version: unknown(),
        }
    }
}

static BOARD: Once<BoardInfo> = Once::new();

/// Publishes the board strings (firmware probe calls this once).
pub fn set_board_info(info: BoardInfo) {
    let _ = BOARD.set(info);
}

struct BoardNode;

impl CtlNode for BoardNode {
    fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let info = BOARD.get_or_init(BoardInfo::default);
        let mut text = alloc::vec::Vec::new();
        for field in [
            &info.cpu_manuf,
            &info.cpu_version,
            &info.product,
            &info.vendor,
            &info.version,
        ] {
            text.extend_from_slice(field.as_bytes());
            text.push(0);
        }
        read_bytes_at(&text, txn)
    }
}

/// Registers `/ctl/dmi/board`.
///
/// # Errors
///
/// Registration conflicts propagate.
pub fn init() -> Result<(), Errno> {
    kernel().ctlfs.register("dmi", "board", Arc::new(BoardNode))
}
