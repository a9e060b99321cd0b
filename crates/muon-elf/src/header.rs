//! ELF64 header parsing and validation.

use core::fmt;

/// ELF magic bytes: `\x7fELF`.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// 64-bit class (`e_ident[EI_CLASS]`).
const ELFCLASS64: u8 = 2;

/// Little-endian data encoding (`e_ident[EI_DATA]`).
const ELFDATA2LSB: u8 = 1;

/// System V ABI (`e_ident[EI_OSABI]`).
const ELFOSABI_SYSV: u8 = 0;

/// Executable object file.
const ET_EXEC: u16 = 2;

/// x86-64 machine type.
const EM_X86_64: u16 = 62;

/// AArch64 machine type.
const EM_AARCH64: u16 = 183;

/// Loadable program header.
pub const PT_LOAD: u32 = 1;

/// Segment is executable.
pub const PF_X: u32 = 1;
/// Segment is writable.
pub const PF_W: u32 = 2;
/// Segment is readable.
pub const PF_R: u32 = 4;

/// Size of the ELF64 file header.
const EHDR_SIZE: usize = 64;

/// Size of one ELF64 program header entry.
pub(crate) const PHDR_SIZE: usize = 56;

pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

pub(crate) fn le_u64(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Reasons an ELF image is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Missing `\x7fELF` magic.
    BadMagic,
    /// Not `ELFCLASS64`.
    BadClass,
    /// Not little-endian.
    BadEncoding,
    /// Not the System V ABI.
    BadAbi,
    /// Not an `ET_EXEC` image.
    NotExecutable,
    /// Machine type this kernel does not run.
    BadMachine,
    /// File shorter than a declared structure.
    Truncated,
    /// A table offset or size points outside the file.
    BadOffset,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadMagic => "bad ELF magic",
            Self::BadClass => "not a 64-bit image",
            Self::BadEncoding => "not little-endian",
            Self::BadAbi => "not a System V image",
            Self::NotExecutable => "not an ET_EXEC image",
            Self::BadMachine => "unsupported machine type",
            Self::Truncated => "file truncated",
            Self::BadOffset => "header table out of bounds",
        };
        f.write_str(msg)
    }
}

/// Parsed ELF64 file header (the fields the loader cares about).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Machine type (`EM_X86_64` or `EM_AARCH64`).
    pub e_machine: u16,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table file offset.
    pub e_phoff: u64,
    /// Size of one program header entry.
    pub e_phentsize: u16,
    /// Number of program header entries.
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Parses and validates an ELF64 header.
    ///
    /// # Errors
    ///
    /// Any identification mismatch or out-of-bounds table yields the
    /// corresponding [`ElfError`].
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::BadClass);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::BadEncoding);
        }
        if data[7] != ELFOSABI_SYSV {
            return Err(ElfError::BadAbi);
        }

        if le_u16(data, 16) != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        let e_machine = le_u16(data, 18);
        if e_machine != EM_X86_64 && e_machine != EM_AARCH64 {
            return Err(ElfError::BadMachine);
        }

        let e_entry = le_u64(data, 24);
        let e_phoff = le_u64(data, 32);
        let e_phentsize = le_u16(data, 54);
        let e_phnum = le_u16(data, 56);

        if e_phnum > 0 && (e_phentsize as usize) < PHDR_SIZE {
            return Err(ElfError::BadOffset);
        }
        let ph_end = e_phoff
            .checked_add(u64::from(e_phnum) * u64::from(e_phentsize))
            .ok_or(ElfError::BadOffset)?;
        if ph_end > data.len() as u64 {
            return Err(ElfError::BadOffset);
        }

        Ok(Self {
            e_machine,
            e_entry,
            e_phoff,
            e_phentsize,
            e_phnum,
        })
    }
}

/// One raw ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct Elf64Phdr {
    /// Segment kind (`PT_LOAD` et al).
    pub p_type: u32,
    /// `PF_R | PF_W | PF_X` permission bits.
    pub p_flags: u32,
    /// Segment file offset.
    pub p_offset: u64,
    /// Mapping virtual address.
    pub p_vaddr: u64,
    /// Bytes present in the file.
    pub p_filesz: u64,
    /// Bytes occupied in memory (`>= p_filesz`, remainder zero-filled).
    pub p_memsz: u64,
}

impl Elf64Phdr {
    /// Decodes the program header at byte offset `off`.
    ///
    /// The caller guarantees `off + PHDR_SIZE <= data.len()`.
    pub(crate) fn parse(data: &[u8], off: usize) -> Self {
        Self {
            p_type: le_u32(data, off),
            p_flags: le_u32(data, off + 4),
            p_offset: le_u64(data, off + 8),
            p_vaddr: le_u64(data, off + 16),
            p_filesz: le_u64(data, off + 32),
            p_memsz: le_u64(data, off + 40),
        }
    }
}
