//! Parsed ELF file and `PT_LOAD` segment iteration.

use crate::header::{Elf64Header, Elf64Phdr, ElfError, PHDR_SIZE, PT_LOAD};

/// A validated ELF64 executable, borrowing the raw image bytes.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

/// One loadable segment of an executable.
#[derive(Debug)]
pub struct LoadSegment<'a> {
    /// Virtual address the segment maps at.
    pub vaddr: u64,
    /// File-backed bytes; may be shorter than `memsz` (`.bss` tail).
    pub data: &'a [u8],
    /// Total in-memory size.
    pub memsz: u64,
    /// `PF_R | PF_W | PF_X` permission bits.
    pub flags: u32,
}

impl<'a> ElfFile<'a> {
    /// Parses and validates an executable image.
    ///
    /// # Errors
    ///
    /// See [`ElfError`]; nothing is accepted beyond LSB 64-bit SYSV
    /// `ET_EXEC` images for a machine this kernel targets.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        Ok(Self { data, header })
    }

    /// Entry point virtual address.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// The validated file header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// File offset of the program header table (for `AT_PHDR`).
    #[must_use]
    pub fn phdr_offset(&self) -> u64 {
        self.header.e_phoff
    }

    /// Program header entry size and count (for `AT_PHENT`/`AT_PHNUM`).
    #[must_use]
    pub fn phdr_geometry(&self) -> (u16, u16) {
        (self.header.e_phentsize, self.header.e_phnum)
    }

    /// Iterates every program header in table order.
    pub fn program_headers(&self) -> impl Iterator<Item = Elf64Phdr> + 'a {
        let data = self.data;
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        (0..self.header.e_phnum as usize).filter_map(move |i| {
            let off = phoff + i * phentsize;
            (off + PHDR_SIZE <= data.len()).then(|| Elf64Phdr::parse(data, off))
        })
    }

    /// Iterates the `PT_LOAD` segments with their file-backed bytes.
    ///
    /// A segment whose file range runs past the end of the image is
    /// truncated to the available bytes; the loader zero-fills the rest the
    /// same way it zero-fills `.bss`.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> + 'a {
        let data = self.data;
        self.program_headers().filter_map(move |ph| {
            if ph.p_type != PT_LOAD {
                return None;
            }
            let start = (ph.p_offset as usize).min(data.len());
            let end = (ph.p_offset.saturating_add(ph.p_filesz) as usize).min(data.len());
            Some(LoadSegment {
                vaddr: ph.p_vaddr,
                data: &data[start..end],
                memsz: ph.p_memsz,
                flags: ph.p_flags,
            })
        })
    }
}
