//! C1 — PE Reader: lazy-enough parse of DOS/COFF/optional headers, section
//! table, data directories and the CLI header, plus RVA resolution.

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::io::{Cursor, Read};

use crate::error::{Result, ShadeError};
use crate::pe::header::{directory, CliHeader, CoffHeader, OptionalHeader, SectionHeader};

const DOS_SIGNATURE: [u8; 2] = *b"MZ";
const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";
const E_LFANEW_OFFSET: usize = 0x3c;

/// A PE32/PE32+ image holding its bytes in memory, the way the teacher
/// crate's `PeParser` does (`Cursor<Vec<u8>>` over the whole file) rather
/// than re-reading from disk per field.
pub struct PeReader {
    bytes: Vec<u8>,
    pub coff: CoffHeader,
    pub optional: OptionalHeader,
    pub sections: Vec<SectionHeader>,
    pub cli_header: CliHeader,
    cli_header_file_offset: usize,
    optional_header_file_offset: usize,
    section_headers_file_offset: usize,
}

impl PeReader {
    pub fn open(bytes: Vec<u8>) -> Result<PeReader> {
        if bytes.len() < E_LFANEW_OFFSET + 4 || bytes[0..2] != DOS_SIGNATURE {
            return Err(ShadeError::InvalidImage("missing MZ signature".into()));
        }

        let lfanew = u32::from_le_bytes(
            bytes[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4]
                .try_into()
                .unwrap(),
        ) as usize;

        let mut cursor = Cursor::new(bytes.as_slice());
        cursor.set_position(lfanew as u64);

        let mut signature = [0u8; 4];
        cursor.read_exact(&mut signature)?;
        if signature != PE_SIGNATURE {
            return Err(ShadeError::InvalidImage("missing PE signature".into()));
        }

        let coff = CoffHeader::read(&mut cursor)?;
        let optional_header_start = cursor.position() as usize;
        let optional_header_bytes = bytes
            .get(optional_header_start..optional_header_start + coff.optional_header_size as usize)
            .ok_or_else(|| ShadeError::InvalidImage("optional header truncated".into()))?;
        let optional = OptionalHeader::parse(optional_header_bytes)?;

        let section_headers_offset = optional_header_start + coff.optional_header_size as usize;
        let mut section_cursor = Cursor::new(
            bytes
                .get(section_headers_offset..)
                .ok_or_else(|| ShadeError::InvalidImage("section table truncated".into()))?,
        );
        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        for _ in 0..coff.number_of_sections {
            sections.push(SectionHeader::read(&mut section_cursor)?);
        }

        let cli_dir = optional.directory(directory::CLI_HEADER);
        if !cli_dir.is_present() {
            return Err(ShadeError::NotManagedImage);
        }
        let cli_header_file_offset = Self::resolve(&sections, cli_dir.rva)?;
        let mut cli_cursor = Cursor::new(
            bytes
                .get(cli_header_file_offset..cli_header_file_offset + CliHeader::SIZE)
                .ok_or_else(|| ShadeError::InvalidImage("CLI header truncated".into()))?,
        );
        let cli_header = CliHeader::read(&mut cli_cursor)?;

        debug!(
            "opened PE image ({} sections, metadata rva=0x{:x} size={})",
            sections.len(),
            cli_header.metadata.rva,
            cli_header.metadata.size
        );

        Ok(PeReader {
            bytes,
            coff,
            optional,
            sections,
            cli_header,
            cli_header_file_offset,
            optional_header_file_offset: optional_header_start,
            section_headers_file_offset: section_headers_offset,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn optional_header_file_offset(&self) -> usize {
        self.optional_header_file_offset
    }

    pub fn section_header_file_offset(&self, index: usize) -> usize {
        self.section_headers_file_offset + index * SectionHeader::SIZE
    }

    pub fn data_directories_file_offset(&self) -> usize {
        self.optional_header_file_offset
            + if self.optional.is_pe64 { 112 } else { 96 }
    }

    pub fn is_pe64(&self) -> bool {
        self.optional.is_pe64
    }

    pub fn file_alignment(&self) -> u32 {
        self.optional.file_alignment
    }

    pub fn section_alignment(&self) -> u32 {
        self.optional.section_alignment
    }

    pub fn cli_header_file_offset(&self) -> usize {
        self.cli_header_file_offset
    }

    /// The section table's file offset, i.e. the first byte after the
    /// optional header — used by the writer to know where headers end.
    pub fn first_section_file_offset(&self) -> usize {
        self.sections
            .iter()
            .map(|s| s.pointer_to_raw_data as usize)
            .filter(|&p| p != 0)
            .min()
            .unwrap_or(self.bytes.len())
    }

    /// Resolves an RVA to a file offset by locating the unique containing
    /// section (§4.1).
    pub fn resolve_rva(&self, rva: u32) -> Result<usize> {
        Self::resolve(&self.sections, rva)
    }

    fn resolve(sections: &[SectionHeader], rva: u32) -> Result<usize> {
        for section in sections {
            if section.contains_rva(rva) {
                return Ok((section.pointer_to_raw_data + (rva - section.virtual_address)) as usize);
            }
        }
        Err(ShadeError::InvalidImage(format!(
            "rva 0x{rva:x} not contained in any section"
        )))
    }

    /// Finds the section whose RVA range contains `rva`, if any.
    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| ShadeError::InvalidImage("read past end of file".into()))
    }

    pub fn read_u32_at(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_at(offset, 4)?.try_into().unwrap()))
    }
}
