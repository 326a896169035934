//! II.25.2 PE headers: COFF header, optional header, section table, CLI header.
//!
//! These are plain decoded records; the [`PeWriter`](crate::writer::PeWriter)
//! patches the underlying bytes directly rather than re-encoding these
//! structs, so only `from` constructors are needed here.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Result, ShadeError};

/// II.25.2.2 PE file header.
#[derive(Debug, Clone, Copy)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub optional_header_size: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    pub const SIZE: usize = 20;

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<CoffHeader> {
        Ok(CoffHeader {
            machine: cursor.read_u16::<LittleEndian>()?,
            number_of_sections: cursor.read_u16::<LittleEndian>()?,
            time_date_stamp: cursor.read_u32::<LittleEndian>()?,
            pointer_to_symbol_table: cursor.read_u32::<LittleEndian>()?,
            number_of_symbols: cursor.read_u32::<LittleEndian>()?,
            optional_header_size: cursor.read_u16::<LittleEndian>()?,
            characteristics: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// RVA + Size pair. II.25.2.3.3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<DataDirectory> {
        Ok(DataDirectory {
            rva: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn is_present(&self) -> bool {
        self.rva != 0 || self.size != 0
    }
}

/// Index of each PE32/PE32+ data directory slot, II.25.2.3.3.
pub mod directory {
    pub const EXPORT_TABLE: usize = 0;
    pub const IMPORT_TABLE: usize = 1;
    pub const RESOURCE_TABLE: usize = 2;
    pub const EXCEPTION_TABLE: usize = 3;
    pub const CERTIFICATE_TABLE: usize = 4;
    pub const BASE_RELOCATION_TABLE: usize = 5;
    pub const DEBUG: usize = 6;
    pub const COPYRIGHT: usize = 7;
    pub const GLOBAL_PTR: usize = 8;
    pub const TLS_TABLE: usize = 9;
    pub const LOAD_CONFIG_TABLE: usize = 10;
    pub const BOUND_IMPORT: usize = 11;
    pub const IAT: usize = 12;
    pub const DELAY_IMPORT_DESCRIPTOR: usize = 13;
    pub const CLI_HEADER: usize = 14;
    pub const RESERVED: usize = 15;
    pub const COUNT: usize = 16;
}

/// II.25.2.3.1/.2: standard + NT-specific fields, decoded just far enough to
/// resolve the fields this core reads or patches.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    pub is_pe64: bool,
    pub magic: u16,
    pub file_alignment: u32,
    pub section_alignment: u32,
    pub address_of_entry_point: u32,
    pub size_of_image: u32,
    pub data_directories: Vec<DataDirectory>,
}

impl OptionalHeader {
    // Offsets within the optional header (II.25.2.3.2). PE32+ drops the
    // 4-byte `BaseOfData` field but widens `ImageBase` from 4 to 8 bytes, so
    // everything up through `FileAlignment` lands at the same offset in
    // both layouts; only `SizeOfStackReserve` and later fields diverge.
    const MAGIC_OFFSET: usize = 0;
    const ENTRY_POINT_OFFSET: usize = 16;
    const SECTION_ALIGNMENT_OFFSET: usize = 32;
    const FILE_ALIGNMENT_OFFSET: usize = 36;
    const SIZE_OF_IMAGE_OFFSET_PE32: usize = 56;
    const SIZE_OF_IMAGE_OFFSET_PE64: usize = 56;
    const DATA_DIRECTORIES_OFFSET_PE32: usize = 96;
    const DATA_DIRECTORIES_OFFSET_PE64: usize = 112;

    pub const PE32_MAGIC: u16 = 0x10b;
    pub const PE64_MAGIC: u16 = 0x20b;

    pub fn parse(bytes: &[u8]) -> Result<OptionalHeader> {
        if bytes.len() < Self::MAGIC_OFFSET + 2 {
            return Err(ShadeError::InvalidImage("optional header truncated".into()));
        }
        let magic = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let is_pe64 = match magic {
            Self::PE32_MAGIC => false,
            Self::PE64_MAGIC => true,
            other => {
                return Err(ShadeError::InvalidImage(format!(
                    "unrecognized optional header magic 0x{other:x}"
                )))
            }
        };

        let read_u32 = |off: usize| -> Result<u32> {
            bytes
                .get(off..off + 4)
                .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
                .ok_or_else(|| ShadeError::InvalidImage("optional header truncated".into()))
        };

        let section_alignment = read_u32(Self::SECTION_ALIGNMENT_OFFSET)?;
        let file_alignment = read_u32(Self::FILE_ALIGNMENT_OFFSET)?;
        let size_of_image_offset = if is_pe64 {
            Self::SIZE_OF_IMAGE_OFFSET_PE64
        } else {
            Self::SIZE_OF_IMAGE_OFFSET_PE32
        };
        let size_of_image = read_u32(size_of_image_offset)?;
        let address_of_entry_point = read_u32(Self::ENTRY_POINT_OFFSET)?;

        let dirs_offset = if is_pe64 {
            Self::DATA_DIRECTORIES_OFFSET_PE64
        } else {
            Self::DATA_DIRECTORIES_OFFSET_PE32
        };
        let mut data_directories = Vec::with_capacity(directory::COUNT);
        let mut cursor = Cursor::new(
            bytes
                .get(dirs_offset..)
                .ok_or_else(|| ShadeError::InvalidImage("optional header truncated".into()))?,
        );
        for _ in 0..directory::COUNT {
            data_directories.push(DataDirectory::read(&mut cursor)?);
        }

        Ok(OptionalHeader {
            is_pe64,
            magic,
            file_alignment,
            section_alignment,
            address_of_entry_point,
            size_of_image,
            data_directories,
        })
    }

    pub fn directory(&self, index: usize) -> DataDirectory {
        self.data_directories[index]
    }
}

/// II.25.3: one 40-byte section header row.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub const SIZE: usize = 40;

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<SectionHeader> {
        let mut name = [0u8; 8];
        std::io::Read::read_exact(cursor, &mut name)?;
        Ok(SectionHeader {
            name,
            virtual_size: cursor.read_u32::<LittleEndian>()?,
            virtual_address: cursor.read_u32::<LittleEndian>()?,
            size_of_raw_data: cursor.read_u32::<LittleEndian>()?,
            pointer_to_raw_data: cursor.read_u32::<LittleEndian>()?,
            pointer_to_relocations: cursor.read_u32::<LittleEndian>()?,
            pointer_to_linenumbers: cursor.read_u32::<LittleEndian>()?,
            number_of_relocations: cursor.read_u16::<LittleEndian>()?,
            number_of_linenumbers: cursor.read_u16::<LittleEndian>()?,
            characteristics: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva < self.virtual_address + self.size_of_raw_data
    }
}

/// II.25.3.3: the 72-byte CLI header.
#[derive(Debug, Clone, Copy)]
pub struct CliHeader {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: DataDirectory,
    pub flags: u32,
    pub entry_point_token: u32,
    pub resources: DataDirectory,
    pub strong_name_signature: DataDirectory,
    pub code_manager_table: DataDirectory,
    pub vtable_fixups: DataDirectory,
    pub export_address_table_jumps: DataDirectory,
    pub managed_native_header: DataDirectory,
}

impl CliHeader {
    pub const SIZE: usize = 72;

    // Field offsets within the 72-byte header, used by the writer to patch
    // fields in place (§4.7a/g).
    pub const METADATA_OFFSET: usize = 8;
    pub const RESOURCES_OFFSET: usize = 24;
    pub const STRONG_NAME_OFFSET: usize = 32;

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<CliHeader> {
        Ok(CliHeader {
            cb: cursor.read_u32::<LittleEndian>()?,
            major_runtime_version: cursor.read_u16::<LittleEndian>()?,
            minor_runtime_version: cursor.read_u16::<LittleEndian>()?,
            metadata: DataDirectory::read(cursor)?,
            flags: cursor.read_u32::<LittleEndian>()?,
            entry_point_token: cursor.read_u32::<LittleEndian>()?,
            resources: DataDirectory::read(cursor)?,
            strong_name_signature: DataDirectory::read(cursor)?,
            code_manager_table: DataDirectory::read(cursor)?,
            vtable_fixups: DataDirectory::read(cursor)?,
            export_address_table_jumps: DataDirectory::read(cursor)?,
            managed_native_header: DataDirectory::read(cursor)?,
        })
    }
}
