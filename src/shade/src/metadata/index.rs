//! Heap indices, table indices, and ECMA-335 II.24.2.6 coded indices.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use crate::error::{Result, ShadeError};
use crate::metadata::TableKind;

/// Bit flags from the `#~` stream's `HeapSizes` byte (§3 "Index widths").
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapSizes {
    pub large_strings: bool,
    pub large_guids: bool,
    pub large_blobs: bool,
}

impl HeapSizes {
    pub const STRING_FLAG: u8 = 0x01;
    pub const GUID_FLAG: u8 = 0x02;
    pub const BLOB_FLAG: u8 = 0x04;

    pub fn from_byte(b: u8) -> HeapSizes {
        HeapSizes {
            large_strings: b & Self::STRING_FLAG != 0,
            large_guids: b & Self::GUID_FLAG != 0,
            large_blobs: b & Self::BLOB_FLAG != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.large_strings {
            b |= Self::STRING_FLAG;
        }
        if self.large_guids {
            b |= Self::GUID_FLAG;
        }
        if self.large_blobs {
            b |= Self::BLOB_FLAG;
        }
        b
    }

    pub fn string_size(self) -> u8 {
        if self.large_strings {
            4
        } else {
            2
        }
    }

    pub fn guid_size(self) -> u8 {
        if self.large_guids {
            4
        } else {
            2
        }
    }

    pub fn blob_size(self) -> u8 {
        if self.large_blobs {
            4
        } else {
            2
        }
    }
}

macro_rules! heap_index {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn read(cursor: &mut Cursor<&[u8]>, width: u8) -> Result<$name> {
                Ok($name(if width == 4 {
                    cursor.read_u32::<LittleEndian>()?
                } else {
                    cursor.read_u16::<LittleEndian>()? as u32
                }))
            }

            pub fn write(self, out: &mut Vec<u8>, width: u8) -> Result<()> {
                if width == 4 {
                    out.write_u32::<LittleEndian>(self.0)?;
                } else {
                    out.write_u16::<LittleEndian>(self.0 as u16)?;
                }
                Ok(())
            }
        }
    };
}

heap_index!(StringIndex);
heap_index!(BlobIndex);
heap_index!(GuidIndex);

/// II.24.2.6 coded-index kinds, each with a fixed tag width and candidate
/// table list per II.24.2.6's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodedIndexTag {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndexTag {
    pub fn tag_bits(self) -> u32 {
        match self {
            CodedIndexTag::TypeDefOrRef => 2,
            CodedIndexTag::HasConstant => 2,
            CodedIndexTag::HasCustomAttribute => 5,
            CodedIndexTag::HasFieldMarshal => 1,
            CodedIndexTag::HasDeclSecurity => 2,
            CodedIndexTag::MemberRefParent => 3,
            CodedIndexTag::HasSemantics => 1,
            CodedIndexTag::MethodDefOrRef => 1,
            CodedIndexTag::MemberForwarded => 1,
            CodedIndexTag::Implementation => 2,
            CodedIndexTag::CustomAttributeType => 3,
            CodedIndexTag::ResolutionScope => 2,
            CodedIndexTag::TypeOrMethodDef => 1,
        }
    }

    /// Candidate tables in tag order. Some slots are reserved (`None`) —
    /// notably `CustomAttributeType`'s tags 0 and 1 (§4.4).
    pub fn candidates(self) -> &'static [Option<TableKind>] {
        use TableKind::*;
        match self {
            CodedIndexTag::TypeDefOrRef => &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)],
            CodedIndexTag::HasConstant => &[Some(Field), Some(Param), Some(Property)],
            CodedIndexTag::HasCustomAttribute => &[
                Some(MethodDef),
                Some(Field),
                Some(TypeRef),
                Some(TypeDef),
                Some(Param),
                Some(InterfaceImpl),
                Some(MemberRef),
                Some(Module),
                Some(DeclSecurity),
                Some(Property),
                Some(Event),
                Some(StandAloneSig),
                Some(ModuleRef),
                Some(TypeSpec),
                Some(Assembly),
                Some(AssemblyRef),
                Some(File),
                Some(ExportedType),
                Some(ManifestResource),
                Some(GenericParam),
                Some(GenericParamConstraint),
                Some(MethodSpec),
            ],
            CodedIndexTag::HasFieldMarshal => &[Some(Field), Some(Param)],
            CodedIndexTag::HasDeclSecurity => &[Some(TypeDef), Some(MethodDef), Some(Assembly)],
            CodedIndexTag::MemberRefParent => &[
                Some(TypeDef),
                Some(TypeRef),
                Some(ModuleRef),
                Some(MethodDef),
                Some(TypeSpec),
            ],
            CodedIndexTag::HasSemantics => &[Some(Event), Some(Property)],
            CodedIndexTag::MethodDefOrRef => &[Some(MethodDef), Some(MemberRef)],
            CodedIndexTag::MemberForwarded => &[Some(Field), Some(MethodDef)],
            CodedIndexTag::Implementation => &[Some(File), Some(AssemblyRef), Some(ExportedType)],
            CodedIndexTag::CustomAttributeType => {
                &[None, None, Some(MethodDef), Some(MemberRef), None]
            }
            CodedIndexTag::ResolutionScope => {
                &[Some(Module), Some(ModuleRef), Some(AssemblyRef), Some(TypeRef)]
            }
            CodedIndexTag::TypeOrMethodDef => &[Some(TypeDef), Some(MethodDef)],
        }
    }

    fn tag_for(self, table: TableKind) -> Option<u32> {
        self.candidates()
            .iter()
            .position(|c| *c == Some(table))
            .map(|i| i as u32)
    }

    /// Width in bytes this coded index occupies given each candidate
    /// table's row count (§4.4).
    pub fn width(self, row_count: impl Fn(TableKind) -> u32) -> u8 {
        let max_rows = self
            .candidates()
            .iter()
            .flatten()
            .map(|&t| row_count(t))
            .max()
            .unwrap_or(0);
        let limit = 1u32 << (16 - self.tag_bits());
        if max_rows < limit {
            2
        } else {
            4
        }
    }

    /// Encodes `(table, rid)` into a coded index value. A zero rid always
    /// encodes to zero regardless of table (§4.4).
    pub fn encode(self, table: TableKind, rid: u32) -> Result<u32> {
        if rid == 0 {
            return Ok(0);
        }
        let tag = self
            .tag_for(table)
            .ok_or(ShadeError::UnknownCodedIndex)?;
        Ok((rid << self.tag_bits()) | tag)
    }

    /// Decodes a coded index value into `(table, rid)`. A zero value
    /// decodes to the null token `(Module, 0)` (§4.4).
    pub fn decode(self, value: u32) -> Result<(TableKind, u32)> {
        if value == 0 {
            return Ok((TableKind::Module, 0));
        }
        let tag_bits = self.tag_bits();
        let tag = value & ((1 << tag_bits) - 1);
        let rid = value >> tag_bits;
        let table = self
            .candidates()
            .get(tag as usize)
            .copied()
            .flatten()
            .ok_or(ShadeError::UnknownCodedIndex)?;
        Ok((table, rid))
    }

    pub fn read(self, cursor: &mut Cursor<&[u8]>, width: u8) -> Result<(TableKind, u32)> {
        let raw = if width == 4 {
            cursor.read_u32::<LittleEndian>()?
        } else {
            cursor.read_u16::<LittleEndian>()? as u32
        };
        self.decode(raw)
    }

    pub fn write(self, out: &mut Vec<u8>, width: u8, table: TableKind, rid: u32) -> Result<()> {
        let raw = self.encode(table, rid)?;
        if width == 4 {
            out.write_u32::<LittleEndian>(raw)?;
        } else {
            out.write_u16::<LittleEndian>(raw as u16)?;
        }
        Ok(())
    }
}

/// Reads a `#Blob`/`#US`-style compressed length (1, 2 or 4 bytes, §3).
pub fn read_compressed_length(cursor: &mut Cursor<&[u8]>) -> Result<(u32, u8)> {
    let first = cursor.read_u8()?;
    if first & 0x80 == 0 {
        Ok((first as u32, 1))
    } else if first & 0xC0 == 0x80 {
        let second = cursor.read_u8()?;
        Ok(((((first & 0x3F) as u32) << 8) | second as u32, 2))
    } else if first & 0xE0 == 0xC0 {
        let mut rest = [0u8; 3];
        io::Read::read_exact(cursor, &mut rest)?;
        let value = (((first & 0x1F) as u32) << 24)
            | ((rest[0] as u32) << 16)
            | ((rest[1] as u32) << 8)
            | rest[2] as u32;
        Ok((value, 4))
    } else {
        Err(ShadeError::InvalidImage("invalid compressed length".into()))
    }
}

/// Number of bytes a compressed length prefix needs for a given value
/// (§4.5 `GetOrAddBlob`).
pub fn compressed_length_size(len: usize) -> usize {
    if len < 0x80 {
        1
    } else if len < 0x4000 {
        2
    } else {
        4
    }
}

pub fn write_compressed_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.push(0x80 | ((len >> 8) as u8));
        out.push((len & 0xFF) as u8);
    } else {
        out.push(0xC0 | ((len >> 24) as u8 & 0x1F));
        out.push(((len >> 16) & 0xFF) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push((len & 0xFF) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_index_round_trips_every_candidate() {
        let tags = [
            CodedIndexTag::TypeDefOrRef,
            CodedIndexTag::HasConstant,
            CodedIndexTag::HasCustomAttribute,
            CodedIndexTag::HasFieldMarshal,
            CodedIndexTag::HasDeclSecurity,
            CodedIndexTag::MemberRefParent,
            CodedIndexTag::HasSemantics,
            CodedIndexTag::MethodDefOrRef,
            CodedIndexTag::MemberForwarded,
            CodedIndexTag::Implementation,
            CodedIndexTag::CustomAttributeType,
            CodedIndexTag::ResolutionScope,
            CodedIndexTag::TypeOrMethodDef,
        ];
        for tag in tags {
            for candidate in tag.candidates().iter().flatten() {
                let encoded = tag.encode(*candidate, 7).unwrap();
                let (table, rid) = tag.decode(encoded).unwrap();
                assert_eq!(table, *candidate);
                assert_eq!(rid, 7);
            }
        }
    }

    #[test]
    fn zero_rid_encodes_to_zero_and_decodes_null() {
        let encoded = CodedIndexTag::TypeDefOrRef
            .encode(TableKind::TypeRef, 0)
            .unwrap();
        assert_eq!(encoded, 0);
        let (table, rid) = CodedIndexTag::TypeDefOrRef.decode(0).unwrap();
        assert_eq!(table, TableKind::Module);
        assert_eq!(rid, 0);
    }

    #[test]
    fn custom_attribute_type_rejects_reserved_tags() {
        assert!(CodedIndexTag::CustomAttributeType.decode(0).is_ok()); // value 0 is the null token
        // tag 1 with a nonzero rid hits the reserved slot.
        let raw = (5u32 << CodedIndexTag::CustomAttributeType.tag_bits()) | 1;
        assert!(CodedIndexTag::CustomAttributeType.decode(raw).is_err());
    }

    #[test]
    fn compressed_length_round_trips() {
        for len in [0usize, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1_0000] {
            let mut buf = Vec::new();
            write_compressed_length(&mut buf, len);
            assert_eq!(buf.len(), compressed_length_size(len));
            let slice: &[u8] = &buf;
            let mut cursor = Cursor::new(slice);
            let (decoded, size) = read_compressed_length(&mut cursor).unwrap();
            assert_eq!(decoded as usize, len);
            assert_eq!(size as usize, buf.len());
        }
    }

    #[test]
    fn coded_index_width_grows_past_threshold() {
        let small = CodedIndexTag::TypeOrMethodDef.width(|_| 10);
        assert_eq!(small, 2);
        let big = CodedIndexTag::TypeOrMethodDef.width(|_| 1 << 16);
        assert_eq!(big, 4);
    }
}
