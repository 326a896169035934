//! Row codecs for the eight tables this core reads and mutates (§4.3):
//! `Module`, `TypeRef`, `TypeDef`, `MethodDef`, `MemberRef`,
//! `CustomAttribute`, `Assembly`, `AssemblyRef`. Every other table is only
//! ever sized via [`crate::metadata::schema`], never decoded into a typed
//! row, since nothing in the mutation set touches them.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::Result;
use crate::metadata::index::{BlobIndex, CodedIndexTag, GuidIndex, StringIndex};
use crate::metadata::kind::TableKind;
use crate::metadata::schema::Widths;

fn read_table_index(cursor: &mut Cursor<&[u8]>, width: u8) -> Result<u32> {
    Ok(if width == 4 {
        cursor.read_u32::<LittleEndian>()?
    } else {
        cursor.read_u16::<LittleEndian>()? as u32
    })
}

fn write_table_index(out: &mut Vec<u8>, width: u8, rid: u32) -> Result<()> {
    if width == 4 {
        out.write_u32::<LittleEndian>(rid)?;
    } else {
        out.write_u16::<LittleEndian>(rid as u16)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ModuleRow {
    pub generation: u16,
    pub name: StringIndex,
    pub mvid: GuidIndex,
    pub enc_id: GuidIndex,
    pub enc_base_id: GuidIndex,
}

impl ModuleRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<ModuleRow> {
        Ok(ModuleRow {
            generation: cursor.read_u16::<LittleEndian>()?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            mvid: GuidIndex::read(cursor, widths.heap_sizes.guid_size())?,
            enc_id: GuidIndex::read(cursor, widths.heap_sizes.guid_size())?,
            enc_base_id: GuidIndex::read(cursor, widths.heap_sizes.guid_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        out.write_u16::<LittleEndian>(self.generation)?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.mvid.write(out, widths.heap_sizes.guid_size())?;
        self.enc_id.write(out, widths.heap_sizes.guid_size())?;
        self.enc_base_id.write(out, widths.heap_sizes.guid_size())
    }
}

#[derive(Debug, Clone)]
pub struct TypeRefRow {
    pub resolution_scope: (TableKind, u32),
    pub name: StringIndex,
    pub namespace: StringIndex,
}

impl TypeRefRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<TypeRefRow> {
        let tag = CodedIndexTag::ResolutionScope;
        Ok(TypeRefRow {
            resolution_scope: tag.read(cursor, widths.coded_index_size(tag))?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            namespace: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        let tag = CodedIndexTag::ResolutionScope;
        tag.write(
            out,
            widths.coded_index_size(tag),
            self.resolution_scope.0,
            self.resolution_scope.1,
        )?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.namespace.write(out, widths.heap_sizes.string_size())
    }
}

#[derive(Debug, Clone)]
pub struct TypeDefRow {
    pub flags: u32,
    pub name: StringIndex,
    pub namespace: StringIndex,
    pub extends: (TableKind, u32),
    pub field_list: u32,
    pub method_list: u32,
}

impl TypeDefRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<TypeDefRow> {
        let tag = CodedIndexTag::TypeDefOrRef;
        Ok(TypeDefRow {
            flags: cursor.read_u32::<LittleEndian>()?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            namespace: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            extends: tag.read(cursor, widths.coded_index_size(tag))?,
            field_list: read_table_index(cursor, widths.table_index_size(TableKind::Field))?,
            method_list: read_table_index(cursor, widths.table_index_size(TableKind::MethodDef))?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        let tag = CodedIndexTag::TypeDefOrRef;
        out.write_u32::<LittleEndian>(self.flags)?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.namespace.write(out, widths.heap_sizes.string_size())?;
        tag.write(
            out,
            widths.coded_index_size(tag),
            self.extends.0,
            self.extends.1,
        )?;
        write_table_index(out, widths.table_index_size(TableKind::Field), self.field_list)?;
        write_table_index(
            out,
            widths.table_index_size(TableKind::MethodDef),
            self.method_list,
        )
    }
}

#[derive(Debug, Clone)]
pub struct MethodDefRow {
    pub rva: u32,
    pub impl_flags: u16,
    pub flags: u16,
    pub name: StringIndex,
    pub signature: BlobIndex,
    pub param_list: u32,
}

impl MethodDefRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<MethodDefRow> {
        Ok(MethodDefRow {
            rva: cursor.read_u32::<LittleEndian>()?,
            impl_flags: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            signature: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
            param_list: read_table_index(cursor, widths.table_index_size(TableKind::Param))?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        out.write_u32::<LittleEndian>(self.rva)?;
        out.write_u16::<LittleEndian>(self.impl_flags)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.signature.write(out, widths.heap_sizes.blob_size())?;
        write_table_index(out, widths.table_index_size(TableKind::Param), self.param_list)
    }
}

#[derive(Debug, Clone)]
pub struct MemberRefRow {
    pub class: (TableKind, u32),
    pub name: StringIndex,
    pub signature: BlobIndex,
}

impl MemberRefRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<MemberRefRow> {
        let tag = CodedIndexTag::MemberRefParent;
        Ok(MemberRefRow {
            class: tag.read(cursor, widths.coded_index_size(tag))?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            signature: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        let tag = CodedIndexTag::MemberRefParent;
        tag.write(out, widths.coded_index_size(tag), self.class.0, self.class.1)?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.signature.write(out, widths.heap_sizes.blob_size())
    }
}

/// A `CustomAttribute` row. `parent` doubles as the table's sort key
/// (II.22.10 — the table is sorted by `Parent`'s coded-index value).
#[derive(Debug, Clone)]
pub struct CustomAttributeRow {
    pub parent: (TableKind, u32),
    pub attr_type: (TableKind, u32),
    pub value: BlobIndex,
}

impl CustomAttributeRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<CustomAttributeRow> {
        let parent_tag = CodedIndexTag::HasCustomAttribute;
        let type_tag = CodedIndexTag::CustomAttributeType;
        Ok(CustomAttributeRow {
            parent: parent_tag.read(cursor, widths.coded_index_size(parent_tag))?,
            attr_type: type_tag.read(cursor, widths.coded_index_size(type_tag))?,
            value: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        let parent_tag = CodedIndexTag::HasCustomAttribute;
        let type_tag = CodedIndexTag::CustomAttributeType;
        parent_tag.write(
            out,
            widths.coded_index_size(parent_tag),
            self.parent.0,
            self.parent.1,
        )?;
        type_tag.write(
            out,
            widths.coded_index_size(type_tag),
            self.attr_type.0,
            self.attr_type.1,
        )?;
        self.value.write(out, widths.heap_sizes.blob_size())
    }

    /// Sort key used to keep the table in `Parent` order after insertion
    /// (II.22.10, the `Sorted` bit for this table).
    pub fn sort_key(&self, tag: CodedIndexTag) -> Result<u32> {
        tag.encode(self.parent.0, self.parent.1)
    }
}

#[derive(Debug, Clone)]
pub struct AssemblyRow {
    pub hash_alg_id: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    pub revision_number: u16,
    pub flags: u32,
    pub public_key: BlobIndex,
    pub name: StringIndex,
    pub culture: StringIndex,
}

impl AssemblyRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<AssemblyRow> {
        Ok(AssemblyRow {
            hash_alg_id: cursor.read_u32::<LittleEndian>()?,
            major_version: cursor.read_u16::<LittleEndian>()?,
            minor_version: cursor.read_u16::<LittleEndian>()?,
            build_number: cursor.read_u16::<LittleEndian>()?,
            revision_number: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            public_key: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            culture: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        out.write_u32::<LittleEndian>(self.hash_alg_id)?;
        out.write_u16::<LittleEndian>(self.major_version)?;
        out.write_u16::<LittleEndian>(self.minor_version)?;
        out.write_u16::<LittleEndian>(self.build_number)?;
        out.write_u16::<LittleEndian>(self.revision_number)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        self.public_key.write(out, widths.heap_sizes.blob_size())?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.culture.write(out, widths.heap_sizes.string_size())
    }
}

#[derive(Debug, Clone)]
pub struct AssemblyRefRow {
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    pub revision_number: u16,
    pub flags: u32,
    pub public_key_or_token: BlobIndex,
    pub name: StringIndex,
    pub culture: StringIndex,
    pub hash_value: BlobIndex,
}

impl AssemblyRefRow {
    pub fn read(cursor: &mut Cursor<&[u8]>, widths: &Widths) -> Result<AssemblyRefRow> {
        Ok(AssemblyRefRow {
            major_version: cursor.read_u16::<LittleEndian>()?,
            minor_version: cursor.read_u16::<LittleEndian>()?,
            build_number: cursor.read_u16::<LittleEndian>()?,
            revision_number: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            public_key_or_token: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
            name: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            culture: StringIndex::read(cursor, widths.heap_sizes.string_size())?,
            hash_value: BlobIndex::read(cursor, widths.heap_sizes.blob_size())?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, widths: &Widths) -> Result<()> {
        out.write_u16::<LittleEndian>(self.major_version)?;
        out.write_u16::<LittleEndian>(self.minor_version)?;
        out.write_u16::<LittleEndian>(self.build_number)?;
        out.write_u16::<LittleEndian>(self.revision_number)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        self.public_key_or_token
            .write(out, widths.heap_sizes.blob_size())?;
        self.name.write(out, widths.heap_sizes.string_size())?;
        self.culture.write(out, widths.heap_sizes.string_size())?;
        self.hash_value.write(out, widths.heap_sizes.blob_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::index::HeapSizes;
    use std::collections::HashMap;

    fn widths() -> Widths {
        Widths::new(HeapSizes::default(), HashMap::new())
    }

    #[test]
    fn assembly_ref_row_round_trips() {
        let widths = widths();
        let row = AssemblyRefRow {
            major_version: 4,
            minor_version: 0,
            build_number: 0,
            revision_number: 0,
            flags: 0,
            public_key_or_token: BlobIndex(12),
            name: StringIndex(34),
            culture: StringIndex(0),
            hash_value: BlobIndex(0),
        };
        let mut buf = Vec::new();
        row.write(&mut buf, &widths).unwrap();
        let slice: &[u8] = &buf;
        let mut cursor = Cursor::new(slice);
        let decoded = AssemblyRefRow::read(&mut cursor, &widths).unwrap();
        assert_eq!(decoded.name, row.name);
        assert_eq!(decoded.public_key_or_token, row.public_key_or_token);
    }

    #[test]
    fn type_def_row_round_trips_with_table_indices() {
        let widths = widths();
        let row = TypeDefRow {
            flags: 0x1,
            name: StringIndex(5),
            namespace: StringIndex(0),
            extends: (TableKind::TypeRef, 3),
            field_list: 1,
            method_list: 2,
        };
        let mut buf = Vec::new();
        row.write(&mut buf, &widths).unwrap();
        let slice: &[u8] = &buf;
        let mut cursor = Cursor::new(slice);
        let decoded = TypeDefRow::read(&mut cursor, &widths).unwrap();
        assert_eq!(decoded.extends, row.extends);
        assert_eq!(decoded.field_list, 1);
        assert_eq!(decoded.method_list, 2);
    }
}
