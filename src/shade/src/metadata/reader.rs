//! C2 — the metadata reader: `#~`/`#-` table-heap header, per-table row
//! counts, and typed row access for the eight supported tables.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

use crate::error::{Result, ShadeError};
use crate::metadata::index::HeapSizes;
use crate::metadata::kind::TableKind;
use crate::metadata::rows::{
    AssemblyRefRow, AssemblyRow, CustomAttributeRow, MemberRefRow, MethodDefRow, ModuleRow,
    TypeDefRow, TypeRefRow,
};
use crate::metadata::schema::Widths;
use crate::metadata::streams::Streams;

/// Parsed `#~`/`#-` stream: per-table row counts and the raw row bytes for
/// every present table, in its active index widths.
#[derive(Debug, Clone)]
pub struct MetadataReader {
    pub major_version: u8,
    pub minor_version: u8,
    pub valid: u64,
    pub sorted: u64,
    pub widths: Widths,
    table_rows: HashMap<TableKind, Vec<Vec<u8>>>,
    /// Byte offset of each present table's row data, relative to the start
    /// of the `#~`/`#-` stream — used to locate a row's absolute file
    /// offset for in-place patching (§4.7 `InPlacePatch`).
    table_data_offsets: HashMap<TableKind, usize>,
}

impl MetadataReader {
    pub fn parse(tables_heap: &[u8]) -> Result<MetadataReader> {
        let mut cursor = Cursor::new(tables_heap);
        let _reserved0 = cursor.read_u32::<LittleEndian>()?;
        let major_version = cursor.read_u8()?;
        let minor_version = cursor.read_u8()?;
        let heap_sizes = HeapSizes::from_byte(cursor.read_u8()?);
        let _reserved1 = cursor.read_u8()?;
        let valid = cursor.read_u64::<LittleEndian>()?;
        let sorted = cursor.read_u64::<LittleEndian>()?;

        let present: Vec<TableKind> = TableKind::ALL
            .iter()
            .copied()
            .filter(|k| valid & (1u64 << k.as_number()) != 0)
            .collect();

        let mut row_counts = HashMap::new();
        for &kind in &present {
            let count = cursor.read_u32::<LittleEndian>()?;
            row_counts.insert(kind, count);
        }

        let widths = Widths::new(heap_sizes, row_counts.clone());

        let mut table_rows = HashMap::new();
        let mut table_data_offsets = HashMap::new();
        for &kind in &present {
            table_data_offsets.insert(kind, cursor.position() as usize);
            let count = row_counts[&kind] as usize;
            let row_size = widths.row_size(kind);
            let mut rows = Vec::with_capacity(count);
            for _ in 0..count {
                let pos = cursor.position() as usize;
                let row = tables_heap
                    .get(pos..pos + row_size)
                    .ok_or_else(|| {
                        ShadeError::InvalidImage(format!("{:?} row data truncated", kind))
                    })?
                    .to_vec();
                cursor.set_position((pos + row_size) as u64);
                rows.push(row);
            }
            table_rows.insert(kind, rows);
        }

        log::debug!(
            "parsed table heap: {} present tables, string heap is {}-byte, blob heap is {}-byte",
            present.len(),
            widths.heap_sizes.string_size(),
            widths.heap_sizes.blob_size()
        );

        Ok(MetadataReader {
            major_version,
            minor_version,
            valid,
            sorted,
            widths,
            table_rows,
            table_data_offsets,
        })
    }

    pub fn row_count(&self, kind: TableKind) -> u32 {
        self.widths.row_count(kind)
    }

    /// Byte offset of `rid`'s row (1-based), relative to the start of the
    /// `#~`/`#-` stream. Used only for in-place patching, where widths
    /// cannot have changed.
    pub fn row_offset(&self, kind: TableKind, rid: u32) -> Option<usize> {
        let base = *self.table_data_offsets.get(&kind)?;
        let row_size = self.widths.row_size(kind);
        Some(base + (rid as usize - 1) * row_size)
    }

    /// Byte offset where `kind`'s row data begins, relative to the start
    /// of the `#~`/`#-` stream. `None` if the table is absent.
    pub fn table_offset(&self, kind: TableKind) -> Option<usize> {
        self.table_data_offsets.get(&kind).copied()
    }

    fn rows_of(&self, kind: TableKind) -> &[Vec<u8>] {
        self.table_rows
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn decode_rows<T>(
        &self,
        kind: TableKind,
        decode: impl Fn(&mut Cursor<&[u8]>, &Widths) -> Result<T>,
    ) -> Result<Vec<T>> {
        self.rows_of(kind)
            .iter()
            .map(|raw| {
                let slice: &[u8] = raw;
                let mut cursor = Cursor::new(slice);
                decode(&mut cursor, &self.widths)
            })
            .collect()
    }

    pub fn module_row(&self) -> Result<Option<ModuleRow>> {
        Ok(self.decode_rows(TableKind::Module, ModuleRow::read)?.into_iter().next())
    }

    pub fn type_ref_rows(&self) -> Result<Vec<TypeRefRow>> {
        self.decode_rows(TableKind::TypeRef, TypeRefRow::read)
    }

    pub fn type_def_rows(&self) -> Result<Vec<TypeDefRow>> {
        self.decode_rows(TableKind::TypeDef, TypeDefRow::read)
    }

    pub fn method_def_rows(&self) -> Result<Vec<MethodDefRow>> {
        self.decode_rows(TableKind::MethodDef, MethodDefRow::read)
    }

    pub fn member_ref_rows(&self) -> Result<Vec<MemberRefRow>> {
        self.decode_rows(TableKind::MemberRef, MemberRefRow::read)
    }

    pub fn custom_attribute_rows(&self) -> Result<Vec<CustomAttributeRow>> {
        self.decode_rows(TableKind::CustomAttribute, CustomAttributeRow::read)
    }

    pub fn assembly_row(&self) -> Result<Option<AssemblyRow>> {
        Ok(self
            .decode_rows(TableKind::Assembly, AssemblyRow::read)?
            .into_iter()
            .next())
    }

    pub fn assembly_ref_rows(&self) -> Result<Vec<AssemblyRefRow>> {
        self.decode_rows(TableKind::AssemblyRef, AssemblyRefRow::read)
    }

    /// Row size in bytes for any present table, including the ones this
    /// core never decodes into a typed row — needed so a rebuild can copy
    /// their raw rows forward unchanged.
    pub fn raw_rows(&self, kind: TableKind) -> &[Vec<u8>] {
        self.rows_of(kind)
    }

    /// Finds the 1-based rid of an `AssemblyRef` row by name, used to
    /// retarget `MemberRef`/`TypeRef` resolution scopes (§4.4 `FindAssemblyRef`).
    pub fn find_assembly_ref(&self, streams: &Streams, name: &str) -> Result<Option<u32>> {
        for (i, row) in self.assembly_ref_rows()?.iter().enumerate() {
            if streams.get_string(row.name)? == name {
                return Ok(Some(i as u32 + 1));
            }
        }
        Ok(None)
    }

    /// Finds the 1-based rid of a `TypeRef` row by namespace and name
    /// (§4.4 `FindTypeRef`).
    pub fn find_type_ref(
        &self,
        streams: &Streams,
        namespace: &str,
        name: &str,
    ) -> Result<Option<u32>> {
        for (i, row) in self.type_ref_rows()?.iter().enumerate() {
            if streams.get_string(row.namespace)? == namespace
                && streams.get_string(row.name)? == name
            {
                return Ok(Some(i as u32 + 1));
            }
        }
        Ok(None)
    }

    /// Finds the 1-based rid of a `MemberRef` row by name under a given
    /// parent coded index (§4.4 `FindMemberRef`).
    pub fn find_member_ref(
        &self,
        streams: &Streams,
        class: (TableKind, u32),
        name: &str,
    ) -> Result<Option<u32>> {
        for (i, row) in self.member_ref_rows()?.iter().enumerate() {
            if row.class == class && streams.get_string(row.name)? == name {
                return Ok(Some(i as u32 + 1));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_heap() -> Vec<u8> {
        // One Module row only: Valid bit 0 set, row count 1.
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.push(2); // major
        buf.push(0); // minor
        buf.push(0); // heap sizes: all small
        buf.push(1); // reserved
        buf.extend_from_slice(&1u64.to_le_bytes()); // Valid: bit 0 (Module)
        buf.extend_from_slice(&0u64.to_le_bytes()); // Sorted
        buf.extend_from_slice(&1u32.to_le_bytes()); // Module row count
        // Module row: Generation(u16) Name(u16) Mvid(u16) EncId(u16) EncBaseId(u16)
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf
    }

    #[test]
    fn parses_single_module_row() {
        let heap = sample_heap();
        let reader = MetadataReader::parse(&heap).unwrap();
        assert_eq!(reader.row_count(TableKind::Module), 1);
        let module = reader.module_row().unwrap().unwrap();
        assert_eq!(module.name.0, 5);
    }

    #[test]
    fn absent_table_yields_empty_rows() {
        let heap = sample_heap();
        let reader = MetadataReader::parse(&heap).unwrap();
        assert!(reader.assembly_ref_rows().unwrap().is_empty());
    }
}
