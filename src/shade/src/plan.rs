//! C5 — the modification plan: accumulates row edits and heap additions,
//! then classifies the edit into an output strategy (§4.5).

use std::collections::HashMap;

use crate::error::{Result, ShadeError};
use crate::metadata::{
    compressed_length_size, AssemblyFlags, AssemblyRefRow, AssemblyRow, BlobIndex,
    CustomAttributeRow, MemberRefRow, MetadataReader, StringIndex, TableKind, TypeAttributes,
    TypeDefRow, TypeRefRow,
};
use crate::pe::SectionHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStrategy {
    InPlacePatch,
    MetadataRebuildInPlace,
    MetadataRebuildGrowing,
}

/// Accumulated intent for one `Open → mutate → Save` sequence. Newly
/// allocated string/blob indices are virtual — they point past the heap's
/// current end and are only materialized by the metadata writer.
#[derive(Debug, Default)]
pub struct ModificationPlan {
    modified_assembly: HashMap<u32, AssemblyRow>,
    modified_assembly_ref: HashMap<u32, AssemblyRefRow>,
    modified_type_def: HashMap<u32, TypeDefRow>,
    new_custom_attributes: Vec<CustomAttributeRow>,
    new_type_refs: Vec<TypeRefRow>,
    new_member_refs: Vec<MemberRefRow>,
    new_strings: Vec<(String, StringIndex)>,
    new_blobs: Vec<(Vec<u8>, BlobIndex)>,
    next_string_index: u32,
    next_blob_index: u32,
}

impl ModificationPlan {
    pub fn new(original_string_heap_len: u32, original_blob_heap_len: u32) -> ModificationPlan {
        ModificationPlan {
            next_string_index: original_string_heap_len,
            next_blob_index: original_blob_heap_len,
            ..Default::default()
        }
    }

    // --- heap additions -------------------------------------------------

    /// `GetOrAddString`: returns the existing virtual index if `s` was
    /// already added this session, otherwise allocates a new one. Never
    /// deduplicates against the source heap (§3 "the string heap
    /// deduplicates only within added strings").
    pub fn get_or_add_string(&mut self, s: &str) -> StringIndex {
        if s.is_empty() {
            return StringIndex(0);
        }
        if let Some((_, idx)) = self.new_strings.iter().find(|(existing, _)| existing == s) {
            return *idx;
        }
        let index = StringIndex(self.next_string_index);
        self.next_string_index += s.len() as u32 + 1;
        self.new_strings.push((s.to_string(), index));
        index
    }

    pub fn get_or_add_blob(&mut self, b: &[u8]) -> BlobIndex {
        if b.is_empty() {
            return BlobIndex(0);
        }
        let index = BlobIndex(self.next_blob_index);
        self.next_blob_index += compressed_length_size(b.len()) as u32 + b.len() as u32;
        self.new_blobs.push((b.to_vec(), index));
        index
    }

    pub fn new_strings(&self) -> &[(String, StringIndex)] {
        &self.new_strings
    }

    pub fn new_blobs(&self) -> &[(Vec<u8>, BlobIndex)] {
        &self.new_blobs
    }

    // --- row accessors: modified if present, else original --------------

    pub fn assembly_row(&self, reader: &MetadataReader, rid: u32) -> Result<Option<AssemblyRow>> {
        if let Some(row) = self.modified_assembly.get(&rid) {
            return Ok(Some(row.clone()));
        }
        if rid != 1 {
            return Ok(None);
        }
        reader.assembly_row()
    }

    pub fn assembly_ref_row(
        &self,
        reader: &MetadataReader,
        rid: u32,
    ) -> Result<Option<AssemblyRefRow>> {
        if let Some(row) = self.modified_assembly_ref.get(&rid) {
            return Ok(Some(row.clone()));
        }
        reader.assembly_ref_rows().map(|rows| rows.get(rid as usize - 1).cloned())
    }

    pub fn type_def_row(&self, reader: &MetadataReader, rid: u32) -> Result<Option<TypeDefRow>> {
        if let Some(row) = self.modified_type_def.get(&rid) {
            return Ok(Some(row.clone()));
        }
        reader.type_def_rows().map(|rows| rows.get(rid as usize - 1).cloned())
    }

    pub fn modified_assembly(&self) -> &HashMap<u32, AssemblyRow> {
        &self.modified_assembly
    }

    pub fn modified_assembly_ref(&self) -> &HashMap<u32, AssemblyRefRow> {
        &self.modified_assembly_ref
    }

    pub fn modified_type_def(&self) -> &HashMap<u32, TypeDefRow> {
        &self.modified_type_def
    }

    pub fn new_custom_attributes(&self) -> &[CustomAttributeRow] {
        &self.new_custom_attributes
    }

    pub fn new_type_refs(&self) -> &[TypeRefRow] {
        &self.new_type_refs
    }

    pub fn new_member_refs(&self) -> &[MemberRefRow] {
        &self.new_member_refs
    }

    // --- mutation API -----------------------------------------------------

    pub fn set_assembly_name(&mut self, reader: &MetadataReader, name: &str) -> Result<()> {
        let mut row = self
            .assembly_row(reader, 1)?
            .ok_or_else(|| ShadeError::InvalidImage("no Assembly row at rid 1".into()))?;
        row.name = self.get_or_add_string(name);
        self.modified_assembly.insert(1, row);
        Ok(())
    }

    pub fn set_assembly_public_key(&mut self, reader: &MetadataReader, key: &[u8]) -> Result<()> {
        let mut row = self
            .assembly_row(reader, 1)?
            .ok_or_else(|| ShadeError::InvalidImage("no Assembly row at rid 1".into()))?;
        row.public_key = self.get_or_add_blob(key);
        row.flags = if key.is_empty() {
            row.flags & !AssemblyFlags::PUBLIC_KEY
        } else {
            row.flags | AssemblyFlags::PUBLIC_KEY
        };
        self.modified_assembly.insert(1, row);
        Ok(())
    }

    pub fn clear_strong_name(&mut self, reader: &MetadataReader) -> Result<()> {
        self.set_assembly_public_key(reader, &[])
    }

    /// Returns `false` (no state changed) if no `AssemblyRef` named
    /// `source_name` exists.
    pub fn redirect_assembly_ref(
        &mut self,
        reader: &MetadataReader,
        streams: &crate::metadata::Streams,
        source_name: &str,
        target_name: &str,
        token: Option<&[u8]>,
    ) -> Result<bool> {
        let rid = match reader.find_assembly_ref(streams, source_name)? {
            Some(rid) => rid,
            None => return Ok(false),
        };
        let mut row = self
            .assembly_ref_row(reader, rid)?
            .ok_or_else(|| ShadeError::InvalidImage("dangling AssemblyRef rid".into()))?;
        row.name = self.get_or_add_string(target_name);
        if let Some(token) = token {
            row.public_key_or_token = self.get_or_add_blob(token);
        }
        self.modified_assembly_ref.insert(rid, row);
        Ok(true)
    }

    /// Flips every currently-public `TypeDef` to `NotPublic` (§4.9).
    pub fn make_types_internal(&mut self, reader: &MetadataReader) -> Result<()> {
        let count = reader.row_count(TableKind::TypeDef);
        for rid in 1..=count {
            let mut row = self
                .type_def_row(reader, rid)?
                .expect("rid within row_count always resolves");
            if TypeAttributes(row.flags).is_public() {
                row.flags = TypeAttributes(row.flags).make_internal().0;
                self.modified_type_def.insert(rid, row);
            }
        }
        Ok(())
    }

    /// Returns the assigned rid: `existingCount + currentNewCount` (§4.5).
    pub fn add_type_ref(&mut self, reader: &MetadataReader, row: TypeRefRow) -> u32 {
        let rid = reader.row_count(TableKind::TypeRef) + self.new_type_refs.len() as u32 + 1;
        self.new_type_refs.push(row);
        rid
    }

    pub fn add_member_ref(&mut self, reader: &MetadataReader, row: MemberRefRow) -> u32 {
        let rid = reader.row_count(TableKind::MemberRef) + self.new_member_refs.len() as u32 + 1;
        self.new_member_refs.push(row);
        rid
    }

    pub fn add_custom_attribute(&mut self, row: CustomAttributeRow) {
        self.new_custom_attributes.push(row);
    }

    // --- sizing and strategy --------------------------------------------

    fn new_row_count(&self, kind: TableKind) -> u32 {
        match kind {
            TableKind::TypeRef => self.new_type_refs.len() as u32,
            TableKind::MemberRef => self.new_member_refs.len() as u32,
            TableKind::CustomAttribute => self.new_custom_attributes.len() as u32,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_strings.is_empty()
            && self.new_blobs.is_empty()
            && self.new_type_refs.is_empty()
            && self.new_member_refs.is_empty()
            && self.new_custom_attributes.is_empty()
    }

    pub fn estimate_new_metadata_size(
        &self,
        reader: &MetadataReader,
        original_metadata_size: usize,
    ) -> usize {
        let strings_growth: usize = self.new_strings.iter().map(|(s, _)| s.len() + 1).sum();
        let blobs_growth: usize = self.new_blobs.iter().map(|(b, _)| b.len() + 4).sum();
        let rows_growth: usize = [
            TableKind::TypeRef,
            TableKind::MemberRef,
            TableKind::CustomAttribute,
        ]
        .iter()
        .map(|&kind| self.new_row_count(kind) as usize * reader.widths.row_size(kind))
        .sum();
        original_metadata_size + strings_growth + blobs_growth + rows_growth
    }

    /// The index widths the writer must use, never narrower than the
    /// source (§3 "Index widths MUST NOT shrink").
    pub fn final_string_index_size(&self, reader: &MetadataReader) -> u8 {
        let required = if self.next_string_index >= 0x1_0000 { 4 } else { 2 };
        reader.widths.heap_sizes.string_size().max(required)
    }

    pub fn final_blob_index_size(&self, reader: &MetadataReader) -> u8 {
        let required = if self.next_blob_index >= 0x1_0000 { 4 } else { 2 };
        reader.widths.heap_sizes.blob_size().max(required)
    }

    pub fn final_guid_index_size(&self, reader: &MetadataReader) -> u8 {
        reader.widths.heap_sizes.guid_size()
    }

    pub fn strategy(
        &self,
        reader: &MetadataReader,
        metadata_section: &SectionHeader,
        metadata_rva: u32,
        original_metadata_size: usize,
    ) -> OutputStrategy {
        if self.is_empty() {
            return OutputStrategy::InPlacePatch;
        }
        let estimated = self.estimate_new_metadata_size(reader, original_metadata_size);
        let available = metadata_section.size_of_raw_data as usize
            - (metadata_rva - metadata_section.virtual_address) as usize
            - original_metadata_size;
        if estimated <= original_metadata_size + available {
            OutputStrategy::MetadataRebuildInPlace
        } else {
            OutputStrategy::MetadataRebuildGrowing
        }
    }
}
