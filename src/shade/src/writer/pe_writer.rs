//! C7 — the PE writer: dispatches on the plan's output strategy (§4.7).

use crate::error::Result;
use crate::metadata::{MetadataReader, MetadataRoot, Streams, TableKind, Widths};
use crate::pe::{directory, PeReader, SectionHeader};
use crate::plan::{ModificationPlan, OutputStrategy};
use crate::writer::metadata_writer;

fn align_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

pub fn write(
    pe: &PeReader,
    root: &MetadataRoot,
    reader: &MetadataReader,
    streams: &Streams,
    plan: &ModificationPlan,
) -> Result<Vec<u8>> {
    let metadata_section = pe
        .section_for_rva(pe.cli_header.metadata.rva)
        .cloned()
        .ok_or_else(|| {
            crate::error::ShadeError::InvalidImage("metadata RVA resolves to no section".into())
        })?;
    let original_metadata_size = pe.cli_header.metadata.size as usize;
    let strategy = plan.strategy(
        reader,
        &metadata_section,
        pe.cli_header.metadata.rva,
        original_metadata_size,
    );

    log::debug!("output strategy: {:?}", strategy);

    match strategy {
        OutputStrategy::InPlacePatch => in_place_patch(pe, root, reader, plan),
        _ => rebuild(pe, root, reader, streams, plan, &metadata_section),
    }
}

/// Serializes only the modified Assembly/AssemblyRef/TypeDef rows at their
/// original offsets, with no other byte touched.
fn in_place_patch(
    pe: &PeReader,
    root: &MetadataRoot,
    reader: &MetadataReader,
    plan: &ModificationPlan,
) -> Result<Vec<u8>> {
    let mut out = pe.bytes().to_vec();
    let metadata_file_offset = pe.resolve_rva(pe.cli_header.metadata.rva)?;
    let heap_stream = root
        .stream("#~")
        .or_else(|| root.stream("#-"))
        .ok_or_else(|| crate::error::ShadeError::InvalidImage("no table heap stream".into()))?;
    let table_heap_file_offset = metadata_file_offset + heap_stream.offset as usize;

    for (&rid, row) in plan.modified_assembly() {
        patch_row(&mut out, reader, table_heap_file_offset, TableKind::Assembly, rid, |buf, w| {
            row.write(buf, w)
        })?;
    }
    for (&rid, row) in plan.modified_assembly_ref() {
        patch_row(&mut out, reader, table_heap_file_offset, TableKind::AssemblyRef, rid, |buf, w| {
            row.write(buf, w)
        })?;
    }
    for (&rid, row) in plan.modified_type_def() {
        patch_row(&mut out, reader, table_heap_file_offset, TableKind::TypeDef, rid, |buf, w| {
            row.write(buf, w)
        })?;
    }
    Ok(out)
}

fn patch_row(
    out: &mut [u8],
    reader: &MetadataReader,
    table_heap_file_offset: usize,
    kind: TableKind,
    rid: u32,
    write_row: impl Fn(&mut Vec<u8>, &crate::metadata::Widths) -> Result<()>,
) -> Result<()> {
    let offset = reader
        .row_offset(kind, rid)
        .ok_or_else(|| crate::error::ShadeError::InvalidImage(format!("no row offset for {:?}", kind)))?;
    let absolute = table_heap_file_offset + offset;
    let mut buf = Vec::new();
    write_row(&mut buf, &reader.widths)?;
    out[absolute..absolute + buf.len()].copy_from_slice(&buf);
    Ok(())
}

struct ShiftPlan {
    metadata_rva: u32,
    old_metadata_rva_end: u32,
    size_diff: i64,
    va_shift: i64,
    section_va: u32,
    section_virtual_size: u32,
    next_section_old_va: Option<u32>,
}

impl ShiftPlan {
    /// New RVA for a value that may have lived past the old metadata end
    /// inside the grown section, or in any later section (§4.7e/f/g).
    fn shift_rva(&self, rva: u32) -> u32 {
        if rva == 0 {
            return 0;
        }
        if rva >= self.section_va && rva < self.section_va + self.section_virtual_size {
            if rva >= self.old_metadata_rva_end {
                return (rva as i64 + self.size_diff) as u32;
            }
            return rva;
        }
        if let Some(next_va) = self.next_section_old_va {
            if rva >= next_va && self.va_shift > 0 {
                return (rva as i64 + self.va_shift) as u32;
            }
        }
        rva
    }

    fn in_shifted_region(&self, rva: u32) -> bool {
        rva != 0
            && rva >= self.section_va
            && rva < self.section_va + self.section_virtual_size
            && rva >= self.old_metadata_rva_end
    }
}

fn rebuild(
    pe: &PeReader,
    root: &MetadataRoot,
    reader: &MetadataReader,
    streams: &Streams,
    plan: &ModificationPlan,
    metadata_section: &SectionHeader,
) -> Result<Vec<u8>> {
    let (new_md, new_widths) = metadata_writer::emit(root, reader, streams, plan)?;
    let old_md_size = pe.cli_header.metadata.size as usize;
    let new_md_size = new_md.len();
    let size_diff = new_md_size as i64 - old_md_size as i64;

    let metadata_rva = pe.cli_header.metadata.rva;
    let metadata_file_offset = pe.resolve_rva(metadata_rva)?;

    let s = metadata_section;
    let old_raw_size = s.size_of_raw_data;
    let new_virtual_size_signed = s.virtual_size as i64 + size_diff;
    let (new_raw_size, raw_size_diff): (u32, i64) = if new_virtual_size_signed <= old_raw_size as i64 {
        (old_raw_size, 0)
    } else {
        let nrs = align_up(new_virtual_size_signed as u32, pe.file_alignment());
        (nrs, nrs as i64 - old_raw_size as i64)
    };
    let new_virtual_size = new_virtual_size_signed.max(0) as u32;

    let va_shift: i64 = if raw_size_diff > 0 {
        let old_end = align_up(s.virtual_address + s.virtual_size, pe.section_alignment());
        let new_end = align_up((s.virtual_address as i64 + s.virtual_size as i64 + size_diff) as u32, pe.section_alignment());
        new_end as i64 - old_end as i64
    } else {
        0
    };

    let next_section_old_va = pe
        .sections
        .iter()
        .map(|sec| sec.virtual_address)
        .filter(|&va| va > s.virtual_address)
        .min();

    let shift = ShiftPlan {
        metadata_rva,
        old_metadata_rva_end: metadata_rva + old_md_size as u32,
        size_diff,
        va_shift,
        section_va: s.virtual_address,
        section_virtual_size: s.virtual_size,
        next_section_old_va,
    };

    // --- layout -----------------------------------------------------------
    let mut out = Vec::with_capacity(pe.bytes().len() + new_md_size.saturating_sub(old_md_size));
    out.extend_from_slice(&pe.bytes()[..pe.first_section_file_offset()]);

    let s_index = pe
        .sections
        .iter()
        .position(|sec| sec.virtual_address == s.virtual_address)
        .expect("metadata_section came from pe.sections");

    for (i, sec) in pe.sections.iter().enumerate() {
        let new_file_offset = if sec.pointer_to_raw_data > s.pointer_to_raw_data {
            sec.pointer_to_raw_data as i64 + raw_size_diff
        } else {
            sec.pointer_to_raw_data as i64
        } as usize;
        while out.len() < new_file_offset {
            out.push(0);
        }

        if i == s_index {
            let pre = &pe.bytes()[sec.pointer_to_raw_data as usize..metadata_file_offset];
            let post_start = metadata_file_offset + old_md_size;
            let section_end = (sec.pointer_to_raw_data + sec.size_of_raw_data) as usize;
            let post = pe.bytes().get(post_start..section_end).unwrap_or(&[]);
            out.extend_from_slice(pre);
            out.extend_from_slice(&new_md);
            out.extend_from_slice(post);
            while out.len() < new_file_offset + new_raw_size as usize {
                out.push(0);
            }
        } else {
            let start = sec.pointer_to_raw_data as usize;
            let end = start + sec.size_of_raw_data as usize;
            out.extend_from_slice(&pe.bytes()[start..end]);
        }
    }

    // --- header patches -----------------------------------------------------

    // a. CLI header metadata.Size
    write_u32(
        &mut out,
        pe.cli_header_file_offset() + crate::pe::CliHeader::METADATA_OFFSET + 4,
        new_md_size as u32,
    );

    // b. section header for S
    let s_header_offset = pe.section_header_file_offset(s_index);
    write_u32(&mut out, s_header_offset + 8, new_virtual_size);
    write_u32(&mut out, s_header_offset + 16, new_raw_size);

    // c. every other section
    for (i, sec) in pe.sections.iter().enumerate() {
        if i == s_index {
            continue;
        }
        let header_offset = pe.section_header_file_offset(i);
        if sec.virtual_address > s.virtual_address && va_shift > 0 {
            let new_va = (sec.virtual_address as i64 + va_shift) as u32;
            write_u32(&mut out, header_offset + 12, new_va);
        }
        if raw_size_diff != 0 && sec.pointer_to_raw_data > s.pointer_to_raw_data {
            let new_ptr = (sec.pointer_to_raw_data as i64 + raw_size_diff) as u32;
            write_u32(&mut out, header_offset + 20, new_ptr);
        }
    }

    // d. SizeOfImage + Resource/BaseRelocation directories
    if va_shift > 0 {
        let size_of_image = (pe.optional.size_of_image as i64 + va_shift) as u32;
        write_u32(&mut out, pe.optional_header_file_offset() + 56, size_of_image);

        for idx in [directory::RESOURCE_TABLE, directory::BASE_RELOCATION_TABLE] {
            let dir = pe.optional.directory(idx);
            if let Some(next_va) = shift.next_section_old_va {
                if dir.is_present() && dir.rva >= next_va {
                    let dir_offset = pe.data_directories_file_offset() + idx * 8;
                    write_u32(&mut out, dir_offset, dir.rva + va_shift as u32);
                }
            }
        }
    }

    // e. all 16 data directories (generic rule; directories with special
    // handling below are simply patched twice with the same value).
    for idx in 0..directory::COUNT {
        let dir = pe.optional.directory(idx);
        if shift.in_shifted_region(dir.rva) {
            let dir_offset = pe.data_directories_file_offset() + idx * 8;
            let new_rva = shift.shift_rva(dir.rva);
            log::trace!("data directory {idx}: rva 0x{:x} -> 0x{new_rva:x}", dir.rva);
            write_u32(&mut out, dir_offset, new_rva);
        }
    }

    // f. entry point
    let entry_offset_field = pe.optional_header_file_offset() + 16;
    let old_entry = pe.optional.address_of_entry_point;
    if shift.in_shifted_region(old_entry) {
        let new_entry = shift.shift_rva(old_entry);
        log::trace!("entry point: rva 0x{old_entry:x} -> 0x{new_entry:x}");
        write_u32(&mut out, entry_offset_field, new_entry);
        if pe.is_pe64() {
            if let Ok(file_offset) = pe.resolve_rva(new_entry) {
                if out.get(file_offset..file_offset + 2) == Some(&[0xFF, 0x25]) {
                    let disp_offset = file_offset + 2;
                    if let Some(bytes) = out.get(disp_offset..disp_offset + 4) {
                        let disp = i32::from_le_bytes(bytes.try_into().unwrap());
                        let new_disp = disp - size_diff as i32;
                        out[disp_offset..disp_offset + 4].copy_from_slice(&new_disp.to_le_bytes());
                    }
                }
            }
        }
    }

    // g. CLI header Resources / StrongName directories
    let resources = pe.cli_header.resources;
    if shift.in_shifted_region(resources.rva) {
        write_u32(
            &mut out,
            pe.cli_header_file_offset() + crate::pe::CliHeader::RESOURCES_OFFSET,
            shift.shift_rva(resources.rva),
        );
    }
    let strong_name = pe.cli_header.strong_name_signature;
    let new_strong_name_rva = if shift.in_shifted_region(strong_name.rva) {
        let shifted = shift.shift_rva(strong_name.rva);
        write_u32(
            &mut out,
            pe.cli_header_file_offset() + crate::pe::CliHeader::STRONG_NAME_OFFSET,
            shifted,
        );
        shifted
    } else {
        strong_name.rva
    };

    // h. import directory
    patch_import_directory(&mut out, pe, &shift);

    // i. debug directory
    patch_debug_directory(&mut out, pe, &shift);

    // j. base relocation table
    patch_relocations(&mut out, pe, &shift);

    // k. MethodDef RVA patch
    patch_method_def_rvas(&mut out, pe, reader, root, &new_widths, &shift)?;

    // l. zero the strong-name signature region
    if strong_name.is_present() {
        if let Ok(sig_offset) = pe.resolve_rva(new_strong_name_rva) {
            let size = strong_name.size as usize;
            if let Some(region) = out.get_mut(sig_offset..sig_offset + size) {
                region.fill(0);
            }
        }
    }

    log::debug!(
        "rebuilt image: metadata {} -> {} bytes, va_shift={}",
        old_md_size,
        new_md_size,
        va_shift
    );

    Ok(out)
}

fn write_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn patch_import_directory(out: &mut [u8], pe: &PeReader, shift: &ShiftPlan) {
    let dir = pe.optional.directory(directory::IMPORT_TABLE);
    if !dir.is_present() || !shift.in_shifted_region(dir.rva) {
        return;
    }
    let thunk_width = if pe.is_pe64() { 8usize } else { 4 };
    let Ok(mut descriptor_offset) = pe.resolve_rva(dir.rva) else { return };

    for _ in 0..100 {
        let Some(entry) = out.get(descriptor_offset..descriptor_offset + 20) else { break };
        let original_first_thunk = u32::from_le_bytes(entry[0..4].try_into().unwrap());
        let name_rva = u32::from_le_bytes(entry[12..16].try_into().unwrap());
        let first_thunk = u32::from_le_bytes(entry[16..20].try_into().unwrap());
        if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
            break;
        }

        if shift.in_shifted_region(original_first_thunk) {
            write_u32(out, descriptor_offset, shift.shift_rva(original_first_thunk));
        }
        if shift.in_shifted_region(name_rva) {
            write_u32(out, descriptor_offset + 12, shift.shift_rva(name_rva));
        }
        if shift.in_shifted_region(first_thunk) {
            write_u32(out, descriptor_offset + 16, shift.shift_rva(first_thunk));
        }

        for thunk_rva in [original_first_thunk, first_thunk] {
            if thunk_rva != 0 {
                patch_thunk_table(out, pe, shift, thunk_rva, thunk_width);
            }
        }

        descriptor_offset += 20;
    }
}

fn patch_thunk_table(out: &mut [u8], pe: &PeReader, shift: &ShiftPlan, thunk_rva: u32, width: usize) {
    let Ok(mut offset) = pe.resolve_rva(thunk_rva) else { return };
    let ordinal_flag: u64 = if width == 8 { 1 << 63 } else { 1 << 31 };

    for _ in 0..100 {
        let Some(bytes) = out.get(offset..offset + width) else { break };
        let value = if width == 8 {
            u64::from_le_bytes(bytes.try_into().unwrap())
        } else {
            u32::from_le_bytes(bytes.try_into().unwrap()) as u64
        };
        if value == 0 {
            break;
        }
        if value & ordinal_flag == 0 {
            let hint_name_rva = value as u32;
            if shift.in_shifted_region(hint_name_rva) {
                let new_rva = shift.shift_rva(hint_name_rva) as u64;
                if width == 8 {
                    out[offset..offset + 8].copy_from_slice(&new_rva.to_le_bytes());
                } else {
                    out[offset..offset + 4].copy_from_slice(&(new_rva as u32).to_le_bytes());
                }
            }
        }
        offset += width;
    }
}

fn patch_debug_directory(out: &mut [u8], pe: &PeReader, shift: &ShiftPlan) {
    let dir = pe.optional.directory(directory::DEBUG);
    if !dir.is_present() || !shift.in_shifted_region(dir.rva) {
        return;
    }
    let Ok(base) = pe.resolve_rva(dir.rva) else { return };
    let count = dir.size as usize / 28;
    for i in 0..count {
        let entry_offset = base + i * 28;
        let Some(entry) = out.get(entry_offset..entry_offset + 28) else { break };
        let address_of_raw_data = u32::from_le_bytes(entry[20..24].try_into().unwrap());
        let pointer_to_raw_data = u32::from_le_bytes(entry[24..28].try_into().unwrap());
        if shift.in_shifted_region(address_of_raw_data) {
            write_u32(out, entry_offset + 20, shift.shift_rva(address_of_raw_data));
        }
        if address_of_raw_data != 0 && shift.in_shifted_region(address_of_raw_data) {
            let new_ptr = pointer_to_raw_data as i64 + shift.size_diff;
            write_u32(out, entry_offset + 24, new_ptr as u32);
        }
    }
}

fn patch_relocations(out: &mut [u8], pe: &PeReader, shift: &ShiftPlan) {
    let dir = pe.optional.directory(directory::BASE_RELOCATION_TABLE);
    if !dir.is_present() {
        return;
    }
    let Ok(table_offset) = pe.resolve_rva(dir.rva) else { return };
    let table_end = table_offset + dir.size as usize;
    let mut offset = table_offset;

    while offset + 8 <= table_end {
        let Some(header) = out.get(offset..offset + 8) else { break };
        let page_rva = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let block_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if block_size < 8 {
            break;
        }
        let region_start = shift.section_va.max(shift.old_metadata_rva_end);
        let region_end = shift.section_va + shift.section_virtual_size;
        let overlaps = page_rva >= shift.section_va
            && page_rva < region_end
            && page_rva + 0x1000 > region_start;

        if overlaps {
            let entry_count = (block_size - 8) / 2;
            for i in 0..entry_count {
                let entry_offset = offset + 8 + i * 2;
                let Some(entry_bytes) = out.get(entry_offset..entry_offset + 2) else { break };
                let entry = u16::from_le_bytes(entry_bytes.try_into().unwrap());
                let reloc_type = entry >> 12;
                let offset_in_page = entry & 0x0FFF;
                if reloc_type == 0 {
                    continue;
                }
                let fixup_rva = page_rva + offset_in_page as u32;
                if fixup_rva >= shift.old_metadata_rva_end {
                    let new_offset = offset_in_page as i64 + shift.size_diff;
                    if (0..=0x0FFF).contains(&new_offset) {
                        let new_entry = (reloc_type << 12) | (new_offset as u16);
                        out[entry_offset..entry_offset + 2].copy_from_slice(&new_entry.to_le_bytes());
                    } else {
                        log::warn!(
                            "relocation entry at page 0x{page_rva:x}+0x{offset_in_page:x} overflows its \
                             12-bit offset after shifting by {}; left unpatched",
                            shift.size_diff
                        );
                    }
                }
            }
        }
        offset += block_size;
    }
}

fn patch_method_def_rvas(
    out: &mut [u8],
    pe: &PeReader,
    reader: &MetadataReader,
    root: &MetadataRoot,
    new_widths: &Widths,
    shift: &ShiftPlan,
) -> Result<()> {
    let row_count = reader.row_count(TableKind::MethodDef);
    if row_count == 0 {
        return Ok(());
    }
    let heap_stream = root
        .stream("#~")
        .or_else(|| root.stream("#-"))
        .ok_or_else(|| crate::error::ShadeError::InvalidImage("no table heap stream".into()))?;
    let old_table_offset_in_metadata = heap_stream.offset as usize
        + reader
            .table_offset(TableKind::MethodDef)
            .ok_or_else(|| crate::error::ShadeError::InvalidImage("no MethodDef table".into()))?;

    // TypeRef rows precede MethodDef in table-number order, so growing the
    // table shifts MethodDef's row data forward. This uses the widths
    // `emit()` actually wrote with, not the original parse-time widths —
    // TypeRef's own row size can grow too (its ResolutionScope coded index
    // crossing a width threshold as TypeRef itself gains rows), so both the
    // old and new TypeRef table sizes must be computed under their own widths.
    let old_type_ref_bytes =
        reader.row_count(TableKind::TypeRef) as usize * reader.widths.row_size(TableKind::TypeRef);
    let new_type_ref_bytes =
        new_widths.row_count(TableKind::TypeRef) as usize * new_widths.row_size(TableKind::TypeRef);
    let prelude_shift = new_type_ref_bytes as i64 - old_type_ref_bytes as i64;
    log::trace!(
        "patching {row_count} MethodDef RVAs, prelude_shift={prelude_shift}, va_shift={}",
        shift.va_shift
    );

    let s = pe.section_for_rva(shift.metadata_rva).ok_or_else(|| {
        crate::error::ShadeError::InvalidImage("metadata RVA resolves to no section".into())
    })?;
    let table_file_offset = (s.pointer_to_raw_data as i64
        + (shift.metadata_rva - s.virtual_address) as i64
        + old_table_offset_in_metadata as i64
        + prelude_shift) as usize;
    let row_size = new_widths.row_size(TableKind::MethodDef);

    for rid in 0..row_count as usize {
        let row_offset = table_file_offset + rid * row_size;
        let Some(bytes) = out.get(row_offset..row_offset + 4) else { continue };
        let rva = u32::from_le_bytes(bytes.try_into().unwrap());
        if shift.in_shifted_region(rva) {
            let new_rva = shift.shift_rva(rva);
            write_u32(out, row_offset, new_rva);
        }
    }
    Ok(())
}
