//! C6 — the metadata writer: emits a fresh metadata blob (root, stream
//! directory, heaps, table heap) from a reader and its plan (§4.6).

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;

use crate::error::{Result, ShadeError};
use crate::metadata::{
    write_compressed_length, CodedIndexTag, CustomAttributeRow, HeapSizes, MetadataReader,
    MetadataRoot, Streams, TableKind, Widths,
};
use crate::plan::ModificationPlan;

const ROOT_MAGIC: u32 = 0x4253_4A42;

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn write_aligned_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Final index widths for the rebuild: heap widths never shrink (§3), and
/// table/coded widths are recomputed against post-mutation row counts for
/// the three tables that can gain rows.
fn final_widths(reader: &MetadataReader, plan: &ModificationPlan) -> Widths {
    let heap_sizes = HeapSizes {
        large_strings: plan.final_string_index_size(reader) == 4,
        large_guids: plan.final_guid_index_size(reader) == 4,
        large_blobs: plan.final_blob_index_size(reader) == 4,
    };
    let mut row_counts = HashMap::new();
    for &kind in TableKind::ALL {
        let mut count = reader.row_count(kind);
        count += match kind {
            TableKind::TypeRef => plan.new_type_refs().len() as u32,
            TableKind::MemberRef => plan.new_member_refs().len() as u32,
            TableKind::CustomAttribute => plan.new_custom_attributes().len() as u32,
            _ => 0,
        };
        if count > 0 || reader.row_count(kind) > 0 {
            row_counts.insert(kind, count);
        }
    }
    Widths::new(heap_sizes, row_counts)
}

/// Emits the rebuilt metadata blob along with the `Widths` it was written
/// under — callers that need to locate rows inside the result (the PE
/// writer's MethodDef RVA patch) must reuse this exact instance rather than
/// recomputing one from the original reader's widths, which can disagree
/// once a table's own row size changes between source and rebuild.
pub fn emit(
    root: &MetadataRoot,
    reader: &MetadataReader,
    streams: &Streams,
    plan: &ModificationPlan,
) -> Result<(Vec<u8>, Widths)> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(ROOT_MAGIC)?;
    out.write_u16::<LittleEndian>(1)?;
    out.write_u16::<LittleEndian>(1)?;
    out.write_u32::<LittleEndian>(0)?;
    let mut version_bytes = root.version.as_bytes().to_vec();
    version_bytes.push(0);
    while version_bytes.len() % 4 != 0 {
        version_bytes.push(0);
    }
    out.write_u32::<LittleEndian>(version_bytes.len() as u32)?;
    out.extend_from_slice(&version_bytes);
    out.write_u16::<LittleEndian>(0)?; // flags
    out.write_u16::<LittleEndian>(root.streams.len() as u16)?;

    let placeholder_positions: Vec<usize> = root
        .streams
        .iter()
        .map(|stream| {
            let pos = out.len();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            write_aligned_name(&mut out, &stream.name);
            pos
        })
        .collect();

    let widths = final_widths(reader, plan);
    let mut stream_spans = Vec::with_capacity(root.streams.len());
    for stream in &root.streams {
        let data = emit_stream(&stream.name, reader, streams, plan, &widths)?;
        let offset = out.len() as u32;
        let mut data = data;
        pad4(&mut data);
        let size = data.len() as u32;
        out.extend_from_slice(&data);
        stream_spans.push((offset, size));
    }

    for (pos, (offset, size)) in placeholder_positions.into_iter().zip(stream_spans) {
        out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
        out[pos + 4..pos + 8].copy_from_slice(&size.to_le_bytes());
    }

    log::debug!("emitted metadata blob: {} bytes", out.len());
    Ok((out, widths))
}

fn emit_stream(
    name: &str,
    reader: &MetadataReader,
    streams: &Streams,
    plan: &ModificationPlan,
    widths: &Widths,
) -> Result<Vec<u8>> {
    match name {
        "#Strings" => {
            let mut data = streams.strings_bytes().to_vec();
            for (s, _) in plan.new_strings() {
                data.extend_from_slice(s.as_bytes());
                data.push(0);
            }
            Ok(data)
        }
        "#Blob" => {
            let mut data = streams.blobs_bytes().to_vec();
            for (b, _) in plan.new_blobs() {
                write_compressed_length(&mut data, b.len());
                data.extend_from_slice(b);
            }
            Ok(data)
        }
        "#GUID" => Ok(streams.guids_bytes().to_vec()),
        "#~" | "#-" => emit_table_heap(reader, plan, widths),
        _ => Ok(streams.user_strings_bytes().to_vec()),
    }
}

fn emit_table_heap(reader: &MetadataReader, plan: &ModificationPlan, widths: &Widths) -> Result<Vec<u8>> {
    let mut new_valid = reader.valid;
    for kind in [TableKind::TypeRef, TableKind::MemberRef, TableKind::CustomAttribute] {
        let added = match kind {
            TableKind::TypeRef => !plan.new_type_refs().is_empty(),
            TableKind::MemberRef => !plan.new_member_refs().is_empty(),
            TableKind::CustomAttribute => !plan.new_custom_attributes().is_empty(),
            _ => false,
        };
        if added {
            new_valid |= 1u64 << kind.as_number();
        }
    }

    let present: Vec<TableKind> = TableKind::ALL
        .iter()
        .copied()
        .filter(|k| new_valid & (1u64 << k.as_number()) != 0)
        .collect();

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(0)?;
    out.push(2);
    out.push(0);
    out.push(widths.heap_sizes.to_byte());
    out.push(1);
    out.write_u64::<LittleEndian>(new_valid)?;
    out.write_u64::<LittleEndian>(reader.sorted)?;

    for &kind in &present {
        let count = widths.row_count(kind);
        out.write_u32::<LittleEndian>(count)?;
    }

    for &kind in &present {
        write_table_rows(&mut out, kind, reader, plan, widths)?;
    }

    Ok(out)
}

fn write_table_rows(
    out: &mut Vec<u8>,
    kind: TableKind,
    reader: &MetadataReader,
    plan: &ModificationPlan,
    widths: &Widths,
) -> Result<()> {
    match kind {
        TableKind::Assembly => {
            if let Some(row) = plan.assembly_row(reader, 1)? {
                row.write(out, widths)?;
            }
        }
        TableKind::AssemblyRef => {
            for rid in 1..=reader.row_count(TableKind::AssemblyRef) {
                let row = plan.assembly_ref_row(reader, rid)?.expect("rid in range");
                row.write(out, widths)?;
            }
        }
        TableKind::TypeDef => {
            for rid in 1..=reader.row_count(TableKind::TypeDef) {
                let row = plan.type_def_row(reader, rid)?.expect("rid in range");
                row.write(out, widths)?;
            }
        }
        TableKind::TypeRef => {
            for row in reader.type_ref_rows()? {
                row.write(out, widths)?;
            }
            for row in plan.new_type_refs() {
                row.write(out, widths)?;
            }
        }
        TableKind::MemberRef => {
            for row in reader.member_ref_rows()? {
                row.write(out, widths)?;
            }
            for row in plan.new_member_refs() {
                row.write(out, widths)?;
            }
        }
        TableKind::CustomAttribute => {
            let tag = CodedIndexTag::HasCustomAttribute;
            let mut rows: Vec<CustomAttributeRow> = reader.custom_attribute_rows()?;
            rows.extend(plan.new_custom_attributes().iter().cloned());
            rows.sort_by_key(|row| row.sort_key(tag).unwrap_or(0));
            for row in &rows {
                row.write(out, widths)?;
            }
        }
        other => {
            let original_row_size = reader.widths.row_size(other);
            let final_row_size = widths.row_size(other);
            if original_row_size != final_row_size {
                return Err(ShadeError::IndexWidthGrowthUnsupported(other));
            }
            for raw in reader.raw_rows(other) {
                out.extend_from_slice(raw);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StreamHeader;

    fn empty_reader_and_root() -> (MetadataRoot, MetadataReader) {
        let mut heap = Vec::new();
        heap.extend_from_slice(&0u32.to_le_bytes());
        heap.push(2);
        heap.push(0);
        heap.push(0);
        heap.push(1);
        heap.extend_from_slice(&0u64.to_le_bytes());
        heap.extend_from_slice(&0u64.to_le_bytes());
        let reader = MetadataReader::parse(&heap).unwrap();
        let root = MetadataRoot {
            major_version: 1,
            minor_version: 1,
            version: "v4.0.30319".into(),
            streams: vec![
                StreamHeader { name: "#~".into(), offset: 0, size: 0 },
                StreamHeader { name: "#Strings".into(), offset: 0, size: 0 },
                StreamHeader { name: "#Blob".into(), offset: 0, size: 0 },
                StreamHeader { name: "#GUID".into(), offset: 0, size: 0 },
            ],
            header_len: 0,
        };
        (root, reader)
    }

    #[test]
    fn emits_bsjb_magic_and_stream_directory() {
        let (root, reader) = empty_reader_and_root();
        let streams = Streams::new(vec![0], vec![0], vec![], vec![]);
        let plan = ModificationPlan::new(1, 1);
        let (blob, _widths) = emit(&root, &reader, &streams, &plan).unwrap();
        assert_eq!(&blob[0..4], &ROOT_MAGIC.to_le_bytes());
    }

    #[test]
    fn all_stream_sizes_are_multiples_of_four() {
        let (root, reader) = empty_reader_and_root();
        let streams = Streams::new(vec![0], vec![0], vec![], vec![]);
        let plan = ModificationPlan::new(1, 1);
        let (blob, _widths) = emit(&root, &reader, &streams, &plan).unwrap();
        // Re-parse the stream directory to check each declared size.
        let version_len_pos = 8;
        let version_len =
            u32::from_le_bytes(blob[version_len_pos..version_len_pos + 4].try_into().unwrap());
        let mut pos = version_len_pos + 4 + version_len as usize;
        let _flags = u16::from_le_bytes(blob[pos..pos + 2].try_into().unwrap());
        pos += 2;
        let count = u16::from_le_bytes(blob[pos..pos + 2].try_into().unwrap());
        pos += 2;
        for _ in 0..count {
            let size = u32::from_le_bytes(blob[pos + 4..pos + 8].try_into().unwrap());
            assert_eq!(size % 4, 0);
            pos += 8;
            while blob[pos] != 0 {
                pos += 1;
            }
            pos += 1;
            while pos % 4 != 0 {
                pos += 1;
            }
        }
    }
}
