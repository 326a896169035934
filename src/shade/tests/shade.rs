//! End-to-end scenarios (spec §8) against hand-assembled synthetic images.
//! No real `.dll` fixture is available in this workspace, so each test
//! builds the smallest PE32 image that exercises the behavior in question.

use byteorder::{LittleEndian, WriteBytesExt};
use shade::{Modifier, ShadeError, TableKind};

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x2000;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// One row the fixture builder can place in the table heap. `bytes` is the
/// already-encoded row (small-heap/small-table-index widths throughout, as
/// in every table this builder emits).
struct Row {
    kind: TableKind,
    bytes: Vec<u8>,
}

struct Fixture {
    rows: Vec<Row>,
    strings: Vec<u8>,
    blobs: Vec<u8>,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            rows: Vec::new(),
            strings: vec![0u8],
            blobs: vec![0u8],
        }
    }

    /// Interns `s` into the string heap, returning its byte offset.
    fn string(&mut self, s: &str) -> u16 {
        let offset = self.strings.len() as u16;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        while self.strings.len() % 4 != 0 {
            self.strings.push(0);
        }
        offset
    }

    fn row(&mut self, kind: TableKind, bytes: Vec<u8>) {
        self.rows.push(Row { kind, bytes });
    }

    /// Assembly row: `HashAlgId Major Minor Build Rev Flags PublicKey Name Culture`.
    fn assembly_row(&mut self, name: &str) {
        let name_idx = self.string(name);
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(0x8004).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // public key: none
        bytes.write_u16::<LittleEndian>(name_idx).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // culture
        self.row(TableKind::Assembly, bytes);
    }

    /// AssemblyRef row, resolution scope for `InternalsVisibleTo` and the
    /// target of `RedirectAssemblyRef`.
    fn assembly_ref_row(&mut self, name: &str) {
        let name_idx = self.string(name);
        let mut bytes = Vec::new();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap(); // flags
        bytes.write_u16::<LittleEndian>(0).unwrap(); // public key or token: none
        bytes.write_u16::<LittleEndian>(name_idx).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // culture
        bytes.write_u16::<LittleEndian>(0).unwrap(); // hash value
        self.row(TableKind::AssemblyRef, bytes);
    }

    /// A single top-level `Public` TypeDef, no fields/methods of its own.
    fn public_type_def_row(&mut self, name: &str) {
        let name_idx = self.string(name);
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(0x0000_0001).unwrap(); // Public
        bytes.write_u16::<LittleEndian>(name_idx).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // namespace
        bytes.write_u16::<LittleEndian>(0).unwrap(); // extends: null coded index
        bytes.write_u16::<LittleEndian>(1).unwrap(); // field list
        bytes.write_u16::<LittleEndian>(1).unwrap(); // method list
        self.row(TableKind::TypeDef, bytes);
    }

    /// A single `Field` row — a table this core has no row codec for, used
    /// to exercise the `IndexWidthGrowthUnsupported` failure path.
    fn field_row(&mut self, name: &str) {
        let name_idx = self.string(name);
        let mut bytes = Vec::new();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // flags
        bytes.write_u16::<LittleEndian>(name_idx).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap(); // signature: empty blob
        self.row(TableKind::Field, bytes);
    }

    /// Serializes the whole image: table heap header, rows in ascending
    /// table-number order, heaps, stream directory, metadata root, CLI
    /// header, one `.text` section, and the surrounding PE/COFF headers.
    fn build(mut self) -> Vec<u8> {
        self.rows.sort_by_key(|r| r.kind.as_number());

        let mut valid = 0u64;
        let mut counts: Vec<(TableKind, u32)> = Vec::new();
        for kind in [
            TableKind::TypeDef,
            TableKind::Field,
            TableKind::MemberRef,
            TableKind::CustomAttribute,
            TableKind::Assembly,
            TableKind::AssemblyRef,
        ] {
            let count = self.rows.iter().filter(|r| r.kind == kind).count() as u32;
            if count > 0 {
                valid |= 1u64 << kind.as_number();
                counts.push((kind, count));
            }
        }

        let mut table_heap = Vec::new();
        table_heap.write_u32::<LittleEndian>(0).unwrap(); // reserved
        table_heap.push(2); // major version
        table_heap.push(0); // minor version
        table_heap.push(0); // heap sizes: all small
        table_heap.push(1); // reserved
        table_heap.write_u64::<LittleEndian>(valid).unwrap();
        table_heap.write_u64::<LittleEndian>(0).unwrap(); // sorted
        for (_, count) in &counts {
            table_heap.write_u32::<LittleEndian>(*count).unwrap();
        }
        for row in &self.rows {
            table_heap.extend_from_slice(&row.bytes);
        }
        while table_heap.len() % 4 != 0 {
            table_heap.push(0);
        }

        while self.blobs.len() % 4 != 0 {
            self.blobs.push(0);
        }
        let guids: Vec<u8> = Vec::new();

        let mut metadata = Vec::new();
        metadata.write_u32::<LittleEndian>(0x4253_4A42).unwrap(); // BSJB
        metadata.write_u16::<LittleEndian>(1).unwrap();
        metadata.write_u16::<LittleEndian>(1).unwrap();
        metadata.write_u32::<LittleEndian>(0).unwrap();
        let version = b"v4.0.30319\0\0";
        metadata.write_u32::<LittleEndian>(version.len() as u32).unwrap();
        metadata.extend_from_slice(version);
        metadata.write_u16::<LittleEndian>(0).unwrap(); // flags
        metadata.write_u16::<LittleEndian>(4).unwrap(); // stream count

        let streams: [(&str, &[u8]); 4] = [
            ("#~", &table_heap),
            ("#Strings", &self.strings),
            ("#Blob", &self.blobs),
            ("#GUID", &guids),
        ];

        let mut stream_dir = Vec::new();
        let mut data = Vec::new();
        let header_len: usize = streams
            .iter()
            .map(|(name, _)| 8 + ((name.len() + 1 + 3) & !3))
            .sum();
        let mut offset = header_len as u32;
        for (name, bytes) in streams {
            stream_dir.write_u32::<LittleEndian>(offset).unwrap();
            stream_dir.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            stream_dir.extend_from_slice(name.as_bytes());
            stream_dir.push(0);
            while stream_dir.len() % 4 != 0 {
                stream_dir.push(0);
            }
            data.extend_from_slice(bytes);
            while data.len() % 4 != 0 {
                data.push(0);
            }
            offset += ((bytes.len() + 3) & !3) as u32;
        }
        metadata.extend_from_slice(&stream_dir);
        metadata.extend_from_slice(&data);

        let cli_header_rva = SECTION_ALIGNMENT;
        let metadata_rva = cli_header_rva + 72;
        let metadata_size = metadata.len() as u32;

        let mut cli_header = Vec::new();
        cli_header.write_u32::<LittleEndian>(72).unwrap();
        cli_header.write_u16::<LittleEndian>(2).unwrap();
        cli_header.write_u16::<LittleEndian>(5).unwrap();
        cli_header.write_u32::<LittleEndian>(metadata_rva).unwrap();
        cli_header.write_u32::<LittleEndian>(metadata_size).unwrap();
        cli_header.write_u32::<LittleEndian>(0).unwrap(); // flags
        cli_header.write_u32::<LittleEndian>(0).unwrap(); // entry point token
        for _ in 0..12 {
            cli_header.write_u32::<LittleEndian>(0).unwrap();
        }
        assert_eq!(cli_header.len(), 72);

        let mut section_data = Vec::new();
        section_data.extend_from_slice(&cli_header);
        section_data.extend_from_slice(&metadata);
        let section_virtual_size = section_data.len() as u32;
        let section_raw_size = align_up(section_virtual_size, FILE_ALIGNMENT);
        section_data.resize(section_raw_size as usize, 0);

        let optional_header_size = 224u16; // PE32
        let dos_and_pe_header_size = 0x80u32;
        let coff_and_optional_size = 24 + optional_header_size as u32;
        let section_table_size = 40u32; // one section
        let headers_size = dos_and_pe_header_size + coff_and_optional_size + section_table_size;
        let first_section_file_offset = align_up(headers_size, FILE_ALIGNMENT);

        let mut out = Vec::new();
        out.extend_from_slice(b"MZ");
        out.resize(0x3c, 0);
        out.write_u32::<LittleEndian>(0x80).unwrap();
        out.resize(0x80, 0);
        out.extend_from_slice(b"PE\0\0");

        out.write_u16::<LittleEndian>(0x14c).unwrap(); // i386
        out.write_u16::<LittleEndian>(1).unwrap(); // one section
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(optional_header_size).unwrap();
        out.write_u16::<LittleEndian>(0x0102).unwrap();

        let optional_start = out.len();
        out.write_u16::<LittleEndian>(0x10b).unwrap(); // PE32 magic
        out.push(0);
        out.push(0);
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(SECTION_ALIGNMENT).unwrap(); // entry point
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0x0040_0000).unwrap(); // image base
        out.write_u32::<LittleEndian>(SECTION_ALIGNMENT).unwrap();
        out.write_u32::<LittleEndian>(FILE_ALIGNMENT).unwrap();
        out.write_u16::<LittleEndian>(4).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(4).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        let size_of_image = align_up(SECTION_ALIGNMENT + section_raw_size, SECTION_ALIGNMENT);
        out.write_u32::<LittleEndian>(size_of_image).unwrap();
        out.write_u32::<LittleEndian>(first_section_file_offset).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(3).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0x100000).unwrap();
        out.write_u32::<LittleEndian>(0x1000).unwrap();
        out.write_u32::<LittleEndian>(0x100000).unwrap();
        out.write_u32::<LittleEndian>(0x1000).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(16).unwrap();

        for i in 0..16u32 {
            if i == 14 {
                out.write_u32::<LittleEndian>(cli_header_rva).unwrap();
                out.write_u32::<LittleEndian>(72).unwrap();
            } else {
                out.write_u32::<LittleEndian>(0).unwrap();
                out.write_u32::<LittleEndian>(0).unwrap();
            }
        }
        assert_eq!(out.len() - optional_start, optional_header_size as usize);

        let mut name = [0u8; 8];
        name[..5].copy_from_slice(b".text");
        out.extend_from_slice(&name);
        out.write_u32::<LittleEndian>(section_virtual_size).unwrap();
        out.write_u32::<LittleEndian>(SECTION_ALIGNMENT).unwrap();
        out.write_u32::<LittleEndian>(section_raw_size).unwrap();
        out.write_u32::<LittleEndian>(first_section_file_offset).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0x6000_0020).unwrap();

        out.resize(first_section_file_offset as usize, 0);
        out.extend_from_slice(&section_data);
        out
    }
}

#[test]
fn make_types_internal_is_in_place_patchable() {
    let mut fixture = Fixture::new();
    fixture.assembly_row("DummyAssembly");
    fixture.public_type_def_row("PublicThing");
    let bytes = fixture.build();
    let original_len = bytes.len();

    let mut modifier = Modifier::open(bytes).unwrap();
    modifier.make_types_internal().unwrap();
    assert!(modifier.is_empty(), "flag-only edits must not force a rebuild");

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.dll");
    modifier.save(&out_path, None).unwrap();
    let written = std::fs::metadata(&out_path).unwrap().len() as usize;
    assert_eq!(written, original_len, "in-place patch must not change file length");
}

#[test]
fn redirect_assembly_ref_rewrites_matching_row() {
    let mut fixture = Fixture::new();
    fixture.assembly_row("DummyAssembly");
    fixture.assembly_ref_row("Newtonsoft.Json");
    let bytes = fixture.build();

    let mut modifier = Modifier::open(bytes).unwrap();
    let changed = modifier
        .redirect_assembly_ref("Newtonsoft.Json", "App.Newtonsoft.Json", None)
        .unwrap();
    assert!(changed);

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.dll");
    modifier.save(&out_path, None).unwrap();
    assert!(out_path.exists());
}

#[test]
fn add_internals_visible_to_with_runtime_ref_succeeds() {
    let mut fixture = Fixture::new();
    fixture.assembly_row("DummyAssembly");
    fixture.assembly_ref_row("System.Runtime");
    let bytes = fixture.build();

    let mut modifier = Modifier::open(bytes).unwrap();
    modifier.add_internals_visible_to("Friend", None).unwrap();
    assert!(!modifier.is_empty(), "a new TypeRef/MemberRef/CustomAttribute forces a rebuild");

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.dll");
    modifier.save(&out_path, None).unwrap();
    assert!(out_path.exists());
}

#[test]
fn growth_past_supported_tables_fails_loudly() {
    let mut fixture = Fixture::new();
    fixture.assembly_row("DummyAssembly");
    fixture.field_row("_backing");
    let bytes = fixture.build();

    let mut modifier = Modifier::open(bytes).unwrap();
    // One huge new string pushes `#Strings` well past the 2^16 boundary,
    // forcing StringIndexSize to grow from 2 to 4 bytes; the Field table
    // this core has no row codec for then can't be safely re-copied.
    let huge_name = "X".repeat(70_000);
    modifier.set_assembly_name(&huge_name).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.dll");
    let err = modifier.save(&out_path, None).unwrap_err();
    assert!(matches!(err, ShadeError::IndexWidthGrowthUnsupported(TableKind::Field)));
}
