//! C9 — the high-level modifier: opens a file, exposes the mutation DSL over
//! a `ModificationPlan`, and dispatches `Save` through the writer (§4.9).

use std::fs;
use std::path::Path;

use crate::error::{Result, ShadeError};
use crate::metadata::{
    CodedIndexTag, CustomAttributeRow, MemberRefRow, MetadataReader, MetadataRoot, Streams,
    TableKind, TypeRefRow,
};
use crate::pe::PeReader;
use crate::plan::ModificationPlan;
use crate::sign::StrongNameKey;
use crate::writer;

/// Resolution scopes tried in order when `AddInternalsVisibleTo` needs to
/// anchor a new `TypeRef` on a runtime assembly (§4.9).
const RUNTIME_ASSEMBLY_CANDIDATES: &[&str] = &[
    "System.Runtime",
    "mscorlib",
    "netstandard",
    "System.Private.CoreLib",
];

const COMPILER_SERVICES_NAMESPACE: &str = "System.Runtime.CompilerServices";
const INTERNALS_VISIBLE_TO_ATTRIBUTE: &str = "InternalsVisibleToAttribute";

/// `HASTHIS | ParamCount=1 | Return=VOID | Param=STRING`.
const IVT_CTOR_SIGNATURE: [u8; 4] = [0x20, 0x01, 0x01, 0x0E];

pub struct Modifier {
    pe: PeReader,
    root: MetadataRoot,
    reader: MetadataReader,
    streams: Streams,
    plan: ModificationPlan,
}

impl Modifier {
    pub fn open(bytes: Vec<u8>) -> Result<Modifier> {
        let pe = PeReader::open(bytes)?;
        let metadata_offset = pe.resolve_rva(pe.cli_header.metadata.rva)?;
        let metadata_size = pe.cli_header.metadata.size as usize;
        let metadata_bytes = pe.read_at(metadata_offset, metadata_size)?;

        let root = MetadataRoot::parse(metadata_bytes)?;
        let table_heap = root
            .stream("#~")
            .or_else(|| root.stream("#-"))
            .ok_or_else(|| ShadeError::InvalidImage("no table heap stream".into()))?;
        let reader = MetadataReader::parse(slice_stream(metadata_bytes, table_heap)?)?;

        let strings = root
            .stream("#Strings")
            .map(|s| slice_stream(metadata_bytes, s))
            .transpose()?
            .unwrap_or(&[])
            .to_vec();
        let blobs = root
            .stream("#Blob")
            .map(|s| slice_stream(metadata_bytes, s))
            .transpose()?
            .unwrap_or(&[])
            .to_vec();
        let guids = root
            .stream("#GUID")
            .map(|s| slice_stream(metadata_bytes, s))
            .transpose()?
            .unwrap_or(&[])
            .to_vec();
        let user_strings = root
            .stream("#US")
            .map(|s| slice_stream(metadata_bytes, s))
            .transpose()?
            .unwrap_or(&[])
            .to_vec();
        let streams = Streams::new(strings, blobs, guids, user_strings);

        let plan = ModificationPlan::new(
            root.stream("#Strings").map(|s| s.size).unwrap_or(0),
            root.stream("#Blob").map(|s| s.size).unwrap_or(0),
        );

        Ok(Modifier {
            pe,
            root,
            reader,
            streams,
            plan,
        })
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Modifier> {
        Modifier::open(fs::read(path)?)
    }

    /// The Assembly row as it currently stands: modified if a mutation was
    /// already recorded, else the row as read from the source.
    pub fn assembly_row(&self) -> Result<Option<crate::metadata::AssemblyRow>> {
        self.plan.assembly_row(&self.reader, 1)
    }

    /// Whether any mutation has been recorded on the plan yet.
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    pub fn set_assembly_name(&mut self, name: &str) -> Result<()> {
        self.plan.set_assembly_name(&self.reader, name)
    }

    pub fn set_assembly_public_key(&mut self, key: &[u8]) -> Result<()> {
        self.plan.set_assembly_public_key(&self.reader, key)
    }

    pub fn clear_strong_name(&mut self) -> Result<()> {
        self.plan.clear_strong_name(&self.reader)
    }

    pub fn redirect_assembly_ref(
        &mut self,
        source_name: &str,
        target_name: &str,
        token: Option<&[u8]>,
    ) -> Result<bool> {
        self.plan.redirect_assembly_ref(
            &self.reader,
            &self.streams,
            source_name,
            target_name,
            token,
        )
    }

    pub fn make_types_internal(&mut self) -> Result<()> {
        self.plan.make_types_internal(&self.reader)
    }

    /// Synthesizes a `CustomAttribute` row calling
    /// `InternalsVisibleToAttribute..ctor(string)` (§4.9).
    pub fn add_internals_visible_to(
        &mut self,
        assembly_name: &str,
        public_key: Option<&[u8]>,
    ) -> Result<()> {
        let type_rid = self.find_or_add_ivt_type_ref()?;
        let member_rid = self.find_or_add_ivt_ctor(type_rid)?;

        let text = match public_key {
            Some(key) => format!("{assembly_name}, PublicKey={}", upper_hex(key)),
            None => assembly_name.to_string(),
        };

        let mut value = Vec::new();
        value.extend_from_slice(&[0x01, 0x00]);
        write_ser_string(&mut value, &text);
        value.extend_from_slice(&[0x00, 0x00]);
        let value_index = self.plan.get_or_add_blob(&value);

        // Encoded only to fail fast on an invalid candidate; the row itself
        // stores the (table, rid) pair and is re-encoded by the writer.
        CodedIndexTag::HasCustomAttribute.encode(TableKind::Assembly, 1)?;
        CodedIndexTag::CustomAttributeType.encode(TableKind::MemberRef, member_rid)?;

        self.plan.add_custom_attribute(CustomAttributeRow {
            parent: (TableKind::Assembly, 1),
            attr_type: (TableKind::MemberRef, member_rid),
            value: value_index,
        });
        Ok(())
    }

    fn find_or_add_ivt_type_ref(&mut self) -> Result<u32> {
        if let Some(rid) = self.reader.find_type_ref(
            &self.streams,
            COMPILER_SERVICES_NAMESPACE,
            INTERNALS_VISIBLE_TO_ATTRIBUTE,
        )? {
            return Ok(rid);
        }

        let scope_rid = RUNTIME_ASSEMBLY_CANDIDATES
            .iter()
            .find_map(|name| self.reader.find_assembly_ref(&self.streams, name).ok().flatten())
            .ok_or(ShadeError::MissingRuntimeRef)?;

        let namespace = self.plan.get_or_add_string(COMPILER_SERVICES_NAMESPACE);
        let name = self.plan.get_or_add_string(INTERNALS_VISIBLE_TO_ATTRIBUTE);
        let row = TypeRefRow {
            resolution_scope: (TableKind::AssemblyRef, scope_rid),
            name,
            namespace,
        };
        Ok(self.plan.add_type_ref(&self.reader, row))
    }

    fn find_or_add_ivt_ctor(&mut self, type_rid: u32) -> Result<u32> {
        let parent = (TableKind::TypeRef, type_rid);
        if let Some(rid) = self.reader.find_member_ref(&self.streams, parent, ".ctor")? {
            return Ok(rid);
        }
        let name = self.plan.get_or_add_string(".ctor");
        let signature = self.plan.get_or_add_blob(&IVT_CTOR_SIGNATURE);
        let row = MemberRefRow {
            class: parent,
            name,
            signature,
        };
        Ok(self.plan.add_member_ref(&self.reader, row))
    }

    /// Dispatches on the plan's output strategy and writes the result to
    /// `path`, signing it if `key` is supplied (§4.9). Does not copy a
    /// sibling PDB — use [`save_with_pdb`] when the source path is known.
    pub fn save(&self, path: impl AsRef<Path>, key: Option<&StrongNameKey>) -> Result<()> {
        let mut out = writer::write(&self.pe, &self.root, &self.reader, &self.streams, &self.plan)?;
        if let Some(key) = key {
            if !crate::sign::sign(&mut out, key)? {
                return Err(ShadeError::SignPlaceholderMissing);
            }
        }
        fs::write(&path, &out)?;
        Ok(())
    }
}

fn slice_stream<'a>(
    metadata_bytes: &'a [u8],
    header: &crate::metadata::StreamHeader,
) -> Result<&'a [u8]> {
    let start = header.offset as usize;
    let end = start + header.size as usize;
    metadata_bytes
        .get(start..end)
        .ok_or_else(|| ShadeError::InvalidImage(format!("{} stream truncated", header.name)))
}

fn write_ser_string(out: &mut Vec<u8>, text: &str) {
    crate::metadata::write_compressed_length(out, text.len());
    out.extend_from_slice(text.as_bytes());
}

fn upper_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Saves, then copies a same-named `.pdb` from `source_path` alongside
/// `target_path` if one exists — it needs no rewriting since method tokens
/// are preserved across a shade (§4.9).
pub fn save_with_pdb(
    modifier: &Modifier,
    source_path: impl AsRef<Path>,
    target_path: impl AsRef<Path>,
    key: Option<&StrongNameKey>,
) -> Result<()> {
    modifier.save(&target_path, key)?;
    let pdb_source = source_path.as_ref().with_extension("pdb");
    if pdb_source.exists() {
        let pdb_target = target_path.as_ref().with_extension("pdb");
        fs::copy(&pdb_source, &pdb_target)?;
    }
    Ok(())
}
