//! ECMA-335 II.22 row schemas, used to compute row sizes and table-data
//! offsets for every present table (§4.2), not just the eight this core
//! carries row codecs for.

use std::collections::HashMap;

use crate::metadata::index::{CodedIndexTag, HeapSizes};
use crate::metadata::kind::TableKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    U2,
    U4,
    Str,
    Guid,
    Blob,
    Table(TableKind),
    Coded(CodedIndexTag),
}

pub fn row_schema(kind: TableKind) -> &'static [Column] {
    use Column::*;
    use TableKind::*;
    match kind {
        Module => &[U2, Str, Guid, Guid, Guid],
        TypeRef => &[Coded(CodedIndexTag::ResolutionScope), Str, Str],
        TypeDef => &[
            U4,
            Str,
            Str,
            Coded(CodedIndexTag::TypeDefOrRef),
            Table(Field),
            Table(MethodDef),
        ],
        Field => &[U2, Str, Blob],
        MethodDef => &[U4, U2, U2, Str, Blob, Table(Param)],
        Param => &[U2, U2, Str],
        InterfaceImpl => &[Table(TypeDef), Coded(CodedIndexTag::TypeDefOrRef)],
        MemberRef => &[Coded(CodedIndexTag::MemberRefParent), Str, Blob],
        Constant => &[U2, Coded(CodedIndexTag::HasConstant), Blob],
        CustomAttribute => &[
            Coded(CodedIndexTag::HasCustomAttribute),
            Coded(CodedIndexTag::CustomAttributeType),
            Blob,
        ],
        FieldMarshal => &[Coded(CodedIndexTag::HasFieldMarshal), Blob],
        DeclSecurity => &[U2, Coded(CodedIndexTag::HasDeclSecurity), Blob],
        ClassLayout => &[U2, U4, Table(TypeDef)],
        FieldLayout => &[U4, Table(Field)],
        StandAloneSig => &[Blob],
        EventMap => &[Table(TypeDef), Table(Event)],
        Event => &[U2, Str, Coded(CodedIndexTag::TypeDefOrRef)],
        PropertyMap => &[Table(TypeDef), Table(Property)],
        Property => &[U2, Str, Blob],
        MethodSemantics => &[U2, Table(MethodDef), Coded(CodedIndexTag::HasSemantics)],
        MethodImpl => &[
            Table(TypeDef),
            Coded(CodedIndexTag::MethodDefOrRef),
            Coded(CodedIndexTag::MethodDefOrRef),
        ],
        ModuleRef => &[Str],
        TypeSpec => &[Blob],
        ImplMap => &[
            U2,
            Coded(CodedIndexTag::MemberForwarded),
            Str,
            Table(ModuleRef),
        ],
        FieldRVA => &[U4, Table(Field)],
        Assembly => &[U4, U2, U2, U2, U2, U4, Blob, Str, Str],
        AssemblyProcessor => &[U4],
        AssemblyOS => &[U4, U4, U4],
        AssemblyRef => &[U2, U2, U2, U2, U4, Blob, Str, Str, Blob],
        AssemblyRefProcessor => &[U4, Table(AssemblyRef)],
        AssemblyRefOS => &[U4, U4, U4, Table(AssemblyRef)],
        File => &[U4, Str, Blob],
        ExportedType => &[U4, U4, Str, Str, Coded(CodedIndexTag::Implementation)],
        ManifestResource => &[U4, U4, Str, Coded(CodedIndexTag::Implementation)],
        NestedClass => &[Table(TypeDef), Table(TypeDef)],
        GenericParam => &[U2, U2, Coded(CodedIndexTag::TypeOrMethodDef), Str],
        MethodSpec => &[Coded(CodedIndexTag::MethodDefOrRef), Blob],
        GenericParamConstraint => &[Table(GenericParam), Coded(CodedIndexTag::TypeDefOrRef)],
    }
}

/// The active index widths for one parse/rebuild, derived from the heap
/// sizes byte and the per-table row counts (§3 "Index widths").
#[derive(Debug, Clone)]
pub struct Widths {
    pub heap_sizes: HeapSizes,
    row_counts: HashMap<TableKind, u32>,
    coded_cache: HashMap<CodedIndexTag, u8>,
}

pub const ALL_CODED_TAGS: &[CodedIndexTag] = &[
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

impl Widths {
    pub fn new(heap_sizes: HeapSizes, row_counts: HashMap<TableKind, u32>) -> Widths {
        let mut coded_cache = HashMap::new();
        for &tag in ALL_CODED_TAGS {
            let width = tag.width(|t| *row_counts.get(&t).unwrap_or(&0));
            coded_cache.insert(tag, width);
        }
        Widths {
            heap_sizes,
            row_counts,
            coded_cache,
        }
    }

    pub fn row_count(&self, kind: TableKind) -> u32 {
        *self.row_counts.get(&kind).unwrap_or(&0)
    }

    pub fn set_row_count(&mut self, kind: TableKind, count: u32) {
        self.row_counts.insert(kind, count);
        for &tag in ALL_CODED_TAGS {
            let width = tag.width(|t| *self.row_counts.get(&t).unwrap_or(&0));
            self.coded_cache.insert(tag, width);
        }
    }

    pub fn table_index_size(&self, kind: TableKind) -> u8 {
        if self.row_count(kind) < 0x10000 {
            2
        } else {
            4
        }
    }

    pub fn coded_index_size(&self, tag: CodedIndexTag) -> u8 {
        *self.coded_cache.get(&tag).unwrap_or(&2)
    }

    pub fn column_size(&self, column: Column) -> u8 {
        match column {
            Column::U2 => 2,
            Column::U4 => 4,
            Column::Str => self.heap_sizes.string_size(),
            Column::Guid => self.heap_sizes.guid_size(),
            Column::Blob => self.heap_sizes.blob_size(),
            Column::Table(t) => self.table_index_size(t),
            Column::Coded(tag) => self.coded_index_size(tag),
        }
    }

    pub fn row_size(&self, kind: TableKind) -> usize {
        row_schema(kind)
            .iter()
            .map(|&c| self.column_size(c) as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_size_matches_hand_computed_assembly_ref() {
        let widths = Widths::new(HeapSizes::default(), HashMap::new());
        // 4*u2 + u4 + blob(2) + str(2) + str(2) + blob(2) = 8 + 4 + 2+2+2+2
        assert_eq!(widths.row_size(TableKind::AssemblyRef), 20);
    }

    #[test]
    fn table_index_size_grows_with_row_count() {
        let mut counts = HashMap::new();
        counts.insert(TableKind::TypeRef, 0x10000);
        let widths = Widths::new(HeapSizes::default(), counts);
        assert_eq!(widths.table_index_size(TableKind::TypeRef), 4);
        assert_eq!(widths.table_index_size(TableKind::TypeDef), 2);
    }
}
