/// ECMA-335 II.22 table numbers. Every table that can legally appear in a
/// `#~`/`#-` stream's `Valid` bitmask is named here, even though this core
/// only carries row codecs for eight of them (§4.3) — the rest still need a
/// `TableKind` to size their rows and to serve as coded-index targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    Module,
    TypeRef,
    TypeDef,
    Field,
    MethodDef,
    Param,
    InterfaceImpl,
    MemberRef,
    Constant,
    CustomAttribute,
    FieldMarshal,
    DeclSecurity,
    ClassLayout,
    FieldLayout,
    StandAloneSig,
    EventMap,
    Event,
    PropertyMap,
    Property,
    MethodSemantics,
    MethodImpl,
    ModuleRef,
    TypeSpec,
    ImplMap,
    FieldRVA,
    Assembly,
    AssemblyProcessor,
    AssemblyOS,
    AssemblyRef,
    AssemblyRefProcessor,
    AssemblyRefOS,
    File,
    ExportedType,
    ManifestResource,
    NestedClass,
    GenericParam,
    MethodSpec,
    GenericParamConstraint,
}

impl TableKind {
    /// All table kinds this core knows about, in ascending table-number
    /// order (the order the `Valid` bitmask and table-data region use).
    pub const ALL: &'static [TableKind] = &[
        TableKind::Module,
        TableKind::TypeRef,
        TableKind::TypeDef,
        TableKind::Field,
        TableKind::MethodDef,
        TableKind::Param,
        TableKind::InterfaceImpl,
        TableKind::MemberRef,
        TableKind::Constant,
        TableKind::CustomAttribute,
        TableKind::FieldMarshal,
        TableKind::DeclSecurity,
        TableKind::ClassLayout,
        TableKind::FieldLayout,
        TableKind::StandAloneSig,
        TableKind::EventMap,
        TableKind::Event,
        TableKind::PropertyMap,
        TableKind::Property,
        TableKind::MethodSemantics,
        TableKind::MethodImpl,
        TableKind::ModuleRef,
        TableKind::TypeSpec,
        TableKind::ImplMap,
        TableKind::FieldRVA,
        TableKind::Assembly,
        TableKind::AssemblyProcessor,
        TableKind::AssemblyOS,
        TableKind::AssemblyRef,
        TableKind::AssemblyRefProcessor,
        TableKind::AssemblyRefOS,
        TableKind::File,
        TableKind::ExportedType,
        TableKind::ManifestResource,
        TableKind::NestedClass,
        TableKind::GenericParam,
        TableKind::MethodSpec,
        TableKind::GenericParamConstraint,
    ];

    pub fn as_number(self) -> u8 {
        match self {
            TableKind::Module => 0x00,
            TableKind::TypeRef => 0x01,
            TableKind::TypeDef => 0x02,
            TableKind::Field => 0x04,
            TableKind::MethodDef => 0x06,
            TableKind::Param => 0x08,
            TableKind::InterfaceImpl => 0x09,
            TableKind::MemberRef => 0x0A,
            TableKind::Constant => 0x0B,
            TableKind::CustomAttribute => 0x0C,
            TableKind::FieldMarshal => 0x0D,
            TableKind::DeclSecurity => 0x0E,
            TableKind::ClassLayout => 0x0F,
            TableKind::FieldLayout => 0x10,
            TableKind::StandAloneSig => 0x11,
            TableKind::EventMap => 0x12,
            TableKind::Event => 0x14,
            TableKind::PropertyMap => 0x15,
            TableKind::Property => 0x17,
            TableKind::MethodSemantics => 0x18,
            TableKind::MethodImpl => 0x19,
            TableKind::ModuleRef => 0x1A,
            TableKind::TypeSpec => 0x1B,
            TableKind::ImplMap => 0x1C,
            TableKind::FieldRVA => 0x1D,
            TableKind::Assembly => 0x20,
            TableKind::AssemblyProcessor => 0x21,
            TableKind::AssemblyOS => 0x22,
            TableKind::AssemblyRef => 0x23,
            TableKind::AssemblyRefProcessor => 0x24,
            TableKind::AssemblyRefOS => 0x25,
            TableKind::File => 0x26,
            TableKind::ExportedType => 0x27,
            TableKind::ManifestResource => 0x28,
            TableKind::NestedClass => 0x29,
            TableKind::GenericParam => 0x2A,
            TableKind::MethodSpec => 0x2B,
            TableKind::GenericParamConstraint => 0x2C,
        }
    }

    pub fn from_number(n: u8) -> Option<TableKind> {
        Self::ALL.iter().copied().find(|k| k.as_number() == n)
    }
}
