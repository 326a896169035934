//! Bitmask types for the columns this core reads or mutates. Scoped to the
//! flags the eight supported tables actually need (§4.3), not the full
//! II.23.1 catalogue.

/// II.23.1.2 `AssemblyFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyFlags(pub u32);

impl AssemblyFlags {
    pub const PUBLIC_KEY: u32 = 0x0001;
    pub const RETARGETABLE: u32 = 0x0100;

    pub fn has_public_key(self) -> bool {
        self.0 & Self::PUBLIC_KEY != 0
    }
}

/// II.23.1.15 `TypeAttributes`. Only the visibility sub-field (the low 3
/// bits) is interpreted by this core; everything else round-trips opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeAttributes(pub u32);

impl TypeAttributes {
    const VISIBILITY_MASK: u32 = 0x0000_0007;
    const NOT_PUBLIC: u32 = 0x0000_0000;
    const PUBLIC: u32 = 0x0000_0001;

    /// `true` for `Public` visibility. Nested-public/nested-protected etc.
    /// are all "not the top-level Public case" for this core's purposes —
    /// `MakeTypesInternal` only concerns itself with top-level public types
    /// since nested visibility is already assembly-scoped by construction.
    pub fn is_public(self) -> bool {
        self.0 & Self::VISIBILITY_MASK == Self::PUBLIC
    }

    /// Clears the 3-bit visibility sub-field and sets it to `NotPublic`
    /// (§4.3).
    pub fn make_internal(self) -> TypeAttributes {
        TypeAttributes((self.0 & !Self::VISIBILITY_MASK) | Self::NOT_PUBLIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_type_is_detected_and_cleared() {
        let flags = TypeAttributes(0x0000_0401); // Public | SpecialName
        assert!(flags.is_public());
        let internal = flags.make_internal();
        assert!(!internal.is_public());
        // Non-visibility bits (e.g. `SpecialName` at 0x400) are preserved.
        assert_eq!(internal.0 & !0x7, flags.0 & !0x7);
    }

    #[test]
    fn nested_public_is_not_top_level_public() {
        let nested_public = TypeAttributes(0x0000_0002); // NestedPublic
        assert!(!nested_public.is_public());
    }
}
