use crate::metadata::TableKind;

/// Every failure mode the core can surface to a caller of `Save`/`SignFile`.
///
/// Reading operations that can legitimately come up empty (`FindAssemblyRef`
/// and friends) return `Option`, not this type — `ShadeError` is reserved for
/// genuine structural or I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum ShadeError {
    /// The image has no CLI header data directory.
    #[error("not a managed image: no CLI header")]
    NotManagedImage,

    /// The PE or ECMA-335 metadata structure violates the format.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A coded index decoded to a reserved tag slot.
    #[error("coded index referenced a reserved tag slot")]
    UnknownCodedIndex,

    /// A rebuild needs wider heap indices but the source carries a table
    /// this core has no row codec for, so it cannot be re-encoded safely.
    #[error("heap index width grew but table {0:?} has no row codec to rewrite it")]
    IndexWidthGrowthUnsupported(TableKind),

    /// `AddInternalsVisibleTo` had no AssemblyRef to anchor a new TypeRef on.
    #[error("no runtime resolution scope (System.Runtime / mscorlib / netstandard / System.Private.CoreLib) found")]
    MissingRuntimeRef,

    /// A CAPI key blob failed its header/magic checks.
    #[error("invalid key blob: {0}")]
    KeyFormatError(String),

    /// Signing was requested but the image carries no signature directory.
    #[error("no strong-name signature placeholder present")]
    SignPlaceholderMissing,

    /// Underlying filesystem/stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShadeError>;
