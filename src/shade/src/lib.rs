//! A PE/ECMA-335 metadata binary editor for "shading" managed assemblies:
//! renaming an assembly's identity, stripping or replacing its strong-name
//! public key, redirecting outbound references, flipping public types to
//! assembly-internal, injecting `InternalsVisibleTo` friend declarations,
//! and re-signing the result with a supplied RSA key.

mod error;
mod metadata;
mod modifier;
mod pe;
mod plan;
mod sign;
mod writer;

pub use error::{Result, ShadeError};
pub use metadata::{MetadataReader, MetadataRoot, Streams, TableKind};
pub use modifier::{save_with_pdb, Modifier};
pub use pe::PeReader;
pub use plan::{ModificationPlan, OutputStrategy};
pub use sign::StrongNameKey;
