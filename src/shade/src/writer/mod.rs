//! C6/C7 — metadata and PE re-encoding.

mod metadata_writer;
mod pe_writer;

pub use pe_writer::write;
