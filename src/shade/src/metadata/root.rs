//! II.24.2.1 metadata root: the `BSJB` header and stream directory.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Result, ShadeError};

const SIGNATURE: u32 = 0x4253_4A42; // "BSJB"

#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub name: String,
    /// Offset of the stream's data, relative to the start of the metadata
    /// root (i.e. relative to the CLI header's `MetaData` RVA).
    pub offset: u32,
    pub size: u32,
}

/// The metadata root: version string plus the directory of streams
/// (`#~`/`#-`, `#Strings`, `#US`, `#GUID`, `#Blob`) that follow it.
#[derive(Debug, Clone)]
pub struct MetadataRoot {
    pub major_version: u16,
    pub minor_version: u16,
    pub version: String,
    pub streams: Vec<StreamHeader>,
    /// Size in bytes of the root header itself (signature through the last
    /// stream header), i.e. where stream data starts relative to the root.
    pub header_len: usize,
}

impl MetadataRoot {
    /// Parses the metadata root starting at `bytes[0]` (the caller has
    /// already resolved the CLI header's `MetaData` RVA to a file offset and
    /// sliced from there).
    pub fn parse(bytes: &[u8]) -> Result<MetadataRoot> {
        let mut cursor = Cursor::new(bytes);
        let signature = cursor.read_u32::<LittleEndian>()?;
        if signature != SIGNATURE {
            return Err(ShadeError::InvalidImage(
                "metadata root signature is not BSJB".into(),
            ));
        }
        let major_version = cursor.read_u16::<LittleEndian>()?;
        let minor_version = cursor.read_u16::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let length = cursor.read_u32::<LittleEndian>()? as usize;

        let start = cursor.position() as usize;
        let raw = bytes
            .get(start..start + length)
            .ok_or_else(|| ShadeError::InvalidImage("metadata version string truncated".into()))?;
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let version = String::from_utf8_lossy(&raw[..nul]).into_owned();
        cursor.set_position((start + length) as u64);

        let _flags = cursor.read_u16::<LittleEndian>()?;
        let stream_count = cursor.read_u16::<LittleEndian>()?;

        let mut streams = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let offset = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            let name_start = cursor.position() as usize;
            let name_bytes = bytes.get(name_start..).ok_or_else(|| {
                ShadeError::InvalidImage("stream header name truncated".into())
            })?;
            let nul = name_bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| ShadeError::InvalidImage("unterminated stream name".into()))?;
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
            let padded = (nul + 1 + 3) & !3;
            cursor.set_position((name_start + padded) as u64);
            streams.push(StreamHeader { name, offset, size });
        }

        Ok(MetadataRoot {
            major_version,
            minor_version,
            version,
            streams,
            header_len: cursor.position() as usize,
        })
    }

    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.streams.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let version = b"v4.0.30319\0\0";
        buf.extend_from_slice(&(version.len() as u32).to_le_bytes());
        buf.extend_from_slice(version);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&40u32.to_le_bytes());
        buf.extend_from_slice(b"#~\0\0");
        buf
    }

    #[test]
    fn parses_version_and_single_stream() {
        let buf = sample_root();
        let root = MetadataRoot::parse(&buf).unwrap();
        assert_eq!(root.version, "v4.0.30319");
        assert_eq!(root.streams.len(), 1);
        assert_eq!(root.streams[0].name, "#~");
        assert_eq!(root.streams[0].offset, 100);
        assert_eq!(root.streams[0].size, 40);
        assert_eq!(root.header_len, buf.len());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = sample_root();
        buf[0] = 0;
        assert!(MetadataRoot::parse(&buf).is_err());
    }
}
