//! The four heaps: `#Strings`, `#Blob`, `#GUID`, `#US`. Strings and blobs
//! support append (§4.5 `GetOrAddString`/`GetOrAddBlob`); `#GUID` and `#US`
//! are carried through opaquely since nothing in this core's mutation set
//! needs to mint a new GUID or user string.

use std::io::Cursor;

use crate::error::{Result, ShadeError};
use crate::metadata::index::{
    read_compressed_length, write_compressed_length, BlobIndex, GuidIndex, StringIndex,
};

#[derive(Debug, Clone, Default)]
pub struct Streams {
    strings: Vec<u8>,
    blobs: Vec<u8>,
    guids: Vec<u8>,
    user_strings: Vec<u8>,
}

impl Streams {
    pub fn new(strings: Vec<u8>, blobs: Vec<u8>, guids: Vec<u8>, user_strings: Vec<u8>) -> Streams {
        Streams {
            strings,
            blobs,
            guids,
            user_strings,
        }
    }

    pub fn get_string(&self, index: StringIndex) -> Result<&str> {
        if index.0 == 0 {
            return Ok("");
        }
        let start = index.0 as usize;
        let raw = self
            .strings
            .get(start..)
            .ok_or_else(|| ShadeError::InvalidImage("string index out of range".into()))?;
        let nul = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ShadeError::InvalidImage("unterminated string in #Strings".into()))?;
        std::str::from_utf8(&raw[..nul])
            .map_err(|_| ShadeError::InvalidImage("#Strings entry is not valid UTF-8".into()))
    }

    /// Appends `s` to the end of `#Strings` (no deduplication, matching the
    /// heap's append-only growth model) and returns its new index.
    pub fn add_string(&mut self, s: &str) -> StringIndex {
        let index = StringIndex(self.strings.len() as u32);
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        index
    }

    pub fn get_blob(&self, index: BlobIndex) -> Result<&[u8]> {
        if index.0 == 0 {
            return Ok(&[]);
        }
        let start = index.0 as usize;
        let raw = self
            .blobs
            .get(start..)
            .ok_or_else(|| ShadeError::InvalidImage("blob index out of range".into()))?;
        let slice: &[u8] = raw;
        let mut cursor = Cursor::new(slice);
        let (len, prefix) = read_compressed_length(&mut cursor)?;
        let data_start = start + prefix as usize;
        self.blobs
            .get(data_start..data_start + len as usize)
            .ok_or_else(|| ShadeError::InvalidImage("blob data truncated".into()))
    }

    pub fn add_blob(&mut self, data: &[u8]) -> BlobIndex {
        let index = BlobIndex(self.blobs.len() as u32);
        write_compressed_length(&mut self.blobs, data.len());
        self.blobs.extend_from_slice(data);
        index
    }

    pub fn get_guid(&self, index: GuidIndex) -> Result<[u8; 16]> {
        if index.0 == 0 {
            return Ok([0u8; 16]);
        }
        let start = (index.0 as usize - 1) * 16;
        let raw = self
            .guids
            .get(start..start + 16)
            .ok_or_else(|| ShadeError::InvalidImage("guid index out of range".into()))?;
        let mut out = [0u8; 16];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn strings_bytes(&self) -> &[u8] {
        &self.strings
    }

    pub fn blobs_bytes(&self) -> &[u8] {
        &self.blobs
    }

    pub fn guids_bytes(&self) -> &[u8] {
        &self.guids
    }

    pub fn user_strings_bytes(&self) -> &[u8] {
        &self.user_strings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_through_append() {
        let mut streams = Streams::default();
        streams.strings.push(0); // empty string at index 0, per convention
        let idx = streams.add_string("System.Private.CoreLib");
        assert_eq!(streams.get_string(idx).unwrap(), "System.Private.CoreLib");
        assert_eq!(streams.get_string(StringIndex(0)).unwrap(), "");
    }

    #[test]
    fn blob_round_trips_through_append_with_length_prefix() {
        let mut streams = Streams::default();
        streams.blobs.push(0);
        let data = vec![1u8, 2, 3, 4, 5];
        let idx = streams.add_blob(&data);
        assert_eq!(streams.get_blob(idx).unwrap(), data.as_slice());
    }

    #[test]
    fn guid_is_null_at_index_zero() {
        let streams = Streams::default();
        assert_eq!(streams.get_guid(GuidIndex(0)).unwrap(), [0u8; 16]);
    }
}
