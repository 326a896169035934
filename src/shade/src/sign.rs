//! C8 — the strong-name signer: CAPI key blob import, streaming SHA-1 over
//! the file minus the checksum/signature regions, and RSA-PKCS1 signing.

use num_bigint_dig::BigUint;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};

use crate::error::{Result, ShadeError};
use crate::pe::PeReader;

const PUBLICKEYBLOB: u8 = 0x06;
const PRIVATEKEYBLOB: u8 = 0x07;
const CALG_RSA_SIGN: u32 = 0x0000_2400;
const CALG_SHA1: u32 = 0x0000_8004;

/// An imported CAPI key, as accepted for `Save(path, key)` (§4.8).
pub struct StrongNameKey {
    private: RsaPrivateKey,
    public_blob: Vec<u8>,
}

impl StrongNameKey {
    /// Accepts a full CAPI key-blob container (`0x00` header + inner blob
    /// at offset 12), or a bare `RSA1`/`RSA2` blob.
    pub fn from_capi_blob(bytes: &[u8]) -> Result<StrongNameKey> {
        let inner = if bytes.first() == Some(&0x00) {
            bytes
                .get(12..)
                .ok_or_else(|| ShadeError::KeyFormatError("full key blob truncated".into()))?
        } else {
            bytes
        };

        let blob_type = *inner
            .first()
            .ok_or_else(|| ShadeError::KeyFormatError("empty key blob".into()))?;
        match blob_type {
            PRIVATEKEYBLOB => Self::from_private_blob(inner),
            PUBLICKEYBLOB => Err(ShadeError::KeyFormatError(
                "signing requires a private key, got a public key blob".into(),
            )),
            other => Err(ShadeError::KeyFormatError(format!(
                "unrecognized key blob type 0x{other:02x}"
            ))),
        }
    }

    /// Parses a bare `RSA2` private blob (CAPI PRIVATEKEYBLOB + RSAPUBKEY).
    fn from_private_blob(blob: &[u8]) -> Result<StrongNameKey> {
        if blob.len() < 20 || &blob[8..12] != b"RSA2" {
            return Err(ShadeError::KeyFormatError("missing RSA2 magic".into()));
        }
        let bit_len = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
        let byte_len = bit_len / 8;
        let pub_exp = u32::from_le_bytes(blob[16..20].try_into().unwrap());

        let mut cursor = 20;
        let modulus = read_reversed_uint(blob, &mut cursor, byte_len)?;
        let prime1 = read_reversed_uint(blob, &mut cursor, byte_len / 2)?;
        let prime2 = read_reversed_uint(blob, &mut cursor, byte_len / 2)?;
        let _exponent1 = read_reversed_uint(blob, &mut cursor, byte_len / 2)?;
        let _exponent2 = read_reversed_uint(blob, &mut cursor, byte_len / 2)?;
        let _coefficient = read_reversed_uint(blob, &mut cursor, byte_len / 2)?;
        let private_exponent = read_reversed_uint(blob, &mut cursor, byte_len)?;

        let n = rsa::BigUint::from_bytes_be(&modulus.to_bytes_be());
        let e = rsa::BigUint::from(pub_exp);
        let d = rsa::BigUint::from_bytes_be(&private_exponent.to_bytes_be());
        let p = rsa::BigUint::from_bytes_be(&prime1.to_bytes_be());
        let q = rsa::BigUint::from_bytes_be(&prime2.to_bytes_be());

        let private = RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(|err| ShadeError::KeyFormatError(format!("invalid RSA components: {err}")))?;

        let public_blob = build_public_key_blob(&private, bit_len as u32);
        Ok(StrongNameKey { private, public_blob })
    }

    /// Fixed 12-byte CAPI container header + PUBLICKEYBLOB, as required for
    /// the assembly's public-key metadata field.
    pub fn public_key_container(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.public_blob.len());
        out.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
        out.extend_from_slice(&CALG_SHA1.to_le_bytes());
        out.extend_from_slice(&(self.public_blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.public_blob);
        out
    }

    /// Reversed last 8 bytes of SHA-1 over the public-key container (§4.8).
    pub fn public_key_token(&self) -> [u8; 8] {
        let container = self.public_key_container();
        let digest = Sha1::digest(&container);
        let mut token = [0u8; 8];
        token.copy_from_slice(&digest[digest.len() - 8..]);
        token.reverse();
        token
    }
}

fn read_reversed_uint(blob: &[u8], cursor: &mut usize, len: usize) -> Result<BigUint> {
    let slice = blob
        .get(*cursor..*cursor + len)
        .ok_or_else(|| ShadeError::KeyFormatError("key blob truncated".into()))?;
    *cursor += len;
    let mut reversed = slice.to_vec();
    reversed.reverse();
    Ok(BigUint::from_bytes_be(&reversed))
}

fn build_public_key_blob(private: &RsaPrivateKey, bit_len: u32) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.push(PUBLICKEYBLOB);
    blob.push(2); // version
    blob.extend_from_slice(&0u16.to_le_bytes()); // reserved
    blob.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
    blob.extend_from_slice(b"RSA1");
    blob.extend_from_slice(&bit_len.to_le_bytes());

    let public_exponent: u32 = private
        .e()
        .to_bytes_be()
        .iter()
        .fold(0u32, |acc, &byte| (acc << 8) | byte as u32);
    blob.extend_from_slice(&public_exponent.to_le_bytes());

    let mut modulus = private.n().to_bytes_be();
    modulus.reverse();
    modulus.resize((bit_len / 8) as usize, 0);
    blob.extend_from_slice(&modulus);
    blob
}

/// Signs the output image in place: zeroes the signature region, hashes the
/// file minus the checksum and signature regions, signs with RSA-PKCS1
/// SHA-1, writes the byte-reversed signature (§4.8).
///
/// Returns `false` if the image has no strong-name signature placeholder.
pub fn sign(out: &mut [u8], key: &StrongNameKey) -> Result<bool> {
    let pe = PeReader::open(out.to_vec())?;
    let strong_name = pe.cli_header.strong_name_signature;
    if !strong_name.is_present() {
        log::debug!("no strong-name signature directory present, skipping sign");
        return Ok(false);
    }

    let checksum_offset = pe.optional_header_file_offset() + 64;
    let signature_offset = pe.resolve_rva(strong_name.rva)?;
    let signature_size = strong_name.size as usize;

    out[signature_offset..signature_offset + signature_size].fill(0);

    let mut hasher = Sha1::new();
    let mut pos = 0usize;
    let skip_regions = [
        (checksum_offset, checksum_offset + 4),
        (signature_offset, signature_offset + signature_size),
    ];
    while pos < out.len() {
        let next_skip = skip_regions
            .iter()
            .filter(|(start, _)| *start >= pos)
            .map(|&(start, _)| start)
            .min();
        let chunk_end = next_skip.unwrap_or(out.len()).min(out.len());
        hasher.update(&out[pos..chunk_end]);
        pos = chunk_end;
        if let Some((start, end)) = skip_regions.iter().find(|(start, _)| *start == pos) {
            let _ = start;
            pos = *end;
        }
    }
    let digest = hasher.finalize();

    let mut signature_bytes = key
        .private
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|err| ShadeError::KeyFormatError(format!("signing failed: {err}")))?;
    signature_bytes.reverse();

    let truncated = &signature_bytes[..signature_bytes.len().min(signature_size)];
    out[signature_offset..signature_offset + truncated.len()].copy_from_slice(truncated);

    log::debug!("wrote {} byte strong-name signature", truncated.len());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_private_key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).unwrap()
    }

    #[test]
    fn public_key_token_is_eight_bytes() {
        let private = sample_private_key();
        let public_blob = build_public_key_blob(&private, 1024);
        let key = StrongNameKey { private, public_blob };
        assert_eq!(key.public_key_token().len(), 8);
    }

    #[test]
    fn public_key_container_has_capi_header() {
        let private = sample_private_key();
        let public_blob = build_public_key_blob(&private, 1024);
        let key = StrongNameKey { private, public_blob };
        let container = key.public_key_container();
        assert_eq!(&container[0..4], &CALG_RSA_SIGN.to_le_bytes());
        assert_eq!(&container[4..8], &CALG_SHA1.to_le_bytes());
    }
}
