//! Binary scene cache.
//!
//! A cache file holds the same document tree as the JSON form, encoded as
//! CBOR and compressed with zstd, behind a small header:
//! ```text
//! b"SCNB"                  - magic
//! u32 little endian        - schema version
//! 64 ASCII hex digits      - SHA-256 of the compressed payload
//! zstd(cbor(document))     - payload
//! ```
//! Decoding is fail-closed: a wrong magic, schema version or digest is an
//! error and nothing is returned.

use crate::PersistError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub const MAGIC: [u8; 4] = *b"SCNB";
pub const SCHEMA_VERSION: u32 = 1;
const DIGEST_LEN: usize = 64;
const HEADER_LEN: usize = MAGIC.len() + 4 + DIGEST_LEN;

/// Encode a document as a cache file.
pub fn encode(document: &Value) -> Result<Vec<u8>, PersistError> {
    let payload = zstd_compress(&cbor_serialize(document)?)?;
    let digest = sha256_hex(&payload);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(digest.as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode and verify a cache file.
pub fn decode(data: &[u8]) -> Result<Value, PersistError> {
    if data.len() < HEADER_LEN || data[..MAGIC.len()] != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let (version, rest) = data[MAGIC.len()..].split_at(4);
    let file_version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if file_version != SCHEMA_VERSION {
        return Err(PersistError::SchemaMismatch {
            file_version,
            expected_version: SCHEMA_VERSION,
        });
    }
    let (expected, payload) = rest.split_at(DIGEST_LEN);
    let expected = String::from_utf8_lossy(expected).into_owned();
    let actual = sha256_hex(payload);
    if expected != actual {
        return Err(PersistError::IntegrityMismatch { expected, actual });
    }
    cbor_deserialize(&zstd_decompress(payload)?)
}

/// Whether `data` starts like a cache file.
pub fn is_cache(data: &[u8]) -> bool {
    data.starts_with(&MAGIC)
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PersistError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PersistError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, PersistError> {
    ciborium::from_reader(data).map_err(|e| PersistError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
