//! SOPHIA - Value Codecs
//! Turn application values into the byte strings the engine stores, and back.
//!
//! - [`RawCodec`]: bytes as-is
//! - [`StringCodec`]: UTF-8 text
//! - [`BincodeCodec`]: any serde type, as a versioned bincode body
//!
//! ## Bincode encoding
//! ```text
//! [0xB1][version: 1][bincode body]
//! ```
//! The body uses fixed-width little-endian integers, so equal values always
//! produce identical bytes. Decoding rejects a wrong header and trailing bytes.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SophiaError};

const BINCODE_MAGIC: u8 = 0xB1;
const BINCODE_VERSION: u8 = 1;
const HEADER_LEN: usize = 2;

/// Two-way mapping between values of `T` and stored bytes.
pub trait Codec<T> {
    /// Fails with `UnsupportedType` if the value's shape cannot be represented.
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Fails with `Decode` if `bytes` were not produced by this codec for `T`.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Identity codec for byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SophiaError::Decode(format!("invalid UTF-8: {}", e)))
    }
}

/// Serde-based codec for structured values.
///
/// Works for any `T: Serialize + DeserializeOwned`. Types whose `Serialize`
/// impl refuses to serialize (or uses features bincode lacks, such as
/// `serialize_any` style self-describing data) fail with `UnsupportedType`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl<T: Serialize + DeserializeOwned> Codec<T> for BincodeCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let body = bincode_options()
            .serialize(value)
            .map_err(|e| SophiaError::UnsupportedType(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(BINCODE_MAGIC);
        out.push(BINCODE_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let body = match bytes {
            [BINCODE_MAGIC, BINCODE_VERSION, body @ ..] => body,
            [BINCODE_MAGIC, version, ..] => {
                return Err(SophiaError::Decode(format!(
                    "unsupported encoding version {}",
                    version
                )))
            }
            _ => return Err(SophiaError::Decode("missing encoding header".into())),
        };

        // A length prefix can never claim more bytes than the input holds.
        bincode_options()
            .with_limit(body.len() as u64)
            .deserialize(body)
            .map_err(|e| SophiaError::Decode(e.to_string()))
    }
}
