// SPDX-License-Identifier: MIT OR Apache-2.0

//! Value encodings applied to block payloads.
//!
//! Encodings are per-session: two sessions on the same log may read the
//! same blocks through different codecs. The cache stores bytes before
//! decoding, so that is safe.
use std::sync::Arc;

use crate::errors::LogError;

/// A user-supplied codec between application values and block bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, value: Vec<u8>) -> Result<Vec<u8>, LogError>;
    fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, LogError>;
}

/// Codec applied to every block written and read through a session.
#[derive(Clone, Default)]
pub enum ValueEncoding {
    /// Bytes pass through untouched.
    #[default]
    Raw,
    /// Blocks must be valid UTF-8.
    Utf8,
    /// Blocks must be valid JSON documents.
    Json,
    /// User codec.
    Custom(Arc<dyn Codec>),
}

impl ValueEncoding {
    pub fn encode(&self, value: Vec<u8>) -> Result<Vec<u8>, LogError> {
        match self {
            ValueEncoding::Raw => Ok(value),
            ValueEncoding::Utf8 => {
                std::str::from_utf8(&value)
                    .map_err(|err| LogError::Encoding(err.to_string()))?;
                Ok(value)
            }
            ValueEncoding::Json => {
                serde_json::from_slice::<serde_json::Value>(&value)
                    .map_err(|err| LogError::Encoding(err.to_string()))?;
                Ok(value)
            }
            ValueEncoding::Custom(codec) => codec.encode(value),
        }
    }

    pub fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, LogError> {
        match self {
            ValueEncoding::Raw => Ok(bytes),
            ValueEncoding::Utf8 => {
                std::str::from_utf8(&bytes)
                    .map_err(|err| LogError::Encoding(err.to_string()))?;
                Ok(bytes)
            }
            ValueEncoding::Json => {
                serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map_err(|err| LogError::Encoding(err.to_string()))?;
                Ok(bytes)
            }
            ValueEncoding::Custom(codec) => codec.decode(bytes),
        }
    }

    /// Resolve a codec by its conventional name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "binary" | "raw" => Some(ValueEncoding::Raw),
            "utf-8" | "utf8" => Some(ValueEncoding::Utf8),
            "json" => Some(ValueEncoding::Json),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ValueEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ValueEncoding::Raw => "raw",
            ValueEncoding::Utf8 => "utf-8",
            ValueEncoding::Json => "json",
            ValueEncoding::Custom(_) => "custom",
        };
        write!(f, "ValueEncoding({name})")
    }
}

/// Batch encoder overriding per-block encoding at append time.
pub type EncodeBatch =
    Arc<dyn Fn(Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, LogError> + Send + Sync>;
