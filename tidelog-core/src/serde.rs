// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serde support for the fixed-size byte newtypes.
//!
//! All of them encode the same way: raw bytes on binary formats (CBOR on
//! the wire and in the oplog), lowercase hex on human-readable ones. Each
//! newtype already parses from `TryFrom<&[u8]>`, so one generic
//! deserializer and one serializer helper cover the lot; the macro below
//! just wires the pair up per type.
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};

use crate::hash::Hash;
use crate::identity::{PrivateKey, PublicKey, Signature};

fn write_bytes<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&hex::encode(bytes))
    } else {
        Bytes::new(bytes).serialize(serializer)
    }
}

fn read_bytes<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: for<'a> TryFrom<&'a [u8]>,
    for<'a> <T as TryFrom<&'a [u8]>>::Error: fmt::Display,
{
    let raw = if deserializer.is_human_readable() {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(D::Error::custom)?
    } else {
        ByteBuf::deserialize(deserializer)?.into_vec()
    };
    T::try_from(raw.as_slice()).map_err(D::Error::custom)
}

macro_rules! bytes_as_hex {
    ($ty:ty, |$value:ident| $bytes:expr) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let $value = self;
                write_bytes(&$bytes, serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                read_bytes(deserializer)
            }
        }
    };
}

bytes_as_hex!(Hash, |hash| *hash.as_bytes());
bytes_as_hex!(PublicKey, |key| *key.as_bytes());
bytes_as_hex!(PrivateKey, |key| key.to_bytes());
bytes_as_hex!(Signature, |signature| signature.to_bytes());
