// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Stratum V1 protocol: line-delimited JSON-RPC messages and framing.
//! The protocol is client-agnostic, actual session handling lives with the
//! consumer of this crate.

pub mod error;
pub mod framing;
pub mod messages;
pub mod rpc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::convert::TryFrom;
use std::fmt;

pub use error::{Error, Result};

/// Arbitrary binary payload serialized as a hex string
#[derive(Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl TryFrom<&str> for HexBytes {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Ok(Self(hex::decode(value).map_err(|e| {
            Error::Rpc(format!("invalid hex string: {}", e))
        })?))
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HexBytes({})", hex::encode(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(&value)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Unsigned 32-bit integer serialized as a big endian hex string
/// (e.g. nbits "1d00ffff")
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HexU32Be(pub u32);

impl Serialize for HexU32Be {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:08x}", self.0))
    }
}

impl<'de> Deserialize<'de> for HexU32Be {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let stripped = value.trim_start_matches("0x");
        u32::from_str_radix(stripped, 16)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Previous block hash as it appears inside `mining.notify`: 64 hex
/// characters carrying the hash as eight 32-bit words. The bytes are kept
/// exactly as transmitted; word order fix-ups are a job construction concern.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrevHash([u8; 32]);

impl PrevHash {
    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }
}

impl AsRef<[u8]> for PrevHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for PrevHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PrevHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrevHash({})", hex::encode(&self.0[..]))
    }
}

impl Serialize for PrevHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0[..]))
    }
}

impl<'de> Deserialize<'de> for PrevHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let bytes = hex::decode(&value).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "previous hash has {} bytes, expected 32",
                bytes.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_bytes_round_trip() {
        let bytes = HexBytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&bytes).expect("serialize");
        assert_eq!(json, "\"deadbeef\"");
        let parsed: HexBytes = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, bytes);
    }

    #[test]
    fn test_hex_u32_be() {
        let bits: HexU32Be = serde_json::from_str("\"1d00ffff\"").expect("deserialize");
        assert_eq!(bits.0, 0x1d00ffff);
        assert_eq!(
            serde_json::to_string(&HexU32Be(0x20000000)).expect("serialize"),
            "\"20000000\""
        );
    }

    #[test]
    fn test_prev_hash_length_check() {
        let short = serde_json::from_str::<PrevHash>("\"aabb\"");
        assert!(short.is_err());
    }
}
