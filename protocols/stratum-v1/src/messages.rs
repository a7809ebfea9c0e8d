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

//! The messages of the Stratum V1 dialect this client speaks.
//!
//! V1 carries request parameters as positional JSON arrays, which maps
//! poorly onto named Rust structs. `positional_message!` bridges the two:
//! each message is declared with named public fields and gets a
//! (de)serializer that goes through the corresponding tuple, so the wire
//! stays positional while the code never indexes into tuples.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rpc::{self, Method};
use crate::{HexBytes, HexU32Be, PrevHash};

use std::convert::TryFrom;

/// Declare a message struct whose serialized form is the positional array
/// of its fields, in declaration order
macro_rules! positional_message {
    (
        $(#[$meta:meta])*
        pub struct $message:ident {
            $( $(#[$field_meta:meta])* pub $field:ident: $ty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $message {
            $( $(#[$field_meta])* pub $field: $ty, )+
        }

        impl serde::Serialize for $message {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                ($(&self.$field,)+).serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $message {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let ($($field,)+) = <($($ty,)+)>::deserialize(deserializer)?;
                Ok(Self { $($field),+ })
            }
        }
    };
}

/// Tie a message to its wire method: the message converts into a request
/// payload for sending, and a parsed request converts back into the
/// message after a method check
macro_rules! request_message {
    ($message:ty => $method:path) => {
        impl TryFrom<$message> for rpc::RequestPayload {
            type Error = Error;

            fn try_from(message: $message) -> Result<Self> {
                Ok(Self {
                    method: $method,
                    params: serde_json::to_value(message)?,
                })
            }
        }

        impl TryFrom<rpc::Request> for $message {
            type Error = Error;

            fn try_from(request: rpc::Request) -> Result<Self> {
                if request.payload.method != $method {
                    return Err(Error::Rpc(format!(
                        "{:?} request cannot carry {}",
                        request.payload.method,
                        stringify!($message)
                    )));
                }
                serde_json::from_value(request.payload.params).map_err(Into::into)
            }
        }
    };
}

/// Decode the result a response carries; an absent result (i.e. an error
/// response) is reported as such
pub fn parse_result<T: serde::de::DeserializeOwned>(response: rpc::Response) -> Result<T> {
    let payload = response
        .result
        .ok_or_else(|| Error::Rpc("response carries no result".to_string()))?;
    serde_json::from_value(payload.0).map_err(Into::into)
}

/// Parameters of the BIP310 version-rolling extension, a flat JSON object
/// with dotted keys
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct VersionRolling {
    #[serde(rename = "version-rolling.mask")]
    pub mask: HexU32Be,
    #[serde(rename = "version-rolling.min-bit-count")]
    pub min_bit_count: usize,
}

positional_message! {
    /// `mining.configure`: extension negotiation. The first element lists
    /// the extension keys being requested, the second holds all their
    /// parameters merged into one object.
    pub struct Configure {
        pub extensions: Vec<String>,
        pub parameters: serde_json::Value,
    }
}

impl Configure {
    /// Request version rolling, the only extension this miner negotiates
    pub fn version_rolling(mask: u32, min_bit_count: usize) -> Result<Self> {
        Ok(Self {
            extensions: vec!["version-rolling".to_string()],
            parameters: serde_json::to_value(VersionRolling {
                mask: HexU32Be(mask),
                min_bit_count,
            })?,
        })
    }
}

request_message!(Configure => Method::Configure);

/// Whatever subset of the requested extensions the server granted,
/// kept as the raw feature map
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(transparent)]
pub struct ConfigureResult {
    pub features: serde_json::Value,
}

impl ConfigureResult {
    /// The version rolling mask, when the server granted the extension
    pub fn version_rolling_mask(&self) -> Option<u32> {
        if self.features.get("version-rolling") != Some(&serde_json::Value::Bool(true)) {
            return None;
        }
        let mask = self.features.get("version-rolling.mask")?.as_str()?;
        u32::from_str_radix(mask.trim_start_matches("0x"), 16).ok()
    }
}

positional_message! {
    /// `mining.subscribe`; the miner introduces itself with its user agent
    pub struct Subscribe {
        pub agent: String,
    }
}

request_message!(Subscribe => Method::Subscribe);

positional_message! {
    /// What the subscription established: the pool's notification
    /// subscriptions (kept opaque), the session extranonce and how many
    /// bytes of extranonce are ours to roll
    pub struct SubscribeResult {
        pub subscriptions: Vec<(String, String)>,
        pub extranonce_1: HexBytes,
        pub extranonce_2_size: usize,
    }
}

positional_message! {
    /// `mining.authorize`: worker credentials
    pub struct Authorize {
        pub user: String,
        pub password: String,
    }
}

request_message!(Authorize => Method::Authorize);

positional_message! {
    /// `mining.suggest_difficulty`: a hint, the pool may ignore it
    pub struct SuggestDifficulty {
        pub difficulty: f64,
    }
}

request_message!(SuggestDifficulty => Method::SuggestDifficulty);

positional_message! {
    /// `mining.set_difficulty`: share target for everything submitted from
    /// now on
    pub struct SetDifficulty {
        pub difficulty: f64,
    }
}

request_message!(SetDifficulty => Method::SetDifficulty);

positional_message! {
    /// `mining.set_version_mask`: the server adjusted the rollable bits
    pub struct SetVersionMask {
        pub mask: HexU32Be,
    }
}

request_message!(SetVersionMask => Method::SetVersionMask);

positional_message! {
    /// `mining.notify`: fresh work. Hashes and coinbase halves stay in
    /// their transmitted byte order; interpreting them is the job
    /// builder's business.
    pub struct Notify {
        pub job_id: String,
        pub prev_hash: PrevHash,
        pub coinbase_1: HexBytes,
        pub coinbase_2: HexBytes,
        pub merkle_branches: Vec<HexBytes>,
        pub version: HexU32Be,
        pub nbits: HexU32Be,
        pub ntime: HexU32Be,
        /// Everything dispatched before this notification is void
        pub clean_jobs: bool,
    }
}

request_message!(Notify => Method::Notify);

positional_message! {
    /// `mining.submit`: one solved share
    pub struct Submit {
        pub user: String,
        pub job_id: String,
        pub extranonce_2: HexBytes,
        pub ntime: HexU32Be,
        pub nonce: HexU32Be,
        /// Full block header version after rolling
        pub version: HexU32Be,
    }
}

request_message!(Submit => Method::Submit);

/// Pool-initiated reconnect. Parameters are `[host, port, wait_time]`, all
/// optional, and some servers send the port as a string, so the conversion
/// is implemented by hand over the raw params.
#[derive(PartialEq, Clone, Debug, Default)]
pub struct ClientReconnect {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub wait_time: Option<u64>,
}

impl TryFrom<rpc::Request> for ClientReconnect {
    type Error = Error;

    fn try_from(request: rpc::Request) -> Result<Self> {
        if request.payload.method != Method::ClientReconnect {
            return Err(Error::Rpc(format!(
                "{:?} request cannot carry ClientReconnect",
                request.payload.method
            )));
        }

        let params = match request.payload.params {
            serde_json::Value::Array(params) => params,
            serde_json::Value::Null => vec![],
            _ => return Err(Error::Rpc("client.reconnect params are not an array".into())),
        };

        let host = params
            .get(0)
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        let port = match params.get(1) {
            Some(serde_json::Value::Number(n)) => n.as_u64().map(|p| p as u16),
            Some(serde_json::Value::String(s)) => s.parse::<u16>().ok(),
            _ => None,
        };
        let wait_time = params.get(2).and_then(serde_json::Value::as_u64);

        Ok(Self {
            host,
            port,
            wait_time,
        })
    }
}
