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

//! Stratum V1 messages are JSON-RPC 1.0 objects; this module provides the
//! envelope types. Whether an object is a request or a response is decided
//! by the presence of the `method` field.

use crate::error::{Error, Result};

use serde::{Deserialize, Deserializer, Serialize};

use std::convert::TryFrom;

/// All methods the client understands, in both directions
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Method {
    #[serde(rename = "mining.configure")]
    Configure,
    #[serde(rename = "mining.subscribe")]
    Subscribe,
    #[serde(rename = "mining.authorize")]
    Authorize,
    #[serde(rename = "mining.suggest_difficulty")]
    SuggestDifficulty,
    #[serde(rename = "mining.set_difficulty")]
    SetDifficulty,
    #[serde(rename = "mining.set_version_mask")]
    SetVersionMask,
    #[serde(rename = "mining.notify")]
    Notify,
    #[serde(rename = "mining.submit")]
    Submit,
    #[serde(rename = "client.reconnect")]
    ClientReconnect,
    /// Anything else the server may come up with; never serialized
    #[serde(other, rename = "unknown")]
    Unknown,
}

/// Method and parameters of a request, shared between new requests being
/// built and inbound parsed ones
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RequestPayload {
    pub method: Method,
    pub params: serde_json::Value,
}

/// A request; notifications from the server carry `id: null`
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Request {
    pub id: Option<u32>,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

/// Result payload of a successful response
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct StratumResult(pub serde_json::Value);

/// Error payload: `[code, message, traceback]`
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct StratumError(pub i32, pub String, pub Option<String>);

/// A response correlated to a request by `id`
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Response {
    pub id: u32,
    #[serde(default)]
    pub result: Option<StratumResult>,
    #[serde(default)]
    pub error: Option<StratumError>,
}

/// One parsed protocol message in either direction
#[derive(Serialize, PartialEq, Clone, Debug)]
#[serde(untagged)]
pub enum Rpc {
    Request(Request),
    Response(Response),
}

impl Rpc {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

impl From<Request> for Rpc {
    fn from(request: Request) -> Self {
        Rpc::Request(request)
    }
}

impl From<Response> for Rpc {
    fn from(response: Response) -> Self {
        Rpc::Response(response)
    }
}

impl<'de> Deserialize<'de> for Rpc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("method").is_some() {
            serde_json::from_value::<Request>(value)
                .map(Rpc::Request)
                .map_err(serde::de::Error::custom)
        } else {
            serde_json::from_value::<Response>(value)
                .map(Rpc::Response)
                .map_err(serde::de::Error::custom)
        }
    }
}

impl TryFrom<&str> for Rpc {
    type Error = Error;

    fn try_from(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(Into::into)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn test_deserialize_request() {
        let line = r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#;
        match Rpc::try_from(line).expect("parse") {
            Rpc::Request(request) => {
                assert_eq!(request.id, None);
                assert_eq!(request.payload.method, Method::SetDifficulty);
            }
            Rpc::Response(_) => panic!("expected a request"),
        }
    }

    #[test]
    fn test_deserialize_response() {
        let line = r#"{"id":2,"result":true,"error":null}"#;
        match Rpc::try_from(line).expect("parse") {
            Rpc::Response(response) => {
                assert_eq!(response.id, 2);
                assert_eq!(
                    response.result,
                    Some(StratumResult(serde_json::Value::Bool(true)))
                );
                assert_eq!(response.error, None);
            }
            Rpc::Request(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_deserialize_error_response() {
        let line = r#"{"id":4,"result":null,"error":[21,"Job not found",null]}"#;
        match Rpc::try_from(line).expect("parse") {
            Rpc::Response(response) => {
                let error = response.error.expect("error is present");
                assert_eq!(error.0, 21);
                assert_eq!(error.1, "Job not found");
            }
            Rpc::Request(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn test_unknown_method() {
        let line = r#"{"id":null,"method":"mining.ping","params":[]}"#;
        match Rpc::try_from(line).expect("parse") {
            Rpc::Request(request) => assert_eq!(request.payload.method, Method::Unknown),
            Rpc::Response(_) => panic!("expected a request"),
        }
    }

    #[test]
    fn test_serialize_request() {
        let request = Request {
            id: Some(1),
            payload: RequestPayload {
                method: Method::Subscribe,
                params: serde_json::json!(["test-agent/0.1"]),
            },
        };
        let line = Rpc::from(request).to_json_string().expect("serialize");
        assert_eq!(
            line,
            r#"{"id":1,"method":"mining.subscribe","params":["test-agent/0.1"]}"#
        );
    }
}
