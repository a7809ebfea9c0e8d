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

//! Newline-delimited JSON framing for Stratum V1. The decoder accumulates
//! bytes across socket reads and extracts one message per `\n`; a line that
//! fails to parse is logged and dropped rather than killing the session.

use axe_logging::macros::*;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::rpc::Rpc;

/// Upper bound for a single protocol line; anything longer indicates a
/// broken or malicious server
const MAX_LINE_LENGTH: usize = 16384;

#[derive(Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Codec {
    type Item = Rpc;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rpc>> {
        loop {
            let newline_pos = match src.iter().position(|&byte| byte == b'\n') {
                Some(pos) => pos,
                None => {
                    if src.len() > MAX_LINE_LENGTH {
                        return Err(Error::LineTooLong(MAX_LINE_LENGTH));
                    }
                    return Ok(None);
                }
            };

            let line = src.split_to(newline_pos + 1);
            let line = &line[..newline_pos];
            // tolerate \r\n and keep-alive empty lines
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Rpc>(line) {
                Ok(rpc) => return Ok(Some(rpc)),
                Err(e) => {
                    // a single bad line is not a session-fatal condition
                    warn!(
                        "stratum: discarding malformed line ({}): {}",
                        e,
                        String::from_utf8_lossy(line)
                    );
                }
            }
        }
    }
}

impl Encoder<Rpc> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Rpc, dst: &mut BytesMut) -> Result<()> {
        let serialized = serde_json::to_vec(&item)?;
        dst.reserve(serialized.len() + 1);
        dst.put_slice(&serialized);
        dst.put_u8(b'\n');
        Ok(())
    }
}
