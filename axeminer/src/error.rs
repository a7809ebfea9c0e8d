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

//! The miner errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// General error used for more specific input/output error.
    #[error("{0}")]
    General(String),

    /// Standard input/output error.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame received from the hash chain.
    #[error("wire: {0}")]
    Frame(#[from] crate::bm13xx::FrameError),

    /// Error concerning the hashing chips.
    #[error("hashchip: {0}")]
    Hashchip(String),

    /// The chain stopped producing frames altogether.
    #[error("ASIC not responding after {0} consecutive timeouts")]
    AsicNotResponding(u32),

    /// Baud rate errors.
    #[error("baud rate: {0}")]
    BaudRate(String),

    /// PLL conversion error.
    #[error("PLL: {0}")]
    Pll(String),

    /// Transport or serialization error from the stratum layer.
    #[error("stratum: {0}")]
    Stratum(#[from] axe_stratum_v1::Error),

    /// The pool violated the protocol; the session must be dropped.
    #[error("stratum protocol: {0}")]
    Protocol(String),

    /// The pool refused our credentials; mining cannot continue.
    #[error("pool authorization failed: {0}")]
    AuthFailed(String),

    /// Configuration errors.
    #[error("configuration: {0}")]
    Config(String),
}

impl From<axe_bitcoin::Error> for Error {
    fn from(e: axe_bitcoin::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
