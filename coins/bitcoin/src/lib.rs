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

//! The few pieces of Bitcoin the mining pipeline needs: the 80-byte block
//! header, SHA256 midstates over its first chunk, and target/difficulty
//! arithmetic.

pub mod test_utils;

use bitcoin_hashes::{sha256, HashEngine};
// the double hash type is part of this crate's API so that dependents never
// import bitcoin_hashes themselves
pub use bitcoin_hashes::{hex::FromHex, sha256d::Hash as DHash, Hash as HashTrait};

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use lazy_static::lazy_static;
use thiserror::Error;

use std::fmt;

/// Serialized length of a block header
pub const HEADER_LEN: usize = 80;
/// Header bytes absorbed into a midstate (one SHA256 input block); the
/// merkle root tail, ntime, nbits and the nonce are what remains
pub const MIDSTATE_INPUT_LEN: usize = 64;

/// Header version bits reserved for rolling by BIP320 (bits 13..=28)
pub const BIP320_VERSION_MASK: u32 = 0x1fffe000;
/// Position of the lowest rollable version bit
pub const BIP320_VERSION_SHIFT: u32 = 13;

mod u256 {
    //! 256-bit unsigned integer for target arithmetic, isolated in its own
    //! module so the macro-generated `FromStr`/`from_str_radix` impls (which
    //! reference the unqualified `Result` from the prelude) don't resolve
    //! against this crate's single-parameter `Result<T>` alias.
    uint::construct_uint! {
        pub struct U256(4);
    }
}
pub use u256::U256;

lazy_static! {
    /// The difficulty-1 reference target, 0xffff scaled into the top of the
    /// 256-bit space ("truediffone" in mining folklore)
    static ref DIFFICULTY_1_TARGET: U256 = U256::from(0xffffu64) << 208;
    /// Same value as a double, the numerator of every difficulty quotient
    static ref DIFFICULTY_1_F64: f64 = u256_to_f64(*DIFFICULTY_1_TARGET);
}

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("compact target {0:#010x} has negative mantissa")]
    NegativeTarget(u32),
    #[error("compact target {0:#010x} overflows 256 bits")]
    TargetOverflow(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One block header in the exact field order it is hashed. The integer
/// fields serialize little endian; `prev_hash` and `merkle_root` hold the
/// hashes in their serialized byte order (not the reversed display form).
#[derive(PackedStruct, Debug, Clone, Copy, Default)]
#[packed_struct(endian = "lsb")]
pub struct Header {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub nonce: u32,
}

impl Header {
    /// Serialized header, the input of the proof-of-work function
    #[inline]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        self.pack()
    }

    /// Double SHA256 of the serialized header
    pub fn hash(&self) -> DHash {
        DHash::hash(&self.to_bytes())
    }

    /// SHA256 state after absorbing the first header chunk. Everything in
    /// that chunk is fixed per job, so it is hashed once on the host and
    /// the chips continue from here.
    pub fn midstate(&self) -> Midstate {
        let mut engine = sha256::Hash::engine();
        engine.input(&self.to_bytes()[..MIDSTATE_INPUT_LEN]);
        Midstate(engine.midstate())
    }
}

/// Intermediate SHA256 state over the first header chunk, stored as the
/// big endian serialization of the eight state words
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Midstate([u8; 32]);

impl Midstate {
    pub fn from_hex(s: &str) -> std::result::Result<Self, bitcoin_hashes::Error> {
        FromHex::from_hex(s).map(Self)
    }

    /// The state with its byte order flipped, which is how job frames
    /// carry it
    pub fn to_reversed_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::LowerHex for Midstate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Midstate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

impl fmt::Debug for Midstate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Midstate({:x})", self)
    }
}

/// Mining target derived either from the network compact representation
/// (nBits) or from a pool difficulty. A hash meets the target when,
/// interpreted as a 256-bit little endian integer, it is not above it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
    /// Expand the compact nBits form: `target = mantissa * 256^(exponent - 3)`
    pub fn from_compact(bits: u32) -> Result<Self> {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x00ff_ffff;

        if mantissa & 0x0080_0000 != 0 {
            return Err(Error::NegativeTarget(bits));
        }
        let value = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            if exponent > 32 {
                return Err(Error::TargetOverflow(bits));
            }
            U256::from(mantissa) << (8 * (exponent - 3))
        };
        Ok(Self(value))
    }

    /// Target for a whole-number pool difficulty: `difficulty_1_target / difficulty`
    pub fn from_pool_difficulty(difficulty: u64) -> Self {
        assert!(difficulty > 0, "BUG: zero difficulty target");
        Self(*DIFFICULTY_1_TARGET / U256::from(difficulty))
    }

    /// Difficulty corresponding to this target
    pub fn get_difficulty(&self) -> f64 {
        *DIFFICULTY_1_F64 / u256_to_f64(self.0)
    }

    /// Check whether a block header double hash satisfies this target
    pub fn is_met_by(&self, hash: &DHash) -> bool {
        hash_to_u256(hash) <= self.0
    }

    #[inline]
    pub fn into_inner(self) -> U256 {
        self.0
    }
}

impl Default for Target {
    /// Difficulty 1 target
    fn default() -> Self {
        Self(*DIFFICULTY_1_TARGET)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:064x}", self.0)
    }
}

impl fmt::LowerHex for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:064x}", self.0)
    }
}

/// Difficulty of one particular hash: `difficulty_1_target / hash`.
/// This is the "share difficulty" a pool compares against its requested
/// difficulty.
pub fn hash_difficulty(hash: &DHash) -> f64 {
    *DIFFICULTY_1_F64 / u256_to_f64(hash_to_u256(hash))
}

fn hash_to_u256(hash: &DHash) -> U256 {
    U256::from_little_endian(&hash.into_inner())
}

fn u256_to_f64(value: U256) -> f64 {
    // limbs are little endian u64 words
    value
        .0
        .iter()
        .rev()
        .fold(0f64, |acc, &limb| acc * 18446744073709551616f64 + limb as f64)
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::test_utils::TEST_BLOCKS;
    use approx::assert_relative_eq;

    #[test]
    fn test_header_serialization_and_hash() {
        for block in TEST_BLOCKS.iter() {
            let header = Header {
                version: block.version,
                prev_hash: block.previous_hash.into_inner(),
                merkle_root: block.merkle_root.into_inner(),
                ntime: block.time,
                nbits: block.bits,
                nonce: block.nonce,
            };

            assert_eq!(block.header_bytes[..], header.to_bytes()[..]);
            assert_eq!(block.hash, header.hash());
            assert_eq!(block.hash_str, format!("{:x}", header.hash()));
        }
    }

    #[test]
    fn test_header_midstate() {
        for block in TEST_BLOCKS.iter() {
            let header = Header {
                version: block.version,
                prev_hash: block.previous_hash.into_inner(),
                merkle_root: block.merkle_root.into_inner(),
                ..Default::default()
            };

            let midstate = header.midstate();
            assert_eq!(block.midstate, midstate);
            assert_eq!(block.midstate_str, format!("{:x}", midstate));
        }
    }

    #[test]
    fn test_midstate_reversal() {
        let midstate = Midstate::from_hex(
            "bc909a336358bff090ccac7d1e59caa8c3c8d8e94f0103c896b187364719f91b",
        )
        .expect("parse midstate");
        let reversed = midstate.to_reversed_bytes();
        assert_eq!(reversed[0], 0x1b);
        assert_eq!(reversed[31], 0xbc);
    }

    #[test]
    fn test_target_difficulty_1() {
        // 0x1d00ffff expands to exactly the difficulty 1 target
        let target = Target::from_compact(0x1d00ffff).expect("compact");
        assert_eq!(target, Target::default());
        assert_relative_eq!(target.get_difficulty(), 1.0, max_relative = 1e-12);
        // and equals the whole-number pool difficulty construction
        assert_eq!(target, Target::from_pool_difficulty(1));
    }

    #[test]
    fn test_target_from_compact_rejects() {
        // negative mantissa
        assert_eq!(
            Target::from_compact(0x1d80ffff),
            Err(Error::NegativeTarget(0x1d80ffff))
        );
        // exponent too large
        assert_eq!(
            Target::from_compact(0x2100ffff),
            Err(Error::TargetOverflow(0x2100ffff))
        );
    }

    #[test]
    fn test_network_difficulty() {
        let target = Target::from_compact(0x1a44b9f2).expect("compact");
        assert_relative_eq!(target.get_difficulty(), 2.4411248777e5, max_relative = 1e-9);
    }

    #[test]
    fn test_hash_difficulty() {
        let expected = [2.5364262984e3, 3.5987218906e10];
        for (block, &difficulty) in TEST_BLOCKS.iter().zip(expected.iter()) {
            assert_relative_eq!(
                hash_difficulty(&block.hash),
                difficulty,
                max_relative = 1e-9
            );
        }
    }

    #[test]
    fn test_hash_meets_own_target() {
        for block in TEST_BLOCKS.iter() {
            let network_target = Target::from_compact(block.bits).expect("compact");
            assert!(network_target.is_met_by(&block.hash));
            // a solved block always meets difficulty 1, too
            assert!(Target::default().is_met_by(&block.hash));
        }
    }

    #[test]
    fn test_pool_difficulty_monotonic() {
        let d1 = Target::from_pool_difficulty(1);
        let d256 = Target::from_pool_difficulty(256);
        assert!(d256 < d1);
        assert_relative_eq!(d256.get_difficulty(), 256.0, max_relative = 1e-9);
    }
}
