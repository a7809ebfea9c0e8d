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

//! Real Bitcoin blocks used as reference vectors across the workspace tests

use crate::{DHash, FromHex, Midstate};

use lazy_static::lazy_static;

use std::convert::TryInto;

/// A solved mainnet block with all the intermediate values a miner core
/// computes on the way to the proof of work
#[derive(Clone, Copy, Debug)]
pub struct TestBlock {
    pub version: u32,
    pub previous_hash: DHash,
    pub merkle_root: DHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub hash: DHash,
    pub hash_str: &'static str,
    pub midstate: Midstate,
    pub midstate_str: &'static str,
    pub header_bytes: [u8; 80],
}

impl TestBlock {
    fn new(
        version: u32,
        previous_hash: &str,
        merkle_root: &str,
        time: u32,
        bits: u32,
        nonce: u32,
        hash_str: &'static str,
        midstate_str: &'static str,
        header_hex: &str,
    ) -> Self {
        Self {
            version,
            previous_hash: DHash::from_hex(previous_hash).expect("parse previous hash"),
            merkle_root: DHash::from_hex(merkle_root).expect("parse merkle root"),
            time,
            bits,
            nonce,
            hash: DHash::from_hex(hash_str).expect("parse block hash"),
            hash_str,
            midstate: Midstate::from_hex(midstate_str).expect("parse midstate"),
            midstate_str,
            header_bytes: hex::decode(header_hex)
                .expect("parse header hex")
                .try_into()
                .expect("header is 80 bytes"),
        }
    }
}

lazy_static! {
    pub static ref TEST_BLOCKS: Vec<TestBlock> = vec![
        // Mainnet block 0 (genesis)
        TestBlock::new(
            1,
            "0000000000000000000000000000000000000000000000000000000000000000",
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            1231006505,
            0x1d00ffff,
            2083236893,
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "bc909a336358bff090ccac7d1e59caa8c3c8d8e94f0103c896b187364719f91b",
            "0100000000000000000000000000000000000000000000000000000000000000000000\
             003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab\
             5f49ffff001d1dac2b7c",
        ),
        // Mainnet block 125552
        TestBlock::new(
            1,
            "00000000000008a3a41b85b8b29ad444def299fee21793cd8b9e567eab02cd81",
            "2b12fcf1b09288fcaff797d71e950e71ae42b91e8bdb2304758dfcffc2b620e3",
            1305998791,
            0x1a44b9f2,
            2504433986,
            "00000000000000001e8d6829a8a21adc5d38d0a473b144b6765798e61f98bd1d",
            "9524c59305c5671316e669ba2d2810a007e86e372f56a9dacd5bce697a78da2d",
            "0100000081cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a3080000000000\
             00e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122bc7f5\
             d74df2b9441a42a14695",
        ),
    ];
}
