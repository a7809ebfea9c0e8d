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

//! Shared fixtures for the pipeline tests, derived from one reference
//! notification whose intermediate values are known.

use crate::config;
use crate::job;

use axe_bitcoin::test_utils::TestBlock;
use axe_bitcoin::HashTrait as _;

use std::convert::TryInto;
use std::sync::Arc;

/// coinbase_1 of the reference notification
pub const COINBASE_1: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008";
/// coinbase_2 of the reference notification
pub const COINBASE_2: &str = "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000";
/// The single merkle branch of the reference notification
pub const MERKLE_BRANCH: &str = "1406e05881e299367766d313e26c05564ec91bf721d31726bd6e46e60689539a";
/// Previous hash in stratum word order (the header form of block 125552)
pub const PREV_HASH_STRATUM: &str =
    "ab02cd818b9e567ee21793cddef299feb29ad444a41b85b8000008a300000000";
/// Previous hash in block header byte order
pub const PREV_HASH_HEADER: &str =
    "81cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000";

fn hex_bytes(s: &str) -> Vec<u8> {
    hex::decode(s).expect("valid fixture hex")
}

fn hex_array(s: &str) -> [u8; 32] {
    hex_bytes(s).try_into().expect("fixture is 32 bytes")
}

/// Reference coinbase with extranonce_1 08000002 and extranonce_2 00000003
pub fn sample_coinbase() -> Vec<u8> {
    let mut coinbase = hex_bytes(COINBASE_1);
    coinbase.extend_from_slice(&[0x08, 0x00, 0x00, 0x02]);
    coinbase.extend_from_slice(&[0x00, 0x00, 0x00, 0x03]);
    coinbase.extend_from_slice(&hex_bytes(COINBASE_2));
    coinbase
}

pub fn sample_session() -> job::SessionParams {
    job::SessionParams {
        extranonce_1: vec![0x08, 0x00, 0x00, 0x02],
        extranonce_2_size: 4,
        version_mask: 0x1fff_e000,
        pool_difficulty: 512.0,
    }
}

pub fn sample_notification(epoch: u64) -> job::Notification {
    job::Notification {
        job_id: "62aa2b0f".to_string(),
        prev_hash: hex_array(PREV_HASH_STRATUM),
        coinbase_1: hex_bytes(COINBASE_1),
        coinbase_2: hex_bytes(COINBASE_2),
        merkle_branches: vec![hex_array(MERKLE_BRANCH)],
        version: 0x2000_0000,
        nbits: 0x1a44_b9f2,
        ntime: 0x4dd7_f5c7,
        clean_jobs: false,
        epoch,
    }
}

pub fn sample_miner_job(epoch: u64) -> job::MinerJob {
    sample_miner_job_with_difficulty(epoch, 512.0)
}

pub fn sample_miner_job_with_difficulty(epoch: u64, pool_difficulty: f64) -> job::MinerJob {
    job::MinerJob {
        job_id: "62aa2b0f".to_string(),
        extranonce_2: vec![0x00, 0x00, 0x00, 0x03],
        version: 0x2000_0000,
        version_mask: 0x1fff_e000,
        prev_hash_le: hex_array(PREV_HASH_HEADER),
        merkle_root_le: hex_array(
            "f361db1dad2e238d4f600369553420c0fa8c37726c43a7fdb58740354dd0d671",
        ),
        ntime: 0x4dd7_f5c7,
        nbits: 0x1a44_b9f2,
        pool_difficulty,
        epoch,
        starting_nonce: 0,
        midstates: Vec::new(),
    }
}

/// A job whose header matches a solved reference block, so its real nonce
/// validates
pub fn miner_job_from_block(block: &TestBlock, pool_difficulty: f64) -> job::MinerJob {
    job::MinerJob {
        job_id: "block".to_string(),
        extranonce_2: vec![0, 0, 0, 0],
        version: block.version,
        version_mask: 0,
        prev_hash_le: block.previous_hash.into_inner(),
        merkle_root_le: block.merkle_root.into_inner(),
        ntime: block.time,
        nbits: block.bits,
        pool_difficulty,
        epoch: 0,
        starting_nonce: 0,
        midstates: Vec::new(),
    }
}

/// Settings store on a scratch path; reads fall back to defaults
pub fn sample_store() -> Arc<config::Store> {
    let path = std::env::temp_dir().join(format!("axeminer-test-{}.toml", std::process::id()));
    Arc::new(config::Store::load(path.to_str().expect("utf-8 path")).expect("load store"))
}
