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

//! Turns pool notifications into chain-ready jobs: coinbase assembly, merkle
//! root, midstate precomputation and validation of candidate nonces.

use axe_bitcoin::{HashTrait as _, Header};
use axe_stratum_v1::messages;

use rand::Rng as _;

use crate::error::{Error, Result};

use std::convert::TryFrom;
use std::sync::Arc;

/// Default alignment and size of the nonce subrange a job starts in
/// (~400M nonces)
pub const DEFAULT_NONCE_SUBRANGE: u32 = 0x1800_0000;

/// Pool session parameters negotiated during the handshake and adjusted by
/// the pool while the session runs
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Pool-assigned extranonce, fixed for the session
    pub extranonce_1: Vec<u8>,
    /// Width of the miner-chosen extranonce in bytes
    pub extranonce_2_size: usize,
    /// Version bits the miner may roll
    pub version_mask: u32,
    /// Current share target difficulty
    pub pool_difficulty: f64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            extranonce_1: Vec::new(),
            extranonce_2_size: 4,
            version_mask: 0,
            pool_difficulty: 1.0,
        }
    }
}

/// One `mining.notify`, parsed and validated, tagged with the abandon epoch
/// it belongs to
#[derive(Debug, Clone)]
pub struct Notification {
    pub job_id: String,
    /// Previous block hash exactly as transmitted by the pool
    pub prev_hash: [u8; 32],
    pub coinbase_1: Vec<u8>,
    pub coinbase_2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
    pub epoch: u64,
}

impl Notification {
    /// Validate and convert the protocol message. Failures here mean the
    /// pool is misbehaving and the session has to be dropped.
    pub fn from_notify(notify: &messages::Notify, epoch: u64) -> Result<Self> {
        let mut merkle_branches = Vec::with_capacity(notify.merkle_branches.len());
        for branch in &notify.merkle_branches {
            let bytes: &[u8] = branch.as_ref();
            let branch: [u8; 32] = <[u8; 32]>::try_from(bytes).map_err(|_| {
                Error::Protocol(format!("merkle branch has {} bytes", bytes.len()))
            })?;
            merkle_branches.push(branch);
        }
        // reject nonsensical compact targets before any job derives from them
        axe_bitcoin::Target::from_compact(notify.nbits.0)?;

        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(notify.prev_hash.as_ref());

        Ok(Self {
            job_id: notify.job_id.clone(),
            prev_hash,
            coinbase_1: notify.coinbase_1.as_ref().to_vec(),
            coinbase_2: notify.coinbase_2.as_ref().to_vec(),
            merkle_branches,
            version: notify.version.0,
            nbits: notify.nbits.0,
            ntime: notify.ntime.0,
            clean_jobs: notify.clean_jobs,
            epoch,
        })
    }
}

/// Version-rolled midstate precomputed for chips without hardware rolling
#[derive(Clone, Debug)]
pub struct Midstate {
    /// Version field used for calculating the midstate
    pub version: u32,
    /// Internal state of SHA256 after processing the first header chunk
    pub state: axe_bitcoin::Midstate,
}

/// Everything derived from one notification for one ASIC job: the material
/// shipped to the chain plus the context needed to validate and submit the
/// results coming back
#[derive(Clone, Debug)]
pub struct MinerJob {
    /// Pool job id the share submission must reference
    pub job_id: String,
    pub extranonce_2: Vec<u8>,
    /// Base version before any rolling
    pub version: u32,
    pub version_mask: u32,
    /// Previous block hash in block header byte order
    pub prev_hash_le: [u8; 32],
    /// Merkle root in block header byte order
    pub merkle_root_le: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    /// Share difficulty the pool asked for at dispatch time
    pub pool_difficulty: f64,
    pub epoch: u64,
    pub starting_nonce: u32,
    /// Empty for chips that roll the version in hardware
    pub midstates: Vec<Midstate>,
}

impl MinerJob {
    /// Byte-reversed merkle root as shipped to the chain
    pub fn merkle_root_be(&self) -> [u8; 32] {
        let mut bytes = self.merkle_root_le;
        bytes.reverse();
        bytes
    }

    /// Byte-reversed previous hash as shipped to the chain
    pub fn prev_hash_be(&self) -> [u8; 32] {
        let mut bytes = self.prev_hash_le;
        bytes.reverse();
        bytes
    }

    pub fn num_midstates(&self) -> u8 {
        self.midstates.len().max(1) as u8
    }

    /// Reconstruct the full version a result was mined with. Hardware
    /// version rolling chips report the rolled bits in the result frame;
    /// midstate chips report which precomputed midstate hit.
    pub fn rolled_version(&self, version_bits: u32, midstate_num: u8) -> u32 {
        match self.midstates.get(midstate_num as usize) {
            Some(midstate) => midstate.version,
            None => self.version | version_bits,
        }
    }
}

/// Double SHA256 of `coinbase_1 || extranonce_1 || extranonce_2 ||
/// coinbase_2` folded with the merkle branches in notification order
pub fn merkle_root(coinbase: &[u8], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut root = axe_bitcoin::DHash::hash(coinbase).into_inner();
    let mut concat = [0u8; 64];
    for branch in branches {
        concat[..32].copy_from_slice(&root);
        concat[32..].copy_from_slice(branch);
        root = axe_bitcoin::DHash::hash(&concat).into_inner();
    }
    root
}

/// The previous hash field of `mining.notify` carries the hash as eight
/// 32-bit words; swapping each word's bytes recovers block header order
pub fn swap_endian_words(hash: &[u8; 32]) -> [u8; 32] {
    let mut swapped = [0u8; 32];
    for (chunk, out) in hash.chunks(4).zip(swapped.chunks_mut(4)) {
        out[0] = chunk[3];
        out[1] = chunk[2];
        out[2] = chunk[1];
        out[3] = chunk[0];
    }
    swapped
}

/// Add one to the bits of `value` selected by `mask`, propagating carries
/// within the mask only; bits outside the mask never change.
///
/// Filling the unmasked positions with ones lets the carry ride across any
/// hole in the mask, and the final AND discards it once it leaves the top.
pub fn increment_bitmask(value: u32, mask: u32) -> u32 {
    if mask == 0 {
        return value;
    }
    let rolled = (value | !mask).wrapping_add(1) & mask;
    (value & !mask) | rolled
}

/// Builds ASIC jobs from notifications: one fresh extranonce 2 and starting
/// nonce per job, with midstates precomputed when the chip needs them
pub struct Builder {
    /// Running extranonce 2 counter, truncated to the session width
    extranonce_counter: u64,
    /// Chip flavour decides midstates vs full header
    hardware_version_rolling: bool,
    midstate_count: usize,
    /// Subrange size the starting nonce is aligned to
    nonce_subrange: u32,
}

impl Builder {
    pub fn new(
        hardware_version_rolling: bool,
        midstate_count: usize,
        nonce_subrange: u32,
    ) -> Self {
        assert!(
            midstate_count == 1 || midstate_count == 4,
            "BUG: unsupported midstate count {}",
            midstate_count
        );
        assert!(nonce_subrange > 0, "BUG: zero nonce subrange");
        Self {
            extranonce_counter: 0,
            hardware_version_rolling,
            midstate_count,
            nonce_subrange,
        }
    }

    /// Derive the next job from `notification` under the current session
    /// parameters
    pub fn build(
        &mut self,
        notification: &Notification,
        session: &SessionParams,
    ) -> Result<Arc<MinerJob>> {
        let extranonce_2 = self.next_extranonce_2(session.extranonce_2_size);

        let mut coinbase = Vec::with_capacity(
            notification.coinbase_1.len()
                + session.extranonce_1.len()
                + extranonce_2.len()
                + notification.coinbase_2.len(),
        );
        coinbase.extend_from_slice(&notification.coinbase_1);
        coinbase.extend_from_slice(&session.extranonce_1);
        coinbase.extend_from_slice(&extranonce_2);
        coinbase.extend_from_slice(&notification.coinbase_2);

        let merkle_root_le = merkle_root(&coinbase, &notification.merkle_branches);
        let prev_hash_le = swap_endian_words(&notification.prev_hash);

        let midstates = if self.hardware_version_rolling {
            Vec::new()
        } else {
            self.compute_midstates(notification, session, &prev_hash_le, &merkle_root_le)
        };

        Ok(Arc::new(MinerJob {
            job_id: notification.job_id.clone(),
            extranonce_2,
            version: notification.version,
            version_mask: session.version_mask,
            prev_hash_le,
            merkle_root_le,
            ntime: notification.ntime,
            nbits: notification.nbits,
            pool_difficulty: session.pool_difficulty,
            epoch: notification.epoch,
            starting_nonce: self.pick_starting_nonce(),
            midstates,
        }))
    }

    /// Midstates for version-rolled copies of the header's first chunk;
    /// midstate `k` uses the base version with the masked bits incremented
    /// `k` times
    fn compute_midstates(
        &self,
        notification: &Notification,
        session: &SessionParams,
        prev_hash_le: &[u8; 32],
        merkle_root_le: &[u8; 32],
    ) -> Vec<Midstate> {
        let mut midstates = Vec::with_capacity(self.midstate_count);
        let mut version = notification.version;
        for index in 0..self.midstate_count {
            if index > 0 {
                version = increment_bitmask(version, session.version_mask);
            }
            let header = Header {
                version,
                prev_hash: *prev_hash_le,
                merkle_root: *merkle_root_le,
                ..Default::default()
            };
            midstates.push(Midstate {
                version,
                state: header.midstate(),
            });
        }
        midstates
    }

    fn next_extranonce_2(&mut self, width: usize) -> Vec<u8> {
        let counter = self.extranonce_counter;
        self.extranonce_counter = self.extranonce_counter.wrapping_add(1);

        // big endian, truncated (or zero padded) to the session width
        let bytes = counter.to_be_bytes();
        let mut extranonce_2 = vec![0u8; width];
        let copy = width.min(bytes.len());
        extranonce_2[width - copy..].copy_from_slice(&bytes[bytes.len() - copy..]);
        extranonce_2
    }

    /// Random origin aligned to the configured subrange so every job starts
    /// in a fresh portion of the nonce space
    fn pick_starting_nonce(&self) -> u32 {
        let subranges = ((1u64 << 32) / self.nonce_subrange as u64) as u32;
        if subranges <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0, subranges) * self.nonce_subrange
    }
}

/// A validated result on its way upstream
#[derive(Debug, Clone)]
pub struct Share {
    /// Pool job id the share belongs to
    pub job_id: String,
    pub extranonce_2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    /// Full version the share was mined with (base | rolled bits)
    pub version: u32,
    /// Difficulty of the share itself
    pub share_difficulty: f64,
    /// Pool difficulty the share was mined against
    pub pool_difficulty: f64,
}

/// Outcome of checking one candidate nonce
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonceVerdict {
    /// `difficulty_1_target / hash` of the rebuilt header
    pub share_difficulty: f64,
    /// Share difficulty reached the pool difficulty recorded at dispatch
    pub meets_pool: bool,
    /// Share difficulty reached the network difficulty from nBits
    pub meets_network: bool,
}

/// Rebuild the 80-byte header for a candidate returned by the chain and
/// judge it against the pool and network difficulties. Pure function of its
/// inputs.
pub fn test_nonce(miner_job: &MinerJob, nonce: u32, rolled_version: u32) -> NonceVerdict {
    let header = Header {
        version: rolled_version,
        prev_hash: miner_job.prev_hash_le,
        merkle_root: miner_job.merkle_root_le,
        ntime: miner_job.ntime,
        nbits: miner_job.nbits,
        nonce,
    };
    let share_difficulty = axe_bitcoin::hash_difficulty(&header.hash());
    let network_difficulty = axe_bitcoin::Target::from_compact(miner_job.nbits)
        .expect("BUG: nbits were validated at notification parse")
        .get_difficulty();

    NonceVerdict {
        share_difficulty,
        meets_pool: share_difficulty >= miner_job.pool_difficulty,
        meets_network: share_difficulty >= network_difficulty,
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::test_utils;
    use approx::assert_relative_eq;
    use axe_bitcoin::test_utils::TEST_BLOCKS;

    #[test]
    fn test_merkle_root_single_branch() {
        let coinbase = test_utils::sample_coinbase();
        let branch: [u8; 32] = hex_array(
            "1406e05881e299367766d313e26c05564ec91bf721d31726bd6e46e60689539a",
        );
        let root = merkle_root(&coinbase, &[branch]);
        assert_eq!(
            hex::encode(&root),
            "f361db1dad2e238d4f600369553420c0fa8c37726c43a7fdb58740354dd0d671"
        );
    }

    #[test]
    fn test_merkle_root_no_branches_is_coinbase_hash() {
        let coinbase = test_utils::sample_coinbase();
        let root = merkle_root(&coinbase, &[]);
        assert_eq!(
            hex::encode(&root),
            "47a383c1bccc834aa5565519c5543ff06ed2029af8157bdc033465d7d3e71e7d"
        );
    }

    #[test]
    fn test_swap_endian_words() {
        let stratum_form: [u8; 32] = hex_array(
            "ab02cd818b9e567ee21793cddef299feb29ad444a41b85b8000008a300000000",
        );
        let header_form = swap_endian_words(&stratum_form);
        assert_eq!(
            hex::encode(&header_form),
            "81cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000"
        );
        // the swap is involutory
        assert_eq!(swap_endian_words(&header_form), stratum_form);
    }

    #[test]
    fn test_increment_bitmask_bip320() {
        // setting the lowest masked bit
        assert_eq!(
            increment_bitmask(0x2000_0000, 0x1fff_e000),
            0x2000_2000
        );
        // carries propagate within the mask
        assert_eq!(
            increment_bitmask(0x2000_2000, 0x1fff_e000),
            0x2000_4000
        );
        assert_eq!(
            increment_bitmask(0x2000_6000, 0x1fff_e000),
            0x2000_8000
        );
        // a zero mask never changes anything
        assert_eq!(increment_bitmask(0x1234_5678, 0), 0x1234_5678);
    }

    #[test]
    fn test_increment_bitmask_enumerates_without_collision() {
        // 3 mask bits with holes in between enumerate all 8 combinations,
        // carries riding across the unmasked bits, then wrap to the start
        let mask = 0x0000_0121; // bits 0, 5, 8
        let start = 0xdead_0000u32;
        let mut value = start;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            // every state is fresh and bits outside the mask stay untouched
            assert!(seen.insert(value));
            assert_eq!(value & !mask, start & !mask);
            value = increment_bitmask(value, mask);
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(value, start);
    }

    #[test]
    fn test_builder_extranonce_sequence() {
        let mut builder = Builder::new(true, 1, DEFAULT_NONCE_SUBRANGE);
        let session = test_utils::sample_session();
        let notification = test_utils::sample_notification(0);

        let first = builder.build(&notification, &session).expect("build");
        let second = builder.build(&notification, &session).expect("build");
        assert_eq!(first.extranonce_2, vec![0, 0, 0, 0]);
        assert_eq!(second.extranonce_2, vec![0, 0, 0, 1]);
        // different extranonce means a different merkle root
        assert_ne!(first.merkle_root_le, second.merkle_root_le);
    }

    #[test]
    fn test_builder_starting_nonce_alignment() {
        let mut builder = Builder::new(true, 1, DEFAULT_NONCE_SUBRANGE);
        let session = test_utils::sample_session();
        let notification = test_utils::sample_notification(0);
        for _ in 0..32 {
            let miner_job = builder.build(&notification, &session).expect("build");
            assert_eq!(miner_job.starting_nonce % DEFAULT_NONCE_SUBRANGE, 0);
        }
    }

    #[test]
    fn test_builder_merkle_and_prev_hash_orientation() {
        let mut builder = Builder::new(true, 1, DEFAULT_NONCE_SUBRANGE);
        let session = test_utils::sample_session();
        let notification = test_utils::sample_notification(0);

        let miner_job = builder.build(&notification, &session).expect("build");
        // extranonce_1 || extranonce_2 (counter 0) of the sample session
        // reproduce the reference coinbase, one branch folds in
        assert_eq!(
            hex::encode(&miner_job.merkle_root_le),
            "74010a70b984fdcaf6269d06d6c6f6d2613523dab7aa33583c3910330956f799"
        );
        assert_eq!(
            hex::encode(&miner_job.prev_hash_le),
            "81cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000"
        );
        // the BE forms shipped to the chain are full byte reversals
        let mut expected = miner_job.merkle_root_le;
        expected.reverse();
        assert_eq!(miner_job.merkle_root_be(), expected);
    }

    #[test]
    fn test_builder_midstates_for_midstate_chips() {
        let mut builder = Builder::new(false, 4, DEFAULT_NONCE_SUBRANGE);
        let session = test_utils::sample_session();
        let notification = test_utils::sample_notification(0);

        let miner_job = builder.build(&notification, &session).expect("build");
        assert_eq!(miner_job.midstates.len(), 4);
        assert_eq!(miner_job.num_midstates(), 4);

        // versions follow the masked increment sequence
        let mut version = notification.version;
        for (index, midstate) in miner_job.midstates.iter().enumerate() {
            if index > 0 {
                version = increment_bitmask(version, session.version_mask);
            }
            assert_eq!(midstate.version, version);

            // and each state is the midstate of the corresponding header
            let header = Header {
                version,
                prev_hash: miner_job.prev_hash_le,
                merkle_root: miner_job.merkle_root_le,
                ..Default::default()
            };
            assert_eq!(midstate.state, header.midstate());
        }

        // result for midstate 2 resolves to that midstate's version
        assert_eq!(
            miner_job.rolled_version(0, 2),
            miner_job.midstates[2].version
        );
    }

    #[test]
    fn test_rolled_version_hardware_rolling() {
        let miner_job = test_utils::sample_miner_job(0);
        // wire scenario: base 0x20000000, delta bits bswap16(0x0001) << 13
        let version_bits = (0x0001u16.swap_bytes() as u32) << 13;
        assert_eq!(
            miner_job.rolled_version(version_bits, 0),
            0x2000_0000 | version_bits
        );
    }

    #[test]
    fn test_test_nonce_against_solved_blocks() {
        for block in TEST_BLOCKS.iter() {
            let miner_job = test_utils::miner_job_from_block(block, 256.0);
            let verdict = test_nonce(&miner_job, block.nonce, block.version);
            assert!(verdict.meets_pool);
            assert!(verdict.meets_network);
        }
    }

    #[test]
    fn test_test_nonce_share_difficulty_values() {
        let genesis = &TEST_BLOCKS[0];
        let miner_job = test_utils::miner_job_from_block(genesis, 1.0);
        let verdict = test_nonce(&miner_job, genesis.nonce, genesis.version);
        assert_relative_eq!(
            verdict.share_difficulty,
            2.5364262984e3,
            max_relative = 1e-9
        );
        // determinism
        let again = test_nonce(&miner_job, genesis.nonce, genesis.version);
        assert_eq!(verdict, again);
    }

    #[test]
    fn test_test_nonce_rejects_wrong_nonce() {
        let genesis = &TEST_BLOCKS[0];
        let miner_job = test_utils::miner_job_from_block(genesis, 256.0);
        let verdict = test_nonce(&miner_job, genesis.nonce ^ 1, genesis.version);
        assert!(!verdict.meets_network);
    }

    fn hex_array(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(s).expect("valid hex"));
        out
    }
}
