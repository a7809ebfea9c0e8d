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

//! Registry pairing in-flight ASIC jobs with the results coming back from
//! the chain.
//!
//! Job ids live in increments of 8 within `[0, 128)`: the chips echo the id
//! with the small core index packed into the low 3 bits, so only the high 5
//! bits identify the job. Slots are reused in circular fashion; when a slot
//! is overwritten the previous occupant is released and any late result for
//! it no longer validates. That is sound because each chip processes its
//! jobs strictly in arrival order.

use crate::job;

use std::sync::Arc;

/// Distance between two consecutive job ids
pub const JOB_ID_STEP: u8 = 8;
/// Job ids are assigned modulo this space
pub const JOB_ID_SPACE: u8 = 128;
/// Number of usable registry slots
const SLOT_COUNT: usize = (JOB_ID_SPACE / JOB_ID_STEP) as usize;

pub struct ActiveJobRegistry {
    /// Notification-derived context per slot
    active: Vec<Option<Arc<job::MinerJob>>>,
    /// Results are only accepted for slots with the valid flag raised
    valid: Vec<bool>,
    /// Id to be assigned to the next installed job
    next_id: u8,
}

impl ActiveJobRegistry {
    pub fn new() -> Self {
        Self {
            active: vec![None; SLOT_COUNT],
            valid: vec![false; SLOT_COUNT],
            next_id: 0,
        }
    }

    /// Install a job under the next job id, evicting the previous occupant
    /// of the slot. Returns the assigned `local_job_id`.
    pub fn install(&mut self, miner_job: Arc<job::MinerJob>) -> u8 {
        let local_job_id = self.next_id;
        let slot = (local_job_id / JOB_ID_STEP) as usize;

        self.active[slot] = Some(miner_job);
        self.valid[slot] = true;
        self.next_id = local_job_id.wrapping_add(JOB_ID_STEP) % JOB_ID_SPACE;

        local_job_id
    }

    /// Look up the job a result refers to. `job_id_hi` must carry the small
    /// core bits already masked out; anything outside the id scheme or
    /// pointing at an invalid slot yields `None` and the result is to be
    /// discarded.
    pub fn lookup(&self, job_id_hi: u8) -> Option<Arc<job::MinerJob>> {
        if job_id_hi % JOB_ID_STEP != 0 || job_id_hi >= JOB_ID_SPACE {
            return None;
        }
        let slot = (job_id_hi / JOB_ID_STEP) as usize;
        if !self.valid[slot] {
            return None;
        }
        self.active[slot].clone()
    }

    /// Drop everything, e.g. when the upstream session is torn down
    pub fn clear(&mut self) {
        for slot in 0..SLOT_COUNT {
            self.active[slot] = None;
            self.valid[slot] = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_job_ids_are_multiples_of_eight() {
        let mut registry = ActiveJobRegistry::new();
        for expected in (0..JOB_ID_SPACE).step_by(JOB_ID_STEP as usize) {
            let id = registry.install(Arc::new(test_utils::sample_miner_job(0)));
            assert_eq!(id, expected);
            assert_eq!(id % JOB_ID_STEP, 0);
        }
        // the id space wraps around
        let id = registry.install(Arc::new(test_utils::sample_miner_job(0)));
        assert_eq!(id, 0);
    }

    #[test]
    fn test_lookup_valid_slot() {
        let mut registry = ActiveJobRegistry::new();
        let id = registry.install(Arc::new(test_utils::sample_miner_job(7)));
        let found = registry.lookup(id).expect("installed job resolves");
        assert_eq!(found.epoch, 7);
    }

    #[test]
    fn test_lookup_rejects_bad_ids() {
        let mut registry = ActiveJobRegistry::new();
        registry.install(Arc::new(test_utils::sample_miner_job(0)));
        // small core bits not masked out
        assert!(registry.lookup(0x03).is_none());
        // out of the id space
        assert!(registry.lookup(0x80).is_none());
        // empty slot
        assert!(registry.lookup(0x78).is_none());
    }

    #[test]
    fn test_slot_reuse_keeps_newest() {
        let mut registry = ActiveJobRegistry::new();
        let first = registry.install(Arc::new(test_utils::sample_miner_job(1)));
        // run through the whole id space so the first slot is reassigned
        for _ in 0..SLOT_COUNT - 1 {
            registry.install(Arc::new(test_utils::sample_miner_job(1)));
        }
        let reused = registry.install(Arc::new(test_utils::sample_miner_job(2)));
        assert_eq!(first, reused);
        assert_eq!(registry.lookup(first).expect("slot occupied").epoch, 2);
    }

    #[test]
    fn test_clear() {
        let mut registry = ActiveJobRegistry::new();
        let id = registry.install(Arc::new(test_utils::sample_miner_job(0)));
        registry.clear();
        assert!(registry.lookup(id).is_none());
    }
}
