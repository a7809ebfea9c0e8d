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

//! Orchestration of the mining pipeline: the shared core state and the
//! cooperating tasks gluing the stratum client, the job builder and the
//! hash chain together.
//!
//! Work abandonment is epoch based. The epoch is bumped when the pool
//! signals `clean_jobs` or when the pool connection changes; every
//! notification, job and registry entry carries the epoch it was born in
//! and anything from an older epoch is dropped at the next station, so no
//! pre-clean share ever goes upstream.

use axe_logging::macros::*;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config;
use crate::hash_chain;
use crate::job;
use crate::registry::ActiveJobRegistry;
use crate::stats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Pending pool notifications; small by design, newer entries supersede
pub const NOTIFY_QUEUE_DEPTH: usize = 4;
/// Roughly one notification's worth of derived jobs
pub const JOB_QUEUE_DEPTH: usize = 8;
/// Shares waiting for the upstream link
pub const SHARE_QUEUE_DEPTH: usize = 16;

/// State shared between the pipeline tasks. Session parameters, the job
/// registry and the share counters are mutated under one lock with short
/// critical sections; the abandon epoch is a plain atomic.
struct CoreState {
    session: job::SessionParams,
    registry: ActiveJobRegistry,
    counters: stats::Counters,
}

pub struct Core {
    state: Mutex<CoreState>,
    epoch: AtomicU64,
}

/// Cloneable handle the tasks hold on the core
#[derive(Clone)]
pub struct CoreHandle {
    core: Arc<Core>,
}

impl CoreHandle {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(CoreState {
                    session: Default::default(),
                    registry: ActiveJobRegistry::new(),
                    counters: Default::default(),
                }),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<CoreState> {
        self.core.state.lock().expect("BUG: core state lock")
    }

    /// Snapshot of the session parameters
    pub fn session(&self) -> job::SessionParams {
        self.state().session.clone()
    }

    pub fn set_extranonce(&self, extranonce_1: Vec<u8>, extranonce_2_size: usize) {
        let mut state = self.state();
        state.session.extranonce_1 = extranonce_1;
        state.session.extranonce_2_size = extranonce_2_size;
    }

    pub fn set_pool_difficulty(&self, difficulty: f64) {
        self.state().session.pool_difficulty = difficulty;
    }

    pub fn set_version_mask(&self, mask: u32) {
        self.state().session.version_mask = mask;
    }

    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.core.epoch.load(Ordering::SeqCst)
    }

    /// Start a new epoch; everything tagged with an older one is dead
    pub fn bump_epoch(&self) -> u64 {
        self.core.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn install_job(&self, miner_job: Arc<job::MinerJob>) -> u8 {
        self.state().registry.install(miner_job)
    }

    pub fn lookup_job(&self, job_id_hi: u8) -> Option<Arc<job::MinerJob>> {
        self.state().registry.lookup(job_id_hi)
    }

    /// Forget all in-flight jobs, e.g. when the pool session is torn down
    pub fn clear_jobs(&self) {
        self.state().registry.clear();
    }

    pub fn account_accepted(&self) {
        self.state().counters.accepted += 1;
    }

    pub fn account_rejected(&self, reason: Option<String>) {
        let mut state = self.state();
        state.counters.rejected += 1;
        state.counters.last_reject_reason = reason;
    }

    pub fn account_stale(&self) {
        self.state().counters.stale_results += 1;
    }

    pub fn account_hardware_error(&self) {
        self.state().counters.hardware_errors += 1;
    }

    pub fn account_discarded_frame(&self) {
        self.state().counters.discarded_frames += 1;
    }

    pub fn counters(&self) -> stats::Counters {
        self.state().counters.clone()
    }
}

/// Derives ASIC jobs from the most recent notification at the configured
/// cadence, switching over whenever a fresh notification arrives
pub async fn job_creator_task(
    core: CoreHandle,
    mut notify_rx: mpsc::Receiver<job::Notification>,
    job_tx: mpsc::Sender<Arc<job::MinerJob>>,
    mut builder: job::Builder,
    cadence: Duration,
) {
    let mut notification = match notify_rx.recv().await {
        Some(notification) => notification,
        None => return,
    };

    loop {
        // entries superseded while queued are dropped unprocessed
        if notification.epoch < core.current_epoch() {
            trace!("skipping superseded notification {}", notification.job_id);
            match notify_rx.recv().await {
                Some(next) => {
                    notification = next;
                    continue;
                }
                None => return,
            }
        }

        let session = core.session();
        match builder.build(&notification, &session) {
            Ok(miner_job) => {
                if job_tx.send(miner_job).await.is_err() {
                    return;
                }
            }
            Err(e) => error!("cannot derive job from notification: {}", e),
        }

        tokio::select! {
            next = notify_rx.recv() => match next {
                Some(next) => notification = next,
                None => return,
            },
            _ = tokio::time::sleep(cadence) => {}
        }
    }
}

/// Moves jobs from the queue onto the wire, installing each one in the
/// registry right before transmission. Jobs from an abandoned epoch are
/// drained here without ever reaching the chain.
pub async fn asic_sender_task<W>(
    core: CoreHandle,
    mut job_rx: mpsc::Receiver<Arc<job::MinerJob>>,
    mut sender: hash_chain::JobSender<W>,
) where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(miner_job) = job_rx.recv().await {
        if miner_job.epoch < core.current_epoch() {
            trace!("draining stale job for pool job {}", miner_job.job_id);
            continue;
        }
        let local_job_id = core.install_job(miner_job.clone());
        if let Err(e) = sender.send_job(local_job_id, &miner_job).await {
            // transient; the next job will try again
            warn!("job transmission failed: {}", e);
        }
    }
}

/// Everything the receiver task owns exclusively: the rolling hashrate
/// history, the best-difficulty records and their persistence hook
pub struct ReceiverState {
    hashrate: stats::HashrateMeter,
    best: stats::BestDifficulty,
    /// Effective hardware difficulty filter; results below it are chip
    /// errors, results at or above it feed the hashrate estimate
    asic_difficulty: u64,
    store: Arc<config::Store>,
}

impl ReceiverState {
    pub fn new(asic_difficulty: u64, store: Arc<config::Store>) -> Self {
        let best = stats::BestDifficulty::new(store.settings().best_difficulty);
        Self {
            hashrate: stats::HashrateMeter::new(),
            best,
            asic_difficulty,
            store,
        }
    }
}

/// Judge one result frame: registry lookup, epoch check, nonce validation
/// and share accounting. Returns the share to submit, if any.
fn process_result(
    core: &CoreHandle,
    frame: &crate::bm13xx::ResultFrame,
    state: &mut ReceiverState,
) -> Option<job::Share> {
    let miner_job = match core.lookup_job(frame.job_id_hi()) {
        Some(miner_job) => miner_job,
        None => {
            trace!("result for unknown job id {:#04x}", frame.job_id_hi());
            core.account_stale();
            return None;
        }
    };
    if miner_job.epoch < core.current_epoch() {
        core.account_stale();
        return None;
    }

    let rolled_version = miner_job.rolled_version(frame.version_bits(), frame.small_core());
    let verdict = job::test_nonce(&miner_job, frame.nonce, rolled_version);

    info!(
        "result: job={} id={:#04x} core={}/{} nonce={:08x} version={:08x} diff={:.3}",
        miner_job.job_id,
        frame.job_id_hi(),
        frame.core_id(),
        frame.small_core(),
        frame.nonce,
        rolled_version,
        verdict.share_difficulty
    );

    if verdict.share_difficulty < state.asic_difficulty as f64 {
        warn!("result below the hardware difficulty filter");
        core.account_hardware_error();
        return None;
    }

    let now = Instant::now();
    state.hashrate.account(state.asic_difficulty, now);
    trace!(
        "rolling hashrate {:.2} Gh/s",
        state.hashrate.giga_hashes_per_sec(now)
    );

    if state.best.update(verdict.share_difficulty) {
        info!(
            "new all-time best share difficulty {:.3}",
            verdict.share_difficulty
        );
        state
            .store
            .update_best_difficulty(verdict.share_difficulty as u64);
    }

    if verdict.meets_network {
        crit!(
            "BLOCK FOUND! job={} nonce={:08x} diff={:.3e}",
            miner_job.job_id,
            frame.nonce,
            verdict.share_difficulty
        );
    }

    if !verdict.meets_pool {
        // normal when the pool difficulty exceeds the hardware filter
        return None;
    }

    Some(job::Share {
        job_id: miner_job.job_id.clone(),
        extranonce_2: miner_job.extranonce_2.clone(),
        ntime: miner_job.ntime,
        nonce: frame.nonce,
        version: rolled_version,
        share_difficulty: verdict.share_difficulty,
        pool_difficulty: miner_job.pool_difficulty,
    })
}

/// Reads result frames off the chain, validates them and pushes qualifying
/// shares towards the stratum client
pub async fn asic_receiver_task<R>(
    core: CoreHandle,
    mut receiver: hash_chain::ResultReceiver<R>,
    share_tx: mpsc::Sender<job::Share>,
    mut state: ReceiverState,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let frame = match receiver.recv_result().await {
            Ok(Some(frame)) => frame,
            // timeouts are counted inside the receiver
            Ok(None) => continue,
            Err(e) => {
                warn!("discarding result frame: {}", e);
                core.account_discarded_frame();
                continue;
            }
        };

        if let Some(share) = process_result(&core, &frame, &mut state) {
            if share_tx.send(share).await.is_err() {
                // upstream is gone, nothing left to do
                return;
            }
        }
    }
}
