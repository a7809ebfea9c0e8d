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

//! Mining statistics: share accounting, rolling hashrate estimation and
//! best-difficulty tracking.

use axe_logging::macros::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Share=1 represents a space of 2^32 calculated hashes for Bitcoin
/// mainnet (exactly 2^256 / (0xffff << 208)). Shares at difficulty X take
/// X times more hashes to compute.
fn shares_to_giga_hashes(shares: u128) -> f64 {
    (shares << 32) as f64 * 1e-9
}

/// Session share counters, mutated under the orchestrator lock
#[derive(Debug, Default, Clone)]
pub struct Counters {
    /// Shares the pool acknowledged
    pub accepted: u64,
    /// Shares the pool refused
    pub rejected: u64,
    /// Reason string of the most recent rejection
    pub last_reject_reason: Option<String>,
    /// Results that arrived for a job no longer in the registry or from a
    /// previous epoch
    pub stale_results: u64,
    /// Results below the hardware difficulty filter, i.e. chip errors
    pub hardware_errors: u64,
    /// Frames dropped due to framing or checksum failures
    pub discarded_frames: u64,
}

/// Calculation of approximate arithmetic mean within given time interval
#[derive(Debug, Clone, Copy)]
pub struct WindowedTimeMean {
    /// Window interval in seconds
    interval: f64,
    /// Time of the first sample of the current window
    started: Option<Instant>,
    /// Mean value from the previous time window
    prev_window: f64,
    /// Sum of all samples for the current time window
    sum: f64,
}

impl WindowedTimeMean {
    pub fn new(interval: Duration) -> Self {
        assert!(interval.as_secs() > 0);
        Self {
            interval: interval.as_secs_f64(),
            started: None,
            prev_window: 0.0,
            sum: 0.0,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Insert another sample for arithmetic mean measurement at `now`
    pub fn insert(&mut self, sample: f64, now: Instant) {
        match self.started {
            None => {
                self.started = Some(now);
                self.sum = sample;
                self.prev_window = 0.0;
            }
            Some(start_time) => {
                let elapsed = now
                    .checked_duration_since(start_time)
                    .expect("BUG: non-monotonic clock")
                    .as_secs_f64();
                if elapsed >= self.interval {
                    // ensure the previous window isn't computed from older
                    // history than the interval itself
                    let windows = elapsed / self.interval;
                    self.prev_window = if windows < 2.0 {
                        self.sum / windows
                    } else {
                        0.0
                    };
                    self.started = Some(now);
                    self.sum = 0.0;
                }
                self.sum += sample;
            }
        }
    }

    /// Measure arithmetic mean per second from the samples within the
    /// interval, blending with the previous window while the current one
    /// is still filling
    pub fn measure(&self, now: Instant) -> f64 {
        match self.started {
            None => 0.0,
            Some(start_time) => {
                let elapsed = now
                    .checked_duration_since(start_time)
                    .expect("BUG: non-monotonic clock")
                    .as_secs_f64();
                let windows = elapsed / self.interval;
                let sum = if windows < 1.0 {
                    self.prev_window * (1.0 - windows) + self.sum * windows
                } else {
                    self.sum
                };
                sum / self.interval
            }
        }
    }
}

/// Rolling hashrate estimate over several horizons, fed with every result
/// that came back from the chain. Owned exclusively by the receiver task.
#[derive(Debug)]
pub struct HashrateMeter {
    time_means: Vec<WindowedTimeMean>,
}

impl HashrateMeter {
    pub fn new() -> Self {
        let intervals = [
            Duration::from_secs(60),
            Duration::from_secs(5 * 60),
            Duration::from_secs(15 * 60),
        ];
        Self {
            time_means: intervals
                .iter()
                .map(|&interval| WindowedTimeMean::new(interval))
                .collect(),
        }
    }

    /// Account one result mined at `difficulty`
    pub fn account(&mut self, difficulty: u64, now: Instant) {
        for time_mean in &mut self.time_means {
            time_mean.insert(difficulty as f64, now);
        }
    }

    /// Hashrate in Gh/s over the shortest horizon
    pub fn giga_hashes_per_sec(&self, now: Instant) -> f64 {
        let shares_per_sec = self.time_means[0].measure(now);
        shares_per_sec * 4.294967296
    }
}

/// Process-wide share counter backing the periodic hashrate log line
#[derive(Debug, Default)]
pub struct Meter {
    /// Shares (at pool difficulty) accumulated since the last tick
    shares: AtomicU64,
}

impl Meter {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub fn account_shares(&self, difficulty: u64) {
        self.shares.fetch_add(difficulty, Ordering::Relaxed);
    }

    fn take_shares(&self) -> u64 {
        self.shares.swap(0, Ordering::Relaxed)
    }
}

/// Periodically print the pool-difficulty hashrate
pub async fn hashrate_meter_task(meter: Arc<Meter>) {
    const TICK: Duration = Duration::from_secs(10);

    let mut last_tick = Instant::now();
    loop {
        tokio::time::sleep(TICK).await;

        let shares = meter.take_shares();
        let elapsed = last_tick.elapsed().as_secs_f64();
        last_tick = Instant::now();
        if shares > 0 {
            info!(
                "Hash rate @ pool difficulty: {:.2} Gh/s",
                shares_to_giga_hashes(shares as u128) / elapsed
            );
        }
    }
}

/// Best share difficulties seen so far; the all-time value survives reboots
/// through the settings collaborator
#[derive(Debug, Clone, Copy, Default)]
pub struct BestDifficulty {
    session: f64,
    all_time: f64,
}

impl BestDifficulty {
    pub fn new(all_time: u64) -> Self {
        Self {
            session: 0.0,
            all_time: all_time as f64,
        }
    }

    /// Fold in one share difficulty; returns true when the all-time record
    /// was broken and should be persisted
    pub fn update(&mut self, share_difficulty: f64) -> bool {
        if share_difficulty > self.session {
            self.session = share_difficulty;
        }
        if share_difficulty > self.all_time {
            self.all_time = share_difficulty;
            return true;
        }
        false
    }

    #[inline]
    pub fn session(&self) -> f64 {
        self.session
    }

    #[inline]
    pub fn all_time(&self) -> f64 {
        self.all_time
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_shares_to_giga_hashes() {
        // one difficulty-1 share is 2^32 hashes
        assert_relative_eq!(shares_to_giga_hashes(1), 4.294967296);
        assert_relative_eq!(shares_to_giga_hashes(1000), 4294.967296);
    }

    #[test]
    fn test_windowed_time_mean_empty() {
        let mean = WindowedTimeMean::new(Duration::from_secs(3));
        assert_eq!(mean.measure(Instant::now()), 0.0);
    }

    #[test]
    fn test_windowed_time_mean_insert_same_time() {
        let start = Instant::now();
        let mut mean = WindowedTimeMean::new(Duration::from_secs(3));
        mean.insert(1.0, start);
        mean.insert(1.0, start);
        // the first sample opens the window, the second lands inside it
        assert!(mean.measure(start + Duration::from_secs(3)) > 0.0);
    }

    #[test]
    fn test_windowed_time_mean_full_window() {
        let start = Instant::now();
        let mut mean = WindowedTimeMean::new(Duration::from_secs(4));
        mean.insert(4.0, start);
        mean.insert(4.0, start + Duration::from_secs(2));
        // a full window holding 8 units over 4 seconds averages 2/s
        assert_relative_eq!(mean.measure(start + Duration::from_secs(4)), 2.0);
    }

    #[test]
    fn test_best_difficulty() {
        let mut best = BestDifficulty::new(1000);
        assert!(!best.update(500.0));
        assert_relative_eq!(best.session(), 500.0);
        assert_relative_eq!(best.all_time(), 1000.0);

        assert!(best.update(2000.0));
        assert_relative_eq!(best.session(), 2000.0);
        assert_relative_eq!(best.all_time(), 2000.0);

        // session record tracks independently of the all-time one
        assert!(!best.update(1500.0));
        assert_relative_eq!(best.session(), 2000.0);
    }

    #[test]
    fn test_meter_take() {
        let meter = Meter::new();
        meter.account_shares(256);
        meter.account_shares(256);
        assert_eq!(meter.take_shares(), 512);
        assert_eq!(meter.take_shares(), 0);
    }
}
