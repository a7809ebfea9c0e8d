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

//! Driver for the chained BM13xx chips: bring-up and enumeration, frequency
//! ramping, job transmission and result reception.

use axe_logging::macros::*;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bm13xx::{self, ChipAddress, Model, Pll};
use crate::error::{self, Error};
use crate::io::{Control, FrameRx, FrameTx};
use crate::job;

use std::time::Duration;

/// Reset line hold time, both low and high
const RESET_HOLD: Duration = Duration::from_millis(100);
/// Per-frame quiet timeout while counting enumeration replies
const ENUMERATION_QUIET: Duration = Duration::from_secs(1);
/// Quiet timeout when draining diagnostic replies
const DIAGNOSTIC_QUIET: Duration = Duration::from_millis(100);
/// Settle time after the inactivate broadcast
const INACTIVATE_DELAY: Duration = Duration::from_millis(100);
/// Soft timeout of one result read
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive result timeouts before the chain is reported stuck
pub const TIMEOUT_THRESHOLD: u32 = 2;
/// Frequency ramp granularity
const RAMP_STEP_MHZ: f32 = 6.25;
/// Settle time between ramp steps
const RAMP_SETTLE: Duration = Duration::from_millis(100);
/// Clock the chips run at right after a hardware reset
const POST_RESET_FREQUENCY_MHZ: f32 = 56.25;

/// Hash chain controller used during bring-up; `split` turns it into the
/// sender/receiver pair the pipeline tasks own.
pub struct HashChain<R, W, C> {
    rx: FrameRx<R>,
    tx: FrameTx<W>,
    control: C,
    model: Model,
    /// Chips the board is fitted with, per configuration
    expected_chip_count: usize,
    /// Chips that actually answered the enumeration probe
    chip_count: usize,
    /// Current PLL setpoint
    frequency_mhz: f32,
    /// Effective hardware difficulty filter (power of two)
    asic_difficulty: u64,
    version_mask: u32,
}

impl<R, W, C> HashChain<R, W, C>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    C: Control,
{
    pub fn new(
        rx: FrameRx<R>,
        tx: FrameTx<W>,
        control: C,
        model: Model,
        expected_chip_count: usize,
        version_mask: u32,
    ) -> Self {
        Self {
            rx,
            tx,
            control,
            model,
            expected_chip_count,
            chip_count: 0,
            frequency_mhz: POST_RESET_FREQUENCY_MHZ,
            asic_difficulty: model.default_difficulty(),
            version_mask,
        }
    }

    /// Complete chain bring-up. Must follow a hardware reset; leaves the
    /// chain addressed, filtered, clocked at `target_mhz` and the link at
    /// full speed.
    pub async fn init(&mut self, target_mhz: f32) -> error::Result<()> {
        info!("Resetting {} hash chain", self.model.name());
        self.control.hardware_reset(RESET_HOLD).await?;

        // chips right out of reset occasionally swallow the first frames
        for _ in 0..3 {
            self.set_version_mask().await?;
        }

        self.enumerate_chips().await?;
        info!(
            "Discovered {} chips (expected {})",
            self.chip_count, self.expected_chip_count
        );

        for &(register, value) in bm13xx::PRE_ADDRESSING_WRITES.iter() {
            self.write_register(ChipAddress::All, register, value).await?;
        }
        self.tx.send(&bm13xx::inactivate()).await?;
        tokio::time::sleep(INACTIVATE_DELAY).await;
        self.assign_chip_addresses().await?;

        self.set_difficulty_mask(self.model.default_difficulty())
            .await?;
        self.read_diagnostics().await?;
        self.write_register(
            ChipAddress::All,
            bm13xx::HASH_COUNTING_NUMBER_REG,
            bm13xx::HASH_COUNTING_VALUE,
        )
        .await?;
        self.init_chip_cores().await?;

        self.ramp_frequency(target_mhz).await?;

        self.set_version_mask().await?;
        self.set_max_baud().await?;
        Ok(())
    }

    /// Program the rollable version bits; chips that roll in hardware only
    pub async fn set_version_mask(&mut self) -> error::Result<()> {
        if !self.model.hardware_version_rolling() {
            return Ok(());
        }
        self.write_register(
            ChipAddress::All,
            bm13xx::VERSION_ROLLING_REG,
            bm13xx::version_rolling_reg(self.version_mask),
        )
        .await
    }

    /// Count chips by broadcasting the identification probe; every chip in
    /// the chain answers once
    async fn enumerate_chips(&mut self) -> error::Result<()> {
        self.tx
            .send(&bm13xx::read_register(
                ChipAddress::All,
                bm13xx::CHIP_ADDRESS_REG,
            ))
            .await?;

        let mut chip_count = 0usize;
        let mut frame = [0u8; bm13xx::RESULT_FRAME_SIZE];
        while let Some(()) = self.rx.recv(&mut frame, ENUMERATION_QUIET).await? {
            if frame[0..2] != bm13xx::RESPONSE_PREAMBLE {
                warn!("garbled enumeration reply, resynchronizing");
                self.rx.purge().await?;
                continue;
            }
            let chip_id = u16::from_be_bytes([frame[2], frame[3]]);
            if chip_id != self.model.chip_id() {
                warn!(
                    "chip {} identifies as {:#06x}, expected {:#06x}",
                    chip_count,
                    chip_id,
                    self.model.chip_id()
                );
            }
            chip_count += 1;
        }

        if chip_count == 0 {
            return Err(Error::Hashchip(
                "no chips detected on the chain".to_string(),
            ));
        }
        if chip_count != self.expected_chip_count {
            warn!(
                "chain length mismatch: found {}, expected {}",
                chip_count, self.expected_chip_count
            );
        }
        self.chip_count = chip_count;
        Ok(())
    }

    /// Hardware address step spreading the chips over the address byte
    fn address_interval(&self) -> u8 {
        (256 / self.chip_count) as u8
    }

    /// Returns iterator over the assigned chip addresses
    fn chip_iter(&self) -> impl Iterator<Item = u8> {
        let interval = self.address_interval();
        (0..self.chip_count as u8).map(move |index| index.wrapping_mul(interval))
    }

    async fn assign_chip_addresses(&mut self) -> error::Result<()> {
        let addresses: Vec<u8> = self.chip_iter().collect();
        for address in addresses {
            self.tx.send(&bm13xx::set_chip_address(address)).await?;
        }
        Ok(())
    }

    /// Program the hardware difficulty filter; the requested difficulty is
    /// rounded down to a power of two and the effective value kept for the
    /// result path
    pub async fn set_difficulty_mask(&mut self, difficulty: u64) -> error::Result<u64> {
        let (actual, register_value) = bm13xx::ticket_mask_reg(difficulty)?;
        trace!(
            "Setting ticket mask for difficulty {} (requested {}), value {:#010x}",
            actual,
            difficulty,
            register_value
        );
        self.write_register(ChipAddress::All, bm13xx::TICKET_MASK_REG, register_value)
            .await?;
        self.asic_difficulty = actual;
        Ok(actual)
    }

    /// Broadcast a register read and drain the replies; purely diagnostic,
    /// a missing reply is logged but does not fail the bring-up
    async fn read_diagnostics(&mut self) -> error::Result<()> {
        self.tx
            .send(&bm13xx::read_register(
                ChipAddress::All,
                bm13xx::CHIP_ADDRESS_REG,
            ))
            .await?;
        let mut replies = 0usize;
        let mut frame = [0u8; bm13xx::RESULT_FRAME_SIZE];
        while let Some(()) = self.rx.recv(&mut frame, DIAGNOSTIC_QUIET).await? {
            trace!("diagnostic reply {}: {:02x?}", replies, &frame[..]);
            replies += 1;
        }
        if replies != self.chip_count {
            warn!(
                "diagnostic readback: {} replies from {} chips",
                replies, self.chip_count
            );
        }
        Ok(())
    }

    /// Per-chip clock domain and misc programming per the chip init sequence
    async fn init_chip_cores(&mut self) -> error::Result<()> {
        let addresses: Vec<u8> = self.chip_iter().collect();
        for address in addresses {
            for &value in bm13xx::CORE_CLOCK_WRITES.iter() {
                self.write_register(
                    ChipAddress::One(address),
                    bm13xx::CORE_REGISTER_CONTROL_REG,
                    value,
                )
                .await?;
            }
            self.write_register(
                ChipAddress::One(address),
                bm13xx::MISC_CONTROL_REG,
                bm13xx::CHIP_MISC_CONTROL_VALUE,
            )
            .await?;
        }
        Ok(())
    }

    /// Walk the PLL from the current setpoint to `target_mhz` in 6.25 MHz
    /// steps with a settle delay between them, aligning to a step boundary
    /// in the direction of travel first; the final step lands exactly on
    /// the target.
    pub async fn ramp_frequency(&mut self, target_mhz: f32) -> error::Result<()> {
        let mut current = self.frequency_mhz;
        info!(
            "Ramping chain clock {:.2} -> {:.2} MHz",
            current, target_mhz
        );

        let steps = current / RAMP_STEP_MHZ;
        if steps.fract() > 1e-3 && steps.fract() < 1.0 - 1e-3 {
            current = if target_mhz > current {
                steps.ceil() * RAMP_STEP_MHZ
            } else {
                steps.floor() * RAMP_STEP_MHZ
            };
            self.write_frequency(current).await?;
            tokio::time::sleep(RAMP_SETTLE).await;
        }

        while (current - target_mhz).abs() > 1e-3 {
            if (target_mhz - current).abs() <= RAMP_STEP_MHZ + 1e-3 {
                current = target_mhz;
            } else if target_mhz > current {
                current += RAMP_STEP_MHZ;
            } else {
                current -= RAMP_STEP_MHZ;
            }
            self.write_frequency(current).await?;
            tokio::time::sleep(RAMP_SETTLE).await;
        }
        Ok(())
    }

    async fn write_frequency(&mut self, mhz: f32) -> error::Result<()> {
        let pll = match Pll::try_from_frequency(mhz) {
            Ok(pll) => pll,
            Err(e) => {
                warn!("{}; falling back to the 200 MHz divider set", e);
                Pll::fallback()
            }
        };
        trace!("PLL step {:.2} MHz, register {:#010x}", pll.frequency(), pll.to_reg());
        self.write_register(ChipAddress::All, bm13xx::PLL0_PARAMETER_REG, pll.to_reg())
            .await?;
        self.frequency_mhz = pll.frequency();
        Ok(())
    }

    /// Switch the chain and then the host side to the full-speed link
    async fn set_max_baud(&mut self) -> error::Result<()> {
        self.write_register(
            ChipAddress::All,
            bm13xx::FAST_UART_CONFIGURATION_REG,
            bm13xx::FAST_UART_CONFIGURATION_VALUE,
        )
        .await?;
        self.control.set_baud_rate(bm13xx::MAX_BAUD_RATE)?;
        info!("chain link reprogrammed to {} bps", bm13xx::MAX_BAUD_RATE);
        Ok(())
    }

    async fn write_register(
        &mut self,
        chip_address: ChipAddress,
        register: u8,
        value: u32,
    ) -> error::Result<()> {
        self.tx
            .send(&bm13xx::write_register(chip_address, register, value))
            .await
    }

    #[inline]
    pub fn chip_count(&self) -> usize {
        self.chip_count
    }

    #[inline]
    pub fn asic_difficulty(&self) -> u64 {
        self.asic_difficulty
    }

    /// Hand the two link directions to the sender and receiver tasks
    pub fn split(self) -> (JobSender<W>, ResultReceiver<R>) {
        (
            JobSender {
                tx: self.tx,
                model: self.model,
                frame_buf: Vec::with_capacity(160),
            },
            ResultReceiver {
                rx: self.rx,
                consecutive_timeouts: 0,
            },
        )
    }
}

/// Transmit side of a running chain; owned by the sender task
pub struct JobSender<W> {
    tx: FrameTx<W>,
    model: Model,
    /// Reusable frame buffer, job submission does not allocate
    frame_buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send> JobSender<W> {
    pub async fn send_job(&mut self, local_job_id: u8, miner_job: &job::MinerJob) -> error::Result<()> {
        assert!(
            local_job_id % 8 == 0 && local_job_id < 128,
            "BUG: malformed local job id {:#04x}",
            local_job_id
        );

        let merkle_root_be = miner_job.merkle_root_be();
        let prev_hash_be = miner_job.prev_hash_be();
        let mut midstate_bytes = [[0u8; 32]; 4];
        let midstate_count = miner_job.midstates.len().min(4);
        for (bytes, midstate) in midstate_bytes
            .iter_mut()
            .zip(miner_job.midstates.iter())
        {
            *bytes = midstate.state.to_reversed_bytes();
        }

        let job_data = bm13xx::JobData {
            local_job_id,
            num_midstates: miner_job.num_midstates(),
            starting_nonce: miner_job.starting_nonce,
            nbits: miner_job.nbits,
            ntime: miner_job.ntime,
            merkle_root_be: &merkle_root_be,
            prev_hash_be: &prev_hash_be,
            version: miner_job.version,
            midstates: &midstate_bytes[..midstate_count],
        };

        if self.model.hardware_version_rolling() {
            bm13xx::encode_header_job(&job_data, &mut self.frame_buf);
        } else {
            bm13xx::encode_midstate_job(&job_data, &mut self.frame_buf);
        }
        self.tx.send(&self.frame_buf).await
    }
}

/// Receive side of a running chain; owned by the receiver task
pub struct ResultReceiver<R> {
    rx: FrameRx<R>,
    consecutive_timeouts: u32,
}

impl<R: AsyncRead + Unpin + Send> ResultReceiver<R> {
    /// Read one result frame. `None` is a quiet timeout; frame-level
    /// corruption purges the receive direction and surfaces the error so
    /// the caller can account it.
    pub async fn recv_result(&mut self) -> error::Result<Option<bm13xx::ResultFrame>> {
        let mut frame = [0u8; bm13xx::RESULT_FRAME_SIZE];
        match self.rx.recv(&mut frame, RESULT_TIMEOUT).await? {
            None => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= TIMEOUT_THRESHOLD {
                    error!(
                        "no result frame for {} consecutive reads, hash chain may be stuck",
                        self.consecutive_timeouts
                    );
                }
                Ok(None)
            }
            Some(()) => match bm13xx::ResultFrame::parse(&frame) {
                Ok(result) => {
                    self.consecutive_timeouts = 0;
                    Ok(Some(result))
                }
                Err(e) => {
                    // resynchronize on the next preamble
                    self.rx.purge().await?;
                    Err(e.into())
                }
            },
        }
    }
}
