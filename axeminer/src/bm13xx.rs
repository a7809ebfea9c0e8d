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

//! BM13xx serial protocol: frame construction and parsing, chip registers,
//! PLL divider search and the per-model constants of the supported chips.

pub mod crc;

use crate::error::{self, Error};

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use thiserror::Error as ThisError;

use std::time::Duration;

/// Preamble of every frame sent towards the chain
pub const FRAME_PREAMBLE: [u8; 2] = [0x55, 0xaa];
/// Preamble of every frame coming back from the chain
pub const RESPONSE_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// Frame family selectors in the header byte
const TYPE_CMD: u8 = 0x40;
const TYPE_JOB: u8 = 0x20;
/// Destination group selectors
const GROUP_SINGLE: u8 = 0x00;
const GROUP_ALL: u8 = 0x10;
/// Command codes
const CMD_SET_ADDRESS: u8 = 0x00;
const CMD_WRITE: u8 = 0x01;
const CMD_READ: u8 = 0x02;
const CMD_INACTIVE: u8 = 0x03;

/// Chip registers (names follow the datasheets)
pub const CHIP_ADDRESS_REG: u8 = 0x00;
pub const PLL0_PARAMETER_REG: u8 = 0x08;
pub const HASH_COUNTING_NUMBER_REG: u8 = 0x10;
pub const TICKET_MASK_REG: u8 = 0x14;
pub const MISC_CONTROL_REG: u8 = 0x18;
pub const FAST_UART_CONFIGURATION_REG: u8 = 0x28;
pub const CORE_REGISTER_CONTROL_REG: u8 = 0x3c;
pub const CLOCK_ORDER_CONTROL0_REG: u8 = 0x80;
pub const CLOCK_ORDER_CONTROL1_REG: u8 = 0x84;
pub const VERSION_ROLLING_REG: u8 = 0xa4;

/// Every mined result comes back as exactly this many bytes
pub const RESULT_FRAME_SIZE: usize = 11;

/// Oscillator feeding the chips
pub const CHIP_OSC_CLK_HZ: u32 = 25_000_000;
/// Fixed divisor between the oscillator and the baud rate generator
pub const CHIP_OSC_BAUD_BASE_DIV: u32 = 8;
/// Baud clock divisor the chips wake up with
pub const INIT_BAUD_CLOCK_DIV: u32 = 26;
/// Link speed once the chain has been reprogrammed for full operation
pub const MAX_BAUD_RATE: u32 = 1_000_000;
/// FAST_UART_CONFIGURATION value that selects 1 Mbaud
pub const FAST_UART_CONFIGURATION_VALUE: u32 = 0x1130_0200;

/// Broadcast register writes issued before chip addressing
pub const PRE_ADDRESSING_WRITES: [(u8, u32); 2] = [
    (CLOCK_ORDER_CONTROL0_REG, 0x0000_0000),
    (CLOCK_ORDER_CONTROL1_REG, 0x0000_0000),
];
/// Value of the clock-counting broadcast issued after the difficulty mask
pub const HASH_COUNTING_VALUE: u32 = 0x0000_151c;
/// Per-chip clock-domain programming sequence
pub const CORE_CLOCK_WRITES: [u32; 3] = [0x8000_8b00, 0x8000_8018, 0x8000_82aa];
/// Per-chip misc control value closing the init sequence
pub const CHIP_MISC_CONTROL_VALUE: u32 = 0xf000_c100;

/// Baud rate produced by a given baud clock divisor
pub fn baud_rate_for_clock_div(clock_div: u32) -> u32 {
    CHIP_OSC_CLK_HZ / ((clock_div + 1) * CHIP_OSC_BAUD_BASE_DIV)
}

/// VERSION_ROLLING register value enabling hardware rolling of the bits
/// selected by `mask` (BIP320 bits shifted down to the chip's 16-bit field)
pub fn version_rolling_reg(mask: u32) -> u32 {
    0x9000_0000 | ((mask >> axe_bitcoin::BIP320_VERSION_SHIFT) & 0xffff)
}

/// Wire codec failures
#[derive(Debug, ThisError, PartialEq)]
pub enum FrameError {
    #[error("CRC mismatch (expected {expected:#04x}, received {actual:#04x})")]
    CrcMismatch { expected: u8, actual: u8 },
    #[error("bad preamble {0:#04x} {1:#04x}")]
    BadPreamble(u8, u8),
    #[error("short frame ({0} bytes)")]
    ShortFrame(usize),
}

/// This enum is a bridge between the linear chip index and how the chain is
/// addressed on the wire (broadcast or one concrete hardware address).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipAddress {
    All,
    /// Hardware address assigned during enumeration
    One(u8),
}

impl ChipAddress {
    /// Return if address is a broadcast
    pub fn is_broadcast(&self) -> bool {
        match self {
            ChipAddress::All => true,
            ChipAddress::One(_) => false,
        }
    }

    /// Group bits for the frame header byte
    fn to_group(&self) -> u8 {
        match self {
            ChipAddress::All => GROUP_ALL,
            ChipAddress::One(_) => GROUP_SINGLE,
        }
    }

    /// Return hardware chip address or 0 if it's a broadcast
    fn to_hw_addr(&self) -> u8 {
        match self {
            ChipAddress::All => 0,
            ChipAddress::One(addr) => *addr,
        }
    }
}

/// SET_ADDRESS command assigning a hardware address to the next
/// unconfigured chip in the chain
pub fn set_chip_address(addr: u8) -> [u8; 7] {
    let mut frame = [0x55, 0xaa, TYPE_CMD | GROUP_SINGLE | CMD_SET_ADDRESS, 5, addr, 0, 0];
    frame[6] = crc::crc5(&frame[2..6]);
    frame
}

/// INACTIVE broadcast stopping chips from relaying the chain-in signal,
/// a prerequisite of per-chip addressing
pub fn inactivate() -> [u8; 7] {
    let mut frame = [0x55, 0xaa, TYPE_CMD | GROUP_ALL | CMD_INACTIVE, 5, 0, 0, 0];
    frame[6] = crc::crc5(&frame[2..6]);
    frame
}

/// READ command; every addressed chip answers with a response frame
pub fn read_register(chip_address: ChipAddress, register: u8) -> [u8; 7] {
    let mut frame = [
        0x55,
        0xaa,
        TYPE_CMD | chip_address.to_group() | CMD_READ,
        5,
        chip_address.to_hw_addr(),
        register,
        0,
    ];
    frame[6] = crc::crc5(&frame[2..6]);
    frame
}

/// WRITE command carrying one 32-bit register value (big endian on the wire)
pub fn write_register(chip_address: ChipAddress, register: u8, value: u32) -> [u8; 11] {
    let value = value.to_be_bytes();
    let mut frame = [
        0x55,
        0xaa,
        TYPE_CMD | chip_address.to_group() | CMD_WRITE,
        9,
        chip_address.to_hw_addr(),
        register,
        value[0],
        value[1],
        value[2],
        value[3],
        0,
    ];
    frame[10] = crc::crc5(&frame[2..10]);
    frame
}

/// Everything a job frame needs, independent of the chip flavour. The
/// byte-reversed (`_be`) forms are the ones shipped on the wire.
#[derive(Debug, Clone)]
pub struct JobData<'a> {
    pub local_job_id: u8,
    pub num_midstates: u8,
    pub starting_nonce: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub merkle_root_be: &'a [u8; 32],
    pub prev_hash_be: &'a [u8; 32],
    pub version: u32,
    /// Byte-reversed midstates; empty for chips rolling the version in hardware
    pub midstates: &'a [[u8; 32]],
}

/// Encode a job for chips with hardware version rolling (full header form).
/// The buffer is cleared and reused, job submission must not allocate.
pub fn encode_header_job(job: &JobData, buf: &mut Vec<u8>) {
    debug_assert!(job.midstates.is_empty());
    encode_job_prologue(job, buf);
    buf.extend_from_slice(&job.merkle_root_be[..]);
    buf.extend_from_slice(&job.prev_hash_be[..]);
    buf.extend_from_slice(&job.version.to_le_bytes());
    encode_job_epilogue(buf);
}

/// Encode a job for midstate-based chips; only the merkle root tail goes to
/// the second SHA256 chunk, the heavy lifting was done on the host.
pub fn encode_midstate_job(job: &JobData, buf: &mut Vec<u8>) {
    debug_assert!(!job.midstates.is_empty());
    encode_job_prologue(job, buf);
    // last 4 bytes of the little endian merkle root
    buf.extend(job.merkle_root_be[0..4].iter().rev());
    for midstate in job.midstates {
        buf.extend_from_slice(&midstate[..]);
    }
    encode_job_epilogue(buf);
}

fn encode_job_prologue(job: &JobData, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&FRAME_PREAMBLE);
    buf.push(TYPE_JOB | GROUP_SINGLE | CMD_WRITE);
    buf.push(0); // length byte is patched in the epilogue
    buf.push(job.local_job_id);
    buf.push(job.num_midstates);
    buf.extend_from_slice(&job.starting_nonce.to_le_bytes());
    buf.extend_from_slice(&job.nbits.to_le_bytes());
    buf.extend_from_slice(&job.ntime.to_le_bytes());
}

fn encode_job_epilogue(buf: &mut Vec<u8>) {
    // length = payload + 4 (header byte, length byte and the two CRC bytes
    // appended below), which at this point equals the buffer length
    buf[3] = buf.len() as u8;
    let checksum = crc::crc16(&buf[2..]);
    buf.extend_from_slice(&checksum.to_be_bytes());
}

/// Fields of the 11-byte result frame after the preamble, little endian
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct ResultFrame {
    pub nonce: u32,
    pub midstate_num: u8,
    pub job_id: u8,
    pub version: u16,
}

impl ResultFrame {
    /// Validate preamble and CRC-5, then unpack the frame body
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < RESULT_FRAME_SIZE {
            return Err(FrameError::ShortFrame(frame.len()));
        }
        if frame[0..2] != RESPONSE_PREAMBLE {
            return Err(FrameError::BadPreamble(frame[0], frame[1]));
        }
        let expected = crc::crc5(&frame[2..10]);
        let actual = frame[10] & 0x1f;
        if expected != actual {
            return Err(FrameError::CrcMismatch { expected, actual });
        }
        Ok(Self::unpack_from_slice(&frame[2..10]).expect("BUG: result frame size mismatch"))
    }

    /// The job id with the small core bits masked out; this is the slot key
    /// of the job registry
    #[inline]
    pub fn job_id_hi(&self) -> u8 {
        self.job_id & 0xf8
    }

    /// Small core (or midstate) index that found the nonce
    #[inline]
    pub fn small_core(&self) -> u8 {
        self.job_id & 0x07
    }

    /// Big core index encoded in the high bits of the nonce
    #[inline]
    pub fn core_id(&self) -> u8 {
        ((self.nonce.swap_bytes() >> 25) & 0x7f) as u8
    }

    /// Rolled version delta, positioned at the BIP320 bits
    #[inline]
    pub fn version_bits(&self) -> u32 {
        (self.version.swap_bytes() as u32) << axe_bitcoin::BIP320_VERSION_SHIFT
    }
}

/// Supported members of the BM13xx family. The variant decides the init
/// constants and which job/result flavour the chain speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Bm1366,
    Bm1368,
    Bm1370,
    Bm1397,
}

impl Model {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "BM1366" => Some(Model::Bm1366),
            "BM1368" => Some(Model::Bm1368),
            "BM1370" => Some(Model::Bm1370),
            "BM1397" => Some(Model::Bm1397),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Model::Bm1366 => "BM1366",
            Model::Bm1368 => "BM1368",
            Model::Bm1370 => "BM1370",
            Model::Bm1397 => "BM1397",
        }
    }

    /// Chip identification as reported by the CHIP_ADDRESS register
    pub fn chip_id(&self) -> u16 {
        match self {
            Model::Bm1366 => 0x1366,
            Model::Bm1368 => 0x1368,
            Model::Bm1370 => 0x1370,
            Model::Bm1397 => 0x1397,
        }
    }

    /// Number of big cores on the chip
    pub fn core_count(&self) -> usize {
        match self {
            Model::Bm1366 => 112,
            Model::Bm1368 => 80,
            Model::Bm1370 => 128,
            Model::Bm1397 => 168,
        }
    }

    /// Number of small cores, the unit the nonce space is split by
    pub fn small_core_count(&self) -> usize {
        match self {
            Model::Bm1366 => 894,
            Model::Bm1368 => 1276,
            Model::Bm1370 => 2040,
            Model::Bm1397 => 672,
        }
    }

    /// Hardware difficulty filter the chain is initialized with
    pub fn default_difficulty(&self) -> u64 {
        256
    }

    /// How often a fresh job has to be pushed so no core runs dry
    pub fn job_interval(&self) -> Duration {
        match self {
            Model::Bm1366 => Duration::from_millis(1200),
            Model::Bm1368 => Duration::from_millis(1200),
            Model::Bm1370 => Duration::from_millis(600),
            Model::Bm1397 => Duration::from_millis(500),
        }
    }

    /// Number of midstates per job; the BM1397 implements AsicBoost by
    /// hashing four version-rolled midstates in parallel
    pub fn midstate_count(&self) -> usize {
        match self {
            Model::Bm1397 => 4,
            _ => 1,
        }
    }

    /// Newer chips roll the version field in hardware and take the full
    /// header instead of precomputed midstates
    pub fn hardware_version_rolling(&self) -> bool {
        !matches!(self, Model::Bm1397)
    }

    /// Factory default clock
    pub fn default_frequency_mhz(&self) -> f32 {
        match self {
            Model::Bm1366 => 485.0,
            Model::Bm1368 => 490.0,
            Model::Bm1370 => 600.0,
            Model::Bm1397 => 425.0,
        }
    }
}

/// Structure representing settings of the chip PLL divider.
/// It can serialize itself right to register settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Pll {
    fb_divider: u32,
    ref_divider: u32,
    post_divider_1: u32,
    post_divider_2: u32,
}

impl Pll {
    /// Feedback divider limits of the frequency search
    const MIN_FB_DIVIDER: u32 = 144;
    const MAX_FB_DIVIDER: u32 = 235;
    /// VCO speed above which the high-VCO bit must be set
    const HIGH_VCO_MHZ: f32 = 2400.0;

    /// Find divider settings approximating `target_mhz`.
    ///
    /// The space is searched with the reference divider descending, post
    /// divider 1 descending and post divider 2 ascending; the first setting
    /// minimizing the frequency error wins.
    pub fn try_from_frequency(target_mhz: f32) -> error::Result<Self> {
        let mut best: Option<(Pll, f32)> = None;

        for &ref_divider in &[2u32, 1] {
            for post_divider_1 in (1..=7u32).rev() {
                for post_divider_2 in 1..post_divider_1 {
                    let dividers = (ref_divider * post_divider_1 * post_divider_2) as f32;
                    let fb_divider = (dividers * target_mhz / 25.0).round() as u32;
                    if fb_divider < Self::MIN_FB_DIVIDER || fb_divider > Self::MAX_FB_DIVIDER {
                        continue;
                    }
                    let pll = Pll {
                        fb_divider,
                        ref_divider,
                        post_divider_1,
                        post_divider_2,
                    };
                    let frequency_error = (target_mhz - pll.frequency()).abs();
                    if best
                        .as_ref()
                        .map_or(true, |(_, best_error)| frequency_error < *best_error)
                    {
                        best = Some((pll, frequency_error));
                    }
                }
            }
        }

        best.map(|(pll, _)| pll).ok_or_else(|| {
            Error::Pll(format!("no divider settings for {:.2} MHz", target_mhz))
        })
    }

    /// Fixed divider set for the 200 MHz fallback clock
    pub fn fallback() -> Self {
        Self {
            fb_divider: 160,
            ref_divider: 2,
            post_divider_1: 5,
            post_divider_2: 2,
        }
    }

    /// Simulate the divider chain and return the resulting frequency
    pub fn frequency(&self) -> f32 {
        25.0 * self.fb_divider as f32
            / (self.ref_divider * self.post_divider_1 * self.post_divider_2) as f32
    }

    /// Whether the VCO runs above the high-speed threshold
    pub fn high_vco(&self) -> bool {
        25.0 * self.fb_divider as f32 / self.ref_divider as f32 >= Self::HIGH_VCO_MHZ
    }

    /// PLL0_PARAMETER register value
    pub fn to_reg(&self) -> u32 {
        let control = if self.high_vco() { 0x50u32 } else { 0x40u32 };
        (control << 24)
            | (self.fb_divider << 16)
            | (self.ref_divider << 8)
            | ((self.post_divider_1 - 1) << 4)
            | (self.post_divider_2 - 1)
    }
}

/// Largest power of two not above `difficulty`
pub fn largest_power_of_two(difficulty: u64) -> u64 {
    assert!(difficulty > 0, "BUG: difficulty must be at least 1");
    1u64 << (63 - difficulty.leading_zeros())
}

/// TICKET_MASK register for a requested difficulty.
///
/// The difficulty is rounded down to a power of two; the mask `difficulty-1`
/// is packed into four bytes with the bits of each byte reversed. Returns
/// the effective difficulty together with the register value.
pub fn ticket_mask_reg(difficulty: u64) -> error::Result<(u64, u32)> {
    if difficulty == 0 {
        return Err(Error::Hashchip("ASIC difficulty must be at least 1".into()));
    }
    let actual = largest_power_of_two(difficulty);
    let mask = (actual - 1) as u32;
    let bytes = mask.to_le_bytes();
    let reg = u32::from_be_bytes([
        bytes[3].reverse_bits(),
        bytes[2].reverse_bits(),
        bytes[1].reverse_bits(),
        bytes[0].reverse_bits(),
    ]);
    Ok((actual, reg))
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chip_address() {
        assert!(ChipAddress::All.is_broadcast());
        assert_eq!(ChipAddress::All.to_hw_addr(), 0);
        assert!(!ChipAddress::One(0x24).is_broadcast());
        assert_eq!(ChipAddress::One(0x24).to_hw_addr(), 0x24);
    }

    #[test]
    fn build_set_chip_address_cmd() {
        assert_eq!(
            set_chip_address(0x00),
            [0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]
        );
        assert_eq!(
            set_chip_address(0x08),
            [0x55, 0xaa, 0x40, 0x05, 0x08, 0x00, 0x07]
        );
    }

    #[test]
    fn build_inactivate_cmd() {
        assert_eq!(inactivate(), [0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn build_read_register_cmd() {
        // enumeration probe
        assert_eq!(
            read_register(ChipAddress::All, CHIP_ADDRESS_REG),
            [0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]
        );
        assert_eq!(
            read_register(ChipAddress::One(0x40), 0x1c),
            [0x55, 0xaa, 0x42, 0x05, 0x40, 0x1c, 0x0b]
        );
    }

    /// Ticket mask write for difficulty 256, chip 0 (wire scenario from the
    /// chip documentation)
    #[test]
    fn build_write_register_cmd() {
        let (difficulty, reg) = ticket_mask_reg(256).expect("ticket mask");
        assert_eq!(difficulty, 256);
        let frame = write_register(ChipAddress::One(0), TICKET_MASK_REG, reg);
        assert_eq!(
            frame,
            [0x55, 0xaa, 0x41, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xff, 0x00]
        );
    }

    #[test]
    fn test_ticket_mask_rounding() {
        // non-power-of-two difficulties round down
        let (difficulty, reg) = ticket_mask_reg(1000).expect("ticket mask");
        assert_eq!(difficulty, 512);
        assert_eq!(reg, 0x0000_80ff);
        // difficulty 1 means "report everything"
        let (difficulty, reg) = ticket_mask_reg(1).expect("ticket mask");
        assert_eq!(difficulty, 1);
        assert_eq!(reg, 0);
        assert!(ticket_mask_reg(0).is_err());
    }

    #[test]
    fn test_version_rolling_reg() {
        assert_eq!(version_rolling_reg(0xffff_ffff), 0x9000_ffff);
        assert_eq!(version_rolling_reg(0x1fff_e000), 0x9000_ffff);
        assert_eq!(version_rolling_reg(0x0000_e000), 0x9000_0007);
    }

    #[test]
    fn test_initial_baud_rate() {
        assert_eq!(baud_rate_for_clock_div(INIT_BAUD_CLOCK_DIV), 115_740);
    }

    #[test]
    fn test_result_frame_parse() {
        // nonce 0x12345678, midstate 0, job id 0x38, version delta 0x0001
        let mut frame = [
            0xaa, 0x55, 0x78, 0x56, 0x34, 0x12, 0x00, 0x38, 0x01, 0x00, 0x00,
        ];
        frame[10] = crc::crc5(&frame[2..10]);
        let result = ResultFrame::parse(&frame).expect("parse result");
        assert_eq!(result.nonce, 0x12345678);
        assert_eq!(result.midstate_num, 0);
        assert_eq!(result.job_id_hi(), 0x38);
        assert_eq!(result.small_core(), 0);
        assert_eq!(result.version, 0x0001);
        // bswap16(0x0001) << 13
        assert_eq!(result.version_bits(), 0x0100 << 13);
        // core id from the byte-swapped nonce
        assert_eq!(result.core_id(), ((0x78563412u32 >> 25) & 0x7f) as u8);
    }

    #[test]
    fn test_result_frame_rejects() {
        let short = [0xaa, 0x55, 0x00];
        assert_eq!(ResultFrame::parse(&short), Err(FrameError::ShortFrame(3)));

        let mut bad_preamble = [0u8; RESULT_FRAME_SIZE];
        bad_preamble[0] = 0x55;
        bad_preamble[1] = 0xaa;
        assert_eq!(
            ResultFrame::parse(&bad_preamble),
            Err(FrameError::BadPreamble(0x55, 0xaa))
        );

        let mut bad_crc = [
            0xaa, 0x55, 0x78, 0x56, 0x34, 0x12, 0x00, 0x38, 0x01, 0x00, 0x00,
        ];
        bad_crc[10] = crc::crc5(&bad_crc[2..10]) ^ 0x01;
        assert!(matches!(
            ResultFrame::parse(&bad_crc),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_encode_header_job() {
        let merkle_root_be = [0x11u8; 32];
        let prev_hash_be = [0x22u8; 32];
        let job = JobData {
            local_job_id: 0x18,
            num_midstates: 1,
            starting_nonce: 0,
            nbits: 0x1707_9e15,
            ntime: 0x638e_3275,
            merkle_root_be: &merkle_root_be,
            prev_hash_be: &prev_hash_be,
            version: 0x2000_0000,
            midstates: &[],
        };
        let mut buf = Vec::new();
        encode_header_job(&job, &mut buf);

        assert_eq!(buf.len(), 88);
        assert_eq!(&buf[0..2], &FRAME_PREAMBLE);
        assert_eq!(buf[2], 0x21);
        // length byte covers payload + header + length + CRC16
        assert_eq!(buf[3] as usize, buf.len() - 2);
        assert_eq!(buf[4], 0x18);
        assert_eq!(buf[5], 1);
        // nbits little endian
        assert_eq!(&buf[10..14], &[0x15, 0x9e, 0x07, 0x17]);
        // trailer carries CRC16 over header..payload
        let checksum = crc::crc16(&buf[2..86]);
        assert_eq!(&buf[86..88], &checksum.to_be_bytes());
    }

    #[test]
    fn test_encode_midstate_job_round_trip_sizes() {
        let merkle_root_be = [0xabu8; 32];
        let prev_hash_be = [0xcdu8; 32];
        let midstates = [[0x01u8; 32], [0x02u8; 32], [0x03u8; 32], [0x04u8; 32]];
        let job = JobData {
            local_job_id: 0x20,
            num_midstates: 4,
            starting_nonce: 0,
            nbits: 0x1707_9e15,
            ntime: 0x638e_3275,
            merkle_root_be: &merkle_root_be,
            prev_hash_be: &prev_hash_be,
            version: 0x2000_0000,
            midstates: &midstates,
        };
        let mut buf = Vec::new();
        encode_midstate_job(&job, &mut buf);
        // 2 preamble + 1 header + 1 length + 18 fixed + 4*32 midstates + 2 CRC
        assert_eq!(buf.len(), 152);
        // merkle root tail is the reversal of the leading BE bytes
        assert_eq!(&buf[18..22], &[0xab, 0xab, 0xab, 0xab]);
        let checksum = crc::crc16(&buf[2..150]);
        assert_eq!(&buf[150..152], &checksum.to_be_bytes());
    }

    #[test]
    fn test_pll_exact_settings() {
        let pll = Pll::try_from_frequency(525.0).expect("dividers exist");
        assert_eq!(
            pll,
            Pll {
                fb_divider: 210,
                ref_divider: 2,
                post_divider_1: 5,
                post_divider_2: 1,
            }
        );
        assert_relative_eq!(pll.frequency(), 525.0f32);
        // 25 * 210 / 2 = 2625 MHz VCO
        assert!(pll.high_vco());
        assert_eq!(pll.to_reg(), 0x50d2_0240);
    }

    #[test]
    fn test_pll_vco_boundary() {
        // 1100 MHz resolves with a VCO of 2200 MHz, below the threshold
        let pll = Pll::try_from_frequency(1100.0).expect("dividers exist");
        assert!(!pll.high_vco());
        assert_eq!(pll.to_reg(), 0x40b0_0210);
        // 600 MHz sits exactly on the 2400 MHz boundary
        let pll = Pll::try_from_frequency(600.0).expect("dividers exist");
        assert!(pll.high_vco());
        assert_eq!(pll.to_reg(), 0x50c0_0230);
    }

    #[test]
    fn test_pll_out_of_range() {
        // nothing in the feedback divider range can make 20 MHz
        assert!(Pll::try_from_frequency(20.0).is_err());
        // the fallback divider set produces the safe 200 MHz clock
        let fallback = Pll::fallback();
        assert_relative_eq!(fallback.frequency(), 200.0f32);
    }

    #[test]
    fn test_model_properties() {
        let model = Model::from_name("BM1366").expect("known model");
        assert_eq!(model, Model::Bm1366);
        assert!(model.hardware_version_rolling());
        assert_eq!(model.midstate_count(), 1);

        let model = Model::from_name("BM1397").expect("known model");
        assert!(!model.hardware_version_rolling());
        assert_eq!(model.midstate_count(), 4);

        assert!(Model::from_name("BM1337").is_none());
    }
}
