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

//! Byte-level access to the hash chain UART. The transport is anything
//! implementing the tokio I/O traits (a tty device node, a TCP serial
//! bridge, a test double); board control beyond the byte stream - the reset
//! GPIO and host-side baud programming - sits behind the `Control` trait so
//! platform support packages can plug in without touching the driver.

use axe_logging::macros::*;

use async_trait::async_trait;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

use crate::error;

use std::time::Duration;

/// How long to keep draining stray bytes when resynchronizing
const PURGE_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Board-level control lines of the hash chain
#[async_trait]
pub trait Control: Send {
    /// Pulse the chain reset: line low for `hold`, then high for `hold`
    async fn hardware_reset(&mut self, hold: Duration) -> error::Result<()>;

    /// Reprogram the host UART speed to match the chain
    fn set_baud_rate(&mut self, baud: u32) -> error::Result<()>;
}

/// Control backend for transports with no reset line or programmable UART
/// (TCP bridges, preconfigured ttys, tests). Honors the reset timing
/// contract so chips behind a self-resetting adapter still settle.
pub struct NullControl;

#[async_trait]
impl Control for NullControl {
    async fn hardware_reset(&mut self, hold: Duration) -> error::Result<()> {
        warn!("chain link has no reset line, relying on power-on state");
        tokio::time::sleep(2 * hold).await;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> error::Result<()> {
        info!("chain link keeps its configured speed (requested {} bps)", baud);
        Ok(())
    }
}

/// Transmit half of the chain link
pub struct FrameTx<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameTx<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one complete frame
    pub async fn send(&mut self, frame: &[u8]) -> error::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Receive half of the chain link
pub struct FrameRx<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> FrameRx<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Fill `buf` completely or report a quiet timeout with `None`.
    ///
    /// A timeout can leave a partial frame in `buf`; callers resynchronize
    /// with `purge` before trusting the stream again.
    pub async fn recv(&mut self, buf: &mut [u8], quiet: Duration) -> error::Result<Option<()>> {
        match timeout(quiet, self.inner.read_exact(buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(read_result) => {
                read_result?;
                Ok(Some(()))
            }
        }
    }

    /// Throw away everything sitting in the receive direction
    pub async fn purge(&mut self) -> error::Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            match timeout(PURGE_READ_TIMEOUT, self.inner.read(&mut scratch)).await {
                // quiet - the direction is clean
                Err(_elapsed) => return Ok(()),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => trace!("purged {} stray bytes", n),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Split a duplex byte stream into the two halves the sender and receiver
/// tasks own
pub fn split<T>(stream: T) -> (FrameTx<WriteHalf<T>>, FrameRx<ReadHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (FrameTx::new(write_half), FrameRx::new(read_half))
}


#[cfg(test)]
mod test {
    use super::test_utils::SimStream;
    use super::*;

    #[tokio::test]
    async fn test_send_records_frame() {
        let stream = SimStream::new();
        let (mut tx, _rx) = split(stream.clone());
        tx.send(&[0x55, 0xaa, 0x01]).await.expect("send");
        assert_eq!(stream.sent(), vec![0x55, 0xaa, 0x01]);
    }

    #[tokio::test]
    async fn test_recv_exact_and_timeout() {
        let stream = SimStream::new();
        let (_tx, mut rx) = split(stream.clone());

        stream.push_rx(&[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        let received = rx
            .recv(&mut buf, Duration::from_millis(50))
            .await
            .expect("recv");
        assert_eq!(received, Some(()));
        assert_eq!(buf, [1, 2, 3, 4]);

        // nothing queued now: quiet timeout
        let received = rx
            .recv(&mut buf, Duration::from_millis(10))
            .await
            .expect("recv");
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_purge_drains_stray_bytes() {
        let stream = SimStream::new();
        let (_tx, mut rx) = split(stream.clone());
        stream.push_rx(&[0xff; 10]);
        rx.purge().await.expect("purge");
        let mut buf = [0u8; 1];
        let received = rx
            .recv(&mut buf, Duration::from_millis(10))
            .await
            .expect("recv");
        assert_eq!(received, None);
    }
}
