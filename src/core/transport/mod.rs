//! Transport layer
//!
//! Implementations of the port transaction primitive over serial lines and
//! TCP sockets, plus a scripted mock used by the tests.

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use mock::{LineEvent, MockReply, MockTransport, Script, TransactionLog};
pub use serial::{SerialPortConfig, SerialTransport};
pub use tcp::{TcpPortConfig, TcpTransport};
pub use traits::{FrameCompleteFn, FrameRead, LineSettings, Parity, Transport};

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};

use crate::error::TransactionError;

/// Silence window used when draining noise from an idle channel.
pub(crate) const NOISE_TIMEOUT: Duration = Duration::from_millis(10);

/// Shared framed-read loop for byte-stream transports.
///
/// First byte is awaited for `response_timeout`, every following byte for
/// `frame_timeout`; the predicate short-circuits the wait once the bytes
/// read so far form a complete frame.
pub(crate) async fn read_framed<R>(
    stream: &mut R,
    max_len: usize,
    response_timeout: Duration,
    frame_timeout: Duration,
    frame_complete: Option<FrameCompleteFn<'_>>,
) -> Result<FrameRead, TransactionError>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let mut buf = vec![0u8; max_len];
    let mut nread = 0usize;
    let mut first_byte_latency = Duration::ZERO;

    loop {
        if nread > 0 {
            if let Some(complete) = frame_complete {
                if complete(&buf[..nread]) {
                    break;
                }
            }
        }
        if nread >= max_len {
            break;
        }

        let wait = if nread == 0 {
            response_timeout
        } else {
            frame_timeout
        };
        match timeout(wait, stream.read(&mut buf[nread..])).await {
            Ok(Ok(0)) => {
                return Err(TransactionError::io("channel closed while reading frame"));
            }
            Ok(Ok(n)) => {
                if nread == 0 {
                    first_byte_latency = started.elapsed();
                }
                nread += n;
            }
            Ok(Err(e)) => return Err(TransactionError::io(format!("read failed: {e}"))),
            Err(_) if nread == 0 => {
                return Err(TransactionError::timeout(format!(
                    "no response within {response_timeout:?}"
                )));
            }
            // Inter-byte silence: the frame is over.
            Err(_) => break,
        }
    }

    buf.truncate(nread);
    Ok(FrameRead {
        bytes: buf,
        first_byte_latency,
    })
}

/// Shared noise-draining loop. Returns the number of discarded bytes.
pub(crate) async fn drain_noise<R>(stream: &mut R) -> Result<usize, TransactionError>
where
    R: AsyncRead + Unpin,
{
    let mut discarded = 0usize;
    let mut scratch = [0u8; 64];
    loop {
        match timeout(NOISE_TIMEOUT, stream.read(&mut scratch)).await {
            Ok(Ok(0)) => return Err(TransactionError::io("channel closed while draining")),
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(TransactionError::io(format!("read failed: {e}"))),
            Err(_) => return Ok(discarded),
        }
    }
}
