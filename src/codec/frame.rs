//! Frame reader: fixed header + remaining length + body off an async stream

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::{RemainingLength, MAX_REMAINING_LENGTH};
use crate::protocol::{FrameError, PacketType};

/// One raw control packet: the first header byte and the body that followed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_header(self.header)
    }
}

/// Reads whole frames from a transport.
///
/// `read_frame` is not cancel safe: dropping it mid-frame loses the bytes
/// already consumed. Callers only cancel it when the connection is being
/// torn down.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_packet_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_packet_size: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the transport
    /// cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let header = match self.inner.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(FrameError::Io(e)),
        };

        let len = self.read_remaining_length().await? as usize;
        if len > self.max_packet_size {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        let mut body = BytesMut::zeroed(len);
        self.inner.read_exact(&mut body).await?;

        Ok(Some(Frame {
            header,
            body: body.freeze(),
        }))
    }

    async fn read_remaining_length(&mut self) -> Result<u32, FrameError> {
        let mut acc = RemainingLength::default();
        loop {
            let byte = self.inner.read_u8().await?;
            if let Some(value) = acc.push(byte)? {
                return Ok(value);
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}
