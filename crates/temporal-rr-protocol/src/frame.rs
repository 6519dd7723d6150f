// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream framing shared by the tick pipe and the RPC socket.
//!
//! ```text
//! +----------------+--------------+------------------+
//! | length: u32 BE | type: u16 BE | payload (length) |
//! +----------------+--------------+------------------+
//! ```
//!
//! Batch, request and response payloads are JSON. Error payloads are plain
//! UTF-8 text.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix plus type tag.
pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// One tick worth of messages, in either direction
    Batch = 1,
    /// Fatal transport error; the receiver should stop
    Error = 2,
    /// RPC call from the worker to the host endpoint
    Request = 3,
    Response = 4,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u16) -> Result<Self, FrameError> {
        Ok(match tag {
            1 => MessageType::Batch,
            2 => MessageType::Error,
            3 => MessageType::Request,
            4 => MessageType::Response,
            other => return Err(FrameError::InvalidMessageType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The peer answered an RPC with an error frame
    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("expected a {expected:?} frame, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("connection closed")]
    ConnectionClosed,
}

fn check_size(len: usize) -> Result<usize, FrameError> {
    if len > MAX_FRAME_SIZE {
        Err(FrameError::FrameTooLarge(len))
    } else {
        Ok(len)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        check_size(payload.len())?;
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Frame an already encoded batch.
    pub fn batch(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::new(MessageType::Batch, payload)
    }

    /// Error frames are small and never rejected for size.
    pub fn error(message: &str) -> Self {
        Self {
            message_type: MessageType::Error,
            payload: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn request<T: Serialize>(body: &T) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, serde_json::to_vec(body)?)
    }

    pub fn response<T: Serialize>(body: &T) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, serde_json::to_vec(body)?)
    }

    /// Parse the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Header and payload as one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Write `frame` and flush, so the peer sees it immediately.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A stream that ends before a header starts yields
/// `ConnectionClosed`; one that ends inside a frame is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let length = match reader.read_u32().await {
        Ok(length) => check_size(length as usize).inspect_err(|_| {
            warn!(length, "Rejecting oversized frame");
        })?,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("Stream closed between frames");
            return Err(FrameError::ConnectionClosed);
        }
        Err(err) => return Err(err.into()),
    };
    let message_type = MessageType::try_from(reader.read_u16().await?)?;
    debug!(length, ?message_type, "Reading frame");

    let mut payload = BytesMut::zeroed(length);
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type,
        payload: payload.freeze(),
    })
}

/// A byte stream carrying frames.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// One RPC round trip: a request frame out, a response or error frame
    /// back.
    #[instrument(skip_all)]
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        body: &Req,
    ) -> Result<Resp, FrameError> {
        self.write_frame(&Frame::request(body)?).await?;
        let reply = self.read_frame().await?;
        match reply.message_type {
            MessageType::Response => reply.decode(),
            MessageType::Error => {
                let message = reply.error_message();
                debug!(%message, "Peer answered with an error frame");
                Err(FrameError::Remote(message))
            }
            actual => Err(FrameError::UnexpectedType {
                expected: MessageType::Response,
                actual,
            }),
        }
    }
}
