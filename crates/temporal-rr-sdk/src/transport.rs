// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame transports between the worker and its host.

use async_trait::async_trait;
use temporal_rr_protocol::{Frame, FrameError};
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio::sync::mpsc;

/// Moves whole frames to and from the host.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), FrameError>;

    /// Next frame, or `None` once the host closed the transport.
    async fn receive(&mut self) -> Result<Option<Frame>, FrameError>;
}

/// Frames over a reader/writer pair. The host's pipes by default.
pub struct PipeTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> PipeTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl PipeTransport<Stdin, Stdout> {
    /// Stdin/stdout; logs must go to stderr.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> Transport for PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), FrameError> {
        temporal_rr_protocol::frame::write_frame(&mut self.writer, &frame).await
    }

    async fn receive(&mut self) -> Result<Option<Frame>, FrameError> {
        match temporal_rr_protocol::frame::read_frame(&mut self.reader).await {
            Ok(frame) => Ok(Some(frame)),
            Err(FrameError::ConnectionClosed) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// In-memory transport, one end of a pair.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl ChannelTransport {
    /// Two connected ends: what one sends the other receives.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: left_tx,
                rx: left_rx,
            },
            ChannelTransport {
                tx: right_tx,
                rx: right_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.tx
            .send(frame)
            .map_err(|_| FrameError::ConnectionClosed)
    }

    async fn receive(&mut self) -> Result<Option<Frame>, FrameError> {
        Ok(self.rx.recv().await)
    }
}
