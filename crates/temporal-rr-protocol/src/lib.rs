// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Temporal RoadRunner Protocol - framing and JSON batch layer
//!
//! This crate provides the wire protocol between a workflow worker and the
//! host process that bridges it to the Temporal server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   temporal-rr-protocol                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: Batch { context, [Request | Success | Failure] } │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: JSON (serde_json)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length + type header over any byte stream         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use temporal_rr_protocol::{Batch, Codec, Frame, FramedStream, JsonCodec};
//!
//! let mut stream = FramedStream::new(tokio::io::stdin());
//! let frame = stream.read_frame().await?;
//! let batch: Batch = JsonCodec.decode(&frame.payload)?;
//! ```

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{Codec, CodecError, JsonCodec};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use message::{
    Batch, CommandId, ErrorCode, ErrorInfo, ErrorResponse, Message, Request, SuccessResponse,
    TickContext, commands,
};
