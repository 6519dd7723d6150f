// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch codec.

use bytes::Bytes;
use thiserror::Error;

use crate::message::{Batch, CommandId, Message};

/// Errors raised while encoding or decoding a batch
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request {0} has an empty command name")]
    EmptyCommand(CommandId),
}

/// Converts batches to and from their wire payload.
pub trait Codec: Send + Sync {
    fn encode(&self, batch: &Batch) -> Result<Bytes, CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<Batch, CodecError>;
}

/// JSON batch codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn validate(batch: &Batch) -> Result<(), CodecError> {
        for message in &batch.messages {
            if let Message::Request(request) = message
                && request.command.is_empty()
            {
                return Err(CodecError::EmptyCommand(request.id));
            }
        }
        Ok(())
    }
}

impl Codec for JsonCodec {
    fn encode(&self, batch: &Batch) -> Result<Bytes, CodecError> {
        Self::validate(batch)?;
        Ok(Bytes::from(serde_json::to_vec(batch)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<Batch, CodecError> {
        let batch: Batch = serde_json::from_slice(payload)?;
        Self::validate(&batch)?;
        Ok(batch)
    }
}
