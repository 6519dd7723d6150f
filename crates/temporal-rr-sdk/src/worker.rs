// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker loop.
//!
//! One batch frame in, one batch frame out. The loop ends when the host
//! closes the transport, sends an error frame, or the shutdown token fires.
//! A batch that cannot be decoded means the stream is corrupt: the host is
//! told with an error frame and the loop fails.
//!
//! Workflow state is single-threaded, so the future returned by
//! [`Worker::run`] is not `Send`. Run it on a current-thread runtime or
//! inside a `LocalSet`.
//!
//! # Example
//!
//! ```ignore
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), SdkError> {
//!     init_tracing();
//!     let config = WorkerConfig::from_env()?;
//!     let mut worker = Worker::stdio(&config, workflows(), activities());
//!     worker.run(CancellationToken::new()).await
//! }
//! ```

use temporal_rr_protocol::{Codec, Frame, JsonCodec, MessageType};
use tokio::io::{Stdin, Stdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::registry::{ActivityRegistry, WorkflowRegistry};
use crate::router::Router;
use crate::transport::{PipeTransport, Transport};

pub struct Worker<T> {
    transport: T,
    router: Router,
    codec: Box<dyn Codec>,
}

impl<T: Transport> Worker<T> {
    pub fn new(transport: T, router: Router) -> Self {
        Self {
            transport,
            router,
            codec: Box::new(JsonCodec),
        }
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Mutable access between runs of the loop, e.g. to take recorded
    /// histories.
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Serve batches until the transport closes or `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Worker started");
        loop {
            let frame = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                frame = self.transport.receive() => frame?,
            };

            let Some(frame) = frame else {
                info!("Host closed the transport");
                break;
            };

            match frame.message_type {
                MessageType::Batch => {
                    let batch = match self.codec.decode(&frame.payload) {
                        Ok(batch) => batch,
                        Err(err) => {
                            error!(error = %err, "Failed to decode batch");
                            self.transport.send(Frame::error(&err.to_string())).await?;
                            return Err(err.into());
                        }
                    };
                    let reply = self.router.dispatch(batch).await;
                    let payload = self.codec.encode(&reply)?;
                    debug!(bytes = payload.len(), "Sending reply");
                    self.transport.send(Frame::batch(payload)?).await?;
                }
                MessageType::Error => {
                    warn!(message = %frame.error_message(), "Host reported an error");
                    break;
                }
                other => {
                    warn!(message_type = ?other, "Ignoring unexpected frame");
                }
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}

impl Worker<PipeTransport<Stdin, Stdout>> {
    /// Worker on the host's pipes, configured from `config`.
    pub fn stdio(
        config: &WorkerConfig,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> Self {
        Worker::new(
            PipeTransport::stdio(),
            Router::from_config(config, workflows, activities),
        )
    }
}
