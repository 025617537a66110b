//! Generation engine abstraction
//!
//! The coordinator treats the engine as opaque: it hands over the latest
//! message and a cancellation token, and gets back a channel of output
//! events. Closing the channel is how an engine acknowledges that it is done,
//! whether it finished on its own or honoured a stop request.

pub mod echo;
pub mod http;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{OwnerId, ResourceId};

pub use echo::EchoEngine;
pub use http::HttpEngine;

/// Output produced by one engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Opaque bytes in the engine's own wire protocol
    Chunk(Vec<u8>),
    /// The engine failed after it started producing
    Failed(String),
}

/// Input for one engine invocation
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub resource_id: ResourceId,
    pub owner_id: OwnerId,
    pub message: String,
}

/// A started engine invocation
pub struct EngineRun {
    events: mpsc::Receiver<EngineEvent>,
}

impl EngineRun {
    pub fn new(events: mpsc::Receiver<EngineEvent>) -> Self {
        Self { events }
    }

    /// Create a run together with the sender the engine produces into
    pub fn channel(buffer: usize) -> (mpsc::Sender<EngineEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    pub fn into_events(self) -> mpsc::Receiver<EngineEvent> {
        self.events
    }
}

/// Errors raised while starting an engine invocation
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Start(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Generation engine trait
///
/// Implementations must watch `cancel` and close their event channel once
/// they have stopped. They may take as long as they like to do so.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Start producing output for `request`
    async fn start(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineRun, EngineError>;

    /// Encode a mid-stream failure as an in-band frame
    ///
    /// Defaults to the error part of the AI SDK data stream protocol.
    fn encode_error(&self, reason: &str) -> Vec<u8> {
        let encoded = serde_json::Value::String(reason.to_string()).to_string();
        format!("3:{}\n", encoded).into_bytes()
    }
}
