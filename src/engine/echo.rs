//! Local echo engine
//!
//! Streams the incoming message back word by word. Used as the default
//! engine so the service runs without an upstream model.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EngineError, EngineEvent, EngineRun, GenerationEngine, GenerationRequest};

pub struct EchoEngine {
    chunk_delay: Duration,
}

impl EchoEngine {
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl GenerationEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    async fn start(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineRun, EngineError> {
        if request.message.trim().is_empty() {
            return Err(EngineError::Start("message is empty".to_string()));
        }

        let (tx, run) = EngineRun::channel(16);
        let delay = self.chunk_delay;
        let words: Vec<String> = request
            .message
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();

        tokio::spawn(async move {
            for word in words {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(resource_id = %request.resource_id, "echo engine stopping");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        if tx.send(EngineEvent::Chunk(word.into_bytes())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(run)
    }
}
