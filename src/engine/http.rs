//! Upstream HTTP generation engine
//!
//! POSTs the request to an upstream generation service and relays its
//! streaming response body chunk by chunk. Cancellation drops the body,
//! which aborts the upstream request.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EngineError, EngineEvent, EngineRun, GenerationEngine, GenerationRequest};

pub struct HttpEngine {
    client: Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    resource_id: &'a str,
    owner_id: &'a str,
    message: &'a str,
}

impl HttpEngine {
    pub fn new(url: impl Into<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl GenerationEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineRun, EngineError> {
        let body = UpstreamRequest {
            resource_id: request.resource_id.as_str(),
            owner_id: request.owner_id.as_str(),
            message: &request.message,
        };

        let send = self.client.post(&self.url).json(&body).send();
        let response = tokio::select! {
            response = send => response.map_err(|e| EngineError::Upstream(e.to_string()))?,
            _ = cancel.cancelled() => {
                debug!(resource_id = %request.resource_id, "cancelled before upstream responded");
                return Err(EngineError::Start(
                    "cancelled before upstream responded".to_string(),
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Start(format!(
                "upstream returned {}: {}",
                status,
                detail.trim()
            )));
        }

        let (tx, run) = EngineRun::channel(32);
        let resource_id = request.resource_id;

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(resource_id = %resource_id, "aborting upstream generation");
                        break;
                    }
                    next = body.next() => match next {
                        Some(Ok(bytes)) => {
                            if tx.send(EngineEvent::Chunk(bytes.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(resource_id = %resource_id, error = %e, "upstream stream failed");
                            let _ = tx.send(EngineEvent::Failed(e.to_string())).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(run)
    }
}
