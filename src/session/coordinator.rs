//! Generation coordinator
//!
//! Runs once per generate request:
//!
//! 1. If the resource is `Running`, ask the live handle to stop.
//! 2. Poll the state until it leaves `Running`, bounded by `stop_timeout`.
//! 3. On timeout, force-clear the resource and reject the request. A wedged
//!    engine never blocks the resource forever, and two engines never run
//!    for it at once.
//! 4. Reserve credits, register a fresh handle, start the engine, and hand
//!    back the response stream. From there the handle owns its lifecycle.
//!
//! The engine start is bounded too. Stopping the handle or hitting
//! `start_timeout` ends it, and a request dropped mid-start is unwound by
//! `StartGuard`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::CoordinatorError;
use super::handle::{HandleOptions, ResponseStream, StreamHandle};
use super::registry::StreamRegistry;
use super::state::{SessionState, SessionStateStore, StatusView};
use crate::engine::{EngineError, EngineRun, GenerationEngine, GenerationRequest};
use crate::ledger::CreditLedger;
use crate::types::{OwnerId, ResourceId};

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often to re-check the state while waiting for a stop
    pub poll_interval: Duration,
    /// Upper bound on waiting for a preempted session to stop
    pub stop_timeout: Duration,
    /// Upper bound on `GenerationEngine::start`
    pub start_timeout: Duration,
    /// Credits reserved per generation
    pub generation_cost: u64,
    /// Inactivity watchdog for live handles
    pub keepalive_timeout: Option<Duration>,
    /// Response chunks buffered per stream
    pub stream_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(5000),
            start_timeout: Duration::from_secs(30),
            generation_cost: 1,
            keepalive_timeout: Some(Duration::from_secs(300)),
            stream_buffer: 64,
        }
    }
}

/// A request to generate a response for one resource
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub resource_id: ResourceId,
    pub owner_id: OwnerId,
    pub message: String,
}

impl GenerateRequest {
    pub fn new(
        resource_id: impl Into<ResourceId>,
        owner_id: impl Into<OwnerId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            message: message.into(),
        }
    }
}

pub struct GenerationCoordinator {
    config: CoordinatorConfig,
    registry: Arc<dyn StreamRegistry>,
    states: Arc<SessionStateStore>,
    ledger: Arc<dyn CreditLedger>,
    engine: Arc<dyn GenerationEngine>,
}

impl GenerationCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<dyn StreamRegistry>,
        states: Arc<SessionStateStore>,
        ledger: Arc<dyn CreditLedger>,
        engine: Arc<dyn GenerationEngine>,
    ) -> Self {
        Self {
            config,
            registry,
            states,
            ledger,
            engine,
        }
    }

    pub fn registry(&self) -> &Arc<dyn StreamRegistry> {
        &self.registry
    }

    /// Start a generation, preempting any live one for the same resource
    pub async fn generate(&self, request: GenerateRequest) -> Result<ResponseStream, CoordinatorError> {
        let GenerateRequest {
            resource_id,
            owner_id,
            message,
        } = request;

        self.preempt(&resource_id).await?;

        let cost = self.config.generation_cost;
        if !self.ledger.try_reserve(&owner_id, cost).await? {
            info!(resource_id = %resource_id, owner_id = %owner_id, cost, "insufficient credits");
            return Err(CoordinatorError::InsufficientCredits {
                owner: owner_id,
                required: cost,
            });
        }

        let handle = StreamHandle::new(
            resource_id.clone(),
            owner_id.clone(),
            Arc::clone(&self.registry),
            HandleOptions {
                keepalive_timeout: self.config.keepalive_timeout,
                stream_buffer: self.config.stream_buffer,
            },
        );
        let weak = Arc::downgrade(&handle);
        handle.register_abort_callback(move || {
            if let Some(handle) = weak.upgrade() {
                handle.stop();
            }
        });

        let Some(body) = handle.as_response_stream() else {
            self.refund(&owner_id, cost).await;
            return Err(CoordinatorError::Internal(
                "fresh stream handle had no response stream".to_string(),
            ));
        };

        if !self.registry.try_register(Arc::clone(&handle)) {
            warn!(resource_id = %resource_id, "lost registration race to a concurrent request");
            self.refund(&owner_id, cost).await;
            return Err(CoordinatorError::Internal(format!(
                "resource {} was claimed by a concurrent request",
                resource_id
            )));
        }

        let engine_request = GenerationRequest {
            resource_id: resource_id.clone(),
            owner_id: owner_id.clone(),
            message,
        };

        let guard = StartGuard {
            handle: Arc::clone(&handle),
            ledger: Arc::clone(&self.ledger),
            owner_id: owner_id.clone(),
            cost,
            armed: true,
        };
        let cancel = handle.cancellation_token();
        let outcome = tokio::select! {
            biased;
            started = self.engine.start(engine_request, cancel.clone()) => StartOutcome::Started(started),
            _ = cancel.cancelled() => StartOutcome::Cancelled,
            _ = tokio::time::sleep(self.config.start_timeout) => StartOutcome::TimedOut,
        };
        guard.disarm();

        // An engine that bails out because it saw the stop is a cancellation,
        // not a start failure.
        let outcome = match outcome {
            StartOutcome::Started(Err(_)) if cancel.is_cancelled() => StartOutcome::Cancelled,
            other => other,
        };

        match outcome {
            StartOutcome::Started(Ok(run)) => {
                handle.attach(run, Arc::clone(&self.engine));
                info!(
                    resource_id = %resource_id,
                    stream_id = %handle.id(),
                    engine = self.engine.name(),
                    "generation started"
                );
                Ok(body)
            }
            StartOutcome::Started(Err(e)) => {
                let reason = e.to_string();
                error!(resource_id = %resource_id, error = %reason, "engine failed to start");
                handle.fail_start(reason.clone());
                self.refund(&owner_id, cost).await;
                Err(CoordinatorError::EngineStartFailure(reason))
            }
            StartOutcome::TimedOut => {
                let reason = format!(
                    "engine did not start within {} ms",
                    self.config.start_timeout.as_millis()
                );
                error!(resource_id = %resource_id, "{}", reason);
                handle.stop();
                handle.fail_start(reason.clone());
                self.refund(&owner_id, cost).await;
                Err(CoordinatorError::EngineStartFailure(reason))
            }
            StartOutcome::Cancelled => {
                info!(resource_id = %resource_id, stream_id = %handle.id(), "stopped before the engine started");
                handle.cancel_start();
                self.refund(&owner_id, cost).await;
                Err(CoordinatorError::StartCancelled {
                    resource: resource_id,
                })
            }
        }
    }

    /// Ask the live generation for a resource to stop
    ///
    /// Returns `false` when nothing is running.
    pub fn stop(&self, resource_id: &ResourceId) -> bool {
        match self.registry.lookup(resource_id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Status projection for pollers
    pub fn status(&self, resource_id: &ResourceId) -> StatusView {
        self.states.view(resource_id)
    }

    async fn preempt(&self, resource_id: &ResourceId) -> Result<(), CoordinatorError> {
        if !self.states.get(resource_id).is_running() {
            return Ok(());
        }

        match self.registry.lookup(resource_id) {
            Some(handle) => {
                info!(resource_id = %resource_id, stream_id = %handle.id(), "preempting running generation");
                handle.stop();
            }
            None => warn!(resource_id = %resource_id, "resource is running without a registered stream"),
        }

        let started = Instant::now();
        let deadline = started + self.config.stop_timeout;
        loop {
            if !matches!(self.states.get(resource_id), SessionState::Running) {
                debug!(
                    resource_id = %resource_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "previous generation stopped"
                );
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }

        let waited_ms = started.elapsed().as_millis() as u64;
        let stale = self.registry.force_clear(resource_id);
        warn!(
            target: "genflight::leak",
            resource_id = %resource_id,
            stream_id = ?stale.as_ref().map(|handle| handle.id()),
            waited_ms,
            "force-cleared wedged generation, engine may still be running"
        );

        Err(CoordinatorError::ShutdownTimeout {
            resource: resource_id.clone(),
            waited_ms,
        })
    }

    async fn refund(&self, owner_id: &OwnerId, amount: u64) {
        if let Err(e) = self.ledger.refund(owner_id, amount).await {
            error!(owner_id = %owner_id, amount, error = %e, "credit refund failed");
        }
    }
}

enum StartOutcome {
    Started(Result<EngineRun, EngineError>),
    Cancelled,
    TimedOut,
}

/// Unwinds a registered handle if `generate` is dropped while the engine starts
///
/// Writes `Stopped` through the handle and refunds the reservation on a
/// spawned task, since `Drop` cannot await.
struct StartGuard {
    handle: Arc<StreamHandle>,
    ledger: Arc<dyn CreditLedger>,
    owner_id: OwnerId,
    cost: u64,
    armed: bool,
}

impl StartGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!(
            resource_id = %self.handle.resource_id(),
            stream_id = %self.handle.id(),
            "generate abandoned before the engine started"
        );
        self.handle.stop();
        self.handle.cancel_start();

        let ledger = Arc::clone(&self.ledger);
        let owner_id = self.owner_id.clone();
        let cost = self.cost;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = ledger.refund(&owner_id, cost).await {
                        error!(owner_id = %owner_id, amount = cost, error = %e, "credit refund failed");
                    }
                });
            }
            Err(_) => {
                error!(owner_id = %owner_id, amount = cost, "no runtime to refund abandoned generation")
            }
        }
    }
}
