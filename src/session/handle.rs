//! Stream handle: one generation attempt end to end

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::StreamRegistry;
use super::state::SessionState;
use crate::engine::{EngineEvent, EngineRun, GenerationEngine};
use crate::types::{OwnerId, ResourceId, StreamId};

/// Callback run when the transport reports a disconnect
pub type AbortCallback = Box<dyn FnOnce() + Send + 'static>;

/// Per-handle options
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Stop the generation after this long without output or a keepalive touch
    pub keepalive_timeout: Option<Duration>,
    /// Response chunks buffered ahead of the reader
    pub stream_buffer: usize,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            keepalive_timeout: None,
            stream_buffer: 64,
        }
    }
}

#[derive(Default)]
struct AbortState {
    fired: bool,
    callbacks: Vec<AbortCallback>,
}

/// Handle to one in-flight generation
///
/// The only state mutation a handle performs is its own terminal write,
/// which happens exactly once and also removes it from the registry.
pub struct StreamHandle {
    id: StreamId,
    resource_id: ResourceId,
    owner_id: OwnerId,
    registry: Arc<dyn StreamRegistry>,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
    finalized: AtomicBool,
    abort: Mutex<AbortState>,
    keepalive_timeout: Option<Duration>,
    last_activity: Mutex<Instant>,
    output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl StreamHandle {
    pub fn new(
        resource_id: ResourceId,
        owner_id: OwnerId,
        registry: Arc<dyn StreamRegistry>,
        options: HandleOptions,
    ) -> Arc<Self> {
        let (output_tx, output_rx) = mpsc::channel(options.stream_buffer.max(1));

        Arc::new(Self {
            id: StreamId::new(),
            resource_id,
            owner_id,
            registry,
            cancel: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            abort: Mutex::new(AbortState::default()),
            keepalive_timeout: options.keepalive_timeout,
            last_activity: Mutex::new(Instant::now()),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether the terminal state has been written
    pub fn is_finished(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Token handed to the engine; cancelled by `stop()`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Take the response stream; only the first caller gets it
    pub fn as_response_stream(self: &Arc<Self>) -> Option<ResponseStream> {
        let receiver = self.output_rx.lock().take()?;
        Some(ResponseStream {
            stream_id: self.id,
            receiver,
            handle: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Request cooperative cancellation
    ///
    /// Idempotent. The `Stopped` write happens once the engine closes its
    /// event channel.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!(resource_id = %self.resource_id, stream_id = %self.id, "stop already requested");
            return;
        }
        if self.is_finished() {
            return;
        }
        info!(resource_id = %self.resource_id, stream_id = %self.id, "stop requested");
        self.cancel.cancel();
    }

    /// Register a callback for transport disconnects
    ///
    /// Runs immediately if the disconnect was already reported.
    pub fn register_abort_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut abort = self.abort.lock();
        if abort.fired {
            drop(abort);
            callback();
            return;
        }
        abort.callbacks.push(Box::new(callback));
    }

    /// Report a transport disconnect; runs the abort callbacks once
    pub fn notify_abort(&self) {
        let callbacks = {
            let mut abort = self.abort.lock();
            if abort.fired {
                return;
            }
            abort.fired = true;
            std::mem::take(&mut abort.callbacks)
        };

        debug!(resource_id = %self.resource_id, stream_id = %self.id, "client disconnected");
        for callback in callbacks {
            callback();
        }
    }

    /// Reset the inactivity watchdog
    pub fn touch_keep_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Start relaying the engine's output; the handle now owns the run
    pub fn attach(self: &Arc<Self>, run: EngineRun, engine: Arc<dyn GenerationEngine>) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            handle.drive(run, engine).await;
        });
    }

    /// Terminal write for an engine that never started
    pub(crate) fn fail_start(&self, reason: String) {
        self.finalize(SessionState::Error(reason));
    }

    /// Terminal write for a handle stopped before its engine started
    pub(crate) fn cancel_start(&self) {
        self.finalize(SessionState::Stopped);
    }

    async fn drive(self: Arc<Self>, run: EngineRun, engine: Arc<dyn GenerationEngine>) {
        let mut events = run.into_events();
        let output = self.output_tx.lock().take();
        let Some(output) = output else {
            warn!(stream_id = %self.id, "stream handle attached twice");
            return;
        };

        self.touch_keep_alive();

        let terminal = loop {
            let idle_deadline = self.idle_deadline();

            tokio::select! {
                event = events.recv() => match event {
                    Some(EngineEvent::Chunk(bytes)) => {
                        self.touch_keep_alive();
                        // Chunks produced after a stop request are dropped rather
                        // than blocking on a reader that may be gone.
                        tokio::select! {
                            sent = output.send(bytes) => {
                                if sent.is_err() {
                                    self.notify_abort();
                                }
                            }
                            _ = self.cancel.cancelled() => {}
                        }
                    }
                    Some(EngineEvent::Failed(reason)) => {
                        warn!(
                            resource_id = %self.resource_id,
                            stream_id = %self.id,
                            engine = engine.name(),
                            reason = %reason,
                            "generation failed mid-stream"
                        );
                        tokio::select! {
                            _ = output.send(engine.encode_error(&reason)) => {}
                            _ = self.cancel.cancelled() => {}
                        }
                        break SessionState::Error(reason);
                    }
                    None => break SessionState::Stopped,
                },
                _ = wait_until(idle_deadline) => {
                    if self.idle_deadline().map_or(false, |deadline| deadline <= Instant::now()) {
                        warn!(
                            resource_id = %self.resource_id,
                            stream_id = %self.id,
                            "keepalive expired, stopping generation"
                        );
                        self.stop();
                    }
                }
            }
        };

        drop(output);
        self.finalize(terminal);
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.is_stop_requested() {
            return None;
        }
        let timeout = self.keepalive_timeout?;
        Some(*self.last_activity.lock() + timeout)
    }

    fn finalize(&self, terminal: SessionState) -> bool {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.output_tx.lock().take();

        let state = terminal.as_str();
        if self.registry.remove(&self.resource_id, self.id, terminal) {
            info!(
                resource_id = %self.resource_id,
                stream_id = %self.id,
                state,
                "generation finished"
            );
        } else {
            warn!(
                resource_id = %self.resource_id,
                stream_id = %self.id,
                state,
                "handle no longer owns resource, terminal state dropped"
            );
        }
        true
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("resource_id", &self.resource_id)
            .field("owner_id", &self.owner_id)
            .field("stop_requested", &self.is_stop_requested())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Single-reader stream of response chunks
///
/// Dropping it before the generation finished counts as a client disconnect.
pub struct ResponseStream {
    stream_id: StreamId,
    receiver: mpsc::Receiver<Vec<u8>>,
    handle: Weak<StreamHandle>,
    finished: bool,
}

impl ResponseStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl Stream for ResponseStream {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.receiver.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            this.finished = true;
        }
        polled
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(handle) = self.handle.upgrade() {
            handle.notify_abort();
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish()
    }
}
