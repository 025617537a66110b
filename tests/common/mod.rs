// Shared fakes for coordinator and server tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use genflight::engine::{EngineError, EngineEvent, EngineRun, GenerationEngine, GenerationRequest};
use genflight::ledger::{CreditLedger, InMemoryCreditLedger, LedgerError};
use genflight::session::{
    CoordinatorConfig, GenerationCoordinator, InMemoryStreamRegistry, SessionState,
    SessionStateStore, StreamHandle, StreamRegistry,
};
use genflight::types::{OwnerId, ResourceId, StreamId};

pub const OWNER: &str = "owner-1";

/// How the scripted engine behaves on start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Streams the message words and honours cancellation
    Cooperative,
    /// Produces nothing and closes only when cancelled
    Silent,
    /// Ignores cancellation and never closes its channel
    Wedged,
    /// Fails inside `start`
    FailStart,
    /// Emits one chunk, then fails
    FailMidStream,
    /// Takes an hour to start and ignores cancellation while starting
    HangOnStart,
}

pub struct ScriptedEngine {
    mode: Mutex<Mode>,
    repeat: usize,
    chunk_delay: Duration,
    starts: AtomicUsize,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    wedged: Mutex<Vec<mpsc::Sender<EngineEvent>>>,
}

impl ScriptedEngine {
    pub fn new(mode: Mode) -> Self {
        Self::with_timing(mode, 1, Duration::from_millis(5))
    }

    pub fn with_timing(mode: Mode, repeat: usize, chunk_delay: Duration) -> Self {
        Self {
            mode: Mutex::new(mode),
            repeat,
            chunk_delay,
            starts: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            wedged: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Highest number of engine runs alive at the same time
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineRun, EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();

        if mode == Mode::FailStart {
            return Err(EngineError::Start("model unavailable".to_string()));
        }
        if mode == Mode::HangOnStart {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let (tx, run) = EngineRun::channel(8);
        self.enter();
        let active = Arc::clone(&self.active);

        match mode {
            Mode::Cooperative => {
                let words: Vec<String> = request
                    .message
                    .split_inclusive(' ')
                    .map(str::to_string)
                    .collect();
                let delay = self.chunk_delay;
                let repeat = self.repeat;
                tokio::spawn(async move {
                    'outer: for _ in 0..repeat {
                        for word in &words {
                            tokio::select! {
                                _ = cancel.cancelled() => break 'outer,
                                _ = tokio::time::sleep(delay) => {
                                    if tx.send(EngineEvent::Chunk(word.clone().into_bytes())).await.is_err() {
                                        break 'outer;
                                    }
                                }
                            }
                        }
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(tx);
                });
            }
            Mode::Silent | Mode::HangOnStart => {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(tx);
                });
            }
            Mode::Wedged => {
                self.wedged.lock().push(tx);
            }
            Mode::FailMidStream => {
                tokio::spawn(async move {
                    let _ = tx.send(EngineEvent::Chunk(b"partial ".to_vec())).await;
                    let _ = tx.send(EngineEvent::Failed("model crashed".to_string())).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(tx);
                });
            }
            Mode::FailStart => unreachable!(),
        }

        Ok(run)
    }
}

/// Ledger that records every call
pub struct RecordingLedger {
    inner: InMemoryCreditLedger,
    reserves: Mutex<Vec<(OwnerId, u64)>>,
    refunds: Mutex<Vec<(OwnerId, u64)>>,
}

impl RecordingLedger {
    pub fn new(balance: u64) -> Self {
        Self {
            inner: InMemoryCreditLedger::new(0).with_balance(OWNER, balance),
            reserves: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }

    pub fn balance(&self) -> u64 {
        self.inner.balance(&OwnerId::new(OWNER))
    }

    /// Successful reservations
    pub fn reserves(&self) -> Vec<(OwnerId, u64)> {
        self.reserves.lock().clone()
    }

    pub fn refunds(&self) -> Vec<(OwnerId, u64)> {
        self.refunds.lock().clone()
    }

    /// Wait for a refund issued from a spawned task
    pub async fn wait_for_refunds(&self, expected: usize) {
        for _ in 0..100 {
            if self.refunds.lock().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} refunds, saw {}", expected, self.refunds.lock().len());
    }
}

#[async_trait]
impl CreditLedger for RecordingLedger {
    async fn try_reserve(&self, owner: &OwnerId, amount: u64) -> Result<bool, LedgerError> {
        let reserved = self.inner.try_reserve(owner, amount).await?;
        if reserved {
            self.reserves.lock().push((owner.clone(), amount));
        }
        Ok(reserved)
    }

    async fn refund(&self, owner: &OwnerId, amount: u64) -> Result<(), LedgerError> {
        self.refunds.lock().push((owner.clone(), amount));
        self.inner.refund(owner, amount).await
    }
}

/// Registry wrapper counting terminal removals
pub struct CountingRegistry {
    inner: InMemoryStreamRegistry,
    removals: AtomicUsize,
}

impl CountingRegistry {
    pub fn new(states: Arc<SessionStateStore>) -> Self {
        Self {
            inner: InMemoryStreamRegistry::new(states),
            removals: AtomicUsize::new(0),
        }
    }

    /// Terminal writes that were applied
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

impl StreamRegistry for CountingRegistry {
    fn try_register(&self, handle: Arc<StreamHandle>) -> bool {
        self.inner.try_register(handle)
    }

    fn lookup(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>> {
        self.inner.lookup(resource_id)
    }

    fn remove(&self, resource_id: &ResourceId, stream_id: StreamId, terminal: SessionState) -> bool {
        let removed = self.inner.remove(resource_id, stream_id, terminal);
        if removed {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn force_clear(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>> {
        self.inner.force_clear(resource_id)
    }

    fn active_count(&self) -> usize {
        self.inner.active_count()
    }
}

pub struct Harness {
    pub coordinator: Arc<GenerationCoordinator>,
    pub engine: Arc<ScriptedEngine>,
    pub ledger: Arc<RecordingLedger>,
    pub registry: Arc<CountingRegistry>,
    pub states: Arc<SessionStateStore>,
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        generation_cost: 10,
        keepalive_timeout: None,
        ..CoordinatorConfig::default()
    }
}

pub fn harness(engine: ScriptedEngine, balance: u64) -> Harness {
    harness_with_config(engine, balance, test_config())
}

pub fn harness_with_config(engine: ScriptedEngine, balance: u64, config: CoordinatorConfig) -> Harness {
    let states = Arc::new(SessionStateStore::new());
    let registry = Arc::new(CountingRegistry::new(Arc::clone(&states)));
    let ledger = Arc::new(RecordingLedger::new(balance));
    let engine = Arc::new(engine);

    let coordinator = Arc::new(GenerationCoordinator::new(
        config,
        Arc::clone(&registry) as Arc<dyn StreamRegistry>,
        Arc::clone(&states),
        Arc::clone(&ledger) as Arc<dyn CreditLedger>,
        Arc::clone(&engine) as Arc<dyn GenerationEngine>,
    ));

    Harness {
        coordinator,
        engine,
        ledger,
        registry,
        states,
    }
}

/// Poll until the resource reaches `expected`, failing after five seconds
pub async fn wait_for_state(states: &SessionStateStore, resource_id: &ResourceId, expected: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = states.get(resource_id);
        if current == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "resource {} stuck in {:?}, expected {:?}",
            resource_id,
            current,
            expected
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
