//! Warmup Scheduler
//!
//! Populates the memory tier ahead of demand. Callers submit a list of keys
//! and a loader; a single background worker drains the queue highest
//! priority first and stores each loaded value through the manager's public
//! `set`. The worker yields between keys so foreground traffic is not starved,
//! and checks for shutdown before every key.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::entry::{CacheStrategy, Priority};
use super::manager::CacheManager;
use crate::error::{Error, Result};

/// Caller-supplied value loader
pub type Loader = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

/// Wrap an async closure as a [`Loader`]
pub fn loader_fn<F, Fut>(f: F) -> Loader
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    Arc::new(move |key: String| f(key).boxed())
}

// =============================================================================
// Configuration
// =============================================================================

/// Warmup configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// TTL applied to warmed entries (0 = never expires)
    pub ttl_ms: u64,
    /// Per-key loader deadline
    pub loader_timeout_ms: Option<u64>,
    /// Maximum queued tasks before `warmup` is rejected
    pub queue_capacity: usize,
    /// Compress warmed entries
    pub compression: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            loader_timeout_ms: Some(5_000),
            queue_capacity: 1000,
            compression: false,
        }
    }
}

impl WarmupConfig {
    /// Strategy used for every warmed entry
    pub fn strategy(&self) -> CacheStrategy {
        let strategy = CacheStrategy::memory().with_ttl(Duration::from_millis(self.ttl_ms));
        if self.compression {
            strategy.compressed()
        } else {
            strategy
        }
    }
}

// =============================================================================
// Tasks and Reports
// =============================================================================

/// Per-task outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub id: Uuid,
    /// Keys loaded and stored
    pub loaded: Vec<String>,
    /// Keys whose loader or store failed, with the reason
    pub failed: BTreeMap<String, String>,
    /// Keys already resident in memory
    pub skipped: Vec<String>,
    /// Shutdown interrupted the task; remaining keys were not touched
    pub cancelled: bool,
}

pub(crate) struct WarmupTask {
    id: Uuid,
    seq: u64,
    keys: Vec<String>,
    loader: Loader,
    priority: Priority,
    reply: oneshot::Sender<WarmupReport>,
}

// Max-heap order: higher priority first, then submission order
impl Ord for WarmupTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for WarmupTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WarmupTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for WarmupTask {}

/// Handle to a submitted warmup task
#[derive(Debug)]
pub struct WarmupTicket {
    id: Uuid,
    report: oneshot::Receiver<WarmupReport>,
}

impl WarmupTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task to finish
    pub async fn wait(self) -> Result<WarmupReport> {
        self.report.await.map_err(|_| Error::ShutDown)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Bounded warmup queue plus its worker
pub struct WarmupScheduler {
    sender: mpsc::Sender<WarmupTask>,
    receiver: Mutex<Option<mpsc::Receiver<WarmupTask>>>,
    next_seq: std::sync::atomic::AtomicU64,
    shutdown: CancellationToken,
}

impl WarmupScheduler {
    pub fn new(config: &WarmupConfig, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            next_seq: std::sync::atomic::AtomicU64::new(0),
            shutdown,
        }
    }

    /// Queue a task without waiting
    pub fn submit(&self, keys: Vec<String>, loader: Loader, priority: Priority) -> Result<WarmupTicket> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        let id = Uuid::new_v4();
        let (reply, report) = oneshot::channel();
        let task = WarmupTask {
            id,
            seq: self
                .next_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            keys,
            loader,
            priority,
            reply,
        };

        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::WarmupQueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ShutDown,
        })?;
        debug!(task = %id, ?priority, "Queued warmup task");
        Ok(WarmupTicket { id, report })
    }

    /// Take the receiving half; only the first caller gets it
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<WarmupTask>> {
        self.receiver.lock().take()
    }

    /// Worker loop: runs until shutdown or until the manager is dropped
    #[instrument(skip_all)]
    pub(crate) async fn run(
        mut receiver: mpsc::Receiver<WarmupTask>,
        manager: Weak<CacheManager>,
        config: WarmupConfig,
        shutdown: CancellationToken,
    ) {
        info!("Starting warmup worker");
        let mut pending: BinaryHeap<WarmupTask> = BinaryHeap::new();

        loop {
            if pending.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    task = receiver.recv() => match task {
                        Some(task) => pending.push(task),
                        None => break,
                    },
                }
            }
            // Pull in anything else already queued so priority ordering applies
            while let Ok(task) = receiver.try_recv() {
                pending.push(task);
            }

            let Some(task) = pending.pop() else {
                continue;
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let report = process(&manager, &config, &shutdown, &task).await;
            manager
                .stats_collector()
                .record_warmup(report.loaded.len() as u64, report.failed.len() as u64);
            drop(manager);

            info!(
                task = %report.id,
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                cancelled = report.cancelled,
                "Warmup task finished"
            );
            let _ = task.reply.send(report);
        }

        // Anything left is abandoned without touching the cache
        receiver.close();
        while let Ok(task) = receiver.try_recv() {
            pending.push(task);
        }
        for task in pending.drain() {
            let report = WarmupReport {
                id: task.id,
                cancelled: true,
                ..WarmupReport::default()
            };
            let _ = task.reply.send(report);
        }
        info!("Warmup worker stopped");
    }
}

async fn process(
    manager: &CacheManager,
    config: &WarmupConfig,
    shutdown: &CancellationToken,
    task: &WarmupTask,
) -> WarmupReport {
    let mut report = WarmupReport {
        id: task.id,
        ..WarmupReport::default()
    };
    let strategy = config.strategy();
    let timeout = config.loader_timeout_ms.map(Duration::from_millis);

    for key in &task.keys {
        if shutdown.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if manager.is_resident(key) {
            report.skipped.push(key.clone());
            continue;
        }

        let load = (task.loader)(key.clone());
        let loaded = tokio::select! {
            _ = shutdown.cancelled() => {
                report.cancelled = true;
                break;
            }
            result = load_with_timeout(load, timeout) => result,
        };

        match loaded {
            Ok(value) => match manager.set(key, &value, strategy.clone()).await {
                Ok(()) => report.loaded.push(key.clone()),
                Err(e) => {
                    warn!(key = %key, error = %e, "Warmup store failed");
                    report.failed.insert(key.clone(), e.to_string());
                }
            },
            Err(e) => {
                let err = Error::LoaderFailure {
                    key: key.clone(),
                    reason: format!("{:#}", e),
                };
                warn!(error = %err, "Warmup loader failed");
                report.failed.insert(key.clone(), err.to_string());
            }
        }

        tokio::task::yield_now().await;
    }
    report
}

async fn load_with_timeout(
    load: BoxFuture<'static, anyhow::Result<Bytes>>,
    timeout: Option<Duration>,
) -> anyhow::Result<Bytes> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, load)
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis()))),
        None => load.await,
    }
}

// =============================================================================
// Tests
// =============================================================================
