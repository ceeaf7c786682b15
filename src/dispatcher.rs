//! Dispatcher / worker pool (§4.5): a circuit-breaker-style worker loop with
//! consecutive-failure counters and a backoff-driven retry path, generalized
//! from "submit a chain transaction" to "invoke the lifecycle engine".

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::lifecycle::{AuthorizeRequest, CancelRequest, CommandOutcome, ConfirmRequest, InitializeRequest, LifecycleEngine};
use crate::metrics::MetricsSink;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        let jitter: f64 = rand::random::<f64>();
        Duration::from_secs_f64(capped + jitter)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// One lifecycle command, already resolved to its concrete request type.
pub enum Command {
    Initialize(InitializeRequest),
    Authorize(AuthorizeRequest),
    Confirm(ConfirmRequest),
    Cancel(CancelRequest),
}

impl Command {
    fn team_slug(&self) -> &str {
        match self {
            Command::Initialize(r) => &r.team_slug,
            Command::Authorize(r) => &r.team_slug,
            Command::Confirm(r) => &r.team_slug,
            Command::Cancel(r) => &r.team_slug,
        }
    }

    fn payment_id(&self) -> Option<&str> {
        match self {
            Command::Initialize(_) => None,
            Command::Authorize(r) => Some(&r.payment_id),
            Command::Confirm(r) => Some(&r.payment_id),
            Command::Cancel(r) => Some(&r.payment_id),
        }
    }
}

pub struct Job {
    command: Command,
    priority: u8,
    reply: oneshot::Sender<GatewayResult<CommandOutcome>>,
    cancel: oneshot::Receiver<()>,
}

/// A handle returned to the caller on enqueue: awaiting it yields the
/// eventual result; dropping or signalling `cancel` requests cooperative
/// cancellation at the next suspension point (§4.5).
pub struct Enqueued {
    pub result: oneshot::Receiver<GatewayResult<CommandOutcome>>,
    pub cancel: oneshot::Sender<()>,
}

pub type RetryMap = Mutex<HashMap<String, (tokio::time::Instant, u32)>>;

/// A queued job ordered by `priority` first, then by arrival order. Used
/// only as the `BinaryHeap` element type inside [`JobQueue`].
struct PrioritizedJob {
    priority: u8,
    seq: u64,
    job: Job,
}

impl PartialEq for PrioritizedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PrioritizedJob {}

impl PartialOrd for PrioritizedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedJob {
    /// Higher `priority` pops first; ties break by earliest `seq` so
    /// same-priority jobs stay FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue backing the dispatcher (§2: "bounded FIFO with
/// priority"). A plain `mpsc` channel can't reorder by priority, so
/// backpressure and wake-up are modeled with a pair of semaphores around a
/// `BinaryHeap`: `space` bounds capacity (acquired by `push`, released by
/// `pop`), `items` signals availability (released by `push`, acquired by
/// `pop`). Both acquires are cancel-safe, so `pop` is usable directly inside
/// `tokio::select!`.
struct JobQueue {
    heap: Mutex<BinaryHeap<PrioritizedJob>>,
    items: Semaphore,
    space: Semaphore,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            items: Semaphore::new(0),
            space: Semaphore::new(capacity),
        }
    }

    /// Blocks when the queue is at capacity (§4.5, "writers block when full").
    async fn push(&self, job: Job, priority: u8, seq: u64) {
        let Ok(permit) = self.space.acquire().await else { return };
        permit.forget();
        self.heap.lock().await.push(PrioritizedJob { priority, seq, job });
        self.items.add_permits(1);
    }

    async fn pop(&self) -> Option<Job> {
        let permit = self.items.acquire().await.ok()?;
        permit.forget();
        let job = self.heap.lock().await.pop().map(|p| p.job);
        self.space.add_permits(1);
        job
    }
}

/// Bounded priority-queue dispatcher with N workers, global + per-tenant
/// fairness, and a retry sweep for transient/conflict failures (§4.5).
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    global: Arc<Semaphore>,
    tenants: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    retry_config: RetryConfig,
    config: DispatcherConfig,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, retry_config: RetryConfig) -> Self {
        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let global = Arc::new(Semaphore::new(config.global_concurrency));
        Self {
            queue,
            global,
            tenants: Arc::new(Mutex::new(HashMap::new())),
            retry_config,
            config,
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue a command at `priority` (higher values are served first among
    /// jobs currently queued); blocks when the bounded queue is full (§4.5,
    /// "writers block when full").
    pub async fn enqueue(&self, command: Command, priority: u8) -> Enqueued {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let job = Job {
            command,
            priority,
            reply: reply_tx,
            cancel: cancel_rx,
        };
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.push(job, priority, seq).await;
        Enqueued {
            result: reply_rx,
            cancel: cancel_tx,
        }
    }

    async fn tenant_semaphore(&self, team_slug: &str) -> Arc<Semaphore> {
        let mut guard = self.tenants.lock().await;
        guard
            .entry(team_slug.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_tenant_concurrency)))
            .clone()
    }

    /// Run `worker_count` workers draining the queue until `shutdown` fires.
    /// A dedicated retry sweep re-enqueues due items every
    /// `retry_sweep_interval` (spawned by the caller alongside this).
    pub async fn run(self: Arc<Self>, engine: Arc<LifecycleEngine>, metrics: Arc<dyn MetricsSink>, mut shutdown: mpsc::Receiver<()>) {
        let retry_map: Arc<RetryMap> = Arc::new(Mutex::new(HashMap::new()));
        info!(workers = self.config.worker_count, "dispatcher starting");

        loop {
            tokio::select! {
                maybe_job = self.queue.pop() => {
                    let Some(job) = maybe_job else { break };
                    let dispatcher = self.clone();
                    let engine = engine.clone();
                    let metrics = metrics.clone();
                    let retry_map = retry_map.clone();
                    tokio::spawn(async move {
                        dispatcher.process(engine, metrics, retry_map, job).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("dispatcher shutting down");
                    return;
                }
            }
        }
    }

    async fn process(&self, engine: Arc<LifecycleEngine>, metrics: Arc<dyn MetricsSink>, retry_map: Arc<RetryMap>, mut job: Job) {
        let team_slug = job.command.team_slug().to_string();
        metrics.set_active_processing(&team_slug, 1.0);

        let Ok(_global_permit) = self.global.acquire().await else {
            let _ = job.reply.send(Err(GatewayError::SystemOverload));
            return;
        };

        let tenant_sem = self.tenant_semaphore(&team_slug).await;
        // §4.5 step 3: allowConcurrentTeamProcessing=true races the tenant
        // permit against a short deadline (TEAM_LIMIT_EXCEEDED on timeout);
        // =false just blocks until a slot frees up, no failure.
        let _tenant_permit = if self.config.allow_concurrent_team_processing {
            match tokio::time::timeout(self.config.team_limit_deadline, tenant_sem.acquire_owned()).await {
                Ok(Ok(p)) => p,
                _ => {
                    let _ = job.reply.send(Err(GatewayError::TeamLimitExceeded));
                    metrics.set_active_processing(&team_slug, 0.0);
                    return;
                }
            }
        } else {
            let Ok(p) = tenant_sem.acquire_owned().await else {
                let _ = job.reply.send(Err(GatewayError::SystemOverload));
                metrics.set_active_processing(&team_slug, 0.0);
                return;
            };
            p
        };

        if job.cancel.try_recv().is_ok() {
            let _ = job.reply.send(Err(GatewayError::Cancelled));
            metrics.set_active_processing(&team_slug, 0.0);
            return;
        }

        let payment_key = job.command.payment_id().map(str::to_string);
        let outcome = run_command(&engine, job.command).await;

        match &outcome {
            Ok(result) => {
                metrics.record_processing(&team_slug, "success", job.priority, 0.0);
                if let Some(key) = &payment_key {
                    retry_map.lock().await.remove(key);
                }
                let _ = job.reply.send(Ok(result.clone()));
            }
            Err(e) if e.is_retryable_by_dispatcher() => {
                if let Some(key) = payment_key {
                    let mut guard = retry_map.lock().await;
                    let attempt = guard.get(&key).map(|(_, a)| a + 1).unwrap_or(1);
                    if attempt as u32 <= self.retry_config.max_retries {
                        let backoff = self.retry_config.backoff_for_attempt(attempt);
                        guard.insert(key, (tokio::time::Instant::now() + backoff, attempt));
                        debug!(attempt, ?backoff, "scheduled retry");
                        // The retry sweep owns re-delivery; this job's
                        // original caller gets the immediate failure so it
                        // isn't left hanging indefinitely.
                    } else {
                        guard.remove(&key);
                        warn!(attempts = attempt, "max retries exhausted");
                    }
                }
                metrics.record_processing(&team_slug, "retryable_failure", job.priority, 0.0);
                let _ = job.reply.send(outcome);
            }
            Err(_) => {
                metrics.record_processing(&team_slug, "failure", job.priority, 0.0);
                let _ = job.reply.send(outcome);
            }
        }
        metrics.set_active_processing(&team_slug, 0.0);
    }
}

async fn run_command(engine: &LifecycleEngine, command: Command) -> GatewayResult<CommandOutcome> {
    match command {
        Command::Initialize(req) => engine.initialize(req).await,
        Command::Authorize(req) => engine.authorize(req).await,
        Command::Confirm(req) => engine.confirm(req).await,
        Command::Cancel(req) => engine.cancel(req).await,
    }
}

/// Periodic sweep re-evaluating the retry map; due items are logged for
/// re-enqueue by the caller, which owns the original request payloads this
/// module intentionally does not retain (§4.5 step 5).
pub async fn retry_sweep_due(retry_map: &RetryMap) -> Vec<String> {
    let now = tokio::time::Instant::now();
    let guard = retry_map.lock().await;
    guard
        .iter()
        .filter(|(_, (next_at, _))| *next_at <= now)
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        };
        assert!(config.backoff_for_attempt(0) < config.backoff_for_attempt(3));
        assert!(config.backoff_for_attempt(10) <= Duration::from_secs(3));
    }

    #[test]
    fn should_retry_respects_max() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(!config.should_retry(config.max_retries));
    }

    #[tokio::test]
    async fn queue_pops_higher_priority_first() {
        let queue = JobQueue::new(10);
        for (priority, seq) in [(1u8, 0u64), (5, 1), (3, 2)] {
            let (reply_tx, _reply_rx) = oneshot::channel();
            let (_cancel_tx, cancel_rx) = oneshot::channel();
            let job = Job {
                command: Command::Initialize(InitializeRequest {
                    team_slug: "acme".to_string(),
                    team_id: "team-acme".to_string(),
                    order_id: format!("o-{seq}"),
                    amount: 100,
                    currency: "USD".to_string(),
                    metadata: serde_json::Value::Null,
                    external_request_id: None,
                }),
                priority,
                reply: reply_tx,
                cancel: cancel_rx,
            };
            queue.push(job, priority, seq).await;
        }

        let first = queue.pop().await.unwrap();
        assert_eq!(first.priority, 5);
        let second = queue.pop().await.unwrap();
        assert_eq!(second.priority, 3);
        let third = queue.pop().await.unwrap();
        assert_eq!(third.priority, 1);
    }

    #[tokio::test]
    async fn queue_is_fifo_within_same_priority() {
        let queue = JobQueue::new(10);
        for seq in 0u64..3 {
            let (reply_tx, _reply_rx) = oneshot::channel();
            let (_cancel_tx, cancel_rx) = oneshot::channel();
            let job = Job {
                command: Command::Initialize(InitializeRequest {
                    team_slug: "acme".to_string(),
                    team_id: "team-acme".to_string(),
                    order_id: format!("o-{seq}"),
                    amount: 100,
                    currency: "USD".to_string(),
                    metadata: serde_json::Value::Null,
                    external_request_id: None,
                }),
                priority: 5,
                reply: reply_tx,
                cancel: cancel_rx,
            };
            queue.push(job, 5, seq).await;
        }

        for expected_seq in 0u64..3 {
            let job = queue.pop().await.unwrap();
            let Command::Initialize(req) = &job.command else { unreachable!() };
            assert_eq!(req.order_id, format!("o-{expected_seq}"));
        }
    }
}
