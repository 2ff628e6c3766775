use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use sync_types::backoff::Backoff;
use tokio::{
    sync::mpsc::{
        unbounded_channel,
        UnboundedReceiver,
        UnboundedSender,
    },
    task::JoinHandle,
};

use crate::{
    metrics,
    AuditJob,
    AuditLogSink,
    SinkError,
};

#[derive(Clone, Debug)]
pub struct AuditQueueConfig {
    /// Concurrent persist transactions.
    pub worker_count: usize,
    /// Attempts per job, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per failure.
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// How many completed jobs stay inspectable, and for how long.
    pub completed_retention: usize,
    pub completed_retention_window: Duration,
}

impl Default for AuditQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            max_attempts: 5,
            retry_initial_backoff: Duration::from_secs(2),
            retry_max_backoff: Duration::from_secs(60),
            completed_retention: 100,
            completed_retention_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct QueueStats {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    dead: AtomicUsize,
}

/// Point-in-time view of the queue, for readiness checks and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub dead: usize,
}

/// A job that exhausted its retry budget. Retained until explicitly purged
/// so operators can replay or inspect it.
#[derive(Clone, Debug)]
pub struct DeadJob {
    pub job: AuditJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct CompletedJob {
    finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct Retention {
    completed: Mutex<VecDeque<CompletedJob>>,
    dead: Mutex<Vec<DeadJob>>,
}

/// Fire-and-forget audit queue: a pool of tokio workers fed by per-worker
/// unbounded channels (round-robin dispatch). `enqueue` costs one channel
/// send; the caller never awaits the downstream transaction, so a slow or
/// down audit log cannot stretch hot-path latency.
pub struct AuditQueue {
    senders: Mutex<Option<Vec<UnboundedSender<AuditJob>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
    stats: Arc<QueueStats>,
    retention: Arc<Retention>,
    config: AuditQueueConfig,
}

impl AuditQueue {
    pub fn new(sink: Arc<dyn AuditLogSink>, config: AuditQueueConfig) -> Self {
        let stats = Arc::new(QueueStats::default());
        let retention = Arc::new(Retention::default());
        let mut senders = Vec::with_capacity(config.worker_count);
        let mut handles = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count.max(1) {
            let (tx, rx) = unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(worker(
                sink.clone(),
                rx,
                stats.clone(),
                retention.clone(),
                config.clone(),
            )));
        }
        Self {
            senders: Mutex::new(Some(senders)),
            handles: Mutex::new(handles),
            next_worker: AtomicUsize::new(0),
            stats,
            retention,
            config,
        }
    }

    /// Accepts the job and returns immediately. Jobs enqueued after
    /// [`AuditQueue::close`] are dropped with a warning; that only happens
    /// during shutdown, where losing history is acceptable by design.
    pub fn enqueue(&self, job: AuditJob) {
        let senders = self.senders.lock();
        let Some(senders) = senders.as_ref() else {
            tracing::warn!(
                session_id = %job.session_id,
                event_type = job.event_type.as_str(),
                "audit queue closed; dropping job"
            );
            return;
        };
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % senders.len();
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        metrics::log_enqueued(job.event_type.as_str());
        if senders[index].send(job).is_err() {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("audit worker {index} is gone; dropping job");
        }
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pending: self.stats.pending.load(Ordering::Relaxed),
            running: self.stats.running.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            dead: self.stats.dead.load(Ordering::Relaxed),
        }
    }

    /// Jobs that exhausted all attempts, oldest first.
    pub fn dead_jobs(&self) -> Vec<DeadJob> {
        self.retention.dead.lock().clone()
    }

    pub fn purge_dead_jobs(&self) {
        self.retention.dead.lock().clear();
    }

    /// How many completed jobs are inside the retention window right now.
    pub fn retained_completed(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.completed_retention_window)
                .unwrap_or(chrono::Duration::zero());
        self.retention
            .completed
            .lock()
            .iter()
            .filter(|c| c.finished_at >= cutoff)
            .count()
    }

    /// Stops intake and waits for the workers to drain what they already
    /// accepted.
    pub async fn close(&self) {
        // Dropping the senders closes the channels; workers exit after
        // draining.
        self.senders.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("audit worker terminated abnormally: {e}");
            }
        }
    }
}

async fn worker(
    sink: Arc<dyn AuditLogSink>,
    mut rx: UnboundedReceiver<AuditJob>,
    stats: Arc<QueueStats>,
    retention: Arc<Retention>,
    config: AuditQueueConfig,
) {
    while let Some(job) = rx.recv().await {
        stats.pending.fetch_sub(1, Ordering::Relaxed);
        stats.running.fetch_add(1, Ordering::Relaxed);
        let outcome = persist_with_retry(sink.as_ref(), &job, &config).await;
        stats.running.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                metrics::log_completed(job.event_type.as_str());
                record_completed(&retention, &config);
            },
            Err(error) => {
                stats.dead.fetch_add(1, Ordering::Relaxed);
                metrics::log_dead();
                // Operator alert path: full payload at error severity, plus
                // indefinite retention for replay.
                let payload = serde_json::to_string(&job)
                    .unwrap_or_else(|e| format!("<unserializable audit job: {e}>"));
                tracing::error!(
                    session_id = %job.session_id,
                    event_type = job.event_type.as_str(),
                    %error,
                    payload = %payload,
                    "audit job failed after {} attempts",
                    config.max_attempts,
                );
                retention.dead.lock().push(DeadJob {
                    job,
                    error,
                    failed_at: Utc::now(),
                });
            },
        }
    }
}

async fn persist_with_retry(
    sink: &dyn AuditLogSink,
    job: &AuditJob,
    config: &AuditQueueConfig,
) -> Result<(), String> {
    let mut backoff = Backoff::new(config.retry_initial_backoff, config.retry_max_backoff);
    for attempt in 1..=config.max_attempts {
        match sink.persist(job).await {
            Ok(()) => return Ok(()),
            Err(SinkError::Permanent(e)) => {
                // Re-running the same transaction can never succeed; count
                // the job as complete so it is not re-enqueued.
                tracing::warn!(
                    session_id = %job.session_id,
                    event_type = job.event_type.as_str(),
                    "permanent audit failure, not retrying: {e:#}"
                );
                metrics::log_permanent_failure();
                return Ok(());
            },
            Err(SinkError::Transient(e)) if attempt < config.max_attempts => {
                let delay = backoff.fail(&mut rand::rng());
                tracing::warn!(
                    session_id = %job.session_id,
                    attempt,
                    "transient audit failure, retrying in {delay:?}: {e:#}"
                );
                tokio::time::sleep(delay).await;
            },
            Err(SinkError::Transient(e)) => return Err(format!("{e:#}")),
        }
    }
    // The loop always returns; max_attempts >= 1 is enforced by config.
    Err("no attempts configured".to_owned())
}

fn record_completed(retention: &Retention, config: &AuditQueueConfig) {
    let mut completed = retention.completed.lock();
    completed.push_back(CompletedJob {
        finished_at: Utc::now(),
    });
    let cutoff = Utc::now()
        - chrono::Duration::from_std(config.completed_retention_window)
            .unwrap_or(chrono::Duration::zero());
    while completed.len() > config.completed_retention
        || completed.front().is_some_and(|c| c.finished_at < cutoff)
    {
        completed.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        AuditEventType,
        MemoryAuditLog,
    };

    fn test_config() -> AuditQueueConfig {
        AuditQueueConfig {
            worker_count: 4,
            max_attempts: 5,
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(5),
            ..AuditQueueConfig::default()
        }
    }

    fn job(event_type: AuditEventType) -> AuditJob {
        AuditJob::new(sync_types::SessionId::generate(), event_type, None)
    }

    async fn wait_until(queue: &AuditQueue, f: impl Fn(QueueStatsSnapshot) -> bool) {
        for _ in 0..500 {
            if f(queue.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("queue never reached expected state: {:?}", queue.stats());
    }

    #[tokio::test]
    async fn jobs_flow_to_the_sink() {
        let sink = Arc::new(MemoryAuditLog::new());
        let queue = AuditQueue::new(sink.clone(), test_config());
        for _ in 0..20 {
            queue.enqueue(job(AuditEventType::SessionUpdated));
        }
        wait_until(&queue, |s| s.completed == 20).await;
        assert_eq!(sink.events().len(), 20);
        assert_eq!(queue.stats().dead, 0);
        queue.close().await;
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let sink = Arc::new(MemoryAuditLog::new());
        sink.fail_next_transient(3);
        let queue = AuditQueue::new(sink.clone(), test_config());
        queue.enqueue(job(AuditEventType::SessionStarted));
        wait_until(&queue, |s| s.completed == 1).await;
        // 3 failures + 1 success.
        assert_eq!(sink.persist_calls(), 4);
        assert_eq!(sink.events().len(), 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn permanent_failures_complete_without_retry() {
        let sink = Arc::new(MemoryAuditLog::new());
        sink.fail_next_permanent(1);
        let queue = AuditQueue::new(sink.clone(), test_config());
        queue.enqueue(job(AuditEventType::SessionCreated));
        wait_until(&queue, |s| s.completed == 1).await;
        // One attempt only; nothing landed, nothing dead.
        assert_eq!(sink.persist_calls(), 1);
        assert_eq!(sink.events().len(), 0);
        assert_eq!(queue.stats().dead, 0);
        queue.close().await;
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_dead_jobs() {
        let sink = Arc::new(MemoryAuditLog::new());
        sink.fail_next_transient(u32::MAX);
        let queue = AuditQueue::new(sink.clone(), test_config());
        let enqueued = job(AuditEventType::CycleSwitched);
        let session_id = enqueued.session_id;
        queue.enqueue(enqueued);
        wait_until(&queue, |s| s.dead == 1).await;
        assert_eq!(sink.persist_calls(), 5);
        let dead = queue.dead_jobs();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.session_id, session_id);
        queue.purge_dead_jobs();
        assert!(queue.dead_jobs().is_empty());
        queue.close().await;
    }

    #[tokio::test]
    async fn close_drains_accepted_jobs() {
        let sink = Arc::new(MemoryAuditLog::new());
        let queue = AuditQueue::new(sink.clone(), test_config());
        for _ in 0..50 {
            queue.enqueue(job(AuditEventType::SessionUpdated));
        }
        queue.close().await;
        assert_eq!(sink.events().len(), 50);
        // Enqueue after close drops quietly.
        queue.enqueue(job(AuditEventType::SessionUpdated));
        assert_eq!(sink.events().len(), 50);
    }

    #[tokio::test]
    async fn completed_retention_is_bounded() {
        let sink = Arc::new(MemoryAuditLog::new());
        let mut config = test_config();
        config.completed_retention = 10;
        let queue = AuditQueue::new(sink, config);
        for _ in 0..30 {
            queue.enqueue(job(AuditEventType::SessionUpdated));
        }
        wait_until(&queue, |s| s.completed == 30).await;
        assert!(queue.retained_completed() <= 10);
        queue.close().await;
    }
}
