//! Mail forwarder worker pool
//!
//! Accepted messages are queued as [`ForwardJob`]s and drained by a fixed
//! pool of workers. A job that fails with a transient error goes back to the
//! tail of the queue and the worker backs off before trying again, so
//! delivery is at-least-once. Workers keep going until shutdown has been
//! requested and the queue is empty; [`MailForwarder::shutdown`] bounds that
//! drain.

use super::Relay;
use crate::envelope::Envelope;
use lisb_common::config::ForwardingConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One message awaiting delivery
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub message: Vec<u8>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl ForwardJob {
    pub fn new(from: impl Into<String>, to: Vec<String>, message: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7(),
            from: from.into(),
            to,
            message,
            attempts: 0,
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self::new(
            envelope.mail_from(),
            envelope.rcpt_tos().to_vec(),
            envelope.raw().to_vec(),
        )
    }
}

/// Forwarder tuning
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub workers: usize,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl From<&ForwardingConfig> for ForwarderSettings {
    fn from(config: &ForwardingConfig) -> Self {
        Self {
            workers: config.worker_count(),
            retry_backoff: config.retry_backoff(),
            poll_interval: config.poll_interval(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// Unbounded multi-consumer queue.
///
/// `pending` counts every job not yet settled, whether queued or in the hands
/// of a worker.
struct JobQueue {
    sender: mpsc::UnboundedSender<ForwardJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<ForwardJob>>,
    pending: AtomicUsize,
}

impl JobQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
        }
    }

    fn push(&self, job: ForwardJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.requeue(job);
    }

    /// Put an unsettled job back at the tail
    fn requeue(&self, job: ForwardJob) {
        // The receiver lives as long as the queue, so this only fails on teardown
        if let Err(e) = self.sender.send(job) {
            error!("Lost {}: forward queue closed", e.0.id);
            self.settle();
        }
    }

    /// Next job, or `None` if none arrived within `wait`
    async fn pop(&self, wait: Duration) -> Option<ForwardJob> {
        tokio::time::timeout(wait, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Mark a popped job as delivered or dropped
    fn settle(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Producer handle on the forward queue
#[derive(Clone)]
pub struct ForwardQueue {
    inner: Arc<JobQueue>,
}

impl ForwardQueue {
    /// Queue a job for delivery
    pub fn enqueue(&self, job: ForwardJob) {
        debug!("Queued {} for {:?}", job.id, job.to);
        self.inner.push(job);
    }

    /// Jobs not yet delivered
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker pool draining the forward queue
pub struct MailForwarder {
    queue: ForwardQueue,
    workers: JoinSet<()>,
    token: CancellationToken,
    drain_timeout: Duration,
}

impl MailForwarder {
    /// Spawn the workers.
    ///
    /// Cancelling `token` starts the drain; see [`MailForwarder::shutdown`].
    pub fn start(
        relay: Arc<dyn Relay>,
        settings: ForwarderSettings,
        token: &CancellationToken,
    ) -> Self {
        let queue = ForwardQueue {
            inner: Arc::new(JobQueue::new()),
        };
        let token = token.child_token();
        let workers_count = settings.workers.max(1);

        let mut workers = JoinSet::new();
        for id in 0..workers_count {
            let worker = Worker {
                id,
                queue: queue.inner.clone(),
                relay: relay.clone(),
                settings: settings.clone(),
                token: token.clone(),
            };
            workers.spawn(worker.run());
        }

        info!("Mail forwarder started with {} workers", workers_count);

        Self {
            queue,
            workers,
            token,
            drain_timeout: settings.drain_timeout,
        }
    }

    /// Producer handle for the ingress path
    pub fn queue(&self) -> ForwardQueue {
        self.queue.clone()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop accepting work, drain the queue and stop the workers.
    ///
    /// Waits at most the drain timeout, then aborts whatever is still running.
    /// Returns the number of jobs left undelivered.
    pub async fn shutdown(mut self) -> usize {
        self.token.cancel();
        info!("Draining {} queued messages", self.queue.len());

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    error!("Forwarder worker failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Drain timed out after {}s, aborting forwarder workers",
                self.drain_timeout.as_secs()
            );
            self.workers.shutdown().await;
        }

        let undelivered = self.queue.len();
        if undelivered > 0 {
            warn!("{} messages were not forwarded", undelivered);
        } else {
            info!("Mail forwarder stopped");
        }
        undelivered
    }
}

struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    relay: Arc<dyn Relay>,
    settings: ForwarderSettings,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Forwarder worker started");

        while !self.token.is_cancelled() || self.queue.len() > 0 {
            let Some(mut job) = self.queue.pop(self.settings.poll_interval).await else {
                continue;
            };

            match self.relay.deliver(&job).await {
                Ok(()) => {
                    info!(worker = self.id, "Forwarded {} to {:?}", job.id, job.to);
                    self.queue.settle();
                }
                Err(e) if e.is_transient() => {
                    job.attempts += 1;
                    warn!(
                        worker = self.id,
                        attempts = job.attempts,
                        "Failed to forward {}: {}; requeued",
                        job.id,
                        e
                    );
                    self.queue.requeue(job);
                    self.relay.reset().await;
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => {
                    error!(worker = self.id, "Dropping {}: {}", job.id, e);
                    self.queue.settle();
                }
            }
        }

        debug!(worker = self.id, "Forwarder worker stopped");
    }
}
