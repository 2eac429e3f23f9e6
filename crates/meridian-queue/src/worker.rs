//! Consumer pools that drain queues through typed handlers.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::job::Job;
use crate::queue::{FailDisposition, Queue};

/// Error returned by a job handler.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the queue may retry the job per its backoff policy.
    pub retriable: bool,
}

impl HandlerError {
    /// A failure the queue should retry.
    #[must_use]
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    /// A failure that must not be retried.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Processes jobs of one payload type.
///
/// Handlers must be idempotent: the queue is at-least-once and a job may be
/// delivered more than once.
#[async_trait::async_trait]
pub trait JobHandler<P>: Send + Sync {
    /// Process one job.
    async fn handle(&self, job: &Job<P>) -> Result<(), HandlerError>;

    /// Called once when a job's retries are exhausted (or it failed
    /// terminally). Used to chain failure notifications.
    async fn on_exhausted(&self, _job: &Job<P>, _error: &HandlerError) {}
}

/// Configuration for a consumer pool.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Number of concurrent worker tasks.
    pub concurrency: usize,
    /// Cap on how many jobs may *start* per minute, across the pool.
    pub jobs_per_minute: Option<NonZeroU32>,
}

impl ConsumerConfig {
    /// Pool of the given size with no rate cap.
    #[must_use]
    pub const fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            jobs_per_minute: None,
        }
    }

    /// Set the per-minute start cap.
    #[must_use]
    pub const fn jobs_per_minute(mut self, limit: NonZeroU32) -> Self {
        self.jobs_per_minute = Some(limit);
        self
    }
}

/// A pool of worker tasks draining one queue.
pub struct ConsumerPool<P> {
    queue: Arc<Queue<P>>,
    handler: Arc<dyn JobHandler<P>>,
    config: ConsumerConfig,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl<P: Clone + Send + Sync + 'static> ConsumerPool<P> {
    /// Create a pool for the given queue and handler.
    #[must_use]
    pub fn new(
        queue: Arc<Queue<P>>,
        handler: Arc<dyn JobHandler<P>>,
        config: ConsumerConfig,
    ) -> Self {
        let limiter = config
            .jobs_per_minute
            .map(|limit| Arc::new(RateLimiter::direct(Quota::per_minute(limit))));
        Self {
            queue,
            handler,
            config,
            limiter,
        }
    }

    /// Run the pool until the cancellation token fires.
    ///
    /// Resolves once every worker task has stopped.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();

        for worker_id in 0..self.config.concurrency.max(1) {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let limiter = self.limiter.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                info!(queue = queue.name(), worker_id, "queue worker started");
                loop {
                    if let Some(limiter) = &limiter {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            () = limiter.until_ready() => {}
                        }
                    }

                    let Some(job) = queue.next(&cancel).await else {
                        break;
                    };
                    process_job(&queue, handler.as_ref(), &job).await;
                }
                info!(queue = queue.name(), worker_id, "queue worker stopped");
            });
        }

        while workers.join_next().await.is_some() {}
    }
}

async fn process_job<P: Clone>(queue: &Queue<P>, handler: &dyn JobHandler<P>, job: &Job<P>) {
    match handler.handle(job).await {
        Ok(()) => {
            if let Err(e) = queue.ack(&job.id).await {
                // Lease may have expired mid-handle; the job will re-run.
                debug!(queue = queue.name(), job_id = %job.id, error = %e, "ack failed");
            }
        }
        Err(handler_error) => {
            error!(
                queue = queue.name(),
                job_id = %job.id,
                attempt = job.attempts,
                error = %handler_error,
                "job handler failed"
            );
            match queue
                .fail(&job.id, &handler_error.message, handler_error.retriable)
                .await
            {
                Ok(FailDisposition::Exhausted) => {
                    handler.on_exhausted(job, &handler_error).await;
                }
                Ok(FailDisposition::Retrying { .. }) => {}
                Err(e) => {
                    debug!(queue = queue.name(), job_id = %job.id, error = %e, "fail report lost");
                }
            }
        }
    }
}

impl<P> std::fmt::Debug for ConsumerPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("queue", &self.queue.name())
            .field("concurrency", &self.config.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::job::EnqueueOptions;
    use crate::queue::QueueConfig;

    struct CountingHandler {
        handled: AtomicUsize,
        exhausted: AtomicUsize,
        fail_first: bool,
    }

    impl CountingHandler {
        fn new(fail_first: bool) -> Self {
            Self {
                handled: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait::async_trait]
    impl JobHandler<String> for CountingHandler {
        async fn handle(&self, job: &Job<String>) -> Result<(), HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && job.attempts == 1 {
                return Err(HandlerError::retriable("first attempt fails"));
            }
            Ok(())
        }

        async fn on_exhausted(&self, _job: &Job<String>, _error: &HandlerError) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(
        handler: Arc<CountingHandler>,
        concurrency: usize,
    ) -> (Arc<Queue<String>>, ConsumerPool<String>) {
        let queue = Arc::new(Queue::new(QueueConfig::new("pool-test")));
        let pool = ConsumerPool::new(
            Arc::clone(&queue),
            handler,
            ConsumerConfig::new(concurrency),
        );
        (queue, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_drains_queue() {
        let handler = Arc::new(CountingHandler::new(false));
        let (queue, pool) = pool_with(Arc::clone(&handler), 3);

        for i in 0..10 {
            queue
                .enqueue(format!("job-{i}"), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handler.handled.load(Ordering::SeqCst) >= 10 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs processed");

        cancel.cancel();
        runner.await.expect("pool stops");

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_failure_invokes_exhausted_hook() {
        struct AlwaysFails {
            exhausted: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl JobHandler<String> for AlwaysFails {
            async fn handle(&self, _job: &Job<String>) -> Result<(), HandlerError> {
                Err(HandlerError::terminal("bad configuration"))
            }

            async fn on_exhausted(&self, _job: &Job<String>, _error: &HandlerError) {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(AlwaysFails {
            exhausted: AtomicUsize::new(0),
        });
        let queue = Arc::new(Queue::new(QueueConfig::new("pool-test")));
        let pool = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::clone(&handler) as Arc<dyn JobHandler<String>>,
            ConsumerConfig::new(1),
        );

        let id = queue
            .enqueue("doomed".to_owned(), EnqueueOptions::with_max_attempts(5))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handler.exhausted.load(Ordering::SeqCst) >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("hook invoked");

        cancel.cancel();
        runner.await.expect("pool stops");

        assert_eq!(queue.job_state(&id).await, Some(crate::JobState::Failed));
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retriable_failure_is_retried() {
        let mut config = QueueConfig::new("pool-test");
        config.poll_interval = Duration::from_millis(10);
        let queue = Arc::new(Queue::new(config));
        let handler = Arc::new(CountingHandler::new(true));
        let pool = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::clone(&handler) as Arc<dyn JobHandler<String>>,
            ConsumerConfig::new(1),
        );

        queue
            .enqueue(
                "flaky".to_owned(),
                EnqueueOptions {
                    max_attempts: 2,
                    backoff: crate::BackoffPolicy::Fixed(Duration::from_millis(20)),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let runner = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.stats().await.completed == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job eventually completes");

        cancel.cancel();
        runner.await.expect("pool stops");

        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
    }
}
