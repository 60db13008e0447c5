//! Background producer pool
//!
//! Producer jobs decode previews or build tile data off the UI thread. Each
//! job runs on a named pool thread that first obtains a [`WorkerPermit`] from
//! the registry, so the number of producers doing work at once never exceeds
//! `max_concurrent_workers` no matter how many threads the pool has. A job
//! may return a task, which is handed to the scheduler for the UI thread to
//! drain.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tilebay_scheduler::{CancellationToken, Task, TaskScheduler};
use tracing::{debug, trace, warn};

use crate::registry::ResourceRegistry;
use crate::workers::WorkerPermit;

/// A unit of background work. Returning `Some(task)` queues the task for the
/// consumer loop.
pub type ProducerJob<T> = Box<dyn FnOnce(&CancellationToken) -> Option<Task<T>> + Send>;

type Queued<T> = (ProducerJob<T>, CancellationToken);

/// Configuration for the producer pool.
#[derive(Debug, Clone)]
pub struct ProducerPoolConfig {
    /// Number of pool threads.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// How long an idle thread waits for a job, or for a worker slot, before
    /// checking for shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for ProducerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProducerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Counters kept by the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub jobs_submitted: u64,
    pub jobs_run: u64,
    /// Jobs cancelled before they started
    pub jobs_skipped: u64,
    pub jobs_panicked: u64,
    /// Tasks handed to the scheduler
    pub tasks_queued: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    run: AtomicU64,
    skipped: AtomicU64,
    panicked: AtomicU64,
    queued: AtomicU64,
}

/// Pool of background threads running producer jobs.
pub struct ProducerPool<T> {
    jobs: Option<Sender<Queued<T>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> ProducerPool<T> {
    /// Start the pool threads.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        scheduler: Arc<TaskScheduler<T>>,
        config: ProducerPoolConfig,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Queued<T>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let num_workers = config.num_workers.max(1);

        let mut pool = Self {
            jobs: Some(sender),
            workers: Vec::with_capacity(num_workers),
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        };

        for id in 0..num_workers {
            let producer = Producer {
                name: format!("tilebay-producer-{id}"),
                registry: registry.clone(),
                scheduler: scheduler.clone(),
                jobs: receiver.clone(),
                shutdown: pool.shutdown.clone(),
                counters: pool.counters.clone(),
                poll_interval: config.poll_interval,
            };
            let thread = thread::Builder::new()
                .name(producer.name.clone())
                .spawn(move || producer.run())?;
            pool.workers.push(thread);
        }

        debug!(workers = num_workers, "producer pool started");
        Ok(pool)
    }

    /// Queue a job. The returned token cancels it; a job cancelled before it
    /// starts is skipped.
    pub fn submit<F>(&self, job: F) -> CancellationToken
    where
        F: FnOnce(&CancellationToken) -> Option<Task<T>> + Send + 'static,
    {
        self.submit_with_token(job, CancellationToken::new())
    }

    pub fn submit_with_token<F>(&self, job: F, token: CancellationToken) -> CancellationToken
    where
        F: FnOnce(&CancellationToken) -> Option<Task<T>> + Send + 'static,
    {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .jobs
            .as_ref()
            .is_some_and(|jobs| jobs.send((Box::new(job), token.clone())).is_ok());
        if !sent {
            warn!("producer pool is shut down, job discarded");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            token.cancel();
        }
        token
    }
}

impl<T> ProducerPool<T> {
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            jobs_submitted: self.counters.submitted.load(Ordering::Relaxed),
            jobs_run: self.counters.run.load(Ordering::Relaxed),
            jobs_skipped: self.counters.skipped.load(Ordering::Relaxed),
            jobs_panicked: self.counters.panicked.load(Ordering::Relaxed),
            tasks_queued: self.counters.queued.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and wait for every thread to exit, returning the
    /// final counters.
    ///
    /// Jobs already running finish first. Jobs still queued never run: their
    /// tokens are cancelled and they count as skipped.
    pub fn shutdown(mut self) -> ProducerStats {
        self.signal();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("producer thread panicked during shutdown");
            }
        }
        let stats = self.stats();
        debug!(
            run = stats.jobs_run,
            skipped = stats.jobs_skipped,
            "producer pool stopped"
        );
        stats
    }

    fn signal(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.jobs = None;
    }
}

impl<T> Drop for ProducerPool<T> {
    fn drop(&mut self) {
        self.signal();
    }
}

struct Producer<T> {
    name: String,
    registry: Arc<ResourceRegistry>,
    scheduler: Arc<TaskScheduler<T>>,
    jobs: Arc<Mutex<Receiver<Queued<T>>>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    poll_interval: Duration,
}

impl<T> Producer<T> {
    fn run(self) {
        loop {
            if self.is_shutting_down() {
                break;
            }

            let next = self
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(self.poll_interval);

            match next {
                Ok((job, token)) => self.execute(job, token),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.discard_queued();
        trace!(producer = %self.name, "producer thread exiting");
    }

    fn execute(&self, job: ProducerJob<T>, token: CancellationToken) {
        let Some(permit) = self.admit(&token) else {
            if self.is_shutting_down() {
                token.cancel();
            }
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.counters.run.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| job(permit.token())));
        // Free the slot before touching the scheduler lock.
        drop(permit);

        match result {
            Ok(Some(task)) => {
                if token.is_cancelled() {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let handle = self.scheduler.submit(task);
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                trace!(producer = %self.name, task = handle.id(), "queued producer result");
            }
            Ok(None) => {}
            Err(_) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(producer = %self.name, "producer job panicked");
            }
        }
    }

    /// Cancel and count every job left in the channel.
    fn discard_queued(&self) {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut discarded = 0;
        while let Ok((_, token)) = jobs.try_recv() {
            token.cancel();
            discarded += 1;
        }
        drop(jobs);

        if discarded > 0 {
            self.counters.skipped.fetch_add(discarded, Ordering::Relaxed);
            debug!(producer = %self.name, discarded, "discarded queued jobs on shutdown");
        }
    }

    /// Wait for a worker slot, giving up on shutdown or cancellation.
    fn admit(&self, token: &CancellationToken) -> Option<WorkerPermit> {
        loop {
            if token.is_cancelled() || self.is_shutting_down() {
                return None;
            }
            match self.registry.register_worker_timeout(
                self.name.clone(),
                token.clone(),
                self.poll_interval,
            ) {
                Ok(permit) => return Some(permit),
                Err(err) => trace!(producer = %self.name, %err, "waiting for a worker slot"),
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tilebay_cache::ResourceLimits;
    use tilebay_scheduler::TaskPriority;

    fn registry(workers: usize) -> Arc<ResourceRegistry> {
        Arc::new(ResourceRegistry::with_limits(
            ResourceLimits::default().with_max_concurrent_workers(workers),
        ))
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for producers");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_results_reach_scheduler() {
        let registry = registry(2);
        let scheduler = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(
            registry,
            scheduler.clone(),
            ProducerPoolConfig::new(3).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        for i in 0..20u32 {
            pool.submit(move |_| Some(Task::new(TaskPriority::Visible, move |_| i * 2)));
        }
        wait_for(|| scheduler.stats().submitted == 20);

        let mut values: Vec<u32> = scheduler
            .drain(100, Duration::from_secs(1))
            .into_iter()
            .filter_map(|done| done.into_value())
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..20).map(|i| i * 2).collect::<Vec<_>>());

        let stats = pool.stats();
        assert_eq!(stats.jobs_run, 20);
        assert_eq!(stats.tasks_queued, 20);
        pool.shutdown();
    }

    #[test]
    fn test_concurrency_capped_by_registry() {
        let registry = registry(2);
        let scheduler: Arc<TaskScheduler<()>> = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(
            registry.clone(),
            scheduler,
            ProducerPoolConfig::new(6).with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..24 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            pool.submit(move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                None
            });
        }

        wait_for(|| finished.load(Ordering::SeqCst) == 24);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(registry.stats().peak_workers <= 2);
        pool.shutdown();
        assert_eq!(registry.active_workers(), 0);
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let registry = registry(1);
        let scheduler: Arc<TaskScheduler<u8>> = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(registry, scheduler.clone(), ProducerPoolConfig::new(1)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.submit_with_token(
            move |_| {
                flag.store(true, Ordering::SeqCst);
                Some(Task::new(TaskPriority::Idle, |_| 1))
            },
            token,
        );

        wait_for(|| pool.stats().jobs_skipped == 1);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_thread() {
        let registry = registry(1);
        let scheduler = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(registry, scheduler.clone(), ProducerPoolConfig::new(1)).unwrap();

        pool.submit(|_| -> Option<Task<&'static str>> { panic!("bad preview") });
        pool.submit(|_| Some(Task::new(TaskPriority::Visible, |_| "ok")));

        wait_for(|| scheduler.stats().submitted == 1);
        assert_eq!(pool.stats().jobs_panicked, 1);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_queued_jobs() {
        let registry = registry(1);
        let scheduler: Arc<TaskScheduler<u8>> = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(
            registry,
            scheduler.clone(),
            ProducerPoolConfig::new(1).with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(move |_| {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            None
        });

        let ran = Arc::new(AtomicUsize::new(0));
        let tokens: Vec<_> = (0..5)
            .map(|_| {
                let ran = ran.clone();
                pool.submit(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Some(Task::new(TaskPriority::Idle, |_| 1))
                })
            })
            .collect();

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let stats = pool.shutdown();

        assert_eq!(stats.jobs_run, 1);
        assert_eq!(stats.jobs_skipped, 5);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_shutdown_joins_threads() {
        let registry = registry(2);
        let scheduler: Arc<TaskScheduler<()>> = Arc::new(TaskScheduler::new());
        let pool = ProducerPool::new(registry, scheduler, ProducerPoolConfig::new(4)).unwrap();
        assert_eq!(pool.num_workers(), 4);
        assert!(!pool.is_shutting_down());
        pool.shutdown();
    }
}
