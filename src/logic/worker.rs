use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::cluster::WriteGuard;
use crate::config::MigrationConfig;
use crate::logic::executor::MigrationExecutor;
use crate::store::traits::Store;

/// Background tasks that claim and run migration jobs.
///
/// Each task claims one job at a time while the cluster allows writes. When
/// the queue is empty it sleeps with exponential backoff, or until a job is
/// enqueued through the same queue.
pub struct MigrationWorker {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(config: &MigrationConfig) -> Self {
        let initial = Duration::from_millis(config.poll_interval_ms.max(1));
        let max = Duration::from_millis(config.poll_max_backoff_ms).max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay to wait now; doubles the next one up to `max`
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

impl MigrationWorker {
    pub fn spawn<S: Store + ?Sized + 'static>(
        executor: MigrationExecutor<S>,
        guard: Arc<dyn WriteGuard>,
        config: &MigrationConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let notify = executor.queue().notifier();
        let count = config.worker_count.max(1);

        let handles = (0..count)
            .map(|index| {
                tokio::spawn(run(
                    index,
                    executor.clone(),
                    guard.clone(),
                    notify.clone(),
                    Backoff::new(config),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        log::info!("Started {} migration worker(s)", count);
        Self { shutdown, handles }
    }

    /// Stop claiming new jobs and wait for running ones to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                log::error!("Migration worker task failed: {}", err);
            }
        }
        log::info!("Migration workers stopped");
    }
}

async fn run<S: Store + ?Sized + 'static>(
    index: usize,
    executor: MigrationExecutor<S>,
    guard: Arc<dyn WriteGuard>,
    notify: Arc<Notify>,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("Migration worker {} running", index);
    loop {
        if *shutdown.borrow() {
            break;
        }

        if guard.is_write_allowed() {
            match executor.queue().claim_next().await {
                Ok(Some(job)) => {
                    executor.process(job).await;
                    backoff.reset();
                    continue;
                }
                Ok(None) => {}
                Err(err) => log::error!("Migration worker {} could not claim a job: {}", index, err),
            }
        } else {
            log::debug!("Migration worker {} idle, cluster writes are blocked", index);
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = notify.notified() => backoff.reset(),
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }
    log::debug!("Migration worker {} exiting", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FlagWriteGuard;
    use crate::logic::queue::JobQueue;
    use crate::logic::registry::SchemaRegistry;
    use crate::logic::usage_hash::MicroschemaUsageHasher;
    use crate::model::{JobFilter, JobStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::schema_cache::SchemaCache;
    use tokio::sync::broadcast;

    fn executor(store: Arc<MemoryStore>) -> MigrationExecutor<MemoryStore> {
        let registry = SchemaRegistry::new(store.clone(), Arc::new(SchemaCache::new()));
        let (events, _) = broadcast::channel(16);
        MigrationExecutor::new(
            registry,
            JobQueue::new(store),
            Arc::new(MicroschemaUsageHasher::new()),
            events,
            10,
        )
    }

    fn config() -> MigrationConfig {
        MigrationConfig {
            worker_count: 3,
            poll_interval_ms: 10,
            poll_max_backoff_ms: 40,
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(&config());
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 40]);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 10);
    }

    #[tokio::test]
    async fn test_workers_pick_up_jobs_only_when_writable() {
        let store = Arc::new(MemoryStore::new());
        let executor = executor(store.clone());
        let mut events = executor.subscribe();
        let guard = Arc::new(FlagWriteGuard::new(false));
        let worker = MigrationWorker::spawn(executor.clone(), guard.clone(), &config());

        // Unknown branch: the job runs and fails, which is enough to observe pickup
        let job = executor
            .queue()
            .enqueue_branch_migration(&"missing".to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.queue().get(&job.id).await.unwrap().status, JobStatus::Queued);

        guard.set_write_allowed(true);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, job.id);
        assert!(!event.is_success());

        worker.shutdown().await;
        let failed = executor
            .queue()
            .list(&JobFilter::with_status(JobStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }
}
