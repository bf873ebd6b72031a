use kanal::AsyncSender;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub const DEFAULT_WORKERS: usize = 4;

/// Fixed set of workers draining a FIFO queue of short tasks. Quiescence
/// (queue empty, nothing mid-task) is observable and reusable: the pool
/// keeps accepting work across quiescence boundaries until `shutdown`.
pub struct WorkerPool {
    jobs: AsyncSender<Job>,
    // queued + running task count, watched by quiesce()
    outstanding: watch::Sender<usize>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker pool needs at least one worker");
        let (jobs, queue) = kanal::unbounded_async::<Job>();
        let (outstanding, _) = watch::channel(0usize);
        let workers = (0..workers)
            .map(|_| {
                let queue = queue.clone();
                let outstanding = outstanding.clone();
                tokio::spawn(async move {
                    while let Ok(job) = queue.recv().await {
                        job.await;
                        outstanding.send_modify(|n| *n -= 1);
                    }
                })
            })
            .collect();
        Self {
            jobs,
            outstanding,
            workers,
        }
    }

    pub async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) {
        self.outstanding.send_modify(|n| *n += 1);
        self.jobs
            .send(Box::pin(job))
            .await
            .expect("submitted to a shut down worker pool");
    }

    /// Blocks until the queue is empty and every worker is idle.
    pub async fn quiesce(&self) {
        let mut state = self.outstanding.subscribe();
        state
            .wait_for(|&outstanding| outstanding == 0)
            .await
            .expect("worker pool state channel closed");
    }

    /// Drain outstanding work, close the queue and join the workers.
    pub async fn shutdown(self) {
        self.quiesce().await;
        drop(self.jobs);
        for worker in self.workers {
            worker.await.expect("worker task panicked");
        }
    }
}

#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn quiesce_waits_for_queued_and_running_tasks() {
    let pool = WorkerPool::new(2);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let done = Arc::clone(&done);
        pool.submit(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            done.fetch_add(1, Ordering::AcqRel);
        })
        .await;
    }
    pool.quiesce().await;
    assert_eq!(done.load(Ordering::Acquire), 8);
}

#[tokio::test]
async fn pool_is_reusable_across_quiescence() {
    let pool = WorkerPool::new(2);
    let done = Arc::new(AtomicUsize::new(0));
    for round in 1..=3usize {
        for _ in 0..4 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                done.fetch_add(1, Ordering::AcqRel);
            })
            .await;
        }
        pool.quiesce().await;
        assert_eq!(done.load(Ordering::Acquire), round * 4);
    }
}

#[tokio::test]
async fn quiesce_returns_immediately_when_idle() {
    let pool = WorkerPool::new(1);
    pool.quiesce().await;
}

#[tokio::test]
async fn shutdown_drains_the_queue() {
    let pool = WorkerPool::new(2);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let done = Arc::clone(&done);
        pool.submit(async move {
            done.fetch_add(1, Ordering::AcqRel);
        })
        .await;
    }
    pool.shutdown().await;
    assert_eq!(done.load(Ordering::Acquire), 16);
}
