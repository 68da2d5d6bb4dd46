//! Background cache warmers.
//!
//! A successful lookup tells us what the kernel is about to ask for next:
//! after resolving a directory it almost always lists it, and after
//! resolving a file it usually reads it. Lookup handlers enqueue best-effort
//! jobs here so that follow-up call finds a warm cache or an already-open
//! backend. Jobs run on a small fixed pool of detached workers: they survive
//! the kernel request that triggered them but never outlive their own
//! bounded budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::cache::{Cache, CacheKey, Op};
use crate::config::Config;
use crate::plugin::Entry;

use super::compute_children;

pub(super) enum Job {
    /// Re-issue the listing for a just-resolved directory.
    Warm { id: String, entry: Entry },
    /// Open a just-resolved file and keep the reader alive briefly.
    HoldOpen { id: String, entry: Entry },
}

pub(super) struct Prefetcher {
    jobs: Option<mpsc::Sender<Job>>,
}

impl Prefetcher {
    /// Start the worker pool. In slow mode no workers are spawned and every
    /// submitted job is discarded.
    pub(super) fn spawn(config: &Config, lists: Arc<Cache<Arc<Vec<Entry>>>>) -> Self {
        if config.slow {
            return Self { jobs: None };
        }

        let (tx, rx) = mpsc::channel(config.prefetch_queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..config.prefetch_workers.max(1) {
            let rx = rx.clone();
            let lists = lists.clone();
            let ttl = config.ttl;
            let hold = config.hold_open;
            tokio::spawn(async move {
                loop {
                    // Waiting workers queue up on the receiver lock and take
                    // jobs in turn; the job itself runs with the lock
                    // released.
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    run(job, &lists, ttl, hold).await;
                }
            });
        }

        Self { jobs: Some(tx) }
    }

    /// Enqueue a job without blocking the kernel handler. A full queue drops
    /// the job: prefetching is best-effort by contract.
    pub(super) fn submit(&self, job: Job) {
        if let Some(tx) = &self.jobs {
            if tx.try_send(job).is_err() {
                debug!("prefetch queue full, dropping job");
            }
        }
    }
}

async fn run(job: Job, lists: &Cache<Arc<Vec<Entry>>>, ttl: Duration, hold: Duration) {
    match job {
        Job::Warm { id, entry } => {
            let Some(group) = entry.group().cloned() else {
                return;
            };
            let key = CacheKey::new(Op::List, &id);
            match lists.get(key, ttl, compute_children(id.clone(), group)).await {
                Ok(children) => debug!("prefetched {} entries for {id}", children.len()),
                Err(e) => debug!("prefetch list {id} failed: {e}"),
            }
        }
        Job::HoldOpen { id, entry } => {
            let Some(readable) = entry.readable().cloned() else {
                return;
            };
            match readable.open().await {
                Ok(reader) => {
                    debug!("prefetch holding {id} open");
                    // Park the handle on its own timer so this worker is
                    // free for the next job; the reader closes on drop.
                    tokio::spawn(async move {
                        tokio::time::sleep(hold).await;
                        drop(reader);
                    });
                }
                Err(e) => debug!("prefetch open {id} failed: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Group, Readable, SizedReader};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDir(Arc<AtomicUsize>);

    #[async_trait]
    impl Group for CountingDir {
        async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    struct CountingFile(Arc<AtomicUsize>);

    #[async_trait]
    impl Readable for CountingFile {
        async fn open(&self) -> anyhow::Result<Box<dyn SizedReader>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Bytes::from_static(b"warm")))
        }
    }

    #[tokio::test]
    async fn warm_job_primes_the_listing_cache() {
        let config = Config {
            hold_open: Duration::from_millis(10),
            ..Default::default()
        };
        let lists = Arc::new(Cache::new());
        let prefetcher = Prefetcher::spawn(&config, lists.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let entry = Entry::new("dir")
            .group(Arc::new(CountingDir(calls.clone())))
            .build();
        prefetcher.submit(Job::Warm {
            id: "/p/dir".into(),
            entry: entry.clone(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A follow-up through the same cache is already satisfied.
        let group = entry.group().cloned().unwrap();
        lists
            .get(
                CacheKey::new(Op::List, "/p/dir"),
                config.ttl,
                compute_children("/p/dir".into(), group),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hold_open_job_opens_and_releases() {
        let config = Config {
            hold_open: Duration::from_millis(20),
            ..Default::default()
        };
        let lists = Arc::new(Cache::new());
        let prefetcher = Prefetcher::spawn(&config, lists);

        let opens = Arc::new(AtomicUsize::new(0));
        let entry = Entry::new("file")
            .readable(Arc::new(CountingFile(opens.clone())))
            .build();
        prefetcher.submit(Job::HoldOpen {
            id: "/p/file".into(),
            entry,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_mode_spawns_nothing() {
        let config = Config {
            slow: true,
            ..Default::default()
        };
        let lists = Arc::new(Cache::new());
        let prefetcher = Prefetcher::spawn(&config, lists);

        let calls = Arc::new(AtomicUsize::new(0));
        let entry = Entry::new("dir")
            .group(Arc::new(CountingDir(calls.clone())))
            .build();
        prefetcher.submit(Job::Warm {
            id: "/p/dir".into(),
            entry,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
