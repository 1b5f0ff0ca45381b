use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    idle: usize,
    workers: usize,
    shutdown: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded-growth pool: a worker is spawned only when a job arrives and no
/// worker is idle, up to `max_workers`. Jobs beyond that wait in FIFO order.
pub struct WorkerPool {
    name: String,
    max_workers: usize,
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(anyhow!("max_workers must be >= 1"));
        }
        Ok(Self {
            name: name.into(),
            max_workers,
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue::default()),
                available: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let spawn_index = {
            let mut queue = self.inner.lock();
            if queue.shutdown {
                return Err(anyhow!("worker pool '{}' is shut down", self.name));
            }
            queue.jobs.push_back(Box::new(job));
            let spawn = queue.idle == 0 && queue.workers < self.max_workers;
            if spawn {
                queue.workers += 1;
            }
            spawn.then_some(queue.workers)
        };
        self.inner.available.notify_one();

        if let Some(index) = spawn_index {
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{index}", self.name))
                .spawn(move || worker_loop(&inner))
                .map_err(|err| {
                    self.inner.lock().workers -= 1;
                    anyhow!("failed to spawn worker for pool '{}': {err}", self.name)
                })?;
            self.handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut queue = inner.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown {
                    break None;
                }
                queue.idle += 1;
                queue = inner
                    .available
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.idle -= 1;
            }
        };
        let Some(job) = job else {
            break;
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            tracing::warn!("worker pool job panicked");
        }
    }
}

impl Drop for WorkerPool {
    /// Queued jobs still run; the pool then joins every worker.
    fn drop(&mut self) {
        self.inner.lock().shutdown = true;
        self.inner.available.notify_all();
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!(pool = %self.name, "worker pool thread panicked");
            }
        }
    }
}
