//! Named, lazily created, bounded worker pools.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool group {group} is shut down")]
    ShutDown { group: String },
    #[error("failed to spawn worker for thread pool group {group}: {source}")]
    Spawn {
        group: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task panicked: {message}")]
    TaskPanicked { message: String },
    #[error("task was dropped before it ran")]
    TaskDropped,
}

/// Result of a task submitted to a [`WorkerPool`].
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes.
    pub fn join(self) -> Result<T, PoolError> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PoolError::TaskPanicked { message }),
            Err(_) => Err(PoolError::TaskDropped),
        }
    }
}

pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self, PoolError> {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || loop {
                    let job = receiver.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .map_err(|source| PoolError::Spawn {
                    group: name.clone(),
                    source,
                })?;
            workers.push(worker);
        }

        tracing::debug!(group = %name, size, "thread pool created");
        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
            // the submitter may have stopped waiting
            let _ = result_tx.send(outcome);
        });

        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| PoolError::ShutDown {
            group: self.name.clone(),
        })?;
        sender.send(job).map_err(|_| PoolError::ShutDown {
            group: self.name.clone(),
        })?;
        Ok(TaskHandle {
            receiver: result_rx,
        })
    }

    /// Stops accepting work, lets queued tasks finish, then joins the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!(group = %self.name, "worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pools keyed by group name. A group keeps the size it was created with;
/// per-run work goes through [`ThreadPoolGroupManager::scoped`] instead.
pub struct ThreadPoolGroupManager {
    pools: Mutex<HashMap<String, Arc<WorkerPool>>>,
    accepting: AtomicBool,
}

impl Default for ThreadPoolGroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPoolGroupManager {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn pool(&self, group: &str, size: usize) -> Result<Arc<WorkerPool>, PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown {
                group: group.to_string(),
            });
        }
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(group) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(WorkerPool::new(group, size)?);
        pools.insert(group.to_string(), pool.clone());
        Ok(pool)
    }

    /// A pool owned by the caller and never registered as a group.
    ///
    /// Its workers stop when the returned pool is dropped, so a task running in a
    /// group pool can wait on it without competing for its own group's workers.
    pub fn scoped(&self, name: &str, size: usize) -> Result<WorkerPool, PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown {
                group: name.to_string(),
            });
        }
        WorkerPool::new(name, size)
    }

    pub fn submit<F, T>(&self, group: &str, size: usize, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.pool(group, size)?.submit(task)
    }

    pub fn group_size(&self, group: &str) -> Option<usize> {
        self.pools.lock().get(group).map(|pool| pool.size())
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops accepting new work and drains every pool.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
            tracing::debug!(group = %pool.name(), "thread pool stopped");
        }
    }
}
