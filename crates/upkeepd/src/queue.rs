//! Per-account job queue
//!
//! Mutations of one account run one at a time in arrival order. A job that
//! runs past the timeout is logged as orphaned and the next job may start;
//! the orphan keeps running and its caller still gets its result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tracing::{debug, warn};

pub struct AccountQueue {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// A job counted as in flight. Take it before checking for shutdown.
pub struct Admission<'a>(&'a AccountQueue);

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Admission<'_> {
    /// Run `job` on the blocking pool once every earlier job for
    /// `username` has finished or timed out.
    pub async fn run<F, T>(
        self,
        username: &str,
        job_name: &'static str,
        job: F,
    ) -> Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.0;
        let guard = queue.lock_for(username).lock_owned().await;
        debug!(username = %username, job = job_name, "Job started");

        let mut handle = tokio::task::spawn_blocking(job);
        match tokio::time::timeout(queue.timeout, &mut handle).await {
            Ok(result) => {
                drop(guard);
                queue.prune(username);
                result
            }
            Err(_) => {
                warn!(
                    username = %username,
                    job = job_name,
                    timeout_secs = queue.timeout.as_secs(),
                    "Job timed out, orphaning it and advancing the queue"
                );
                drop(guard);
                queue.prune(username);
                handle.await
            }
        }
    }
}

impl AccountQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Jobs queued or running, orphans included
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a job as in flight until the returned admission is dropped
    pub fn enter(&self) -> Admission<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Admission(self)
    }

    fn lock_for(&self, username: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(username.to_string()).or_default().clone()
    }

    /// Forget the lock of `username` once no job holds or waits for it
    fn prune(&self, username: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(username)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(username);
        }
    }

    /// Shorthand for `enter` followed by `Admission::run`
    pub async fn run<F, T>(
        &self,
        username: &str,
        job_name: &'static str,
        job: F,
    ) -> Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enter().run(username, job_name, job).await
    }

    /// Wait until no job is queued or running
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
