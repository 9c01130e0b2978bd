//! Bounded-concurrency task queue.
//!
//! Work items run on the tokio runtime but never more than `concurrency`
//! at once. An optional throttle spaces out task starts. The queue's limit
//! is what keeps background refreshes from hammering the directory API.

pub mod retry;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::app::{PodsyncError, Result};

pub use retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 1;

/// Minimum spacing between task starts.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            sleep_until(prev + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// Decrements the outstanding count when a task finishes, however it ends.
struct Outstanding {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Result of a queued task. A panicking task resolves to an error.
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn abort(&self) {
        self.inner.abort();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        Pin::new(&mut self.inner).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PodsyncError::Cancelled),
            Err(e) => Err(PodsyncError::Other(format!("Task failed: {}", e))),
        })
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    throttle: Option<Arc<Throttle>>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    concurrency: usize,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            throttle: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            concurrency,
        }
    }

    pub fn with_throttle(concurrency: usize, min_interval: Duration) -> Self {
        let mut queue = Self::new(concurrency);
        if !min_interval.is_zero() {
            queue.throttle = Some(Arc::new(Throttle::new(min_interval)));
        }
        queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks queued or running.
    pub fn len(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `task`; the returned handle resolves to its result.
    pub fn add<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let guard = Outstanding {
            count: self.outstanding.clone(),
            idle: self.idle.clone(),
        };
        let semaphore = self.semaphore.clone();
        let throttle = self.throttle.clone();

        let inner = tokio::spawn(async move {
            let _guard = guard;
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| PodsyncError::Closed)?;
            if let Some(throttle) = throttle {
                throttle.wait().await;
            }
            task.await
        });

        TaskHandle { inner }
    }

    /// Resolves once nothing is queued or running.
    pub async fn on_empty(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}
