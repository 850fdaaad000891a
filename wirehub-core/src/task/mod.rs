//! Tracked concurrency: tasks, correlation futures and periodic jobs.
//!
//! [`TaskScheduler`] counts every piece of outstanding work it hands out
//! (spawned tasks and pending correlation futures) so that an owner can
//! drain it on shutdown. It also owns the request-id → future table used
//! for request/response correlation, and any periodic jobs registered on
//! it.

pub mod periodic;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

use crate::error::{Result, WireError};
use crate::message::RequestId;

pub use periodic::{get_next_time, get_start_interval};

type Resolver<V> = oneshot::Sender<Result<V>>;

// ── TrackedTask ──────────────────────────────────────────────────

/// Handle to work spawned through a [`TaskScheduler`].
///
/// Awaiting it yields the work's output, or [`WireError::Cancelled`] /
/// [`WireError::Other`] if the task was aborted or panicked.
#[derive(Debug)]
pub struct TrackedTask<T> {
    name: String,
    handle: JoinHandle<T>,
}

impl<T> TrackedTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for TrackedTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|r| r.map_err(WireError::from))
    }
}

// ── Outstanding-work counter ─────────────────────────────────────

#[derive(Debug)]
struct Counter {
    tx: watch::Sender<usize>,
}

impl Counter {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    fn increment(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    fn decrement(&self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn get(&self) -> usize {
        *self.tx.borrow()
    }

    async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements the counter when the tracked work ends, however it ends.
struct CounterGuard(Arc<Counter>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

// ── TaskScheduler ────────────────────────────────────────────────

/// Tracks tasks, correlation futures resolving to `V`, and periodic jobs.
///
/// Cheap to clone; clones share the same counter and tables.
#[derive(Debug)]
pub struct TaskScheduler<V = ()> {
    counter: Arc<Counter>,
    futures: Arc<Mutex<HashMap<RequestId, Option<Resolver<V>>>>>,
    periodic: CancellationToken,
    periodic_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<V> Clone for TaskScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            counter: self.counter.clone(),
            futures: self.futures.clone(),
            periodic: self.periodic.clone(),
            periodic_tasks: self.periodic_tasks.clone(),
        }
    }
}

impl<V> Default for TaskScheduler<V>
where
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TaskScheduler<V>
where
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            counter: Arc::new(Counter::new()),
            futures: Arc::new(Mutex::new(HashMap::new())),
            periodic: CancellationToken::new(),
            periodic_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of tasks and futures still outstanding.
    pub fn outstanding(&self) -> usize {
        self.counter.get()
    }

    // ── Tasks ────────────────────────────────────────────────────

    /// Spawn `work` and count it until it finishes.
    pub fn create_task<F>(&self, work: F, name: &str) -> TrackedTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.task_with_callback(work, |_| {}, name)
    }

    /// Like [`create_task`](Self::create_task), also running `callback`
    /// on the output before the work is counted as done.
    pub fn task_with_callback<F, C>(&self, work: F, callback: C, name: &str) -> TrackedTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        C: FnOnce(&F::Output) + Send + 'static,
    {
        self.counter.increment();
        let guard = CounterGuard(self.counter.clone());
        let span = tracing::debug_span!("task", name = %name);
        let handle = tokio::spawn(
            async move {
                let out = work.await;
                callback(&out);
                drop(guard);
                out
            }
            .instrument(span),
        );
        TrackedTask {
            name: name.to_string(),
            handle,
        }
    }

    /// Spawn `work` without counting it; a drain does not wait for it.
    pub fn spawn_untracked<F>(&self, work: F, name: &str) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(work.instrument(tracing::debug_span!("untracked", name = %name)))
    }

    // ── Correlation futures ──────────────────────────────────────

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, Option<Resolver<V>>>> {
        self.futures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending future for `key`.
    ///
    /// Fails if `key` already has one outstanding.
    pub fn create_future(&self, key: RequestId) -> Result<oneshot::Receiver<Result<V>>> {
        let mut table = self.table();
        if table.contains_key(&key) {
            return Err(WireError::DuplicateRequest(key.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        table.insert(key, Some(tx));
        self.counter.increment();
        Ok(rx)
    }

    /// Resolve the future for `key` with `value`.
    ///
    /// Hands `value` back when there is no unresolved future for `key`.
    pub fn set_result(&self, key: &RequestId, value: V) -> std::result::Result<(), V> {
        let resolver = self.table().get_mut(key).and_then(Option::take);
        match resolver {
            Some(tx) => match tx.send(Ok(value)) {
                Ok(()) => Ok(()),
                Err(Ok(value)) => Err(value),
                Err(Err(_)) => Ok(()),
            },
            None => Err(value),
        }
    }

    /// Fail the future for `key`. Returns `false` if nothing was pending.
    pub fn set_exception(&self, key: &RequestId, err: WireError) -> bool {
        let resolver = self.table().get_mut(key).and_then(Option::take);
        match resolver {
            Some(tx) => {
                let _ = tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Remove the table entry for `key` and count it as done.
    pub fn future_done(&self, key: &RequestId) {
        if self.table().remove(key).is_some() {
            self.counter.decrement();
        }
    }

    pub fn has_future(&self, key: &RequestId) -> bool {
        self.table().contains_key(key)
    }

    pub fn pending_futures(&self) -> usize {
        self.table().len()
    }

    /// Create a future for `key`, run `callback` (which is expected to
    /// lead to `set_result`/`set_exception` for `key`), then wait for the
    /// resolution. The table entry is removed however this returns.
    pub async fn run_wait_fut<F, Fut>(&self, key: RequestId, callback: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let rx = self.create_future(key.clone())?;
        let _done = FutureDone {
            scheduler: self,
            key,
        };
        callback().await?;
        rx.await.map_err(|_| WireError::Cancelled)?
    }

    /// Fail every unresolved future with a fresh error from `make_err`.
    pub fn cancel_all_futures(&self, make_err: impl Fn() -> WireError) {
        let mut table = self.table();
        let mut cancelled = 0usize;
        for resolver in table.values_mut() {
            if let Some(tx) = resolver.take() {
                let _ = tx.send(Err(make_err()));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "failed pending futures");
        }
    }

    // ── Periodic jobs ────────────────────────────────────────────

    /// Run `work` every `interval` until the scheduler closes.
    ///
    /// The first run is delayed per [`get_start_interval`]. Errors from a
    /// run are logged and do not stop the job.
    pub fn call_coro_periodic<F, Fut>(
        &self,
        interval: Duration,
        mut work: F,
        fixed_start_time: bool,
        immediate: bool,
        name: &str,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.periodic.clone();
        let first = get_start_interval(fixed_start_time, immediate, interval);
        let job = name.to_string();
        let handle = tokio::spawn(
            async move {
                let mut delay = first;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        res = work() => if let Err(e) = res {
                            error!(job = %job, "periodic job failed: {e}");
                        }
                    }
                    delay = interval;
                }
            }
            .instrument(tracing::debug_span!("periodic", name = %name)),
        );
        self.periodic_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Run a synchronous `callback` every `interval`, first after one interval.
    pub fn call_cb_periodic<F>(&self, interval: Duration, mut callback: F, name: &str)
    where
        F: FnMut() + Send + 'static,
    {
        self.call_coro_periodic(
            interval,
            move || {
                callback();
                std::future::ready(Ok(()))
            },
            false,
            false,
            name,
        );
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Wait until nothing is outstanding, for at most `timeout`.
    pub async fn join(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.counter.wait_zero()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    outstanding = self.counter.get(),
                    "scheduler did not drain within {timeout:?}"
                );
                Err(WireError::Timeout(timeout))
            }
        }
    }

    /// Cancel periodic jobs, then drain within `timeout`.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.periodic.cancel();
        let jobs: Vec<_> = self
            .periodic_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for job in jobs {
            let _ = job.await;
        }
        self.join(timeout).await
    }
}

/// Removes a correlation entry when the waiter finishes or is dropped.
struct FutureDone<'a, V>
where
    V: Send + 'static,
{
    scheduler: &'a TaskScheduler<V>,
    key: RequestId,
}

impl<V> Drop for FutureDone<'_, V>
where
    V: Send + 'static,
{
    fn drop(&mut self) {
        self.scheduler.future_done(&self.key);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn create_task_counts_until_done() {
        let scheduler: TaskScheduler = TaskScheduler::new();
        let (tx, rx) = oneshot::channel::<()>();

        let task = scheduler.create_task(
            async move {
                let _ = rx.await;
                7
            },
            "wait",
        );
        assert_eq!(scheduler.outstanding(), 1);
        assert_eq!(task.name(), "wait");

        tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), 7);
        scheduler.join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn close_waits_for_tracked_tasks() {
        let scheduler: Arc<TaskScheduler> = Arc::new(TaskScheduler::new());
        let (tx, rx) = oneshot::channel::<()>();
        let _task = scheduler.create_task(
            async move {
                let _ = rx.await;
            },
            "blocked",
        );

        let closing = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.close(Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());
        assert_eq!(scheduler.outstanding(), 1);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn callback_sees_output() {
        let scheduler: TaskScheduler = TaskScheduler::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let task = scheduler.task_with_callback(
            async { 3usize },
            {
                let seen = seen.clone();
                move |out: &usize| seen.store(*out, Ordering::SeqCst)
            },
            "cb",
        );
        task.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn aborted_task_is_uncounted() {
        let scheduler: TaskScheduler = TaskScheduler::new();
        let task = scheduler.create_task(std::future::pending::<()>(), "forever");
        task.abort();
        assert!(matches!(task.await, Err(WireError::Cancelled)));
        scheduler.join(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn future_resolved_once() {
        let scheduler: TaskScheduler<&'static str> = TaskScheduler::new();
        let key = RequestId::Num(1);
        let rx = scheduler.create_future(key.clone()).unwrap();

        assert!(matches!(
            scheduler.create_future(key.clone()),
            Err(WireError::DuplicateRequest(_))
        ));

        assert_eq!(scheduler.set_result(&key, "first"), Ok(()));
        assert_eq!(scheduler.set_result(&key, "second"), Err("second"));
        assert_eq!(rx.await.unwrap().unwrap(), "first");

        assert_eq!(scheduler.outstanding(), 1);
        scheduler.future_done(&key);
        assert_eq!(scheduler.outstanding(), 0);
        assert!(!scheduler.has_future(&key));
    }

    #[tokio::test]
    async fn unmatched_result_handed_back() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new();
        assert_eq!(scheduler.set_result(&RequestId::Num(9), 5), Err(5));
        assert!(!scheduler.set_exception(&RequestId::Num(9), WireError::Cancelled));
    }

    #[tokio::test]
    async fn run_wait_fut_returns_value_and_cleans_up() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new();
        let key = RequestId::from("k");
        let s = scheduler.clone();
        let k = key.clone();

        let value = scheduler
            .run_wait_fut(key.clone(), || async move {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    let _ = s.set_result(&k, 42);
                });
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(!scheduler.has_future(&key));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn run_wait_fut_propagates_callback_error() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new();
        let err = scheduler
            .run_wait_fut(RequestId::Num(1), || async { Err(WireError::ChannelClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ChannelClosed));
        assert_eq!(scheduler.pending_futures(), 0);
    }

    #[tokio::test]
    async fn cancel_all_futures_fails_waiters() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new();
        let a = scheduler.create_future(RequestId::Num(1)).unwrap();
        let b = scheduler.create_future(RequestId::Num(2)).unwrap();

        scheduler.cancel_all_futures(|| WireError::ConnectionClosed);

        assert!(matches!(a.await.unwrap(), Err(WireError::ConnectionClosed)));
        assert!(matches!(b.await.unwrap(), Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn join_times_out_with_pending_future() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new();
        let _rx = scheduler.create_future(RequestId::Num(1)).unwrap();
        let err = scheduler.join(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_job_runs_until_close() {
        let scheduler: TaskScheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.call_cb_periodic(
            Duration::from_secs(10),
            {
                let runs = runs.clone();
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            },
            "tick",
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.close(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_periodic_runs_first() {
        let scheduler: TaskScheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        scheduler.call_coro_periodic(
            Duration::from_secs(60),
            move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            false,
            true,
            "immediate",
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.close(Duration::from_secs(1)).await.unwrap();
    }
}
