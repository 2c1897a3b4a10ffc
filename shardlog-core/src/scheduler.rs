//! Injectable execution context.
//!
//! The replicated log never spawns threads or timers of its own: every
//! asynchronous step (persistence, dispatch, retries) is a work item handed
//! to a `Scheduler`. The scheduler may run work on any thread; the log
//! serializes its own state internally.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// A unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Handler for a delayed work item. Receives `true` if the item was
/// canceled before firing, so it can clean up instead of running.
pub type DelayedHandler = Box<dyn FnOnce(bool) + Send + 'static>;

/// Cancellable handle to a delayed work item.
///
/// Dropping the handle cancels the timer if it has not fired yet.
/// Cancellation is best-effort: a handle dropped concurrently with firing
/// may still observe the handler run once, uncanceled.
pub struct WorkItemHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WorkItemHandle {
    pub(crate) fn new(cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// Cancels the timer now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Lets the timer fire on its own; the handle no longer cancels on drop.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for WorkItemHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Future returned by `Scheduler::delayed_future`. Resolves when the delay
/// elapses.
pub struct DelayedFuture {
    rx: oneshot::Receiver<()>,
}

impl Future for DelayedFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the scheduler was torn down; resolve rather
        // than hang.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// Execution context for the log's deferred work.
pub trait Scheduler: Send + Sync {
    /// Schedules `work` to run at some future point on the scheduler's own
    /// execution context. Non-blocking.
    fn queue(&self, work: Work);

    /// Schedules `handler` to run after `delay`. `name` identifies the timer
    /// in logs.
    fn queue_delayed(
        &self,
        name: &'static str,
        delay: Duration,
        handler: DelayedHandler,
    ) -> WorkItemHandle;

    /// Future-returning variant of `queue_delayed`. The underlying timer is
    /// detached and always fires.
    fn delayed_future(&self, name: &'static str, delay: Duration) -> DelayedFuture {
        let (tx, rx) = oneshot::channel();
        self.queue_delayed(
            name,
            delay,
            Box::new(move |canceled| {
                if !canceled {
                    let _ = tx.send(());
                }
            }),
        )
        .detach();
        DelayedFuture { rx }
    }
}

/// Production scheduler backed by a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn queue(&self, work: Work) {
        self.handle.spawn(async move { work() });
    }

    fn queue_delayed(
        &self,
        name: &'static str,
        delay: Duration,
        handler: DelayedHandler,
    ) -> WorkItemHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tracing::trace!(name, ?delay, "timer scheduled");

        self.handle.spawn(async move {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => handler(false),
                res = &mut cancel_rx => {
                    if res.is_ok() {
                        tracing::trace!(name, "timer canceled");
                        handler(true);
                    } else {
                        // Handle detached: keep waiting for the deadline.
                        sleep.await;
                        handler(false);
                    }
                }
            }
        });

        WorkItemHandle::new(Box::new(move || {
            let _ = cancel_tx.send(());
        }))
    }
}

/// Deterministic scheduler for tests and simulations.
///
/// Queued work runs only when explicitly drained; delayed items fire only
/// when explicitly told to. This makes replication scenarios single-steppable.
#[derive(Default)]
pub struct DeferredScheduler {
    queued: Mutex<VecDeque<Work>>,
    delayed: Mutex<Vec<DelayedItem>>,
}

struct DelayedItem {
    name: &'static str,
    handler: DelayedHandler,
    canceled: Arc<AtomicBool>,
}

impl DeferredScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued work items, including ones queued while draining, until
    /// the queue is empty. Returns how many ran.
    pub fn run_queued(&self) -> usize {
        let mut ran = 0;
        loop {
            let work = self.queued.lock().pop_front();
            match work {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Fires every pending delayed item, passing its cancellation state.
    /// Returns how many fired uncanceled.
    pub fn fire_delayed(&self) -> usize {
        let items: Vec<DelayedItem> = std::mem::take(&mut *self.delayed.lock());
        let mut fired = 0;
        for item in items {
            let canceled = item.canceled.load(Ordering::Acquire);
            tracing::trace!(name = item.name, canceled, "firing deferred timer");
            (item.handler)(canceled);
            if !canceled {
                fired += 1;
            }
        }
        fired
    }

    /// Number of work items waiting in the immediate queue.
    pub fn queued_len(&self) -> usize {
        self.queued.lock().len()
    }

    /// Number of pending delayed items.
    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().len()
    }
}

impl Scheduler for DeferredScheduler {
    fn queue(&self, work: Work) {
        self.queued.lock().push_back(work);
    }

    fn queue_delayed(
        &self,
        name: &'static str,
        _delay: Duration,
        handler: DelayedHandler,
    ) -> WorkItemHandle {
        let canceled = Arc::new(AtomicBool::new(false));
        self.delayed.lock().push(DelayedItem {
            name,
            handler,
            canceled: canceled.clone(),
        });
        WorkItemHandle::new(Box::new(move || {
            canceled.store(true, Ordering::Release);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_tokio_queue_runs_work() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = oneshot::channel();
        scheduler.queue(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_delayed_fires() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = oneshot::channel();
        scheduler
            .queue_delayed(
                "test-timer",
                Duration::from_millis(100),
                Box::new(move |canceled| {
                    let _ = tx.send(canceled);
                }),
            )
            .detach();

        assert_eq!(rx.await.unwrap(), false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_delayed_cancel_on_drop() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = oneshot::channel();
        let handle = scheduler.queue_delayed(
            "test-timer",
            Duration::from_secs(3600),
            Box::new(move |canceled| {
                let _ = tx.send(canceled);
            }),
        );
        drop(handle);

        assert_eq!(rx.await.unwrap(), true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_delayed_future() {
        let scheduler = TokioScheduler::current();
        scheduler
            .delayed_future("test-future", Duration::from_millis(10))
            .await;
    }

    #[test]
    fn test_deferred_drains_in_order() {
        let scheduler = DeferredScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scheduler.queue(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(scheduler.queued_len(), 3);
        assert_eq!(scheduler.run_queued(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_deferred_runs_requeued_work() {
        let scheduler = Arc::new(DeferredScheduler::new());
        let count = Arc::new(AtomicU32::new(0));

        let s2 = scheduler.clone();
        let c2 = count.clone();
        scheduler.queue(Box::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
            let c3 = c2.clone();
            s2.queue(Box::new(move || {
                c3.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(scheduler.run_queued(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deferred_delayed_cancellation() {
        let scheduler = DeferredScheduler::new();
        let outcome = Arc::new(Mutex::new(None));

        let o2 = outcome.clone();
        let handle = scheduler.queue_delayed(
            "will-cancel",
            Duration::from_millis(1),
            Box::new(move |canceled| {
                *o2.lock() = Some(canceled);
            }),
        );
        handle.cancel();

        // The handler still runs, but observes the cancellation.
        assert_eq!(scheduler.fire_delayed(), 0);
        assert_eq!(*outcome.lock(), Some(true));
    }

    #[test]
    fn test_deferred_detached_timer_fires() {
        let scheduler = DeferredScheduler::new();
        let outcome = Arc::new(Mutex::new(None));

        let o2 = outcome.clone();
        scheduler
            .queue_delayed(
                "detached",
                Duration::from_millis(1),
                Box::new(move |canceled| {
                    *o2.lock() = Some(canceled);
                }),
            )
            .detach();

        assert_eq!(scheduler.fire_delayed(), 1);
        assert_eq!(*outcome.lock(), Some(false));
    }
}
