//! Deadline coordinator.
//!
//! Every wait with a deadline is registered in one concurrent map. A shared
//! sweep task wakes on a fixed interval and fires the timeout path of every
//! expired wait. The sweep task is started lazily by the first wait and torn
//! down as soon as the map is empty again.
//!
//! A wait ends in exactly one of two ways: completion through its
//! [`WaitHandle`], or expiry by the sweep. Both paths begin by removing the
//! entry from the map; the one that succeeds owns the transition and the
//! other becomes a no-op.

use crate::deadline::Deadline;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval between expiry sweeps in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

type FailSlot<E> = Arc<Mutex<Option<Box<dyn FnOnce(E) + Send>>>>;

type ExpireFn = Box<dyn FnOnce(Duration) + Send>;

struct PendingWait {
    deadline: Deadline,
    started: Deadline,
    // Behind a mutex so the tracked map stays `Sync`.
    expire: Mutex<ExpireFn>,
}

struct Inner {
    config: CoordinatorConfig,
    origin: Instant,
    waits: DashMap<u64, PendingWait>,
    next_id: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

/// Tracks pending waits and fires their timeouts.
///
/// Cloning is cheap; clones share the same tracked set and sweep.
#[derive(Clone)]
pub struct DeadlineCoordinator {
    inner: Arc<Inner>,
}

impl DeadlineCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                origin: Instant::now(),
                waits: DashMap::new(),
                next_id: AtomicU64::new(1),
                sweeper: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Current time on the coordinator's monotonic clock.
    pub fn now(&self) -> Deadline {
        Deadline::from_duration(self.inner.origin.elapsed())
    }

    /// Deadline `timeout` from now.
    pub fn deadline_after(&self, timeout: Duration) -> Deadline {
        self.now().saturating_add(timeout)
    }

    /// Number of waits not yet completed or expired.
    pub fn pending_count(&self) -> usize {
        self.inner.waits.len()
    }

    /// Whether the sweep task is currently running.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Registers a wait that expires at `deadline`.
    ///
    /// If the sweep observes expiry first, `make_timeout` builds the error
    /// handed to `on_fail`. The returned handle completes or fails the wait
    /// explicitly; dropping it leaves the wait armed.
    ///
    /// After [`shutdown`](Self::shutdown) the returned handle is inert.
    pub fn start_wait<E, M, F>(&self, deadline: Deadline, make_timeout: M, on_fail: F) -> WaitHandle<E>
    where
        E: Send + 'static,
        M: FnOnce(Duration) -> E + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: FailSlot<E> = Arc::new(Mutex::new(Some(Box::new(on_fail))));
        let handle = WaitHandle {
            id,
            deadline,
            coordinator: self.clone(),
            on_fail: slot.clone(),
        };

        if self.is_shutdown() {
            tracing::debug!("Coordinator shut down, wait {} is not tracked", id);
            return handle;
        }

        let expire: ExpireFn = Box::new(move |waited: Duration| {
            let err = make_timeout(waited);
            let on_fail = slot.lock().take();
            if let Some(on_fail) = on_fail {
                on_fail(err);
            }
        });
        self.inner.waits.insert(
            id,
            PendingWait {
                deadline,
                started: self.now(),
                expire: Mutex::new(expire),
            },
        );
        tracing::trace!("Wait {} registered (deadline={})", id, deadline);

        self.ensure_sweeper();
        handle
    }

    /// Registers a wait only when `meta` carries a deadline.
    pub fn start_request<E, M, F>(
        &self,
        meta: &RequestMeta<E>,
        make_timeout: M,
        on_timeout: F,
    ) -> Option<WaitHandle<E>>
    where
        E: Send + 'static,
        M: FnOnce(Duration) -> E + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        meta.deadline
            .map(|deadline| self.start_wait(deadline, make_timeout, on_timeout))
    }

    /// Runs `operation(input)` bounded by the deadline in `meta`.
    ///
    /// Without a deadline the operation runs unbounded. When the operation
    /// finishes first its own result is delivered. When the deadline expires
    /// first the operation is dropped and the timeout is handed to the
    /// dispatch continuation in `meta`, if any, or returned directly.
    pub async fn start_operation<I, T, E, Op, Fut, M>(
        &self,
        input: I,
        operation: Op,
        meta: RequestMeta<E>,
        make_timeout: M,
    ) -> Delivery<T, E>
    where
        Op: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Send + 'static,
        M: FnOnce(Duration) -> E + Send + 'static,
    {
        let RequestMeta { deadline, dispatch } = meta;
        let Some(deadline) = deadline else {
            return Delivery::Direct(operation(input).await);
        };

        let (tx, mut rx) = oneshot::channel();
        let handle = self.start_wait(deadline, make_timeout, move |err: E| {
            let _ = tx.send(err);
        });

        let fut = operation(input);
        tokio::pin!(fut);

        let timeout = tokio::select! {
            result = &mut fut => {
                if handle.complete() {
                    return Delivery::Direct(result);
                }
                // Expiry claimed the wait; it delivers unless the wait was
                // dropped by shutdown.
                drop(handle);
                match rx.await {
                    Ok(err) => err,
                    Err(_) => return Delivery::Direct(result),
                }
            }
            expired = &mut rx => match expired {
                Ok(err) => err,
                Err(_) => return Delivery::Direct(fut.await),
            },
        };

        match dispatch {
            Some(dispatch) => {
                dispatch(timeout);
                Delivery::Continued
            }
            None => Delivery::Direct(Err(timeout)),
        }
    }

    /// Fires every wait whose deadline has passed at `now`.
    ///
    /// Returns the number of waits that expired in this pass.
    pub fn sweep(&self, now: Deadline) -> usize {
        let expired: Vec<u64> = self
            .inner
            .waits
            .iter()
            .filter(|entry| entry.deadline.is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut fired = 0;
        for id in expired {
            if let Some((_, wait)) = self.inner.waits.remove(&id) {
                let waited = now.saturating_since(wait.started);
                tracing::debug!("Wait {} expired after {:?}", id, waited);
                (wait.expire.into_inner())(waited);
                fired += 1;
            }
        }

        if fired > 0 {
            self.stop_sweeper_if_idle();
        }
        fired
    }

    /// Stops the sweep and drops every pending wait without firing it.
    ///
    /// Waits registered afterwards are never tracked.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let dropped = self.inner.waits.len();
        self.inner.waits.clear();
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        tracing::info!("Deadline coordinator stopped ({} pending waits dropped)", dropped);
    }

    fn remove(&self, id: u64) -> bool {
        let removed = self.inner.waits.remove(&id).is_some();
        if removed {
            self.stop_sweeper_if_idle();
        }
        removed
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if self.is_shutdown() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let interval = self.inner.config.sweep_interval();
                let inner = Arc::downgrade(&self.inner);
                *sweeper = Some(runtime.spawn(sweep_loop(inner, interval)));
                tracing::debug!("Deadline sweep started (interval={:?})", interval);
            }
            Err(_) => {
                *sweeper = None;
                tracing::warn!("No tokio runtime; deadlines only expire on explicit sweep");
            }
        }
    }

    fn stop_sweeper_if_idle(&self) {
        if !self.inner.waits.is_empty() {
            return;
        }
        let mut sweeper = self.inner.sweeper.lock();
        // A wait may have been registered since the check above.
        if self.inner.waits.is_empty() {
            if let Some(task) = sweeper.take() {
                task.abort();
                tracing::debug!("Deadline sweep stopped, no pending waits");
            }
        }
    }
}

impl fmt::Debug for DeadlineCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineCoordinator")
            .field("pending", &self.pending_count())
            .field("sweep_interval", &self.inner.config.sweep_interval())
            .finish()
    }
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = DeadlineCoordinator { inner };
        coordinator.sweep(coordinator.now());
    }
}

/// Handle to one registered wait.
pub struct WaitHandle<E> {
    id: u64,
    deadline: Deadline,
    coordinator: DeadlineCoordinator,
    on_fail: FailSlot<E>,
}

impl<E> WaitHandle<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Whether the wait is still tracked.
    pub fn is_pending(&self) -> bool {
        self.coordinator.inner.waits.contains_key(&self.id)
    }

    /// Cancels the wait. Returns `false` if expiry got there first.
    pub fn complete(&self) -> bool {
        if !self.coordinator.remove(self.id) {
            return false;
        }
        self.on_fail.lock().take();
        true
    }

    /// Ends the wait with `err` through the failure path.
    ///
    /// Returns `false`, without invoking the failure path, if the wait had
    /// already ended.
    pub fn fail(&self, err: E) -> bool {
        if !self.coordinator.remove(self.id) {
            return false;
        }
        let on_fail = self.on_fail.lock().take();
        if let Some(on_fail) = on_fail {
            on_fail(err);
        }
        true
    }
}

impl<E> fmt::Debug for WaitHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Per-request deadline and optional continuation.
pub struct RequestMeta<E> {
    pub deadline: Option<Deadline>,
    dispatch: Option<Box<dyn FnOnce(E) + Send>>,
}

impl<E> RequestMeta<E> {
    pub fn new() -> Self {
        Self {
            deadline: None,
            dispatch: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Routes timeouts to `dispatch` instead of returning them.
    pub fn with_dispatch(mut self, dispatch: impl FnOnce(E) + Send + 'static) -> Self {
        self.dispatch = Some(Box::new(dispatch));
        self
    }

    pub fn has_dispatch(&self) -> bool {
        self.dispatch.is_some()
    }
}

impl<E> Default for RequestMeta<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for RequestMeta<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMeta")
            .field("deadline", &self.deadline)
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}

/// How the outcome of a bounded operation reached the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T, E> {
    /// The operation's result, or the timeout when no continuation was set.
    Direct(Result<T, E>),
    /// The timeout was handed to the dispatch continuation.
    Continued,
}

impl<T, E> Delivery<T, E> {
    pub fn is_continued(&self) -> bool {
        matches!(self, Delivery::Continued)
    }

    pub fn into_result(self) -> Option<Result<T, E>> {
        match self {
            Delivery::Direct(result) => Some(result),
            Delivery::Continued => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeadlineError;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> DeadlineCoordinator {
        DeadlineCoordinator::new(CoordinatorConfig::default())
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(DeadlineError) + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = fired.clone();
        (fired, move |_err| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_expires_once() {
        let coordinator = coordinator();
        let (fired, on_fail) = counter();
        let handle = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(1)),
            DeadlineError::timeout,
            on_fail,
        );
        assert!(coordinator.is_sweeping());
        assert_eq!(coordinator.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_count(), 0);
        assert!(!coordinator.is_sweeping());

        assert!(!handle.complete());
        assert!(!handle.fail(DeadlineError::timeout(Duration::ZERO)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_wait_never_fires() {
        let coordinator = coordinator();
        let (fired, on_fail) = counter();
        let handle = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(1)),
            DeadlineError::timeout,
            on_fail,
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(handle.is_pending());
        assert!(handle.complete());
        assert!(!coordinator.is_sweeping());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!handle.complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_waited_time() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let _handle = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_millis(700)),
            DeadlineError::timeout,
            move |err| {
                let _ = tx.send(err);
            },
        );

        let DeadlineError::Timeout { waited } = rx.await.unwrap();
        assert!(waited >= Duration::from_millis(700));
        assert!(waited < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_fail() {
        let coordinator = coordinator();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let handle = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(10)),
            |_| "timeout".to_string(),
            move |err: String| {
                *sink.lock() = Some(err);
            },
        );

        assert!(handle.fail("closed".to_string()));
        assert_eq!(seen.lock().as_deref(), Some("closed"));
        assert!(!handle.complete());
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_restarts_after_idle() {
        let coordinator = coordinator();
        let first = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(1)),
            DeadlineError::timeout,
            |_| {},
        );
        assert!(first.complete());
        assert!(!coordinator.is_sweeping());

        let (fired, on_fail) = counter();
        let _second = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(1)),
            DeadlineError::timeout,
            on_fail,
        );
        assert!(coordinator.is_sweeping());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_request_without_deadline() {
        let coordinator = coordinator();
        let meta = RequestMeta::<DeadlineError>::new();
        assert!(coordinator
            .start_request(&meta, DeadlineError::timeout, |_| {})
            .is_none());
        assert_eq!(coordinator.pending_count(), 0);

        let meta = meta.with_deadline(coordinator.deadline_after(Duration::from_secs(1)));
        let handle = coordinator
            .start_request(&meta, DeadlineError::timeout, |_| {})
            .unwrap();
        assert_eq!(coordinator.pending_count(), 1);
        assert!(handle.complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_completes_first() {
        let coordinator = coordinator();
        let meta = RequestMeta::new().with_deadline(coordinator.deadline_after(Duration::from_secs(2)));

        let delivery = coordinator
            .start_operation(
                21u32,
                |n| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, DeadlineError>(n * 2)
                },
                meta,
                DeadlineError::timeout,
            )
            .await;

        assert_eq!(delivery, Delivery::Direct(Ok(42)));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_times_out_directly() {
        let coordinator = coordinator();
        let meta = RequestMeta::new().with_deadline(coordinator.deadline_after(Duration::from_secs(1)));

        let delivery = coordinator
            .start_operation(
                (),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<u32, DeadlineError>(1)
                },
                meta,
                DeadlineError::timeout,
            )
            .await;

        match delivery.into_result() {
            Some(Err(DeadlineError::Timeout { waited })) => {
                assert!(waited >= Duration::from_secs(1))
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_via_dispatch() {
        let coordinator = coordinator();
        let (tx, rx) = oneshot::channel();
        let meta = RequestMeta::new()
            .with_deadline(coordinator.deadline_after(Duration::from_secs(1)))
            .with_dispatch(move |err: DeadlineError| {
                let _ = tx.send(err);
            });
        assert!(meta.has_dispatch());

        let delivery = coordinator
            .start_operation(
                (),
                |_| std::future::pending::<Result<(), DeadlineError>>(),
                meta,
                DeadlineError::timeout,
            )
            .await;

        assert!(delivery.is_continued());
        assert!(matches!(rx.await, Ok(DeadlineError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_without_deadline_is_unbounded() {
        let coordinator = coordinator();
        let delivery = coordinator
            .start_operation(
                (),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err::<(), _>(DeadlineError::timeout(Duration::ZERO))
                },
                RequestMeta::new(),
                DeadlineError::timeout,
            )
            .await;

        assert_eq!(
            delivery,
            Delivery::Direct(Err(DeadlineError::timeout(Duration::ZERO)))
        );
        assert!(!coordinator.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_waits() {
        let coordinator = coordinator();
        let (fired, on_fail) = counter();
        let handle = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_secs(1)),
            DeadlineError::timeout,
            on_fail,
        );

        coordinator.shutdown();
        assert!(coordinator.is_shutdown());
        assert_eq!(coordinator.pending_count(), 0);
        assert!(!coordinator.is_sweeping());
        assert!(!handle.complete());

        let (late_fired, late_on_fail) = counter();
        let late = coordinator.start_wait(
            coordinator.deadline_after(Duration::from_millis(1)),
            DeadlineError::timeout,
            late_on_fail,
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!late.is_pending());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(late_fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_sweep_without_runtime() {
        let coordinator = coordinator();
        let (fired, on_fail) = counter();
        let _early = coordinator.start_wait(Deadline::new(5, 100), DeadlineError::timeout, on_fail);
        let late = coordinator.start_wait(Deadline::new(6, 0), DeadlineError::timeout, |_| {});
        assert!(!coordinator.is_sweeping());

        assert_eq!(coordinator.sweep(Deadline::new(5, 99)), 0);
        assert_eq!(coordinator.sweep(Deadline::new(5, 100)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_count(), 1);
        assert!(late.is_pending());
        assert_eq!(coordinator.sweep(Deadline::new(100, 0)), 1);
    }

    #[test]
    fn test_racing_completion_and_expiry() {
        const WAITS: usize = 500;
        let coordinator = coordinator();
        let fired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WAITS)
            .map(|_| {
                let fired = fired.clone();
                coordinator.start_wait(Deadline::default(), DeadlineError::timeout, move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let completed = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for handle in &handles {
                    if handle.complete() {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
            scope.spawn(|| {
                while coordinator.pending_count() > 0 {
                    coordinator.sweep(Deadline::new(1, 0));
                }
            });
        });

        assert_eq!(
            fired.load(Ordering::SeqCst) + completed.load(Ordering::SeqCst),
            WAITS
        );
        assert_eq!(coordinator.pending_count(), 0);
    }
}
