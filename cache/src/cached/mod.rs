use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use futures::{future, FutureExt};
use get_size::GetSize;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, warn};

use crate::{
    memman::{Data, MemoryManager, MEMORY_MANAGER},
    outcome::{CacheError, Outcome},
    BoxFut,
};


type Published<T, E> = Result<T, CacheError<E>>;
type Sender<T, E> = broadcast::Sender<Published<T, E>>;

pub(crate) type Producer<T, E> = dyn Fn() -> BoxFut<'static, Result<T, E>> + Send + Sync;
pub(crate) type Retain<T, E> = dyn Fn(&Outcome<T, E>) -> bool + Send + Sync;

/// Memoizes the latest outcome of an async producer.
///
/// At most one producer invocation runs at any time. Every `get()` issued while it runs
/// is handed the outcome of that invocation, and successful values are kept until
/// [`LatestValueCache::clear`]. Failures go to the callers that waited for them and
/// are retried by the next `get()`.
///
/// Handles are cheap to clone and share the same state.
pub struct LatestValueCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    shared: Arc<Shared<T, E>>,
}

struct Shared<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    inner: Mutex<CachedInner<T, E>>,
    producer: Box<Producer<T, E>>,
    retain: Box<Retain<T, E>>,
    /// Runtime the cache was built on, used when `get()` comes from outside any runtime.
    runtime: Option<Handle>,
}

struct CachedInner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    outcome: Outcome<T, E>,
    /// Bumped by every `clear()`. Results of older generations are not stored.
    generation: u64,
    invocations: u64,
    inflight: Option<Inflight<T, E>>,
    /// Waiters for the invocation that starts once a cleared one finishes.
    queued: Option<Arc<Sender<T, E>>>,
}

struct Inflight<T, E> {
    generation: u64,
    // the spawned task owns the strong ref
    tx: Weak<Sender<T, E>>,
}

impl<T, E> CachedInner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn live_inflight(&self) -> Option<(u64, Arc<Sender<T, E>>)> {
        let inflight = self.inflight.as_ref()?;
        inflight
            .tx
            .upgrade()
            .map(|tx| (inflight.generation, tx))
    }
}

impl<T, E> Clone for LatestValueCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> LatestValueCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an empty cache around `producer`. Nothing runs until the first `get()`.
    ///
    /// When built inside a Tokio runtime, the cache remembers it and runs invocations there
    /// even if `get()` is called from a thread without one.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::cache_while(producer, Outcome::<T, E>::is_value)
    }

    /// Like [`LatestValueCache::new`], but a stored outcome answers `get()` only while
    /// `retain` returns true for it.
    ///
    /// `new` retains values only. Retaining errors as well makes `get()` replay the stored
    /// failure instead of retrying. An empty cache is never treated as retained.
    pub fn cache_while<F, Fut, P>(producer: F, retain: P) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(&Outcome<T, E>) -> bool + Send + Sync + 'static,
    {
        Self::from_boxed(
            Box::new(move || -> BoxFut<'static, Result<T, E>> { Box::pin(producer()) }),
            Box::new(retain),
        )
    }

    pub(crate) fn from_boxed(producer: Box<Producer<T, E>>, retain: Box<Retain<T, E>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(CachedInner {
                    outcome: Outcome::Empty,
                    generation: 0,
                    invocations: 0,
                    inflight: None,
                    queued: None,
                }),
                producer,
                retain,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Returns the cached value, or a future resolving to the outcome of the producer
    /// invocation this call started or joined.
    ///
    /// The state transition happens before this returns, not when the future is first
    /// polled. Dropping the future does not cancel the invocation.
    ///
    /// Invocations run on the caller's Tokio runtime, or on the one the cache was built on.
    /// With neither, the returned future fails with [`CacheError::NoRuntime`] and nothing
    /// is started.
    pub fn get(&self) -> BoxFut<'static, Result<T, CacheError<E>>> {
        let rx = {
            // only sync code in this block
            let mut inner = self.shared.inner.lock();

            if let Some(res) = self.shared.retained(&inner) {
                return Box::pin(future::ready(res));
            }

            match inner.live_inflight() {
                Some((generation, tx)) if generation == inner.generation => tx.subscribe(),
                Some((generation, _)) => {
                    debug!(
                        stale = generation,
                        current = inner.generation,
                        "Cleared invocation still running, queueing a fresh one"
                    );
                    inner
                        .queued
                        .get_or_insert_with(|| Arc::new(broadcast::channel(1).0))
                        .subscribe()
                }
                None => {
                    let Some(runtime) = self.shared.runtime() else {
                        warn!("No Tokio runtime to run the producer on");
                        return Box::pin(future::ready(Err(CacheError::NoRuntime)));
                    };
                    // A queue without a live invocation means its predecessor died unpublished.
                    let tx = inner
                        .queued
                        .take()
                        .unwrap_or_else(|| Arc::new(broadcast::channel(1).0));
                    let rx = tx.subscribe();
                    self.shared.launch(&runtime, &mut inner, tx);
                    rx
                }
            }
        };

        // if we reached here, we're waiting for an in-flight request (we weren't
        // able to serve from cache)
        Box::pin(wait(rx))
    }

    /// Joins the running invocation, or returns the retained outcome, without ever starting
    /// the producer. `None` if there is nothing to wait for.
    pub fn attach(&self) -> Option<BoxFut<'static, Result<T, CacheError<E>>>> {
        let inner = self.shared.inner.lock();

        if let Some(res) = self.shared.retained(&inner) {
            return Some(Box::pin(future::ready(res)));
        }

        let rx = match inner.live_inflight() {
            Some((generation, tx)) if generation == inner.generation => tx.subscribe(),
            _ => inner.queued.as_ref()?.subscribe(),
        };
        Some(Box::pin(wait(rx)))
    }

    /// Forgets the stored outcome and returns the value it held, if any.
    ///
    /// A running invocation is not cancelled; its current waiters still get its result,
    /// but the result is not stored and the next `get()` runs the producer again.
    pub fn clear(&self) -> Option<T> {
        self.shared.clear()
    }

    /// True iff a value is stored. Never starts the producer.
    pub fn has_value(&self) -> bool {
        self.shared.inner.lock().outcome.is_value()
    }

    pub fn peek(&self) -> Option<T> {
        self.shared.inner.lock().outcome.value().cloned()
    }

    pub fn outcome(&self) -> Outcome<T, E> {
        self.shared.inner.lock().outcome.clone()
    }

    /// True while an invocation is running or queued to run.
    pub fn is_in_flight(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.live_inflight().is_some() || inner.queued.is_some()
    }

    /// Number of producer invocations started so far.
    pub fn invocations(&self) -> u64 {
        self.shared.inner.lock().invocations
    }
}

impl<T, E> LatestValueCache<T, E>
where
    T: Clone + Send + Sync + GetSize + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a cache and enrolls it in the global [`MEMORY_MANAGER`].
    pub fn new_enrolled<F, Fut>(producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let cached = Self::new(producer);
        cached.enroll(&MEMORY_MANAGER);
        cached
    }

    pub fn enroll(&self, manager: &MemoryManager) {
        let weak: Weak<Shared<T, E>> = Arc::downgrade(&self.shared);
        manager.enroll(weak);
    }
}

impl<T, E> Shared<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn retained(&self, inner: &CachedInner<T, E>) -> Option<Published<T, E>> {
        if inner.outcome.is_empty() || !(self.retain)(&inner.outcome) {
            return None;
        }
        inner.outcome.clone().into_result()
    }

    fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    fn launch(
        self: &Arc<Self>,
        runtime: &Handle,
        inner: &mut CachedInner<T, E>,
        tx: Arc<Sender<T, E>>,
    ) {
        let generation = inner.generation;
        inner.invocations += 1;
        inner.inflight = Some(Inflight {
            generation,
            tx: Arc::downgrade(&tx),
        });
        debug!(generation, invocation = inner.invocations, "Starting producer");

        let shared = self.clone();
        runtime.spawn(async move {
            let res = AssertUnwindSafe(async { (shared.producer)().await })
                .catch_unwind()
                .await;

            let res = match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CacheError::Producer(Arc::new(e))),
                Err(panic) => {
                    let msg = panic_message(&*panic);
                    warn!(generation, panic = %msg, "Producer panicked");
                    Err(CacheError::Panicked(msg))
                }
            };

            shared.complete(generation, tx, res);
        });
    }

    fn complete(self: &Arc<Self>, generation: u64, tx: Arc<Sender<T, E>>, res: Published<T, E>) {
        // only sync code in this block
        let mut inner = self.inner.lock();
        inner.inflight = None;

        if generation == inner.generation {
            inner.outcome = res.clone().into();
        } else {
            debug!(
                stale = generation,
                current = inner.generation,
                "Discarding result of a cleared invocation"
            );
        }

        if let Some(next) = inner.queued.take() {
            // always inside the finishing task, so a runtime is current
            match self.runtime() {
                Some(runtime) => self.launch(&runtime, &mut inner, next),
                None => warn!("No Tokio runtime to run the queued producer on"),
            }
        }

        // Sent under the lock, so nobody can subscribe after this and miss it.
        let _ = tx.send(res);
    }

    fn clear(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        match std::mem::take(&mut inner.outcome) {
            Outcome::Value(v) => Some(v),
            Outcome::Empty | Outcome::Error(_) => None,
        }
    }
}

impl<T, E> Data for Shared<T, E>
where
    T: Clone + Send + Sync + GetSize + 'static,
    E: Send + Sync + 'static,
{
    fn get_size(&self) -> usize {
        self.inner
            .lock()
            .outcome
            .value()
            .map(GetSize::get_size)
            .unwrap_or(0)
    }

    fn has_value(&self) -> bool {
        self.inner.lock().outcome.is_value()
    }

    fn free(&self) -> bool {
        self.clear().is_some()
    }
}

async fn wait<T, E>(mut rx: broadcast::Receiver<Published<T, E>>) -> Published<T, E>
where
    T: Clone,
{
    match rx.recv().await {
        Ok(res) => res,
        Err(broadcast::error::RecvError::Closed) => Err(CacheError::Abandoned),
        Err(broadcast::error::RecvError::Lagged(_)) => {
            unreachable!("an invocation publishes exactly once")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
