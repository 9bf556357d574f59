//! Generic pre-warmed object pool (§4.4). `SimpleObjectPool<F>` holds the idle/in-use
//! bookkeeping and the background maintenance loop; `F: ObjectFactory` supplies the
//! only code that is allowed to talk to the backing collaborator.
//!
//! Invariant enforced throughout: `idle.len() + in_use.len() + in_flight_dispose <=
//! capacity`, tracked by handing out one [`tokio::sync::Semaphore`] permit per
//! resource that exists anywhere in that set, released only once the resource is
//! fully disposed of. The pool's own mutex never stays locked across an `.await` on
//! the factory — every factory call happens with the lock dropped.

use crate::error::{PoolError, Result};
use crate::queue::{PoolItem, PriorityQueue};
use crate::types::NetworkResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ObjectFactory: Send + Sync {
    type Resource: NetworkResource + Clone + Send + Sync + 'static;

    /// Create one resource, optionally pinned to a specific address (§4.9 static IP
    /// path reuses this with `Some`). Once started this call always runs to
    /// completion and its result is always placed in the pool — it does not observe
    /// cancellation (§5).
    async fn create(&self, preferred_id: Option<String>) -> Result<Self::Resource>;
    async fn dispose(&self, resource: Self::Resource) -> Result<()>;
}

struct PoolState<R> {
    idle: PriorityQueue<R>,
    in_use: HashMap<String, R>,
}

/// Result of `Stat(id)` (§4.4): where a resource currently lives, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Idle,
    InUse(String),
    NotFound,
}

/// How long a released resource stays reserved for the pod that last held it before
/// it becomes eligible for ordinary eviction (§4.5).
pub const DEFAULT_IP_STICK_DURATION: Duration = Duration::from_secs(0);

pub struct SimpleObjectPool<F: ObjectFactory> {
    factory: Arc<F>,
    capacity: usize,
    min_idle: usize,
    max_idle: usize,
    maintenance_interval: Duration,
    state: Mutex<PoolState<F::Resource>>,
    tokens: Semaphore,
    in_flight_dispose: AtomicUsize,
    wake: Notify,
}

impl<F: ObjectFactory + 'static> SimpleObjectPool<F> {
    /// `min_idle <= max_idle <= capacity` is a construction-time invariant (§4.4);
    /// violating it is a configuration error, not a runtime one. Construction then
    /// preloads the idle set up to `min_idle` synchronously, before returning —
    /// a factory outage at start-up aborts construction instead of surfacing later
    /// as an empty pool under load.
    pub async fn new(factory: Arc<F>, capacity: usize, min_idle: usize, max_idle: usize) -> Result<Arc<Self>> {
        if min_idle > max_idle || max_idle > capacity {
            return Err(PoolError::InvalidArguments(format!(
                "pool bounds must satisfy min_idle <= max_idle <= capacity, got {min_idle} <= {max_idle} <= {capacity}"
            )));
        }

        let pool = Arc::new(Self {
            factory,
            capacity,
            min_idle,
            max_idle,
            maintenance_interval: Duration::from_secs(60),
            state: Mutex::new(PoolState {
                idle: PriorityQueue::new(),
                in_use: HashMap::new(),
            }),
            tokens: Semaphore::new(capacity),
            in_flight_dispose: AtomicUsize::new(0),
            wake: Notify::new(),
        });

        for _ in 0..min_idle {
            let resource = pool.factory.create(None).await?;
            let permit = pool
                .tokens
                .try_acquire()
                .expect("capacity >= min_idle reserves room for preload");
            permit.forget();
            let mut state = pool.state.lock().await;
            state.idle.push(PoolItem::new(resource, Instant::now()));
        }

        Ok(pool)
    }

    /// Seed the pool with resources the reconciler found already allocated on the
    /// SDN, bypassing the factory and the token budget check (the slot was already
    /// spent before this process started). `in_use` resources are keyed by the pod
    /// id the reconciler attributed them to.
    pub async fn seed(&self, idle: Vec<F::Resource>, in_use: Vec<(String, F::Resource)>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        for r in idle {
            state.idle.push(PoolItem::new(r, now));
        }
        for (owner, r) in in_use {
            state.in_use.insert(owner, r);
        }
        let spent = state.idle.size() + state.in_use.len();
        drop(state);
        for _ in 0..spent.min(self.capacity) {
            // Permits were implicitly allocated by seeding; acquire_many would be
            // cleaner but the semaphore has no peek, so drain one at a time.
            if self.tokens.try_acquire().is_err() {
                break;
            }
        }
    }

    /// Spawn the maintenance loop (eviction + refill). Runs until `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.maintenance_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("pool maintenance loop shutting down");
                        return;
                    }
                    _ = interval.tick() => {}
                    _ = pool.wake.notified() => {}
                }
                pool.check_idle().await;
                pool.check_insufficient().await;
            }
        })
    }

    /// Acquire a resource, preferring `preferred_id` (IP stickiness, §4.5) if it is
    /// currently idle. `owner` is the pod key used to track in-use ownership.
    pub async fn acquire(
        &self,
        owner: String,
        preferred_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<F::Resource> {
        {
            let mut state = self.state.lock().await;
            // A retried allocation for a pod that's already holding a resource
            // (e.g. a redelivered CNI ADD) is idempotent — hand back what it
            // already has instead of minting a second one under the same key,
            // which would orphan the first with no permit ever returned for it.
            if let Some(existing) = state.in_use.get(&owner) {
                return Ok(existing.clone());
            }
            if let Some(id) = preferred_id {
                if let Some(item) = state.idle.extract_by_id(id) {
                    state.in_use.insert(owner, item.resource.clone());
                    return Ok(item.resource);
                }
            } else if let Some(item) = state.idle.pop() {
                state.in_use.insert(owner, item.resource.clone());
                return Ok(item.resource);
            }
        }

        // A permit mirrors a slot in capacity − (idle + in_use + in_flight_dispose).
        // If none is free and nothing is currently being disposed of, no permit is
        // coming without outside help (a release) — fail fast rather than block
        // forever (§4.4, scenario 2). If a dispose is in flight, its permit will
        // land shortly, so it's worth waiting for — racing against cancellation.
        match self.tokens.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) if self.in_flight_dispose.load(Ordering::SeqCst) == 0 => {
                return Err(PoolError::NoAvailableResource);
            }
            Err(_) => {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::ContextDone),
                    res = self.tokens.acquire() => res.expect("semaphore never closed"),
                };
                permit.forget();
            }
        }

        match self.factory.create(preferred_id.map(str::to_string)).await {
            Ok(resource) => {
                let mut state = self.state.lock().await;
                if let Some(existing) = state.in_use.get(&owner) {
                    // Lost a race with a concurrent acquire for the same owner
                    // while the factory call was in flight. Keep the winner's
                    // resource in use and hand this one straight back to idle
                    // rather than overwrite the map entry and leak it.
                    let existing = existing.clone();
                    state.idle.push(PoolItem::new(resource, Instant::now()));
                    return Ok(existing);
                }
                state.in_use.insert(owner, resource.clone());
                Ok(resource)
            }
            Err(e) => {
                self.tokens.add_permits(1);
                Err(e)
            }
        }
    }

    /// Return a resource the caller is done with. `sticky_for` reserves it for
    /// `owner` to reclaim via `preferred_id` within that window.
    pub async fn release(&self, owner: &str, sticky_for: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = state.in_use.remove(owner).ok_or(PoolError::NotFound)?;
        state
            .idle
            .push(PoolItem::new(resource, Instant::now() + sticky_for));
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn in_use_count(&self) -> usize {
        self.state.lock().await.in_use.len()
    }

    pub async fn in_use_get(&self, owner: &str) -> Option<F::Resource> {
        self.state.lock().await.in_use.get(owner).cloned()
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.size()
    }

    /// Where resource `id` currently lives, if anywhere (§4.5 static-IP path,
    /// §4.5 GarbageCollection). Bypasses the token budget — it's read-only.
    pub async fn stat(&self, id: &str) -> ResourceStatus {
        let state = self.state.lock().await;
        if state.idle.find(id).is_some() {
            return ResourceStatus::Idle;
        }
        for (owner, resource) in state.in_use.iter() {
            if resource.resource_id() == id {
                return ResourceStatus::InUse(owner.clone());
            }
        }
        ResourceStatus::NotFound
    }

    /// Place an externally-sourced resource straight into idle, bypassing the
    /// factory and the token budget (the slot was already spent before this call —
    /// the static-IP path's newly-discovered port, or the initializer's seed).
    pub async fn add_idle(&self, resource: F::Resource) {
        let mut state = self.state.lock().await;
        state.idle.push(PoolItem::new(resource, Instant::now()));
    }

    /// Evict idle resources past their stick window down to `max_idle` (or further,
    /// if idle+in_use together exceed capacity). Factory disposal happens with the
    /// pool lock released. An item whose stick window hasn't lapsed yet is never
    /// evicted, even if that leaves idle above budget (§4.4).
    async fn check_idle(&self) {
        let now = Instant::now();
        loop {
            let popped = {
                let mut state = self.state.lock().await;
                let idle_len = state.idle.size();
                let over_budget =
                    idle_len > self.max_idle || (idle_len > 0 && idle_len + state.in_use.len() > self.capacity);
                if !over_budget {
                    return;
                }
                match state.idle.peek() {
                    Some(item) if item.release_after <= now => Some(state.idle.pop().unwrap().resource),
                    _ => None,
                }
            };
            let Some(resource) = popped else {
                // Stickiness wins: the heap-min item isn't due yet, so nothing older
                // can be either.
                return;
            };

            self.in_flight_dispose.fetch_add(1, Ordering::SeqCst);
            let id = resource.resource_id().to_string();
            let to_retry = resource.clone();
            let disposed = self.factory.dispose(resource).await;
            self.in_flight_dispose.fetch_sub(1, Ordering::SeqCst);

            match disposed {
                Ok(()) => self.tokens.add_permits(1),
                Err(e) => {
                    // No token refund: the resource is still alive, just not disposed
                    // of yet. Put it back and stop this pass; the next tick retries.
                    tracing::warn!(resource_id = %id, error = %e, "failed to dispose idle resource, retrying next pass");
                    let mut state = self.state.lock().await;
                    state.idle.push(PoolItem::new(to_retry, now));
                    return;
                }
            }
        }
    }

    /// Top the idle pool back up to `min_idle` if the budget allows it.
    async fn check_insufficient(&self) {
        loop {
            let idle_len = self.state.lock().await.idle.size();
            if idle_len >= self.min_idle {
                return;
            }
            let permit = match self.tokens.try_acquire() {
                Ok(p) => p,
                Err(_) => {
                    tracing::debug!("pool at capacity, cannot refill idle set");
                    return;
                }
            };
            permit.forget();

            match self.factory.create(None).await {
                Ok(resource) => {
                    let mut state = self.state.lock().await;
                    state.idle.push(PoolItem::new(resource, Instant::now()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to refill idle pool");
                    self.tokens.add_permits(1);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[derive(Debug, Clone)]
    struct TestResource {
        id: String,
    }

    impl NetworkResource for TestResource {
        fn resource_id(&self) -> &str {
            &self.id
        }
        fn resource_type(&self) -> &'static str {
            "test"
        }
        fn ip_address(&self) -> &str {
            &self.id
        }
    }

    struct CountingFactory {
        next: Counter,
        disposed: std::sync::Mutex<Vec<String>>,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                next: Counter::new(0),
                disposed: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectFactory for CountingFactory {
        type Resource = TestResource;

        async fn create(&self, preferred_id: Option<String>) -> Result<TestResource> {
            let id = preferred_id
                .unwrap_or_else(|| format!("res-{}", self.next.fetch_add(1, Ordering::SeqCst)));
            Ok(TestResource { id })
        }

        async fn dispose(&self, resource: TestResource) -> Result<()> {
            self.disposed.lock().unwrap().push(resource.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn construction_rejects_out_of_order_bounds() {
        let err = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 3, 2).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidArguments(_)));

        let err = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 2, 0, 3).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn construction_preloads_min_idle_before_returning() {
        let factory = Arc::new(CountingFactory::new());
        let pool = SimpleObjectPool::new(factory.clone(), 4, 2, 2).await.unwrap();
        assert_eq!(pool.idle_count().await, 2);
        assert_eq!(pool.in_use_count().await, 0);
    }

    struct FailingFactory;

    #[async_trait]
    impl ObjectFactory for FailingFactory {
        type Resource = TestResource;

        async fn create(&self, _preferred_id: Option<String>) -> Result<TestResource> {
            Err(PoolError::Factory(anyhow::anyhow!("sdn endpoint unreachable")))
        }

        async fn dispose(&self, _resource: TestResource) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn construction_aborts_when_preload_fails() {
        let err = SimpleObjectPool::new(Arc::new(FailingFactory), 4, 2, 2).await.unwrap_err();
        assert!(matches!(err, PoolError::Factory(_)));
    }

    #[tokio::test]
    async fn acquire_creates_when_idle_is_empty() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let cancel = CancellationToken::new();
        let r = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        assert_eq!(r.id, "res-0");
        assert_eq!(pool.in_use_count().await, 1);
    }

    #[tokio::test]
    async fn acquire_reuses_a_released_resource() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let cancel = CancellationToken::new();
        let r = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        let id = r.id.clone();
        pool.release("pod-a", Duration::from_secs(0)).await.unwrap();
        assert_eq!(pool.idle_count().await, 1);

        let r2 = pool.acquire("pod-b".into(), None, &cancel).await.unwrap();
        assert_eq!(r2.id, id);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn acquire_twice_under_the_same_owner_without_releasing_is_idempotent() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let cancel = CancellationToken::new();
        let r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        let r2 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        assert_eq!(r1.id, r2.id);
        assert_eq!(pool.in_use_count().await, 1);
    }

    #[tokio::test]
    async fn acquire_honors_a_preferred_id_when_idle() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let cancel = CancellationToken::new();
        let r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        let r1_id = r1.id.clone();
        pool.release("pod-a", Duration::from_secs(60)).await.unwrap();

        // A different pod asking for r1's id by preference reclaims that exact
        // resource instead of getting a fresh one.
        let reclaimed = pool
            .acquire("pod-b".into(), Some(&r1_id), &cancel)
            .await
            .unwrap();
        assert_eq!(reclaimed.id, r1_id);
    }

    #[tokio::test]
    async fn acquire_returns_no_available_resource_at_capacity_with_nothing_in_flight() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 1, 0, 1).await.unwrap();
        let cancel = CancellationToken::new();
        let _r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();

        let err = pool.acquire("pod-b".into(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableResource));
    }

    #[tokio::test]
    async fn acquire_honors_cancellation_while_waiting_for_a_token() {
        // in_flight_dispose is nonzero only mid check_idle; exercise the waiting
        // branch directly by bumping it, since nothing else can race it in a test.
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 1, 0, 1).await.unwrap();
        let cancel = CancellationToken::new();
        let _r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        pool.in_flight_dispose.fetch_add(1, Ordering::SeqCst);

        cancel.cancel();
        let err = pool.acquire("pod-b".into(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::ContextDone));
    }

    #[tokio::test]
    async fn release_of_unknown_owner_is_not_found() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let err = pool.release("nobody", Duration::from_secs(0)).await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound));
    }

    #[tokio::test]
    async fn check_idle_evicts_below_the_stick_window_but_keeps_max_idle() {
        let factory = Arc::new(CountingFactory::new());
        let pool = SimpleObjectPool::new(factory.clone(), 4, 0, 1).await.unwrap();
        let cancel = CancellationToken::new();

        let r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        let r2 = pool.acquire("pod-b".into(), None, &cancel).await.unwrap();
        pool.release("pod-a", Duration::from_secs(0)).await.unwrap();
        pool.release("pod-b", Duration::from_secs(0)).await.unwrap();
        assert_eq!(pool.idle_count().await, 2);

        pool.check_idle().await;
        // max_idle=1 keeps one of them warm even though both are past their window.
        assert_eq!(pool.idle_count().await, 1);
        assert_eq!(factory.disposed.lock().unwrap().len(), 1);
        let _ = (r1, r2);
    }

    #[tokio::test]
    async fn stat_reports_idle_in_use_or_not_found() {
        let pool = SimpleObjectPool::new(Arc::new(CountingFactory::new()), 4, 0, 2).await.unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(pool.stat("res-0").await, ResourceStatus::NotFound));

        let r = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        assert!(matches!(pool.stat(&r.id).await, ResourceStatus::InUse(owner) if owner == "pod-a"));

        pool.release("pod-a", Duration::from_secs(0)).await.unwrap();
        assert!(matches!(pool.stat(&r.id).await, ResourceStatus::Idle));
    }

    struct FailDisposeOnceFactory {
        inner: CountingFactory,
        fail_next_dispose: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ObjectFactory for FailDisposeOnceFactory {
        type Resource = TestResource;

        async fn create(&self, preferred_id: Option<String>) -> Result<TestResource> {
            self.inner.create(preferred_id).await
        }

        async fn dispose(&self, resource: TestResource) -> Result<()> {
            if self
                .fail_next_dispose
                .swap(false, Ordering::SeqCst)
            {
                return Err(PoolError::Factory(anyhow::anyhow!("simulated dispose failure")));
            }
            self.inner.dispose(resource).await
        }
    }

    #[tokio::test]
    async fn check_idle_retries_and_stops_the_pass_on_a_dispose_failure() {
        let factory = Arc::new(FailDisposeOnceFactory {
            inner: CountingFactory::new(),
            fail_next_dispose: std::sync::atomic::AtomicBool::new(true),
        });
        let pool = SimpleObjectPool::new(factory.clone(), 4, 0, 0).await.unwrap();
        let cancel = CancellationToken::new();

        let _r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        let _r2 = pool.acquire("pod-b".into(), None, &cancel).await.unwrap();
        pool.release("pod-a", Duration::from_secs(0)).await.unwrap();
        pool.release("pod-b", Duration::from_secs(0)).await.unwrap();

        pool.check_idle().await;
        // The first dispose attempt failed and was pushed back; the pass stopped
        // there rather than trying the second item too.
        assert_eq!(pool.idle_count().await, 2);
        assert!(factory.inner.disposed.lock().unwrap().is_empty());

        pool.check_idle().await;
        // The retried dispose now succeeds, and the second item is evicted too.
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(factory.inner.disposed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn check_idle_never_evicts_an_item_still_inside_its_stick_window() {
        let factory = Arc::new(CountingFactory::new());
        let pool = SimpleObjectPool::new(factory.clone(), 4, 0, 0).await.unwrap();
        let cancel = CancellationToken::new();

        let _r1 = pool.acquire("pod-a".into(), None, &cancel).await.unwrap();
        pool.release("pod-a", Duration::from_secs(60)).await.unwrap();

        pool.check_idle().await;
        assert_eq!(pool.idle_count().await, 1);
        assert!(factory.disposed.lock().unwrap().is_empty());
    }
}
