//! Bounded pool of reusable backend connections
//!
//! A [`ResourcePool`] owns at most `capacity` live resources. Callers check a
//! resource out with [`ResourcePool::acquire`], which hands out an idle one,
//! opens a new one through the pool's factory while below capacity, or waits
//! for a release. The returned [`PooledResource`] guard gives the resource
//! back on drop.

use crate::error::KatewayError;
use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A live backend connection managed by a [`ResourcePool`]
pub trait Resource: Send + Sync + 'static {
    /// Pool-unique, monotonically increasing identifier
    fn id(&self) -> u64;

    /// Whether the underlying connection is still usable
    fn is_open(&self) -> bool;

    /// Close the underlying connection. Must be idempotent.
    fn close(&self);
}

type Factory<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Bounded, cancelable pool of [`Resource`]s built from a factory
pub struct ResourcePool<R: Resource> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Resource> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<R: Resource> {
    name: String,
    factory: Factory<R>,
    capacity: usize,
    min_idle: usize,
    idle_timeout: Duration,
    /// One permit per checked-out resource
    slots: Arc<Semaphore>,
    state: Mutex<PoolState<R>>,
    closed: AtomicBool,
    created: AtomicU64,
    waits: AtomicU64,
}

struct PoolState<R> {
    /// Released resources, oldest first
    idle: VecDeque<IdleResource<R>>,
    in_use: HashMap<u64, Arc<R>>,
    /// Idle + checked out + currently being created
    live: usize,
}

struct IdleResource<R> {
    resource: Arc<R>,
    since: Instant,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub waits: u64,
    pub closed: bool,
}

impl<R: Resource> ResourcePool<R> {
    /// Create an empty pool.
    ///
    /// `max_size` bounds the number of live resources. Idle resources older
    /// than `idle_timeout` are closed on the next acquisition, but never below
    /// `min_idle`; a zero `idle_timeout` keeps them until the pool is closed.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        factory: F,
        min_idle: usize,
        max_size: usize,
        idle_timeout: Duration,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let capacity = max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                factory: Box::new(move || factory().boxed()),
                capacity,
                min_idle: min_idle.min(capacity),
                idle_timeout,
                slots: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    live: 0,
                }),
                closed: AtomicBool::new(false),
                created: AtomicU64::new(0),
                waits: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a resource, waiting while the pool is at capacity.
    ///
    /// Returns [`KatewayError::AcquisitionCanceled`] once `cancel` fires.
    /// Factory failures are returned as-is and never retried here.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledResource<R>> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(inner.closed_error());
        }

        if inner.slots.available_permits() == 0 {
            inner.waits.fetch_add(1, Ordering::Relaxed);
            trace!("pool[{}] at capacity, waiting for a release", inner.name);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KatewayError::AcquisitionCanceled),
            permit = inner.slots.clone().acquire_owned() => {
                permit.map_err(|_| inner.closed_error())?
            }
        };

        if self.is_closed() {
            return Err(inner.closed_error());
        }

        if let Some(resource) = inner.take_idle() {
            return Ok(PooledResource::new(resource, inner.clone(), permit));
        }

        // Nothing idle: the slot is reserved until the factory settles
        let reservation = Reservation::new(inner);
        let resource = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KatewayError::AcquisitionCanceled),
            resource = (inner.factory)() => resource?,
        };

        // close_all flips the flag before draining under this lock
        let resource = Arc::new(resource);
        let mut state = inner.state.lock();
        if inner.closed.load(Ordering::Acquire) {
            drop(state);
            resource.close();
            return Err(inner.closed_error());
        }
        state.in_use.insert(resource.id(), resource.clone());
        drop(state);
        reservation.commit();
        inner.created.fetch_add(1, Ordering::Relaxed);
        debug!("pool[{}] opened resource {}", inner.name, resource.id());

        Ok(PooledResource::new(resource, inner.clone(), permit))
    }

    /// [`acquire`](Self::acquire) bounded by a deadline
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledResource<R>> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(timeout, self.acquire(&cancel))
            .await
            .map_err(|_| KatewayError::AcquisitionCanceled)?
    }

    /// Close every tracked resource, idle and checked out, and reset the
    /// counters. The pool rejects all later acquisitions.
    pub fn close_all(&self) -> usize {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        inner.slots.close();

        let mut state = inner.state.lock();
        let mut closed = 0;
        for idle in state.idle.drain(..) {
            idle.resource.close();
            closed += 1;
        }
        for (_, resource) in state.in_use.drain() {
            resource.close();
            closed += 1;
        }
        state.live = 0;
        inner.created.store(0, Ordering::Relaxed);
        inner.waits.store(0, Ordering::Relaxed);

        debug!("pool[{}] closed {} resources", inner.name, closed);
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            name: self.inner.name.clone(),
            capacity: self.inner.capacity,
            live: state.live,
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

impl<R: Resource> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<R: Resource> PoolInner<R> {
    fn closed_error(&self) -> KatewayError {
        KatewayError::PoolClosed {
            pool: self.name.clone(),
        }
    }

    /// Pop the most recently released open resource, evicting expired and
    /// closed ones on the way. Reserves a creation slot when none is left.
    fn take_idle(&self) -> Option<Arc<R>> {
        let mut state = self.state.lock();
        self.evict_expired(&mut state);

        while let Some(idle) = state.idle.pop_back() {
            if idle.resource.is_open() {
                state
                    .in_use
                    .insert(idle.resource.id(), idle.resource.clone());
                return Some(idle.resource);
            }
            state.live = state.live.saturating_sub(1);
        }

        state.live += 1;
        None
    }

    fn evict_expired(&self, state: &mut PoolState<R>) {
        if self.idle_timeout.is_zero() {
            return;
        }

        while state.idle.len() > self.min_idle {
            match state.idle.front() {
                Some(oldest) if oldest.since.elapsed() >= self.idle_timeout => {}
                _ => break,
            }
            if let Some(expired) = state.idle.pop_front() {
                expired.resource.close();
                state.live = state.live.saturating_sub(1);
                trace!(
                    "pool[{}] evicted idle resource {}",
                    self.name,
                    expired.resource.id()
                );
            }
        }
    }

    fn put_back(&self, resource: Arc<R>) {
        let mut state = self.state.lock();
        if state.in_use.remove(&resource.id()).is_none() {
            // Pool was closed while the resource was checked out
            resource.close();
            return;
        }

        if self.closed.load(Ordering::Acquire) || !resource.is_open() {
            resource.close();
            state.live = state.live.saturating_sub(1);
            debug!(
                "pool[{}] discarded closed resource {}",
                self.name,
                resource.id()
            );
            return;
        }

        state.idle.push_back(IdleResource {
            resource,
            since: Instant::now(),
        });
    }
}

/// Creation slot held while the factory runs; released unless committed
struct Reservation<'a, R: Resource> {
    inner: &'a PoolInner<R>,
    armed: bool,
}

impl<'a, R: Resource> Reservation<'a, R> {
    fn new(inner: &'a PoolInner<R>) -> Self {
        Self { inner, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<R: Resource> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.live = state.live.saturating_sub(1);
        }
    }
}

/// A checked-out resource. Dropping it returns the resource to its pool.
pub struct PooledResource<R: Resource> {
    resource: Option<Arc<R>>,
    pool: Arc<PoolInner<R>>,
    // released after the resource is back in the idle set
    _permit: OwnedSemaphorePermit,
}

impl<R: Resource> PooledResource<R> {
    fn new(resource: Arc<R>, pool: Arc<PoolInner<R>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            resource: Some(resource),
            pool,
            _permit: permit,
        }
    }

    /// Give the resource back to its pool
    pub fn release(self) {
        drop(self)
    }

    /// Close the resource and free its slot instead of reusing it
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            resource.close();
            self.pool.put_back(resource);
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl<R: Resource> Deref for PooledResource<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.resource {
            Some(resource) => resource.as_ref(),
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<R: Resource> Drop for PooledResource<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.put_back(resource);
        }
    }
}

impl<R: Resource + fmt::Debug> fmt::Debug for PooledResource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.name)
            .field("resource", &self.resource)
            .finish()
    }
}
