//! Time-to-live cache with single-flight background refresh.
//!
//! Readers never wait on the loader. A read that finds the cache empty, or
//! within `refresh_margin` of expiry, starts a refresh unless one is already
//! running, and returns whatever is cached right now.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::metrics;

#[async_trait]
pub trait CacheLoader<T>: Send + Sync {
    async fn load(&self) -> Result<T>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

pub struct RefreshingCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RefreshingCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    name: &'static str,
    entry: RwLock<Option<Arc<CacheEntry<T>>>>,
    refreshing: AtomicBool,
    generation: AtomicU64,
    completed: watch::Sender<u64>,
    loader: Arc<dyn CacheLoader<T>>,
    clock: Arc<dyn Clock>,
    ttl_millis: i64,
    refresh_margin_millis: i64,
}

impl<T> RefreshingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        loader: Arc<dyn CacheLoader<T>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        refresh_margin: Duration,
    ) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name,
                entry: RwLock::new(None),
                refreshing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                completed,
                loader,
                clock,
                ttl_millis: ttl.as_millis() as i64,
                refresh_margin_millis: refresh_margin.as_millis() as i64,
            }),
        }
    }

    /// Returns the cached value, if any, without waiting. Starts a background
    /// refresh when the value is missing or about to expire.
    pub fn get(&self) -> Option<T> {
        let now = self.inner.clock.now_millis();
        let entry = self.inner.entry.read().clone();

        let needs_refresh = match &entry {
            None => true,
            Some(entry) => entry.expires_at - now < self.inner.refresh_margin_millis,
        };
        if needs_refresh {
            self.inner.trigger_refresh();
        }

        entry.filter(|e| !e.is_expired(now)).map(|e| e.value.clone())
    }

    /// Like [`get`](Self::get), but when nothing usable is cached waits for
    /// the in-flight refresh to finish.
    pub async fn wait_for_value(&self) -> Option<T> {
        let mut completed = self.inner.completed.subscribe();
        if let Some(value) = self.get() {
            return Some(value);
        }
        if completed.changed().await.is_err() {
            return None;
        }
        self.peek()
    }

    /// Cached value without triggering a refresh.
    pub fn peek(&self) -> Option<T> {
        let now = self.inner.clock.now_millis();
        let entry = self.inner.entry.read();
        entry
            .as_ref()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    /// Forces a reload. The current value stays readable until the reload
    /// installs its replacement.
    pub fn invalidate(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.trigger_refresh();
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::Acquire)
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn trigger_refresh(self: &Arc<Self>) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move { inner.refresh().await });
                true
            }
            Err(_) => {
                warn!("No async runtime available, not refreshing {} cache", self.name);
                self.refreshing.store(false, Ordering::Release);
                false
            }
        }
    }

    async fn refresh(self: Arc<Self>) {
        let mut generation;
        loop {
            generation = self.generation.load(Ordering::Acquire);
            metrics::record_cache_refresh(self.name);

            match self.loader.load().await {
                Ok(value) => {
                    let expires_at = self.clock.now_millis() + self.ttl_millis;
                    *self.entry.write() = Some(Arc::new(CacheEntry { value, expires_at }));
                    debug!("Refreshed {} cache", self.name);
                }
                Err(e) => {
                    warn!("Could not refresh {} cache: {}", self.name, e);
                }
            }

            if self.generation.load(Ordering::Acquire) == generation {
                break;
            }
            debug!("{} cache invalidated during refresh, loading again", self.name);
        }

        self.refreshing.store(false, Ordering::Release);
        self.completed.send_modify(|n| *n += 1);

        // an invalidation may have lost the race with the flag reset above
        if self.generation.load(Ordering::Acquire) != generation {
            self.trigger_refresh();
        }
    }
}
