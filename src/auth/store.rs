//! Token store - the cache primitive under both credential caches
//!
//! [`TokenStore`] is the plain, lock-free cache: one value, one expiry, one
//! refresh policy. [`SharedTokenStore`] wraps it for concurrent use:
//!
//! - readers take a short `parking_lot` read lock and never see a partially
//!   installed entry (the whole entry is swapped under the write lock);
//! - refreshes are single-flight: the refresh path is serialized by an async
//!   mutex and re-checks validity after acquiring it, so callers that queued
//!   behind a refresh reuse its result, including its failure;
//! - the async mutex also owns the lazily constructed upstream handle, which
//!   survives successful refreshes and is dropped together with the cache on
//!   any failure.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Source of "now" for expiry checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock
#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// When a cached value is considered stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    session_duration: Duration,
    refresh_buffer: Duration,
}

impl RefreshPolicy {
    /// Create a policy; the buffer must be shorter than the session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `refresh_buffer >= session_duration`.
    pub fn new(session_duration: Duration, refresh_buffer: Duration) -> Result<Self> {
        if refresh_buffer >= session_duration {
            return Err(Error::Config(format!(
                "refresh buffer ({}s) must be shorter than session duration ({}s)",
                refresh_buffer.as_secs(),
                session_duration.as_secs()
            )));
        }
        Ok(Self {
            session_duration,
            refresh_buffer,
        })
    }

    /// Lifetime given to values installed with a relative TTL
    #[must_use]
    pub fn session_duration(&self) -> Duration {
        self.session_duration
    }

    /// Safety margin before expiry
    #[must_use]
    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    /// True once `now >= expires_at - refresh_buffer`
    #[must_use]
    pub fn is_stale(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.refresh_buffer) {
            Ok(buffer) => now >= expires_at - buffer,
            Err(_) => true,
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            session_duration: Duration::from_secs(3600),
            refresh_buffer: Duration::from_secs(300),
        }
    }
}

/// A cached value together with its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct CachedEntry<T> {
    /// The cached value
    pub value: T,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Sequence number of the refresh that installed this entry
    pub epoch: u64,
}

impl<T> std::fmt::Debug for CachedEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Cached federated identity token
pub type CachedToken = CachedEntry<String>;

/// How long a freshly fetched value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Relative to the moment it is installed
    After(Duration),
    /// Absolute, as reported by the issuer
    At(DateTime<Utc>),
}

/// Single-value cache with expiry tracking. Not synchronized.
#[derive(Debug, Clone)]
pub struct TokenStore<T> {
    entry: Option<CachedEntry<T>>,
    policy: RefreshPolicy,
    epoch: u64,
}

impl<T: Clone> TokenStore<T> {
    /// Create an empty store
    #[must_use]
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            entry: None,
            policy,
            epoch: 0,
        }
    }

    /// Refresh policy of this store
    #[must_use]
    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Whether a value is cached and not yet inside the refresh buffer
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// [`is_valid`](Self::is_valid) against an explicit instant
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|e| !self.policy.is_stale(e.expires_at, now))
    }

    /// Cached value, without checking validity
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.entry.as_ref().map(|e| e.value.clone())
    }

    /// Cached entry, without checking validity
    #[must_use]
    pub fn entry(&self) -> Option<&CachedEntry<T>> {
        self.entry.as_ref()
    }

    /// Expiry of the cached value
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.entry.as_ref().map(|e| e.expires_at)
    }

    /// Number of values installed so far
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Install a value that expires `ttl` from now
    pub fn set(&mut self, value: T, ttl: Duration) -> &CachedEntry<T> {
        self.set_at(value, ttl, Utc::now())
    }

    /// Install a value that expires `ttl` after `now`
    pub fn set_at(&mut self, value: T, ttl: Duration, now: DateTime<Utc>) -> &CachedEntry<T> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        self.set_until(value, now + ttl)
    }

    /// Install a value with an absolute expiry
    pub fn set_until(&mut self, value: T, expires_at: DateTime<Utc>) -> &CachedEntry<T> {
        self.epoch += 1;
        self.entry.insert(CachedEntry {
            value,
            expires_at,
            epoch: self.epoch,
        })
    }

    /// Drop the cached value
    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// State owned by whoever holds the refresh lock
struct RefreshSlot<H> {
    handle: Option<Arc<H>>,
    last_failure: Option<String>,
}

/// Concurrency-safe token store with single-flight refresh.
///
/// `H` is the long-lived upstream handle constructed on the first refresh.
pub struct SharedTokenStore<T, H> {
    name: &'static str,
    store: RwLock<TokenStore<T>>,
    refresh: tokio::sync::Mutex<RefreshSlot<H>>,
    // Completed refresh attempts, successful or not
    attempts: AtomicU64,
    clock: Clock,
}

impl<T: Clone, H> SharedTokenStore<T, H> {
    /// Create an empty store; `name` labels logs and metrics
    #[must_use]
    pub fn new(name: &'static str, policy: RefreshPolicy, clock: Clock) -> Self {
        Self {
            name,
            store: RwLock::new(TokenStore::new(policy)),
            refresh: tokio::sync::Mutex::new(RefreshSlot {
                handle: None,
                last_failure: None,
            }),
            attempts: AtomicU64::new(0),
            clock,
        }
    }

    /// Current instant according to this store's clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Refresh policy of the underlying store
    #[must_use]
    pub fn policy(&self) -> RefreshPolicy {
        self.store.read().policy()
    }

    /// Whether the cached value is usable right now
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.store.read().is_valid_at(self.now())
    }

    /// The cached entry if it is still valid
    #[must_use]
    pub fn current(&self) -> Option<CachedEntry<T>> {
        let now = self.now();
        let store = self.store.read();
        if store.is_valid_at(now) {
            store.entry().cloned()
        } else {
            None
        }
    }

    /// Number of successful refreshes so far
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.store.read().epoch()
    }

    /// Whether the upstream handle has been constructed
    pub async fn has_handle(&self) -> bool {
        self.refresh.lock().await.handle.is_some()
    }

    /// Drop the cached value and the upstream handle
    pub async fn clear(&self) {
        let mut slot = self.refresh.lock().await;
        self.store.write().clear();
        slot.handle = None;
    }

    /// Return the cached value, refreshing it first if stale.
    ///
    /// `build` constructs the upstream handle when none exists; `fetch` runs
    /// one refresh against it. On any failure the cache and the handle are
    /// both dropped and the error is surfaced as [`Error::Auth`] prefixed
    /// with `failure_context`. Callers that were already waiting on that
    /// refresh receive the same error without calling upstream again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if building the handle or the refresh fails.
    pub async fn get_or_refresh<B, F, Fut>(
        &self,
        failure_context: &str,
        build: B,
        fetch: F,
    ) -> Result<CachedEntry<T>>
    where
        B: FnOnce() -> Result<H>,
        F: FnOnce(Arc<H>) -> Fut,
        Fut: Future<Output = Result<(T, Expiry)>>,
    {
        if let Some(entry) = self.current() {
            debug!(store = self.name, "Cache hit");
            return Ok(entry);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut slot = self.refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(entry) = self.current() {
            debug!(store = self.name, "Cache refreshed by concurrent caller");
            return Ok(entry);
        }
        if self.attempts.load(Ordering::Acquire) != seen
            && let Some(message) = &slot.last_failure
        {
            debug!(store = self.name, "Reusing failure of concurrent refresh");
            return Err(Error::Auth(message.clone()));
        }

        let outcome = match slot.handle.as_ref() {
            Some(handle) => Ok(Arc::clone(handle)),
            None => build().map(|handle| {
                debug!(store = self.name, "Constructed upstream credential handle");
                let handle = Arc::new(handle);
                slot.handle = Some(Arc::clone(&handle));
                handle
            }),
        };

        let outcome = match outcome {
            Ok(handle) => fetch(handle).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok((value, expiry)) => {
                let now = self.now();
                let mut store = self.store.write();
                let entry = match expiry {
                    Expiry::After(ttl) => store.set_at(value, ttl, now),
                    Expiry::At(at) => store.set_until(value, at),
                }
                .clone();
                drop(store);
                slot.last_failure = None;
                self.attempts.fetch_add(1, Ordering::Release);

                telemetry_metrics::counter!(
                    "credential_refresh_total",
                    "store" => self.name,
                    "outcome" => "success"
                )
                .increment(1);
                info!(
                    store = self.name,
                    expires_at = %entry.expires_at,
                    epoch = entry.epoch,
                    "Refreshed cached credential"
                );
                Ok(entry)
            }
            Err(e) => {
                self.store.write().clear();
                slot.handle = None;

                telemetry_metrics::counter!(
                    "credential_refresh_total",
                    "store" => self.name,
                    "outcome" => "failure"
                )
                .increment(1);
                warn!(store = self.name, error = %e, "Refresh failed, cache cleared");
                let message = match e {
                    Error::Auth(message) => message,
                    other => format!("{failure_context}: {other}"),
                };
                slot.last_failure = Some(message.clone());
                self.attempts.fetch_add(1, Ordering::Release);
                Err(Error::Auth(message))
            }
        }
    }
}
