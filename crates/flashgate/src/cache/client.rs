use core::{fmt, panic::AssertUnwindSafe, time::Duration};
use std::sync::Arc;

use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{CacheConfig, CachedValue, Loader};
use crate::{
    error::{Error, Result},
    lock::DistributedLock,
    pool::{RebuildPool, panic_message},
    store::KvStore,
    time::{SystemClock, TimeSource},
};

/// Value stored for ids the loader reported as missing.
pub const NULL_SENTINEL: &str = "";

/// Builds a cache key: `cache:<entity>:<id>`.
pub fn cache_key(entity: &str, id: impl fmt::Display) -> String {
    format!("cache:{entity}:{id}")
}

/// Maps `cache:<entity>:<id>` to the lock guarding its rebuild,
/// `lock:<entity>:<id>`. Keys outside the `cache:` namespace get a plain
/// `lock:` prefix.
pub fn rebuild_lock_key(cache_key: &str) -> String {
    let rest = cache_key.strip_prefix("cache:").unwrap_or(cache_key);
    format!("lock:{rest}")
}

/// Read-through cache over a [`KvStore`] with two miss strategies.
///
/// - [`get_with_pass_through`]: a miss calls the loader on the caller's path.
///   Missing entities are remembered with an empty sentinel so repeated
///   lookups for ids that never exist stop reaching the source of truth.
/// - [`get_with_logical_expire`]: values carry a logical expiry and never
///   physically expire. A stale hit returns the stale payload at once and
///   hands a rebuild to the [`RebuildPool`]; a per-key lock keeps it to one
///   rebuild at a time.
///
/// Values are JSON-encoded with `serde_json`.
///
/// [`get_with_pass_through`]: CacheClient::get_with_pass_through
/// [`get_with_logical_expire`]: CacheClient::get_with_logical_expire
pub struct CacheClient<S: KvStore, T: TimeSource = SystemClock> {
    store: Arc<S>,
    pool: Arc<RebuildPool>,
    clock: T,
    config: CacheConfig,
}

impl<S: KvStore> CacheClient<S, SystemClock> {
    pub fn new(store: Arc<S>, pool: Arc<RebuildPool>) -> Self {
        Self::with_config(store, pool, SystemClock, CacheConfig::default())
    }
}

impl<S: KvStore, T: TimeSource> CacheClient<S, T> {
    pub fn with_config(store: Arc<S>, pool: Arc<RebuildPool>, clock: T, config: CacheConfig) -> Self {
        Self {
            store,
            pool,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Serializes `value` and stores it with a physical expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the store is unreachable.
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.store.set(key, &payload, Some(ttl)).await
    }

    /// Wraps `value` with `expire_at = now + ttl` and stores it without a
    /// physical expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the store is unreachable.
    pub async fn set_with_logical_expire<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
    ) -> Result<()> {
        let payload = encode_logical(&self.clock, value, ttl)?;
        self.store.set(key, &payload, None).await
    }

    /// Drops `key` so the next read goes to the loader. Call after updating
    /// the source of truth.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.del(key).await
    }

    /// Reads `prefix + id`, loading and caching it on a miss.
    ///
    /// Returns `Ok(None)` both for a cached sentinel (without calling
    /// `loader`) and when `loader` finds nothing, in which case the sentinel
    /// is written with [`CacheConfig::null_ttl`].
    ///
    /// # Errors
    ///
    /// Returns loader errors unchanged, decoding errors for a corrupt cached
    /// payload, and store errors.
    pub async fn get_with_pass_through<ID, V, L>(
        &self,
        prefix: &str,
        id: ID,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<V>>
    where
        ID: fmt::Display + Send + Sync,
        V: Serialize + DeserializeOwned + Send,
        L: Loader<ID, V> + ?Sized,
    {
        let key = format!("{prefix}{id}");
        match self.store.get(&key).await? {
            Some(raw) if raw == NULL_SENTINEL => return Ok(None),
            Some(raw) => return Ok(Some(serde_json::from_str(&raw)?)),
            None => {}
        }

        match loader.load(&id).await? {
            Some(value) => {
                self.set(&key, &value, ttl).await?;
                Ok(Some(value))
            }
            None => {
                self.store
                    .set(&key, NULL_SENTINEL, Some(self.config.null_ttl))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Reads a value written by [`set_with_logical_expire`] without ever
    /// waiting for the loader.
    ///
    /// A miss returns `Ok(None)` and does not call `loader`; keys served this
    /// way are expected to be warmed up front. A fresh hit returns the
    /// payload. A stale hit tries the rebuild lock for the key: the winner
    /// queues one rebuild on the pool, everyone (winner included) gets the
    /// stale payload back straight away. The rebuild writes the fresh value,
    /// or removes the key if the loader no longer finds the entity, and
    /// releases the lock however it ends. If the pool has no room the lock is
    /// released immediately and a later reader tries again.
    ///
    /// # Errors
    ///
    /// Returns decoding errors for a corrupt cached payload and store errors.
    /// Rebuild failures are logged, never returned.
    ///
    /// [`set_with_logical_expire`]: CacheClient::set_with_logical_expire
    pub async fn get_with_logical_expire<ID, V, L>(
        &self,
        prefix: &str,
        id: ID,
        loader: L,
        ttl: Duration,
    ) -> Result<Option<V>>
    where
        ID: fmt::Display + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + 'static,
        L: Loader<ID, V> + 'static,
        T: Clone,
    {
        let key = format!("{prefix}{id}");
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        if raw == NULL_SENTINEL {
            return Ok(None);
        }
        let cached: CachedValue<V> = serde_json::from_str(&raw)?;
        if !cached.is_expired(self.clock.current_millis()) {
            return Ok(Some(cached.data));
        }

        let lock = DistributedLock::new(Arc::clone(&self.store), rebuild_lock_key(&key));
        if !lock.try_acquire(self.config.rebuild_lock_ttl).await? {
            return Ok(Some(cached.data));
        }

        // Someone may have finished a rebuild between our read and the lock.
        if let Some(raw) = self.store.get(&key).await? {
            if let Ok(current) = serde_json::from_str::<CachedValue<V>>(&raw) {
                if !current.is_expired(self.clock.current_millis()) {
                    lock.release().await?;
                    return Ok(Some(current.data));
                }
            }
        }

        let lock = Arc::new(lock);
        let rebuild = Rebuild {
            store: Arc::clone(&self.store),
            clock: self.clock.clone(),
            lock: Arc::clone(&lock),
            key,
            ttl,
        };
        if let Err(_e) = self.pool.spawn(rebuild.run(id, loader)) {
            #[cfg(feature = "tracing")]
            tracing::warn!("Rebuild of `{}` not scheduled: {_e}", lock.key());
            lock.release().await?;
        }
        Ok(Some(cached.data))
    }
}

impl<S: KvStore, T: TimeSource> fmt::Debug for CacheClient<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// One scheduled refresh of a logically expired key. Owns the rebuild lock
/// for as long as it runs.
struct Rebuild<S: KvStore, T> {
    store: Arc<S>,
    clock: T,
    lock: Arc<DistributedLock<S>>,
    key: String,
    ttl: Duration,
}

impl<S: KvStore, T: TimeSource> Rebuild<S, T> {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(key = %self.key)))]
    async fn run<ID, V, L>(self, id: ID, loader: L)
    where
        ID: Send + Sync,
        V: Serialize + Send,
        L: Loader<ID, V>,
    {
        // A panicking loader must not skip the release below.
        let refreshed = AssertUnwindSafe(self.refresh(&id, &loader))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::Loader {
                    context: format!("panicked: {}", panic_message(panic.as_ref())),
                })
            });
        match refreshed {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Rebuilt cache entry");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Cache rebuild failed: {_e}");
            }
        }
        if let Err(_e) = self.lock.release().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Could not release rebuild lock, it will expire: {_e}");
        }
    }

    async fn refresh<ID, V, L>(&self, id: &ID, loader: &L) -> Result<()>
    where
        ID: Send + Sync,
        V: Serialize + Send,
        L: Loader<ID, V>,
    {
        let loaded = loader.load(id).await.map_err(|e| Error::Loader {
            context: e.to_string(),
        })?;
        let Some(value) = loaded else {
            return self.store.del(&self.key).await.map(drop);
        };
        let payload = encode_logical(&self.clock, &value, self.ttl)?;
        self.store.set(&self.key, &payload, None).await
    }
}

fn encode_logical<T: TimeSource, V: Serialize>(clock: &T, value: &V, ttl: Duration) -> Result<String> {
    let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let expire_at = clock.current_millis().saturating_add(ttl_millis);
    Ok(serde_json::to_string(&CachedValue::new(value, expire_at))?)
}
