use core::{fmt, time::Duration};
use std::sync::{Arc, OnceLock};

use portable_atomic::{AtomicU64, Ordering};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    store::{KvStore, Script, ScriptContext},
};

/// Deletes `KEYS[1]` only if it holds `ARGV[1]`. Returns 1 when deleted.
pub static UNLOCK_SCRIPT: Script = Script::new(
    "unlock",
    r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
",
    unlock,
);

fn unlock(ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
    let (Some(key), Some(token)) = (keys.first(), args.first()) else {
        return Err(Error::store("unlock expects KEYS[1] and ARGV[1]"));
    };
    if ctx.get(key)?.as_deref() == Some(token.as_str()) {
        Ok(i64::from(ctx.del(key)?))
    } else {
        Ok(0)
    }
}

static INSTANCE_ID: OnceLock<String> = OnceLock::new();
static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Random identifier of this process, shared by every lock token it issues.
pub fn instance_id() -> &'static str {
    INSTANCE_ID.get_or_init(|| format!("{:032x}", rand::random::<u128>()))
}

/// Builds the lock key for an entity: `lock:<entity>:<id>`.
pub fn lock_key(entity: &str, id: impl fmt::Display) -> String {
    format!("lock:{entity}:{id}")
}

/// A handle on one lock key.
///
/// Every handle carries its own token, `<instance>-<n>`, so two handles for
/// the same key never mistake each other for the owner, whether they live in
/// different processes or in different tasks of the same process.
///
/// Acquisition is a single non-blocking attempt; there is no retry loop and
/// no waiting. Callers decide what contention means for them.
pub struct DistributedLock<S: KvStore> {
    store: Arc<S>,
    key: String,
    token: String,
}

impl<S: KvStore> DistributedLock<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        let holder = NEXT_HOLDER.fetch_add(1, Ordering::Relaxed);
        Self {
            store,
            key: key.into(),
            token: format!("{}-{holder}", instance_id()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Attempts to take the lock for `ttl`. Returns `false` when someone else
    /// holds it (including this handle, if already acquired).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(key = %self.key)))]
    pub async fn try_acquire(&self, ttl: Duration) -> Result<bool> {
        self.store.set_nx(&self.key, &self.token, ttl).await
    }

    /// Like [`Self::try_acquire`] but maps contention to
    /// [`Error::LockUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] if held elsewhere, or a store error.
    pub async fn acquire(&self, ttl: Duration) -> Result<()> {
        if self.try_acquire(ttl).await? {
            Ok(())
        } else {
            Err(Error::LockUnavailable {
                key: self.key.clone(),
            })
        }
    }

    /// Releases the lock if this handle still owns it. Returns `true` when
    /// the key was deleted, `false` when it had expired or belongs to another
    /// holder (in which case it is left untouched).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(key = %self.key)))]
    pub async fn release(&self) -> Result<bool> {
        let code = self
            .store
            .eval(
                &UNLOCK_SCRIPT,
                core::slice::from_ref(&self.key),
                core::slice::from_ref(&self.token),
            )
            .await?;
        Ok(code == 1)
    }
}

impl<S: KvStore> fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}
