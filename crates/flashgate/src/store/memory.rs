use core::time::Duration;
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    store::{EntryId, KvStore, ReadOffset, Script, ScriptContext, StreamEntry},
    time::{SystemClock, TimeSource},
};

/// A complete in-process [`KvStore`].
///
/// All state sits behind one mutex, which is what makes every command and
/// every [`Script`] atomic: a script body runs while the lock is held, so no
/// other command can observe or interleave with its intermediate state. The
/// lock is never held across an `.await`.
///
/// Physical expiry is lazy: an expired key is dropped the next time it is
/// touched. Blocked consumer-group reads are woken whenever a record is
/// appended, including appends made from inside a script.
///
/// Cloning is not supported; share it behind an [`Arc`](std::sync::Arc) so
/// all handles see the same state.
pub struct MemoryStore<T: TimeSource = SystemClock> {
    state: Mutex<State>,
    appended: Notify,
    clock: T,
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> MemoryStore<T> {
    /// Creates an empty store whose TTLs and record ids follow `clock`.
    pub fn with_clock(clock: T) -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            clock,
        }
    }

    /// Returns the clock this store uses for expiry.
    pub fn clock(&self) -> &T {
        &self.clock
    }

    /// Returns the number of live (unexpired) keys, streams excluded.
    pub fn len(&self) -> usize {
        let now = self.clock.current_millis();
        let state = self.state.lock();
        state
            .keys
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of records ever appended to `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    fn read_group_now(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut batch = Vec::new();
        match offset {
            ReadOffset::NewEntries => {
                let fresh = entries
                    .range((
                        core::ops::Bound::Excluded(group_state.last_delivered),
                        core::ops::Bound::Unbounded,
                    ))
                    .take(count);
                for (id, fields) in fresh {
                    group_state.pending.insert(*id, consumer.to_string());
                    group_state.last_delivered = *id;
                    batch.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
            }
            ReadOffset::After(after) => {
                let replay = group_state
                    .pending
                    .range((
                        core::ops::Bound::Excluded(after),
                        core::ops::Bound::Unbounded,
                    ))
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .take(count);
                for (id, _) in replay {
                    if let Some(fields) = entries.get(id) {
                        batch.push(StreamEntry {
                            id: *id,
                            fields: fields.clone(),
                        });
                    }
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl<T: TimeSource> KvStore for MemoryStore<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.current_millis();
        let mut state = self.state.lock();
        state.view(now).get(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.current_millis();
        let mut state = self.state.lock();
        state.view(now).set(key, value.to_string(), ttl)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.current_millis();
        let mut state = self.state.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.view(now).set(key, value.to_string(), Some(ttl))?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = self.clock.current_millis();
        let mut state = self.state.lock();
        state.view(now).del(key)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.current_millis();
        let mut state = self.state.lock();
        state.view(now).incr_by(key, 1)
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(script = script.name())))]
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64> {
        let now = self.clock.current_millis();
        let (code, appended) = {
            let mut state = self.state.lock();
            let mut view = state.view(now);
            let code = script.run(&mut view, keys, args)?;
            (code, view.appended)
        };
        if appended {
            self.appended.notify_waiters();
        }
        Ok(code)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(false);
        }
        // New groups start before the first record, like `0`.
        stream_state.groups.insert(
            group.to_string(),
            Group {
                last_delivered: EntryId::ZERO,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId> {
        let now = self.clock.current_millis();
        let id = {
            let mut state = self.state.lock();
            state.view(now).xadd(stream, fields.to_vec())?
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = block.map(|b| tokio::time::Instant::now() + b);
        loop {
            // Register interest before checking, so an append that lands
            // between the check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_group_now(stream, group, consumer, offset, count)?;
            if !batch.is_empty() || offset != ReadOffset::NewEntries {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        let mut state = self.state.lock();
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(group_state.pending.remove(&id).is_some())
    }

    async fn xpending(&self, stream: &str, group: &str) -> Result<usize> {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| no_group(stream, group))
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::store(format!("NOGROUP no group `{group}` on stream `{stream}`"))
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Entry>,
    streams: HashMap<String, Stream>,
}

impl State {
    fn view(&mut self, now: u64) -> StateView<'_> {
        StateView {
            state: self,
            now,
            appended: false,
        }
    }

    /// Returns the live entry at `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        if self.keys.get(key).is_some_and(|e| e.is_expired(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Vec<(String, String)>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

struct Group {
    last_delivered: EntryId,
    /// Delivered, unacknowledged records and the consumer that owns each.
    pending: BTreeMap<EntryId, String>,
}

/// Mutable view of the locked state at one instant. Commands and scripts
/// both go through it.
struct StateView<'a> {
    state: &'a mut State,
    now: u64,
    appended: bool,
}

impl ScriptContext for StateView<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.state.live(key, self.now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Error::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| {
            let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            self.now.saturating_add(ttl_millis)
        });
        self.state.keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<bool> {
        let existed = self.state.live(key, self.now).is_some();
        self.state.keys.remove(key);
        Ok(existed)
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let now = self.now;
        match self.state.live(key, now) {
            None => {
                self.state.keys.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let current: i64 = s.parse().map_err(|_| {
                    Error::store(format!("value at `{key}` is not an integer"))
                })?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| Error::store(format!("increment at `{key}` overflows")))?;
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => Err(Error::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn sadd(&mut self, key: &str, member: &str) -> Result<bool> {
        let now = self.now;
        match self.state.live(key, now) {
            None => {
                let mut set = HashSet::new();
                set.insert(member.to_string());
                self.state.keys.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(set),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.insert(member.to_string())),
            Some(_) => Err(Error::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        match self.state.live(key, self.now) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(Error::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn xadd(&mut self, stream: &str, fields: Vec<(String, String)>) -> Result<EntryId> {
        let stream_state = self.state.streams.entry(stream.to_string()).or_default();
        let id = stream_state.last_id.successor(self.now);
        stream_state.entries.insert(id, fields);
        stream_state.last_id = id;
        self.appended = true;
        Ok(id)
    }
}
