use core::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Identifier of a record in an append-only log: `<millis>-<seq>`.
///
/// Ids are strictly increasing within one stream. Ordering compares the
/// millisecond part first, then the sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// The id that sorts before every real record (`0-0`).
    pub const ZERO: Self = Self { millis: 0, seq: 0 };

    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Returns the smallest id that is strictly greater than `self` and not
    /// earlier than `now_millis`.
    pub const fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::MalformedRecord {
            id: s.to_string(),
            reason: "expected `<millis>-<seq>`".to_string(),
        };
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One record read from a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Returns the value of the first field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Where a consumer-group read starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOffset {
    /// Records never delivered to any member of the group. Every record
    /// returned is added to the reading consumer's pending list.
    NewEntries,
    /// The reading consumer's own pending records with ids strictly greater
    /// than the given id. Use [`EntryId::ZERO`] to start at the earliest.
    After(EntryId),
}

/// Native body of a [`Script`].
pub type ScriptFn = fn(&mut dyn ScriptContext, &[String], &[String]) -> Result<i64>;

/// A server-side script evaluated atomically by the store.
///
/// A script carries two equivalent bodies: the Lua source, for stores that
/// evaluate Lua remotely, and a native function run against a
/// [`ScriptContext`] by stores that live in-process. Either way the store
/// runs the whole body without interleaving other commands.
pub struct Script {
    name: &'static str,
    lua: &'static str,
    body: ScriptFn,
}

impl Script {
    pub const fn new(name: &'static str, lua: &'static str, body: ScriptFn) -> Self {
        Self { name, lua, body }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The Lua source of the script.
    pub const fn lua(&self) -> &'static str {
        self.lua
    }

    /// Runs the native body against `ctx`.
    ///
    /// # Errors
    ///
    /// Propagates any error raised by the context, e.g. a type mismatch.
    pub fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> Result<i64> {
        (self.body)(ctx, keys, args)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// The store commands available to a running [`Script`].
///
/// All calls observe and mutate the same state the script started with; no
/// other client can interleave.
pub trait ScriptContext {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    fn del(&mut self, key: &str) -> Result<bool>;
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;
    fn sadd(&mut self, key: &str, member: &str) -> Result<bool>;
    fn sismember(&mut self, key: &str, member: &str) -> Result<bool>;
    fn xadd(&mut self, stream: &str, fields: Vec<(String, String)>) -> Result<EntryId>;
}

/// The shared key-value store every process talks to.
///
/// Implementations must be safe to share across tasks and processes: every
/// method is one atomic command from the store's point of view.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the string stored at `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` at `key`, replacing any previous value. `None` keeps the
    /// value until it is overwritten or deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Stores `value` at `key` with expiry `ttl` only if `key` is absent.
    /// Returns `true` when the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Removes `key`. Returns `true` when something was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increments the integer at `key` (missing counts as 0) and
    /// returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Evaluates `script` atomically.
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64>;

    /// Creates `group` on `stream`, creating the stream if needed. The group
    /// starts before the first record, so records appended earlier are still
    /// delivered. Returns `false` when the group already exists.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<bool>;

    /// Appends a record to `stream`.
    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId>;

    /// Reads up to `count` records for `consumer` in `group`.
    ///
    /// With [`ReadOffset::NewEntries`] and `block = Some(d)`, waits up to `d`
    /// for a record to be appended when none is available. Pending replays
    /// never block.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledges a delivered record, removing it from the pending list.
    /// Returns `false` when the record was not pending.
    async fn xack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool>;

    /// Returns the number of delivered-but-unacknowledged records in `group`.
    async fn xpending(&self, stream: &str, group: &str) -> Result<usize>;
}
