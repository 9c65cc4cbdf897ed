use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Counters for one rate-limit key. All timestamps are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitEntry {
    pub count: u64,
    pub window_start: i64,
    pub burst_count: u64,
    pub burst_start: i64,
}

impl RateLimitEntry {
    /// Count one request at `now`, rolling either window over first if it has
    /// expired. Rollover and increment happen together, so an entry never
    /// carries a stale window with a non-zero count.
    pub fn record(&mut self, now: i64, window_ms: i64, burst_window_ms: Option<i64>) {
        if self.count == 0 || now - self.window_start >= window_ms {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;

        if let Some(burst_ms) = burst_window_ms {
            if self.burst_count == 0 || now - self.burst_start >= burst_ms {
                self.burst_count = 0;
                self.burst_start = now;
            }
            self.burst_count += 1;
        }
    }

    pub fn is_active(&self, now: i64, window_ms: i64) -> bool {
        now - self.window_start < window_ms
    }

    pub fn is_stale(&self, now: i64, window_ms: i64) -> bool {
        now - self.window_start > window_ms * 2
    }
}

/// Entry counts for the administrative stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub total_entries: usize,
    pub active_entries: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Storage backend for rate-limit entries.
///
/// Backed by process memory by default and by Redis when the gateway runs as
/// several processes that must share budgets.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically record one request for `key` and return the updated entry.
    async fn record(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        burst_window_ms: Option<i64>,
    ) -> Result<RateLimitEntry, StoreError>;

    /// Drop entries whose window is more than twice `window_ms` old.
    async fn sweep(&self, now: i64, window_ms: i64) -> Result<usize, StoreError>;

    async fn stats(&self, now: i64, window_ms: i64) -> Result<StoreStats, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    entries: DashMap<String, Mutex<RateLimitEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn record(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        burst_window_ms: Option<i64>,
    ) -> Result<RateLimitEntry, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            let mut e = entry.lock();
            e.record(now, window_ms, burst_window_ms);
            return Ok(*e);
        }

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(RateLimitEntry::default()));
        let mut e = entry.lock();
        e.record(now, window_ms, burst_window_ms);
        Ok(*e)
    }

    async fn sweep(&self, now: i64, window_ms: i64) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.lock().is_stale(now, window_ms));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn stats(&self, now: i64, window_ms: i64) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            if entry.value().lock().is_active(now, window_ms) {
                stats.active_entries += 1;
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

const KEY_PREFIX: &str = "rt:rl:";

/// Same rollover rules as `RateLimitEntry::record`, executed atomically inside
/// Redis. Keys expire after twice the window, which replaces the sweep.
const RECORD_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local burst_window = tonumber(ARGV[3])
local e = redis.call('HMGET', KEYS[1], 'count', 'window_start', 'burst', 'burst_start')
local count = tonumber(e[1]) or 0
local window_start = tonumber(e[2]) or now
local burst = tonumber(e[3]) or 0
local burst_start = tonumber(e[4]) or now
if count == 0 or now - window_start >= window then
  count = 0
  window_start = now
end
count = count + 1
if burst_window > 0 then
  if burst == 0 or now - burst_start >= burst_window then
    burst = 0
    burst_start = now
  end
  burst = burst + 1
end
redis.call('HSET', KEYS[1], 'count', count, 'window_start', window_start, 'burst', burst, 'burst_start', burst_start)
redis.call('PEXPIRE', KEYS[1], window * 2)
return {count, window_start, burst, burst_start}
"#;

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: redis::Script::new(RECORD_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
        burst_window_ms: Option<i64>,
    ) -> Result<RateLimitEntry, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<i64> = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(now)
            .arg(window_ms)
            .arg(burst_window_ms.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;

        match values.as_slice() {
            [count, window_start, burst, burst_start] => Ok(RateLimitEntry {
                count: (*count).max(0) as u64,
                window_start: *window_start,
                burst_count: (*burst).max(0) as u64,
                burst_start: *burst_start,
            }),
            _ => Err(StoreError::Unavailable(
                "unexpected rate-limit script reply".to_string(),
            )),
        }
    }

    async fn sweep(&self, _now: i64, _window_ms: i64) -> Result<usize, StoreError> {
        // Keys carry a PEXPIRE of twice the window.
        Ok(0)
    }

    async fn stats(&self, now: i64, window_ms: i64) -> Result<StoreStats, StoreError> {
        let mut conn = self.conn.clone();
        let mut stats = StoreStats::default();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.hget(key.as_str(), "window_start");
                }
                let starts: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;
                stats.total_entries += keys.len();
                stats.active_entries += starts
                    .into_iter()
                    .filter(|start| start.is_some_and(|s| now - s < window_ms))
                    .count();
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(stats)
    }
}
