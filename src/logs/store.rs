/// Bounded in-memory log buffer
///
/// Holds the lines captured while flows run, keyed by (source, variant).
/// Each key keeps at most `max_entries_per_key` lines and lines older than the
/// retention window are swept opportunistically on write.

use crate::config::LogConfig;
use crate::logs::capture::ScopedCapture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one logical log stream
///
/// `source` is normally a flow version id (or `schedule_{id}` for cron runs)
/// and `variant` names the stream: mock, resume, published, a stage name,
/// execution, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    source: String,
    variant: String,
}

impl ExecutionKey {
    pub fn new(source: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            variant: variant.into(),
        }
    }

    /// Log stream of a cron-triggered run
    pub fn schedule(schedule_id: &str) -> Self {
        Self::new(format!("schedule_{}", schedule_id), "execution")
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Name reported in the `function` field of every entry
    pub fn function_name(&self) -> String {
        format!("node_setup_{}_{}", self.source, self.variant)
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.variant)
    }
}

/// One captured line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub function: String,
    /// Milliseconds since epoch, non-decreasing per key
    pub timestamp: i64,
    pub message: String,
    pub variant: String,
}

/// Snapshot of the store for debugging endpoints
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub keys: usize,
    pub total_entries: usize,
    pub last_sweep_ms: i64,
}

#[derive(Debug, Default)]
struct KeyBuffer {
    entries: VecDeque<LogEntry>,
    last_timestamp: i64,
}

#[derive(Debug)]
struct StoreInner {
    buffers: HashMap<ExecutionKey, KeyBuffer>,
    last_sweep_ms: i64,
}

/// Shared log store, constructed once per process and injected where needed
#[derive(Debug)]
pub struct LogStore {
    retention_ms: i64,
    sweep_interval_ms: i64,
    max_entries_per_key: usize,
    inner: Mutex<StoreInner>,
}

impl LogStore {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            retention_ms: secs_to_ms(config.retention_secs),
            sweep_interval_ms: secs_to_ms(config.sweep_interval_secs),
            max_entries_per_key: config.max_entries_per_key.max(1),
            inner: Mutex::new(StoreInner {
                buffers: HashMap::new(),
                last_sweep_ms: now_ms(),
            }),
        }
    }

    /// Open a capture scope that routes output into `key` until dropped
    pub fn begin_capture(self: &Arc<Self>, key: ExecutionKey) -> ScopedCapture {
        ScopedCapture::new(Arc::clone(self), key)
    }

    /// Append a single line under `key`
    pub fn append(&self, key: &ExecutionKey, message: impl Into<String>) {
        self.append_lines_at(key, vec![message.into()], now_ms());
    }

    /// Append several lines atomically, preserving their order
    pub fn append_lines(&self, key: &ExecutionKey, lines: Vec<String>) {
        self.append_lines_at(key, lines, now_ms());
    }

    pub(crate) fn append_lines_at(&self, key: &ExecutionKey, lines: Vec<String>, now: i64) {
        if lines.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let function = key.function_name();
        let buffer = inner.buffers.entry(key.clone()).or_default();
        let timestamp = now.max(buffer.last_timestamp);
        buffer.last_timestamp = timestamp;

        for message in lines {
            buffer.entries.push_back(LogEntry {
                function: function.clone(),
                timestamp,
                message,
                variant: key.variant.clone(),
            });
        }

        while buffer.entries.len() > self.max_entries_per_key {
            buffer.entries.pop_front();
        }

        if now.saturating_sub(inner.last_sweep_ms) >= self.sweep_interval_ms {
            self.sweep(&mut inner, now);
        }
    }

    /// Entries for `key`, ascending by timestamp, optionally only those after `after`
    pub fn read(&self, key: &ExecutionKey, after: Option<i64>) -> Vec<LogEntry> {
        let inner = self.lock();
        inner
            .buffers
            .get(key)
            .map(|buffer| {
                buffer
                    .entries
                    .iter()
                    .filter(|entry| after.map_or(true, |after| entry.timestamp > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries of every variant recorded for `source`, merged and sorted
    pub fn read_source(&self, source: &str, after: Option<i64>) -> Vec<LogEntry> {
        let inner = self.lock();
        let mut entries: Vec<LogEntry> = inner
            .buffers
            .iter()
            .filter(|(key, _)| key.source == source)
            .flat_map(|(_, buffer)| buffer.entries.iter())
            .filter(|entry| after.map_or(true, |after| entry.timestamp > after))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        entries
    }

    /// Drop every entry recorded under `key`
    pub fn clear(&self, key: &ExecutionKey) {
        self.lock().buffers.remove(key);
    }

    /// Drop every variant recorded for `source`, returning the number of entries removed
    pub fn clear_source(&self, source: &str) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        inner.buffers.retain(|key, buffer| {
            if key.source == source {
                removed += buffer.entries.len();
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.lock();
        LogStats {
            keys: inner.buffers.len(),
            total_entries: inner.buffers.values().map(|b| b.entries.len()).sum(),
            last_sweep_ms: inner.last_sweep_ms,
        }
    }

    fn sweep(&self, inner: &mut StoreInner, now: i64) {
        let cutoff = now.saturating_sub(self.retention_ms);
        let mut evicted = 0usize;

        inner.buffers.retain(|_, buffer| {
            let before = buffer.entries.len();
            buffer.entries.retain(|entry| entry.timestamp > cutoff);
            evicted += before - buffer.entries.len();
            !buffer.entries.is_empty()
        });
        inner.last_sweep_ms = now;

        if evicted > 0 {
            tracing::debug!("🧹 Swept {} expired log entries", evicted);
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Out-of-range values clamp to `i64::MAX`
fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .unwrap_or(i64::MAX)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(retention_secs: u64, max: usize, sweep_secs: u64) -> LogStore {
        LogStore::new(&LogConfig {
            retention_secs,
            max_entries_per_key: max,
            sweep_interval_secs: sweep_secs,
        })
    }

    #[test]
    fn read_is_sorted_and_respects_after() {
        let store = store_with(3600, 100, 300);
        let key = ExecutionKey::new("v1", "mock");
        let base = now_ms();

        store.append_lines_at(&key, vec!["first".into()], base);
        store.append_lines_at(&key, vec!["second".into()], base + 10);
        store.append_lines_at(&key, vec!["third".into()], base + 20);

        let all = store.read(&key, None);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let later = store.read(&key, Some(base + 5));
        let messages: Vec<_> = later.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "third"]);
        assert!(later.iter().all(|e| e.timestamp > base + 5));
    }

    #[test]
    fn timestamps_never_go_backwards_within_a_key() {
        let store = store_with(3600, 100, 300);
        let key = ExecutionKey::new("v1", "mock");
        let base = now_ms();

        store.append_lines_at(&key, vec!["a".into()], base + 50);
        store.append_lines_at(&key, vec!["b".into()], base);

        let entries = store.read(&key, None);
        assert_eq!(entries[0].timestamp, base + 50);
        assert_eq!(entries[1].timestamp, base + 50);
        assert_eq!(entries[1].message, "b");
    }

    #[test]
    fn clear_empties_the_key() {
        let store = store_with(3600, 100, 300);
        let key = ExecutionKey::new("v1", "mock");
        store.append(&key, "hello");
        store.clear(&key);
        assert!(store.read(&key, None).is_empty());
    }

    #[test]
    fn per_key_cap_drops_oldest() {
        let store = store_with(3600, 3, 300);
        let key = ExecutionKey::new("v1", "mock");
        for i in 0..5 {
            store.append(&key, format!("line {}", i));
        }

        let messages: Vec<_> = store.read(&key, None).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn retention_sweep_evicts_old_entries_and_empty_keys() {
        let store = store_with(1, 100, 0);
        let stale = ExecutionKey::new("old", "mock");
        let fresh = ExecutionKey::new("new", "mock");
        let base = now_ms();

        store.append_lines_at(&stale, vec!["stale".into()], base);
        store.append_lines_at(&fresh, vec!["fresh".into()], base + 5_000);

        assert!(store.read(&stale, None).is_empty());
        assert_eq!(store.read(&fresh, None).len(), 1);
        assert_eq!(store.stats().keys, 1);
    }

    #[test]
    fn unbounded_retention_keeps_everything() {
        let store = store_with(u64::MAX, 100, 0);
        let key = ExecutionKey::new("v1", "mock");
        let base = now_ms();

        store.append_lines_at(&key, vec!["old".into()], base);
        store.append_lines_at(&key, vec!["new".into()], base + 5_000);

        assert_eq!(store.read(&key, None).len(), 2);
        assert_eq!(secs_to_ms(u64::MAX), i64::MAX);
        assert_eq!(secs_to_ms(3), 3_000);
    }

    #[test]
    fn sweep_is_rate_limited() {
        let store = store_with(1, 100, 300);
        let key = ExecutionKey::new("v1", "mock");
        let base = now_ms();

        store.append_lines_at(&key, vec!["old".into()], base);
        store.append_lines_at(&key, vec!["new".into()], base + 5_000);

        // Less than the sweep interval has passed, so nothing is evicted yet.
        assert_eq!(store.read(&key, None).len(), 2);
    }

    #[test]
    fn read_source_merges_variants() {
        let store = store_with(3600, 100, 300);
        let mock = ExecutionKey::new("v1", "mock");
        let resume = ExecutionKey::new("v1", "resume");
        let other = ExecutionKey::new("v2", "mock");
        let base = now_ms();

        store.append_lines_at(&resume, vec!["resume".into()], base + 20);
        store.append_lines_at(&mock, vec!["mock".into()], base + 10);
        store.append_lines_at(&other, vec!["other".into()], base + 15);

        let merged = store.read_source("v1", None);
        let messages: Vec<_> = merged.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["mock", "resume"]);
        assert_eq!(merged[0].function, "node_setup_v1_mock");
        assert_eq!(merged[1].variant, "resume");

        assert_eq!(store.clear_source("v1"), 2);
        assert!(store.read_source("v1", None).is_empty());
        assert_eq!(store.read(&other, None).len(), 1);
    }

    #[test]
    fn schedule_key_layout() {
        let key = ExecutionKey::schedule("42");
        assert_eq!(key.source(), "schedule_42");
        assert_eq!(key.variant(), "execution");
        assert_eq!(key.function_name(), "node_setup_schedule_42_execution");
    }
}
