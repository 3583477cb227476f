use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// One observation stored under a correlation key. `stored_at` is ingestion
/// wall-clock time, assigned by the store on insert; the window is measured
/// against it, not against the event's own timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct WindowEntry {
    pub fields: Map<String, Value>,
    pub stored_at: DateTime<Utc>,
}

impl WindowEntry {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub key_count: usize,
    pub total_entries: usize,
}

/// In-memory sliding-window state shared by all detection rules.
///
/// A single coarse lock guards the whole map; it is only ever held for the
/// duration of one map operation and never across an await point, so the
/// store stays correct under any number of concurrent callers. Memory is
/// unbounded by design: entries leave only through window eviction or
/// `clear`.
pub struct StateStore {
    inner: Mutex<HashMap<String, Vec<WindowEntry>>>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append `fields` under `key` stamped with the current time, evict
    /// everything older than the window, and return the surviving sequence
    /// in insertion order. Atomic with respect to other callers.
    pub fn append_and_list(
        &self,
        key: &str,
        fields: Map<String, Value>,
        window_seconds: u64,
    ) -> Vec<WindowEntry> {
        let now = Utc::now();
        let cutoff = window_cutoff(now, window_seconds);

        let mut store = self.inner.lock().unwrap();
        let entries = store.entry(key.to_string()).or_default();
        entries.push(WindowEntry {
            fields,
            stored_at: now,
        });
        entries.retain(|e| e.stored_at > cutoff);

        debug!(
            "state updated: key={} events_in_window={} window_seconds={}",
            key,
            entries.len(),
            window_seconds
        );

        entries.clone()
    }

    /// Read the in-window sequence for `key` without mutating it. Same
    /// eviction filter as the write path, so alert generation can assemble
    /// context without double-counting the triggering event.
    pub fn list_in_window(&self, key: &str, window_seconds: u64) -> Vec<WindowEntry> {
        let cutoff = window_cutoff(Utc::now(), window_seconds);
        let store = self.inner.lock().unwrap();
        store
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.stored_at > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count in-window entries for `key`. This is a read path separate from
    /// `append_and_list`: it filters by the cutoff but removes nothing, so
    /// expired entries stay resident until the next write to the key.
    pub fn count(&self, key: &str, window_seconds: u64) -> usize {
        let cutoff = window_cutoff(Utc::now(), window_seconds);
        let store = self.inner.lock().unwrap();
        store
            .get(key)
            .map(|entries| entries.iter().filter(|e| e.stored_at > cutoff).count())
            .unwrap_or(0)
    }

    /// Drop all state for `key`.
    pub fn clear(&self, key: &str) {
        let mut store = self.inner.lock().unwrap();
        store.remove(key);
    }

    pub fn stats(&self) -> StoreStats {
        let store = self.inner.lock().unwrap();
        StoreStats {
            key_count: store.len(),
            total_entries: store.values().map(Vec::len).sum(),
        }
    }

    #[cfg(test)]
    pub fn seed_entry(&self, key: &str, fields: Map<String, Value>, stored_at: DateTime<Utc>) {
        let mut store = self.inner.lock().unwrap();
        store
            .entry(key.to_string())
            .or_default()
            .push(WindowEntry { fields, stored_at });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Oldest `stored_at` still inside the window. Saturates to the beginning of
/// time for windows too large to subtract, which disables eviction rather
/// than overflowing.
fn window_cutoff(now: DateTime<Utc>, window_seconds: u64) -> DateTime<Utc> {
    let seconds = i64::try_from(window_seconds).unwrap_or(i64::MAX);
    ChronoDuration::try_seconds(seconds)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
