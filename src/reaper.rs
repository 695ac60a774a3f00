//! TTL reaper: deletes bot-produced messages after their declared retention,
//! across restarts when the SQLite tier is in use.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::store::{Store, StoreError, TrackedMessage};

/// Performs the platform-side deletion. Failures are swallowed by the
/// reaper; the entry is removed either way.
#[async_trait]
pub trait MessageDeleter: Send + Sync {
    async fn delete_message(&self, entry: &TrackedMessage) -> anyhow::Result<()>;
}

/// Default deleter when no adapter is wired in: log and move on.
pub struct LoggingDeleter;

#[async_trait]
impl MessageDeleter for LoggingDeleter {
    async fn delete_message(&self, entry: &TrackedMessage) -> anyhow::Result<()> {
        tracing::info!(
            platform = %entry.platform,
            chat_id = %entry.chat_id,
            message_id = %entry.message_id,
            "message ttl expired"
        );
        Ok(())
    }
}

/// Storage tier for tracked messages. The SQLite tier survives restarts;
/// the memory tier does not and says so at construction.
pub trait ReaperStore: Send + Sync {
    fn insert(&self, entry: &TrackedMessage) -> Result<(), StoreError>;
    fn expired(&self, now: i64) -> Result<Vec<TrackedMessage>, StoreError>;
    fn all(&self) -> Result<Vec<TrackedMessage>, StoreError>;
    fn remove(&self, entry: &TrackedMessage) -> Result<(), StoreError>;
}

pub struct SqliteReaperStore {
    store: Arc<Store>,
}

impl SqliteReaperStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl ReaperStore for SqliteReaperStore {
    fn insert(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        self.store.insert_tracked_message(entry)
    }

    fn expired(&self, now: i64) -> Result<Vec<TrackedMessage>, StoreError> {
        self.store.expired_tracked_messages(now)
    }

    fn all(&self) -> Result<Vec<TrackedMessage>, StoreError> {
        self.store.all_tracked_messages()
    }

    fn remove(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        self.store.remove_tracked_message(entry)
    }
}

/// In-memory tier. Keyed by `(delete_at, platform, chat_id, message_id)` so
/// deadline range scans are ordered like the SQLite secondary index.
#[derive(Default)]
pub struct MemoryReaperStore {
    entries: Mutex<BTreeMap<(i64, String, String, String), TrackedMessage>>,
}

impl MemoryReaperStore {
    pub fn new() -> Self {
        tracing::warn!("no durable store available, tracked messages will not survive restart");
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<(i64, String, String, String), TrackedMessage>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(entry: &TrackedMessage) -> (i64, String, String, String) {
        (
            entry.delete_at,
            entry.platform.clone(),
            entry.chat_id.clone(),
            entry.message_id.clone(),
        )
    }
}

impl ReaperStore for MemoryReaperStore {
    fn insert(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        let mut entries = self.entries();
        // Re-tracking the same message replaces its deadline.
        entries.retain(|_, e| {
            !(e.platform == entry.platform
                && e.chat_id == entry.chat_id
                && e.message_id == entry.message_id)
        });
        entries.insert(Self::key(entry), entry.clone());
        Ok(())
    }

    fn expired(&self, now: i64) -> Result<Vec<TrackedMessage>, StoreError> {
        Ok(self
            .entries()
            .values()
            .take_while(|e| e.delete_at <= now)
            .cloned()
            .collect())
    }

    fn all(&self) -> Result<Vec<TrackedMessage>, StoreError> {
        Ok(self.entries().values().cloned().collect())
    }

    fn remove(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        self.entries().remove(&Self::key(entry));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrackMessageRequest {
    pub platform: String,
    pub chat_id: String,
    pub message_id: String,
    pub ttl_seconds: i64,
    /// Wall clock override for tests; defaults to now.
    pub now: Option<i64>,
}

pub struct TtlReaper {
    store: Box<dyn ReaperStore>,
    wakeup: Arc<Notify>,
}

impl TtlReaper {
    pub fn new(store: Box<dyn ReaperStore>) -> Self {
        Self { store, wakeup: Arc::new(Notify::new()) }
    }

    /// Record a message for deletion at `now + ttl`. A non-positive ttl is a
    /// no-op; returns whether the message was tracked. When called inside a
    /// runtime, arms a best-effort wakeup at the deadline.
    pub fn track_message(&self, req: TrackMessageRequest) -> Result<bool, StoreError> {
        if req.ttl_seconds <= 0 {
            return Ok(false);
        }
        let now = req.now.unwrap_or_else(now_ms);
        let entry = TrackedMessage {
            platform: req.platform,
            chat_id: req.chat_id,
            message_id: req.message_id,
            delete_at: now + req.ttl_seconds * 1000,
        };
        self.store.insert(&entry)?;
        tracing::debug!(
            platform = %entry.platform,
            chat_id = %entry.chat_id,
            message_id = %entry.message_id,
            delete_at = entry.delete_at,
            "tracking message ttl"
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let wakeup = self.wakeup.clone();
            let delay = Duration::from_millis((entry.delete_at - now).max(0) as u64);
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                wakeup.notify_one();
            });
        }
        Ok(true)
    }

    /// Delete every entry whose deadline has passed. Returns how many
    /// entries were handled (and removed).
    pub async fn cleanup_expired(
        &self,
        deleter: &dyn MessageDeleter,
        now: Option<i64>,
    ) -> Result<usize, StoreError> {
        let now = now.unwrap_or_else(now_ms);
        let due = self.store.expired(now)?;
        let count = due.len();
        for entry in due {
            if let Err(e) = deleter.delete_message(&entry).await {
                tracing::warn!(
                    chat_id = %entry.chat_id,
                    message_id = %entry.message_id,
                    error = %e,
                    "message deletion failed, dropping entry anyway"
                );
            }
            self.store.remove(&entry)?;
        }
        Ok(count)
    }

    /// Flush every entry regardless of deadline. Run at startup so messages
    /// whose deadlines passed while the process was down still get deleted.
    pub async fn cleanup_all(&self, deleter: &dyn MessageDeleter) -> Result<usize, StoreError> {
        let entries = self.store.all()?;
        let count = entries.len();
        for entry in entries {
            if let Err(e) = deleter.delete_message(&entry).await {
                tracing::warn!(
                    chat_id = %entry.chat_id,
                    message_id = %entry.message_id,
                    error = %e,
                    "message deletion failed, dropping entry anyway"
                );
            }
            self.store.remove(&entry)?;
        }
        Ok(count)
    }

    /// Sweep loop: wakes on the coarse interval or an armed deadline,
    /// whichever comes first. Errors are logged and swallowed.
    pub async fn run_loop(self: Arc<Self>, deleter: Arc<dyn MessageDeleter>, interval: Duration) {
        tracing::info!(interval_secs = interval.as_secs(), "ttl reaper loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wakeup.notified() => {}
            }
            match self.cleanup_expired(deleter.as_ref(), None).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, "reaped expired messages"),
                Err(e) => tracing::error!(error = %e, "reaper sweep failed"),
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingDeleter {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingDeleter {
        fn new(fail: bool) -> Self {
            Self { seen: Mutex::new(Vec::new()), fail }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageDeleter for RecordingDeleter {
        async fn delete_message(&self, entry: &TrackedMessage) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(entry.message_id.clone());
            if self.fail {
                anyhow::bail!("platform says no");
            }
            Ok(())
        }
    }

    fn track(reaper: &TtlReaper, message_id: &str, ttl_seconds: i64, now: i64) -> bool {
        reaper
            .track_message(TrackMessageRequest {
                platform: "telegram".into(),
                chat_id: "1".into(),
                message_id: message_id.into(),
                ttl_seconds,
                now: Some(now),
            })
            .unwrap()
    }

    fn reapers() -> Vec<TtlReaper> {
        vec![
            TtlReaper::new(Box::new(MemoryReaperStore::default())),
            TtlReaper::new(Box::new(SqliteReaperStore::new(Arc::new(
                Store::open(crate::store::MEMORY_DB).unwrap(),
            )))),
        ]
    }

    #[tokio::test]
    async fn expired_entries_fire_exactly_once() {
        for reaper in reapers() {
            assert!(track(&reaper, "201", 1, 1000));
            assert!(track(&reaper, "202", 5, 1000));

            let deleter = RecordingDeleter::new(false);

            // Before any deadline: nothing fires.
            assert_eq!(reaper.cleanup_expired(&deleter, Some(1500)).await.unwrap(), 0);

            // 201's deadline (2000) has passed at 2500; 202's (6000) has not.
            assert_eq!(reaper.cleanup_expired(&deleter, Some(2500)).await.unwrap(), 1);
            assert_eq!(deleter.seen(), vec!["201".to_string()]);

            // 201 is gone; a second sweep finds nothing.
            assert_eq!(reaper.cleanup_expired(&deleter, Some(2500)).await.unwrap(), 0);

            // Startup flush covers the survivor.
            assert_eq!(reaper.cleanup_all(&deleter).await.unwrap(), 1);
            assert_eq!(deleter.seen(), vec!["201".to_string(), "202".to_string()]);
        }
    }

    #[tokio::test]
    async fn non_positive_ttl_is_a_noop() {
        for reaper in reapers() {
            assert!(!track(&reaper, "x", 0, 1000));
            assert!(!track(&reaper, "y", -5, 1000));
            let deleter = RecordingDeleter::new(false);
            assert_eq!(reaper.cleanup_all(&deleter).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn deleter_failure_still_removes_the_entry() {
        for reaper in reapers() {
            track(&reaper, "201", 1, 1000);
            let deleter = RecordingDeleter::new(true);
            assert_eq!(reaper.cleanup_expired(&deleter, Some(5000)).await.unwrap(), 1);
            // Entry was dropped despite the failure.
            assert_eq!(reaper.cleanup_all(&deleter).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn retracking_replaces_the_deadline() {
        for reaper in reapers() {
            track(&reaper, "201", 1, 1000);
            track(&reaper, "201", 60, 1000);
            let deleter = RecordingDeleter::new(false);
            // Old deadline no longer applies.
            assert_eq!(reaper.cleanup_expired(&deleter, Some(3000)).await.unwrap(), 0);
            assert_eq!(reaper.cleanup_all(&deleter).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn sqlite_tier_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reaper.db");
        let path_str = path.to_str().unwrap();

        {
            let store = Arc::new(Store::open(path_str).unwrap());
            let reaper = TtlReaper::new(Box::new(SqliteReaperStore::new(store)));
            track(&reaper, "persisted", 60, 1000);
        }

        let store = Arc::new(Store::open(path_str).unwrap());
        let reaper = TtlReaper::new(Box::new(SqliteReaperStore::new(store)));
        let deleter = RecordingDeleter::new(false);
        assert_eq!(reaper.cleanup_all(&deleter).await.unwrap(), 1);
        assert_eq!(deleter.seen(), vec!["persisted".to_string()]);
    }
}
