//! Resilient outbound buffer.
//!
//! A bounded FIFO that absorbs tag updates when the downstream sink is slow
//! or absent. At capacity the oldest unacknowledged entry is evicted; the
//! newest entry is always admitted. `drain` hands out entries without
//! removing them; removal only happens on `acknowledge`, so a crash
//! between the two causes redelivery, never loss.
//!
//! When a persistence path is configured the queue is mirrored to a JSON
//! lines file on a timer and on shutdown, and reloaded on startup with
//! expired entries dropped. The queue lock is never held across disk I/O:
//! persistence snapshots under the lock and writes outside it.

use chrono::{DateTime, Utc};
use fieldgate_core::config::BufferSettings;
use fieldgate_core::{GatewayError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One queued outbound record. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BufferedMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
        self
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Bounded, optionally disk-backed FIFO queue.
pub struct ResilientBuffer {
    queue: Mutex<VecDeque<BufferedMessage>>,
    capacity: usize,
    persist_path: Option<PathBuf>,
    evictions: AtomicU64,
}

impl ResilientBuffer {
    /// Builds the buffer from settings, reloading persisted entries when a
    /// path is configured.
    pub fn from_settings(settings: &BufferSettings) -> Self {
        let persist_path = settings.persist_path.as_ref().map(PathBuf::from);
        let queue = match &persist_path {
            Some(path) if path.exists() => {
                let loaded = Self::load(path, settings.capacity);
                info!(entries = loaded.len(), path = %path.display(), "Reloaded persisted buffer");
                loaded
            }
            _ => VecDeque::new(),
        };
        Self {
            queue: Mutex::new(queue),
            capacity: settings.capacity,
            persist_path,
            evictions: AtomicU64::new(0),
        }
    }

    /// In-memory variant with the identical contract and no persistence.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            persist_path: None,
            evictions: AtomicU64::new(0),
        }
    }

    /// Enqueues a message, evicting the oldest entry if at capacity.
    /// Rejects only messages that are already expired.
    pub fn add(&self, message: BufferedMessage) -> Result<()> {
        if message.expired(Utc::now()) {
            return Err(GatewayError::Internal(
                "refusing to enqueue an already-expired message".to_string(),
            ));
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        Ok(())
    }

    /// Returns up to `max` oldest entries without removing them.
    pub fn drain(&self, max: usize) -> Vec<BufferedMessage> {
        let queue = self.queue.lock();
        queue.iter().take(max).cloned().collect()
    }

    /// Removes delivered entries. Returns how many were found and removed.
    pub fn acknowledge(&self, ids: &[Uuid]) -> usize {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|m| !wanted.contains(&m.id));
        before - queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Mirrors the queue to disk. Best-effort on the timer path: failures
    /// are logged by the persistence task, not fatal.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        // Snapshot under the lock, write outside it.
        let snapshot: Vec<BufferedMessage> = {
            let queue = self.queue.lock();
            queue.iter().cloned().collect()
        };

        let tmp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        for message in &snapshot {
            let line = serde_json::to_string(message)
                .map_err(|e| GatewayError::Internal(format!("buffer serialization: {e}")))?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        debug!(entries = snapshot.len(), path = %path.display(), "Buffer persisted");
        Ok(())
    }

    fn load(path: &Path, capacity: usize) -> VecDeque<BufferedMessage> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read persisted buffer");
                return VecDeque::new();
            }
        };
        let now = Utc::now();
        let mut queue = VecDeque::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<BufferedMessage>(line) {
                Ok(message) if message.expired(now) => {}
                Ok(message) => queue.push_back(message),
                Err(e) => warn!(error = %e, "Skipping corrupt persisted buffer entry"),
            }
        }
        // Oldest entries beyond capacity would be evicted first anyway.
        while queue.len() > capacity {
            queue.pop_front();
        }
        queue
    }

    /// Spawns the periodic persistence task. Cancellation triggers one
    /// final flush before the task exits, so shutdown never races the
    /// timer.
    pub fn spawn_persistence(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            if buffer.persist_path.is_none() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = buffer.persist() {
                            warn!(error = %e, "Final buffer flush failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.persist() {
                            warn!(error = %e, "Periodic buffer persistence failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(n: u64) -> BufferedMessage {
        BufferedMessage::new(json!({ "seq": n }))
    }

    #[test]
    fn add_evicts_oldest_at_capacity() {
        let buffer = ResilientBuffer::in_memory(3);
        let messages: Vec<_> = (1..=4).map(message).collect();
        for m in &messages {
            buffer.add(m.clone()).unwrap();
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.evictions(), 1);
        let queued = buffer.drain(10);
        let ids: Vec<_> = queued.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![messages[1].id, messages[2].id, messages[3].id]);
    }

    #[test]
    fn drain_does_not_remove_and_acknowledge_does() {
        let buffer = ResilientBuffer::in_memory(3);
        let messages: Vec<_> = (1..=4).map(message).collect();
        for m in &messages {
            buffer.add(m.clone()).unwrap();
        }

        let drained = buffer.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, messages[1].id);
        assert_eq!(drained[1].id, messages[2].id);
        assert_eq!(buffer.len(), 3);

        assert_eq!(buffer.acknowledge(&[messages[1].id]), 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let buffer = ResilientBuffer::in_memory(100);
        for n in 0..10 {
            buffer.add(message(n)).unwrap();
        }
        let sequence: Vec<u64> = buffer
            .drain(100)
            .iter()
            .map(|m| m.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(sequence, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn expired_message_rejected_on_add() {
        let buffer = ResilientBuffer::in_memory(10);
        let mut m = message(1);
        m.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(buffer.add(m).is_err());
    }

    #[test]
    fn persist_and_reload_preserves_content_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let settings = BufferSettings {
            capacity: 100,
            persist_path: Some(path.to_string_lossy().into_owned()),
            persist_interval_secs: 30,
        };

        let buffer = ResilientBuffer::from_settings(&settings);
        let messages: Vec<_> = (0..5).map(message).collect();
        for m in &messages {
            buffer.add(m.clone()).unwrap();
        }
        buffer.persist().unwrap();

        // Simulated restart.
        let reloaded = ResilientBuffer::from_settings(&settings);
        let recovered = reloaded.drain(100);
        assert_eq!(recovered, messages);
    }

    #[test]
    fn reload_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let settings = BufferSettings {
            capacity: 100,
            persist_path: Some(path.to_string_lossy().into_owned()),
            persist_interval_secs: 30,
        };

        let buffer = ResilientBuffer::from_settings(&settings);
        buffer.add(message(1)).unwrap();
        let short_lived = message(2).with_expiry(Duration::from_millis(10));
        buffer.add(short_lived).unwrap();
        buffer.persist().unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let reloaded = ResilientBuffer::from_settings(&settings);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.drain(10)[0].payload["seq"], 1);
    }

    #[test]
    fn corrupt_lines_are_skipped_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let settings = BufferSettings {
            capacity: 100,
            persist_path: Some(path.to_string_lossy().into_owned()),
            persist_interval_secs: 30,
        };

        let buffer = ResilientBuffer::from_settings(&settings);
        buffer.add(message(1)).unwrap();
        buffer.persist().unwrap();
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        std::fs::write(&path, contents).unwrap();

        let reloaded = ResilientBuffer::from_settings(&settings);
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn persistence_task_flushes_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let settings = BufferSettings {
            capacity: 100,
            persist_path: Some(path.to_string_lossy().into_owned()),
            persist_interval_secs: 3600,
        };

        let buffer = Arc::new(ResilientBuffer::from_settings(&settings));
        let token = CancellationToken::new();
        let task = buffer.spawn_persistence(Duration::from_secs(3600), token.clone());

        buffer.add(message(7)).unwrap();
        token.cancel();
        task.await.unwrap();

        let reloaded = ResilientBuffer::from_settings(&settings);
        assert_eq!(reloaded.len(), 1);
    }
}
