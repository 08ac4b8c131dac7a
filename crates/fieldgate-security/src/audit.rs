//! Append-only audit log.
//!
//! Every security-relevant action is recorded twice: as a structured
//! tracing event for external log pipelines, and in a bounded in-memory
//! ring the API can page through. Events are immutable once recorded.

use fieldgate_core::AuditEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::info;

const DEFAULT_CAPACITY: usize = 4096;

pub struct AuditLog {
    enabled: bool,
    ring: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(enabled: bool) -> Self {
        Self::with_capacity(enabled, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records an event. A disabled log drops events silently so call
    /// sites stay unconditional.
    pub fn record(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }
        info!(
            target: "fieldgate::audit",
            category = ?event.category,
            actor = %event.actor,
            action = %event.action,
            outcome = ?event.outcome,
            "audit"
        );
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Most recent events, newest first.
    pub fn recent(&self, count: usize) -> Vec<AuditEvent> {
        let ring = self.ring.lock();
        ring.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{AuditCategory, AuditOutcome};

    fn event(action: &str) -> AuditEvent {
        AuditEvent::new(
            AuditCategory::Write,
            "operator-1",
            action,
            AuditOutcome::Success,
        )
    }

    #[test]
    fn events_are_retained_newest_first() {
        let log = AuditLog::new(true);
        log.record(event("first"));
        log.record(event("second"));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "second");
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let log = AuditLog::with_capacity(true, 2);
        log.record(event("a"));
        log.record(event("b"));
        log.record(event("c"));
        assert_eq!(log.len(), 2);
        let actions: Vec<_> = log.recent(10).into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["c", "b"]);
    }

    #[test]
    fn disabled_log_records_nothing() {
        let log = AuditLog::new(false);
        log.record(event("ignored"));
        assert!(log.is_empty());
    }
}
