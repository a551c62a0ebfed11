//! Membership event recorder.
//!
//! Subscribed to the database client for the whole run, so scenarios can
//! assert on how peers observed joins, leaves and status changes.

use chrono::{DateTime, Utc};
use faultline_core::{DatabaseStatus, LeaveKind, MembershipListener, NodeId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// What an observer saw happen to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MembershipEventKind {
    /// The node started joining
    Joining,
    /// The node became a full member
    Joined,
    /// The node left
    Left(LeaveKind),
    /// The status of a database on the node changed
    StatusChanged {
        /// Database name
        database: String,
        /// New status
        status: DatabaseStatus,
    },
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipEvent {
    /// Wall-clock time of the callback
    pub at: DateTime<Utc>,
    /// Node reporting the event
    pub observer: NodeId,
    /// Node the event is about
    pub node: NodeId,
    /// Event
    pub kind: MembershipEventKind,
}

/// Bounded, thread-safe log of membership callbacks.
#[derive(Debug)]
pub struct MembershipRecorder {
    events: Mutex<VecDeque<MembershipEvent>>,
    max_events: usize,
}

impl MembershipRecorder {
    /// Create a recorder keeping the last 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Create a recorder with a custom capacity.
    pub fn with_capacity(max_events: usize) -> Self {
        Self { events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))), max_events }
    }

    fn record(&self, observer: &NodeId, node: &NodeId, kind: MembershipEventKind) {
        debug!(%observer, %node, ?kind, "Membership event");
        let mut events = self.events.lock();
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(MembershipEvent {
            at: Utc::now(),
            observer: observer.clone(),
            node: node.clone(),
            kind,
        });
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<MembershipEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events about `node`.
    pub fn events_about(&self, node: &NodeId) -> Vec<MembershipEvent> {
        self.events.lock().iter().filter(|event| &event.node == node).cloned().collect()
    }

    /// Leave kinds observed for `node`, oldest first, by any observer.
    pub fn leaves_of(&self, node: &NodeId) -> Vec<LeaveKind> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.node == node)
            .filter_map(|event| match event.kind {
                MembershipEventKind::Left(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Whether `observer` saw `node` leave with `kind`.
    pub fn saw_leave(&self, observer: &NodeId, node: &NodeId, kind: LeaveKind) -> bool {
        self.events.lock().iter().any(|event| {
            &event.observer == observer
                && &event.node == node
                && event.kind == MembershipEventKind::Left(kind)
        })
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forget every event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for MembershipRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipListener for MembershipRecorder {
    fn on_node_joining(&self, observer: &NodeId, node: &NodeId) {
        self.record(observer, node, MembershipEventKind::Joining);
    }

    fn on_node_joined(&self, observer: &NodeId, node: &NodeId) {
        self.record(observer, node, MembershipEventKind::Joined);
    }

    fn on_node_left(&self, observer: &NodeId, node: &NodeId, kind: LeaveKind) {
        self.record(observer, node, MembershipEventKind::Left(kind));
    }

    fn on_database_status_changed(
        &self,
        observer: &NodeId,
        node: &NodeId,
        database: &str,
        status: DatabaseStatus,
    ) {
        self.record(
            observer,
            node,
            MembershipEventKind::StatusChanged { database: database.to_string(), status },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_filters() {
        let recorder = MembershipRecorder::new();
        let a = NodeId::from_ordinal(0);
        let b = NodeId::from_ordinal(1);

        recorder.on_node_joining(&a, &b);
        recorder.on_node_joined(&a, &b);
        recorder.on_node_left(&a, &b, LeaveKind::Graceful);
        recorder.on_database_status_changed(&a, &b, "ledger", DatabaseStatus::NotAvailable);
        recorder.on_node_left(&b, &a, LeaveKind::Failed);

        assert_eq!(recorder.len(), 5);
        assert_eq!(recorder.events_about(&b).len(), 4);
        assert_eq!(recorder.leaves_of(&b), vec![LeaveKind::Graceful]);
        assert!(recorder.saw_leave(&a, &b, LeaveKind::Graceful));
        assert!(!recorder.saw_leave(&a, &b, LeaveKind::Failed));
        assert!(recorder.saw_leave(&b, &a, LeaveKind::Failed));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let recorder = MembershipRecorder::with_capacity(2);
        let a = NodeId::from_ordinal(0);
        for ordinal in 1..=3 {
            recorder.on_node_joined(&a, &NodeId::from_ordinal(ordinal));
        }
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node, NodeId::from_ordinal(2));
    }
}
