// Ops activity feed
// Bounded in-process ring of operator-visible events, newest kept.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use utoipa::ToSchema;

/// Events retained before the oldest are dropped
pub const MAX_EVENTS: usize = 250;

/// One entry in the activity feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub at_utc: DateTime<Utc>,
    /// Who produced the event, e.g. `OPS`
    pub source: String,
    pub message: String,
}

/// Bounded activity log shared by the ops routes
#[derive(Debug)]
pub struct OpsActivityLog {
    events: Mutex<VecDeque<ActivityEvent>>,
    capacity: usize,
}

impl Default for OpsActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an event, trimming the oldest past capacity
    pub fn add(&self, source: impl Into<String>, message: impl Into<String>) {
        let event = ActivityEvent {
            at_utc: Utc::now(),
            source: source.into(),
            message: message.into(),
        };

        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// The newest `take` events, oldest first
    pub fn latest(&self, take: usize) -> Vec<ActivityEvent> {
        let events = self.events.lock();
        let start = events.len().saturating_sub(take);
        events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_returns_newest_in_order() {
        let log = OpsActivityLog::new();
        for i in 0..5 {
            log.add("OPS", format!("event {i}"));
        }

        let latest = log.latest(2);
        let messages: Vec<_> = latest.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 3", "event 4"]);
        assert_eq!(log.latest(100).len(), 5);
        assert!(log.latest(0).is_empty());
    }

    #[test]
    fn test_trims_oldest_past_capacity() {
        let log = OpsActivityLog::new();
        for i in 0..MAX_EVENTS + 10 {
            log.add("OPS", format!("event {i}"));
        }

        assert_eq!(log.len(), MAX_EVENTS);
        let all = log.latest(usize::MAX);
        assert_eq!(all.first().unwrap().message, "event 10");
        assert_eq!(all.last().unwrap().message, format!("event {}", MAX_EVENTS + 9));
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let log = OpsActivityLog::with_capacity(1);
        assert!(log.is_empty());
        log.add("OPS", "Requeued");

        let json = serde_json::to_value(&log.latest(1)[0]).unwrap();
        assert_eq!(json["source"], "OPS");
        assert_eq!(json["message"], "Requeued");
        assert!(json["atUtc"].is_string());
    }
}
