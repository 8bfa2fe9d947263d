//! Presence status publishing.
//! The tracker calls [`StatusPublisher::publish`] once per cycle from its own
//! thread. Publishing never blocks: the current status lives in a `watch`
//! channel and the serialized `status_update` goes out on a `broadcast`
//! channel, so a slow WebSocket client only lags (and skips) on its own side.

pub mod server;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::detect::Sex;

/// Broadcast buffer per subscriber before it starts skipping messages.
const BROADCAST_CAPACITY: usize = 64;

/// Seconds since the Unix epoch as a float (wire timestamp format).
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Normalized per-cycle presence report from the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceUpdate {
    pub user_present: bool,
    pub user_count: usize,
    pub distance_m: Option<f64>,
    pub sex: Option<Sex>,
    pub age_years: Option<u32>,
}

/// Current status as seen by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub user_present: bool,
    pub user_count: usize,
    pub distance: Option<f64>,
    pub gender: Option<&'static str>,
    pub age: Option<u32>,
    pub last_detection_time: Option<f64>,
}

impl StatusSnapshot {
    /// Fold an update in. `last_detection_time` only moves while present.
    fn apply(&mut self, update: &PresenceUpdate, now: f64) {
        self.user_present = update.user_present;
        self.user_count = update.user_count;
        self.distance = update.distance_m.filter(|d| d.is_finite());
        self.gender = update.sex.and_then(|s| s.label());
        self.age = update.age_years;
        if update.user_present {
            self.last_detection_time = Some(now);
        }
    }
}

/// Server → client messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StatusUpdate {
        #[serde(flatten)]
        status: StatusSnapshot,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
}

impl ServerMessage {
    pub fn status_update(status: StatusSnapshot) -> Self {
        ServerMessage::StatusUpdate {
            status,
            timestamp: unix_now(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: unix_now(),
        }
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "status message serialization failed");
                None
            }
        }
    }
}

/// Fire-and-forget status fan-out.
pub struct StatusPublisher {
    current: watch::Sender<StatusSnapshot>,
    updates: broadcast::Sender<String>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (current, _) = watch::channel(StatusSnapshot::default());
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { current, updates }
    }

    /// Record the update and hand the serialized `status_update` to every
    /// connected client. Never blocks, never fails.
    pub fn publish(&self, update: PresenceUpdate) {
        let now = unix_now();
        let mut snapshot = StatusSnapshot::default();
        self.current.send_modify(|status| {
            status.apply(&update, now);
            snapshot = status.clone();
        });

        if self.updates.receiver_count() == 0 {
            return;
        }
        let msg = ServerMessage::StatusUpdate {
            status: snapshot,
            timestamp: now,
        };
        if let Some(json) = msg.to_json() {
            // no subscribers left is fine
            let _ = self.updates.send(json);
        }
    }

    pub fn current(&self) -> StatusSnapshot {
        self.current.borrow().clone()
    }

    /// Serialized `status_update` for the current status.
    pub fn current_message(&self) -> Option<String> {
        ServerMessage::status_update(self.current()).to_json()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(distance: f64) -> PresenceUpdate {
        PresenceUpdate {
            user_present: true,
            user_count: 1,
            distance_m: Some(distance),
            sex: Some(Sex::Female),
            age_years: Some(31),
        }
    }

    #[test]
    fn initial_status_is_absent() {
        let publisher = StatusPublisher::new();
        let json: serde_json::Value =
            serde_json::from_str(&publisher.current_message().unwrap()).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["user_present"], false);
        assert_eq!(json["user_count"], 0);
        assert!(json["distance"].is_null());
        assert!(json["gender"].is_null());
        assert!(json["age"].is_null());
        assert!(json["last_detection_time"].is_null());
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn last_detection_time_sticks_after_absence() {
        let publisher = StatusPublisher::new();
        publisher.publish(present(0.8));
        let seen = publisher.current().last_detection_time;
        assert!(seen.is_some());

        publisher.publish(PresenceUpdate {
            user_present: false,
            user_count: 0,
            distance_m: None,
            sex: None,
            age_years: None,
        });
        let status = publisher.current();
        assert!(!status.user_present);
        assert_eq!(status.last_detection_time, seen);
        assert_eq!(status.gender, None);
    }

    #[test]
    fn subscribers_receive_updates() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.publish(present(0.9));
        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["user_present"], true);
        assert_eq!(json["gender"], "F");
        assert_eq!(json["age"], 31);
        assert_eq!(json["distance"], 0.9);
    }

    #[test]
    fn infinite_distance_is_null() {
        let publisher = StatusPublisher::new();
        publisher.publish(present(f64::INFINITY));
        assert_eq!(publisher.current().distance, None);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let publisher = StatusPublisher::new();
        for _ in 0..200 {
            publisher.publish(present(0.5));
        }
        assert!(publisher.current().user_present);
    }
}
