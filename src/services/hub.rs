//! Room-based notification hub.
//!
//! Rooms map to sets of live connections. Membership is guarded by one
//! `RwLock`: joins and leaves take it exclusively, lookups and broadcasts
//! take it shared and release it before any send.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::event::HubEvent;

/// Room carrying every event for one job.
pub fn job_room(job_id: Uuid) -> String {
    format!("job.room.{job_id}")
}

/// Room carrying new-job events for one user's list view.
pub fn user_room(user_id: Uuid) -> String {
    format!("job.room.user.{user_id}")
}

/// Handle for one live subscriber. Events are queued on a bounded channel
/// drained by the transport layer.
#[derive(Clone)]
pub struct Connection {
    pub id: Uuid,
    sender: mpsc::Sender<Arc<HubEvent>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel_closed", &self.sender.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(sender: mpsc::Sender<Arc<HubEvent>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Create a connection together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<HubEvent>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue an event without waiting; a full or closed queue is reported, not awaited.
    fn try_send(&self, event: Arc<HubEvent>) -> Result<(), TrySendError<Arc<HubEvent>>> {
        self.sender.try_send(event)
    }
}

type Rooms = HashMap<String, HashMap<Uuid, Connection>>;

/// Process-wide room registry. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct NotificationHub {
    rooms: Arc<RwLock<Rooms>>,
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("NotificationHub")
            .field("room_count", &rooms.len())
            .finish()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`. Joining twice is a no-op; empty room names are ignored.
    pub fn join(&self, conn: &Connection, room: &str) {
        if room.is_empty() {
            return;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn.id, conn.clone());
        tracing::debug!(conn_id = %conn.id, room, "ws_room_joined");
    }

    /// Remove a connection from `room`. Leaving a room never joined is a no-op.
    pub fn leave(&self, conn_id: Uuid, room: &str) {
        if room.is_empty() {
            return;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
        }
        tracing::debug!(conn_id = %conn_id, room, "ws_room_left");
    }

    /// Remove a connection from every room, e.g. after the socket dropped.
    pub fn disconnect(&self, conn_id: Uuid) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        for members in rooms.values_mut() {
            members.remove(&conn_id);
        }
    }

    pub fn has_subscribers(&self, room: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room).is_some_and(|members| !members.is_empty())
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room).map_or(0, HashMap::len)
    }

    /// Send `event` to every current member of `room` and return how many
    /// accepted it. A failing member is logged and skipped, never removed.
    pub fn broadcast(&self, room: &str, event: HubEvent) -> usize {
        let members: Vec<Connection> = {
            let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            match rooms.get(room) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        for conn in members {
            match conn.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id, room, error = %e, "ws_send_failed");
                }
            }
        }
        delivered
    }

    /// Wait for `room` to gain a subscriber, polling up to `attempts` times,
    /// then broadcast. The event is sent regardless once the polls run out or
    /// `cancel` fires. Returns whether a subscriber was present at send time.
    pub async fn broadcast_when_subscribed(
        &self,
        room: &str,
        event: HubEvent,
        attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        for _ in 0..attempts {
            if self.has_subscribers(room) {
                self.broadcast(room, event);
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let present = self.has_subscribers(room);
        tracing::debug!(room, present, "broadcast_fallback");
        self.broadcast(room, event);
        present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> HubEvent {
        HubEvent::completed(Uuid::nil())
    }

    #[test]
    fn test_room_names() {
        let id = Uuid::nil();
        assert_eq!(job_room(id), format!("job.room.{id}"));
        assert_eq!(user_room(id), format!("job.room.user.{id}"));
    }

    #[test]
    fn test_join_and_leave_are_idempotent() {
        let hub = NotificationHub::new();
        let (conn, _rx) = Connection::channel(4);

        assert!(!hub.has_subscribers("r"));
        hub.join(&conn, "r");
        hub.join(&conn, "r");
        assert_eq!(hub.subscriber_count("r"), 1);

        hub.leave(conn.id, "r");
        hub.leave(conn.id, "r");
        hub.leave(conn.id, "never-joined");
        assert!(!hub.has_subscribers("r"));
    }

    #[test]
    fn test_empty_room_name_is_ignored() {
        let hub = NotificationHub::new();
        let (conn, _rx) = Connection::channel(4);
        hub.join(&conn, "");
        assert!(!hub.has_subscribers(""));
    }

    #[test]
    fn test_disconnect_leaves_every_room() {
        let hub = NotificationHub::new();
        let (conn, _rx) = Connection::channel(4);
        let (other, _other_rx) = Connection::channel(4);
        hub.join(&conn, "a");
        hub.join(&conn, "b");
        hub.join(&other, "b");

        hub.disconnect(conn.id);
        assert!(!hub.has_subscribers("a"));
        assert_eq!(hub.subscriber_count("b"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_room_members() {
        let hub = NotificationHub::new();
        let (inside, mut inside_rx) = Connection::channel(4);
        let (outside, mut outside_rx) = Connection::channel(4);
        hub.join(&inside, "job");
        hub.join(&outside, "elsewhere");

        assert_eq!(hub.broadcast("job", completed()), 1);
        assert_eq!(*inside_rx.recv().await.unwrap(), completed());
        assert!(outside_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_member_does_not_block_others_and_stays_joined() {
        let hub = NotificationHub::new();
        let (stale, stale_rx) = Connection::channel(1);
        let (live, mut live_rx) = Connection::channel(4);
        drop(stale_rx);
        hub.join(&stale, "job");
        hub.join(&live, "job");

        assert_eq!(hub.broadcast("job", completed()), 1);
        assert!(live_rx.recv().await.is_some());
        assert_eq!(hub.subscriber_count("job"), 2);
    }

    #[tokio::test]
    async fn test_full_queue_is_skipped() {
        let hub = NotificationHub::new();
        let (slow, _slow_rx) = Connection::channel(1);
        hub.join(&slow, "job");

        assert_eq!(hub.broadcast("job", completed()), 1);
        assert_eq!(hub.broadcast("job", completed()), 0);
    }

    #[tokio::test]
    async fn test_join_is_visible_to_concurrent_callers() {
        let hub = NotificationHub::new();
        let (conn, _rx) = Connection::channel(4);
        hub.join(&conn, "job");

        let mut checks = Vec::new();
        for _ in 0..16 {
            let hub = hub.clone();
            checks.push(tokio::spawn(async move { hub.has_subscribers("job") }));
        }
        for check in checks {
            assert!(check.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_delayed_broadcast_waits_for_subscriber() {
        let hub = NotificationHub::new();
        let (conn, mut rx) = Connection::channel(4);

        let joiner = {
            let hub = hub.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                hub.join(&conn, "job");
            })
        };

        let present = hub
            .broadcast_when_subscribed(
                "job",
                completed(),
                50,
                Duration::from_millis(5),
                &CancellationToken::new(),
            )
            .await;
        joiner.await.unwrap();

        assert!(present);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_delayed_broadcast_falls_back_when_nobody_joins() {
        let hub = NotificationHub::new();
        let present = hub
            .broadcast_when_subscribed(
                "empty",
                completed(),
                3,
                Duration::from_millis(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(!present);
    }

    #[tokio::test]
    async fn test_cancel_sends_immediately() {
        let hub = NotificationHub::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        hub.broadcast_when_subscribed("empty", completed(), 30, Duration::from_secs(1), &cancel)
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
