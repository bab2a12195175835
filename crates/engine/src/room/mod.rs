pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use coview_common::protocol::events::RoomEvent;
use coview_common::types::Presence;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::error;
use uuid::Uuid;

/// Participant colors, assigned first-free on join. With more
/// concurrent participants than hues a random repeat is used.
pub const COLOR_PALETTE: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2", "#d19a66", "#f47fb3",
    "#7f9f7f", "#5c6bc0",
];

pub fn assign_color(in_use: &[String]) -> String {
    for color in COLOR_PALETTE {
        if !in_use.iter().any(|used| used == color) {
            return (*color).to_string();
        }
    }

    let index = rand::thread_rng().gen_range(0..COLOR_PALETTE.len());
    COLOR_PALETTE[index].to_string()
}

/// Frame pushed to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized room event, shared across all recipients.
    Event(Arc<str>),
    /// Instructs the writer to close the socket.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub page_number: Option<i32>,
    pub cursor_x: Option<f64>,
    pub cursor_y: Option<f64>,
}

/// Result of detaching one connection from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The user was not tracked in this room.
    NotPresent,
    /// The connection was removed but other connections for the same
    /// user remain; presence is unchanged.
    ConnectionRemoved,
    /// The last connection for the user was removed and the presence
    /// entry is gone.
    PresenceRemoved,
}

struct PresenceEntry {
    display_name: String,
    color: String,
    page_number: i32,
    cursor_x: f64,
    cursor_y: f64,
    last_activity_at: chrono::DateTime<Utc>,
    connections: HashMap<Uuid, OutboundSender>,
}

impl PresenceEntry {
    fn snapshot(&self, user_id: Uuid) -> Presence {
        Presence {
            user_id,
            display_name: self.display_name.clone(),
            color: self.color.clone(),
            page_number: self.page_number,
            cursor_x: self.cursor_x,
            cursor_y: self.cursor_y,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[derive(Default)]
struct RoomState {
    presences: HashMap<Uuid, PresenceEntry>,
    typing: HashSet<Uuid>,
    hand_raised: HashSet<Uuid>,
    screen_sharing: HashSet<Uuid>,
    /// Set when the registry tears the room down. A closed room never
    /// accepts another connection, so a stale handle cannot strand one.
    closed: bool,
}

/// In-memory fan-out state for one live session. All socket writes
/// happen through per-connection channels after the state lock is
/// released.
pub struct Room {
    session_id: Uuid,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id, state: Mutex::new(RoomState::default()) }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Attaches a connection. Returns `Some(true)` when this is the
    /// user's first live connection, `Some(false)` for an additional
    /// connection, and `None` when the room has already been torn down;
    /// the caller must then fetch a fresh room from the registry.
    pub async fn join(
        &self,
        user_id: Uuid,
        display_name: &str,
        color: &str,
        conn_id: Uuid,
        sender: OutboundSender,
    ) -> Option<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        let entry = state.presences.entry(user_id);

        match entry {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().connections.insert(conn_id, sender);
                Some(false)
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let mut connections = HashMap::new();
                connections.insert(conn_id, sender);
                vacant.insert(PresenceEntry {
                    display_name: display_name.to_string(),
                    color: color.to_string(),
                    page_number: 1,
                    cursor_x: 0.0,
                    cursor_y: 0.0,
                    last_activity_at: Utc::now(),
                    connections,
                });
                Some(true)
            }
        }
    }

    /// Detaches one connection. The presence entry survives as long as
    /// the user has at least one other live connection; ephemeral flags
    /// are cleared only when the entry itself goes.
    pub async fn leave(&self, user_id: Uuid, conn_id: Uuid) -> LeaveOutcome {
        let mut state = self.state.lock().await;

        let Some(entry) = state.presences.get_mut(&user_id) else {
            return LeaveOutcome::NotPresent;
        };

        entry.connections.remove(&conn_id);
        if !entry.connections.is_empty() {
            return LeaveOutcome::ConnectionRemoved;
        }

        state.presences.remove(&user_id);
        state.typing.remove(&user_id);
        state.hand_raised.remove(&user_id);
        state.screen_sharing.remove(&user_id);
        LeaveOutcome::PresenceRemoved
    }

    /// Applies a partial presence update and returns the new snapshot,
    /// or `None` when the user has no live presence in this room.
    pub async fn update_presence(
        &self,
        user_id: Uuid,
        update: PresenceUpdate,
    ) -> Option<Presence> {
        let mut state = self.state.lock().await;
        let entry = state.presences.get_mut(&user_id)?;

        if let Some(page_number) = update.page_number {
            entry.page_number = page_number;
        }
        if let Some(cursor_x) = update.cursor_x {
            entry.cursor_x = cursor_x;
        }
        if let Some(cursor_y) = update.cursor_y {
            entry.cursor_y = cursor_y;
        }
        entry.last_activity_at = Utc::now();

        Some(entry.snapshot(user_id))
    }

    /// Flips the hand-raise flag and returns the new state.
    pub async fn toggle_hand_raise(&self, user_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.hand_raised.remove(&user_id) {
            false
        } else {
            state.hand_raised.insert(user_id);
            true
        }
    }

    /// Flips the screen-share flag and returns the new state.
    pub async fn toggle_screen_share(&self, user_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.screen_sharing.remove(&user_id) {
            false
        } else {
            state.screen_sharing.insert(user_id);
            true
        }
    }

    /// Records a typing state change. Returns `false` when the call is
    /// a no-op (already in the requested state), so callers can skip
    /// redundant broadcasts.
    pub async fn set_typing(&self, user_id: Uuid, typing: bool) -> bool {
        let mut state = self.state.lock().await;
        if typing {
            state.typing.insert(user_id)
        } else {
            state.typing.remove(&user_id)
        }
    }

    /// Clears the typing flag, returning whether it was set.
    pub async fn clear_typing(&self, user_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        state.typing.remove(&user_id)
    }

    /// Serializes the event once and pushes it to every connection in
    /// the room, skipping all connections of `exclude_user`. Delivery
    /// is best effort; closed channels are ignored.
    pub async fn broadcast(&self, event: &RoomEvent, exclude_user: Option<Uuid>) {
        let Some(frame) = serialize_event(event) else {
            return;
        };

        let senders = {
            let state = self.state.lock().await;
            collect_senders(&state, |user_id| Some(user_id) != exclude_user)
        };

        for sender in senders {
            let _ = sender.send(Outbound::Event(Arc::clone(&frame)));
        }
    }

    /// Pushes the event to the target user's connections only. Returns
    /// the number of connections the frame was queued on; zero means
    /// the target has no live presence and the event is dropped.
    pub async fn relay(&self, target: Uuid, event: &RoomEvent) -> usize {
        let Some(frame) = serialize_event(event) else {
            return 0;
        };

        let senders = {
            let state = self.state.lock().await;
            collect_senders(&state, |user_id| user_id == target)
        };

        let mut delivered = 0;
        for sender in senders {
            if sender.send(Outbound::Event(Arc::clone(&frame))).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn snapshot_presences(&self) -> Vec<Presence> {
        let state = self.state.lock().await;
        let mut presences: Vec<Presence> = state
            .presences
            .iter()
            .map(|(user_id, entry)| entry.snapshot(*user_id))
            .collect();
        presences.sort_by_key(|presence| presence.user_id);
        presences
    }

    pub async fn has_presence(&self, user_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.presences.contains_key(&user_id)
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.presences.is_empty()
    }

    /// Marks the room closed and returns its senders so the caller can
    /// notify them after releasing the registry lock. A closed room
    /// refuses new connections, so teardown and attach never interleave.
    pub(crate) async fn seal(&self) -> Vec<OutboundSender> {
        let mut state = self.state.lock().await;
        state.closed = true;
        collect_senders(&state, |_| true)
    }

    /// Closes the room only when it holds no presences. Returns whether
    /// it was closed.
    pub(crate) async fn seal_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.presences.is_empty() {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Closes the room and asks every connection's writer to close its
    /// socket.
    pub async fn close_all(&self) {
        for sender in self.seal().await {
            let _ = sender.send(Outbound::Close);
        }
    }
}

fn serialize_event(event: &RoomEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(Arc::from(frame.as_str())),
        Err(serialize_error) => {
            error!(event = event.kind(), error = %serialize_error, "failed to serialize room event");
            None
        }
    }
}

fn collect_senders(
    state: &RoomState,
    mut include_user: impl FnMut(Uuid) -> bool,
) -> Vec<OutboundSender> {
    let mut senders = Vec::new();
    for (user_id, entry) in &state.presences {
        if !include_user(*user_id) {
            continue;
        }
        for sender in entry.connections.values() {
            senders.push(sender.clone());
        }
    }
    senders
}

#[cfg(test)]
mod tests {
    use super::{assign_color, LeaveOutcome, Outbound, PresenceUpdate, Room, COLOR_PALETTE};
    use coview_common::protocol::events::RoomEvent;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn attach() -> (mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn received_event(receiver: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<String> {
        match receiver.try_recv() {
            Ok(Outbound::Event(frame)) => Some(frame.to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn presence_survives_until_last_connection_leaves() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let (conn_a, conn_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (sender_a, _rx_a) = attach();
        let (sender_b, _rx_b) = attach();

        assert_eq!(room.join(user, "Alice", "#e06c75", conn_a, sender_a).await, Some(true));
        assert_eq!(room.join(user, "Alice", "#e06c75", conn_b, sender_b).await, Some(false));

        assert_eq!(room.leave(user, conn_a).await, LeaveOutcome::ConnectionRemoved);
        assert!(room.has_presence(user).await);

        assert_eq!(room.leave(user, conn_b).await, LeaveOutcome::PresenceRemoved);
        assert!(!room.has_presence(user).await);
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn leave_for_unknown_user_reports_not_present() {
        let room = Room::new(Uuid::new_v4());
        assert_eq!(room.leave(Uuid::new_v4(), Uuid::new_v4()).await, LeaveOutcome::NotPresent);
    }

    #[tokio::test]
    async fn double_toggle_returns_to_lowered_state() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();

        assert!(room.toggle_hand_raise(user).await);
        assert!(!room.toggle_hand_raise(user).await);

        assert!(room.toggle_screen_share(user).await);
        assert!(!room.toggle_screen_share(user).await);
    }

    #[tokio::test]
    async fn ephemeral_flags_clear_when_presence_is_removed() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (sender, _rx) = attach();

        room.join(user, "Bob", "#61afef", conn, sender).await;
        room.toggle_hand_raise(user).await;
        room.set_typing(user, true).await;

        room.leave(user, conn).await;
        let (sender, _rx) = attach();
        room.join(user, "Bob", "#61afef", Uuid::new_v4(), sender).await;

        assert!(room.toggle_hand_raise(user).await);
        assert!(!room.clear_typing(user).await);
    }

    #[tokio::test]
    async fn broadcast_excludes_every_connection_of_the_excluded_user() {
        let room = Room::new(Uuid::new_v4());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (alice_sender_1, mut alice_rx_1) = attach();
        let (alice_sender_2, mut alice_rx_2) = attach();
        let (bob_sender, mut bob_rx) = attach();

        room.join(alice, "Alice", "#e06c75", Uuid::new_v4(), alice_sender_1).await;
        room.join(alice, "Alice", "#e06c75", Uuid::new_v4(), alice_sender_2).await;
        room.join(bob, "Bob", "#61afef", Uuid::new_v4(), bob_sender).await;

        room.broadcast(&RoomEvent::TypingStart { user_id: alice }, Some(alice)).await;

        assert!(received_event(&mut alice_rx_1).is_none());
        assert!(received_event(&mut alice_rx_2).is_none());
        let frame = received_event(&mut bob_rx).expect("bob should receive the event");
        assert!(frame.contains("typing_start"));
    }

    #[tokio::test]
    async fn relay_targets_one_user_and_drops_absent_targets() {
        let room = Room::new(Uuid::new_v4());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (alice_sender, mut alice_rx) = attach();
        let (bob_sender, mut bob_rx) = attach();

        room.join(alice, "Alice", "#e06c75", Uuid::new_v4(), alice_sender).await;
        room.join(bob, "Bob", "#61afef", Uuid::new_v4(), bob_sender).await;

        let signal = RoomEvent::Signal {
            from_user_id: alice,
            signal_type: coview_common::protocol::events::SignalKind::Offer,
            payload: serde_json::json!({ "sdp": "v=0" }),
        };

        assert_eq!(room.relay(bob, &signal).await, 1);
        assert!(received_event(&mut bob_rx).is_some());
        assert!(received_event(&mut alice_rx).is_none());

        assert_eq!(room.relay(Uuid::new_v4(), &signal).await, 0);
    }

    #[tokio::test]
    async fn presence_update_applies_partial_fields() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let (sender, _rx) = attach();
        room.join(user, "Carol", "#98c379", Uuid::new_v4(), sender).await;

        let updated = room
            .update_presence(
                user,
                PresenceUpdate { page_number: Some(7), cursor_x: Some(0.25), cursor_y: None },
            )
            .await
            .expect("presence should exist");

        assert_eq!(updated.page_number, 7);
        assert_eq!(updated.cursor_x, 0.25);
        assert_eq!(updated.cursor_y, 0.0);

        assert!(room.update_presence(Uuid::new_v4(), PresenceUpdate::default()).await.is_none());
    }

    #[tokio::test]
    async fn close_all_reaches_every_connection() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let (sender, mut rx) = attach();
        room.join(user, "Dave", "#e5c07b", Uuid::new_v4(), sender).await;

        room.close_all().await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[tokio::test]
    async fn closed_rooms_refuse_new_connections() {
        let room = Room::new(Uuid::new_v4());
        let user = Uuid::new_v4();

        room.close_all().await;

        let (sender, _rx) = attach();
        assert_eq!(room.join(user, "Eve", "#c678dd", Uuid::new_v4(), sender).await, None);
    }

    #[test]
    fn colors_assign_first_free_then_repeat() {
        assert_eq!(assign_color(&[]), COLOR_PALETTE[0]);

        let in_use = vec![COLOR_PALETTE[0].to_string(), COLOR_PALETTE[1].to_string()];
        assert_eq!(assign_color(&in_use), COLOR_PALETTE[2]);

        let all: Vec<String> = COLOR_PALETTE.iter().map(|color| color.to_string()).collect();
        assert!(COLOR_PALETTE.contains(&assign_color(&all).as_str()));
    }
}
