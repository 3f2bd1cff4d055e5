//! Per-poem editing session: lifecycle, presence map, and the shared
//! content buffer.
//!
//! ```text
//! Disconnected ──open()──▶ Joining ──subscription live──▶ Active
//!       ▲                                                   │
//!       └────────────── Leaving ◀──────────close()──────────┘
//! ```
//!
//! The `Joining → Active` transition is optimistic: the `join` message
//! is published and the session counts itself live as soon as its
//! subscription callback is registered, with no acknowledgement from
//! anyone. A session can therefore look Active briefly before peers
//! actually see it.
//!
//! Merge policy is last-write-wins throughout. A remote `edit` replaces
//! the entire local buffer, including the local user's own echoed
//! edit, and `cursor`/`selection` overwrite per-user presence in
//! arrival order. There is no conflict detection and no operational
//! transform; concurrent edits simply race.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelHandle, Subscription};
use crate::message::{
    CollaborationMessage, CursorPosition, PoemContent, SchemaViolations, SelectionRange,
};

/// Lifecycle of one editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Joining,
    Active,
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation requires an active session (state: {0})")]
    NotActive(SessionState),
    #[error(transparent)]
    Content(#[from] SchemaViolations),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Last-known presence of one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub user_name: String,
    pub cursor: Option<usize>,
    pub selection: Option<(usize, usize)>,
}

impl PeerPresence {
    fn named(user_name: String) -> Self {
        Self {
            user_name,
            cursor: None,
            selection: None,
        }
    }

    /// Placeholder for a peer known only by id (a bare `join`).
    fn placeholder(user_id: Uuid) -> Self {
        Self::named(format!("Peer-{}", &user_id.to_string()[..8]))
    }
}

#[derive(Debug, Default)]
struct SessionShared {
    state: SessionState,
    content: String,
    peers: HashMap<Uuid, PeerPresence>,
}

/// One user's live editing session on one poem.
///
/// All merge work happens inside the subscription callback; public
/// accessors take a snapshot under the same mutex. The session never
/// retries a failed publish and never waits for delivery.
pub struct CollabSession {
    poem_id: Uuid,
    user_id: Uuid,
    user_name: String,
    channel: Arc<ChannelHandle>,
    shared: Arc<Mutex<SessionShared>>,
    subscription: Option<Subscription>,
}

impl CollabSession {
    pub fn new(
        poem_id: Uuid,
        user_id: Uuid,
        user_name: impl Into<String>,
        channel: Arc<ChannelHandle>,
    ) -> Self {
        Self {
            poem_id,
            user_id,
            user_name: user_name.into(),
            channel,
            shared: Arc::new(Mutex::new(SessionShared::default())),
            subscription: None,
        }
    }

    fn lock(shared: &Mutex<SessionShared>) -> MutexGuard<'_, SessionShared> {
        shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the session: announce the join and start receiving.
    ///
    /// Transitions `Disconnected → Joining → Active` without waiting
    /// for any acknowledgement. A no-op if already open.
    pub fn open(&mut self) -> Result<(), SessionError> {
        {
            let mut s = Self::lock(&self.shared);
            if s.state != SessionState::Disconnected {
                return Ok(());
            }
            s.state = SessionState::Joining;
        }

        self.channel.publish(&CollaborationMessage::Join {
            poem_id: self.poem_id,
            user_id: self.user_id,
        })?;

        let shared = Arc::clone(&self.shared);
        let local_id = self.user_id;
        self.subscription = Some(self.channel.subscribe(move |msg| {
            let mut s = shared.lock().unwrap_or_else(PoisonError::into_inner);
            apply_remote(&mut s, local_id, msg);
        }));

        Self::lock(&self.shared).state = SessionState::Active;
        log::debug!(
            "session for user {} active on channel {}",
            self.user_id,
            self.channel.name()
        );
        Ok(())
    }

    /// Replace the draft and broadcast the full buffer as one `edit`.
    ///
    /// Content rules are checked first; an invalid draft changes
    /// nothing and publishes nothing.
    pub fn edit(&self, content: &str) -> Result<(), SessionError> {
        self.require_active()?;
        let validated = PoemContent::new(content)?;
        Self::lock(&self.shared).content = validated.content.clone();
        self.channel.publish(&CollaborationMessage::Edit {
            content: validated.content,
        })?;
        Ok(())
    }

    /// Broadcast the local caret position. Debouncing is the caller's
    /// job; every call publishes one message.
    pub fn move_cursor(&self, position: usize) -> Result<(), SessionError> {
        self.require_active()?;
        self.channel.publish(&CollaborationMessage::Cursor {
            cursor: CursorPosition {
                position,
                user_id: self.user_id,
                user_name: self.user_name.clone(),
            },
        })?;
        Ok(())
    }

    /// Broadcast the local selection span.
    pub fn select(&self, start: usize, end: usize) -> Result<(), SessionError> {
        self.require_active()?;
        self.channel.publish(&CollaborationMessage::Selection {
            selection: SelectionRange {
                start,
                end,
                user_id: self.user_id,
                user_name: self.user_name.clone(),
            },
        })?;
        Ok(())
    }

    /// Close the session: best-effort `leave`, then stop receiving.
    ///
    /// The leave publish may be dropped on the floor (page-unload
    /// race); failure is logged, never propagated. Idempotent.
    pub fn close(&mut self) {
        {
            let mut s = Self::lock(&self.shared);
            if s.state == SessionState::Disconnected {
                return;
            }
            s.state = SessionState::Leaving;
        }

        if let Err(e) = self.channel.publish(&CollaborationMessage::Leave {
            poem_id: self.poem_id,
            user_id: self.user_id,
        }) {
            log::debug!("leave for user {} dropped: {e}", self.user_id);
        }

        if let Some(sub) = self.subscription.take() {
            sub.dispose();
        }
        Self::lock(&self.shared).state = SessionState::Disconnected;
    }

    fn require_active(&self) -> Result<(), SessionError> {
        let state = Self::lock(&self.shared).state;
        if state == SessionState::Active {
            Ok(())
        } else {
            Err(SessionError::NotActive(state))
        }
    }

    pub fn state(&self) -> SessionState {
        Self::lock(&self.shared).state
    }

    /// Snapshot of the shared content buffer.
    pub fn content(&self) -> String {
        Self::lock(&self.shared).content.clone()
    }

    /// Snapshot of all remote peers' presence.
    pub fn peers(&self) -> HashMap<Uuid, PeerPresence> {
        Self::lock(&self.shared).peers.clone()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<PeerPresence> {
        Self::lock(&self.shared).peers.get(user_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        Self::lock(&self.shared).peers.len()
    }

    pub fn poem_id(&self) -> Uuid {
        self.poem_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Merge one inbound message into session state.
///
/// Presence messages echoed back for the local user are ignored; the
/// local caret is already local state. `edit` is applied no matter who
/// sent it: the last edit received wins, even over our own in-flight
/// one.
fn apply_remote(s: &mut SessionShared, local_id: Uuid, msg: CollaborationMessage) {
    match msg {
        CollaborationMessage::Edit { content } => {
            s.content = content;
        }
        CollaborationMessage::Cursor { cursor } if cursor.user_id != local_id => {
            let peer = s
                .peers
                .entry(cursor.user_id)
                .or_insert_with(|| PeerPresence::named(cursor.user_name.clone()));
            peer.user_name = cursor.user_name;
            peer.cursor = Some(cursor.position);
        }
        CollaborationMessage::Selection { selection } if selection.user_id != local_id => {
            let peer = s
                .peers
                .entry(selection.user_id)
                .or_insert_with(|| PeerPresence::named(selection.user_name.clone()));
            peer.user_name = selection.user_name;
            peer.selection = Some((selection.start, selection.end));
        }
        CollaborationMessage::Join { user_id, .. } if user_id != local_id => {
            s.peers
                .entry(user_id)
                .or_insert_with(|| PeerPresence::placeholder(user_id));
        }
        CollaborationMessage::Leave { user_id, .. } if user_id != local_id => {
            s.peers.remove(&user_id);
        }
        // Our own presence echoes.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::message::CollaborationMessage as Msg;
    use tokio::time::{sleep, timeout, Duration};

    fn cursor(user_id: Uuid, name: &str, position: usize) -> Msg {
        Msg::Cursor {
            cursor: CursorPosition {
                position,
                user_id,
                user_name: name.into(),
            },
        }
    }

    // ── merge logic (pure, no runtime) ───────────────────────────

    #[test]
    fn test_edit_replaces_buffer_last_write_wins() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();

        apply_remote(&mut s, local, Msg::Edit { content: "first draft of the poem".into() });
        apply_remote(&mut s, local, Msg::Edit { content: "second draft wins".into() });
        assert_eq!(s.content, "second draft wins");
    }

    #[test]
    fn test_own_edit_echo_still_replaces() {
        // The sender's own echoed edit overwrites too, no special case.
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();
        s.content = "typed locally, not yet echoed".into();

        apply_remote(&mut s, local, Msg::Edit { content: "echo of our own edit".into() });
        assert_eq!(s.content, "echo of our own edit");
    }

    #[test]
    fn test_cursor_overwrites_per_user() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();

        apply_remote(&mut s, local, cursor(remote, "Emily", 5));
        assert_eq!(s.peers[&remote].cursor, Some(5));

        apply_remote(&mut s, local, cursor(remote, "Emily", 11));
        assert_eq!(s.peers[&remote].cursor, Some(11), "second write wins");
        assert_eq!(s.peers.len(), 1);
    }

    #[test]
    fn test_own_cursor_echo_ignored() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();

        apply_remote(&mut s, local, cursor(local, "Me", 3));
        assert!(s.peers.is_empty());
    }

    #[test]
    fn test_selection_tracked_even_reversed() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();

        apply_remote(
            &mut s,
            local,
            Msg::Selection {
                selection: SelectionRange {
                    start: 9,
                    end: 2,
                    user_id: remote,
                    user_name: "Walt".into(),
                },
            },
        );
        assert_eq!(s.peers[&remote].selection, Some((9, 2)));
    }

    #[test]
    fn test_join_inserts_placeholder_then_leave_removes() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let poem = Uuid::new_v4();

        apply_remote(&mut s, local, Msg::Join { poem_id: poem, user_id: remote });
        assert_eq!(s.peers.len(), 1);
        assert!(s.peers[&remote].user_name.starts_with("Peer-"));

        apply_remote(&mut s, local, Msg::Leave { poem_id: poem, user_id: remote });
        assert!(s.peers.is_empty());
    }

    #[test]
    fn test_cursor_from_unknown_peer_creates_entry() {
        let mut s = SessionShared::default();
        let local = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        // No join seen; they connected before we did.
        apply_remote(&mut s, local, cursor(stranger, "Sylvia", 7));
        assert_eq!(s.peers[&stranger].user_name, "Sylvia");
        assert_eq!(s.peers[&stranger].cursor, Some(7));
    }

    // ── full session over a live channel ─────────────────────────

    #[tokio::test]
    async fn test_open_publishes_join_and_goes_active() {
        let registry = ChannelRegistry::new(16);
        let poem = Uuid::new_v4();
        let channel = registry.acquire(&crate::channel::poem_channel_name(poem)).await;

        let mut rx = channel.receiver();
        let mut session = CollabSession::new(poem, Uuid::new_v4(), "Anne", channel);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Active);

        let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let msg = Msg::from_json(&frame).unwrap();
        assert_eq!(msg.kind(), "join");
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let channel = Arc::new(ChannelHandle::new("poem:t", 16));
        let mut session = CollabSession::new(Uuid::new_v4(), Uuid::new_v4(), "Anne", channel);
        session.open().unwrap();
        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_edit_requires_active() {
        let channel = Arc::new(ChannelHandle::new("poem:t", 16));
        let session = CollabSession::new(Uuid::new_v4(), Uuid::new_v4(), "Anne", channel);
        let err = session.edit("a perfectly valid poem body").unwrap_err();
        assert!(matches!(err, SessionError::NotActive(SessionState::Disconnected)));
    }

    #[tokio::test]
    async fn test_invalid_edit_publishes_nothing() {
        let channel = Arc::new(ChannelHandle::new("poem:t", 16));
        let mut session =
            CollabSession::new(Uuid::new_v4(), Uuid::new_v4(), "Anne", channel.clone());
        session.open().unwrap();
        let published_before = channel.stats().messages_published;

        assert!(session.edit("short").is_err());
        assert_eq!(session.content(), "", "buffer unchanged on invalid content");
        assert_eq!(channel.stats().messages_published, published_before);
    }

    #[tokio::test]
    async fn test_two_sessions_see_each_other() {
        let registry = ChannelRegistry::new(64);
        let poem = Uuid::new_v4();
        let name = crate::channel::poem_channel_name(poem);
        let channel_a = registry.acquire(&name).await;
        let channel_b = registry.acquire(&name).await;

        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let mut a = CollabSession::new(poem, user_a, "Anne", channel_a);
        let mut b = CollabSession::new(poem, user_b, "Bram", channel_b);
        a.open().unwrap();
        b.open().unwrap();
        sleep(Duration::from_millis(50)).await;

        // A sees B's join placeholder.
        assert!(a.peer(&user_b).is_some());

        b.move_cursor(17).unwrap();
        b.select(2, 6).unwrap();
        sleep(Duration::from_millis(50)).await;

        let peer = a.peer(&user_b).unwrap();
        assert_eq!(peer.cursor, Some(17));
        assert_eq!(peer.selection, Some((2, 6)));
        assert_eq!(peer.user_name, "Bram");

        // B never tracks itself.
        assert!(b.peer(&user_b).is_none());
    }

    #[tokio::test]
    async fn test_edit_propagates_full_buffer() {
        let registry = ChannelRegistry::new(64);
        let poem = Uuid::new_v4();
        let name = crate::channel::poem_channel_name(poem);

        let mut a = CollabSession::new(poem, Uuid::new_v4(), "Anne", registry.acquire(&name).await);
        let mut b = CollabSession::new(poem, Uuid::new_v4(), "Bram", registry.acquire(&name).await);
        a.open().unwrap();
        b.open().unwrap();
        sleep(Duration::from_millis(50)).await;

        a.edit("two roads diverged in a yellow wood").unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(b.content(), "two roads diverged in a yellow wood");

        b.edit("and sorry I could not travel both").unwrap();
        sleep(Duration::from_millis(50)).await;
        // Last write wins on both sides, including A's own view.
        assert_eq!(a.content(), "and sorry I could not travel both");
        assert_eq!(b.content(), "and sorry I could not travel both");
    }

    #[tokio::test]
    async fn test_close_publishes_leave_and_disconnects() {
        let registry = ChannelRegistry::new(64);
        let poem = Uuid::new_v4();
        let name = crate::channel::poem_channel_name(poem);

        let user_a = Uuid::new_v4();
        let mut a = CollabSession::new(poem, user_a, "Anne", registry.acquire(&name).await);
        let mut b =
            CollabSession::new(poem, Uuid::new_v4(), "Bram", registry.acquire(&name).await);
        a.open().unwrap();
        b.open().unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(b.peer(&user_a).is_some());

        a.close();
        assert_eq!(a.state(), SessionState::Disconnected);
        sleep(Duration::from_millis(50)).await;
        assert!(b.peer(&user_a).is_none(), "leave removes the peer");

        // Closing twice is harmless.
        a.close();
        assert_eq!(a.state(), SessionState::Disconnected);
    }
}
