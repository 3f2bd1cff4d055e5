//! # poemnet-collab: real-time collaboration layer for Poetry Network
//!
//! Lets multiple users see each other's cursors, selections, and edits
//! on a shared poem draft in near-real time. Messages are broadcast
//! per-poem and merged last-write-wins; there is deliberately no
//! CRDT or operational transform. A full-buffer `edit` replaces
//! whatever was there, and concurrent edits race.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   publish/subscribe   ┌───────────────┐
//! │ CollabSession │ ◄───────────────────► │ ChannelHandle │
//! │ (per user)    │   JSON messages       │ (per poem)    │
//! └───────┬───────┘                       └───────┬───────┘
//!         │                                       │
//!         ▼                                       ▼
//! ┌───────────────┐                       ┌───────────────┐
//! │ presence map  │                       │ChannelRegistry│
//! │ + buffer (LWW)│                       │ (keyed cache) │
//! └───────────────┘                       └───────┬───────┘
//!                                                 │
//!                                         ┌───────┴───────┐
//!                                         │ CollabServer  │
//!                                         │ GET /api/ws   │
//!                                         └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`]: tagged JSON message schema + poem content rules
//! - [`channel`]: per-poem pub/sub channels and the keyed registry
//! - [`session`]: editing session state machine and merge logic
//! - [`server`]: HTTP to WebSocket upgrade bridge and room fan-out
//! - [`errors`]: editor-facing error taxonomy and classifiers

pub mod channel;
pub mod errors;
pub mod message;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use channel::{
    poem_channel_name, ChannelError, ChannelHandle, ChannelRegistry, ChannelStats, Subscription,
};
pub use errors::{
    classify_collaboration_failure, classify_content_error, classify_network_failure, EditorError,
    EditorErrors, ErrorKind,
};
pub use message::{
    validate, validate_content, CollaborationMessage, CursorPosition, PoemContent,
    SchemaViolations, SelectionRange, Violation,
};
pub use server::{router, CollabServer, ServerConfig, ServerStats};
pub use session::{CollabSession, PeerPresence, SessionError, SessionState};
