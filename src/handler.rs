//! Embedder-facing observer interface.
//!
//! The dispatcher normalizes sparse protobuf payloads into the structs below
//! before fan-out: an absent signed scalar becomes -1, an absent unsigned
//! scalar 0, an absent string the empty string. Borrowed callback arguments
//! are valid for the duration of the call only; the engine reuses its
//! buffers after return.

/// Reason the run loop stopped, delivered through [`EventHandler::disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The embedder asked for the disconnect.
    Requested,
    /// The server closed the stream or an I/O fault occurred.
    ConnectionLost(String),
    /// The peer violated the protocol (unknown tag, oversized frame, ...).
    ProtocolViolation(String),
    /// The server refused the session after it was established.
    Rejected(String),
    /// No ping from the server within the keepalive window.
    KeepaliveTimeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEvent {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
    pub release: String,
    pub os: String,
    pub os_version: String,
}

/// One decoded Opus frame from a remote speaker.
#[derive(Debug)]
pub struct AudioEvent<'a> {
    pub target: u8,
    pub session_id: u32,
    pub sequence: u64,
    /// True when this frame terminates the sender's talk burst.
    pub is_last: bool,
    /// 48 kHz mono signed 16-bit PCM.
    pub pcm: &'a [i16],
}

/// Audio from a codec the engine does not decode, handed on verbatim.
#[derive(Debug)]
pub struct UnsupportedAudioEvent<'a> {
    pub target: u8,
    pub session_id: u32,
    pub sequence: u64,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSyncEvent {
    pub welcome_text: String,
    pub session_id: u32,
    pub max_bandwidth: u32,
    pub permissions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStateEvent {
    pub channel_id: i32,
    pub parent: i32,
    pub name: String,
    pub description: String,
    pub links: Vec<u32>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
    pub temporary: bool,
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStateEvent {
    pub session_id: i32,
    pub actor: i32,
    pub name: String,
    pub user_id: i32,
    pub channel_id: i32,
    pub mute: i32,
    pub deaf: i32,
    pub suppress: i32,
    pub self_mute: i32,
    pub self_deaf: i32,
    pub comment: String,
    pub priority_speaker: i32,
    pub recording: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRemoveEvent {
    pub session_id: u32,
    pub actor: i32,
    pub reason: String,
    pub ban: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMessageEvent {
    pub actor: i32,
    pub sessions: Vec<u32>,
    pub channel_ids: Vec<u32>,
    pub tree_ids: Vec<u32>,
    pub message: String,
}

/// A single entry of a `BanList` message; delivered once per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanEntryEvent {
    pub address: Vec<u8>,
    pub mask: u32,
    pub name: String,
    pub hash: String,
    pub reason: String,
    pub start: String,
    pub duration: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionDeniedEvent {
    pub permission: i32,
    pub channel_id: i32,
    pub session_id: i32,
    pub reason: String,
    pub deny_type: i32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionQueryEvent {
    pub channel_id: i32,
    pub permissions: u32,
    pub flush: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecVersionEvent {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfigEvent {
    pub max_bandwidth: u32,
    pub welcome_text: String,
    pub allow_html: bool,
    pub message_length: u32,
    pub image_message_length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStatsEvent {
    pub session_id: u32,
    pub online_secs: u32,
    pub idle_secs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextActionEvent {
    pub session_id: i32,
    pub channel_id: i32,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextActionModifyEvent {
    pub action: String,
    pub text: String,
    pub context: u32,
    pub operation: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryUsersEvent {
    pub ids: Vec<u32>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserListEntryEvent {
    pub user_id: u32,
    pub name: String,
    pub last_seen: String,
    pub last_channel: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuggestConfigEvent {
    pub version: u32,
    pub positional: bool,
    pub push_to_talk: bool,
}

/// Observer for everything the session dispatches.
///
/// Every method is a no-op by default; embedders override what they need.
/// Callbacks are delivered on the connection task, after the corresponding
/// state-store mutation and in wire order.
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync {
    fn version(&self, event: &VersionEvent) {}
    fn audio(&self, event: &AudioEvent<'_>) {}
    fn unsupported_audio(&self, event: &UnsupportedAudioEvent<'_>) {}
    fn server_sync(&self, event: &ServerSyncEvent) {}
    fn channel_state(&self, event: &ChannelStateEvent) {}
    fn channel_remove(&self, channel_id: u32) {}
    fn user_state(&self, event: &UserStateEvent) {}
    fn user_remove(&self, event: &UserRemoveEvent) {}
    fn text_message(&self, event: &TextMessageEvent) {}
    fn ban_list(&self, event: &BanEntryEvent) {}
    fn permission_denied(&self, event: &PermissionDeniedEvent) {}
    fn permission_query(&self, event: &PermissionQueryEvent) {}
    fn codec_version(&self, event: &CodecVersionEvent) {}
    fn server_config(&self, event: &ServerConfigEvent) {}
    fn user_stats(&self, event: &UserStatsEvent) {}
    fn context_action(&self, event: &ContextActionEvent) {}
    fn context_action_modify(&self, event: &ContextActionModifyEvent) {}
    fn query_users(&self, event: &QueryUsersEvent) {}
    fn user_list(&self, event: &UserListEntryEvent) {}
    fn suggest_config(&self, event: &SuggestConfigEvent) {}
    /// Final notification delivered just before the run loop exits.
    fn disconnected(&self, reason: &DisconnectReason) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
