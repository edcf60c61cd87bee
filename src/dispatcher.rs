//! Control-message dispatch: decode by tag, mutate the state store, fan out
//! to the embedder.
//!
//! State mutations always complete before the matching callback fires, so a
//! query made from inside a callback observes the message's effects.

use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "audio")]
use crate::audio::DecoderBank;
#[cfg(feature = "audio")]
use crate::handler::AudioEvent;
use crate::handler::{
    BanEntryEvent, ChannelStateEvent, CodecVersionEvent, EventHandler, PermissionQueryEvent,
    ServerConfigEvent, ServerSyncEvent, TextMessageEvent, UnsupportedAudioEvent, UserRemoveEvent,
    UserStateEvent, UserStatsEvent, VersionEvent,
};
use crate::messages::{ControlMessage, MessageDecodeError, MessageEnvelope};
#[cfg(feature = "audio")]
use crate::packet::AudioCodec;
use crate::packet::{self, IncomingPacket};
use crate::proto::mumble;
use crate::state::{Channel, ClientState, ServerSnapshot};
use crate::MumletError;

/// What the transport loop should do after a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Continue,
    /// `ServerSync` arrived; the handshake is complete.
    Synced,
    /// The server refused the session.
    Rejected(String),
}

pub(crate) struct Dispatcher {
    state: Arc<Mutex<ClientState>>,
    handler: Arc<dyn EventHandler>,
    #[cfg(feature = "audio")]
    decoders: DecoderBank,
}

impl Dispatcher {
    pub(crate) fn new(state: Arc<Mutex<ClientState>>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            state,
            handler,
            #[cfg(feature = "audio")]
            decoders: DecoderBank::new(),
        }
    }

    /// Process one inbound control frame.
    ///
    /// Per-message decode failures are logged and swallowed; only a tag
    /// outside the protocol enumeration is fatal.
    pub(crate) fn dispatch_control(
        &mut self,
        envelope: MessageEnvelope,
    ) -> Result<Dispatch, MumletError> {
        let message = match ControlMessage::try_from(envelope) {
            Ok(message) => message,
            Err(MessageDecodeError::Decode { kind, source }) => {
                tracing::warn!("discarding undecodable {kind:?} message: {source}");
                return Ok(Dispatch::Continue);
            }
            Err(MessageDecodeError::Unhandled { kind }) => {
                tracing::warn!("{kind:?} not implemented, ignoring");
                return Ok(Dispatch::Continue);
            }
            Err(MessageDecodeError::UnknownTag { tag }) => {
                return Err(MumletError::Protocol(format!("unknown message tag {tag}")));
            }
        };

        match message {
            ControlMessage::Version(version) => {
                let packed = version.version.unwrap_or_default();
                let event = VersionEvent {
                    major: (packed >> 16) as u16,
                    minor: (packed >> 8) as u8,
                    patch: packed as u8,
                    release: version.release.unwrap_or_default(),
                    os: version.os.unwrap_or_default(),
                    os_version: version.os_version.unwrap_or_default(),
                };
                self.handler.version(&event);
            }
            ControlMessage::Ping(_) => {
                // Keepalive bookkeeping happens in the transport loop.
                tracing::debug!("ping echo received");
            }
            ControlMessage::Authenticate(_) => {
                tracing::warn!("server sent Authenticate, ignoring");
            }
            ControlMessage::VoiceTarget(_) => {
                tracing::warn!("server sent VoiceTarget, ignoring");
            }
            ControlMessage::Reject(reject) => {
                let mut reason = reject.reason.unwrap_or_else(|| "unknown reason".to_string());
                if let Some(value) = reject.r#type {
                    if let Ok(kind) = mumble::reject::RejectType::try_from(value) {
                        reason = format!("{kind:?}: {reason}");
                    }
                }
                return Ok(Dispatch::Rejected(reason));
            }
            ControlMessage::ServerSync(sync) => {
                let session_id = sync.session.unwrap_or_default();
                let welcome_text = sync.welcome_text.unwrap_or_default();
                self.state.lock().apply_server_sync(session_id, &welcome_text);
                let event = ServerSyncEvent {
                    welcome_text,
                    session_id,
                    max_bandwidth: sync.max_bandwidth.unwrap_or_default(),
                    permissions: sync.permissions.unwrap_or_default(),
                };
                self.handler.server_sync(&event);
                return Ok(Dispatch::Synced);
            }
            ControlMessage::ChannelState(channel_state) => {
                if let Some(channel_id) = channel_state.channel_id {
                    self.state.lock().channel_insert_if_absent(Channel {
                        channel_id,
                        name: channel_state.name.clone().unwrap_or_default(),
                        description: channel_state.description.clone().unwrap_or_default(),
                    });
                }
                let event = ChannelStateEvent {
                    channel_id: norm_u32(channel_state.channel_id),
                    parent: norm_u32(channel_state.parent),
                    name: channel_state.name.unwrap_or_default(),
                    description: channel_state.description.unwrap_or_default(),
                    links: channel_state.links,
                    links_add: channel_state.links_add,
                    links_remove: channel_state.links_remove,
                    temporary: channel_state.temporary.unwrap_or_default(),
                    position: channel_state.position.unwrap_or_default(),
                };
                self.handler.channel_state(&event);
            }
            ControlMessage::ChannelRemove(remove) => {
                self.state.lock().channel_erase(remove.channel_id);
                self.handler.channel_remove(remove.channel_id);
            }
            ControlMessage::UserState(user_state) => {
                if let Some(session_id) = user_state.session {
                    let mut state = self.state.lock();
                    if session_id == state.my_session_id() {
                        if let Some(channel_id) = user_state.channel_id {
                            state.set_current_channel(channel_id);
                        }
                    }
                    state.user_update(
                        session_id,
                        user_state.name.as_deref(),
                        user_state.user_id.map(|id| id as i32),
                        user_state.channel_id.map(|id| id as i32),
                    );
                }
                let event = UserStateEvent {
                    session_id: norm_u32(user_state.session),
                    actor: norm_u32(user_state.actor),
                    name: user_state.name.unwrap_or_default(),
                    user_id: norm_u32(user_state.user_id),
                    channel_id: norm_u32(user_state.channel_id),
                    mute: norm_bool(user_state.mute),
                    deaf: norm_bool(user_state.deaf),
                    suppress: norm_bool(user_state.suppress),
                    self_mute: norm_bool(user_state.self_mute),
                    self_deaf: norm_bool(user_state.self_deaf),
                    comment: user_state.comment.unwrap_or_default(),
                    priority_speaker: norm_bool(user_state.priority_speaker),
                    recording: norm_bool(user_state.recording),
                };
                self.handler.user_state(&event);
            }
            ControlMessage::UserRemove(remove) => {
                self.state.lock().user_erase(remove.session);
                #[cfg(feature = "audio")]
                self.decoders.forget(remove.session);
                let event = UserRemoveEvent {
                    session_id: remove.session,
                    actor: norm_u32(remove.actor),
                    reason: remove.reason.unwrap_or_default(),
                    ban: remove.ban.unwrap_or_default(),
                };
                self.handler.user_remove(&event);
            }
            ControlMessage::TextMessage(text) => {
                let event = TextMessageEvent {
                    actor: norm_u32(text.actor),
                    sessions: text.session,
                    channel_ids: text.channel_id,
                    tree_ids: text.tree_id,
                    message: text.message,
                };
                self.handler.text_message(&event);
            }
            ControlMessage::BanList(ban_list) => {
                for ban in ban_list.bans {
                    let event = BanEntryEvent {
                        address: ban.address,
                        mask: ban.mask,
                        name: ban.name.unwrap_or_default(),
                        hash: ban.hash.unwrap_or_default(),
                        reason: ban.reason.unwrap_or_default(),
                        start: ban.start.unwrap_or_default(),
                        duration: ban.duration.map(i64::from).unwrap_or(-1),
                    };
                    self.handler.ban_list(&event);
                }
            }
            ControlMessage::PermissionQuery(query) => {
                let event = PermissionQueryEvent {
                    channel_id: norm_u32(query.channel_id),
                    permissions: query.permissions.unwrap_or_default(),
                    flush: query.flush.unwrap_or_default(),
                };
                self.handler.permission_query(&event);
            }
            ControlMessage::CodecVersion(codec) => {
                let event = CodecVersionEvent {
                    alpha: codec.alpha,
                    beta: codec.beta,
                    prefer_alpha: codec.prefer_alpha,
                    opus: codec.opus.unwrap_or_default(),
                };
                self.handler.codec_version(&event);
            }
            ControlMessage::UserStats(stats) => {
                let event = UserStatsEvent {
                    session_id: stats.session.unwrap_or_default(),
                    online_secs: stats.onlinesecs.unwrap_or_default(),
                    idle_secs: stats.idlesecs.unwrap_or_default(),
                };
                self.handler.user_stats(&event);
            }
            ControlMessage::ServerConfig(config) => {
                let snapshot = ServerSnapshot {
                    max_bandwidth: config.max_bandwidth.unwrap_or_default(),
                    allow_html: config.allow_html.unwrap_or_default(),
                    message_length: config.message_length.unwrap_or_default(),
                    image_message_length: config.image_message_length.unwrap_or_default(),
                    welcome_text: config.welcome_text.clone().unwrap_or_default(),
                };
                self.state.lock().apply_server_config(snapshot);
                let event = ServerConfigEvent {
                    max_bandwidth: config.max_bandwidth.unwrap_or_default(),
                    welcome_text: config.welcome_text.unwrap_or_default(),
                    allow_html: config.allow_html.unwrap_or_default(),
                    message_length: config.message_length.unwrap_or_default(),
                    image_message_length: config.image_message_length.unwrap_or_default(),
                };
                self.handler.server_config(&event);
            }
            ControlMessage::UdpTunnel(payload) => {
                self.dispatch_audio(&payload);
            }
        }

        Ok(Dispatch::Continue)
    }

    /// Process one audio packet (tunnelled or datagram; same layout).
    ///
    /// Malformed packets and codec failures are logged and dropped; audio is
    /// never session-fatal.
    pub(crate) fn dispatch_audio(&mut self, payload: &[u8]) {
        let parsed = match packet::parse_incoming(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("discarding malformed audio packet: {err}");
                return;
            }
        };

        let audio = match parsed {
            // Transport keepalive echo; nothing to deliver.
            IncomingPacket::Ping { .. } => return,
            IncomingPacket::Audio(audio) => audio,
        };

        if self.state.lock().user_muted(audio.session_id) {
            tracing::debug!(session = audio.session_id, "dropping audio from muted user");
            return;
        }

        match audio.codec {
            #[cfg(feature = "audio")]
            AudioCodec::Opus => match self.decoders.decode(audio.session_id, &audio.payload) {
                Ok(pcm) => {
                    let event = AudioEvent {
                        target: audio.target,
                        session_id: audio.session_id,
                        sequence: audio.sequence,
                        is_last: audio.is_last,
                        pcm: &pcm,
                    };
                    self.handler.audio(&event);
                }
                Err(err) => {
                    tracing::warn!(session = audio.session_id, "opus decode failed: {err}");
                }
            },
            _ => {
                let event = UnsupportedAudioEvent {
                    target: audio.target,
                    session_id: audio.session_id,
                    sequence: audio.sequence,
                    payload: &audio.payload,
                };
                self.handler.unsupported_audio(&event);
            }
        }
    }
}

fn norm_u32(value: Option<u32>) -> i32 {
    value.map(|v| v as i32).unwrap_or(-1)
}

fn norm_bool(value: Option<bool>) -> i32 {
    value.map(i32::from).unwrap_or(-1)
}
