//! Embedder-facing session façade.
//!
//! One `MumbleSession` owns one connection, one state store and one audio
//! pipeline. Commands issued from other threads are enqueued to the
//! connection task and never block on I/O; state queries take a short
//! internal lock and are safe from any thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[cfg(feature = "audio")]
use crate::audio::AudioEncoder;
use crate::dispatcher::Dispatcher;
use crate::handler::EventHandler;
use crate::messages::{write_message, ControlMessage, TcpFrameDecoder};
use crate::proto::mumble;
use crate::state::{Channel, ClientState, ServerSnapshot, User};
use crate::transport::{self, Command, ConnectionState, RunLoop, TransportStatus};
use crate::MumletError;

/// Command queue depth between embedder threads and the connection task.
const COMMAND_QUEUE_DEPTH: usize = 64;
/// Upper bound on how long `disconnect` waits for the run loop to return.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);
/// Comments at least this long are sent as a SHA-1 digest.
const COMMENT_HASH_THRESHOLD: usize = 128;

/// How repeated `voice_target_set` calls for one target id combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceTargetMode {
    /// Each call replaces the target's routing list.
    #[default]
    Replace,
    /// Each call appends to the target's routing list.
    Accumulate,
}

/// What a voice target routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTargetKind {
    Channel,
    User,
}

/// Boolean `UserState` fields the client may set on itself or others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStateField {
    Mute,
    Deaf,
    Suppress,
    SelfMute,
    SelfDeaf,
    PrioritySpeaker,
    Recording,
}

/// User-provided parameters that describe how to reach a Mumble server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// TCP port, defaults to the public Mumble port.
    pub port: u16,
    /// Optional TLS server name override.
    pub tls_server_name: Option<String>,
    /// Duration to wait for the TCP connection and each handshake message.
    pub connect_timeout: Duration,
    /// Allow invalid or self-signed TLS certificates.
    pub accept_invalid_certs: bool,
    /// Username presented to the server during authentication.
    pub username: String,
    /// Optional password required by the server or user account.
    pub password: Option<String>,
    /// Additional access tokens supplied during authentication.
    pub tokens: Vec<String>,
    /// PEM-encoded client certificate chain for TLS client auth.
    pub cert_pem: Option<String>,
    /// PEM-encoded private key matching `cert_pem`.
    pub key_pem: Option<String>,
    /// Outbound Opus bitrate in bits per second.
    pub opus_bitrate: u32,
    /// PCM sample rate; only 48000 is supported.
    pub audio_samplerate: u32,
    /// PCM channel count; only mono is supported.
    pub audio_channels: u32,
    /// Behavior of repeated voice-target configuration calls.
    pub voice_target_mode: VoiceTargetMode,
}

impl SessionConfig {
    /// Create a new configuration for the given host, using the default port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 64738,
            tls_server_name: None,
            connect_timeout: Duration::from_secs(10),
            accept_invalid_certs: true,
            username: "mumlet".to_string(),
            password: None,
            tokens: Vec::new(),
            cert_pem: None,
            key_pem: None,
            opus_bitrate: crate::audio::DEFAULT_OPUS_BITRATE,
            audio_samplerate: crate::audio::SAMPLE_RATE,
            audio_channels: crate::audio::AUDIO_CHANNELS,
            voice_target_mode: VoiceTargetMode::default(),
        }
    }

    /// Begin building a custom configuration for the given host.
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig::new(host),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Fluent builder for configuring a [`SessionConfig`].
#[derive(Clone, Debug)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Override the TCP port used when connecting.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set a custom TLS server name for SNI/certificate matching.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls_server_name = Some(name.into());
        self
    }

    /// Configure the duration to wait during connection setup.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Control whether invalid/self-signed certificates are accepted.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// Set the username presented to the server.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    /// Provide a password used during authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Replace the entire access token list.
    pub fn tokens(mut self, tokens: impl Into<Vec<String>>) -> Self {
        self.config.tokens = tokens.into();
        self
    }

    /// Append a single access token to the configuration.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.tokens.push(token.into());
        self
    }

    /// Install a PEM certificate and private key for TLS client auth.
    pub fn client_identity(
        mut self,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        self.config.cert_pem = Some(cert_pem.into());
        self.config.key_pem = Some(key_pem.into());
        self
    }

    /// Override the outbound Opus bitrate.
    pub fn opus_bitrate(mut self, bitrate: u32) -> Self {
        self.config.opus_bitrate = bitrate;
        self
    }

    /// Select how repeated voice-target calls combine.
    pub fn voice_target_mode(mut self, mode: VoiceTargetMode) -> Self {
        self.config.voice_target_mode = mode;
        self
    }

    /// Finalise the builder, producing an owned [`SessionConfig`].
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// A client session with a Mumble server.
///
/// Owns the transport, the replicated server state and the audio pipeline.
/// Callbacks on the supplied [`EventHandler`] are delivered from the
/// connection task.
pub struct MumbleSession {
    config: SessionConfig,
    handler: Arc<dyn EventHandler>,
    state: Arc<Mutex<ClientState>>,
    status: Arc<Mutex<TransportStatus>>,
    voice_targets: Mutex<HashMap<u8, Vec<mumble::voice_target::Target>>>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl MumbleSession {
    /// Create a session handle with the provided configuration and observer.
    pub fn new(config: SessionConfig, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            config,
            handler,
            state: Arc::new(Mutex::new(ClientState::new())),
            status: Arc::new(Mutex::new(TransportStatus::default())),
            voice_targets: Mutex::new(HashMap::new()),
            command_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            connection_task: Mutex::new(None),
        }
    }

    /// Return the connection configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    //
    // Lifecycle
    //

    /// Connect, authenticate, and start the connection task.
    ///
    /// Returns once `ServerSync` has been received (the channel and user
    /// tables are already populated at that point). Fails with
    /// [`MumletError::AlreadyConnected`] while a previous cycle is active.
    pub async fn connect(&mut self) -> Result<(), MumletError> {
        if self.config.username.trim().is_empty() {
            return Err(MumletError::InvalidConfig(
                "username may not be empty".into(),
            ));
        }
        if self.config.audio_samplerate != crate::audio::SAMPLE_RATE {
            return Err(MumletError::InvalidConfig(format!(
                "unsupported sample rate {}",
                self.config.audio_samplerate
            )));
        }
        if self.config.audio_channels != crate::audio::AUDIO_CHANNELS {
            return Err(MumletError::InvalidConfig(format!(
                "unsupported channel count {}",
                self.config.audio_channels
            )));
        }

        {
            let mut status = self.status.lock();
            if status.state != ConnectionState::NotConnected {
                return Err(MumletError::AlreadyConnected);
            }
            status.state = ConnectionState::InProgress;
            status.last_failure = None;
        }
        self.state.lock().clear();

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut status = self.status.lock();
                status.state = ConnectionState::NotConnected;
                status.last_failure = Some(err.to_string());
                drop(status);
                self.state.lock().clear();
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), MumletError> {
        #[cfg(feature = "audio")]
        let encoder = AudioEncoder::new(self.config.opus_bitrate)
            .map_err(|err| MumletError::InvalidConfig(format!("opus encoder: {err}")))?;

        let mut stream = transport::open_stream(&self.config).await?;
        let mut decoder = TcpFrameDecoder::new();
        let mut dispatcher = Dispatcher::new(Arc::clone(&self.state), Arc::clone(&self.handler));

        transport::handshake(&mut stream, &mut decoder, &mut dispatcher, &self.config).await?;

        // Restore the retained voice-target table on the fresh session.
        let retained: Vec<ControlMessage> = {
            let table = self.voice_targets.lock();
            let mut ids: Vec<u8> = table.keys().copied().collect();
            ids.sort_unstable();
            ids.iter()
                .map(|id| {
                    ControlMessage::VoiceTarget(mumble::VoiceTarget {
                        id: Some(u32::from(*id)),
                        targets: table[id].clone(),
                    })
                })
                .collect()
        };
        for message in &retained {
            write_message(&mut stream, message).await?;
        }

        self.status.lock().state = ConnectionState::Connected;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = RunLoop {
            decoder,
            dispatcher,
            status: Arc::clone(&self.status),
            state: Arc::clone(&self.state),
            handler: Arc::clone(&self.handler),
            #[cfg(feature = "audio")]
            encoder,
            cmd_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(run.run(stream));

        *self.command_tx.lock() = Some(cmd_tx);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        if let Some(previous) = self.connection_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Tear the connection down and wait for the connection task to return.
    ///
    /// Idempotent; completes within a bounded grace period. After return,
    /// every state query is empty and no further callback fires.
    pub async fn disconnect(&self) {
        if let Some(tx) = self.shutdown_tx.lock().as_ref() {
            let _ = tx.send(true);
        }
        let task = self.connection_task.lock().take();
        if let Some(task) = task {
            let _ = timeout(DISCONNECT_GRACE, task).await;
        }
        *self.command_tx.lock() = None;
    }

    /// Current transport state.
    pub fn transport_state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Cause of the most recent involuntary teardown, if any.
    pub fn last_failure(&self) -> Option<String> {
        self.status.lock().last_failure.clone()
    }

    //
    // State queries
    //

    /// Session id assigned by the server, or 0 before `ServerSync`.
    pub fn my_session_id(&self) -> u32 {
        self.state.lock().my_session_id()
    }

    /// Channel currently occupied by this client.
    pub fn channel_current(&self) -> u32 {
        self.state.lock().channel_current()
    }

    pub fn channel_list(&self) -> Vec<Channel> {
        self.state.lock().channel_list()
    }

    pub fn channel_exists(&self, channel_id: u32) -> bool {
        self.state.lock().channel_exists(channel_id)
    }

    /// Resolve a channel name to its id, or -1 when unknown.
    pub fn channel_find(&self, name: &str) -> i64 {
        self.state.lock().channel_find(name)
    }

    pub fn user_get(&self, session_id: u32) -> Option<User> {
        self.state.lock().user_get(session_id)
    }

    pub fn user_list(&self) -> Vec<User> {
        self.state.lock().user_list()
    }

    pub fn users_in_channel(&self, channel_id: i32) -> Vec<User> {
        self.state.lock().users_in_channel(channel_id)
    }

    pub fn user_exists(&self, session_id: u32) -> bool {
        self.state.lock().user_exists(session_id)
    }

    pub fn user_muted(&self, session_id: u32) -> bool {
        self.state.lock().user_muted(session_id)
    }

    /// Resolve a user name to its session id, or -1 when unknown.
    pub fn user_find(&self, name: &str) -> i64 {
        self.state.lock().user_find(name)
    }

    /// Server-wide settings from the last `ServerConfig`.
    pub fn server_snapshot(&self) -> ServerSnapshot {
        self.state.lock().server().clone()
    }

    //
    // Commands
    //

    /// Locally mute or unmute a user; never echoed to the server.
    pub fn user_mute(&self, session_id: u32, mute: bool) -> bool {
        self.state.lock().user_mute(session_id, mute)
    }

    /// Ask the server to move this client into a known channel.
    pub fn channel_join(&self, channel_id: u32) -> bool {
        if !self.channel_exists(channel_id) {
            return false;
        }
        self.send_control(ControlMessage::UserState(mumble::UserState {
            channel_id: Some(channel_id),
            ..Default::default()
        }))
    }

    /// Send a text message to the current channel.
    pub fn text_send(&self, message: &str) -> bool {
        let (actor, channel_id) = {
            let state = self.state.lock();
            (state.my_session_id(), state.channel_current())
        };
        self.send_control(ControlMessage::TextMessage(mumble::TextMessage {
            actor: Some(actor),
            channel_id: vec![channel_id],
            message: message.to_string(),
            ..Default::default()
        }))
    }

    /// Set one boolean field of this client's published user state.
    pub fn user_send_state(&self, field: UserStateField, value: bool) -> bool {
        let mut user_state = mumble::UserState::default();
        match field {
            UserStateField::Mute => user_state.mute = Some(value),
            UserStateField::Deaf => user_state.deaf = Some(value),
            UserStateField::Suppress => user_state.suppress = Some(value),
            UserStateField::SelfMute => user_state.self_mute = Some(value),
            UserStateField::SelfDeaf => user_state.self_deaf = Some(value),
            UserStateField::PrioritySpeaker => user_state.priority_speaker = Some(value),
            UserStateField::Recording => user_state.recording = Some(value),
        }
        self.send_control(ControlMessage::UserState(user_state))
    }

    /// Publish the client's comment; long comments travel as a SHA-1 digest.
    pub fn user_send_comment(&self, text: &str) -> bool {
        self.send_control(ControlMessage::UserState(build_comment_state(text)))
    }

    /// Ask the server for a user's statistics.
    pub fn request_user_stats(&self, session_id: u32, stats_only: bool) -> bool {
        self.send_control(ControlMessage::UserStats(mumble::UserStats {
            session: Some(session_id),
            stats_only: Some(stats_only),
            ..Default::default()
        }))
    }

    /// Push a fresh access-token list onto the live connection.
    pub fn set_access_tokens(&self, tokens: Vec<String>) -> bool {
        self.send_control(ControlMessage::Authenticate(mumble::Authenticate {
            tokens,
            ..Default::default()
        }))
    }

    /// Configure voice target `target_id` (1..=30) to route to a channel or
    /// user by id, then push the table to the server.
    pub fn voice_target_set(&self, target_id: u8, kind: VoiceTargetKind, id: u32) -> bool {
        if !(1..=30).contains(&target_id) {
            return false;
        }

        let target = match kind {
            VoiceTargetKind::Channel => mumble::voice_target::Target {
                channel_id: Some(id),
                children: Some(true),
                ..Default::default()
            },
            VoiceTargetKind::User => mumble::voice_target::Target {
                session: vec![id],
                ..Default::default()
            },
        };

        let targets = {
            let mut table = self.voice_targets.lock();
            let entry = table.entry(target_id).or_default();
            match self.config.voice_target_mode {
                VoiceTargetMode::Replace => *entry = vec![target],
                VoiceTargetMode::Accumulate => entry.push(target),
            }
            entry.clone()
        };

        self.send_control(ControlMessage::VoiceTarget(mumble::VoiceTarget {
            id: Some(u32::from(target_id)),
            targets,
        }))
    }

    /// Like [`voice_target_set`](Self::voice_target_set), resolving the
    /// channel or user by name first.
    pub fn voice_target_set_by_name(
        &self,
        target_id: u8,
        kind: VoiceTargetKind,
        name: &str,
    ) -> bool {
        let id = match kind {
            VoiceTargetKind::Channel => self.channel_find(name),
            VoiceTargetKind::User => self.user_find(name),
        };
        if id < 0 {
            return false;
        }
        self.voice_target_set(target_id, kind, id as u32)
    }

    fn send_control(&self, message: ControlMessage) -> bool {
        if self.transport_state() != ConnectionState::Connected {
            return false;
        }
        let tx = self.command_tx.lock().clone();
        match tx {
            Some(tx) => tx.try_send(Command::Control(message)).is_ok(),
            None => false,
        }
    }

    //
    // Audio
    //

    /// Encode and ship one PCM frame to the current channel.
    #[cfg(feature = "audio")]
    pub fn audio_send(&self, pcm: &[i16]) -> bool {
        self.audio_send_target(pcm, 0)
    }

    /// Encode and ship one PCM frame to the given voice target.
    ///
    /// Target 0 is the current channel, 1..=30 the configured voice targets,
    /// 31 server loopback. Empty input and a disconnected transport are
    /// no-ops.
    #[cfg(feature = "audio")]
    pub fn audio_send_target(&self, pcm: &[i16], target: u8) -> bool {
        self.enqueue_audio(pcm, target, false)
    }

    /// Like [`audio_send_target`](Self::audio_send_target) but flags the
    /// frame as the end of the talk burst.
    #[cfg(feature = "audio")]
    pub fn audio_send_burst_end(&self, pcm: &[i16], target: u8) -> bool {
        self.enqueue_audio(pcm, target, true)
    }

    #[cfg(feature = "audio")]
    fn enqueue_audio(&self, pcm: &[i16], target: u8, end_of_burst: bool) -> bool {
        if pcm.is_empty() || target > 31 {
            return false;
        }
        if self.transport_state() != ConnectionState::Connected {
            return false;
        }
        let tx = self.command_tx.lock().clone();
        match tx {
            Some(tx) => tx
                .try_send(Command::Audio {
                    pcm: pcm.to_vec(),
                    target,
                    end_of_burst,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl Drop for MumbleSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.connection_task.lock().take() {
            task.abort();
        }
    }
}

/// Build the `UserState` carrying a comment, hashing it when long.
///
/// Comments of 128 bytes or more are replaced by the lowercase hex SHA-1
/// digest in `comment_hash`, per the blob-offload convention.
pub(crate) fn build_comment_state(text: &str) -> mumble::UserState {
    let mut user_state = mumble::UserState::default();
    if text.len() < COMMENT_HASH_THRESHOLD {
        user_state.comment = Some(text.to_string());
    } else {
        let digest = Sha1::digest(text.as_bytes());
        user_state.comment_hash = Some(hex::encode(digest).into_bytes());
    }
    user_state
}
