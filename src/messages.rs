use prost::{EncodeError, Message};
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::mumble::{
    Authenticate, BanList, ChannelRemove, ChannelState, CodecVersion, Ping, Reject, ServerConfig,
    ServerSync, TextMessage, UserRemove, UserState, UserStats, Version, VoiceTarget,
};

/// Protocol revision tuple (major, minor, patch) advertised to the server.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (1, 2, 4);
/// Size of the Mumble TCP framing header in bytes.
pub const TCP_PREAMBLE_SIZE: usize = 6;
/// Frames longer than this are a protocol violation.
pub const MAX_TCP_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Stateful TCP frame decoder.
///
/// Retains partial reads across `.read_next()` calls, preventing framing
/// desynchronization when frames arrive fragmented.
#[derive(Debug)]
pub struct TcpFrameDecoder {
    rxbuf: Vec<u8>,
    rxcount: usize,
    msgsize: Option<usize>,
}

impl Default for TcpFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFrameDecoder {
    pub fn new() -> Self {
        Self {
            rxbuf: vec![0u8; 8192],
            rxcount: 0,
            msgsize: None,
        }
    }

    pub async fn read_next<R>(&mut self, reader: &mut R) -> Result<MessageEnvelope, io::Error>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let target = match self.msgsize {
                None => TCP_PREAMBLE_SIZE,
                Some(len) => TCP_PREAMBLE_SIZE + len,
            };
            if self.rxbuf.len() < target {
                self.rxbuf.resize(target, 0);
            }

            if self.rxcount < target {
                let n = reader.read(&mut self.rxbuf[self.rxcount..target]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected EOF while reading Mumble frame",
                    ));
                }
                self.rxcount += n;
            }

            if self.msgsize.is_none() && self.rxcount >= TCP_PREAMBLE_SIZE {
                let msg_type = u16::from_be_bytes([self.rxbuf[0], self.rxbuf[1]]);
                let length = u32::from_be_bytes([
                    self.rxbuf[2],
                    self.rxbuf[3],
                    self.rxbuf[4],
                    self.rxbuf[5],
                ]) as usize;

                if length > MAX_TCP_FRAME_SIZE {
                    self.rxcount = 0;
                    self.msgsize = None;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame too large: {length} bytes (type={msg_type})"),
                    ));
                }

                self.msgsize = Some(length);
            }

            if let Some(len) = self.msgsize {
                if self.rxcount >= TCP_PREAMBLE_SIZE + len {
                    let msg_type = u16::from_be_bytes([self.rxbuf[0], self.rxbuf[1]]);
                    let payload = self.rxbuf[TCP_PREAMBLE_SIZE..TCP_PREAMBLE_SIZE + len].to_vec();
                    self.rxcount = 0;
                    self.msgsize = None;
                    return Ok(MessageEnvelope::new(MessageKind::from_id(msg_type), payload));
                }
            }
        }
    }
}

/// Control channel message identifier.
///
/// Covers the complete Mumble tag space; a tag outside it decodes to
/// `Unknown` and tears the session down at the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Version,
    /// Audio packet tunnelled over the control channel.
    UdpTunnel,
    Authenticate,
    Ping,
    Reject,
    ServerSync,
    ChannelRemove,
    ChannelState,
    UserRemove,
    UserState,
    BanList,
    TextMessage,
    PermissionDenied,
    Acl,
    QueryUsers,
    CryptSetup,
    ContextActionModify,
    ContextAction,
    UserList,
    VoiceTarget,
    PermissionQuery,
    CodecVersion,
    UserStats,
    RequestBlob,
    ServerConfig,
    SuggestConfig,
    /// Tag outside the protocol enumeration.
    Unknown(u16),
}

impl MessageKind {
    /// Construct a message kind from its wire identifier.
    pub fn from_id(value: u16) -> Self {
        match value {
            0 => MessageKind::Version,
            1 => MessageKind::UdpTunnel,
            2 => MessageKind::Authenticate,
            3 => MessageKind::Ping,
            4 => MessageKind::Reject,
            5 => MessageKind::ServerSync,
            6 => MessageKind::ChannelRemove,
            7 => MessageKind::ChannelState,
            8 => MessageKind::UserRemove,
            9 => MessageKind::UserState,
            10 => MessageKind::BanList,
            11 => MessageKind::TextMessage,
            12 => MessageKind::PermissionDenied,
            13 => MessageKind::Acl,
            14 => MessageKind::QueryUsers,
            15 => MessageKind::CryptSetup,
            16 => MessageKind::ContextActionModify,
            17 => MessageKind::ContextAction,
            18 => MessageKind::UserList,
            19 => MessageKind::VoiceTarget,
            20 => MessageKind::PermissionQuery,
            21 => MessageKind::CodecVersion,
            22 => MessageKind::UserStats,
            23 => MessageKind::RequestBlob,
            24 => MessageKind::ServerConfig,
            25 => MessageKind::SuggestConfig,
            other => MessageKind::Unknown(other),
        }
    }

    /// Return the numeric identifier associated with this message kind.
    pub fn as_id(self) -> u16 {
        match self {
            MessageKind::Version => 0,
            MessageKind::UdpTunnel => 1,
            MessageKind::Authenticate => 2,
            MessageKind::Ping => 3,
            MessageKind::Reject => 4,
            MessageKind::ServerSync => 5,
            MessageKind::ChannelRemove => 6,
            MessageKind::ChannelState => 7,
            MessageKind::UserRemove => 8,
            MessageKind::UserState => 9,
            MessageKind::BanList => 10,
            MessageKind::TextMessage => 11,
            MessageKind::PermissionDenied => 12,
            MessageKind::Acl => 13,
            MessageKind::QueryUsers => 14,
            MessageKind::CryptSetup => 15,
            MessageKind::ContextActionModify => 16,
            MessageKind::ContextAction => 17,
            MessageKind::UserList => 18,
            MessageKind::VoiceTarget => 19,
            MessageKind::PermissionQuery => 20,
            MessageKind::CodecVersion => 21,
            MessageKind::UserStats => 22,
            MessageKind::RequestBlob => 23,
            MessageKind::ServerConfig => 24,
            MessageKind::SuggestConfig => 25,
            MessageKind::Unknown(value) => value,
        }
    }
}

/// A framed control message: tag plus undecoded payload bytes.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Message identifier.
    pub kind: MessageKind,
    /// Serialized protobuf payload (or a raw audio packet for `UdpTunnel`).
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Build an envelope from raw parts.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build an envelope from a protobuf message.
    pub fn try_from_message<M: Message>(
        kind: MessageKind,
        message: &M,
    ) -> Result<Self, EncodeError> {
        let mut payload = Vec::new();
        message.encode(&mut payload)?;
        Ok(Self { kind, payload })
    }

    /// Serialize the message envelope to the provided async writer.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.kind.as_id();
        let length = self.payload.len() as u32;

        let mut header = [0u8; TCP_PREAMBLE_SIZE];
        header[..2].copy_from_slice(&id.to_be_bytes());
        header[2..].copy_from_slice(&length.to_be_bytes());

        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await?;

        Ok(())
    }

    /// Serialize the envelope into a contiguous byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TCP_PREAMBLE_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.kind.as_id().to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Read a single message from the wire using the standard Mumble framing.
pub async fn read_envelope<R>(reader: &mut R) -> Result<MessageEnvelope, io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TCP_PREAMBLE_SIZE];
    reader.read_exact(&mut header).await?;

    let msg_type = u16::from_be_bytes([header[0], header[1]]);
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length > MAX_TCP_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {length} bytes"),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(MessageEnvelope::new(MessageKind::from_id(msg_type), payload))
}

/// Fully typed representation of a control message the engine models.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Version(Version),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    BanList(BanList),
    TextMessage(TextMessage),
    VoiceTarget(VoiceTarget),
    PermissionQuery(crate::proto::mumble::PermissionQuery),
    CodecVersion(CodecVersion),
    UserStats(UserStats),
    ServerConfig(ServerConfig),
    /// Raw audio packet tunnelled through the control channel.
    UdpTunnel(Vec<u8>),
}

impl ControlMessage {
    /// Return the message identifier corresponding to this variant.
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Version(_) => MessageKind::Version,
            ControlMessage::Authenticate(_) => MessageKind::Authenticate,
            ControlMessage::Ping(_) => MessageKind::Ping,
            ControlMessage::Reject(_) => MessageKind::Reject,
            ControlMessage::ServerSync(_) => MessageKind::ServerSync,
            ControlMessage::ChannelRemove(_) => MessageKind::ChannelRemove,
            ControlMessage::ChannelState(_) => MessageKind::ChannelState,
            ControlMessage::UserRemove(_) => MessageKind::UserRemove,
            ControlMessage::UserState(_) => MessageKind::UserState,
            ControlMessage::BanList(_) => MessageKind::BanList,
            ControlMessage::TextMessage(_) => MessageKind::TextMessage,
            ControlMessage::VoiceTarget(_) => MessageKind::VoiceTarget,
            ControlMessage::PermissionQuery(_) => MessageKind::PermissionQuery,
            ControlMessage::CodecVersion(_) => MessageKind::CodecVersion,
            ControlMessage::UserStats(_) => MessageKind::UserStats,
            ControlMessage::ServerConfig(_) => MessageKind::ServerConfig,
            ControlMessage::UdpTunnel(_) => MessageKind::UdpTunnel,
        }
    }

    /// Convert the message into a framed envelope ready to send on the wire.
    pub fn encode(&self) -> Result<MessageEnvelope, EncodeError> {
        match self {
            ControlMessage::Version(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::Authenticate(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::Ping(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::Reject(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::ServerSync(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::ChannelRemove(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::ChannelState(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::UserRemove(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::UserState(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::BanList(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::TextMessage(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::VoiceTarget(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::PermissionQuery(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::CodecVersion(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::UserStats(msg) => MessageEnvelope::try_from_message(self.kind(), msg),
            ControlMessage::ServerConfig(msg) => {
                MessageEnvelope::try_from_message(self.kind(), msg)
            }
            ControlMessage::UdpTunnel(payload) => {
                Ok(MessageEnvelope::new(MessageKind::UdpTunnel, payload.clone()))
            }
        }
    }
}

/// Errors that can occur while decoding a `MessageEnvelope` into a `ControlMessage`.
#[derive(Debug, Error)]
pub enum MessageDecodeError {
    /// Protobuf decoding failed for the given message type.
    #[error("failed to decode {kind:?}: {source}")]
    Decode {
        /// Message identifier that failed to decode.
        kind: MessageKind,
        /// Underlying protobuf decode error.
        #[source]
        source: prost::DecodeError,
    },
    /// Tag is part of the protocol but carries no decoder in this engine.
    #[error("no decoder for {kind:?}")]
    Unhandled { kind: MessageKind },
    /// Tag outside the protocol enumeration.
    #[error("unknown message tag {tag}")]
    UnknownTag { tag: u16 },
}

impl TryFrom<MessageEnvelope> for ControlMessage {
    type Error = MessageDecodeError;

    fn try_from(envelope: MessageEnvelope) -> Result<Self, Self::Error> {
        fn decode<M: Message + Default>(
            kind: MessageKind,
            payload: &[u8],
            wrap: impl FnOnce(M) -> ControlMessage,
        ) -> Result<ControlMessage, MessageDecodeError> {
            M::decode(payload)
                .map(wrap)
                .map_err(|source| MessageDecodeError::Decode { kind, source })
        }

        let kind = envelope.kind;
        let payload = envelope.payload;
        match kind {
            MessageKind::Version => decode(kind, &payload, ControlMessage::Version),
            MessageKind::Authenticate => decode(kind, &payload, ControlMessage::Authenticate),
            MessageKind::Ping => decode(kind, &payload, ControlMessage::Ping),
            MessageKind::Reject => decode(kind, &payload, ControlMessage::Reject),
            MessageKind::ServerSync => decode(kind, &payload, ControlMessage::ServerSync),
            MessageKind::ChannelRemove => decode(kind, &payload, ControlMessage::ChannelRemove),
            MessageKind::ChannelState => decode(kind, &payload, ControlMessage::ChannelState),
            MessageKind::UserRemove => decode(kind, &payload, ControlMessage::UserRemove),
            MessageKind::UserState => decode(kind, &payload, ControlMessage::UserState),
            MessageKind::BanList => decode(kind, &payload, ControlMessage::BanList),
            MessageKind::TextMessage => decode(kind, &payload, ControlMessage::TextMessage),
            MessageKind::VoiceTarget => decode(kind, &payload, ControlMessage::VoiceTarget),
            MessageKind::PermissionQuery => decode(kind, &payload, ControlMessage::PermissionQuery),
            MessageKind::CodecVersion => decode(kind, &payload, ControlMessage::CodecVersion),
            MessageKind::UserStats => decode(kind, &payload, ControlMessage::UserStats),
            MessageKind::ServerConfig => decode(kind, &payload, ControlMessage::ServerConfig),
            MessageKind::UdpTunnel => Ok(ControlMessage::UdpTunnel(payload)),
            MessageKind::PermissionDenied
            | MessageKind::Acl
            | MessageKind::QueryUsers
            | MessageKind::CryptSetup
            | MessageKind::ContextActionModify
            | MessageKind::ContextAction
            | MessageKind::UserList
            | MessageKind::RequestBlob
            | MessageKind::SuggestConfig => Err(MessageDecodeError::Unhandled { kind }),
            MessageKind::Unknown(tag) => Err(MessageDecodeError::UnknownTag { tag }),
        }
    }
}

/// Encode and write a typed message to the provided writer.
pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), io::Error>
where
    W: AsyncWrite + Unpin,
{
    let envelope = message
        .encode()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    envelope.write_to(writer).await
}
