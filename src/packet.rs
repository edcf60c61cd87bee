//! Wire codec for Mumble audio packets.
//!
//! Audio travels either as UDP datagrams or tunnelled through the control
//! channel inside `UDPTunnel` frames; the byte layout is identical. A packet
//! is a header byte carrying the codec in the top three bits and the voice
//! target in the low five, followed by varint fields and the codec payload.

use std::io;

use crate::varint;

/// Opus terminator flag carried in the payload-length varint.
const OPUS_LAST_FLAG: u64 = 0x2000;
/// Opus payload length mask; lengths above this cannot be framed.
const OPUS_LENGTH_MASK: u64 = 0x1FFF;

/// Codec discriminator from the top three bits of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    CeltAlpha,
    Ping,
    Speex,
    CeltBeta,
    Opus,
}

impl AudioCodec {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(AudioCodec::CeltAlpha),
            1 => Some(AudioCodec::Ping),
            2 => Some(AudioCodec::Speex),
            3 => Some(AudioCodec::CeltBeta),
            4 => Some(AudioCodec::Opus),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            AudioCodec::CeltAlpha => 0,
            AudioCodec::Ping => 1,
            AudioCodec::Speex => 2,
            AudioCodec::CeltBeta => 3,
            AudioCodec::Opus => 4,
        }
    }
}

/// Decoded header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub codec: AudioCodec,
    pub target: u8,
}

impl AudioHeader {
    pub fn encode(self) -> u8 {
        (self.codec.to_bits() << 5) | (self.target & 0x1F)
    }

    pub fn decode(byte: u8) -> io::Result<Self> {
        let codec = AudioCodec::from_bits(byte >> 5)
            .ok_or_else(|| malformed(format!("unknown audio codec {}", byte >> 5)))?;
        Ok(Self {
            codec,
            target: byte & 0x1F,
        })
    }
}

/// A server-originated packet parsed from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingPacket {
    Audio(IncomingAudio),
    /// Transport-level echo; carries the sender's timestamp.
    Ping { timestamp: u64 },
}

/// Voice data addressed to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAudio {
    pub codec: AudioCodec,
    pub target: u8,
    pub session_id: u32,
    pub sequence: u64,
    /// Terminator flag of the talk burst (Opus only; false for other codecs).
    pub is_last: bool,
    /// One Opus frame, or the raw undecoded tail for unsupported codecs.
    pub payload: Vec<u8>,
}

/// Parse a packet received from the server.
pub fn parse_incoming(buf: &[u8]) -> io::Result<IncomingPacket> {
    let header = AudioHeader::decode(*buf.first().ok_or_else(|| malformed("empty packet"))?)?;
    let mut rest = &buf[1..];

    if header.codec == AudioCodec::Ping {
        let (timestamp, _) = varint::decode(rest)?;
        return Ok(IncomingPacket::Ping { timestamp });
    }

    let (session, used) = varint::decode(rest)?;
    rest = &rest[used..];
    let (sequence, used) = varint::decode(rest)?;
    rest = &rest[used..];

    let (is_last, payload) = match header.codec {
        AudioCodec::Opus => {
            let (length, used) = varint::decode(rest)?;
            rest = &rest[used..];
            let len = (length & OPUS_LENGTH_MASK) as usize;
            let frame = rest
                .get(..len)
                .ok_or_else(|| malformed("truncated opus payload"))?;
            // Positional audio may trail the frame; it is not forwarded.
            (length & OPUS_LAST_FLAG != 0, frame.to_vec())
        }
        // Legacy codecs keep their own frame headers; handed on undecoded.
        _ => (false, rest.to_vec()),
    };

    Ok(IncomingPacket::Audio(IncomingAudio {
        codec: header.codec,
        target: header.target,
        session_id: session as u32,
        sequence,
        is_last,
        payload,
    }))
}

/// Assemble a client-originated Opus packet.
pub fn build_outgoing_opus(
    target: u8,
    sequence: u64,
    frame: &[u8],
    is_last: bool,
) -> io::Result<Vec<u8>> {
    if frame.len() as u64 > OPUS_LENGTH_MASK {
        return Err(malformed(format!(
            "opus frame too large: {} bytes",
            frame.len()
        )));
    }

    let header = AudioHeader {
        codec: AudioCodec::Opus,
        target: target & 0x1F,
    };

    let mut packet = Vec::with_capacity(1 + 10 + frame.len());
    packet.push(header.encode());
    varint::encode(sequence, &mut packet);
    let mut length = frame.len() as u64;
    if is_last {
        length |= OPUS_LAST_FLAG;
    }
    varint::encode(length, &mut packet);
    packet.extend_from_slice(frame);
    Ok(packet)
}

fn malformed(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Build the wire bytes a server would produce for an Opus packet.
///
/// Test helper mirroring the server-side relay format (header, sender
/// session, sequence, flagged length, frame).
#[cfg(test)]
pub(crate) fn server_opus_packet(
    target: u8,
    session: u32,
    sequence: u64,
    frame: &[u8],
    is_last: bool,
) -> Vec<u8> {
    let mut packet = vec![AudioHeader {
        codec: AudioCodec::Opus,
        target,
    }
    .encode()];
    varint::encode(u64::from(session), &mut packet);
    varint::encode(sequence, &mut packet);
    let mut length = frame.len() as u64;
    if is_last {
        length |= OPUS_LAST_FLAG;
    }
    varint::encode(length, &mut packet);
    packet.extend_from_slice(frame);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_for_all_targets() {
        for codec in [
            AudioCodec::CeltAlpha,
            AudioCodec::Ping,
            AudioCodec::Speex,
            AudioCodec::CeltBeta,
            AudioCodec::Opus,
        ] {
            for target in 0..32u8 {
                let header = AudioHeader { codec, target };
                let byte = header.encode();
                assert_eq!(AudioHeader::decode(byte).unwrap(), header);
            }
        }
    }

    #[test]
    fn header_rejects_unknown_codec() {
        for bits in 5..8u8 {
            assert!(AudioHeader::decode(bits << 5).is_err());
        }
    }

    #[test]
    fn incoming_opus_parses_fields() {
        let frame = [0xAAu8; 33];
        let bytes = server_opus_packet(3, 900, 17, &frame, false);
        match parse_incoming(&bytes).unwrap() {
            IncomingPacket::Audio(audio) => {
                assert_eq!(audio.codec, AudioCodec::Opus);
                assert_eq!(audio.target, 3);
                assert_eq!(audio.session_id, 900);
                assert_eq!(audio.sequence, 17);
                assert!(!audio.is_last);
                assert_eq!(audio.payload, frame);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn terminator_flag_roundtrips() {
        let bytes = server_opus_packet(0, 7, 2, &[1, 2, 3], true);
        match parse_incoming(&bytes).unwrap() {
            IncomingPacket::Audio(audio) => assert!(audio.is_last),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn outgoing_packet_carries_no_session_field() {
        let packet = build_outgoing_opus(31, 5, &[9, 9], true).unwrap();
        // header + seq varint + length varint + payload
        assert_eq!(packet.len(), 1 + 1 + 2 + 2);
        assert_eq!(packet[0], (4 << 5) | 31);
        assert_eq!(packet[1], 5);
    }

    #[test]
    fn oversized_opus_frame_is_rejected() {
        let frame = vec![0u8; 0x2000];
        assert!(build_outgoing_opus(0, 0, &frame, false).is_err());
    }

    #[test]
    fn ping_packet_parses_timestamp_only() {
        let mut bytes = vec![AudioHeader {
            codec: AudioCodec::Ping,
            target: 0,
        }
        .encode()];
        varint::encode(123_456, &mut bytes);
        assert_eq!(
            parse_incoming(&bytes).unwrap(),
            IncomingPacket::Ping { timestamp: 123_456 }
        );
    }

    #[test]
    fn unsupported_codec_payload_passes_through_raw() {
        let mut bytes = vec![AudioHeader {
            codec: AudioCodec::Speex,
            target: 1,
        }
        .encode()];
        varint::encode(42, &mut bytes);
        varint::encode(9, &mut bytes);
        bytes.extend_from_slice(&[0x80, 0x01, 0x02]);
        match parse_incoming(&bytes).unwrap() {
            IncomingPacket::Audio(audio) => {
                assert_eq!(audio.codec, AudioCodec::Speex);
                assert_eq!(audio.session_id, 42);
                assert_eq!(audio.sequence, 9);
                assert_eq!(audio.payload, vec![0x80, 0x01, 0x02]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn truncated_packets_are_rejected() {
        assert!(parse_incoming(&[]).is_err());
        let bytes = server_opus_packet(0, 7, 2, &[1, 2, 3, 4], false);
        assert!(parse_incoming(&bytes[..bytes.len() - 2]).is_err());
    }
}
