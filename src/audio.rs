//! Opus encode/decode stages of the audio pipeline.
//!
//! The engine is fixed at 48 kHz mono, signed 16-bit host-endian PCM.
//! Embedders supplying other rates must resample before calling in.

#[cfg(feature = "audio")]
use std::collections::HashMap;
#[cfg(feature = "audio")]
use std::time::{Duration, Instant};

#[cfg(feature = "audio")]
use opus::{Application, Bitrate, Channels, Decoder as OpusDecoder, Encoder as OpusEncoder};
#[cfg(feature = "audio")]
use thiserror::Error;

#[cfg(feature = "audio")]
use crate::packet;

/// Fixed engine sample rate.
pub const SAMPLE_RATE: u32 = 48_000;
/// Fixed engine channel count.
pub const AUDIO_CHANNELS: u32 = 1;
/// Default Opus bitrate in bits per second.
pub const DEFAULT_OPUS_BITRATE: u32 = 40_000;

/// Largest Opus frame duration (60 ms) in samples at 48 kHz mono.
#[cfg(feature = "audio")]
const MAX_FRAME_SAMPLES: usize = 2880;
#[cfg(feature = "audio")]
const MAX_COMPRESSED_SIZE: usize = 4 * 1024;
/// Send silence longer than this starts a fresh talk burst (sequence 0).
#[cfg(feature = "audio")]
const BURST_IDLE_RESET: Duration = Duration::from_millis(400);
/// Upper bound on concurrently tracked remote speakers.
#[cfg(feature = "audio")]
const DECODER_BANK_CAPACITY: usize = 64;

/// PCM lengths the Opus codec accepts at 48 kHz mono.
#[cfg(feature = "audio")]
const VALID_FRAME_SAMPLES: [usize; 6] = [120, 240, 480, 960, 1920, 2880];

/// Errors that can occur while encoding PCM frames into audio packets.
#[cfg(feature = "audio")]
#[derive(Debug, Error)]
pub enum AudioEncodeError {
    /// Input slice is not a valid Opus frame duration.
    #[error("invalid frame size: {actual} samples is not a 48 kHz Opus frame")]
    InvalidFrameSize { actual: usize },
    /// Underlying Opus encoder failure.
    #[error(transparent)]
    Opus(#[from] opus::Error),
    /// Encoded frame did not fit the packet framing.
    #[error("framing error: {0}")]
    Framing(#[from] std::io::Error),
}

/// Errors that can occur while decoding received Opus frames.
#[cfg(feature = "audio")]
#[derive(Debug, Error)]
pub enum AudioDecodeError {
    /// Underlying Opus decoder failure.
    #[error(transparent)]
    Opus(#[from] opus::Error),
}

/// Stateful outbound encoder: Opus plus talk-burst sequence tracking.
#[cfg(feature = "audio")]
pub struct AudioEncoder {
    encoder: OpusEncoder,
    sequence: u64,
    last_frame_at: Option<Instant>,
}

#[cfg(feature = "audio")]
impl AudioEncoder {
    /// Create a VOIP-mode mono encoder at the given bitrate.
    pub fn new(bitrate: u32) -> Result<Self, opus::Error> {
        let mut encoder = OpusEncoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(bitrate as i32))?;
        Ok(Self {
            encoder,
            sequence: 0,
            last_frame_at: None,
        })
    }

    /// Encode one PCM frame into a complete wire packet for `target`.
    ///
    /// The sequence number is monotonic within a talk burst and restarts at
    /// zero after the terminator frame or a send pause.
    pub fn encode_frame(
        &mut self,
        pcm: &[i16],
        target: u8,
        is_last: bool,
    ) -> Result<Vec<u8>, AudioEncodeError> {
        if !VALID_FRAME_SAMPLES.contains(&pcm.len()) {
            return Err(AudioEncodeError::InvalidFrameSize { actual: pcm.len() });
        }

        let now = Instant::now();
        let burst_expired = self
            .last_frame_at
            .map_or(true, |last| now.duration_since(last) > BURST_IDLE_RESET);
        if burst_expired {
            self.sequence = 0;
        }

        let mut buffer = vec![0u8; MAX_COMPRESSED_SIZE];
        let encoded_bytes = self.encoder.encode(pcm, &mut buffer)?;
        buffer.truncate(encoded_bytes);

        let wire = packet::build_outgoing_opus(target, self.sequence, &buffer, is_last)?;

        if is_last {
            self.sequence = 0;
            self.last_frame_at = None;
        } else {
            self.sequence = self.sequence.wrapping_add(1);
            self.last_frame_at = Some(now);
        }
        Ok(wire)
    }
}

#[cfg(feature = "audio")]
struct SessionDecoder {
    decoder: OpusDecoder,
    last_used: u64,
}

/// Per-sender Opus decoders in a bounded least-recently-heard bank.
///
/// Concurrent speakers keep independent codec state; when more than
/// [`DECODER_BANK_CAPACITY`] senders are live, the stalest is dropped and
/// will transparently resynchronize on its next burst.
#[cfg(feature = "audio")]
pub struct DecoderBank {
    decoders: HashMap<u32, SessionDecoder>,
    clock: u64,
}

#[cfg(feature = "audio")]
impl DecoderBank {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            clock: 0,
        }
    }

    /// Decode one Opus frame from the given sender into PCM.
    pub fn decode(&mut self, session_id: u32, frame: &[u8]) -> Result<Vec<i16>, AudioDecodeError> {
        use std::collections::hash_map::Entry;

        self.clock += 1;

        if self.decoders.len() >= DECODER_BANK_CAPACITY
            && !self.decoders.contains_key(&session_id)
        {
            if let Some(stalest) = self
                .decoders
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(session, _)| *session)
            {
                self.decoders.remove(&stalest);
            }
        }

        let entry = match self.decoders.entry(session_id) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(SessionDecoder {
                decoder: OpusDecoder::new(SAMPLE_RATE, Channels::Mono)?,
                last_used: 0,
            }),
        };
        entry.last_used = self.clock;

        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
        let samples = entry.decoder.decode(frame, &mut pcm, false)?;
        pcm.truncate(samples);
        Ok(pcm)
    }

    /// Drop the decoder of a sender that left.
    pub fn forget(&mut self, session_id: u32) {
        self.decoders.remove(&session_id);
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.decoders.len()
    }
}

#[cfg(feature = "audio")]
impl Default for DecoderBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "audio"))]
mod tests {
    use super::*;
    use crate::packet::{parse_incoming, IncomingPacket};
    use crate::varint;

    fn parse_outgoing(wire: &[u8]) -> (u8, u64, bool, Vec<u8>) {
        let header = crate::packet::AudioHeader::decode(wire[0]).unwrap();
        assert_eq!(header.codec, crate::packet::AudioCodec::Opus);
        let (sequence, used) = varint::decode(&wire[1..]).unwrap();
        let rest = &wire[1 + used..];
        let (length, used) = varint::decode(rest).unwrap();
        let frame = rest[used..used + (length & 0x1FFF) as usize].to_vec();
        (header.target, sequence, length & 0x2000 != 0, frame)
    }

    #[test]
    fn encode_then_decode_reproduces_frame_duration() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let mut bank = DecoderBank::new();

        for samples in [480usize, 960, 1920, 2880] {
            let pcm: Vec<i16> = (0..samples).map(|i| ((i % 128) as i16) * 64).collect();
            let wire = encoder.encode_frame(&pcm, 0, true).unwrap();
            let (_, _, _, frame) = parse_outgoing(&wire);
            let decoded = bank.decode(77, &frame).unwrap();
            assert_eq!(decoded.len(), samples);
        }
    }

    #[test]
    fn sequence_is_monotonic_within_a_burst() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let pcm = vec![0i16; 960];

        for expected in 0..4u64 {
            let wire = encoder.encode_frame(&pcm, 3, false).unwrap();
            let (target, sequence, is_last, _) = parse_outgoing(&wire);
            assert_eq!(target, 3);
            assert_eq!(sequence, expected);
            assert!(!is_last);
        }
    }

    #[test]
    fn terminator_frame_restarts_the_sequence() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let pcm = vec![0i16; 960];

        encoder.encode_frame(&pcm, 0, false).unwrap();
        let wire = encoder.encode_frame(&pcm, 0, true).unwrap();
        let (_, sequence, is_last, _) = parse_outgoing(&wire);
        assert_eq!(sequence, 1);
        assert!(is_last);

        let wire = encoder.encode_frame(&pcm, 0, false).unwrap();
        let (_, sequence, _, _) = parse_outgoing(&wire);
        assert_eq!(sequence, 0);
    }

    #[test]
    fn invalid_frame_sizes_are_rejected() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        for samples in [0usize, 1, 100, 961] {
            let pcm = vec![0i16; samples];
            assert!(matches!(
                encoder.encode_frame(&pcm, 0, false),
                Err(AudioEncodeError::InvalidFrameSize { .. })
            ));
        }
    }

    #[test]
    fn decoder_bank_evicts_stalest_sender() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let pcm = vec![0i16; 960];
        let wire = encoder.encode_frame(&pcm, 0, true).unwrap();
        let (_, _, _, frame) = parse_outgoing(&wire);

        let mut bank = DecoderBank::new();
        for session in 0..=DECODER_BANK_CAPACITY as u32 {
            bank.decode(session, &frame).unwrap();
        }
        assert_eq!(bank.tracked_sessions(), DECODER_BANK_CAPACITY);

        // Session 0 was the stalest and must have been evicted.
        bank.decode(1, &frame).unwrap();
        assert_eq!(bank.tracked_sessions(), DECODER_BANK_CAPACITY);
    }

    #[test]
    fn forget_drops_decoder_state() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let pcm = vec![0i16; 960];
        let wire = encoder.encode_frame(&pcm, 0, true).unwrap();
        let (_, _, _, frame) = parse_outgoing(&wire);

        let mut bank = DecoderBank::new();
        bank.decode(5, &frame).unwrap();
        assert_eq!(bank.tracked_sessions(), 1);
        bank.forget(5);
        assert_eq!(bank.tracked_sessions(), 0);
    }

    #[test]
    fn encoded_packets_parse_as_server_would_relay_them() {
        let mut encoder = AudioEncoder::new(DEFAULT_OPUS_BITRATE).unwrap();
        let pcm = vec![0i16; 960];
        let wire = encoder.encode_frame(&pcm, 31, false).unwrap();
        let (target, sequence, is_last, frame) = parse_outgoing(&wire);

        // Relay adds the sender session between header and sequence.
        let relayed =
            crate::packet::server_opus_packet(target, 7, sequence, &frame, is_last);
        match parse_incoming(&relayed).unwrap() {
            IncomingPacket::Audio(audio) => {
                assert_eq!(audio.target, 31);
                assert_eq!(audio.session_id, 7);
                assert_eq!(audio.payload, frame);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
