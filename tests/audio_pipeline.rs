#![cfg(feature = "audio")]

mod support;

use std::sync::Arc;

use mumlet::messages::MessageKind;
use mumlet::packet::{AudioCodec, AudioHeader};
use mumlet::proto::mumble;
use mumlet::{varint, MumbleSession};
use support::{client_config, complete_handshake, read_until, send, send_raw, wait_until, Recorder, StubServer};

fn encode_opus_frame(pcm: &[i16]) -> Vec<u8> {
    let mut encoder =
        opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip).unwrap();
    let mut buffer = vec![0u8; 4096];
    let written = encoder.encode(pcm, &mut buffer).unwrap();
    buffer.truncate(written);
    buffer
}

/// Server-side relay format: header, sender session, sequence, length, frame.
fn relayed_packet(session: u32, sequence: u64, frame: &[u8], is_last: bool) -> Vec<u8> {
    let mut packet = vec![AudioHeader {
        codec: AudioCodec::Opus,
        target: 0,
    }
    .encode()];
    varint::encode(u64::from(session), &mut packet);
    varint::encode(sequence, &mut packet);
    let mut length = frame.len() as u64;
    if is_last {
        length |= 0x2000;
    }
    varint::encode(length, &mut packet);
    packet.extend_from_slice(frame);
    packet
}

#[tokio::test]
async fn local_mute_drops_inbound_audio_and_unmute_restores_it() {
    support::init_tracing();

    let stub = StubServer::bind().await;
    let port = stub.port();

    let server_task = tokio::spawn(async move {
        let mut stream = stub.accept().await;
        complete_handshake(&mut stream, 7, "").await;
        send(
            &mut stream,
            MessageKind::UserState,
            &mumble::UserState {
                session: Some(9),
                name: Some("bob".into()),
                channel_id: Some(0),
                ..Default::default()
            },
        )
        .await;

        let frame = encode_opus_frame(&vec![0i16; 960]);

        // First burst lands while bob is locally muted.
        let _ = read_until(&mut stream, MessageKind::UserStats).await;
        send_raw(
            &mut stream,
            MessageKind::UdpTunnel,
            relayed_packet(9, 0, &frame, true),
        )
        .await;
        send(
            &mut stream,
            MessageKind::TextMessage,
            &mumble::TextMessage {
                message: "after-muted-burst".into(),
                ..Default::default()
            },
        )
        .await;

        // Second burst after the client unmutes.
        let _ = read_until(&mut stream, MessageKind::UserStats).await;
        send_raw(
            &mut stream,
            MessageKind::UdpTunnel,
            relayed_packet(9, 0, &frame, true),
        )
        .await;
        send(
            &mut stream,
            MessageKind::TextMessage,
            &mumble::TextMessage {
                message: "after-live-burst".into(),
                ..Default::default()
            },
        )
        .await;
        stream
    });

    let recorder = Arc::new(Recorder::default());
    let mut session = MumbleSession::new(client_config(port, "alice"), recorder.clone());
    session.connect().await.expect("connect");

    assert!(wait_until(|| session.user_exists(9)).await);
    assert!(session.user_mute(9, true));
    assert!(session.request_user_stats(9, true));

    // Control ordering guarantees the audio preceded this marker.
    assert!(wait_until(|| recorder.texts.lock().len() == 1).await);
    assert!(
        recorder.audio_frames.lock().is_empty(),
        "muted sender must produce no audio callback"
    );

    assert!(session.user_mute(9, false));
    assert!(session.request_user_stats(9, true));
    assert!(wait_until(|| recorder.texts.lock().len() == 2).await);

    let frames = recorder.audio_frames.lock().clone();
    assert_eq!(frames.len(), 1);
    let (sender, sequence, is_last, samples) = frames[0];
    assert_eq!(sender, 9);
    assert_eq!(sequence, 0);
    assert!(is_last);
    assert_eq!(samples, 960);

    let _ = server_task.await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
async fn outbound_audio_is_tunnelled_as_opus_packets() {
    support::init_tracing();

    let stub = StubServer::bind().await;
    let port = stub.port();

    let server_task = tokio::spawn(async move {
        let mut stream = stub.accept().await;
        complete_handshake(&mut stream, 7, "").await;

        let tunnel = read_until(&mut stream, MessageKind::UdpTunnel).await;
        let bytes = tunnel.payload;

        // Client-originated layout: header, sequence, flagged length, frame.
        let header = AudioHeader::decode(bytes[0]).unwrap();
        assert_eq!(header.codec, AudioCodec::Opus);
        assert_eq!(header.target, 0);
        let (sequence, used) = varint::decode(&bytes[1..]).unwrap();
        assert_eq!(sequence, 0);
        let rest = &bytes[1 + used..];
        let (length, used) = varint::decode(rest).unwrap();
        assert_eq!(length & 0x2000, 0);
        let frame = &rest[used..used + (length & 0x1FFF) as usize];

        let mut decoder = opus::Decoder::new(48_000, opus::Channels::Mono).unwrap();
        let mut pcm = vec![0i16; 2880];
        let samples = decoder.decode(frame, &mut pcm, false).unwrap();
        assert_eq!(samples, 960);
        stream
    });

    let mut session = MumbleSession::new(
        client_config(port, "alice"),
        Arc::new(Recorder::default()),
    );
    session.connect().await.expect("connect");

    let pcm: Vec<i16> = (0..960).map(|i| ((i % 64) as i16) * 100).collect();
    assert!(session.audio_send(&pcm));

    let _ = server_task.await.unwrap();
    session.disconnect().await;
}
