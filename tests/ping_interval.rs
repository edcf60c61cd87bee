mod support;

use std::sync::Arc;
use std::time::Duration;

use mumlet::messages::{read_envelope, MessageKind};
use mumlet::proto::mumble;
use mumlet::MumbleSession;
use support::{client_config, complete_handshake, send, Recorder, StubServer};

#[tokio::test]
async fn idle_connection_emits_keepalive_pings() {
    support::init_tracing();

    let stub = StubServer::bind().await;
    let port = stub.port();

    let server_task = tokio::spawn(async move {
        let mut stream = stub.accept().await;
        complete_handshake(&mut stream, 7, "").await;

        // No traffic flows, so the next frame must be a keepalive ping
        // roughly one interval after the handshake.
        let envelope = tokio::time::timeout(Duration::from_secs(10), read_envelope(&mut stream))
            .await
            .expect("ping within the keepalive window")
            .unwrap();
        assert_eq!(envelope.kind, MessageKind::Ping);
        let ping = <mumble::Ping as prost::Message>::decode(envelope.payload.as_slice()).unwrap();
        assert!(ping.timestamp.is_some());

        // Echo it back the way a server does.
        send(&mut stream, MessageKind::Ping, &ping).await;
        stream
    });

    let mut session = MumbleSession::new(
        client_config(port, "alice"),
        Arc::new(Recorder::default()),
    );
    session.connect().await.expect("connect");

    let _ = server_task.await.unwrap();
    session.disconnect().await;
}
