//! Scripted TLS stub server shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rcgen::generate_simple_self_signed;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};
use tokio_rustls::rustls::{self, ServerConfig as TlsServerConfig};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use mumlet::handler::{
    AudioEvent, EventHandler, ServerSyncEvent, TextMessageEvent, UnsupportedAudioEvent,
    UserStateEvent,
};
use mumlet::messages::{read_envelope, MessageEnvelope, MessageKind};
use mumlet::proto::mumble;
use mumlet::{DisconnectReason, SessionConfig};

pub struct StubServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl StubServer {
    /// Bind an ephemeral TLS listener with a self-signed certificate.
    pub async fn bind() -> Self {
        let cert = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());
        let cert_chain = vec![rustls::pki_types::CertificateDer::from(
            cert.serialize_der().unwrap(),
        )];

        let mut tls_config = TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .unwrap();
        tls_config.alpn_protocols = vec![b"mumble".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener, acceptor }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> TlsStream<TcpStream> {
        let (socket, _) = self.listener.accept().await.unwrap();
        self.acceptor.accept(socket).await.unwrap()
    }
}

/// Client configuration pointing at the stub.
pub fn client_config(port: u16, username: &str) -> SessionConfig {
    SessionConfig::builder("127.0.0.1")
        .port(port)
        .username(username)
        .accept_invalid_certs(true)
        .connect_timeout(Duration::from_secs(5))
        .build()
}

pub async fn send<M: prost::Message>(
    stream: &mut TlsStream<TcpStream>,
    kind: MessageKind,
    message: &M,
) {
    MessageEnvelope::try_from_message(kind, message)
        .unwrap()
        .write_to(stream)
        .await
        .unwrap();
}

pub async fn send_raw(stream: &mut TlsStream<TcpStream>, kind: MessageKind, payload: Vec<u8>) {
    MessageEnvelope::new(kind, payload)
        .write_to(stream)
        .await
        .unwrap();
}

/// Consume the client's Version and Authenticate, then finish the handshake
/// with a Version and `ServerSync`.
pub async fn complete_handshake(
    stream: &mut TlsStream<TcpStream>,
    session_id: u32,
    welcome: &str,
) -> mumble::Authenticate {
    let version = read_envelope(stream).await.unwrap();
    assert_eq!(version.kind, MessageKind::Version);
    let auth_envelope = read_envelope(stream).await.unwrap();
    assert_eq!(auth_envelope.kind, MessageKind::Authenticate);
    let auth =
        <mumble::Authenticate as prost::Message>::decode(auth_envelope.payload.as_slice()).unwrap();

    send(
        stream,
        MessageKind::Version,
        &mumble::Version {
            version: Some(0x0001_0500),
            release: Some("stub".into()),
            ..Default::default()
        },
    )
    .await;
    send(
        stream,
        MessageKind::ServerSync,
        &mumble::ServerSync {
            session: Some(session_id),
            welcome_text: Some(welcome.to_string()),
            ..Default::default()
        },
    )
    .await;
    auth
}

/// Read frames until one of the given kind arrives, skipping pings.
pub async fn read_until(stream: &mut TlsStream<TcpStream>, kind: MessageKind) -> MessageEnvelope {
    loop {
        let envelope = read_envelope(stream).await.unwrap();
        if envelope.kind == kind {
            return envelope;
        }
        assert_eq!(
            envelope.kind,
            MessageKind::Ping,
            "unexpected frame while waiting for {kind:?}"
        );
    }
}

/// Poll a condition until it holds or a 5 s deadline passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Event recorder used as the embedder in integration tests.
#[derive(Default)]
pub struct Recorder {
    pub syncs: Mutex<Vec<ServerSyncEvent>>,
    pub user_states: Mutex<Vec<UserStateEvent>>,
    pub texts: Mutex<Vec<TextMessageEvent>>,
    pub audio_frames: Mutex<Vec<(u32, u64, bool, usize)>>,
    pub unsupported: Mutex<Vec<u32>>,
    pub disconnects: Mutex<Vec<DisconnectReason>>,
}

impl EventHandler for Recorder {
    fn server_sync(&self, event: &ServerSyncEvent) {
        self.syncs.lock().push(event.clone());
    }
    fn user_state(&self, event: &UserStateEvent) {
        self.user_states.lock().push(event.clone());
    }
    fn text_message(&self, event: &TextMessageEvent) {
        self.texts.lock().push(event.clone());
    }
    fn audio(&self, event: &AudioEvent<'_>) {
        self.audio_frames.lock().push((
            event.session_id,
            event.sequence,
            event.is_last,
            event.pcm.len(),
        ));
    }
    fn unsupported_audio(&self, event: &UnsupportedAudioEvent<'_>) {
        self.unsupported.lock().push(event.session_id);
    }
    fn disconnected(&self, reason: &DisconnectReason) {
        self.disconnects.lock().push(reason.clone());
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok();
}
