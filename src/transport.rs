//! Secure-stream lifecycle: TLS connect, handshake, and the run loop that
//! multiplexes control messages, tunnelled audio, keepalive and shutdown.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

#[cfg(feature = "audio")]
use crate::audio::AudioEncoder;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::handler::{DisconnectReason, EventHandler};
use crate::messages::{write_message, ControlMessage, MessageKind, TcpFrameDecoder};
use crate::proto::mumble::{Authenticate, Ping, Version};
use crate::session::SessionConfig;
use crate::state::ClientState;
use crate::MumletError;

/// Keepalive ping cadence on the control channel.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Server silence longer than this tears the session down.
pub(crate) const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// CELT 0.7.0 bitstream version advertised for legacy interop.
const CELT_VERSION: i32 = -2147483637;

/// Connection lifecycle as observed through the session façade.
///
/// A failed cycle parks on `NotConnected` with the cause retained in
/// [`TransportStatus::last_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    InProgress,
    Connected,
    Disconnecting,
}

/// Shared view of the transport state machine.
#[derive(Debug, Default)]
pub(crate) struct TransportStatus {
    pub state: ConnectionState,
    pub last_failure: Option<String>,
}

/// Work enqueued to the run loop by embedder-facing calls.
pub(crate) enum Command {
    Control(ControlMessage),
    #[cfg(feature = "audio")]
    Audio {
        pcm: Vec<i16>,
        target: u8,
        end_of_burst: bool,
    },
}

/// Open the TCP+TLS stream to the configured server.
pub(crate) async fn open_stream(
    config: &SessionConfig,
) -> Result<TlsStream<TcpStream>, MumletError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp_stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(MumletError::Network(err)),
        Err(_) => {
            return Err(MumletError::Timeout("TCP connect".into()));
        }
    };
    tcp_stream.set_nodelay(true)?;

    let server_name_str = config.tls_server_name.as_deref().unwrap_or(&config.host);
    let server_name = ServerName::try_from(server_name_str.to_string())
        .map_err(|_| MumletError::InvalidConfig("invalid TLS server name".into()))?;

    let connector = create_tls_connector(config)?;
    let tls_stream = connector.connect(server_name, tcp_stream).await?;
    Ok(tls_stream)
}

/// Drive the authentication handshake until `ServerSync`.
///
/// Every inbound message flows through the dispatcher, so channel and user
/// tables are already populated when this returns.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    decoder: &mut TcpFrameDecoder,
    dispatcher: &mut Dispatcher,
    config: &SessionConfig,
) -> Result<(), MumletError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &ControlMessage::Version(build_version_message())).await?;
    write_message(
        stream,
        &ControlMessage::Authenticate(build_authenticate_message(config)),
    )
    .await?;

    loop {
        let envelope = match timeout(config.connect_timeout, decoder.read_next(stream)).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(err)) => return Err(MumletError::Network(err)),
            Err(_) => return Err(MumletError::Timeout("handshake message".into())),
        };

        match dispatcher.dispatch_control(envelope)? {
            Dispatch::Continue => {}
            Dispatch::Synced => return Ok(()),
            Dispatch::Rejected(reason) => return Err(MumletError::Rejected(reason)),
        }
    }
}

/// Everything the connection task owns besides the stream itself.
pub(crate) struct RunLoop {
    pub decoder: TcpFrameDecoder,
    pub dispatcher: Dispatcher,
    pub status: Arc<Mutex<TransportStatus>>,
    pub state: Arc<Mutex<ClientState>>,
    pub handler: Arc<dyn EventHandler>,
    #[cfg(feature = "audio")]
    pub encoder: AudioEncoder,
    pub cmd_rx: mpsc::Receiver<Command>,
    pub shutdown: watch::Receiver<bool>,
}

impl RunLoop {
    /// Post-handshake I/O loop; runs on the connection task until disconnect.
    ///
    /// On exit the state tables are cleared, the failure cause (if any) is
    /// recorded, the final `disconnected` callback fires and the status parks
    /// on `NotConnected`. No callback is delivered afterwards.
    pub(crate) async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let RunLoop {
            mut decoder,
            mut dispatcher,
            status,
            state,
            handler,
            #[cfg(feature = "audio")]
            mut encoder,
            mut cmd_rx,
            mut shutdown,
        } = self;
        let mut stream = stream;

        let mut ticker = interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sent = Instant::now();
        let mut last_ping_rx = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if last_ping_rx.elapsed() > KEEPALIVE_TIMEOUT {
                        break DisconnectReason::KeepaliveTimeout;
                    }
                    if last_sent.elapsed() >= PING_INTERVAL {
                        let ping = ControlMessage::Ping(Ping {
                            timestamp: Some(current_millis()),
                            ..Default::default()
                        });
                        if let Err(err) = write_message(&mut stream, &ping).await {
                            break DisconnectReason::ConnectionLost(err.to_string());
                        }
                        last_sent = Instant::now();
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Control(message)) => {
                            if let Err(err) = write_message(&mut stream, &message).await {
                                break DisconnectReason::ConnectionLost(err.to_string());
                            }
                            last_sent = Instant::now();
                        }
                        #[cfg(feature = "audio")]
                        Some(Command::Audio { pcm, target, end_of_burst }) => {
                            match encoder.encode_frame(&pcm, target, end_of_burst) {
                                Ok(wire) => {
                                    let message = ControlMessage::UdpTunnel(wire);
                                    if let Err(err) = write_message(&mut stream, &message).await {
                                        break DisconnectReason::ConnectionLost(err.to_string());
                                    }
                                    last_sent = Instant::now();
                                }
                                Err(err) => {
                                    tracing::warn!("dropping audio frame: {err}");
                                }
                            }
                        }
                        None => break DisconnectReason::Requested,
                    }
                }
                result = decoder.read_next(&mut stream) => {
                    match result {
                        Ok(envelope) => {
                            if envelope.kind == MessageKind::Ping {
                                last_ping_rx = Instant::now();
                            }
                            match dispatcher.dispatch_control(envelope) {
                                Ok(Dispatch::Continue) | Ok(Dispatch::Synced) => {}
                                Ok(Dispatch::Rejected(reason)) => {
                                    break DisconnectReason::Rejected(reason);
                                }
                                Err(err) => {
                                    break DisconnectReason::ProtocolViolation(err.to_string());
                                }
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                            break DisconnectReason::ProtocolViolation(err.to_string());
                        }
                        Err(err) => {
                            break DisconnectReason::ConnectionLost(err.to_string());
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break DisconnectReason::Requested;
                    }
                }
            }
        };

        tracing::info!("connection closing: {reason:?}");
        {
            let mut status = status.lock();
            status.state = ConnectionState::Disconnecting;
            if reason != DisconnectReason::Requested {
                status.last_failure = Some(format!("{reason:?}"));
            }
        }
        state.lock().clear();
        handler.disconnected(&reason);
        status.lock().state = ConnectionState::NotConnected;
    }
}

fn create_tls_connector(config: &SessionConfig) -> Result<TlsConnector, MumletError> {
    let builder = rustls::ClientConfig::builder();

    let builder = if config.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
    } else {
        let root_store = rustls::RootCertStore::empty();
        builder.with_root_certificates(root_store)
    };

    let mut tls_config = match (&config.cert_pem, &config.key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let (certs, key) = load_client_identity(cert_pem, key_pem)?;
            builder.with_client_auth_cert(certs, key)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(MumletError::InvalidConfig(
                "client certificate and key must be configured together".into(),
            ));
        }
    };

    tls_config.alpn_protocols.push(b"mumble".to_vec());

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Parse a PEM certificate chain and private key for client authentication.
fn load_client_identity(
    cert_pem: &str,
    key_pem: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), MumletError> {
    let mut cert_slice = cert_pem.as_bytes();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_slice)
        .collect::<Result<_, _>>()
        .map_err(|err| MumletError::InvalidConfig(format!("invalid client certificate: {err}")))?;
    if certs.is_empty() {
        return Err(MumletError::InvalidConfig(
            "no certificate found in PEM input".into(),
        ));
    }

    let mut key_slice = key_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut key_slice)
        .map_err(|err| MumletError::InvalidConfig(format!("invalid client key: {err}")))?
        .ok_or_else(|| MumletError::InvalidConfig("no private key found in PEM input".into()))?;

    Ok((certs, key))
}

#[derive(Debug, Default)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn build_version_message() -> Version {
    use crate::messages::PROTOCOL_VERSION;
    use std::env;

    let packed = (PROTOCOL_VERSION.0 << 16) | (PROTOCOL_VERSION.1 << 8) | PROTOCOL_VERSION.2;

    Version {
        version: Some(packed),
        release: Some(format!("mumlet {}", env!("CARGO_PKG_VERSION"))),
        os: Some(format!("{} {}", env::consts::OS, env::consts::ARCH)),
        os_version: Some(format!("Rust {}", env!("CARGO_PKG_VERSION"))),
    }
}

pub(crate) fn build_authenticate_message(config: &SessionConfig) -> Authenticate {
    Authenticate {
        username: Some(config.username.clone()),
        password: config.password.clone(),
        tokens: config.tokens.clone(),
        celt_versions: vec![CELT_VERSION],
        opus: Some(true),
        client_type: Some(0),
    }
}
