//! Client-side protocol engine for the Mumble voice chat protocol.
//!
//! The engine opens an authenticated TLS session with a Mumble server,
//! replicates channel and user state, exchanges control messages, and
//! pipelines voice audio through the Opus codec in both directions. The
//! embedder supplies credentials and an [`EventHandler`]; audio is exchanged
//! as 48 kHz mono PCM.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mumlet::{MumbleSession, NoopHandler, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder("mumble.example")
//!         .username("rust-bot")
//!         .accept_invalid_certs(true)
//!         .build();
//!
//!     let mut session = MumbleSession::new(config, Arc::new(NoopHandler));
//!     session.connect().await?;
//!     session.text_send("hello from mumlet");
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod audio;
mod dispatcher;
pub mod error;
pub mod handler;
pub mod messages;
pub mod packet;
pub mod proto;
pub mod session;
pub mod state;
pub mod transport;
pub mod varint;

pub use error::MumletError;
pub use handler::{DisconnectReason, EventHandler, NoopHandler};
pub use session::{
    MumbleSession, SessionConfig, SessionConfigBuilder, UserStateField, VoiceTargetKind,
    VoiceTargetMode,
};
pub use state::{Channel, ServerSnapshot, User};
pub use transport::ConnectionState;
