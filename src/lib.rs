//! NTLM authentication against HTTP proxies, tunneled over a byte stream.
//!
//! The first HTTP request written to the connection is intercepted: it is sent once with an NTLM
//! Negotiate token, then again with the Authenticate token answering the proxy's challenge. Once
//! the proxy accepts, writes and reads pass through unmodified.
//!
//! Sample usage:
//! ```no_run
//! use ntlm_proxy_stream::{Credentials, ProxyClient, ProxyEvent, ProxyOptions, TransportEvent};
//!
//! async fn fetch_through_proxy() -> Result<Vec<u8>, Box<dyn std::error::Error>> {
//!     let creds = Credentials::from_password("CORP", "alice", "hunter2", "WORKSTATION1")?;
//!     let options = ProxyOptions {
//!         extra_headers: vec!["Proxy-Connection: keep-alive".to_owned()],
//!         // the answer to the GET below is the response that completes the handshake
//!         forward_authorized_response: true,
//!     };
//!     let mut client = ProxyClient::connect("proxy.example.com", 8080, creds, options, None)?;
//!
//!     client.write(&b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n"[..], None).await?;
//!
//!     let mut response = Vec::new();
//!     while let Some(event) = client.next_event().await {
//!         match event {
//!             ProxyEvent::Data(bytes) => response.extend_from_slice(&bytes),
//!             ProxyEvent::Error(e) => return Err(e.into()),
//!             ProxyEvent::Transport(TransportEvent::Closed) => break,
//!             _ => {},
//!         }
//!     }
//!     Ok(response)
//! }
//! ```
//!
//! Without Tokio, drive an [`NtlmProxyStream`] directly with any [`Transport`] and feed it
//! [`TransportEvent`]s.


pub mod credentials;
pub mod crypto;
mod encoding;
pub mod engine;
pub mod error;
pub mod http;
pub mod message;
#[cfg(feature = "tokio")]
pub mod tcp;


pub use crate::credentials::{hashes_of, Credentials, CredentialsError, HashPair};
pub use crate::crypto::{expand_key, lm_hash, nt_hash, resolve_challenge};
pub use crate::engine::{
    EventSink, FlushCallback, NtlmProxyStream, ProxyEvent, ProxyOptions, Stage, Transport, TransportEvent,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::message::{
    decode_challenge, encode_authenticate, encode_negotiate, AuthenticateMessage, ChallengeMessage, DecodeError,
    Flags, NegotiateMessage, SecurityBuffer,
};
#[cfg(feature = "tokio")]
pub use crate::tcp::{ProxyClient, TcpTransport};
