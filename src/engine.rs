//! The handshake engine: intercepts the first request written to a proxy connection, runs the
//! Negotiate/Challenge/Authenticate exchange, and then relays bytes unmodified.
//!
//! The engine does no I/O of its own. It drives a [`Transport`] and is driven by the
//! [`TransportEvent`]s the caller feeds into [`NtlmProxyStream::handle_transport_event`];
//! everything the consumer needs to know is reported to an [`EventSink`].


use std::collections::VecDeque;
use std::fmt;
use std::io;

use base64::prelude::{BASE64_STANDARD, Engine};
use bytes::{Buf, Bytes};
use tracing::{debug, trace, warn};

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::http::{is_valid_header_line, split_first_request, splice_request, FirstRequest, ResponseHead};
use crate::message::{decode_challenge, encode_authenticate, encode_negotiate, ChallengeMessage, Flags};


/// A callback run once data has been handed to the connection, or once the connection is ready
/// or closed.
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;


/// The raw byte-stream connection to the proxy.
pub trait Transport {
    /// Opens the connection. Completion is reported through [`TransportEvent::Connected`] and
    /// `on_ready`.
    fn connect(&mut self, host: &str, port: u16, on_ready: Option<FlushCallback>) -> io::Result<()>;

    /// Queues bytes for sending; `on_flushed` runs once they have been written.
    fn write(&mut self, data: Bytes, on_flushed: Option<FlushCallback>) -> io::Result<()>;

    /// Closes the sending side of the connection.
    fn end(&mut self, on_closed: Option<FlushCallback>) -> io::Result<()>;
}


/// Notifications emitted by a [`Transport`].
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Data(Bytes),
    End,
    Closed,
    Timeout,
    Error(io::Error),
}


/// Notifications emitted by the engine to its consumer.
#[derive(Debug)]
pub enum ProxyEvent {
    /// A lifecycle event of the underlying transport, passed through unchanged. Never carries
    /// [`TransportEvent::Data`].
    Transport(TransportEvent),

    /// Bytes received after the handshake succeeded.
    Data(Bytes),

    /// The Negotiate request has been sent; carries the base64 token.
    NegotiateSent(String),

    /// The proxy's challenge has been accepted; carries the base64 token.
    ChallengeReceived(String),

    /// The Authenticate request has been sent; carries the base64 token.
    AuthenticateSent(String),

    /// The proxy accepted the credentials.
    Authorized,

    /// The handshake failed. Emitted at most once per connection.
    Error(Error),
}


/// Receives the engine's notifications.
pub trait EventSink {
    fn emit(&mut self, event: ProxyEvent);
}

/// Collects the notifications in order.
impl EventSink for Vec<ProxyEvent> {
    fn emit(&mut self, event: ProxyEvent) {
        self.push(event);
    }
}


/// The stage of the handshake.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stage {
    Idle,
    NegotiateSent,
    ChallengeReceived,
    AuthenticateSent,
    Authorized,
    Failed,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "Idle",
            Stage::NegotiateSent => "NegotiateSent",
            Stage::ChallengeReceived => "ChallengeReceived",
            Stage::AuthenticateSent => "AuthenticateSent",
            Stage::Authorized => "Authorized",
            Stage::Failed => "Failed",
        }
    }

    /// Whether the handshake is over, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Authorized | Stage::Failed)
    }

    fn is_handshaking(&self) -> bool {
        matches!(self, Stage::NegotiateSent | Stage::ChallengeReceived | Stage::AuthenticateSent)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


/// Settings for a proxy connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyOptions {
    /// Header lines (without CRLF) added to both handshake requests, e.g.
    /// `Proxy-Connection: keep-alive`.
    pub extra_headers: Vec<String>,

    /// Whether the response that completed the handshake is passed on to the consumer as its
    /// first [`ProxyEvent::Data`].
    ///
    /// Off by default, so a `CONNECT` tunnel only ever delivers tunneled bytes. Turn it on when
    /// the first request is an ordinary request whose answer the consumer wants to read.
    pub forward_authorized_response: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            extra_headers: Vec::new(),
            forward_authorized_response: false,
        }
    }
}


/// The first request, held until the handshake completes.
struct HeldRequest {
    request: FirstRequest,
    on_flushed: Option<FlushCallback>,
}


/// An NTLM-authenticating wrapper around one proxy connection.
pub struct NtlmProxyStream<T, S> {
    transport: T,
    sink: S,
    credentials: Credentials,
    options: ProxyOptions,
    stage: Stage,
    server_flags: Flags,
    nonce: [u8; 8],
    held: Option<HeldRequest>,
    queued: VecDeque<(Bytes, Option<FlushCallback>)>,
    challenge_body_remaining: usize,
}

impl<T: Transport, S: EventSink> NtlmProxyStream<T, S> {
    pub fn new(transport: T, sink: S, credentials: Credentials, options: ProxyOptions) -> Self {
        Self {
            transport,
            sink,
            credentials,
            options,
            stage: Stage::Idle,
            server_flags: Flags::empty(),
            nonce: [0; 8],
            held: None,
            queued: VecDeque::new(),
            challenge_body_remaining: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_parts(self) -> (T, S) {
        (self.transport, self.sink)
    }

    /// Opens the underlying connection.
    pub fn connect(&mut self, host: &str, port: u16, on_ready: Option<FlushCallback>) -> Result<()> {
        debug!(host, port, "connecting to proxy");
        self.transport.connect(host, port, on_ready)?;
        Ok(())
    }

    /// Closes the underlying connection.
    pub fn end(&mut self, on_closed: Option<FlushCallback>) -> Result<()> {
        self.transport.end(on_closed)?;
        Ok(())
    }

    /// Writes consumer bytes.
    ///
    /// The first write must contain a complete HTTP request head; it starts the handshake and its
    /// `on_flushed` runs once the proxy has accepted the credentials. Writes made while the
    /// handshake is running are queued and sent in order after it succeeds. If one of them cannot
    /// be handed to the transport, the rest are dropped without running their callbacks and the
    /// connection counts as failed. Afterwards, writes go straight to the transport.
    ///
    /// Handshake failures are reported through [`ProxyEvent::Error`]; the returned error is for
    /// transport failures and for writes once the connection has failed.
    pub fn write(&mut self, data: impl Into<Bytes>, on_flushed: Option<FlushCallback>) -> Result<()> {
        let data = data.into();
        match self.stage {
            Stage::Idle => self.send_negotiate(data, on_flushed),
            Stage::NegotiateSent | Stage::ChallengeReceived | Stage::AuthenticateSent => {
                trace!(len = data.len(), stage = %self.stage, "queueing write until authorized");
                self.queued.push_back((data, on_flushed));
                Ok(())
            },
            Stage::Authorized => {
                self.transport.write(data, on_flushed)?;
                Ok(())
            },
            Stage::Failed => Err(Error::HandshakeFailed),
        }
    }

    /// Processes a notification from the transport.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(chunk) => self.handle_data(chunk),
            other => {
                if self.stage.is_handshaking() {
                    debug!(event = ?other, stage = %self.stage, "transport event during handshake");
                }
                self.sink.emit(ProxyEvent::Transport(other));
            },
        }
    }

    fn handle_data(&mut self, chunk: Bytes) {
        match self.stage {
            Stage::NegotiateSent => self.handle_challenge(chunk),
            Stage::AuthenticateSent => self.handle_final_response(chunk),
            Stage::Authorized => self.sink.emit(ProxyEvent::Data(chunk)),
            Stage::Idle | Stage::ChallengeReceived | Stage::Failed => {
                warn!(len = chunk.len(), stage = %self.stage, "dropping inbound data");
            },
        }
    }

    fn send_negotiate(&mut self, data: Bytes, on_flushed: Option<FlushCallback>) -> Result<()> {
        if let Some(header) = self.options.extra_headers.iter().find(|h| !is_valid_header_line(h)) {
            let header = header.clone();
            self.fail(Error::InvalidExtraHeader { header });
            return Ok(());
        }

        let request = match split_first_request(&data) {
            Some(r) => r,
            None => {
                self.fail(Error::InvalidFirstRequest);
                return Ok(());
            },
        };

        let token = BASE64_STANDARD.encode(encode_negotiate(&self.credentials.domain, &self.credentials.hostname));
        let wire = splice_request(&request, &self.options.extra_headers, &token);
        self.held = Some(HeldRequest {
            request,
            on_flushed,
        });

        self.stage = Stage::NegotiateSent;
        if let Err(e) = self.transport.write(wire, None) {
            self.abandon();
            return Err(e.into());
        }
        debug!(stage = %self.stage, "negotiate request sent");
        trace!(token = %token, "negotiate token");
        self.sink.emit(ProxyEvent::NegotiateSent(token));
        Ok(())
    }

    fn handle_challenge(&mut self, chunk: Bytes) {
        let head = ResponseHead::parse(&chunk);
        let (token, challenge) = match read_challenge(&head) {
            Ok(tc) => tc,
            Err(e) => return self.fail(e),
        };

        self.stage = Stage::ChallengeReceived;
        self.server_flags = challenge.flags;
        self.nonce = challenge.challenge;
        self.challenge_body_remaining = head.content_length()
            .unwrap_or(0)
            .saturating_sub(head.body_received);
        debug!(flags = self.server_flags.bits(), body_pending = self.challenge_body_remaining, "challenge received");
        self.sink.emit(ProxyEvent::ChallengeReceived(token.to_owned()));

        self.send_authenticate();
    }

    fn send_authenticate(&mut self) {
        let held = match &self.held {
            Some(h) => h,
            None => return self.fail(Error::HandshakeFailed),
        };

        let message = encode_authenticate(&self.credentials, self.nonce, self.server_flags);
        let token = BASE64_STANDARD.encode(message);
        let wire = splice_request(&held.request, &self.options.extra_headers, &token);

        self.stage = Stage::AuthenticateSent;
        if let Err(e) = self.transport.write(wire, None) {
            self.abandon();
            self.sink.emit(ProxyEvent::Transport(TransportEvent::Error(e)));
            return;
        }
        debug!(stage = %self.stage, "authenticate request sent");
        trace!(token = %token, "authenticate token");
        self.sink.emit(ProxyEvent::AuthenticateSent(token));
    }

    fn handle_final_response(&mut self, mut chunk: Bytes) {
        if self.challenge_body_remaining > 0 {
            let skip = self.challenge_body_remaining.min(chunk.len());
            chunk.advance(skip);
            self.challenge_body_remaining -= skip;
            trace!(skipped = skip, remaining = self.challenge_body_remaining, "draining challenge body");
            if chunk.is_empty() {
                return;
            }
        }

        let head = ResponseHead::parse(&chunk);
        match head.status {
            Some(status) if status.is_success() => self.authorize(chunk),
            _ => self.fail(Error::AuthorizationRejected { status_line: head.status_line }),
        }
    }

    fn authorize(&mut self, response: Bytes) {
        self.stage = Stage::Authorized;
        debug!(queued = self.queued.len(), "proxy authorized the connection");
        self.sink.emit(ProxyEvent::Authorized);

        if let Some(held) = self.held.take() {
            if let Some(on_flushed) = held.on_flushed {
                on_flushed();
            }
        }

        while let Some((data, on_flushed)) = self.queued.pop_front() {
            if let Err(e) = self.transport.write(data, on_flushed) {
                // later writes must not reach the wire after a gap
                warn!(dropped = self.queued.len(), error = %e, "queued write failed");
                self.abandon();
                self.sink.emit(ProxyEvent::Transport(TransportEvent::Error(e)));
                return;
            }
        }

        if self.options.forward_authorized_response {
            self.sink.emit(ProxyEvent::Data(response));
        }
    }

    /// Stops the handshake without reporting a handshake error.
    fn abandon(&mut self) {
        self.stage = Stage::Failed;
        self.held = None;
        self.queued.clear();
    }

    fn fail(&mut self, error: Error) {
        warn!(stage = %self.stage, error = %error, "NTLM handshake failed");
        self.abandon();
        self.sink.emit(ProxyEvent::Error(error));
    }
}


fn read_challenge(head: &ResponseHead) -> Result<(&str, ChallengeMessage)> {
    match &head.status {
        Some(status) if status.is_auth_challenge() => {},
        _ => return Err(Error::ChallengeStatusMismatch { status_line: head.status_line.clone() }),
    }

    let token = head.ntlm_challenge_token()
        .ok_or(Error::NoChallengeHeader)?;
    let bytes = BASE64_STANDARD.decode(token)?;
    let challenge = decode_challenge(&bytes)?;
    Ok((token, challenge))
}
