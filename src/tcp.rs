//! Tokio-based TCP transport and the async wiring of engine and transport.
//!
//! [`TcpTransport`] keeps the synchronous [`Transport`] contract of the engine by handing commands
//! to a driver task; inbound bytes and lifecycle changes come back as [`TransportEvent`]s on a
//! channel. [`ProxyClient`] pumps those events into an [`NtlmProxyStream`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::credentials::Credentials;
use crate::engine::{
    EventSink, FlushCallback, NtlmProxyStream, ProxyEvent, ProxyOptions, Stage, Transport, TransportEvent,
};
use crate::error::Result;

const READ_CHUNK: usize = 8192;

/// Forwards notifications to a channel; they are dropped once the receiver is gone.
impl EventSink for mpsc::UnboundedSender<ProxyEvent> {
    fn emit(&mut self, event: ProxyEvent) {
        if let Err(e) = self.send(event) {
            trace!(event = ?e.0, "event receiver dropped");
        }
    }
}

enum Command {
    Connect {
        host: String,
        port: u16,
        on_ready: Option<FlushCallback>,
    },
    Write(Bytes, Option<FlushCallback>),
    End(Option<FlushCallback>),
}

/// TCP transport to the proxy
///
/// Must be created inside a Tokio runtime.
pub struct TcpTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl TcpTransport {
    /// Create a transport reporting to `events`
    ///
    /// A read that stays idle for longer than `idle_timeout` produces a
    /// [`TransportEvent::Timeout`]; the connection stays open.
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>, idle_timeout: Option<Duration>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drive(receiver, events, idle_timeout));
        Self { commands }
    }

    fn send(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "transport driver has stopped"))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16, on_ready: Option<FlushCallback>) -> io::Result<()> {
        self.send(Command::Connect {
            host: host.to_owned(),
            port,
            on_ready,
        })
    }

    fn write(&mut self, data: Bytes, on_flushed: Option<FlushCallback>) -> io::Result<()> {
        self.send(Command::Write(data, on_flushed))
    }

    fn end(&mut self, on_closed: Option<FlushCallback>) -> io::Result<()> {
        self.send(Command::End(on_closed))
    }
}

/// Reports a transport event; returns `false` once nobody is listening any more.
fn notify(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) -> bool {
    match events.send(event) {
        Ok(()) => true,
        Err(e) => {
            trace!(event = ?e.0, "transport event receiver dropped");
            false
        }
    }
}

/// Executes transport commands in order
async fn drive(
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    idle_timeout: Option<Duration>,
) {
    let mut writer: Option<OwnedWriteHalf> = None;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Connect { host, port, on_ready } => match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    debug!(%host, port, "connected");
                    let (read_half, write_half) = stream.into_split();
                    writer = Some(write_half);
                    notify(&events, TransportEvent::Connected);
                    if let Some(on_ready) = on_ready {
                        on_ready();
                    }
                    tokio::spawn(read_loop(read_half, events.clone(), idle_timeout));
                }
                Err(e) => {
                    debug!(%host, port, error = %e, "connect failed");
                    notify(&events, TransportEvent::Error(e));
                }
            },
            Command::Write(data, on_flushed) => {
                let Some(stream) = writer.as_mut() else {
                    notify(&events, TransportEvent::Error(io::ErrorKind::NotConnected.into()));
                    continue;
                };
                trace!(len = data.len(), "writing");
                match write_all(stream, &data).await {
                    Ok(()) => {
                        if let Some(on_flushed) = on_flushed {
                            on_flushed();
                        }
                    }
                    Err(e) => {
                        notify(&events, TransportEvent::Error(e));
                    }
                }
            }
            Command::End(on_closed) => {
                if let Some(mut stream) = writer.take() {
                    if let Err(e) = stream.shutdown().await {
                        notify(&events, TransportEvent::Error(e));
                    }
                }
                if let Some(on_closed) = on_closed {
                    on_closed();
                }
            }
        }
    }
}

async fn write_all(stream: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads until the peer closes the connection or reading fails
async fn read_loop(
    mut stream: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
    idle_timeout: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    if !notify(&events, TransportEvent::Timeout) {
                        return;
                    }
                    continue;
                }
            },
            None => stream.read_buf(&mut buf).await,
        };

        match read {
            Ok(0) => {
                debug!("connection closed by proxy");
                notify(&events, TransportEvent::End);
                notify(&events, TransportEvent::Closed);
                return;
            }
            Ok(n) => {
                trace!(len = n, "read");
                if !notify(&events, TransportEvent::Data(buf.split().freeze())) {
                    return;
                }
            }
            Err(e) => {
                notify(&events, TransportEvent::Error(e));
                notify(&events, TransportEvent::Closed);
                return;
            }
        }
    }
}

type SharedEngine = Arc<Mutex<NtlmProxyStream<TcpTransport, mpsc::UnboundedSender<ProxyEvent>>>>;

/// An NTLM-authenticated connection through an HTTP proxy
pub struct ProxyClient {
    engine: SharedEngine,
    events: mpsc::UnboundedReceiver<ProxyEvent>,
    pump: JoinHandle<()>,
}

impl ProxyClient {
    /// Start connecting to the proxy at `host:port`
    ///
    /// Returns immediately; [`ProxyEvent::Transport`] with [`TransportEvent::Connected`] reports
    /// the connection. Writes may be issued right away. Must be called inside a Tokio runtime.
    pub fn connect(
        host: &str,
        port: u16,
        credentials: Credentials,
        options: ProxyOptions,
        idle_timeout: Option<Duration>,
    ) -> Result<Self> {
        let (transport_events, mut transport_receiver) = mpsc::unbounded_channel();
        let (proxy_events, events) = mpsc::unbounded_channel();

        let transport = TcpTransport::new(transport_events, idle_timeout);
        let mut engine = NtlmProxyStream::new(transport, proxy_events, credentials, options);
        engine.connect(host, port, None)?;
        let engine = Arc::new(Mutex::new(engine));

        let pump_engine = Arc::clone(&engine);
        let pump = tokio::spawn(async move {
            while let Some(event) = transport_receiver.recv().await {
                pump_engine.lock().await.handle_transport_event(event);
            }
        });

        Ok(Self { engine, events, pump })
    }

    /// Write consumer bytes; see [`NtlmProxyStream::write`]
    pub async fn write(&self, data: impl Into<Bytes>, on_flushed: Option<FlushCallback>) -> Result<()> {
        self.engine.lock().await.write(data, on_flushed)
    }

    /// Close the sending side of the connection
    pub async fn end(&self) -> Result<()> {
        self.engine.lock().await.end(None)
    }

    /// Current handshake stage
    pub async fn stage(&self) -> Stage {
        self.engine.lock().await.stage()
    }

    /// Wait for the next notification
    ///
    /// The end of the connection is reported as [`TransportEvent::Closed`]; waiting past it
    /// blocks until the client is dropped.
    pub async fn next_event(&mut self) -> Option<ProxyEvent> {
        self.events.recv().await
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
