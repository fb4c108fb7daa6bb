//! Tokio adapter and caller-facing session handle.
//!
//! [`SshClient::connect`] opens a TCP connection, spawns a driver task that
//! owns the [`Engine`] and returns a [`SessionHandle`]. The driver is the only
//! place the engine is touched: socket reads and handle commands are funnelled
//! into it one at a time through `tokio::select!`. Results come back through a
//! [`SessionHandler`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_proto::ssh::auth::Credential;
//! use sluice_proto::ssh::client::{event_channel, SshClient};
//! use sluice_proto::ssh::config::{ClientConfig, ConnectOptions};
//! use sluice_proto::ssh::engine::Event;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("user", Credential::password("password"));
//! let (handler, mut events) = event_channel();
//! let session = SshClient::connect("127.0.0.1:22", config, ConnectOptions::default(), handler).await?;
//!
//! session.write(b"ls -la\n")?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Data(data) => print!("{}", String::from_utf8_lossy(data.bytes())),
//!         Event::Failed(e) => return Err(e.into()),
//!         Event::Closed => break,
//!         Event::Established => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::ssh::channel::ChannelData;
use crate::ssh::config::{ClientConfig, ConnectOptions};
use crate::ssh::engine::{Engine, Event};
use sluice_platform::{SluiceError, SluiceResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the outcome of a connection.
///
/// Callbacks run on the driver task. `on_failure` is invoked at most once
/// and nothing follows it.
pub trait SessionHandler: Send + 'static {
    /// The session channel is open.
    fn on_connected(&mut self) {}

    /// Data arrived on the session channel.
    fn on_data(&mut self, data: ChannelData);

    /// The connection failed.
    fn on_failure(&mut self, error: SluiceError);

    /// The connection ended normally.
    fn on_closed(&mut self) {}
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

/// Creates a handler that forwards events to the returned receiver.
pub fn event_channel() -> (EventForwarder, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventForwarder { tx }, rx)
}

impl EventForwarder {
    fn forward(&self, event: Event) {
        // The receiver may be gone; nobody is listening then
        let _ = self.tx.send(event);
    }
}

impl SessionHandler for EventForwarder {
    fn on_connected(&mut self) {
        self.forward(Event::Established);
    }

    fn on_data(&mut self, data: ChannelData) {
        self.forward(Event::Data(data));
    }

    fn on_failure(&mut self, error: SluiceError) {
        self.forward(Event::Failed(error));
    }

    fn on_closed(&mut self) {
        self.forward(Event::Closed);
    }
}

#[derive(Debug)]
enum Command {
    Write(Vec<u8>),
    Close,
}

/// Handle to a running session.
///
/// Dropping the handle closes the session.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queues data for the session channel.
    ///
    /// Data written before the channel is open is held until it opens.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Closed`] if the session has ended.
    pub fn write(&self, data: &[u8]) -> SluiceResult<()> {
        self.commands
            .send(Command::Write(data.to_vec()))
            .map_err(|_| SluiceError::Closed)
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Closed`] if the session has already ended.
    pub fn close(&self) -> SluiceResult<()> {
        self.commands
            .send(Command::Close)
            .map_err(|_| SluiceError::Closed)
    }

    /// Returns true once the driver task finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the driver task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Session driver task failed: {}", e);
        }
    }
}

/// Entry points for client connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshClient;

impl SshClient {
    /// Connects over TCP and starts the session.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Config`] for an invalid configuration and
    /// [`SluiceError::Io`] if the TCP connection cannot be made in time. In
    /// both cases the handler is never called. Everything after the TCP
    /// connect is reported through the handler.
    pub async fn connect<A, H>(
        addr: A,
        config: ClientConfig,
        options: ConnectOptions,
        handler: H,
    ) -> SluiceResult<SessionHandle>
    where
        A: ToSocketAddrs,
        H: SessionHandler,
    {
        let engine = Engine::new(config)?;
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                SluiceError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection timeout",
                ))
            })?
            .map_err(SluiceError::Io)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        if let Ok(peer) = stream.peer_addr() {
            info!("Connected to {}", peer);
        }
        Ok(Self::spawn(stream, engine, options, handler))
    }

    /// Starts the session over an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Config`] for an invalid configuration.
    pub fn connect_stream<S, H>(
        stream: S,
        config: ClientConfig,
        options: ConnectOptions,
        handler: H,
    ) -> SluiceResult<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: SessionHandler,
    {
        let engine = Engine::new(config)?;
        Ok(Self::spawn(stream, engine, options, handler))
    }

    fn spawn<S, H>(stream: S, engine: Engine, options: ConnectOptions, handler: H) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: SessionHandler,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            engine,
            handler,
            queued: Vec::new(),
        };
        let task = tokio::spawn(driver.run(stream, rx, options.read_buffer_size.max(1)));
        SessionHandle { commands, task }
    }
}

struct Driver<H> {
    engine: Engine,
    handler: H,
    queued: Vec<Vec<u8>>,
}

impl<H: SessionHandler> Driver<H> {
    async fn run<S>(
        mut self,
        stream: S,
        mut commands: mpsc::UnboundedReceiver<Command>,
        read_buffer_size: usize,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; read_buffer_size];

        self.engine.start();
        let mut events = Vec::new();
        self.flush(&mut writer, &mut events).await;
        self.dispatch(events);

        debug!("Session driver started");
        while !self.engine.is_finished() {
            let mut events = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => self.engine.transport_closed(None),
                    Ok(n) => self.engine.receive(&buf[..n]),
                    Err(e) => self.engine.transport_closed(Some(e)),
                },
                command = commands.recv() => self.on_command(command),
            };

            if events.iter().any(|e| matches!(e, Event::Established)) {
                for data in std::mem::take(&mut self.queued) {
                    if let Err(e) = self.engine.write(&data) {
                        events.push(Event::Failed(e));
                        break;
                    }
                }
            }

            self.flush(&mut writer, &mut events).await;
            self.dispatch(events);
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown failed: {}", e);
        }
        debug!("Session driver stopped");
    }

    fn on_command(&mut self, command: Option<Command>) -> Vec<Event> {
        match command {
            Some(Command::Write(data)) => {
                if !self.engine.is_established() {
                    self.queued.push(data);
                    return Vec::new();
                }
                match self.engine.write(&data) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![Event::Failed(e)],
                }
            }
            // A dropped handle closes the session too
            Some(Command::Close) | None => match self.engine.close() {
                Ok(()) => vec![Event::Closed],
                Err(SluiceError::Closed) => Vec::new(),
                Err(e) => vec![Event::Failed(e)],
            },
        }
    }

    async fn flush<W>(&mut self, writer: &mut W, events: &mut Vec<Event>)
    where
        W: AsyncWrite + Unpin,
    {
        if !self.engine.has_outbound() {
            return;
        }
        let bytes = self.engine.take_outbound();
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            events.extend(self.engine.transport_closed(Some(e)));
        }
    }

    fn dispatch(&mut self, events: Vec<Event>) {
        let mut ended = false;
        for event in events {
            if ended {
                break;
            }
            match event {
                Event::Established => self.handler.on_connected(),
                Event::Data(data) => self.handler.on_data(data),
                Event::Closed => {
                    ended = true;
                    self.handler.on_closed();
                }
                Event::Failed(e) => {
                    ended = true;
                    self.handler.on_failure(e);
                }
            }
        }
    }
}
