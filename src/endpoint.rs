use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use colored::Colorize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::pump::{DuplexPump, SharedDisplay, Termination};
use crate::SessionError;

/// Port used by both roles unless told otherwise
pub const DEFAULT_PORT: u16 = 8080;

/// Which setup operation opened the connection. Once connected both roles
/// behave the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Initiator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listener => write!(f, "server"),
            Role::Initiator => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Interface the listener binds, all of them by default
    pub bind_host: IpAddr,
    /// Don't print status lines
    pub silent: bool,
    /// Write sent units to the display as well
    pub echo: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        EndpointOptions {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            silent: false,
            echo: true,
        }
    }
}

/// The one open stream between the two participants.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    role: Role,
    peer: SocketAddr,
}

impl Connection {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether small writes leave immediately (Nagle disabled).
    pub fn nodelay(&self) -> bool {
        self.stream.nodelay().unwrap_or(false)
    }
}

/// Keystrokes are one-byte writes, don't let the kernel hold them back.
fn send_immediately(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to disable Nagle's algorithm");
    }
}

/// A bound listener that has not accepted its peer yet.
#[derive(Debug)]
pub struct ListeningChannel {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListeningChannel {
    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Obtains a single connection, runs the duplex pump over it, then releases it.
///
/// The connection is closed when the endpoint is dropped if [`release`] was
/// never reached.
///
/// [`release`]: SessionEndpoint::release
#[derive(Debug)]
pub struct SessionEndpoint {
    options: EndpointOptions,
    connection: Option<Connection>,
}

impl SessionEndpoint {
    pub fn new(options: EndpointOptions) -> Self {
        SessionEndpoint {
            options,
            connection: None,
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn ensure_vacant(&self) -> Result<(), SessionError> {
        match &self.connection {
            Some(connection) => Err(SessionError::AlreadyConnected(connection.peer)),
            None => Ok(()),
        }
    }

    /// Bind the listening channel on the configured host and `port`.
    pub async fn bind_listener(&self, port: u16) -> Result<ListeningChannel, SessionError> {
        self.ensure_vacant()?;
        let addr = SocketAddr::new(self.options.bind_host, port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SessionError::Bind { addr, source })?;

        // Info message on successful bind
        if !self.options.silent {
            eprintln!("Listening on {} (tcp)", local_addr.to_string().blue());
            eprintln!("Waiting for client connection...");
        }

        Ok(ListeningChannel { listener, local_addr })
    }

    /// Wait for exactly one peer on `channel`, then close the channel.
    pub async fn accept_on(&mut self, channel: ListeningChannel) -> Result<SocketAddr, SessionError> {
        self.ensure_vacant()?;

        let (stream, peer) = channel
            .listener
            .accept()
            .await
            .map_err(|source| SessionError::Accept {
                addr: channel.local_addr,
                source,
            })?;

        // No other peer is admitted
        drop(channel);
        send_immediately(&stream);

        if !self.options.silent {
            eprintln!("Connection received from {}", peer.to_string().green());
        }

        self.connection = Some(Connection {
            stream,
            role: Role::Listener,
            peer,
        });
        Ok(peer)
    }

    /// Listen on `port` and block until one peer connects.
    pub async fn accept_as_listener(&mut self, port: u16) -> Result<SocketAddr, SessionError> {
        let channel = self.bind_listener(port).await?;
        self.accept_on(channel).await
    }

    /// Connect to `address` (an IP literal) on `port`.
    ///
    /// The address is parsed before anything touches the network.
    pub async fn dial_as_initiator(&mut self, address: &str, port: u16) -> Result<SocketAddr, SessionError> {
        self.ensure_vacant()?;

        let ip: IpAddr = address
            .parse()
            .map_err(|_| SessionError::InvalidAddress(address.to_string()))?;
        let addr = SocketAddr::new(ip, port);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SessionError::Connect { addr, source })?;
        send_immediately(&stream);

        if !self.options.silent {
            eprintln!("Connected to {}", addr.to_string().green());
        }

        self.connection = Some(Connection {
            stream,
            role: Role::Initiator,
            peer: addr,
        });
        Ok(addr)
    }

    /// Run the duplex pump over the connection until either side ends it.
    ///
    /// The connection is released on every path out of here. If the pump
    /// fails, the stream has already been dropped along with its halves.
    pub async fn run<I, D>(&mut self, input: I, display: SharedDisplay<D>) -> Result<Termination, SessionError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        D: AsyncWrite + Unpin + Send + 'static,
    {
        let Connection { stream, role, peer } = self.connection.take().ok_or(SessionError::NotConnected)?;
        debug!(%role, %peer, "session started");

        let pump = DuplexPump::new(input, display).echo(self.options.echo);
        let (termination, stream) = pump.run(stream).await?;

        self.connection = Some(Connection { stream, role, peer });
        self.release().await;

        Ok(termination)
    }

    /// Shut down and close the connection if one is open.
    ///
    /// Returns whether anything was closed, so calling it again is harmless.
    pub async fn release(&mut self) -> bool {
        let Some(mut connection) = self.connection.take() else {
            return false;
        };

        // The peer may already be gone, closing is what matters
        if let Err(e) = connection.stream.shutdown().await {
            debug!(error = %e, "shutdown before close failed");
        }
        debug!(peer = %connection.peer, "connection released");

        true
    }
}
