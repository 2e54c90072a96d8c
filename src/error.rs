use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Everything that can end a session before or outside the duplex phase.
///
/// Transfer errors inside the pump are not listed here: a failed read ends the
/// session with a [`Termination`](crate::Termination), a failed write is only
/// reported.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection on {addr}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not a valid IP address")]
    InvalidAddress(String),

    #[error("failed to connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("endpoint already holds a connection to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("endpoint has no open connection")]
    NotConnected,

    #[error("failed to enable raw mode")]
    RawMode(#[source] io::Error),

    #[error("failed to initialize signal")]
    Signal(#[source] io::Error),

    #[error("pump task did not finish cleanly")]
    Task(#[from] tokio::task::JoinError),
}

impl SessionError {
    /// Setup errors happen before any byte was exchanged.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SessionError::Bind { .. }
                | SessionError::Accept { .. }
                | SessionError::InvalidAddress(_)
                | SessionError::Connect { .. }
                | SessionError::AlreadyConnected(_)
        )
    }
}
