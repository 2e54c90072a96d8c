//! Duplex pump: local input to the network and the network to the display,
//! both at the same time, over one connection.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::SessionError;

/// Size of one read from the connection
pub const READ_CHUNK: usize = 1024;

/// Ctrl-C as delivered by a terminal in raw mode
pub const CANCEL_UNIT: u8 = 0x03;

/// Display shared by the inbound activity and the local echo.
pub type SharedDisplay<D> = Arc<Mutex<D>>;

/// Why a pump run ended.
#[derive(Debug)]
pub enum Termination {
    /// The peer closed its side of the connection (zero-length read).
    PeerClosed,
    /// Reading from the connection failed.
    ReadFailed(io::Error),
    /// The local user typed the cancel unit.
    Cancelled,
    /// Local input reached end of file.
    InputClosed,
    /// Reading local input failed.
    InputFailed(io::Error),
}

impl Termination {
    /// True when the end came from the remote side or the transport.
    pub fn is_remote(&self) -> bool {
        matches!(self, Termination::PeerClosed | Termination::ReadFailed(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::PeerClosed => write!(f, "Connection closed by peer"),
            Termination::ReadFailed(e) => write!(f, "Failed to receive message: {}", e),
            Termination::Cancelled => write!(f, "Session cancelled"),
            Termination::InputClosed => write!(f, "Local input closed"),
            Termination::InputFailed(e) => write!(f, "Failed to read local input: {}", e),
        }
    }
}

/// Runs the inbound and outbound activities over one connection.
///
/// `I` is the local input device, read one unit at a time. `D` is where
/// received text (and the local echo) is written.
pub struct DuplexPump<I, D> {
    input: I,
    display: SharedDisplay<D>,
    echo: bool,
}

impl<I, D> DuplexPump<I, D>
where
    I: AsyncRead + Unpin + Send + 'static,
    D: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(input: I, display: SharedDisplay<D>) -> Self {
        DuplexPump {
            input,
            display,
            echo: true,
        }
    }

    /// Also write every sent unit to the display.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Copy from input to `stream`, and from `stream` to the display, until
    /// either direction ends.
    ///
    /// Both tasks are joined before returning, so the stream handed back is
    /// no longer used by anything. If a task panicked its half is lost and the
    /// stream is dropped (closed) with it.
    pub async fn run<S>(self, stream: S) -> Result<(Termination, S), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let stop = CancellationToken::new();
        // If this future is dropped mid-run the tasks stop and drop their halves
        let _stop_on_drop = stop.clone().drop_guard();

        // Copy from network socket to the display
        let inbound = tokio::spawn(inbound(reader, self.display.clone(), stop.clone()));

        // Copy from input to the network socket, one unit per write
        let outbound = tokio::spawn(outbound(
            self.input,
            writer,
            self.echo.then_some(self.display),
            stop.clone(),
        ));

        let (inbound, outbound) = tokio::join!(inbound, outbound);
        let (reader, inbound_end) = inbound?;
        let (writer, outbound_end) = outbound?;

        // Both ends can race (peer closes while the user cancels); the remote
        // side wins since it is what actually closed the connection.
        let termination = match (inbound_end, outbound_end) {
            (Some(end), _) | (None, Some(end)) => end,
            (None, None) => Termination::Cancelled,
        };
        debug!(%termination, "duplex pump stopped");

        Ok((termination, reader.unsplit(writer)))
    }
}

/// Inbound activity. Returns `None` when stopped by the other activity.
async fn inbound<S, D>(
    mut reader: ReadHalf<S>,
    display: SharedDisplay<D>,
    stop: CancellationToken,
) -> (ReadHalf<S>, Option<Termination>)
where
    S: AsyncRead,
    D: AsyncWrite + Unpin,
{
    // Ends the outbound activity on every exit, including a panic
    let _guard = stop.clone().drop_guard();
    let mut buffer = [0u8; READ_CHUNK];

    let end = loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break None,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => break Some(Termination::PeerClosed),
            Err(e) => break Some(Termination::ReadFailed(e)),
            Ok(amount) => {
                trace!(amount, "received");
                // Shown as they arrive, the terminal puts split characters back together
                show(&display, &buffer[..amount]).await;
            }
        }
    };

    (reader, end)
}

/// Outbound activity. Returns `None` when stopped by the other activity.
async fn outbound<I, S, D>(
    mut input: I,
    mut writer: WriteHalf<S>,
    echo: Option<SharedDisplay<D>>,
    stop: CancellationToken,
) -> (WriteHalf<S>, Option<Termination>)
where
    I: AsyncRead + Unpin,
    S: AsyncWrite,
    D: AsyncWrite + Unpin,
{
    let _guard = stop.clone().drop_guard();
    let mut unit = [0u8; 1];

    let end = loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break None,
            read = input.read(&mut unit) => read,
        };

        match read {
            Ok(0) => break Some(Termination::InputClosed),
            Err(e) => break Some(Termination::InputFailed(e)),
            Ok(_) if unit[0] == CANCEL_UNIT => break Some(Termination::Cancelled),
            Ok(_) => {
                // Best effort: a failed send is reported and the loop goes on
                if let Err(e) = writer.write_all(&unit).await {
                    warn!(error = %e, "failed to send message");
                    continue;
                }
                if let Some(display) = &echo {
                    show(display, &unit).await;
                }
            }
        }
    };

    (writer, end)
}

async fn show<D>(display: &SharedDisplay<D>, bytes: &[u8])
where
    D: AsyncWrite + Unpin,
{
    let mut guard = display.lock().await;
    let written = match guard.write_all(bytes).await {
        Ok(()) => guard.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        warn!(error = %e, "failed to write to display");
    }
}
