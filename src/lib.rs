//! Two-party keystroke chat over a single TCP connection.
//!
//! One side listens and accepts exactly one peer, the other dials in. Once
//! connected, every local keystroke is sent as a single byte while whatever
//! the peer sends is displayed, until the peer closes or the user presses
//! Ctrl-C.

pub mod endpoint;
pub mod error;
pub mod newline;
pub mod pump;
pub mod terminal;

pub use endpoint::{Connection, EndpointOptions, ListeningChannel, Role, SessionEndpoint, DEFAULT_PORT};
pub use error::SessionError;
pub use newline::CrlfWriter;
pub use pump::{DuplexPump, SharedDisplay, Termination, CANCEL_UNIT, READ_CHUNK};
pub use terminal::RawModeGuard;
