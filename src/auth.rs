//! Per-connection authentication seam.
use crate::error::Result;
use crate::stream::Stream;

use bufstream::BufStream;

/// Establishes credentials for a database over a pooled socket.
///
/// The driver does not implement authentication mechanisms itself; it
/// tracks which databases each connection has authenticated against and
/// invokes this hook before the first operation addressed to a database is
/// sent on a connection. A failure is surfaced to the acquiring caller as
/// an authentication error and the connection is not handed out.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, socket: &mut BufStream<Stream>, database: &str) -> Result<()>;
}
