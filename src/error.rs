//! Driver-wide error and result types.
use bson::{self, Bson, Document};

use std::{error, fmt, io, result, sync};

/// A type for results generated by the driver, where the `Err` type is
/// the crate-wide `Error`.
pub type Result<T> = result::Result<T, Error>;

/// A subset of the error codes reported by the server that the driver
/// inspects to make decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    BadValue = 2,
    Unauthorized = 13,
    NamespaceNotFound = 26,
    CursorNotFound = 43,
    CommandNotFound = 59,
}

/// A server-reported command failure, carrying the full response document
/// so callers can distinguish failure classes.
#[derive(Clone, Debug)]
pub struct CommandException {
    /// The numeric error code, when the server supplied one.
    pub code: Option<i32>,
    /// The server's error message.
    pub message: String,
    /// The complete response document.
    pub response: Document,
}

impl CommandException {
    /// Builds an exception from a not-ok command response.
    pub fn from_response(response: Document) -> CommandException {
        let code = match response.get("code") {
            Some(&Bson::I32(code)) => Some(code),
            Some(&Bson::I64(code)) => Some(code as i32),
            _ => None,
        };

        let message = match response.get("errmsg") {
            Some(&Bson::String(ref msg)) => msg.to_owned(),
            _ => match response.get("$err") {
                Some(&Bson::String(ref msg)) => msg.to_owned(),
                _ => String::from("Command failed."),
            },
        };

        CommandException {
            code,
            message,
            response,
        }
    }

    /// Reports whether the failure is the benign "namespace not found"
    /// case, which drop-style operations treat as success.
    pub fn namespace_not_found(&self) -> bool {
        self.code == Some(ErrorCode::NamespaceNotFound as i32) || self.message == "ns not found"
    }
}

impl fmt::Display for CommandException {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(fmt, "Command failed ({}): {}", code, self.message),
            None => write!(fmt, "Command failed: {}", self.message),
        }
    }
}

/// Possible errors that can arise during operation.
#[derive(Debug)]
pub enum Error {
    /// A malformed argument was supplied by the caller.
    ArgumentError(String),
    /// An object was used in a way its current state does not allow, e.g.
    /// mutating a frozen cursor or releasing a request that was never started.
    StateError(String),
    /// An operation could not be carried out against the deployment.
    OperationError(String),
    /// The server sent a malformed or unexpected reply.
    ResponseError(String),
    /// Authentication against a database failed; the connection was not
    /// handed to the caller.
    AuthenticationError(String),
    /// No pooled connection became available within the wait-queue timeout.
    WaitQueueTimeoutError,
    /// The pool's wait queue is already at capacity.
    WaitQueueFullError,
    /// The server reported a command failure.
    CommandError(CommandException),
    /// The server no longer holds the requested cursor.
    CursorNotFoundError,
    /// A command-monitoring hook failed; the original error, if any, is
    /// carried along.
    EventListenerError(Option<Box<Error>>),
    /// An internal lock was poisoned by a panicking thread.
    PoisonLockError,
    /// An I/O error occurred on a socket.
    IoError(io::Error),
    /// A document could not be encoded into BSON.
    EncoderError(bson::EncoderError),
    /// A BSON value could not be decoded into the requested type.
    DecoderError(bson::DecoderError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::EncoderError(err)
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        Error::DecoderError(err)
    }
}

impl From<CommandException> for Error {
    fn from(err: CommandException) -> Error {
        Error::CommandError(err)
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::PoisonLockError
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ArgumentError(ref inner) => inner.fmt(fmt),
            Error::StateError(ref inner) => inner.fmt(fmt),
            Error::OperationError(ref inner) => inner.fmt(fmt),
            Error::ResponseError(ref inner) => inner.fmt(fmt),
            Error::AuthenticationError(ref inner) => inner.fmt(fmt),
            Error::WaitQueueTimeoutError => {
                fmt.write_str("Timed out while waiting for a pooled connection.")
            }
            Error::WaitQueueFullError => {
                fmt.write_str("The connection pool's wait queue is full.")
            }
            Error::CommandError(ref inner) => inner.fmt(fmt),
            Error::CursorNotFoundError => {
                fmt.write_str("The server does not hold the requested cursor.")
            }
            Error::EventListenerError(ref inner) => match *inner {
                Some(ref err) => write!(fmt, "Event listener failed after error: {}", err),
                None => fmt.write_str("Event listener failed."),
            },
            Error::PoisonLockError => fmt.write_str("Lock poisoned by a panicking thread."),
            Error::IoError(ref inner) => inner.fmt(fmt),
            Error::EncoderError(ref inner) => inner.fmt(fmt),
            Error::DecoderError(ref inner) => inner.fmt(fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IoError(ref inner) => Some(inner),
            Error::EncoderError(ref inner) => Some(inner),
            Error::DecoderError(ref inner) => Some(inner),
            Error::EventListenerError(Some(ref inner)) => Some(inner.as_ref()),
            _ => None,
        }
    }
}
