//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Message carried by the error every caller of a dead RPC connection gets.
const CONN_SHUTDOWN: &str = "connection is shut down";

/// Customized error type for idgen.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct IdGenError(pub(crate) String);

impl IdGenError {
    pub fn msg(msg: impl ToString) -> Self {
        IdGenError(msg.to_string())
    }

    /// Error handed out by an RPC connection whose stream has failed or has
    /// been closed.
    pub fn conn_shutdown() -> Self {
        IdGenError(CONN_SHUTDOWN.into())
    }

    /// Returns true if this error reports a shut down RPC connection, i.e.,
    /// the caller should reconnect before trying again.
    pub fn is_conn_shutdown(&self) -> bool {
        self.0 == CONN_SHUTDOWN
    }
}

impl fmt::Display for IdGenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for IdGenError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `IdGenError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for IdGenError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                IdGenError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `IdGenError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for IdGenError {
            fn from(e: $error) -> IdGenError {
                IdGenError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = IdGenError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = IdGenError::from(io_error);
        assert!(e.0.contains("oh no!"));
        assert!(!e.is_conn_shutdown());
    }

    #[test]
    fn conn_shutdown_detect() {
        assert!(IdGenError::conn_shutdown().is_conn_shutdown());
        assert_eq!(
            IdGenError::conn_shutdown().to_string(),
            "connection is shut down"
        );
        assert!(!IdGenError::msg("connection reset").is_conn_shutdown());
    }
}
