//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for RaftKV.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RaftKvError(pub String);

impl RaftKvError {
    /// Constructs an error from anything that can be turned into a string.
    pub fn msg(msg: impl ToString) -> Self {
        RaftKvError(msg.to_string())
    }
}

impl fmt::Display for RaftKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `RaftKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RaftKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RaftKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(serde_json::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RaftKvError("unreachable quorum".into());
        assert_eq!(format!("{}", e), String::from("unreachable quorum"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = RaftKvError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_error =
            serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let e = RaftKvError::from(json_error);
        assert!(!e.0.is_empty());
    }
}
