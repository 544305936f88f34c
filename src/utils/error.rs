//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for Tiller.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TillerError(pub String);

impl TillerError {
    /// Creates an error from anything that can be displayed.
    pub fn msg(m: impl fmt::Display) -> Self {
        TillerError(m.to_string())
    }
}

impl fmt::Display for TillerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for TillerError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `TillerError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TillerError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TillerError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TillerError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TillerError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TillerError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TillerError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
