use std::fmt::Display;

/// EmberDB errors, mirroring the status kinds surfaced to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested entity (database, file) does not exist.
    NotFound(String),
    /// Invalid stored data: bad checksums, truncated records, malformed keys.
    Corruption(String),
    /// The operation is not supported by this build or configuration.
    NotSupported(String),
    /// Invalid caller input: bad options, comparator mismatch, overflow.
    InvalidArgument(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! invalid_argument {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(err.to_string())
        } else {
            Error::Io(err.to_string())
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::Corruption("bad block".to_string());
        assert_eq!(err.to_string(), "corruption: bad block");
        let err = Error::Io("disk gone".to_string());
        assert_eq!(err.to_string(), "io error: disk gone");
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_macros() {
        let err = corruption!("block {} truncated", 7);
        assert_eq!(err, Error::Corruption("block 7 truncated".to_string()));
        let err = invalid_argument!("bad level {}", 9);
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
