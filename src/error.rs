//! Crate-wide error type. Structural anomalies -- weird merge cases,
//! unmapped allocations, an empty call stack on return -- are deliberately
//! *not* represented here: the merger recovers from them locally and only
//! logs a warning (see [`crate::merge::AnalysisStats`]). Only
//! configuration and catastrophic I/O are fatal; recoverable hiccups
//! surface as logged warnings or plain `Result`s elsewhere.

use failure_derive::Fail;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Missing or invalid configuration: {}", inner)]
    Config { inner: String },
    #[fail(display = "Malformed trace input: {}", inner)]
    Input { inner: String },
    #[fail(display = "I/O error while writing a report: {}", inner)]
    Io { inner: ::std::io::Error },
}

impl From<::std::io::Error> for Error {
    fn from(inner: ::std::io::Error) -> Self {
        Error::Io { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = ::std::io::Error::new(::std::io::ErrorKind::Other, "disk full");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { .. }));
    }
}
