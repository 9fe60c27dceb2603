use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Config,
    Capability,
    NotFound,
    AlreadyExists,
    Permission,
    Install,
    Raised,
    Transport,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::Config => "Config",
            ErrorKind::Capability => "Capability",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Permission => "Permission",
            ErrorKind::Install => "Install",
            ErrorKind::Raised => "Raised",
            ErrorKind::Transport => "Transport",
            ErrorKind::Io => "Io",
        }
    }

    pub fn parse(kind: &str) -> ErrorKind {
        match kind {
            "Config" => ErrorKind::Config,
            "Capability" => ErrorKind::Capability,
            "NotFound" => ErrorKind::NotFound,
            "AlreadyExists" => ErrorKind::AlreadyExists,
            "Permission" => ErrorKind::Permission,
            "Install" => ErrorKind::Install,
            "Raised" => ErrorKind::Raised,
            "Transport" => ErrorKind::Transport,
            "Io" => ErrorKind::Io,
            _ => ErrorKind::Internal,
        }
    }
}

/// An exception raised by a callable, in the form it crosses the wire.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub type_name: String,
    pub message: String,
}

impl Exception {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl StdError for Exception {}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    exception: Option<Exception>,
    traceback: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            exception: None,
            traceback: None,
            source: None,
        }
    }

    /// The error a caller sees when a callable raises, locally or remotely.
    pub fn raised(exception: Exception) -> Self {
        Self::new(ErrorKind::Raised)
            .with_message(exception.to_string())
            .with_exception(exception)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_exception(mut self, exception: Exception) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Config => 2,
        ErrorKind::Capability => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::AlreadyExists => 5,
        ErrorKind::Permission => 6,
        ErrorKind::Install => 7,
        ErrorKind::Raised => 8,
        ErrorKind::Transport => 9,
        ErrorKind::Io => 10,
    }
}

pub(crate) fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, Exception, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Config, 2),
            (ErrorKind::Capability, 3),
            (ErrorKind::NotFound, 4),
            (ErrorKind::AlreadyExists, 5),
            (ErrorKind::Permission, 6),
            (ErrorKind::Install, 7),
            (ErrorKind::Raised, 8),
            (ErrorKind::Transport, 9),
            (ErrorKind::Io, 10),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ErrorKind::Config,
            ErrorKind::Capability,
            ErrorKind::Raised,
            ErrorKind::Transport,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::parse("nonsense"), ErrorKind::Internal);
    }

    #[test]
    fn raised_error_keeps_exception_identity() {
        let err = Error::raised(Exception::value_error("bad input"));
        assert_eq!(err.kind(), ErrorKind::Raised);
        let exception = err.exception().expect("exception");
        assert_eq!(exception.type_name, "ValueError");
        assert_eq!(exception.message, "bad input");
        assert!(err.traceback().is_none());
        assert_eq!(err.to_string(), "Raised: ValueError: bad input");
    }
}
