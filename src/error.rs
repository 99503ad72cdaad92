use std::{fmt, io, time::Duration};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by callers that only care about the kind of
/// failure, not its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionViolation,
    ConfigurationError,
    ExternalCommandFailure,
    ParseFailure,
    StateInconsistency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PreconditionViolation => "precondition violation",
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::ExternalCommandFailure => "external command failure",
            ErrorKind::ParseFailure => "parse failure",
            ErrorKind::StateInconsistency => "state inconsistency",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum CommandFailure {
    Spawn(io::Error),
    Exit(String),
    Timeout(Duration),
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFailure::Spawn(e) => write!(f, "spawn failed: {e}"),
            CommandFailure::Exit(status) => write!(f, "{status}"),
            CommandFailure::Timeout(t) => write!(f, "timed out after {}s", t.as_secs()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Config(String),

    #[error("command failed: {cmd} ({failure})")]
    Command { cmd: String, failure: CommandFailure },

    #[error("cannot parse {tool} output: '{line}'")]
    Parse { tool: &'static str, line: String },

    #[error("{0}")]
    Inconsistent(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Precondition(_) => ErrorKind::PreconditionViolation,
            Error::Config(_) => ErrorKind::ConfigurationError,
            Error::Command { .. } | Error::Io { .. } => ErrorKind::ExternalCommandFailure,
            Error::Parse { .. } => ErrorKind::ParseFailure,
            Error::Inconsistent(_) => ErrorKind::StateInconsistency,
        }
    }

    pub fn parse(tool: &'static str, line: impl Into<String>) -> Self {
        Error::Parse {
            tool,
            line: line.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Command {
                failure: CommandFailure::Timeout(_),
                ..
            }
        )
    }
}

/// `anyhow`-style context for io results, producing [`Error::Io`].
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Io {
            context: f().into(),
            source,
        })
    }
}

macro_rules! precondition {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Precondition(format!($($arg)*)))
    };
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Config(format!($($arg)*)))
    };
}

pub(crate) use config_error;
pub(crate) use precondition;
