use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration or arguments.
    Config,
    /// Local filesystem failure.
    Io,
    /// The state archive could not be decoded.
    ArchiveCorrupt,
    /// The object store rejected an operation for a reason other than absence.
    StorageFailure,
    /// Environment variables reference each other in a loop.
    ConfigCycle,
    /// An external tool could not be spawned or exited unsuccessfully.
    Subprocess,
    /// Interrupted by SIGINT/SIGTERM.
    Cancelled,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::ArchiveCorrupt => "archive corrupt",
            ErrorKind::StorageFailure => "storage failure",
            ErrorKind::ConfigCycle => "config cycle",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn archive<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ArchiveCorrupt, msg)
    }

    pub fn storage<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::StorageFailure, msg)
    }

    pub fn cycle<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ConfigCycle, msg)
    }

    pub fn subprocess<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Subprocess, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Prefix the message, keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::storage("access denied").context("upload s3://a-state/klarista.state.tar");
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert_eq!(
            err.to_string(),
            "upload s3://a-state/klarista.state.tar: access denied"
        );
    }

    #[test]
    fn io_errors_map_to_io_kind() {
        let err: Error = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
