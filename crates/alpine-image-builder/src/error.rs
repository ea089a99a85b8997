use std::fmt;

/// Broad failure classes. They decide the exit status and whether the usage
/// hint is printed; every kind aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid input, detected before any side effect.
    Config,
    /// A stage's precondition does not hold (target missing, no mounts, not root).
    Precondition,
    /// Download of the bootstrap tool, keys or packages failed.
    Transport,
    /// mount/umount/chroot or package manager invocation failed.
    Privileged,
    /// Archive creation failed.
    Packaging,
    /// Anything else (local filesystem, encoding).
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "configuration",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Transport => "transport",
            ErrorKind::Privileged => "privileged operation",
            ErrorKind::Packaging => "packaging",
            ErrorKind::Io => "io",
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
        Self::new(ErrorKind::Io, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn precondition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Precondition, msg)
    }

    pub fn transport<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transport, msg)
    }

    pub fn privileged<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Privileged, msg)
    }

    pub fn packaging<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Packaging, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message while keeping the kind.
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{prefix}: {}", self.msg),
        }
    }

    /// Exit status for the binary: 2 for bad input, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::Config => 2,
            _ => 1,
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
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let e = Error::transport("HTTP 404").context("fetching apk-tools-static");
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert_eq!(e.to_string(), "fetching apk-tools-static: HTTP 404");
    }

    #[test]
    fn only_config_errors_use_usage_exit_code() {
        assert_eq!(Error::config("missing release").exit_code(), 2);
        assert_eq!(Error::privileged("mount failed").exit_code(), 1);
        assert_eq!(Error::msg("x").exit_code(), 1);
    }
}
