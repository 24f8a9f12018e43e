// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IOError;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Kernel request that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlKind {
    ChipInfo,
    LineInfo,
    GetLine,
    GetValues,
    SetValues,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("No gpio device detected (tried {})", display_paths(.candidates))]
    DeviceNotFound { candidates: Vec<PathBuf> },
    #[error("Gpio device is not online")]
    NotOnline,
    #[error("Port {offset} already in use by {consumer}")]
    PortInUse { offset: u32, consumer: String },
    #[error("Failed to request lines: {0}")]
    SessionRebuild(#[source] Box<Error>),
    #[error("No lines are currently requested")]
    NoSession,
    #[error("No line with edge detection is requested")]
    NotArmed,
    #[error("Offset {0} is not part of the current request")]
    Offset(u32),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid {field} setting: {value}")]
    InvalidSetting { field: &'static str, value: String },
    #[error("Ioctl to {kind} failed: {cause}")]
    Ioctl {
        kind: IoctlKind,
        #[source]
        cause: nix::Error,
    },
    #[error("Failed to read event: {0}")]
    Event(#[source] nix::Error),
    #[error(transparent)]
    Io(#[from] IOError),
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

pub(crate) fn ioctl_err(kind: IoctlKind, cause: nix::Error) -> Error {
    ErrorKind::Ioctl { kind, cause }.into()
}

pub(crate) fn invalid_err(msg: impl Into<String>) -> Error {
    ErrorKind::InvalidRequest(msg.into()).into()
}

pub(crate) fn offset_err(offset: u32) -> Error {
    ErrorKind::Offset(offset).into()
}

pub(crate) fn event_err(err: nix::Error) -> Error {
    ErrorKind::Event(err).into()
}

pub(crate) fn rebuild_err(cause: Error) -> Error {
    ErrorKind::SessionRebuild(Box::new(cause)).into()
}

impl fmt::Display for IoctlKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            IoctlKind::ChipInfo => write!(f, "get chip info"),
            IoctlKind::LineInfo => write!(f, "get line info"),
            IoctlKind::GetLine => write!(f, "request lines"),
            IoctlKind::GetValues => write!(f, "get line values"),
            IoctlKind::SetValues => write!(f, "set line values"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.kind.source()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind }
    }
}

impl From<IOError> for Error {
    fn from(err: IOError) -> Error {
        ErrorKind::Io(err).into()
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Error {
        ErrorKind::Config(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_names_holder() {
        let err: Error = ErrorKind::PortInUse {
            offset: 17,
            consumer: "kernel-led".to_owned(),
        }
        .into();
        assert_eq!(err.to_string(), "Port 17 already in use by kernel-led");
    }

    #[test]
    fn rebuild_error_chains_cause() {
        let err = rebuild_err(ioctl_err(IoctlKind::GetLine, nix::errno::Errno::EBUSY));
        assert!(matches!(err.kind(), ErrorKind::SessionRebuild(_)));
        let source = err.source().expect("rebuild error has a source");
        assert!(source.to_string().contains("request lines"));
    }

    #[test]
    fn device_not_found_lists_candidates() {
        let err: Error = ErrorKind::DeviceNotFound {
            candidates: vec![PathBuf::from("/dev/gpiochip0"), PathBuf::from("/dev/gpiochip4")],
        }
        .into();
        assert_eq!(
            err.to_string(),
            "No gpio device detected (tried /dev/gpiochip0, /dev/gpiochip4)"
        );
    }
}
