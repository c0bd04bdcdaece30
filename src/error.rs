/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Error kinds and the context-carrying [`Error`] type shared by every subsystem.
//!
//! `Retry` and `Deadlock` are internal control-flow signals: every public
//! entry point in [`crate::engine`] loops on them and neither ever escapes
//! the crate. Everything else is a real error the caller must handle.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Which subsystem raised an [`Error`]; purely diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Cache,
    Lock,
    Txn,
    Slum,
    Tree,
}

impl Subsystem {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Lock => "lock",
            Self::Txn => "txn",
            Self::Slum => "slum",
            Self::Tree => "tree",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// Benign race; the caller must restart the enclosing operation.
    Retry,
    /// A low-priority owner was asked to yield; release all locks and retry high-priority.
    Deadlock,
    /// The target frame is dying.
    Invalid,
    /// Non-blocking request found the resource contended.
    Busy,
    OutOfMemory,
    IoError,
    /// A broken internal invariant. Fatal: production builds abort after logging.
    InvariantViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Deadlock => "deadlock",
            Self::Invalid => "invalid",
            Self::Busy => "busy",
            Self::OutOfMemory => "out of memory",
            Self::IoError => "I/O error",
            Self::InvariantViolation => "invariant violation",
        };
        f.write_str(s)
    }
}

/// An error with enough context to be logged usefully without having to
/// thread a `&'static str` through every call site by hand.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    origin: Option<Subsystem>,
    dmsg: Option<&'static str>,
}

impl Error {
    pub fn new(kind: ErrorKind, origin: Subsystem, dmsg: &'static str) -> Self {
        Self { kind, origin: Some(origin), dmsg: Some(dmsg) }
    }
    pub fn with_kind(kind: ErrorKind) -> Self {
        Self { kind, origin: None, dmsg: None }
    }
    pub fn with_origin(kind: ErrorKind, origin: Subsystem) -> Self {
        Self { kind, origin: Some(origin), dmsg: None }
    }
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn is_retry(&self) -> bool {
        self.kind == ErrorKind::Retry
    }
    pub fn is_deadlock(&self) -> bool {
        self.kind == ErrorKind::Deadlock
    }

    pub(crate) fn retry(origin: Subsystem) -> Self {
        Self::with_origin(ErrorKind::Retry, origin)
    }
    pub(crate) fn deadlock(origin: Subsystem) -> Self {
        Self::with_origin(ErrorKind::Deadlock, origin)
    }
    pub(crate) fn invalid(origin: Subsystem) -> Self {
        Self::with_origin(ErrorKind::Invalid, origin)
    }

    /// Log and abort. Used for conditions this crate's invariants guarantee cannot happen.
    #[cold]
    #[track_caller]
    pub(crate) fn bug(msg: &'static str) -> ! {
        log::error!("invariant violation: {msg}");
        panic!("cowcore: invariant violation: {msg}");
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(origin) => write!(f, "{} error: ", origin.as_str())?,
            None => write!(f, "error: ")?,
        }
        if let Some(dmsg) = self.dmsg {
            write!(f, "{dmsg}; ")?;
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}
