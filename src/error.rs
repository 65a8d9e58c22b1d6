// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type shared across every component of the transport engine.
//!
//! Mirrors the reference transport library's dual propagation style: every
//! fallible public method returns a [`Result`], and the last error observed
//! on the current thread is additionally latched into a thread-local slot so
//! call sites written against a get-last-error convention can still recover
//! it after a bare status code.

use std::cell::Cell;
use std::fmt;

/// Errors returned by the transport engine.
///
/// Grouped by originating subsystem, following the grouping style used
/// throughout this crate's component modules.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Sequence / buffer errors
    // ========================================================================
    /// Operation would need to block or retry later (timeout, async-would-block).
    Again,
    /// No free slot/packet available in the send array.
    NoResource,
    /// An internal invariant was violated (loss chain, FEC cell bitmap, ...).
    IntegrityViolation(String),
    /// Requested sequence/cell index lies outside the buffer's live range.
    OutOfRange,

    // ========================================================================
    // FEC errors
    // ========================================================================
    /// The packet-filter configuration string is malformed or inconsistent
    /// with the negotiated payload size.
    FilterConfig(String),

    // ========================================================================
    // Epoll errors
    // ========================================================================
    /// Epoll id does not correspond to a live descriptor.
    InvalidEid,
    /// Waiting on an empty, non-empty-allowing epoll set would block forever.
    DeadlockUnsupported,
    /// The wait timed out before any subscribed event became ready.
    Timeout,

    // ========================================================================
    // Options / configuration errors
    // ========================================================================
    /// Option name is unknown or its value is out of the documented range.
    InvalidArgument(String),
    /// The operation is not supported in this build or configuration.
    NotSupported,

    // ========================================================================
    // Connection / resource errors
    // ========================================================================
    /// Peer or local side has closed; further I/O is impossible.
    ConnectionBroken,
    /// Local shutdown is in progress or complete.
    Shutdown,
    /// Resource allocation failed during setup (e.g. kernel epoll/kqueue create).
    Setup(String),

    // ========================================================================
    // Other
    // ========================================================================
    /// I/O error with an underlying cause, from a native-fd polling backend.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => write!(f, "operation would block, retry later"),
            Error::NoResource => write!(f, "no free slot available"),
            Error::IntegrityViolation(msg) => write!(f, "internal invariant violated: {msg}"),
            Error::OutOfRange => write!(f, "index out of the buffer's live range"),
            Error::FilterConfig(msg) => write!(f, "invalid packet filter configuration: {msg}"),
            Error::InvalidEid => write!(f, "epoll id does not refer to a live descriptor"),
            Error::DeadlockUnsupported => {
                write!(f, "wait on an always-empty epoll set would deadlock")
            }
            Error::Timeout => write!(f, "wait timed out"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::ConnectionBroken => write!(f, "connection broken"),
            Error::Shutdown => write!(f, "local shutdown in progress"),
            Error::Setup(msg) => write!(f, "setup failed: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for transport-engine results.
pub type Result<T> = core::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: Cell<Option<ErrorCode>> = const { Cell::new(None) };
}

/// Compact `(major, minor, errno)` triple used for cross-boundary error
/// propagation where the richer [`Error`] type cannot cross (e.g. a C ABI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub major: u8,
    pub minor: u8,
    pub errno: i32,
}

impl Error {
    /// Serializes this error into the `(major, minor, errno)` triple and
    /// latches it as the current thread's last error.
    pub fn code(&self) -> ErrorCode {
        let code = match self {
            Error::Again => ErrorCode { major: 1, minor: 0, errno: libc::EAGAIN },
            Error::NoResource => ErrorCode { major: 1, minor: 1, errno: libc::ENOBUFS },
            Error::IntegrityViolation(_) => ErrorCode { major: 1, minor: 2, errno: libc::EFAULT },
            Error::OutOfRange => ErrorCode { major: 1, minor: 3, errno: libc::ERANGE },
            Error::FilterConfig(_) => ErrorCode { major: 2, minor: 0, errno: libc::EINVAL },
            Error::InvalidEid => ErrorCode { major: 3, minor: 0, errno: libc::EBADF },
            Error::DeadlockUnsupported => ErrorCode { major: 3, minor: 1, errno: libc::EDEADLK },
            Error::Timeout => ErrorCode { major: 3, minor: 2, errno: libc::ETIMEDOUT },
            Error::InvalidArgument(_) => ErrorCode { major: 4, minor: 0, errno: libc::EINVAL },
            Error::NotSupported => ErrorCode { major: 4, minor: 1, errno: libc::ENOTSUP },
            Error::ConnectionBroken => ErrorCode { major: 5, minor: 0, errno: libc::ECONNRESET },
            Error::Shutdown => ErrorCode { major: 5, minor: 1, errno: libc::ESHUTDOWN },
            Error::Setup(_) => ErrorCode { major: 5, minor: 2, errno: libc::ENODEV },
            Error::Io(e) => {
                ErrorCode { major: 6, minor: 0, errno: e.raw_os_error().unwrap_or(libc::EIO) }
            }
        };
        set_last_error(code);
        code
    }
}

/// Records `code` as the last error observed on the current thread.
pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|slot| slot.set(Some(code)));
}

/// Returns the last error recorded on the current thread, if any.
#[must_use]
pub fn get_last_error() -> Option<ErrorCode> {
    LAST_ERROR.with(Cell::get)
}

/// Clears the current thread's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.set(None));
}
