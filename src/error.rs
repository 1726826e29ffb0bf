//! Error handling utils.
//!
//! The runtime never unwinds across a context switch. Every blocking
//! primitive reports failure through its return value, and the *cause* is
//! recorded in the current fiber's error slot as a raw `i32` code (see
//! [`fiber::last_error`](crate::fiber::last_error)):
//!
//! - `0` — the fiber was woken explicitly (event arrived, lock handed over);
//! - `libc::ETIMEDOUT` — the deadline of the blocking call elapsed;
//! - anything else — the code supplied by [`interrupt`](crate::fiber::interrupt).
//!
//! Public APIs translate the slot into [`Error`], so user code works with
//! `filament::Result` and `?` instead of inspecting codes by hand.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A blocking call's deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The fiber was interrupted by another fiber, vcpu or OS thread.
    /// The payload is the code supplied by the interrupter.
    #[error("interrupted with code {0}")]
    Interrupted(i32),

    /// The transport peer closed the stream, or a partial frame was
    /// observed. The offending stream has been shut down.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Stack or buffer allocation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// Programming error: duplicate fd interest, double join, tag collision
    /// and the like. Fatal in debug builds, best-effort in release.
    #[error("invalid state: {0}")]
    BadState(&'static str),

    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::Interrupted(_) => "Interrupted",
            Self::ConnectionReset => "ConnectionReset",
            Self::OutOfMemory(_) => "OutOfMemory",
            Self::BadState(_) => "BadState",
            Self::IO(_) => "IO",
        }
    }

}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
