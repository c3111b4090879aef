// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy shared by every runtime operation.
//!
//! Everything after bootstrap reports failures by value; only instance
//! bootstrap itself is allowed to panic. Deadlock is deliberately not
//! detected: a cycle of strands all blocked on each other hangs, and
//! avoiding that is the caller's job.

/// Unified error type for scheduler, channel, group, and bridge calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The operation is illegal in the caller's current state
    /// (self-join, waiting on a busy group, blocking outside a runtime...).
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The handle refers to a resource that has been released.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// Stack or worker allocation failed; carries the OS error text.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A non-blocking attempt found no partner or no room.
    #[error("operation would block")]
    WouldBlock,

    /// A joined strand or a bridge job panicked; carries the panic message.
    #[error("panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
