//! Error type shared by every operation in the loop.

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, LoopError>;

/// Everything that can go wrong while building or driving a [`Context`](crate::Context).
///
/// The variants line up with the failure families in the design: an
/// argument the library rejects outright, a kernel object that failed to
/// allocate, a registration the kernel refused, a short read while
/// draining a notification fd, and an unrecoverable wait.
#[derive(Debug, Error)]
pub enum LoopError {
    /// A null-equivalent argument, a negative I/O fd, `max_events < 1`,
    /// or any other value the library rejects before touching the kernel.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// Allocating a kernel object (epoll, inotify, signalfd, timerfd,
    /// eventfd) failed.
    #[error("failed to acquire {detail}: {source}")]
    ResourceAcquisition {
        detail: String,
        #[source]
        source: nix::Error,
    },

    /// `epoll_ctl` rejected an add or modify that isn't the stdin
    /// pseudo-registration workaround.
    #[error("failed to register {detail}: {source}")]
    Registration {
        detail: String,
        #[source]
        source: nix::Error,
    },

    /// A short read on a signal, timer, or event fd after the kernel
    /// reported it readable.
    #[error("short read draining {detail}: {source}")]
    Drain {
        detail: String,
        #[source]
        source: nix::Error,
    },

    /// `epoll_wait` failed for a reason other than `EINTR`. The context
    /// has already torn itself down by the time this is returned.
    #[error("epoll_wait failed: {source}")]
    Wait {
        #[source]
        source: nix::Error,
    },
}

pub(crate) fn invalid(detail: impl Into<String>) -> LoopError {
    LoopError::InvalidArgument { detail: detail.into() }
}

pub(crate) fn resource(detail: impl Into<String>, source: nix::Error) -> LoopError {
    LoopError::ResourceAcquisition { detail: detail.into(), source }
}

pub(crate) fn registration(detail: impl Into<String>, source: nix::Error) -> LoopError {
    LoopError::Registration { detail: detail.into(), source }
}

pub(crate) fn drain(detail: impl Into<String>, source: nix::Error) -> LoopError {
    LoopError::Drain { detail: detail.into(), source }
}
