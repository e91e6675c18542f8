//! The watcher record and event mask shared by all four subtype adapters.

use std::os::unix::io::{OwnedFd, RawFd};

use nix::sys::signal::Signal;
use nix::sys::signalfd::SignalFd;
use nix::sys::timerfd::TimerFd;

use crate::Context;

bitflags::bitflags! {
    /// Readiness bits a callback can see, mirroring the epoll constants.
    ///
    /// [`EventMask::ONESHOT`] doubles as both a registration request (arm
    /// for one firing) and, on return from `epoll_wait`, confirmation that
    /// the kernel disabled the registration after this firing.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const READ    = libc::EPOLLIN as u32;
        const WRITE   = libc::EPOLLOUT as u32;
        const PRI     = libc::EPOLLPRI as u32;
        const ERROR   = libc::EPOLLERR as u32;
        const HUP     = libc::EPOLLHUP as u32;
        const RDHUP   = libc::EPOLLRDHUP as u32;
        const EDGE    = libc::EPOLLET as u32;
        const ONESHOT = libc::EPOLLONESHOT as u32;
    }
}

/// Opaque handle to a watcher's slot in a [`Context`]'s registry.
///
/// Only meaningful together with the `Context` that produced it. The
/// per-kind handles ([`crate::io::IoWatcher`], [`crate::signal::SignalWatcher`],
/// [`crate::timer::TimerWatcher`], [`crate::event::EventWatcher`]) wrap one
/// and forward to the owning `Context`, which is where the registry and the
/// kernel fds actually live — see DESIGN.md for why storage moved here
/// instead of the caller-owned-memory model the C source uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) usize);

impl WatcherId {
    /// The value stored in `epoll_event.u64` at registration time.
    pub(crate) fn tag(self) -> u64 {
        self.0 as u64
    }

    pub(crate) fn from_tag(tag: u64) -> Self {
        WatcherId(tag as usize)
    }
}

/// Which kernel object a watcher wraps and the kind-specific state needed
/// to re-arm or recreate it.
pub(crate) enum WatcherKind {
    /// Caller-owned fd; the library never closes it.
    Io,
    Signal {
        signo: Signal,
        /// `None` once stopped; recreated by `start`.
        sfd: Option<SignalFd>,
    },
    Timer {
        timeout_ms: u64,
        period_ms: u64,
        /// `None` once stopped; recreated by `start`.
        tfd: Option<TimerFd>,
    },
    Event {
        /// `None` once stopped; recreated by `start`.
        efd: Option<OwnedFd>,
    },
    /// Reserved for the filesystem-change watcher the design enumerates
    /// but never implements (see DESIGN.md, "inotify fd"). No public
    /// constructor ever produces this variant.
    #[allow(dead_code)]
    Fs,
}

/// Registration state, mirroring the source's `active` tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Active {
    Inactive,
    Active,
    /// Pseudo-registered via the stdin-from-file workaround (see
    /// `Context::run`'s workaround pass).
    Pseudo,
}

pub(crate) type Callback = Box<dyn FnMut(&mut Context, WatcherId, EventMask)>;

/// A single entry in the `Context`'s watcher registry.
pub(crate) struct WatcherSlot {
    pub(crate) kind: WatcherKind,
    /// Raw fd currently (or most recently) registered with epoll. `-1`
    /// once a Signal/Timer/Event watcher has had its kernel fd closed by
    /// `stop`.
    pub(crate) fd: RawFd,
    pub(crate) events: EventMask,
    pub(crate) active: Active,
    pub(crate) cb: Callback,
}

impl WatcherSlot {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            WatcherKind::Io => "io",
            WatcherKind::Signal { .. } => "signal",
            WatcherKind::Timer { .. } => "timer",
            WatcherKind::Event { .. } => "event",
            WatcherKind::Fs => "fs",
        }
    }
}
