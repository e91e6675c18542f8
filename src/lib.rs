//! `miniloop`: a micro event-loop for Linux.
//!
//! A single epoll instance multiplexes readiness across four kinds of
//! watcher — caller-owned I/O fds, kernel timers, blocked POSIX signals,
//! and user-posted wakeups — and dispatches each to a per-watcher callback.
//! See `SPEC_FULL.md` in the crate root for the full design.

#![cfg(unix)]

mod context;
mod error;
mod event;
mod fs;
mod io;
mod signal;
mod timer;
mod watcher;

pub use context::{Context, RunFlags};
pub use error::{LoopError, Result};
pub use event::EventWatcher;
pub use fs::FsWatcher;
pub use io::IoWatcher;
pub use signal::SignalWatcher;
pub use timer::TimerWatcher;
pub use watcher::{EventMask, WatcherId};
