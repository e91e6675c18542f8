//! The event watcher adapter: a semaphore-style eventfd used to wake the
//! loop from outside a callback (or, with care, from another thread).

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd::write;

use crate::context::Context;
use crate::error::{resource, Result};
use crate::watcher::{Active, Callback, EventMask, WatcherId, WatcherKind};

/// A watcher with no readiness condition of its own; it fires whenever
/// [`EventWatcher::post`] is called.
#[derive(Clone, Copy, Debug)]
pub struct EventWatcher(WatcherId);

impl EventWatcher {
    /// Register a callback and arm the underlying eventfd for read
    /// readiness.
    pub fn init(
        ctx: &mut Context,
        cb: impl FnMut(&mut Context, WatcherId, EventMask) + 'static,
    ) -> Result<Self> {
        let id = ctx.alloc_slot(WatcherKind::Event { efd: None }, -1, EventMask::READ, Box::new(cb) as Callback)?;
        let w = EventWatcher(id);
        w.start(ctx)?;
        Ok(w)
    }

    pub fn id(self) -> WatcherId {
        self.0
    }

    /// (Re)create the eventfd and register it. There is no `set` for
    /// event watchers (spec.md §6): the only reconfigurable state is
    /// whether the watcher is registered at all.
    pub fn start(self, ctx: &mut Context) -> Result<()> {
        ctx.stop_internal(self.0)?;

        let efd = new_eventfd()?;
        let fd = efd.as_raw_fd();

        {
            let slot = ctx.slot_mut(self.0)?;
            slot.fd = fd;
            slot.events = EventMask::READ;
            if let WatcherKind::Event { efd: stored } = &mut slot.kind {
                *stored = Some(efd);
            }
        }

        ctx.epoll_add(self.0, fd, EventMask::READ)?;
        ctx.slot_mut(self.0)?.active = Active::Active;
        Ok(())
    }

    pub fn stop(self, ctx: &mut Context) -> Result<()> {
        ctx.stop_internal(self.0)
    }

    /// Write `1` to the eventfd counter, waking whichever `run` call is
    /// blocked in `epoll_wait` for this context.
    ///
    /// This takes `&Context` rather than `&mut Context`: posting never
    /// touches the registry, only the kernel counter. That makes it safe
    /// to call from a thread other than the one driving `run`, *provided*
    /// no other thread is concurrently mutating this `Context` through a
    /// `&mut` API — the crate does not add its own cross-thread
    /// synchronization beyond the atomicity the kernel already gives a
    /// single `write(2)` of 8 bytes (see SPEC_FULL.md §5).
    pub fn post(self, ctx: &Context) -> Result<()> {
        let fd = ctx.raw_fd_of(self.0)?;
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        write(fd, &buf).map(|_| ()).map_err(|e| resource("eventfd write", e))
    }
}

// nix's own eventfd wrapper has churned across versions; the raw libc call
// is the same one `epoll_create1`'s RawFd-returning nix wrapper ultimately
// makes, so this is no less portable and one less API surface to track.
fn new_eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(resource("eventfd", Errno::last()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
