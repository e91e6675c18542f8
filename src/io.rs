//! The I/O watcher adapter: binds a caller-owned fd to epoll readiness.

use std::os::unix::io::RawFd;

use log::warn;
use nix::errno::Errno;

use crate::context::Context;
use crate::error::{invalid, Result};
use crate::watcher::{Active, EventMask, WatcherId, WatcherKind};

/// A watcher over a caller-supplied file descriptor.
///
/// The library never closes `fd`; the caller owns it for as long as the
/// watcher exists. Cloning an `IoWatcher` just copies the handle — both
/// copies refer to the same registry slot.
#[derive(Clone, Copy, Debug)]
pub struct IoWatcher(WatcherId);

impl IoWatcher {
    /// Register a callback for `events` on `fd`. `fd` must be `>= 0`.
    ///
    /// If epoll refuses the registration with `EPERM` — which happens for
    /// a regular file or a pipe redirected onto fd 0 — and this is a
    /// read-only watch on stdin specifically, the context falls back to
    /// the pseudo-registration workaround instead of propagating the
    /// error (see SPEC_FULL.md §9).
    pub fn init(
        ctx: &mut Context,
        fd: RawFd,
        events: EventMask,
        cb: impl FnMut(&mut Context, WatcherId, EventMask) + 'static,
    ) -> Result<Self> {
        if fd < 0 {
            return Err(invalid(format!("io_init: negative fd {fd}")));
        }

        let id = ctx.alloc_slot(WatcherKind::Io, fd, events, Box::new(cb))?;
        let w = IoWatcher(id);
        w.set(ctx, fd, events)?;
        Ok(w)
    }

    pub fn id(self) -> WatcherId {
        self.0
    }

    /// Reconfigure the fd and/or event mask. If the watcher is already
    /// active and `events` carries [`EventMask::ONESHOT`], this is a
    /// kernel *modify* (rearm) rather than a remove/re-add, so the
    /// registry node is never touched.
    pub fn set(self, ctx: &mut Context, fd: RawFd, events: EventMask) -> Result<()> {
        let was_active = ctx.is_active(self.0);

        if was_active && events.contains(EventMask::ONESHOT) {
            ctx.epoll_modify(self.0, fd, events)?;
            let slot = ctx.slot_mut(self.0)?;
            slot.fd = fd;
            slot.events = events;
            return Ok(());
        }

        ctx.stop_internal(self.0)?;
        {
            let slot = ctx.slot_mut(self.0)?;
            slot.fd = fd;
            slot.events = events;
        }
        self.register(ctx, fd, events)
    }

    /// Re-issue the stored `(fd, events)` pair, as if the watcher had just
    /// been configured fresh.
    pub fn start(self, ctx: &mut Context) -> Result<()> {
        let slot = ctx.slot(self.0)?;
        let (fd, events) = (slot.fd, slot.events);
        self.set(ctx, fd, events)
    }

    pub fn stop(self, ctx: &mut Context) -> Result<()> {
        ctx.stop_internal(self.0)
    }

    fn register(self, ctx: &mut Context, fd: RawFd, events: EventMask) -> Result<()> {
        match ctx.epoll_add(self.0, fd, events) {
            Ok(()) => {
                ctx.slot_mut(self.0)?.active = Active::Active;
                Ok(())
            }
            Err(e) if Self::is_stdin_workaround_case(&e, fd, events) => {
                warn!("epoll rejected stdin read watcher with EPERM; engaging pseudo-poll workaround");
                ctx.slot_mut(self.0)?.active = Active::Pseudo;
                ctx.enable_workaround()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn is_stdin_workaround_case(err: &crate::error::LoopError, fd: RawFd, events: EventMask) -> bool {
        matches!(
            err,
            crate::error::LoopError::Registration { source: Errno::EPERM, .. }
        ) && fd == 0
            && events == EventMask::READ
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunFlags;
    use nix::unistd::{close, pipe, write};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn reads_data_from_a_pipe() {
        let (r, w) = pipe().unwrap();
        let mut ctx = Context::new(8).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();

        let watcher = IoWatcher::init(&mut ctx, r, EventMask::READ, move |ctx, this, events| {
            assert!(events.contains(EventMask::READ));
            let mut buf = [0u8; 16];
            let n = nix::unistd::read(r, &mut buf).unwrap();
            got2.borrow_mut().extend_from_slice(&buf[..n]);
            let _ = this;
            let _ = IoWatcher(this).stop(ctx);
            ctx.exit_loop();
        })
        .unwrap();

        write(w, b"hi").unwrap();
        ctx.run(RunFlags::ONCE).unwrap();

        assert_eq!(&got.borrow()[..], b"hi");
        assert!(!ctx.is_active(watcher.id()));

        close(w).unwrap();
        close(r).unwrap();
    }

    // Law from spec.md §8: for an already-active one-shot watcher, `set`
    // with ONESHOT set is a kernel *modify* (rearm), not a stop+re-add —
    // the watcher keeps firing across cycles without ever losing its
    // registry slot.
    #[test]
    fn oneshot_rearm_is_a_modify_not_a_reinsert() {
        let (r, w) = pipe().unwrap();
        let mut ctx = Context::new(8).unwrap();
        let count = Rc::new(RefCell::new(0u32));
        let count2 = count.clone();

        let watcher = IoWatcher::init(
            &mut ctx,
            r,
            EventMask::READ | EventMask::ONESHOT,
            move |ctx, this, events| {
                assert!(events.contains(EventMask::READ));
                let mut buf = [0u8; 1];
                let _ = nix::unistd::read(r, &mut buf);
                *count2.borrow_mut() += 1;
                // Rearm for the next byte. Since the watcher is already
                // active and ONESHOT is set, this takes the modify branch
                // rather than stop+re-init.
                let _ = IoWatcher(this).set(ctx, r, EventMask::READ | EventMask::ONESHOT);
                ctx.exit_loop();
            },
        )
        .unwrap();

        write(w, b"a").unwrap();
        ctx.run(RunFlags::empty()).unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(ctx.is_active(watcher.id()));

        write(w, b"b").unwrap();
        ctx.run(RunFlags::empty()).unwrap();
        assert_eq!(*count.borrow(), 2);

        close(w).unwrap();
        close(r).unwrap();
    }

    #[test]
    fn hup_stops_watcher_before_callback_but_still_delivers_events() {
        let (r, w) = pipe().unwrap();
        close(w).unwrap();

        let mut ctx = Context::new(8).unwrap();
        let seen_inactive = Rc::new(RefCell::new(false));
        let seen_inactive2 = seen_inactive.clone();

        let watcher = IoWatcher::init(&mut ctx, r, EventMask::READ, move |ctx, this, events| {
            assert!(events.contains(EventMask::HUP) || events.contains(EventMask::READ));
            *seen_inactive2.borrow_mut() = !ctx.is_active(this);
            ctx.exit_loop();
        })
        .unwrap();

        ctx.run(RunFlags::ONCE).unwrap();

        assert!(*seen_inactive.borrow());
        assert!(!ctx.is_active(watcher.id()));
        close(r).unwrap();
    }
}
