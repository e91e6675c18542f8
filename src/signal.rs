//! The signal watcher adapter: blocks a POSIX signal process-wide and
//! delivers it through a signalfd instead of a traditional handler.

use std::os::unix::io::AsRawFd;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use crate::context::{new_signalfd, Context};
use crate::error::{invalid, resource, Result};
use crate::watcher::{Active, Callback, EventMask, WatcherId, WatcherKind};

/// A watcher that fires when `signo` is pending for this process.
///
/// `init` blocks the signal via `pthread_sigmask` so it can no longer be
/// delivered as a traditional handler invocation; the only way to observe
/// it afterwards is through this watcher's signalfd. Blocking a signal is
/// process-wide and is never undone by `stop` (the source doesn't unblock
/// it either — see DESIGN.md).
#[derive(Clone, Copy, Debug)]
pub struct SignalWatcher(WatcherId);

impl SignalWatcher {
    /// Register a callback for `signo`.
    pub fn init(
        ctx: &mut Context,
        signo: Signal,
        cb: impl FnMut(&mut Context, WatcherId, EventMask) + 'static,
    ) -> Result<Self> {
        let id = ctx.alloc_slot(
            WatcherKind::Signal { signo, sfd: None },
            -1,
            EventMask::READ,
            Box::new(cb) as Callback,
        )?;
        let w = SignalWatcher(id);
        w.set(ctx, signo)?;
        Ok(w)
    }

    pub fn id(self) -> WatcherId {
        self.0
    }

    /// Store `signo`, block it process-wide, point the signalfd at the
    /// singleton set `{signo}`, and (re)start the watcher.
    pub fn set(self, ctx: &mut Context, signo: Signal) -> Result<()> {
        ctx.stop_internal(self.0)?;

        let mut mask = SigSet::empty();
        mask.add(signo);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(|e| resource("pthread_sigmask", e))?;

        let sfd = new_signalfd(&mask)?;
        let fd = sfd.as_raw_fd();

        {
            let slot = ctx.slot_mut(self.0)?;
            slot.fd = fd;
            slot.events = EventMask::READ;
            if let WatcherKind::Signal { signo: stored_signo, sfd: stored_fd } = &mut slot.kind {
                *stored_signo = signo;
                *stored_fd = Some(sfd);
            }
        }

        ctx.epoll_add(self.0, fd, EventMask::READ)?;
        ctx.slot_mut(self.0)?.active = Active::Active;
        Ok(())
    }

    /// Re-run `set` with the stored signal number, closing any stale fd
    /// first (handled by `stop_internal` inside `set`).
    pub fn start(self, ctx: &mut Context) -> Result<()> {
        let signo = match ctx.slot(self.0)?.kind {
            WatcherKind::Signal { signo, .. } => signo,
            _ => return Err(invalid("watcher is not a signal watcher")),
        };
        self.set(ctx, signo)
    }

    pub fn stop(self, ctx: &mut Context) -> Result<()> {
        ctx.stop_internal(self.0)
    }
}
