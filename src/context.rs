//! The loop-wide state: the epoll instance, the reserved inotify fd, the
//! watcher registry, and the `run` dispatcher.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::sys::inotify::{InitFlags as InotifyInitFlags, Inotify};
use nix::sys::signalfd::SignalFd;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::read;
use slab::Slab;

use crate::error::{drain, invalid, registration, resource, Result};
use crate::watcher::{Active, Callback, EventMask, WatcherId, WatcherKind, WatcherSlot};

bitflags::bitflags! {
    /// Flags accepted by [`Context::run`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RunFlags: u32 {
        /// Return after a single wait/dispatch cycle.
        const ONCE = 1 << 0;
        /// Use a zero-timeout wait instead of blocking indefinitely.
        const NONBLOCK = 1 << 1;
    }
}

/// The loop-wide state.
///
/// Owns the epoll fd, the reserved (and currently unused) inotify fd, and
/// every watcher's storage. A `Context` is not `Clone`; exactly one thread
/// may call `run` or any watcher operation against a given instance (see
/// SPEC_FULL.md §5).
pub struct Context {
    inner: Option<ContextInner>,
}

struct ContextInner {
    epoll_fd: OwnedFd,
    /// Reserved for the unimplemented `Fs` watcher kind; allocated and
    /// closed with the context but never registered or read from.
    ///
    /// Wrapped in `OwnedFd` rather than stored as a bare `Inotify` — that
    /// type is a `Copy` `RawFd` wrapper with no `Drop`, so holding it
    /// directly would leak the fd on every teardown.
    _inotify_fd: OwnedFd,
    max_events: usize,
    slots: Slab<WatcherSlot>,
    running: bool,
    /// Sticky once any I/O watcher falls back to the stdin-from-file
    /// pseudo-registration workaround.
    workaround: bool,
}

impl Context {
    /// Allocate the epoll and inotify fds. `max_events` bounds how many
    /// ready records a single `epoll_wait` call can return and must be at
    /// least 1.
    pub fn new(max_events: usize) -> Result<Self> {
        if max_events < 1 {
            return Err(invalid("max_events must be >= 1"));
        }

        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| resource("epoll instance", e))?;
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let inotify_fd = Inotify::init(InotifyInitFlags::IN_CLOEXEC | InotifyInitFlags::IN_NONBLOCK)
            .map_err(|e| resource("inotify instance", e))?;
        let inotify_fd = unsafe { OwnedFd::from_raw_fd(inotify_fd.as_raw_fd()) };

        debug!("context initialized (max_events={max_events})");

        Ok(Context {
            inner: Some(ContextInner {
                epoll_fd,
                _inotify_fd: inotify_fd,
                max_events,
                slots: Slab::new(),
                running: false,
                workaround: false,
            }),
        })
    }

    /// Stop every remaining watcher and release the epoll/inotify fds.
    /// Calling this more than once is safe; the second call is a no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else { return Ok(()) };

        let ids: Vec<WatcherId> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.active != Active::Inactive)
            .map(|(idx, _)| WatcherId(idx))
            .collect();

        for id in ids {
            let _ = self.stop_internal(id);
        }

        debug!("context shut down");
        self.inner = None;
        Ok(())
    }

    fn inner(&self) -> Result<&ContextInner> {
        self.inner.as_ref().ok_or_else(|| invalid("context is not initialized"))
    }

    fn inner_mut(&mut self) -> Result<&mut ContextInner> {
        self.inner.as_mut().ok_or_else(|| invalid("context is not initialized"))
    }

    // ---- registry plumbing used by the subtype adapters ----------------

    pub(crate) fn alloc_slot(
        &mut self,
        kind: WatcherKind,
        fd: RawFd,
        events: EventMask,
        cb: Callback,
    ) -> Result<WatcherId> {
        let inner = self.inner_mut()?;
        let idx = inner.slots.insert(WatcherSlot { kind, fd, events, active: Active::Inactive, cb });
        Ok(WatcherId(idx))
    }

    pub(crate) fn slot(&self, id: WatcherId) -> Result<&WatcherSlot> {
        self.inner()?.slots.get(id.0).ok_or_else(|| invalid("unknown watcher"))
    }

    pub(crate) fn slot_mut(&mut self, id: WatcherId) -> Result<&mut WatcherSlot> {
        self.inner_mut()?.slots.get_mut(id.0).ok_or_else(|| invalid("unknown watcher"))
    }

    pub(crate) fn is_active(&self, id: WatcherId) -> bool {
        self.slot(id).map(|s| s.active == Active::Active).unwrap_or(false)
    }

    /// The raw fd currently registered for a watcher. Used by
    /// [`crate::event::EventWatcher::post`], which only needs the fd, not
    /// mutable access to the registry.
    pub(crate) fn raw_fd_of(&self, id: WatcherId) -> Result<RawFd> {
        Ok(self.slot(id)?.fd)
    }

    fn epoll_fd(&self) -> Result<RawFd> {
        Ok(self.inner()?.epoll_fd.as_raw_fd())
    }

    pub(crate) fn epoll_add(&mut self, id: WatcherId, fd: RawFd, events: EventMask) -> Result<()> {
        let epfd = self.epoll_fd()?;
        // EpollFlags is c_int-backed; EventMask is u32 to match the epoll
        // constants directly, so the bits need an explicit cast here.
        let mut ev = EpollEvent::new(EpollFlags::from_bits_truncate(events.bits() as i32), id.tag());
        epoll_ctl(epfd, EpollOp::EpollCtlAdd, fd, Some(&mut ev))
            .map_err(|e| registration(format!("fd {fd}"), e))
    }

    pub(crate) fn epoll_modify(&mut self, id: WatcherId, fd: RawFd, events: EventMask) -> Result<()> {
        let epfd = self.epoll_fd()?;
        let mut ev = EpollEvent::new(EpollFlags::from_bits_truncate(events.bits() as i32), id.tag());
        epoll_ctl(epfd, EpollOp::EpollCtlMod, fd, Some(&mut ev))
            .map_err(|e| registration(format!("fd {fd} (modify)"), e))
    }

    pub(crate) fn epoll_del(&mut self, fd: RawFd) -> Result<()> {
        let epfd = self.epoll_fd()?;
        match epoll_ctl(epfd, EpollOp::EpollCtlDel, fd, None) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(registration(format!("removing fd {fd}"), e)),
        }
    }

    pub(crate) fn enable_workaround(&mut self) -> Result<()> {
        self.inner_mut()?.workaround = true;
        Ok(())
    }

    /// Stop a watcher: deregister it from epoll (if it was really
    /// registered there), close its kernel-owned fd (Signal/Timer/Event),
    /// and mark it inactive. Idempotent.
    pub(crate) fn stop_internal(&mut self, id: WatcherId) -> Result<()> {
        let epfd = self.epoll_fd().ok();
        let inner = self.inner_mut()?;
        let Some(slot) = inner.slots.get_mut(id.0) else { return Ok(()) };

        if slot.active == Active::Inactive {
            return Ok(());
        }

        if slot.active == Active::Active {
            if let Some(epfd) = epfd {
                let _ = epoll_ctl(epfd, EpollOp::EpollCtlDel, slot.fd, None);
            }
        }

        slot.active = Active::Inactive;

        match &mut slot.kind {
            WatcherKind::Io => {}
            WatcherKind::Signal { sfd, .. } => {
                *sfd = None;
                slot.fd = -1;
            }
            WatcherKind::Timer { tfd, .. } => {
                *tfd = None;
                slot.fd = -1;
            }
            WatcherKind::Event { efd } => {
                *efd = None;
                slot.fd = -1;
            }
            WatcherKind::Fs => {}
        }

        trace!("watcher stopped (kind={})", inner.slots[id.0].kind_name());
        Ok(())
    }

    fn has_watchers(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.slots.iter().any(|(_, s)| s.active != Active::Inactive))
            .unwrap_or(false)
    }

    fn is_running(&self) -> bool {
        self.inner.as_ref().map(|i| i.running).unwrap_or(false)
    }

    /// Clear the running flag; `run` finishes the current ready-record
    /// batch and returns rather than stopping mid-dispatch.
    pub fn exit_loop(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.running = false;
        }
    }

    // ---- the dispatcher --------------------------------------------------

    /// Drive the wait/dispatch cycle until `running` is cleared (from a
    /// callback via [`Context::exit_loop`]) and the registry empties out,
    /// or until `flags` requests an earlier return.
    pub fn run(&mut self, flags: RunFlags) -> Result<()> {
        {
            let inner = self.inner_mut()?;
            inner.running = true;
        }

        self.rearm_all_timers()?;

        while self.is_running() && self.has_watchers() {
            if self.inner()?.workaround {
                // Always restart the loop after running the pass, not just
                // when something fired: a pass that finds no data removes
                // the pseudo-watcher in the same call, and the registry may
                // now be empty or may need another probe next time round.
                // Never fall into a real kernel wait on the same cycle a
                // pseudo-watcher was touched (see DESIGN.md).
                self.run_workaround_pass()?;
                continue;
            }

            let ready = match self.wait_once(flags) {
                WaitOutcome::Ready(events) => events,
                WaitOutcome::Interrupted => continue,
                WaitOutcome::StoppedMidWait => break,
                WaitOutcome::Fatal(e) => {
                    let _ = self.shutdown();
                    return Err(e);
                }
            };

            for ev in ready {
                if !self.is_running() {
                    break;
                }
                let id = WatcherId::from_tag(ev.data());
                // ev.events() is nix's c_int-backed EpollFlags; EventMask is
                // u32, so the bits need the inverse cast from epoll_add/modify.
                self.dispatch_one(id, EventMask::from_bits_truncate(ev.events().bits() as u32));
            }

            if flags.contains(RunFlags::ONCE) {
                break;
            }
        }

        Ok(())
    }

    fn wait_once(&mut self, flags: RunFlags) -> WaitOutcome {
        let epfd = match self.epoll_fd() {
            Ok(fd) => fd,
            Err(e) => return WaitOutcome::Fatal(e),
        };
        let max_events = match self.inner() {
            Ok(i) => i.max_events,
            Err(e) => return WaitOutcome::Fatal(e),
        };
        let timeout_ms: isize = if flags.contains(RunFlags::NONBLOCK) { 0 } else { -1 };

        let mut buf = vec![EpollEvent::empty(); max_events];
        match epoll_wait(epfd, &mut buf, timeout_ms) {
            Ok(n) => {
                buf.truncate(n);
                WaitOutcome::Ready(buf)
            }
            Err(Errno::EINTR) => {
                if self.is_running() {
                    WaitOutcome::Interrupted
                } else {
                    WaitOutcome::StoppedMidWait
                }
            }
            Err(e) => WaitOutcome::Fatal(crate::error::LoopError::Wait { source: e }),
        }
    }

    /// Invoke the callback for one ready record, applying kind-specific
    /// pre-callback handling first. The callback is the last thing touched
    /// for this watcher on this iteration, so it may freely stop itself or
    /// any other watcher.
    fn dispatch_one(&mut self, id: WatcherId, raw_events: EventMask) {
        // `is_active` alone would reject pseudo-registered (workaround)
        // watchers, which this is also used to dispatch; check for
        // "stopped earlier in this same batch" instead.
        let live = self.slot(id).map(|s| s.active != Active::Inactive).unwrap_or(false);
        if !live {
            return;
        }

        let events = self.pre_callback(id, raw_events);

        let Ok(slot) = self.slot_mut(id) else { return };
        // Swap the callback out so the closure can mutably borrow `self`;
        // it is always put back afterwards (the watcher's slot persists
        // across stop/start, so there's always somewhere to put it).
        let mut cb = std::mem::replace(&mut slot.cb, Box::new(|_, _, _| {}));

        cb(self, id, events);

        if let Ok(slot) = self.slot_mut(id) {
            slot.cb = cb;
        }
    }

    /// Kind-specific handling that runs before the callback: draining
    /// notification fds, stopping HUP/ERR'd I/O watchers, and auto-stopping
    /// expired one-shot timers. Returns the event mask the callback
    /// actually sees.
    fn pre_callback(&mut self, id: WatcherId, raw_events: EventMask) -> EventMask {
        let masked = raw_events & EventMask::all();

        let kind_is_io = matches!(self.slot(id).map(|s| &s.kind), Ok(WatcherKind::Io));
        if kind_is_io {
            if masked.intersects(EventMask::HUP | EventMask::ERROR) {
                let _ = self.stop_internal(id);
            }
            return masked;
        }

        let fd = match self.slot(id) {
            Ok(slot) => slot.fd,
            Err(_) => return masked,
        };

        let is_signal = matches!(self.slot(id).map(|s| &s.kind), Ok(WatcherKind::Signal { .. }));
        let is_timer = matches!(self.slot(id).map(|s| &s.kind), Ok(WatcherKind::Timer { .. }));
        let is_event = matches!(self.slot(id).map(|s| &s.kind), Ok(WatcherKind::Event { .. }));

        if is_signal {
            let mut buf = [0u8; std::mem::size_of::<libc::signalfd_siginfo>()];
            match read(fd, &mut buf) {
                Ok(n) if n == buf.len() => masked,
                _ => {
                    // Short read: attempt one restart before giving up.
                    match read(fd, &mut buf) {
                        Ok(n) if n == buf.len() => masked,
                        _ => {
                            warn!("signalfd drain failed on watcher {:?}; stopping", id);
                            let _ = self.stop_internal(id);
                            EventMask::ERROR
                        }
                    }
                }
            }
        } else if is_timer {
            let mut buf = [0u8; 8];
            match read(fd, &mut buf) {
                Ok(n) if n == buf.len() => {
                    // A single-shot period (period == 0) expires the
                    // watcher's recorded timeout too, so a plain one-shot
                    // and a periodic timer that just dropped to period = 0
                    // are treated the same way: stop once timeout reaches 0.
                    if let Ok(slot) = self.slot_mut(id) {
                        if let WatcherKind::Timer { timeout_ms, period_ms, .. } = &mut slot.kind {
                            if *period_ms == 0 {
                                *timeout_ms = 0;
                            }
                        }
                    }
                    let expired = matches!(
                        self.slot(id).map(|s| &s.kind),
                        Ok(WatcherKind::Timer { timeout_ms: 0, .. })
                    );
                    if expired {
                        let _ = self.stop_internal(id);
                    }
                    masked
                }
                _ => {
                    warn!("timerfd drain failed on watcher {:?}; stopping", id);
                    let _ = self.stop_internal(id);
                    EventMask::ERROR
                }
            }
        } else if is_event {
            let mut buf = [0u8; 8];
            match read(fd, &mut buf) {
                Ok(n) if n == buf.len() => masked,
                _ => {
                    warn!("eventfd drain failed on watcher {:?}", id);
                    EventMask::HUP
                }
            }
        } else {
            masked
        }
    }

    /// Re-arm every timer currently in the registry with its stored
    /// `(timeout, period)`, run at the start of every `run` call so a
    /// timer created with `init` but never explicitly `start`ed still
    /// fires, and so its countdown begins when the loop actually starts
    /// listening rather than back at `init` time.
    fn rearm_all_timers(&mut self) -> Result<()> {
        let ids: Vec<WatcherId> = {
            let inner = self.inner_mut()?;
            inner
                .slots
                .iter()
                .filter(|(_, s)| matches!(s.kind, WatcherKind::Timer { .. }))
                .map(|(idx, _)| WatcherId(idx))
                .collect()
        };
        for id in ids {
            let (timeout_ms, period_ms) = match self.slot(id)?.kind {
                WatcherKind::Timer { timeout_ms, period_ms, .. } => (timeout_ms, period_ms),
                _ => continue,
            };
            crate::timer::TimerWatcher::from_id(id).set(self, timeout_ms, period_ms)?;
        }
        Ok(())
    }

    /// The stdin-from-file workaround pass (see SPEC_FULL.md §9). Every
    /// pseudo-registered watcher gets one readiness probe: if it has data,
    /// the callback fires with `READ`; if not, the watcher is stopped and
    /// removed. The `workaround` flag only clears once no pseudo-registered
    /// watcher remains, so a watcher with data keeps being probed on every
    /// loop iteration until it runs dry.
    fn run_workaround_pass(&mut self) -> Result<()> {
        let pseudo: Vec<WatcherId> = {
            let inner = self.inner_mut()?;
            inner
                .slots
                .iter()
                .filter(|(_, s)| s.active == Active::Pseudo)
                .map(|(idx, _)| WatcherId(idx))
                .collect()
        };

        if pseudo.is_empty() {
            if let Ok(inner) = self.inner_mut() {
                inner.workaround = false;
            }
            return Ok(());
        }

        for id in pseudo {
            let fd = match self.slot(id) {
                Ok(slot) => slot.fd,
                Err(_) => continue,
            };

            if !fd_has_data(fd) {
                let _ = self.stop_internal(id);
                continue;
            }

            self.dispatch_one(id, EventMask::READ);
        }

        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("error tearing down context: {e}");
        }
    }
}

enum WaitOutcome {
    Ready(Vec<EpollEvent>),
    Interrupted,
    StoppedMidWait,
    Fatal(crate::error::LoopError),
}

/// Non-destructive readiness probe used by the workaround pass: a
/// zero-timeout `poll` followed by a readable-byte-count query, so a
/// watcher is only pseudo-fired while there is actually something to read.
fn fd_has_data(fd: RawFd) -> bool {
    use nix::poll::{poll, PollFd, PollFlags};

    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, 0) {
        Ok(n) if n > 0 => {}
        _ => return false,
    }

    let mut n: libc::c_int = 0;
    let rv = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    rv == 0 && n > 0
}

// Used only to construct `TimerFd`/`SignalFd` timeouts from millisecond
// counts; kept here since all three timer-adapter call sites need it.
pub(crate) fn millis_to_timespec(ms: u64) -> TimeSpec {
    TimeSpec::from_duration(std::time::Duration::from_millis(ms))
}

pub(crate) fn timer_clock() -> ClockId {
    ClockId::CLOCK_MONOTONIC
}

pub(crate) fn new_timerfd() -> Result<TimerFd> {
    TimerFd::new(timer_clock(), TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK)
        .map_err(|e| resource("timerfd", e))
}

pub(crate) fn arm_timerfd(tfd: &TimerFd, timeout_ms: u64, period_ms: u64) -> Result<()> {
    // A nominal one-shot (timeout = 0) still needs to fire, so the kernel
    // must see a nonzero initial expiration; 1ns is indistinguishable from
    // "immediately" for any caller's purposes.
    let initial = if timeout_ms == 0 {
        TimeSpec::new(0, 1)
    } else {
        millis_to_timespec(timeout_ms)
    };

    let expiration = if period_ms == 0 {
        Expiration::OneShot(initial)
    } else {
        Expiration::IntervalDelayed(initial, millis_to_timespec(period_ms))
    };

    tfd.set(expiration, TimerSetTimeFlags::empty()).map_err(|e| drain("arming timerfd", e))
}

pub(crate) fn new_signalfd(mask: &nix::sys::signal::SigSet) -> Result<SignalFd> {
    SignalFd::with_flags(
        mask,
        nix::sys::signalfd::SfdFlags::SFD_CLOEXEC | nix::sys::signalfd::SfdFlags::SFD_NONBLOCK,
    )
    .map_err(|e| resource("signalfd", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoWatcher;
    use crate::timer::TimerWatcher;
    use nix::unistd::{close, pipe, write};
    use std::cell::RefCell;
    use std::io::{Seek, SeekFrom, Write as _};
    use std::rc::Rc;

    #[test]
    fn max_events_of_one_dispatches_one_at_a_time() {
        let mut ctx = Context::new(1).unwrap();
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        let seen = Rc::new(RefCell::new(0u32));

        let seen1 = seen.clone();
        let _a = IoWatcher::init(&mut ctx, r1, EventMask::READ, move |ctx, this, _events| {
            *seen1.borrow_mut() += 1;
            let _ = ctx.stop_internal(this);
        })
        .unwrap();

        let seen2 = seen.clone();
        let _b = IoWatcher::init(&mut ctx, r2, EventMask::READ, move |ctx, this, _events| {
            *seen2.borrow_mut() += 1;
            let _ = ctx.stop_internal(this);
        })
        .unwrap();

        write(w1, b"x").unwrap();
        write(w2, b"y").unwrap();

        // Each ONCE cycle can report at most one ready record when
        // max_events == 1, even though both fds are readable.
        ctx.run(RunFlags::ONCE).unwrap();
        assert_eq!(*seen.borrow(), 1);

        ctx.run(RunFlags::ONCE).unwrap();
        assert_eq!(*seen.borrow(), 2);

        close(w1).unwrap();
        close(w2).unwrap();
        close(r1).unwrap();
        close(r2).unwrap();
    }

    #[test]
    fn nonblock_with_nothing_ready_dispatches_nothing() {
        let mut ctx = Context::new(8).unwrap();
        let (r, w) = pipe().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        let _io = IoWatcher::init(&mut ctx, r, EventMask::READ, move |_ctx, _this, _events| {
            *fired2.borrow_mut() = true;
        })
        .unwrap();

        ctx.run(RunFlags::ONCE | RunFlags::NONBLOCK).unwrap();

        assert!(!*fired.borrow());
        close(w).unwrap();
        close(r).unwrap();
    }

    // Scenario 6 from spec.md §8: redirecting stdin from a regular file
    // makes epoll reject the registration with EPERM; the workaround
    // fires once while the probe reports data, then auto-removes the
    // watcher.
    #[test]
    fn stdin_from_regular_file_uses_pseudo_registration_workaround() {
        let _ = env_logger::try_init();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let saved_stdin = unsafe { libc::dup(0) };
        assert!(saved_stdin >= 0);
        let rv = unsafe { libc::dup2(std::os::unix::io::AsRawFd::as_raw_fd(&file), 0) };
        assert_eq!(rv, 0);

        let mut ctx = Context::new(8).unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        // The callback must actually drain fd 0, or the readiness probe
        // keeps reporting data forever and the pseudo-watcher never stops.
        let watcher = IoWatcher::init(&mut ctx, 0, EventMask::READ, move |_ctx, _this, events| {
            assert!(events.contains(EventMask::READ));
            let mut buf = [0u8; 16];
            let _ = nix::unistd::read(0, &mut buf);
            *fired2.borrow_mut() = true;
        })
        .unwrap();

        ctx.run(RunFlags::ONCE).unwrap();

        assert!(*fired.borrow());
        assert!(ctx.inner.as_ref().unwrap().workaround);
        assert!(!ctx.is_active(watcher.id()));

        unsafe {
            libc::dup2(saved_stdin, 0);
            libc::close(saved_stdin);
        }
    }

    // A callback that stops both itself and a sibling watcher mid-batch
    // must not corrupt the dispatcher's traversal (spec.md §8, "safe
    // self-mutation").
    #[test]
    fn callback_stopping_itself_and_a_sibling_is_safe() {
        let mut ctx = Context::new(8).unwrap();
        let (r1, w1) = pipe().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order1 = order.clone();
        let sibling = IoWatcher::init(&mut ctx, r1, EventMask::READ, move |ctx, this, _events| {
            order1.borrow_mut().push("sibling");
            let _ = ctx.stop_internal(this);
        })
        .unwrap();

        let order2 = order.clone();
        let timer = TimerWatcher::init(&mut ctx, 0, 0, move |ctx, this, _events| {
            order2.borrow_mut().push("self");
            let _ = ctx.stop_internal(sibling.id());
            let _ = ctx.stop_internal(this);
            ctx.exit_loop();
        })
        .unwrap();

        write(w1, b"z").unwrap();
        ctx.run(RunFlags::empty()).unwrap();

        assert!(!ctx.is_active(timer.id()));
        assert!(!ctx.is_active(sibling.id()));

        close(w1).unwrap();
        close(r1).unwrap();
    }
}
