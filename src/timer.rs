//! The timer watcher adapter: binds a `CLOCK_MONOTONIC` timerfd to a
//! `(timeout_ms, period_ms)` pair.

use std::os::unix::io::AsRawFd;

use crate::context::{arm_timerfd, new_timerfd, Context};
use crate::error::{invalid, Result};
use crate::watcher::{Active, Callback, EventMask, WatcherId, WatcherKind};

/// A watcher that fires `timeout_ms` after it is armed, then every
/// `period_ms` after that (or once, if `period_ms == 0`).
#[derive(Clone, Copy, Debug)]
pub struct TimerWatcher(WatcherId);

impl TimerWatcher {
    /// Register a callback firing `timeout_ms` from now, then every
    /// `period_ms` (0 means single-shot).
    pub fn init(
        ctx: &mut Context,
        timeout_ms: u64,
        period_ms: u64,
        cb: impl FnMut(&mut Context, WatcherId, EventMask) + 'static,
    ) -> Result<Self> {
        let id = ctx.alloc_slot(
            WatcherKind::Timer { timeout_ms, period_ms, tfd: None },
            -1,
            EventMask::READ,
            Box::new(cb) as Callback,
        )?;
        let w = TimerWatcher(id);
        w.set(ctx, timeout_ms, period_ms)?;
        Ok(w)
    }

    pub fn id(self) -> WatcherId {
        self.0
    }

    /// Used by [`Context::run`][crate::Context::run]'s startup pass to
    /// re-arm every stored timer from its recorded pair.
    pub(crate) fn from_id(id: WatcherId) -> Self {
        TimerWatcher(id)
    }

    /// Arm (or re-arm) the kernel timer with a fresh `(timeout_ms,
    /// period_ms)` pair. `timeout_ms == 0` still arms the timer, at a
    /// nominal 1ns initial expiration, rather than disarming it.
    pub fn set(self, ctx: &mut Context, timeout_ms: u64, period_ms: u64) -> Result<()> {
        ctx.stop_internal(self.0)?;

        let tfd = new_timerfd()?;
        arm_timerfd(&tfd, timeout_ms, period_ms)?;
        let fd = tfd.as_raw_fd();

        {
            let slot = ctx.slot_mut(self.0)?;
            slot.fd = fd;
            slot.events = EventMask::READ;
            if let WatcherKind::Timer { timeout_ms: t, period_ms: p, tfd: stored } = &mut slot.kind {
                *t = timeout_ms;
                *p = period_ms;
                *stored = Some(tfd);
            }
        }

        ctx.epoll_add(self.0, fd, EventMask::READ)?;
        ctx.slot_mut(self.0)?.active = Active::Active;
        Ok(())
    }

    /// Re-apply the stored `(timeout_ms, period_ms)` pair.
    pub fn start(self, ctx: &mut Context) -> Result<()> {
        let (timeout_ms, period_ms) = match ctx.slot(self.0)?.kind {
            WatcherKind::Timer { timeout_ms, period_ms, .. } => (timeout_ms, period_ms),
            _ => return Err(invalid("watcher is not a timer watcher")),
        };
        self.set(ctx, timeout_ms, period_ms)
    }

    pub fn stop(self, ctx: &mut Context) -> Result<()> {
        ctx.stop_internal(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunFlags;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    #[test]
    fn one_shot_timer_fires_once() {
        let mut ctx = Context::new(8).unwrap();
        let fired = Rc::new(RefCell::new(0u32));
        let fired2 = fired.clone();
        let start = Instant::now();

        let t = TimerWatcher::init(&mut ctx, 20, 0, move |ctx, _id, events| {
            assert!(events.contains(EventMask::READ));
            *fired2.borrow_mut() += 1;
            ctx.exit_loop();
        })
        .unwrap();

        ctx.run(RunFlags::empty()).unwrap();

        assert_eq!(*fired.borrow(), 1);
        assert!(start.elapsed().as_millis() >= 15);
        assert!(!ctx.is_active(t.id()));
    }

    #[test]
    fn periodic_timer_fires_repeatedly() {
        let mut ctx = Context::new(8).unwrap();
        let count = Rc::new(RefCell::new(0u32));
        let count2 = count.clone();

        let _t = TimerWatcher::init(&mut ctx, 5, 5, move |ctx, _id, _events| {
            *count2.borrow_mut() += 1;
            if *count2.borrow() >= 3 {
                ctx.exit_loop();
            }
        })
        .unwrap();

        ctx.run(RunFlags::empty()).unwrap();

        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn zero_timeout_zero_period_fires_once_immediately() {
        let mut ctx = Context::new(8).unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        let t = TimerWatcher::init(&mut ctx, 0, 0, move |ctx, _id, _events| {
            *fired2.borrow_mut() = true;
            ctx.exit_loop();
        })
        .unwrap();

        ctx.run(RunFlags::ONCE).unwrap();

        assert!(*fired.borrow());
        assert!(!ctx.is_active(t.id()));
    }
}
