//! The filesystem-change watcher the design enumerates but leaves
//! unimplemented.
//!
//! [`crate::watcher::WatcherKind::Fs`] exists so the dispatcher's
//! kind-dispatch stays exhaustive and visibly accounts for this case, but
//! nothing ever constructs one: `init` always fails. See SPEC_FULL.md §9
//! and spec.md §1's Non-goals ("No filesystem-operation watcher").

use crate::context::Context;
use crate::error::{invalid, Result};
use crate::watcher::{EventMask, WatcherId};

/// Always returns an error. Reserved for a future inotify-backed watcher
/// over `ctx`'s (currently unused) inotify fd.
pub struct FsWatcher;

impl FsWatcher {
    pub fn init(
        _ctx: &mut Context,
        _path: &std::path::Path,
        _cb: impl FnMut(&mut Context, WatcherId, EventMask) + 'static,
    ) -> Result<Self> {
        Err(invalid("filesystem watcher is not implemented"))
    }
}
