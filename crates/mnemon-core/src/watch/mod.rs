//! Watcher + Coordination
//!
//! Debounced filesystem watching with direct pipeline injection, and the
//! per-project single-writer lock reclaimed from dead PIDs.

mod lock;
mod watcher;

pub use lock::{list_active, pid_alive, LockError, LockHandle, WatcherLock};
pub use watcher::{
    CodeWatcher, WatchEvent, WatchSink, WatchState, WatcherConfig, WatcherHandle,
};
