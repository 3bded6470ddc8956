//! Storage change interception.
//!
//! Turns raw mutation calls into structured before/after change descriptors
//! while forwarding the call itself unchanged.

/// Change descriptor types.
pub mod changes;
/// The middleware and its observer interface.
pub mod middleware;
/// Per-operation watcher table.
pub mod watchers;

pub use changes::{
    ChangeInfo, PostChange, PostChangeInfo, PreChange, PreChangeInfo, StorageChange,
    StorageChangeInfo,
};
pub use middleware::{ChangeObserver, ChangeWatchMiddleware, FnObserver, WatchedStorage};
pub use watchers::{AfterFn, BeforeFn, ChangeWatcher, WatcherTable};
