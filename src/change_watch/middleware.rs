//! Change-watch middleware.
//!
//! Wraps calls to a downstream [`ObjectStorage`]. When a watcher exists for
//! the call's kind, the middleware describes the change, hands the pre-phase
//! description to the observer, executes a deep copy of the call, then hands
//! over the post-phase description. The result is returned unchanged.
//!
//! Failure semantics:
//! - `preprocess` failing aborts before anything executes.
//! - `postprocess` failing is reported to the caller, but the mutation has
//!   already committed and is not rolled back.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::HubResult;
use crate::storage::{ObjectStorage, Operation, OperationResult, PrimaryKeySpec, StorageError};

use super::changes::{ChangeInfo, PostChangeInfo, PreChangeInfo};
use super::watchers::WatcherTable;

/// Receives change descriptions around watched storage calls.
pub trait ChangeObserver: Send + Sync {
    /// Called before the operation executes.
    fn preprocess(&self, _operation: &Operation, _info: &PreChangeInfo) -> HubResult<()> {
        Ok(())
    }

    /// Called after the operation executed.
    ///
    /// `pre` is the description previously handed to [`Self::preprocess`].
    fn postprocess(
        &self,
        _operation: &Operation,
        _info: &PostChangeInfo,
        _pre: &PreChangeInfo,
    ) -> HubResult<()> {
        Ok(())
    }
}

type PreFn = dyn Fn(&Operation, &PreChangeInfo) -> HubResult<()> + Send + Sync;
type PostFn = dyn Fn(&Operation, &PostChangeInfo, &PreChangeInfo) -> HubResult<()> + Send + Sync;

/// Closure-backed [`ChangeObserver`]; either side may be omitted.
#[derive(Default)]
pub struct FnObserver {
    pre: Option<Box<PreFn>>,
    post: Option<Box<PostFn>>,
}

impl FnObserver {
    /// An observer with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pre-phase callback.
    #[must_use]
    pub fn on_preprocess(
        mut self,
        f: impl Fn(&Operation, &PreChangeInfo) -> HubResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.pre = Some(Box::new(f));
        self
    }

    /// Sets the post-phase callback.
    #[must_use]
    pub fn on_postprocess(
        mut self,
        f: impl Fn(&Operation, &PostChangeInfo, &PreChangeInfo) -> HubResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.post = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for FnObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnObserver")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

impl ChangeObserver for FnObserver {
    fn preprocess(&self, operation: &Operation, info: &PreChangeInfo) -> HubResult<()> {
        match &self.pre {
            Some(f) => f(operation, info),
            None => Ok(()),
        }
    }

    fn postprocess(
        &self,
        operation: &Operation,
        info: &PostChangeInfo,
        pre: &PreChangeInfo,
    ) -> HubResult<()> {
        match &self.post {
            Some(f) => f(operation, info, pre),
            None => Ok(()),
        }
    }
}

/// Intercepts storage calls and describes their changes.
pub struct ChangeWatchMiddleware {
    watchers: WatcherTable,
    observer: Option<Arc<dyn ChangeObserver>>,
    enabled: AtomicBool,
}

impl ChangeWatchMiddleware {
    /// Middleware with the standard watchers reporting to `observer`.
    #[must_use]
    pub fn new(observer: Arc<dyn ChangeObserver>) -> Self {
        Self::with_watchers(WatcherTable::standard(), Some(observer))
    }

    /// Middleware with an explicit watcher table and optional observer.
    #[must_use]
    pub fn with_watchers(
        watchers: WatcherTable,
        observer: Option<Arc<dyn ChangeObserver>>,
    ) -> Self {
        Self {
            watchers,
            observer,
            enabled: AtomicBool::new(true),
        }
    }

    /// Turns interception on or off. Disabled middleware is a pure pass-through.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether interception is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Runs `operation` against `next`, describing it if watched.
    pub fn process(
        &self,
        operation: Operation,
        next: &dyn ObjectStorage,
    ) -> HubResult<OperationResult> {
        let observer = match (&self.observer, self.is_enabled()) {
            (Some(observer), true) => observer,
            _ => return Ok(next.execute(operation)?),
        };
        let Some(watcher) = self.watchers.get(operation.kind()) else {
            return Ok(next.execute(operation)?);
        };

        let pre = ChangeInfo::new((watcher.before)(&operation, next)?);
        observer.preprocess(&operation, &pre)?;

        // Downstream gets its own copy; the watcher keeps reading the original.
        let forwarded = operation.clone();
        let result = next.execute(forwarded)?;

        let post = ChangeInfo::new((watcher.after)(&operation, &result, &pre.changes)?);
        debug!(
            operation = %operation.kind(),
            changes = post.changes.len(),
            "storage change observed"
        );
        observer.postprocess(&operation, &post, &pre)?;
        Ok(result)
    }
}

impl fmt::Debug for ChangeWatchMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeWatchMiddleware")
            .field("watchers", &self.watchers)
            .field("observer", &self.observer.is_some())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A storage backend with change-watch middleware in front of it.
#[derive(Debug)]
pub struct WatchedStorage<S> {
    inner: S,
    middleware: ChangeWatchMiddleware,
}

impl<S: ObjectStorage> WatchedStorage<S> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: S, middleware: ChangeWatchMiddleware) -> Self {
        Self { inner, middleware }
    }

    /// Executes an operation through the middleware.
    pub fn execute(&self, operation: Operation) -> HubResult<OperationResult> {
        self.middleware.process(operation, &self.inner)
    }

    /// Primary key layout of a collection, read from the wrapped backend.
    pub fn primary_key(&self, collection: &str) -> Result<PrimaryKeySpec, StorageError> {
        self.inner.primary_key(collection)
    }

    /// The middleware, e.g. to toggle it.
    #[must_use]
    pub const fn middleware(&self) -> &ChangeWatchMiddleware {
        &self.middleware
    }

    /// The unwrapped backend.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}
