//! # apphub - local integration hub core
//!
//! apphub lets independently running apps on one machine observe each
//! other's storage changes, call into each other, and be wired together by
//! declarative recipes.
//!
//! ## Core Concepts
//!
//! - **Object-Match DSL**: MongoDB-style filters (`$gt`, `$in`, ...) used by
//!   storage queries and recipe selectors
//! - **Change-Watch Middleware**: describes every storage mutation before and
//!   after it executes
//! - **Remote Session Registry**: callbacks supplied by connected apps
//! - **App Event Bus**: per-app listener tables and subscription lifecycles
//! - **Recipe Engine**: reacts to storage changes with chained calls and reads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use apphub::{Hub, HubConfig, IdentifiedApp, AppId, InMemoryRecipeStore};
//!
//! let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(InMemoryRecipeStore::new()))?);
//!
//! // One session per connected app
//! let mut session = hub.open_session();
//! session.identify(IdentifiedApp::new(AppId(1), "io.example.notes", true), Some(callbacks))?;
//!
//! // Mutations through watched storage are published as storage-change events
//! let storage = hub.watch_storage("io.example.notes", backend)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod app;
pub mod config;
pub mod error;
pub mod object_match;

// Storage boundary and change watching
pub mod change_watch;
pub mod storage;

// Sessions, events and recipes
pub mod events;
pub mod hub;
pub mod recipes;
pub mod remote;
pub mod session;

pub use app::{AppId, IdentifiedApp};
pub use config::{EventBusConfig, HubConfig, RecipeEngineConfig};
pub use error::{ExecutionError, HubError, HubResult, ProtocolError, ValidationError};
pub use object_match::{match_object, validate_object_filter, FilterValidation, MatchResult, Record};

pub use change_watch::{
    ChangeObserver, ChangeWatchMiddleware, FnObserver, StorageChange, StorageChangeInfo,
    WatchedStorage,
};
pub use storage::{
    InMemoryObjectStorage, ObjectStorage, Operation, OperationKind, OperationResult, PrimaryKey,
    PrimaryKeySpec, StorageError,
};

pub use events::{
    AppEvent, AppEventBus, EventDelivery, SubscribeOutcome, SubscriptionId, SubscriptionRequest,
};
pub use hub::Hub;
pub use recipes::{InMemoryRecipeStore, RecipeDefinition, RecipeEngine, RecipeId, RecipeStore};
pub use remote::{CallbackOutcome, RemoteCallbacks, RemoteSessionRegistry};
pub use session::HubSession;
