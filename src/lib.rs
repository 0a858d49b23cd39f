//! Client-side proxy layer for a client/server database engine.
//!
//! Sessions attached to a named client cache share a lazily populated mirror
//! of the server catalog. Every prepared statement brings that mirror up to
//! the state the server requires before its result type is resolved, and
//! cursors read rows through a bookmark-backed read-ahead window.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod plan;
pub mod plan_cache;
pub mod remote;
pub mod session;

pub use crate::config::ProxyConfig;
pub use crate::coordinator::{
    CacheStats, CatalogCacheCoordinator, ClientCache, SessionId, SyncOutcome, SyncRequest,
};
pub use crate::cursor::BufferedCursor;
pub use crate::error::{ProxyError, ProxyErrorCode};
pub use crate::plan::{DataType, PlanProxy};
pub use crate::plan_cache::{CachedPlan, PlanCache, PlanCacheKey, PlanCacheStats};
pub use crate::remote::loopback::LoopbackEngine;
pub use crate::remote::{Bookmark, Direction, Param, RemoteEngine};
pub use crate::session::Session;
