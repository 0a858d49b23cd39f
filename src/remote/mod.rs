//! Contract of the authoritative engine on the other side of the transport.
//!
//! Every server-side resource is referenced through an opaque handle. The
//! proxy owns each handle it receives and releases it explicitly; nothing
//! here depends on how calls are carried.

pub mod loopback;

use crate::catalog::delta::DeltaScript;
use crate::catalog::schema::CatalogObject;
use crate::catalog::types::{ColumnType, Row, Value};
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorHandle(pub u64);

/// Opaque row position issued by a remote cursor. Valid until disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bookmark(pub u64);

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn step(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFlags {
    pub bof: bool,
    pub eof: bool,
}

/// Rows are in fetch order. `flags.bof` means no row precedes the fetched
/// rows and `flags.eof` means none follows them; `false` is always a safe
/// answer for a server that does not know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub rows: Vec<Row>,
    pub bookmarks: Vec<Bookmark>,
    pub flags: CursorFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveResult {
    pub moved: i64,
    pub flags: CursorFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotoResult {
    pub success: bool,
    pub flags: CursorFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposableResult {
    pub changed: bool,
    pub row: Row,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposableOp {
    Default,
    Change,
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCapabilities {
    pub navigable: bool,
    pub back_navigable: bool,
    pub bookmarkable: bool,
    pub searchable: bool,
    pub updateable: bool,
}

impl CursorCapabilities {
    pub fn all() -> Self {
        Self {
            navigable: true,
            back_navigable: true,
            bookmarkable: true,
            searchable: true,
            updateable: true,
        }
    }

    pub fn forward_only() -> Self {
        Self {
            navigable: true,
            back_navigable: false,
            bookmarkable: false,
            searchable: false,
            updateable: false,
        }
    }
}

/// Which proposable calls the compiled plan can answer without the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProposables {
    pub default: bool,
    pub change: bool,
    pub validate: bool,
}

impl LocalProposables {
    pub fn all() -> Self {
        Self {
            default: true,
            change: true,
            validate: true,
        }
    }

    pub fn allows(&self, op: ProposableOp) -> bool {
        match op {
            ProposableOp::Default => self.default,
            ProposableOp::Change => self.change,
            ProposableOp::Validate => self.validate,
        }
    }
}

/// Table-level flags, overridden per column where the plan says so.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposableSupport {
    pub table: LocalProposables,
    pub columns: BTreeMap<String, LocalProposables>,
}

impl ProposableSupport {
    pub fn is_local(&self, op: ProposableOp, column: Option<&str>) -> bool {
        match column.and_then(|c| self.columns.get(c)) {
            Some(flags) => flags.allows(op),
            None => self.table.allows(op),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultTypeDescriptor {
    Table { object_name: String },
    Scalar(ColumnType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub cache_name: String,
    pub statement: String,
    pub library: String,
    pub params: Vec<Param>,
}

/// Everything the server reports about a freshly prepared statement,
/// including what the client mirror must do before the plan may be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDescriptor {
    pub handle: PlanHandle,
    pub current_generation: u64,
    pub required_client_timestamp: u64,
    pub delta_applies: bool,
    pub delta_script: DeltaScript,
    pub object_name: Option<String>,
    pub result_type: ResultTypeDescriptor,
    pub capabilities: CursorCapabilities,
    pub proposables: ProposableSupport,
    /// Plans over session-local objects are never shared through the plan cache.
    pub session_scoped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorDescriptor {
    pub handle: CursorHandle,
    pub capabilities: CursorCapabilities,
    pub flags: CursorFlags,
}

pub trait RemoteEngine: Send + Sync {
    fn prepare(&self, request: &PrepareRequest) -> Result<PlanDescriptor, ProxyError>;
    fn unprepare(&self, plan: PlanHandle) -> Result<(), ProxyError>;

    fn open_cursor(
        &self,
        plan: PlanHandle,
        params: &[Param],
    ) -> Result<CursorDescriptor, ProxyError>;
    fn close_cursor(&self, cursor: CursorHandle) -> Result<(), ProxyError>;

    /// Reads up to `count` rows starting at the current row (or the first row
    /// in `direction` when positioned on a crack) and leaves the cursor on the
    /// last row returned.
    fn fetch(
        &self,
        cursor: CursorHandle,
        count: usize,
        direction: Direction,
    ) -> Result<FetchResult, ProxyError>;
    fn move_by(&self, cursor: CursorHandle, delta: i64) -> Result<MoveResult, ProxyError>;
    fn first(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError>;
    fn last(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError>;
    fn select(&self, cursor: CursorHandle) -> Result<Row, ProxyError>;

    fn get_bookmark(&self, cursor: CursorHandle) -> Result<Bookmark, ProxyError>;
    fn goto_bookmark(
        &self,
        cursor: CursorHandle,
        bookmark: Bookmark,
        forward: bool,
    ) -> Result<GotoResult, ProxyError>;
    fn dispose_bookmarks(
        &self,
        cursor: CursorHandle,
        bookmarks: &[Bookmark],
    ) -> Result<(), ProxyError>;
    fn dispose_bookmark(&self, cursor: CursorHandle, bookmark: Bookmark) -> Result<(), ProxyError> {
        self.dispose_bookmarks(cursor, &[bookmark])
    }

    fn insert(&self, cursor: CursorHandle, row: &Row) -> Result<CursorFlags, ProxyError>;
    fn update(&self, cursor: CursorHandle, row: &Row) -> Result<CursorFlags, ProxyError>;
    fn delete(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError>;
    fn find_key(&self, cursor: CursorHandle, key: &Row) -> Result<GotoResult, ProxyError>;
    fn find_nearest(&self, cursor: CursorHandle, key: &Row) -> Result<CursorFlags, ProxyError>;
    fn refresh(&self, cursor: CursorHandle, row: &Row) -> Result<GotoResult, ProxyError>;

    fn default_row(
        &self,
        cursor: CursorHandle,
        row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError>;
    fn change(
        &self,
        cursor: CursorHandle,
        old_row: &Row,
        new_row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError>;
    fn validate(
        &self,
        cursor: CursorHandle,
        old_row: Option<&Row>,
        new_row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError>;

    /// Definition of a catalog object the local mirror does not hold.
    fn describe_object(&self, name: &str) -> Result<Option<CatalogObject>, ProxyError>;

    /// Hint that the named cache fell out of step; the server should refresh
    /// its timestamp bookkeeping for it.
    fn notify_desynchronized(&self, cache_name: &str) -> Result<(), ProxyError>;

    /// The named cache was destroyed with its last session. A cache created
    /// later under the same name starts from an empty mirror.
    fn release_cache(&self, cache_name: &str) -> Result<(), ProxyError>;
}
