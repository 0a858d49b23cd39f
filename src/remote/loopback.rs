//! In-process server used by tests, benches and embedders that run the proxy
//! against a local engine.
//!
//! Statements understood by `prepare`:
//! - `select <table>`: every row of the table, ordered by primary key.
//! - `count <table>`: a single integer row; the cursor is not bookmarkable.

use crate::catalog::delta::DeltaScript;
use crate::catalog::schema::{CatalogObject, ColumnDef, TableAlteration, TableSchema};
use crate::catalog::types::{ColumnType, Row, Value};
use crate::catalog::{Catalog, DdlOperation};
use crate::cursor::proposable;
use crate::error::{ProxyError, ResourceType};
use crate::remote::{
    Bookmark, CursorCapabilities, CursorDescriptor, CursorFlags, CursorHandle, Direction,
    FetchResult, GotoResult, LocalProposables, MoveResult, Param, PlanDescriptor, PlanHandle,
    PrepareRequest, ProposableResult, ProposableSupport, RemoteEngine, ResultTypeDescriptor,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub prepares: u64,
    pub unprepares: u64,
    pub cursors_opened: u64,
    pub cursors_closed: u64,
    pub fetches: u64,
    pub rows_fetched: u64,
    pub moves: u64,
    pub gotos: u64,
    pub selects: u64,
    pub dispose_calls: u64,
    pub bookmarks_disposed: u64,
    pub mutations: u64,
    pub proposable_calls: u64,
    pub describe_calls: u64,
    pub desync_notices: u64,
}

#[derive(Default)]
struct Counters {
    prepares: AtomicU64,
    unprepares: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_closed: AtomicU64,
    fetches: AtomicU64,
    rows_fetched: AtomicU64,
    moves: AtomicU64,
    gotos: AtomicU64,
    selects: AtomicU64,
    dispose_calls: AtomicU64,
    bookmarks_disposed: AtomicU64,
    mutations: AtomicU64,
    proposable_calls: AtomicU64,
    describe_calls: AtomicU64,
    desync_notices: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Per-table knobs reported in plan descriptors.
#[derive(Debug, Clone)]
struct TableOptions {
    capabilities: CursorCapabilities,
    proposables: ProposableSupport,
    session_scoped: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            capabilities: CursorCapabilities::all(),
            proposables: ProposableSupport {
                table: LocalProposables::all(),
                columns: Default::default(),
            },
            session_scoped: false,
        }
    }
}

/// What the server remembers about one named client cache.
#[derive(Debug, Default)]
struct CacheBookkeeping {
    issued_timestamp: u64,
    generation: u64,
    shipped: HashSet<String>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    id: u64,
    key: Row,
    row: Row,
}

#[derive(Debug, Clone)]
enum PlanSource {
    Table(String),
    Count(String),
}

#[derive(Debug, Clone)]
struct ServerPlan {
    source: PlanSource,
    capabilities: CursorCapabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Bof,
    Eof,
    At(u64),
}

#[derive(Debug)]
enum CursorSource {
    Table(String),
    Static(Vec<StoredRow>),
}

#[derive(Debug)]
struct ServerCursor {
    source: CursorSource,
    position: Position,
    capabilities: CursorCapabilities,
}

#[derive(Debug, Clone, Copy)]
struct BookmarkTarget {
    cursor: u64,
    row_id: u64,
}

struct ServerState {
    catalog: Catalog,
    generation: u64,
    rows: HashMap<String, Vec<StoredRow>>,
    options: HashMap<String, TableOptions>,
    caches: HashMap<String, CacheBookkeeping>,
    plans: HashMap<u64, ServerPlan>,
    cursors: HashMap<u64, ServerCursor>,
    bookmarks: HashMap<u64, BookmarkTarget>,
    bookmark_by_row: HashMap<(u64, u64), u64>,
    next_row_id: u64,
    next_plan: u64,
    next_cursor: u64,
    next_bookmark: u64,
}

pub struct LoopbackEngine {
    state: Mutex<ServerState>,
    counters: Counters,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn position_flags(index: isize, len: usize) -> CursorFlags {
    CursorFlags {
        bof: index < 0 || len == 0,
        eof: index >= len as isize || len == 0,
    }
}

fn table_not_found(table: &str) -> ProxyError {
    ProxyError::NotFound {
        resource_type: ResourceType::Table,
        resource_id: table.to_string(),
    }
}

fn cursor_not_found(cursor: CursorHandle) -> ProxyError {
    ProxyError::NotFound {
        resource_type: ResourceType::Cursor,
        resource_id: cursor.0.to_string(),
    }
}

impl ServerState {
    fn cursor(&self, cursor: CursorHandle) -> Result<&ServerCursor, ProxyError> {
        self.cursors
            .get(&cursor.0)
            .ok_or_else(|| cursor_not_found(cursor))
    }

    fn cursor_rows<'a>(&'a self, cursor: &'a ServerCursor) -> &'a [StoredRow] {
        match &cursor.source {
            CursorSource::Table(table) => self.rows.get(table).map(Vec::as_slice).unwrap_or(&[]),
            CursorSource::Static(rows) => rows,
        }
    }

    /// Cursor position as an index in `-1..=len`.
    fn index_of(&self, cursor: CursorHandle) -> Result<(isize, usize), ProxyError> {
        let state = self.cursor(cursor)?;
        let rows = self.cursor_rows(state);
        let index = match state.position {
            Position::Bof => -1,
            Position::Eof => rows.len() as isize,
            Position::At(id) => rows
                .iter()
                .position(|r| r.id == id)
                .map_or(-1, |idx| idx as isize),
        };
        Ok((index, rows.len()))
    }

    fn set_index(&mut self, cursor: CursorHandle, index: isize) -> Result<(), ProxyError> {
        let state = self.cursor(cursor)?;
        let rows = self.cursor_rows(state);
        let position = if index < 0 {
            Position::Bof
        } else if index as usize >= rows.len() {
            Position::Eof
        } else {
            Position::At(rows[index as usize].id)
        };
        if let Some(state) = self.cursors.get_mut(&cursor.0) {
            state.position = position;
        }
        Ok(())
    }

    fn row_at(&self, cursor: CursorHandle, index: isize) -> Result<&StoredRow, ProxyError> {
        let state = self.cursor(cursor)?;
        let rows = self.cursor_rows(state);
        if index < 0 {
            return Err(ProxyError::NoCurrentRow);
        }
        rows.get(index as usize).ok_or(ProxyError::NoCurrentRow)
    }

    fn issue_bookmark(&mut self, cursor: u64, row_id: u64) -> Bookmark {
        if let Some(id) = self.bookmark_by_row.get(&(cursor, row_id)) {
            return Bookmark(*id);
        }
        self.next_bookmark += 1;
        let id = self.next_bookmark;
        self.bookmarks.insert(id, BookmarkTarget { cursor, row_id });
        self.bookmark_by_row.insert((cursor, row_id), id);
        Bookmark(id)
    }

    fn bookmark_target(
        &self,
        cursor: CursorHandle,
        bookmark: Bookmark,
    ) -> Result<BookmarkTarget, ProxyError> {
        match self.bookmarks.get(&bookmark.0) {
            Some(target) if target.cursor == cursor.0 => Ok(*target),
            _ => Err(ProxyError::InvalidBookmark {
                bookmark: bookmark.0,
            }),
        }
    }

    /// Schema of the table a cursor reads, for cursors that read a table.
    fn cursor_table(&self, cursor: CursorHandle) -> Result<&TableSchema, ProxyError> {
        match &self.cursor(cursor)?.source {
            CursorSource::Table(table) => self
                .catalog
                .table(table)
                .ok_or_else(|| table_not_found(table)),
            CursorSource::Static(_) => Err(ProxyError::CapabilityNotSupported {
                capability: "updateable",
            }),
        }
    }

    fn require(
        &self,
        cursor: CursorHandle,
        check: fn(&CursorCapabilities) -> bool,
        capability: &'static str,
    ) -> Result<(), ProxyError> {
        if check(&self.cursor(cursor)?.capabilities) {
            Ok(())
        } else {
            Err(ProxyError::CapabilityNotSupported { capability })
        }
    }

    fn table_rows_mut(&mut self, cursor: CursorHandle) -> Result<&mut Vec<StoredRow>, ProxyError> {
        let table = match &self.cursor(cursor)?.source {
            CursorSource::Table(table) => table.clone(),
            CursorSource::Static(_) => {
                return Err(ProxyError::CapabilityNotSupported {
                    capability: "updateable",
                });
            }
        };
        self.rows
            .get_mut(&table)
            .ok_or_else(|| table_not_found(&table))
    }

    fn insert_stored(&mut self, table: &str, row: Row) -> Result<u64, ProxyError> {
        let schema = self
            .catalog
            .table(table)
            .ok_or_else(|| table_not_found(table))?;
        schema.check_row(&row, None)?;
        let key = schema.key_of(&row);
        let rows = self.rows.entry(table.to_string()).or_default();
        let Err(at) = rows.binary_search_by(|r| r.key.cmp(&key)) else {
            return Err(ProxyError::Validation(format!(
                "duplicate primary key in {table}"
            )));
        };
        self.next_row_id += 1;
        let id = self.next_row_id;
        rows.insert(at, StoredRow { id, key, row });
        Ok(id)
    }

    fn apply_server_ddl(&mut self, op: DdlOperation) -> Result<(), ProxyError> {
        let mut catalog = self.catalog.snapshot();
        catalog.apply_ddl(op.clone())?;
        match &op {
            DdlOperation::CreateTable { table_name, .. } => {
                self.rows.entry(table_name.clone()).or_default();
            }
            DdlOperation::DropTable { table_name, .. } => {
                self.rows.remove(table_name);
                self.options.remove(table_name);
            }
            DdlOperation::DropLibrary { .. } => {
                self.rows.retain(|table, _| catalog.tables.contains_key(table));
            }
            DdlOperation::AlterTable {
                table_name,
                alteration,
            } => {
                let old_index = match alteration {
                    TableAlteration::DropColumn { name } => self
                        .catalog
                        .table(table_name)
                        .and_then(|t| t.column_index(name)),
                    _ => None,
                };
                if let Some(rows) = self.rows.get_mut(table_name) {
                    match alteration {
                        TableAlteration::AddColumn(column) => {
                            let fill = column.default.clone().unwrap_or(Value::Null);
                            for stored in rows.iter_mut() {
                                stored.row.values.push(fill.clone());
                            }
                        }
                        TableAlteration::DropColumn { .. } => {
                            if let Some(idx) = old_index {
                                for stored in rows.iter_mut() {
                                    stored.row.values.remove(idx);
                                }
                            }
                        }
                        TableAlteration::SetDefault { .. } => {}
                    }
                }
            }
            _ => {}
        }
        self.catalog = catalog;
        self.generation += 1;
        Ok(())
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                catalog: Catalog::baseline(),
                generation: 0,
                rows: HashMap::new(),
                options: HashMap::new(),
                caches: HashMap::new(),
                plans: HashMap::new(),
                cursors: HashMap::new(),
                bookmarks: HashMap::new(),
                bookmark_by_row: HashMap::new(),
                next_row_id: 0,
                next_plan: 0,
                next_cursor: 0,
                next_bookmark: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Applies DDL to the authoritative catalog and advances the generation.
    pub fn execute_ddl(&self, op: DdlOperation) -> Result<u64, ProxyError> {
        let mut state = self.state.lock();
        state.apply_server_ddl(op)?;
        debug!(generation = state.generation, "server catalog changed");
        Ok(state.generation)
    }

    pub fn create_library(&self, name: &str) -> Result<u64, ProxyError> {
        self.execute_ddl(DdlOperation::CreateLibrary {
            name: name.to_string(),
            owner_id: None,
            if_not_exists: false,
        })
    }

    pub fn create_table(
        &self,
        library: &str,
        table_name: &str,
        columns: Vec<ColumnDef>,
        primary_key: &[&str],
    ) -> Result<u64, ProxyError> {
        self.execute_ddl(DdlOperation::CreateTable {
            library: library.to_string(),
            table_name: table_name.to_string(),
            owner_id: None,
            if_not_exists: false,
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        for row in rows {
            state.insert_stored(table, row)?;
        }
        Ok(())
    }

    pub fn set_capabilities(&self, table: &str, capabilities: CursorCapabilities) {
        self.state
            .lock()
            .options
            .entry(table.to_string())
            .or_default()
            .capabilities = capabilities;
    }

    pub fn set_proposables(&self, table: &str, proposables: ProposableSupport) {
        self.state
            .lock()
            .options
            .entry(table.to_string())
            .or_default()
            .proposables = proposables;
    }

    pub fn set_session_scoped(&self, table: &str, session_scoped: bool) {
        self.state
            .lock()
            .options
            .entry(table.to_string())
            .or_default()
            .session_scoped = session_scoped;
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn issued_timestamp(&self, cache_name: &str) -> u64 {
        self.state
            .lock()
            .caches
            .get(cache_name)
            .map_or(0, |c| c.issued_timestamp)
    }

    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .rows
            .get(table)
            .map(|rows| rows.iter().map(|r| r.row.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_plans(&self) -> usize {
        self.state.lock().plans.len()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn live_bookmarks(&self) -> usize {
        self.state.lock().bookmarks.len()
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        LoopbackStats {
            prepares: load(&c.prepares),
            unprepares: load(&c.unprepares),
            cursors_opened: load(&c.cursors_opened),
            cursors_closed: load(&c.cursors_closed),
            fetches: load(&c.fetches),
            rows_fetched: load(&c.rows_fetched),
            moves: load(&c.moves),
            gotos: load(&c.gotos),
            selects: load(&c.selects),
            dispose_calls: load(&c.dispose_calls),
            bookmarks_disposed: load(&c.bookmarks_disposed),
            mutations: load(&c.mutations),
            proposable_calls: load(&c.proposable_calls),
            describe_calls: load(&c.describe_calls),
            desync_notices: load(&c.desync_notices),
        }
    }

    fn parse_statement(statement: &str) -> Result<(bool, String), ProxyError> {
        let mut parts = statement.split_whitespace();
        let verb = parts.next().map(str::to_ascii_lowercase);
        let target = parts.next();
        match (verb.as_deref(), target, parts.next()) {
            (Some("select"), Some(table), None) => Ok((false, table.to_string())),
            (Some("count"), Some(table), None) => Ok((true, table.to_string())),
            _ => Err(ProxyError::Validation(format!(
                "unsupported statement: {statement}"
            ))),
        }
    }
}

impl RemoteEngine for LoopbackEngine {
    fn prepare(&self, request: &PrepareRequest) -> Result<PlanDescriptor, ProxyError> {
        let (is_count, table) = Self::parse_statement(&request.statement)?;
        let mut state = self.state.lock();
        if state.catalog.table(&table).is_none() {
            return Err(table_not_found(&table));
        }
        let options = state.options.get(&table).cloned().unwrap_or_default();
        let generation = state.generation;
        let definition = state.catalog.definition_ops(&table)?;

        let cache = state.caches.entry(request.cache_name.clone()).or_default();
        if cache.generation < generation {
            cache.shipped.clear();
            cache.generation = generation;
        }
        let ships_definition = !is_count && !cache.shipped.contains(&table);
        let delta_script = if ships_definition {
            cache.shipped.insert(table.clone());
            DeltaScript::from_ops(&definition)?
        } else {
            DeltaScript::empty()
        };
        cache.issued_timestamp += 1;
        let required_client_timestamp = cache.issued_timestamp;

        state.next_plan += 1;
        let handle = PlanHandle(state.next_plan);
        let (source, capabilities, result_type) = if is_count {
            (
                PlanSource::Count(table.clone()),
                CursorCapabilities {
                    bookmarkable: false,
                    searchable: false,
                    updateable: false,
                    ..CursorCapabilities::all()
                },
                ResultTypeDescriptor::Scalar(ColumnType::Integer),
            )
        } else {
            (
                PlanSource::Table(table.clone()),
                options.capabilities,
                ResultTypeDescriptor::Table {
                    object_name: table.clone(),
                },
            )
        };
        state.plans.insert(
            handle.0,
            ServerPlan {
                source,
                capabilities,
            },
        );
        bump(&self.counters.prepares);
        debug!(
            cache_name = %request.cache_name,
            plan = handle.0,
            required_client_timestamp,
            ships_definition,
            "prepared statement"
        );
        Ok(PlanDescriptor {
            handle,
            current_generation: generation,
            required_client_timestamp,
            delta_applies: ships_definition,
            delta_script,
            object_name: Some(table),
            result_type,
            capabilities,
            proposables: if is_count {
                ProposableSupport::default()
            } else {
                options.proposables
            },
            session_scoped: options.session_scoped,
        })
    }

    fn unprepare(&self, plan: PlanHandle) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        state.plans.remove(&plan.0).ok_or(ProxyError::NotFound {
            resource_type: ResourceType::Plan,
            resource_id: plan.0.to_string(),
        })?;
        bump(&self.counters.unprepares);
        Ok(())
    }

    fn open_cursor(
        &self,
        plan: PlanHandle,
        _params: &[Param],
    ) -> Result<CursorDescriptor, ProxyError> {
        let mut state = self.state.lock();
        let server_plan = state
            .plans
            .get(&plan.0)
            .cloned()
            .ok_or(ProxyError::NotFound {
                resource_type: ResourceType::Plan,
                resource_id: plan.0.to_string(),
            })?;
        let source = match server_plan.source {
            PlanSource::Table(table) => CursorSource::Table(table),
            PlanSource::Count(table) => {
                let count = state.rows.get(&table).map_or(0, Vec::len) as i64;
                CursorSource::Static(vec![StoredRow {
                    id: 1,
                    key: Row::default(),
                    row: Row::from_values(vec![Value::Integer(count)]),
                }])
            }
        };
        state.next_cursor += 1;
        let handle = CursorHandle(state.next_cursor);
        let cursor = ServerCursor {
            source,
            position: Position::Bof,
            capabilities: server_plan.capabilities,
        };
        let len = state.cursor_rows(&cursor).len();
        state.cursors.insert(handle.0, cursor);
        bump(&self.counters.cursors_opened);
        Ok(CursorDescriptor {
            handle,
            capabilities: server_plan.capabilities,
            flags: position_flags(-1, len),
        })
    }

    fn close_cursor(&self, cursor: CursorHandle) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        state
            .cursors
            .remove(&cursor.0)
            .ok_or_else(|| cursor_not_found(cursor))?;
        state.bookmarks.retain(|_, target| target.cursor != cursor.0);
        state.bookmark_by_row.retain(|(owner, _), _| *owner != cursor.0);
        bump(&self.counters.cursors_closed);
        Ok(())
    }

    fn fetch(
        &self,
        cursor: CursorHandle,
        count: usize,
        direction: Direction,
    ) -> Result<FetchResult, ProxyError> {
        bump(&self.counters.fetches);
        let mut state = self.state.lock();
        let (index, len) = state.index_of(cursor)?;
        let len_i = len as isize;
        let start = match direction {
            Direction::Forward => index.max(0),
            Direction::Backward => index.min(len_i - 1),
        };
        let mut picked = Vec::new();
        let mut at = start;
        while picked.len() < count && at >= 0 && at < len_i {
            picked.push(at);
            at += direction.step() as isize;
        }
        let Some(&last) = picked.last() else {
            return Ok(FetchResult {
                flags: CursorFlags {
                    bof: direction == Direction::Backward || len == 0,
                    eof: direction == Direction::Forward || len == 0,
                },
                ..FetchResult::default()
            });
        };

        let lo = start.min(last);
        let hi = start.max(last);
        let mut rows = Vec::with_capacity(picked.len());
        let mut ids = Vec::with_capacity(picked.len());
        for &idx in &picked {
            let stored = state.row_at(cursor, idx)?;
            rows.push(stored.row.clone());
            ids.push(stored.id);
        }
        let bookmarks = ids
            .into_iter()
            .map(|id| state.issue_bookmark(cursor.0, id))
            .collect();
        state.set_index(cursor, last)?;
        self.counters
            .rows_fetched
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(FetchResult {
            rows,
            bookmarks,
            flags: CursorFlags {
                bof: lo == 0,
                eof: hi == len_i - 1,
            },
        })
    }

    fn move_by(&self, cursor: CursorHandle, delta: i64) -> Result<MoveResult, ProxyError> {
        bump(&self.counters.moves);
        let mut state = self.state.lock();
        let (index, len) = state.index_of(cursor)?;
        let target = (index as i64 + delta).clamp(-1, len as i64) as isize;
        state.set_index(cursor, target)?;
        Ok(MoveResult {
            moved: (target - index) as i64,
            flags: position_flags(target, len),
        })
    }

    fn first(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError> {
        bump(&self.counters.moves);
        let mut state = self.state.lock();
        let (_, len) = state.index_of(cursor)?;
        state.set_index(cursor, -1)?;
        Ok(position_flags(-1, len))
    }

    fn last(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError> {
        bump(&self.counters.moves);
        let mut state = self.state.lock();
        let (_, len) = state.index_of(cursor)?;
        state.set_index(cursor, len as isize)?;
        Ok(position_flags(len as isize, len))
    }

    fn select(&self, cursor: CursorHandle) -> Result<Row, ProxyError> {
        bump(&self.counters.selects);
        let state = self.state.lock();
        let (index, _) = state.index_of(cursor)?;
        Ok(state.row_at(cursor, index)?.row.clone())
    }

    fn get_bookmark(&self, cursor: CursorHandle) -> Result<Bookmark, ProxyError> {
        let mut state = self.state.lock();
        state.require(cursor, |c| c.bookmarkable, "bookmarkable")?;
        let (index, _) = state.index_of(cursor)?;
        let row_id = state.row_at(cursor, index)?.id;
        Ok(state.issue_bookmark(cursor.0, row_id))
    }

    fn goto_bookmark(
        &self,
        cursor: CursorHandle,
        bookmark: Bookmark,
        _forward: bool,
    ) -> Result<GotoResult, ProxyError> {
        bump(&self.counters.gotos);
        let mut state = self.state.lock();
        let target = state.bookmark_target(cursor, bookmark)?;
        let (index, len) = state.index_of(cursor)?;
        let found = {
            let server_cursor = state.cursor(cursor)?;
            state
                .cursor_rows(server_cursor)
                .iter()
                .position(|r| r.id == target.row_id)
        };
        match found {
            Some(idx) => {
                state.set_index(cursor, idx as isize)?;
                Ok(GotoResult {
                    success: true,
                    flags: position_flags(idx as isize, len),
                })
            }
            None => Ok(GotoResult {
                success: false,
                flags: position_flags(index, len),
            }),
        }
    }

    fn dispose_bookmarks(
        &self,
        cursor: CursorHandle,
        bookmarks: &[Bookmark],
    ) -> Result<(), ProxyError> {
        bump(&self.counters.dispose_calls);
        let mut state = self.state.lock();
        for bookmark in bookmarks {
            state.bookmark_target(cursor, *bookmark)?;
        }
        for bookmark in bookmarks {
            if let Some(target) = state.bookmarks.remove(&bookmark.0) {
                state.bookmark_by_row.remove(&(target.cursor, target.row_id));
            }
        }
        self.counters
            .bookmarks_disposed
            .fetch_add(bookmarks.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn insert(&self, cursor: CursorHandle, row: &Row) -> Result<CursorFlags, ProxyError> {
        bump(&self.counters.mutations);
        let mut state = self.state.lock();
        state.require(cursor, |c| c.updateable, "updateable")?;
        let table = state.cursor_table(cursor)?.table_name.clone();
        let id = state.insert_stored(&table, row.clone())?;
        if let Some(server_cursor) = state.cursors.get_mut(&cursor.0) {
            server_cursor.position = Position::At(id);
        }
        Ok(CursorFlags::default())
    }

    fn update(&self, cursor: CursorHandle, row: &Row) -> Result<CursorFlags, ProxyError> {
        bump(&self.counters.mutations);
        let mut state = self.state.lock();
        state.require(cursor, |c| c.updateable, "updateable")?;
        let schema = state.cursor_table(cursor)?.clone();
        schema.check_row(row, None)?;
        let (index, _) = state.index_of(cursor)?;
        let id = state.row_at(cursor, index)?.id;
        let key = schema.key_of(row);
        let rows = state.table_rows_mut(cursor)?;
        if rows.iter().any(|r| r.key == key && r.id != id) {
            return Err(ProxyError::Validation(format!(
                "duplicate primary key in {}",
                schema.table_name
            )));
        }
        if let Some(stored) = rows.iter_mut().find(|r| r.id == id) {
            stored.key = key;
            stored.row = row.clone();
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(CursorFlags::default())
    }

    fn delete(&self, cursor: CursorHandle) -> Result<CursorFlags, ProxyError> {
        bump(&self.counters.mutations);
        let mut state = self.state.lock();
        state.require(cursor, |c| c.updateable, "updateable")?;
        let (index, _) = state.index_of(cursor)?;
        state.row_at(cursor, index)?;
        let rows = state.table_rows_mut(cursor)?;
        rows.remove(index as usize);
        let len = rows.len();
        state.set_index(cursor, index)?;
        Ok(position_flags(index, len))
    }

    fn find_key(&self, cursor: CursorHandle, key: &Row) -> Result<GotoResult, ProxyError> {
        let mut state = self.state.lock();
        state.require(cursor, |c| c.searchable, "searchable")?;
        let (index, len) = state.index_of(cursor)?;
        let found = {
            let server_cursor = state.cursor(cursor)?;
            state
                .cursor_rows(server_cursor)
                .binary_search_by(|r| r.key.cmp(key))
                .ok()
        };
        match found {
            Some(idx) => {
                state.set_index(cursor, idx as isize)?;
                Ok(GotoResult {
                    success: true,
                    flags: position_flags(idx as isize, len),
                })
            }
            None => Ok(GotoResult {
                success: false,
                flags: position_flags(index, len),
            }),
        }
    }

    fn find_nearest(&self, cursor: CursorHandle, key: &Row) -> Result<CursorFlags, ProxyError> {
        let mut state = self.state.lock();
        state.require(cursor, |c| c.searchable, "searchable")?;
        let (idx, len) = {
            let server_cursor = state.cursor(cursor)?;
            let rows = state.cursor_rows(server_cursor);
            (rows.partition_point(|r| r.key < *key) as isize, rows.len())
        };
        state.set_index(cursor, idx)?;
        Ok(position_flags(idx, len))
    }

    fn refresh(&self, cursor: CursorHandle, row: &Row) -> Result<GotoResult, ProxyError> {
        let key = {
            let state = self.state.lock();
            state.cursor_table(cursor)?.key_of(row)
        };
        let found = self.find_key(cursor, &key)?;
        if found.success {
            return Ok(found);
        }
        let flags = self.find_nearest(cursor, &key)?;
        Ok(GotoResult {
            success: false,
            flags,
        })
    }

    fn default_row(
        &self,
        cursor: CursorHandle,
        row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError> {
        bump(&self.counters.proposable_calls);
        let state = self.state.lock();
        proposable::default_row(state.cursor_table(cursor)?, row, column)
    }

    fn change(
        &self,
        cursor: CursorHandle,
        _old_row: &Row,
        new_row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError> {
        bump(&self.counters.proposable_calls);
        let state = self.state.lock();
        proposable::change(state.cursor_table(cursor)?, new_row, column)
    }

    fn validate(
        &self,
        cursor: CursorHandle,
        _old_row: Option<&Row>,
        new_row: &Row,
        column: Option<&str>,
    ) -> Result<ProposableResult, ProxyError> {
        bump(&self.counters.proposable_calls);
        let state = self.state.lock();
        proposable::validate(state.cursor_table(cursor)?, new_row, column)
    }

    fn describe_object(&self, name: &str) -> Result<Option<CatalogObject>, ProxyError> {
        bump(&self.counters.describe_calls);
        Ok(self.state.lock().catalog.object(name))
    }

    fn notify_desynchronized(&self, cache_name: &str) -> Result<(), ProxyError> {
        bump(&self.counters.desync_notices);
        if let Some(cache) = self.state.lock().caches.get_mut(cache_name) {
            cache.shipped.clear();
        }
        debug!(cache_name, "client cache reported out of step");
        Ok(())
    }

    fn release_cache(&self, cache_name: &str) -> Result<(), ProxyError> {
        self.state.lock().caches.remove(cache_name);
        Ok(())
    }
}
