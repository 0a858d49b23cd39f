//! Read-ahead buffering over a remote cursor.
//!
//! A [`BufferedCursor`] answers navigation from a window of rows fetched in
//! one round trip and only goes back to the server at the window's edges.
//! Buffering needs bookmarks to re-synchronize the remote position, so
//! cursors that are not bookmarkable (or a window size of one) run every call
//! straight through. Either way the caller observes the same rows and the
//! same BOF/EOF transitions.

mod bookmarks;
pub(crate) mod proposable;
mod window;

use crate::catalog::schema::TableSchema;
use crate::catalog::types::Row;
use crate::error::ProxyError;
use crate::remote::{
    Bookmark, CursorCapabilities, CursorDescriptor, CursorFlags, CursorHandle, Direction,
    ProposableOp, ProposableResult, ProposableSupport, RemoteEngine,
};
use crate::session::resources::{RemoteResource, ResourceTable};
use bookmarks::BookmarkTable;
use std::sync::Arc;
use tracing::{debug, warn};
use window::Window;

pub struct BufferedCursor {
    remote: Arc<dyn RemoteEngine>,
    resources: Arc<ResourceTable>,
    handle: CursorHandle,
    capabilities: CursorCapabilities,
    window_size: usize,
    buffered: bool,
    window: Window,
    bookmarks: BookmarkTable,
    remote_flags: CursorFlags,
    table: Option<Arc<TableSchema>>,
    proposables: ProposableSupport,
    closed: bool,
}

impl BufferedCursor {
    pub(crate) fn new(
        remote: Arc<dyn RemoteEngine>,
        resources: Arc<ResourceTable>,
        descriptor: CursorDescriptor,
        table: Option<Arc<TableSchema>>,
        proposables: ProposableSupport,
        window_size: usize,
    ) -> Self {
        resources.register(RemoteResource::Cursor(descriptor.handle));
        let buffered = window_size > 1 && descriptor.capabilities.bookmarkable;
        Self {
            remote,
            resources,
            handle: descriptor.handle,
            capabilities: descriptor.capabilities,
            window_size,
            buffered,
            window: Window::new(),
            bookmarks: BookmarkTable::default(),
            remote_flags: descriptor.flags,
            table,
            proposables,
            closed: false,
        }
    }

    pub fn handle(&self) -> CursorHandle {
        self.handle
    }

    pub fn capabilities(&self) -> CursorCapabilities {
        self.capabilities
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Rows currently held in the read-ahead window.
    pub fn buffered_rows(&self) -> usize {
        self.window.len() as usize
    }

    /// Direction of the next implicit window fill.
    pub fn buffer_direction(&self) -> Direction {
        self.window.direction
    }

    pub fn held_bookmarks(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn bof(&self) -> bool {
        if self.window.is_active() {
            self.window.index < 0
        } else {
            self.remote_flags.bof
        }
    }

    pub fn eof(&self) -> bool {
        if self.window.is_active() {
            self.window.index >= self.window.len()
        } else {
            self.remote_flags.eof
        }
    }

    /// Positions on the BOF crack.
    pub fn first(&mut self) -> Result<(), ProxyError> {
        self.require(self.capabilities.navigable, "navigable")?;
        self.clear_window()?;
        self.remote_flags = self.remote.first(self.handle)?;
        self.window.direction = Direction::Forward;
        Ok(())
    }

    /// Positions on the EOF crack.
    pub fn last(&mut self) -> Result<(), ProxyError> {
        self.require(self.capabilities.back_navigable, "back_navigable")?;
        self.clear_window()?;
        self.remote_flags = self.remote.last(self.handle)?;
        self.window.direction = Direction::Backward;
        Ok(())
    }

    /// Returns whether the cursor is now on a row.
    pub fn next(&mut self) -> Result<bool, ProxyError> {
        self.require(self.capabilities.navigable, "navigable")?;
        if self.window.is_active() {
            let len = self.window.len();
            if self.window.index + 1 < len {
                self.window.index += 1;
                return Ok(true);
            }
            if self.window.index >= len {
                return Ok(false);
            }
            if self.window.flags.eof {
                self.window.index = len;
                return Ok(false);
            }
            self.sync_remote()?;
            self.clear_window()?;
            self.window.direction = Direction::Forward;
        }
        let moved = self.remote.move_by(self.handle, 1)?;
        self.remote_flags = moved.flags;
        Ok(!moved.flags.eof)
    }

    /// Returns whether the cursor is now on a row.
    pub fn prior(&mut self) -> Result<bool, ProxyError> {
        self.require(self.capabilities.back_navigable, "back_navigable")?;
        if self.window.is_active() {
            if self.window.index > 0 {
                self.window.index -= 1;
                return Ok(true);
            }
            if self.window.index < 0 {
                return Ok(false);
            }
            if self.window.flags.bof {
                self.window.index = -1;
                return Ok(false);
            }
            self.sync_remote()?;
            self.clear_window()?;
            self.window.direction = Direction::Backward;
        }
        let moved = self.remote.move_by(self.handle, -1)?;
        self.remote_flags = moved.flags;
        Ok(!moved.flags.bof)
    }

    pub fn select(&mut self) -> Result<Row, ProxyError> {
        if !self.buffered {
            return self.remote.select(self.handle);
        }
        self.ensure_current()?;
        self.window
            .current()
            .map(|(row, _)| row.clone())
            .ok_or(ProxyError::NoCurrentRow)
    }

    /// Returns a bookmark for the current row; the caller owns one reference.
    pub fn get_bookmark(&mut self) -> Result<Bookmark, ProxyError> {
        self.require(self.capabilities.bookmarkable, "bookmarkable")?;
        let bookmark = if self.buffered {
            self.ensure_current()?;
            self.window
                .current()
                .map(|(_, bookmark)| *bookmark)
                .ok_or(ProxyError::NoCurrentRow)?
        } else {
            self.remote.get_bookmark(self.handle)?
        };
        self.bookmarks.add_ref(bookmark);
        Ok(bookmark)
    }

    pub fn goto_bookmark(&mut self, bookmark: Bookmark, forward: bool) -> Result<bool, ProxyError> {
        self.require(self.capabilities.bookmarkable, "bookmarkable")?;
        if !self.bookmarks.contains(bookmark) {
            return Err(ProxyError::InvalidBookmark {
                bookmark: bookmark.0,
            });
        }
        if let Some(index) = self.window.position_of(bookmark) {
            self.window.index = index;
            return Ok(true);
        }
        self.clear_window()?;
        let result = self.remote.goto_bookmark(self.handle, bookmark, forward)?;
        self.remote_flags = result.flags;
        Ok(result.success)
    }

    pub fn dispose_bookmark(&mut self, bookmark: Bookmark) -> Result<(), ProxyError> {
        self.dispose_bookmarks(&[bookmark])
    }

    pub fn dispose_bookmarks(&mut self, bookmarks: &[Bookmark]) -> Result<(), ProxyError> {
        self.require(self.capabilities.bookmarkable, "bookmarkable")?;
        let zeroed = self.bookmarks.release(bookmarks)?;
        if !zeroed.is_empty() {
            self.remote.dispose_bookmarks(self.handle, &zeroed)?;
        }
        Ok(())
    }

    /// On success the cursor is on the matching row; on failure nothing moves.
    pub fn find_key(&mut self, key: &Row) -> Result<bool, ProxyError> {
        self.require(self.capabilities.searchable, "searchable")?;
        let result = self.remote.find_key(self.handle, key)?;
        if result.success {
            self.reposition(result.flags)?;
        }
        Ok(result.success)
    }

    pub fn find_nearest(&mut self, key: &Row) -> Result<(), ProxyError> {
        self.require(self.capabilities.searchable, "searchable")?;
        let flags = self.remote.find_nearest(self.handle, key)?;
        self.reposition(flags)
    }

    /// Re-reads the row with `row`'s key, landing on its nearest neighbour if
    /// it no longer exists. Returns whether the exact row was found.
    pub fn refresh(&mut self, row: &Row) -> Result<bool, ProxyError> {
        self.require(self.capabilities.searchable, "searchable")?;
        let result = self.remote.refresh(self.handle, row)?;
        self.reposition(result.flags)?;
        Ok(result.success)
    }

    pub fn insert(&mut self, row: &Row) -> Result<(), ProxyError> {
        self.require(self.capabilities.updateable, "updateable")?;
        let flags = self.remote.insert(self.handle, row)?;
        self.reposition(flags)
    }

    pub fn update(&mut self, row: &Row) -> Result<(), ProxyError> {
        self.require(self.capabilities.updateable, "updateable")?;
        self.sync_remote()?;
        let flags = self.remote.update(self.handle, row)?;
        self.reposition(flags)
    }

    pub fn delete(&mut self) -> Result<(), ProxyError> {
        self.require(self.capabilities.updateable, "updateable")?;
        self.sync_remote()?;
        let flags = self.remote.delete(self.handle)?;
        self.reposition(flags)
    }

    /// Fills defaults into `row`. Returns whether it changed.
    pub fn default_row(&mut self, row: &mut Row, column: Option<&str>) -> Result<bool, ProxyError> {
        let result = match self.local_table(ProposableOp::Default, column) {
            Some(schema) => proposable::default_row(&schema, row, column)?,
            None => self.remote.default_row(self.handle, row, column)?,
        };
        Ok(Self::take_proposal(row, result))
    }

    pub fn change(
        &mut self,
        old_row: &Row,
        new_row: &mut Row,
        column: Option<&str>,
    ) -> Result<bool, ProxyError> {
        let result = match self.local_table(ProposableOp::Change, column) {
            Some(schema) => proposable::change(&schema, new_row, column)?,
            None => self.remote.change(self.handle, old_row, new_row, column)?,
        };
        Ok(Self::take_proposal(new_row, result))
    }

    pub fn validate(
        &mut self,
        old_row: Option<&Row>,
        new_row: &mut Row,
        column: Option<&str>,
    ) -> Result<bool, ProxyError> {
        let result = match self.local_table(ProposableOp::Validate, column) {
            Some(schema) => proposable::validate(&schema, new_row, column)?,
            None => self.remote.validate(self.handle, old_row, new_row, column)?,
        };
        Ok(Self::take_proposal(new_row, result))
    }

    /// Releases every held bookmark, then the remote cursor.
    pub fn close(mut self) -> Result<(), ProxyError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), ProxyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.window.clear();
        let held = self.bookmarks.drain();
        if !self.resources.release(RemoteResource::Cursor(self.handle)) {
            return Ok(());
        }
        let disposed = if held.is_empty() {
            Ok(())
        } else {
            self.remote.dispose_bookmarks(self.handle, &held)
        };
        let closed = self.remote.close_cursor(self.handle);
        disposed.and(closed)
    }

    fn require(&self, supported: bool, capability: &'static str) -> Result<(), ProxyError> {
        if supported {
            Ok(())
        } else {
            Err(ProxyError::CapabilityNotSupported { capability })
        }
    }

    fn local_table(&self, op: ProposableOp, column: Option<&str>) -> Option<Arc<TableSchema>> {
        if self.proposables.is_local(op, column) {
            self.table.clone()
        } else {
            None
        }
    }

    fn take_proposal(row: &mut Row, result: ProposableResult) -> bool {
        *row = result.row;
        result.changed
    }

    /// Makes sure the window holds the current row, fetching if needed.
    fn ensure_current(&mut self) -> Result<(), ProxyError> {
        if self.window.is_active() {
            return if self.window.on_row() {
                Ok(())
            } else {
                Err(ProxyError::NoCurrentRow)
            };
        }
        if self.remote_flags.bof || self.remote_flags.eof {
            return Err(ProxyError::NoCurrentRow);
        }
        let direction = self.window.direction;
        let fetched = self.remote.fetch(self.handle, self.window_size, direction)?;
        if fetched.rows.len() != fetched.bookmarks.len() {
            return Err(ProxyError::CursorSync {
                message: format!(
                    "fetch returned {} rows but {} bookmarks",
                    fetched.rows.len(),
                    fetched.bookmarks.len()
                ),
            });
        }
        if fetched.rows.is_empty() {
            return Err(ProxyError::NoCurrentRow);
        }
        for bookmark in &fetched.bookmarks {
            self.bookmarks.pin(*bookmark);
        }
        debug!(
            cursor = self.handle.0,
            rows = fetched.rows.len(),
            ?direction,
            "filled cursor window"
        );
        self.window.fill(fetched, direction);
        self.remote_flags = CursorFlags::default();
        Ok(())
    }

    /// Moves the remote cursor to the logical position exposed to the caller.
    fn sync_remote(&mut self) -> Result<(), ProxyError> {
        if !self.window.is_active() || self.window.index == self.window.source_index {
            return Ok(());
        }
        let index = self.window.index;
        if index < 0 {
            self.remote_flags = self.remote.first(self.handle)?;
        } else if index >= self.window.len() {
            self.remote_flags = self.remote.last(self.handle)?;
        } else {
            let Some(bookmark) = self.window.bookmark_at(index) else {
                return Err(ProxyError::NoCurrentRow);
            };
            let result = self.remote.goto_bookmark(self.handle, bookmark, true)?;
            if !result.success {
                return Err(ProxyError::CursorSync {
                    message: format!("remote cursor lost buffered row {bookmark}"),
                });
            }
            self.remote_flags = result.flags;
        }
        self.window.source_index = index;
        Ok(())
    }

    /// The remote moved on its own: drop the window and read backwards next.
    fn reposition(&mut self, flags: CursorFlags) -> Result<(), ProxyError> {
        self.clear_window()?;
        self.window.direction = Direction::Backward;
        self.remote_flags = flags;
        Ok(())
    }

    fn clear_window(&mut self) -> Result<(), ProxyError> {
        let released = self.window.clear();
        if released.is_empty() {
            return Ok(());
        }
        let zeroed = self.bookmarks.unpin(&released);
        if !zeroed.is_empty() {
            self.remote.dispose_bookmarks(self.handle, &zeroed)?;
        }
        Ok(())
    }
}

impl Drop for BufferedCursor {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            warn!(cursor = self.handle.0, error = %err, "failed to release remote cursor");
        }
    }
}
