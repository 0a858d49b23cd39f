use crate::catalog::types::Row;
use crate::remote::{Bookmark, CursorFlags, Direction, FetchResult};

/// Rows read ahead from the remote cursor, ordered so index 0 is nearest BOF.
///
/// `index` is the logical cursor position: `-1` is the BOF crack and `len`
/// the EOF crack, both only reachable when the window's edge flag says no
/// further row exists. `source_index` is where the remote cursor sits.
#[derive(Debug)]
pub(crate) struct Window {
    rows: Vec<(Row, Bookmark)>,
    pub(crate) index: isize,
    pub(crate) source_index: isize,
    pub(crate) direction: Direction,
    pub(crate) flags: CursorFlags,
}

impl Window {
    pub(crate) fn new() -> Self {
        Self {
            rows: Vec::new(),
            index: -1,
            source_index: -1,
            direction: Direction::Forward,
            flags: CursorFlags::default(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.rows.is_empty()
    }

    pub(crate) fn len(&self) -> isize {
        self.rows.len() as isize
    }

    pub(crate) fn on_row(&self) -> bool {
        self.index >= 0 && self.index < self.len()
    }

    pub(crate) fn current(&self) -> Option<&(Row, Bookmark)> {
        if self.on_row() {
            self.rows.get(self.index as usize)
        } else {
            None
        }
    }

    pub(crate) fn bookmark_at(&self, index: isize) -> Option<Bookmark> {
        if index < 0 {
            return None;
        }
        self.rows.get(index as usize).map(|(_, bookmark)| *bookmark)
    }

    pub(crate) fn position_of(&self, bookmark: Bookmark) -> Option<isize> {
        self.rows
            .iter()
            .position(|(_, b)| *b == bookmark)
            .map(|idx| idx as isize)
    }

    /// Loads a fetch made in `direction` from the current remote row. The
    /// logical position stays on that row, which is the first one fetched.
    pub(crate) fn fill(&mut self, fetched: FetchResult, direction: Direction) {
        let mut rows: Vec<(Row, Bookmark)> =
            fetched.rows.into_iter().zip(fetched.bookmarks).collect();
        let last = rows.len() as isize - 1;
        match direction {
            Direction::Forward => {
                self.index = 0;
                self.source_index = last;
            }
            Direction::Backward => {
                rows.reverse();
                self.index = last;
                self.source_index = 0;
            }
        }
        self.rows = rows;
        self.direction = direction;
        self.flags = fetched.flags;
    }

    /// Empties the window and hands back the bookmark references it held.
    pub(crate) fn clear(&mut self) -> Vec<Bookmark> {
        self.index = -1;
        self.source_index = -1;
        self.flags = CursorFlags::default();
        self.rows.drain(..).map(|(_, bookmark)| bookmark).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Window;
    use crate::catalog::types::{Row, Value};
    use crate::remote::{Bookmark, CursorFlags, Direction, FetchResult};

    fn fetched(ids: &[i64], flags: CursorFlags) -> FetchResult {
        FetchResult {
            rows: ids
                .iter()
                .map(|id| Row::from_values(vec![Value::from(*id)]))
                .collect(),
            bookmarks: ids.iter().map(|id| Bookmark(*id as u64)).collect(),
            flags,
        }
    }

    #[test]
    fn backward_fill_is_stored_bof_first() {
        let mut window = Window::new();
        window.fill(
            fetched(&[5, 4, 3], CursorFlags { bof: false, eof: true }),
            Direction::Backward,
        );
        assert_eq!(window.bookmark_at(0), Some(Bookmark(3)));
        assert_eq!(window.current().map(|(_, b)| *b), Some(Bookmark(5)));
        assert_eq!(window.source_index, 0);
        assert_eq!(window.direction, Direction::Backward);
    }

    #[test]
    fn forward_fill_leaves_remote_on_last_row() {
        let mut window = Window::new();
        window.fill(fetched(&[1, 2], CursorFlags::default()), Direction::Forward);
        assert_eq!(window.index, 0);
        assert_eq!(window.source_index, 1);
        assert_eq!(window.position_of(Bookmark(2)), Some(1));
    }

    #[test]
    fn clear_returns_every_reference() {
        let mut window = Window::new();
        window.fill(fetched(&[1, 2, 3], CursorFlags::default()), Direction::Forward);
        let released = window.clear();
        assert_eq!(released, vec![Bookmark(1), Bookmark(2), Bookmark(3)]);
        assert!(!window.is_active());
        assert!(window.current().is_none());
    }
}
