use crate::error::ProxyError;
use crate::remote::Bookmark;
use std::collections::HashMap;

/// References a cursor holds on server bookmarks.
///
/// Caller references come from `get_bookmark` and are given back through
/// disposal; window pins are taken per buffered row and dropped when the
/// window clears. A bookmark is disposed on the server once both are gone.
#[derive(Debug, Default)]
pub(crate) struct BookmarkTable {
    refs: HashMap<Bookmark, Refs>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Refs {
    caller: usize,
    pinned: usize,
}

impl Refs {
    fn is_free(self) -> bool {
        self.caller == 0 && self.pinned == 0
    }
}

impl BookmarkTable {
    pub(crate) fn add_ref(&mut self, bookmark: Bookmark) {
        self.refs.entry(bookmark).or_default().caller += 1;
    }

    pub(crate) fn pin(&mut self, bookmark: Bookmark) {
        self.refs.entry(bookmark).or_default().pinned += 1;
    }

    /// Whether the caller still owns a reference to `bookmark`.
    pub(crate) fn contains(&self, bookmark: Bookmark) -> bool {
        self.ref_count(bookmark) > 0
    }

    pub(crate) fn ref_count(&self, bookmark: Bookmark) -> usize {
        self.refs.get(&bookmark).map_or(0, |refs| refs.caller)
    }

    /// Drops one caller reference per entry and returns the bookmarks no
    /// longer referenced at all. Every entry must be backed by a caller
    /// reference; nothing is released otherwise.
    pub(crate) fn release(&mut self, bookmarks: &[Bookmark]) -> Result<Vec<Bookmark>, ProxyError> {
        let mut needed: HashMap<Bookmark, usize> = HashMap::new();
        for bookmark in bookmarks {
            *needed.entry(*bookmark).or_insert(0) += 1;
        }
        for (bookmark, count) in &needed {
            if self.ref_count(*bookmark) < *count {
                return Err(ProxyError::InvalidBookmark {
                    bookmark: bookmark.0,
                });
            }
        }
        Ok(self.drop_refs(bookmarks, |refs| refs.caller -= 1))
    }

    /// Drops window pins and returns the bookmarks no longer referenced.
    pub(crate) fn unpin(&mut self, bookmarks: &[Bookmark]) -> Vec<Bookmark> {
        self.drop_refs(bookmarks, |refs| refs.pinned = refs.pinned.saturating_sub(1))
    }

    fn drop_refs(&mut self, bookmarks: &[Bookmark], step: impl Fn(&mut Refs)) -> Vec<Bookmark> {
        let mut freed = Vec::new();
        for bookmark in bookmarks {
            if let Some(refs) = self.refs.get_mut(bookmark) {
                step(refs);
                if refs.is_free() {
                    self.refs.remove(bookmark);
                    freed.push(*bookmark);
                }
            }
        }
        freed
    }

    pub(crate) fn drain(&mut self) -> Vec<Bookmark> {
        let mut all: Vec<Bookmark> = self.refs.drain().map(|(bookmark, _)| bookmark).collect();
        all.sort();
        all
    }

    /// Distinct bookmarks referenced by the caller or the window.
    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }
}
