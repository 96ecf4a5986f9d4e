//! Reconciliation state for one session.
//!
//! The ordered, newest-first list the view renders. Local optimistic updates,
//! direct-channel events and change-feed events all go through the same two
//! operations, which are idempotent and commute for a given id. The list
//! therefore converges to the same content whichever of the up-to-three
//! notifications for a change arrives first, and however often each arrives.
//!
//! Deleted ids are remembered as tombstones. Ids are never reused, so a late
//! `bookmark-added` for an id whose delete already arrived on the other
//! channel must not bring the row back.
//!
//! A full listing is read at one point in time and lands later. Entries
//! inserted after the listing was requested may be missing from it, and
//! both channels have already delivered them, so [`merge_listing`] keeps
//! them. Callers take a [`ListingMark`] before issuing the listing request.
//!
//! [`merge_listing`]: BookmarkStateTrait::merge_listing

use std::collections::HashSet;

use crate::types::bookmark::Bookmark;
use crate::types::events::BookmarkEvent;

/// Trait defining the reconciliation operations.
pub trait BookmarkStateTrait {
    /// Prepends `bookmark` unless its id is already present or was deleted.
    /// The first observed content for an id wins. Returns whether the list
    /// changed.
    fn insert_if_absent(&mut self, bookmark: Bookmark) -> bool;
    /// Removes the bookmark with `id` if present and tombstones the id.
    /// Returns whether the list changed.
    fn remove_by_id(&mut self, id: &str) -> bool;
    /// Applies an event through the two operations above.
    fn apply(&mut self, event: BookmarkEvent) -> bool;
    /// Position in the insert history, taken before a listing is requested.
    fn mark(&self) -> ListingMark;
    /// Replaces the list with `bookmarks`, keeping entries inserted after
    /// `mark` that the listing does not contain. Tombstoned ids are skipped.
    fn merge_listing(&mut self, mark: ListingMark, bookmarks: Vec<Bookmark>);
    /// Replaces the whole list with a listing nothing has raced.
    fn replace_all(&mut self, bookmarks: Vec<Bookmark>);

    fn snapshot(&self) -> Vec<Bookmark>;
    fn contains(&self, id: &str) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

/// Opaque insert counter value; see [`BookmarkStateTrait::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListingMark(u64);

#[derive(Debug, Clone)]
struct Entry {
    bookmark: Bookmark,
    seq: u64,
}

/// In-memory list, index 0 being the newest entry.
///
/// Tombstones are kept for the life of the state and never pruned: one id
/// per delete seen. Ids are never reused, so this only costs memory.
#[derive(Debug, Clone, Default)]
pub struct BookmarkState {
    items: Vec<Entry>,
    tombstones: HashSet<String>,
    next_seq: u64,
}

impl BookmarkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.items.iter().map(|e| &e.bookmark)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|e| e.bookmark.id == id)
    }
}

impl BookmarkStateTrait for BookmarkState {
    fn insert_if_absent(&mut self, bookmark: Bookmark) -> bool {
        if self.contains(&bookmark.id) || self.tombstones.contains(&bookmark.id) {
            return false;
        }
        self.next_seq += 1;
        self.items.insert(0, Entry { bookmark, seq: self.next_seq });
        true
    }

    fn remove_by_id(&mut self, id: &str) -> bool {
        self.tombstones.insert(id.to_string());
        match self.position(id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    fn apply(&mut self, event: BookmarkEvent) -> bool {
        match event {
            BookmarkEvent::Added(bookmark) => self.insert_if_absent(bookmark),
            BookmarkEvent::Deleted(id) => self.remove_by_id(&id),
        }
    }

    fn mark(&self) -> ListingMark {
        ListingMark(self.next_seq)
    }

    fn merge_listing(&mut self, mark: ListingMark, bookmarks: Vec<Bookmark>) {
        // Inserted after the listing was requested, newest first.
        let mut items: Vec<Entry> = self
            .items
            .iter()
            .filter(|e| e.seq > mark.0 && !bookmarks.iter().any(|b| b.id == e.bookmark.id))
            .cloned()
            .collect();
        // A listing may race a delete we already saw; tombstones still apply.
        for bookmark in bookmarks {
            if self.tombstones.contains(&bookmark.id) || items.iter().any(|e| e.bookmark.id == bookmark.id) {
                continue;
            }
            let seq = self
                .items
                .iter()
                .find(|e| e.bookmark.id == bookmark.id)
                .map_or(0, |e| e.seq);
            items.push(Entry { bookmark, seq });
        }
        self.items = items;
    }

    fn replace_all(&mut self, bookmarks: Vec<Bookmark>) {
        // A listing may race a delete we already saw; tombstones still apply.
        let mut items: Vec<Entry> = Vec::with_capacity(bookmarks.len());
        for bookmark in bookmarks {
            if self.tombstones.contains(&bookmark.id) {
                continue;
            }
            if !items.iter().any(|e| e.bookmark.id == bookmark.id) {
                items.push(Entry { bookmark, seq: 0 });
            }
        }
        self.items = items;
    }

    fn snapshot(&self) -> Vec<Bookmark> {
        self.iter().cloned().collect()
    }

    fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
