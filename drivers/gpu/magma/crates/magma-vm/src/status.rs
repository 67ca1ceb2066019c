//! # Binding State Machine
//!
//! Every binding of an address space sits in exactly one of six ordered
//! lists. The lists are modelled as one map from binding to state plus an
//! ordered set per state, so a binding cannot be in two lists at once.
//!
//! ```text
//!            attach                     invalidate (own reservation)
//!   ───────────────────▶  Idle  ◀──────────────────────────┐
//!                          │  ▲                             │
//!          evicted         ▼  │ bo_update                   │
//!   Evicted ◀──────────── any ───────▶ Moved ───────────────┤
//!      │ validate_pt_bos                                    │
//!      ├──────────▶ Moved (data)                            │
//!      └──────────▶ Relocated (tables) ──update_pdes──▶ Idle
//!
//!   Invalidated (foreign reservation) ──bo_update──▶ Done
//! ```
//!
//! Each binding also carries a `moved` bit: set when backing memory moved
//! and cleared once the binding returns to `Idle` or its mappings were
//! rewritten.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::binding::BindingId;

/// State of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingStatus {
    /// Entries are in sync
    Idle,
    /// Backing memory left its preferred placement
    Evicted,
    /// Directory whose parent entry is stale
    Relocated,
    /// Own-reservation buffer whose mappings are stale
    Moved,
    /// Foreign-reservation buffer whose mappings are stale
    Invalidated,
    /// Foreign-reservation buffer whose mappings were rewritten
    Done,
}

impl BindingStatus {
    /// Every state, in list order
    pub const ALL: [BindingStatus; 6] = [
        BindingStatus::Idle,
        BindingStatus::Evicted,
        BindingStatus::Relocated,
        BindingStatus::Moved,
        BindingStatus::Invalidated,
        BindingStatus::Done,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: BindingStatus,
    order: i64,
    moved: bool,
}

/// The six state lists of one address space
#[derive(Debug, Default)]
pub(crate) struct StatusLists {
    entries: HashMap<BindingId, Entry>,
    lists: [BTreeMap<i64, BindingId>; 6],
    head: i64,
    tail: i64,
}

impl StatusLists {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn unlink(&mut self, id: BindingId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.lists[entry.status.index()].remove(&entry.order);
        Some(entry)
    }

    fn link(&mut self, id: BindingId, status: BindingStatus, moved: bool, front: bool) {
        let order = if front {
            self.head -= 1;
            self.head
        } else {
            self.tail += 1;
            self.tail
        };
        self.lists[status.index()].insert(order, id);
        self.entries.insert(id, Entry { status, order, moved });
    }

    /// Add a new binding, or move an existing one, to the front of a list
    pub(crate) fn move_front(&mut self, id: BindingId, status: BindingStatus) {
        let moved = self.unlink(id).map_or(false, |e| e.moved);
        self.link(id, status, moved, true);
    }

    /// Add a new binding, or move an existing one, to the back of a list
    pub(crate) fn move_back(&mut self, id: BindingId, status: BindingStatus) {
        let moved = self.unlink(id).map_or(false, |e| e.moved);
        self.link(id, status, moved, false);
    }

    /// Move `id` to `to` only if it is still in `from`
    pub(crate) fn move_if(&mut self, id: BindingId, from: BindingStatus, to: BindingStatus) -> bool {
        if self.status(id) != Some(from) {
            return false;
        }
        self.move_front(id, to);
        true
    }

    /// Drop a binding from whichever list holds it
    pub(crate) fn remove(&mut self, id: BindingId) -> Option<BindingStatus> {
        self.unlink(id).map(|e| e.status)
    }

    pub(crate) fn status(&self, id: BindingId) -> Option<BindingStatus> {
        self.entries.get(&id).map(|e| e.status)
    }

    pub(crate) fn moved(&self, id: BindingId) -> bool {
        self.entries.get(&id).map_or(false, |e| e.moved)
    }

    pub(crate) fn set_moved(&mut self, id: BindingId, moved: bool) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.moved = moved;
        }
    }

    /// Front of a list
    pub(crate) fn first(&self, status: BindingStatus) -> Option<BindingId> {
        self.lists[status.index()].values().next().copied()
    }

    /// Every member of a list, front to back
    pub(crate) fn snapshot(&self, status: BindingStatus) -> Vec<BindingId> {
        self.lists[status.index()].values().copied().collect()
    }

    pub(crate) fn len(&self, status: BindingStatus) -> usize {
        self.lists[status.index()].len()
    }

    pub(crate) fn is_empty(&self, status: BindingStatus) -> bool {
        self.lists[status.index()].is_empty()
    }

    /// Number of tracked bindings
    pub(crate) fn total(&self) -> usize {
        self.entries.len()
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Backing memory left its preferred placement
    ///
    /// Table bindings go to the front so directories are validated first.
    pub(crate) fn evicted(&mut self, id: BindingId, is_table: bool) {
        if is_table {
            self.move_front(id, BindingStatus::Evicted);
        } else {
            self.move_back(id, BindingStatus::Evicted);
        }
        self.set_moved(id, true);
    }

    /// Directory entry in the parent is stale; roots have no parent
    pub(crate) fn relocated(&mut self, id: BindingId, has_parent: bool) {
        if has_parent {
            self.move_front(id, BindingStatus::Relocated);
        } else {
            self.idle(id);
        }
    }

    pub(crate) fn moved_state(&mut self, id: BindingId) {
        self.move_front(id, BindingStatus::Moved);
    }

    pub(crate) fn invalidated(&mut self, id: BindingId) {
        self.move_front(id, BindingStatus::Invalidated);
    }

    pub(crate) fn idle(&mut self, id: BindingId) {
        self.move_front(id, BindingStatus::Idle);
        self.set_moved(id, false);
    }

    pub(crate) fn done(&mut self, id: BindingId) {
        self.move_front(id, BindingStatus::Done);
    }
}
