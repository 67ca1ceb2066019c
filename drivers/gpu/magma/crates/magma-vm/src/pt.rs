//! # Page-Directory Hierarchy
//!
//! Directory nodes live in an arena addressed by [`TableId`]. Each node
//! records its level, the parent slot pointing at it and one child slot per
//! entry. Every node is backed by a table buffer that is bound into the
//! address space like any other buffer.
//!
//! ```text
//!   Pdb2 ──▶ Pdb1 ──▶ Pdb0 ──▶ Ptb ──▶ page
//!   (root level depends on the VM size)
//! ```

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use magma_core::Handle;

use crate::binding::BindingId;
use crate::buffer::Buffer;

/// Page-table level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Level {
    /// Top directory of a five-level walk
    Pdb2 = 0,
    /// Second directory
    Pdb1 = 1,
    /// Directory pointing at page tables
    Pdb0 = 2,
    /// Page table holding the leaf entries
    Ptb = 3,
}

impl Level {
    /// Level below this one
    pub fn child(self) -> Option<Level> {
        match self {
            Level::Pdb2 => Some(Level::Pdb1),
            Level::Pdb1 => Some(Level::Pdb0),
            Level::Pdb0 => Some(Level::Ptb),
            Level::Ptb => None,
        }
    }
}

/// Marker for directory node handles
pub struct TableMarker;

/// Handle to a directory node
pub type TableId = Handle<TableMarker>;

/// One node of the page-directory tree
#[derive(Debug)]
pub struct PageTable {
    id: TableId,
    level: Level,
    parent: Option<(TableId, u32)>,
    buffer: Arc<Buffer>,
    binding: BindingId,
    children: Vec<Option<TableId>>,
}

impl PageTable {
    /// Node id
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Level of the node
    pub fn level(&self) -> Level {
        self.level
    }

    /// Parent node and the entry in it that points here
    pub fn parent(&self) -> Option<(TableId, u32)> {
        self.parent
    }

    /// Backing buffer
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub(crate) fn binding(&self) -> BindingId {
        self.binding
    }

    pub(crate) fn child(&self, slot: u32) -> Option<TableId> {
        self.children.get(slot as usize).copied().flatten()
    }

    /// True if no entry points at a child
    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }
}

/// Arena of directory nodes
#[derive(Debug, Default)]
pub(crate) struct PtArena {
    nodes: HashMap<TableId, PageTable>,
    next: u64,
    root: Option<TableId>,
}

impl PtArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn root(&self) -> Option<TableId> {
        self.root
    }

    pub(crate) fn get(&self, id: TableId) -> Option<&PageTable> {
        self.nodes.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Add a node; `parent` is `None` only for the root
    pub(crate) fn insert(
        &mut self,
        level: Level,
        entries: u32,
        parent: Option<(TableId, u32)>,
        buffer: Arc<Buffer>,
        binding: BindingId,
    ) -> TableId {
        self.next += 1;
        let id = TableId::new(self.next);
        let children = if level == Level::Ptb {
            Vec::new()
        } else {
            vec![None; entries as usize]
        };

        self.nodes.insert(
            id,
            PageTable {
                id,
                level,
                parent,
                buffer,
                binding,
                children,
            },
        );

        match parent {
            Some((pid, slot)) => {
                if let Some(child) = self
                    .nodes
                    .get_mut(&pid)
                    .and_then(|p| p.children.get_mut(slot as usize))
                {
                    *child = Some(id);
                }
            }
            None => self.root = Some(id),
        }
        id
    }

    /// Unlink `id` and every node below it
    ///
    /// Returns the removed nodes, children before parents.
    pub(crate) fn remove_subtree(&mut self, id: TableId) -> Vec<PageTable> {
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some((pid, slot)) = parent {
            if let Some(child) = self
                .nodes
                .get_mut(&pid)
                .and_then(|p| p.children.get_mut(slot as usize))
            {
                *child = None;
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }

        let mut removed = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                if let Some(pt) = self.nodes.remove(&node) {
                    removed.push(pt);
                }
                continue;
            }
            stack.push((node, true));
            if let Some(pt) = self.nodes.get(&node) {
                stack.extend(pt.children.iter().flatten().map(|&c| (c, false)));
            }
        }
        removed
    }
}
