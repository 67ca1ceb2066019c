//! # Buffer Bindings
//!
//! A binding attaches one buffer to one address space and owns the
//! mappings placed on it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_core::{CompletionSignal, Handle};

use crate::buffer::Buffer;
use crate::mapping::MappingId;
use crate::pt::TableId;

/// Marker for binding handles
pub struct BindingMarker;

/// Handle to a binding
pub type BindingId = Handle<BindingMarker>;

/// Attachment of a buffer to an address space
#[derive(Debug)]
pub(crate) struct Binding {
    /// Bound buffer, `None` for PRT-only bindings
    pub buffer: Option<Arc<Buffer>>,
    /// Directory node, for table bindings
    pub table: Option<TableId>,
    /// Mappings whose entries are written
    pub valids: Vec<MappingId>,
    /// Mappings whose entries are stale
    pub invalids: Vec<MappingId>,
    /// Entries were last written in clear mode
    pub cleared: bool,
    /// Last page-table update touching this binding
    pub last_pt_update: Option<CompletionSignal>,
}

impl Binding {
    pub(crate) fn new(buffer: Option<Arc<Buffer>>) -> Self {
        Self {
            buffer,
            table: None,
            valids: Vec::new(),
            invalids: Vec::new(),
            cleared: false,
            last_pt_update: None,
        }
    }

    /// Detach `mapping` from whichever list holds it
    ///
    /// Returns `Some(true)` if it was applied, `Some(false)` if stale.
    pub(crate) fn take_mapping(&mut self, mapping: MappingId) -> Option<bool> {
        if let Some(pos) = self.valids.iter().position(|&m| m == mapping) {
            self.valids.remove(pos);
            return Some(true);
        }
        if let Some(pos) = self.invalids.iter().position(|&m| m == mapping) {
            self.invalids.remove(pos);
            return Some(false);
        }
        None
    }

    /// Mark every applied mapping stale
    pub(crate) fn invalidate_all(&mut self) {
        let valids = core::mem::take(&mut self.valids);
        self.invalids.extend(valids);
    }
}

/// Read-only view of a binding
#[derive(Debug, Clone)]
pub struct BindingInfo {
    /// Bound buffer
    pub buffer: Option<Arc<Buffer>>,
    /// Mappings with written entries
    pub valid_mappings: usize,
    /// Mappings with stale entries
    pub invalid_mappings: usize,
    /// Entries were last written in clear mode
    pub cleared: bool,
}

impl From<&Binding> for BindingInfo {
    fn from(b: &Binding) -> Self {
        Self {
            buffer: b.buffer.clone(),
            valid_mappings: b.valids.len(),
            invalid_mappings: b.invalids.len(),
            cleared: b.cleared,
        }
    }
}
