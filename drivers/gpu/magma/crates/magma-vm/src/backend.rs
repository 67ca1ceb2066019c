//! # Update Backend
//!
//! Contract of the component that actually writes page-table entries.
//!
//! Every batch follows the same protocol:
//!
//! ```text
//!   prepare(sync) ─▶ update(table, first, addr, count, incr, flags)* ─▶ commit()
//! ```
//!
//! A CPU backend writes the tables directly and returns a retired signal
//! from `commit`; a command-stream backend records the writes and returns
//! the signal of the submitted job.

use magma_core::{CompletionSignal, Reservation, Result};

use crate::mapping::PteFlags;
use crate::pt::PageTable;
use crate::vm::VmId;

/// What in-flight work an update must order against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only the explicitly passed reservation
    Explicit,
    /// Everything issued by the same owner on the reservation
    EqOwner,
}

/// Per-batch parameters shared by every call of one update
#[derive(Debug, Clone)]
pub struct UpdateParams<'a> {
    /// Address space being updated
    pub vm: VmId,
    /// Submit on the immediate queue, used by fault repair
    pub immediate: bool,
    /// Caller does not hold the root reservation
    pub unlocked: bool,
    /// Scatter list to resolve addresses through, if any
    pub pages_addr: Option<&'a [u64]>,
    /// CPU page shift, needed to resolve `pages_addr`
    pub cpu_page_shift: u32,
    /// A directory node was released by this batch
    pub table_freed: bool,
}

impl<'a> UpdateParams<'a> {
    /// Parameters for a locked, delayed update
    pub fn new(vm: VmId, cpu_page_shift: u32) -> Self {
        Self {
            vm,
            immediate: false,
            unlocked: false,
            pages_addr: None,
            cpu_page_shift,
            table_freed: false,
        }
    }
}

/// Page-table writer
pub trait UpdateBackend: Send {
    /// Make a directory node accessible to the writer
    fn map_table(&mut self, table: &PageTable) -> Result<()>;

    /// Start a batch
    fn prepare(&mut self, params: &UpdateParams<'_>, resv: Option<&Reservation>, sync: SyncMode) -> Result<()>;

    /// Write `count` entries of `table` starting at `first`
    ///
    /// Entry `i` receives `addr + i * incr` with `flags`. When
    /// `params.pages_addr` is set, addresses are offsets to resolve with
    /// [`crate::cursor::map_gart`].
    fn update(
        &mut self,
        params: &UpdateParams<'_>,
        table: &PageTable,
        first: u32,
        addr: u64,
        count: u32,
        incr: u64,
        flags: PteFlags,
    ) -> Result<()>;

    /// Submit the batch
    fn commit(&mut self, params: &UpdateParams<'_>) -> Result<CompletionSignal>;
}
