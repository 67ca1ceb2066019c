//! # GPU Address Space
//!
//! One [`GpuVm`] per client context. It owns the page-directory tree, the
//! interval index of mappings, the binding state lists and the list of
//! freed mappings waiting for their entries to be cleared.
//!
//! Every mutation runs under [`VmGuard`], which holds the root reservation
//! and the address-space state together:
//!
//! ```text
//!   vm.reserve() ─▶ VmGuard ─┬─ bo_add / bo_map / bo_unmap / clear_mappings
//!                            ├─ validate_pt_bos ─▶ update_pdes
//!                            └─ handle_moved ─▶ clear_freed
//! ```
//!
//! The state lists, the eviction flag and the TLB sequence have their own
//! locks so evictors and the submission path can read them without the
//! reservation.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use hashbrown::HashMap;
use magma_core::{
    CompletionSignal, Error, FenceUsage, GpuAddr, Handle, Reservation, ReservationGuard, Result,
    GPU_PAGE_SHIFT,
};

use crate::backend::UpdateBackend;
use crate::binding::{Binding, BindingId, BindingInfo};
use crate::buffer::{Buffer, BufferDesc, BufferKind, MemDomains};
use crate::config::{UpdateMode, VmGeometry};
use crate::device::DeviceClock;
use crate::interval::IntervalIndex;
use crate::manager::VmManager;
use crate::mapping::{Mapping, MappingId, PteFlags};
use crate::pt::PtArena;
use crate::status::{BindingStatus, StatusLists};
use crate::tlb::TlbSequence;

/// Marker for address-space handles
pub struct VmMarker;

/// Handle to an address space
pub type VmId = Handle<VmMarker>;

/// Process owning an address space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInfo {
    /// Thread id
    pub pid: u32,
    /// Thread group id
    pub tgid: u32,
    /// Process name
    pub process_name: String,
    /// Thread name
    pub task_name: String,
}

// =============================================================================
// STATE
// =============================================================================

/// Address-space state guarded by the root reservation
pub(crate) struct VmState {
    pub backend: Box<dyn UpdateBackend>,
    pub update_mode: UpdateMode,
    pub index: IntervalIndex<MappingId>,
    pub mappings: HashMap<MappingId, Mapping>,
    pub bindings: HashMap<BindingId, Binding>,
    pub freed: VecDeque<MappingId>,
    pub tables: PtArena,
    pub last_update: Option<CompletionSignal>,
    pub pte_support_ats: bool,
    next_id: u64,
}

impl VmState {
    fn new(backend: Box<dyn UpdateBackend>, update_mode: UpdateMode) -> Self {
        Self {
            backend,
            update_mode,
            index: IntervalIndex::new(),
            mappings: HashMap::new(),
            bindings: HashMap::new(),
            freed: VecDeque::new(),
            tables: PtArena::new(),
            last_update: None,
            pte_support_ats: false,
            next_id: 0,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// Per-process GPU virtual address space
pub struct GpuVm {
    id: VmId,
    this: Weak<GpuVm>,
    pub(crate) manager: Arc<VmManager>,
    pub(crate) root_resv: Arc<Reservation>,
    pub(crate) status: spin::Mutex<StatusLists>,
    pub(crate) evicting: spin::Mutex<bool>,
    pub(crate) tlb: TlbSequence,
    pub(crate) last_unlocked: spin::Mutex<CompletionSignal>,
    pd_addr: AtomicU64,
    pasid: AtomicU32,
    compute: AtomicBool,
    task: spin::Mutex<TaskInfo>,
    pub(crate) state: spin::Mutex<VmState>,
}

impl GpuVm {
    /// Build an address space and its root directory
    pub(crate) fn create(manager: &Arc<VmManager>, id: VmId) -> Result<Arc<Self>> {
        let mode = manager.config().graphics_update;
        let backend = manager.device().update_backend(mode);

        let vm = Arc::new_cyclic(|this| GpuVm {
            id,
            this: this.clone(),
            manager: manager.clone(),
            root_resv: Arc::new(Reservation::new()),
            status: spin::Mutex::new(StatusLists::new()),
            evicting: spin::Mutex::new(false),
            tlb: TlbSequence::new(),
            last_unlocked: spin::Mutex::new(CompletionSignal::signaled()),
            pd_addr: AtomicU64::new(0),
            pasid: AtomicU32::new(0),
            compute: AtomicBool::new(false),
            task: spin::Mutex::new(TaskInfo::default()),
            state: spin::Mutex::new(VmState::new(backend, mode)),
        });

        vm.reserve().create_root()?;
        log::debug!("{:?}: created, root at {:#x}", id, vm.pd_addr());
        Ok(vm)
    }

    /// Address-space id
    pub fn id(&self) -> VmId {
        self.id
    }

    pub(crate) fn weak(&self) -> Weak<GpuVm> {
        self.this.clone()
    }

    /// Owning manager
    pub fn manager(&self) -> &Arc<VmManager> {
        &self.manager
    }

    /// Root reservation; buffers sharing it are private to this space
    pub fn root_resv(&self) -> &Arc<Reservation> {
        &self.root_resv
    }

    /// Address of the root directory
    pub fn pd_addr(&self) -> u64 {
        self.pd_addr.load(Ordering::Acquire)
    }

    /// Process address-space id used for fault routing, 0 if none
    pub fn pasid(&self) -> u32 {
        self.pasid.load(Ordering::Acquire)
    }

    pub(crate) fn store_pasid(&self, pasid: u32) {
        self.pasid.store(pasid, Ordering::Release);
    }

    /// Context uses compute-style translation
    pub fn is_compute(&self) -> bool {
        self.compute.load(Ordering::Acquire)
    }

    /// Lock the root reservation and the state
    pub fn reserve(&self) -> VmGuard<'_> {
        let resv = self.root_resv.lock();
        let state = self.state.lock();
        VmGuard {
            vm: self,
            state,
            _resv: resv,
        }
    }

    /// Lock without waiting; [`Error::Busy`] if contended
    pub fn try_reserve(&self) -> Result<VmGuard<'_>> {
        let resv = self.root_resv.try_lock().ok_or(Error::Busy)?;
        let state = self.state.try_lock().ok_or(Error::Busy)?;
        Ok(VmGuard {
            vm: self,
            state,
            _resv: resv,
        })
    }

    /// True if command submission may proceed
    ///
    /// No binding waits for validation and no eviction is in progress.
    pub fn ready(&self) -> bool {
        let evicting = self.evicting.lock();
        let empty = self.status.lock().is_empty(BindingStatus::Evicted);
        !*evicting && empty
    }

    /// True while an evictor owns the address space
    pub fn is_evicting(&self) -> bool {
        *self.evicting.lock()
    }

    /// Current TLB generation
    pub fn tlb_seq(&self) -> u64 {
        self.tlb.current()
    }

    /// Signal of the last update that requested a TLB flush
    pub fn last_tlb_flush(&self) -> CompletionSignal {
        self.tlb.last_flush()
    }

    /// Signal of the last update done without the root reservation
    pub fn last_unlocked(&self) -> CompletionSignal {
        self.last_unlocked.lock().clone()
    }

    /// State of a binding
    pub fn binding_status(&self, binding: BindingId) -> Option<BindingStatus> {
        self.status.lock().status(binding)
    }

    /// Number of bindings in a state
    pub fn status_len(&self, status: BindingStatus) -> usize {
        self.status.lock().len(status)
    }

    /// Number of bindings, directory nodes included
    pub fn binding_count(&self) -> usize {
        self.status.lock().total()
    }

    /// Record the owning process
    pub fn set_task_info(&self, info: TaskInfo) {
        *self.task.lock() = info;
    }

    /// Owning process
    pub fn task_info(&self) -> TaskInfo {
        self.task.lock().clone()
    }

    /// Wait until every page-table update of this space retired
    ///
    /// Returns the remaining budget, or [`Error::Timeout`].
    pub fn wait_idle(&self, timeout_ns: u64) -> Result<u64> {
        let clock = DeviceClock(&**self.manager.device());
        let remaining = self
            .root_resv
            .wait_timeout(FenceUsage::Bookkeep, &clock, timeout_ns)?;
        self.last_unlocked().wait_timeout(&clock, remaining)
    }

    /// Leave compute mode and drop the PASID
    pub fn release_compute(&self) {
        if let Err(e) = self.manager.set_pasid(self, 0) {
            log::warn!("{:?}: failed to drop pasid: {}", self.id, e);
        }
        self.compute.store(false, Ordering::Release);
    }

    /// Release a detached mapping once `fence` retires
    pub(crate) fn free_mapping(&self, mapping: &Mapping, fence: Option<&CompletionSignal>) {
        if mapping.is_prt() {
            self.manager.prt().put_after(fence);
        }
    }

    /// Queue a binding of a per-VM buffer for its next update
    pub(crate) fn mark_per_vm_moved(&self, buffer: Option<&Arc<Buffer>>, binding: BindingId) {
        let Some(bo) = buffer else { return };
        let mut status = self.status.lock();
        if bo.shares_reservation(&self.root_resv) && !status.moved(binding) {
            status.moved_state(binding);
        }
    }

    /// Tear the address space down
    ///
    /// Waits for outstanding updates, releases every mapping and binding
    /// and frees the directory tree.
    pub fn fini(&self) {
        if let Err(e) = self.manager.set_pasid(self, 0) {
            log::warn!("{:?}: failed to drop pasid: {}", self.id, e);
        }

        self.last_unlocked().wait();
        self.tlb.last_flush().wait();

        self.reserve().teardown();
        self.manager.vmids().release(self.id);
        log::debug!("{:?}: destroyed", self.id);
    }
}

impl core::fmt::Debug for GpuVm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuVm")
            .field("id", &self.id)
            .field("pasid", &self.pasid())
            .field("compute", &self.is_compute())
            .field("tlb_seq", &self.tlb_seq())
            .finish()
    }
}

// =============================================================================
// RESERVED ACCESS
// =============================================================================

/// Exclusive access to an address space
///
/// Holds the root reservation for its whole lifetime.
pub struct VmGuard<'a> {
    pub(crate) vm: &'a GpuVm,
    pub(crate) state: spin::MutexGuard<'a, VmState>,
    _resv: ReservationGuard<'a>,
}

impl<'a> VmGuard<'a> {
    /// The guarded address space
    pub fn vm(&self) -> &'a GpuVm {
        self.vm
    }

    pub(crate) fn geometry(&self) -> VmGeometry {
        *self.vm.manager.geometry()
    }

    /// Create, bind and clear the root directory
    fn create_root(&mut self) -> Result<()> {
        let vm = self.vm;
        let geometry = self.geometry();
        let level = geometry.root_level;
        let size = geometry.table_bytes(level);

        let residency = vm.manager.device().table_resource(size)?;
        let buffer = Buffer::new(
            BufferDesc {
                size,
                kind: BufferKind::Table,
                preferred: MemDomains::VRAM,
                encrypted: false,
                residency,
            },
            vm.root_resv.clone(),
        );

        let binding = self.attach(Some(buffer.clone()), false);
        let root = self.state.tables.insert(
            level,
            geometry.num_entries(level),
            None,
            buffer.clone(),
            binding,
        );
        if let Some(b) = self.state.bindings.get_mut(&binding) {
            b.table = Some(root);
        }

        let st = &mut *self.state;
        let node = st.tables.get(root).ok_or(Error::NotFound)?;
        st.backend.map_table(node)?;
        self.clear_table(root)?;

        let base = buffer
            .residency()
            .base_address(vm.manager.device().vram_base_offset())
            .unwrap_or(0);
        vm.pd_addr.store(base, Ordering::Release);
        Ok(())
    }

    /// Create a binding and put it on its initial list
    pub(crate) fn attach(&mut self, buffer: Option<Arc<Buffer>>, has_parent: bool) -> BindingId {
        let vm = self.vm;
        let id = BindingId::new(self.state.next_id());
        self.state.bindings.insert(id, Binding::new(buffer.clone()));

        if let Some(bo) = &buffer {
            vm.manager.link(bo.id(), vm, id, has_parent);
        }

        let mut status = vm.status.lock();
        match &buffer {
            Some(bo) if bo.shares_reservation(&vm.root_resv) => {
                let is_table = bo.kind() == BufferKind::Table;
                if is_table && has_parent {
                    status.relocated(id, true);
                } else {
                    status.idle(id);
                }
                if !bo.in_preferred_domain() {
                    status.evicted(id, is_table);
                }
            }
            _ => status.idle(id),
        }
        id
    }

    // =========================================================================
    // BINDINGS
    // =========================================================================

    /// Attach a buffer to this address space
    ///
    /// `None` creates a binding for PRT-only mappings.
    pub fn bo_add(&mut self, buffer: Option<Arc<Buffer>>) -> BindingId {
        let id = self.attach(buffer, false);
        log::debug!("{:?}: added {:?}", self.vm.id, id);
        id
    }

    /// Binding of `buffer` in this address space
    pub fn bo_find(&self, buffer: &Buffer) -> Option<BindingId> {
        self.vm.manager.find_binding(buffer.id(), self.vm.id)
    }

    /// Snapshot of a binding
    pub fn binding(&self, binding: BindingId) -> Option<BindingInfo> {
        self.state.bindings.get(&binding).map(BindingInfo::from)
    }

    /// Detach a binding
    ///
    /// Applied mappings are queued for clearing; stale ones are released
    /// after the binding's last update.
    pub fn bo_del(&mut self, binding: BindingId) -> Result<()> {
        let vm = self.vm;
        let st = &mut *self.state;

        match st.bindings.get(&binding) {
            None => return Err(Error::NotFound),
            Some(b) if b.table.is_some() => return Err(Error::InvalidArgument),
            Some(_) => {}
        }
        let b = st.bindings.remove(&binding).ok_or(Error::NotFound)?;

        if let Some(bo) = &b.buffer {
            vm.manager.unlink(bo.id(), vm.id, binding);
        }
        vm.status.lock().remove(binding);

        for id in b.valids {
            if let Some(m) = st.mappings.get_mut(&id) {
                st.index.remove(m.start);
                m.binding = None;
                st.freed.push_back(id);
            }
        }

        for id in b.invalids {
            if let Some(m) = st.mappings.remove(&id) {
                st.index.remove(m.start);
                vm.free_mapping(&m, b.last_pt_update.as_ref());
            }
        }

        log::debug!("{:?}: removed {:?}", vm.id, binding);
        Ok(())
    }

    // =========================================================================
    // MAPPINGS
    // =========================================================================

    /// Validate a map request and convert it to a page range
    fn check_map_args(&self, binding: BindingId, addr: GpuAddr, offset: u64, size: u64) -> Result<(u64, u64)> {
        let geometry = self.geometry();
        let page = geometry.cpu_page_size();

        if size == 0 || !addr.is_aligned(page) || offset % page != 0 || size % page != 0 {
            return Err(Error::InvalidArgument);
        }
        let end = addr.checked_offset(size - 1).ok_or(Error::InvalidArgument)?;

        let b = self.state.bindings.get(&binding).ok_or(Error::NotFound)?;
        if b.table.is_some() {
            return Err(Error::InvalidArgument);
        }
        if let Some(bo) = &b.buffer {
            let bo_end = offset.checked_add(size).ok_or(Error::InvalidArgument)?;
            if bo_end > bo.size() {
                return Err(Error::InvalidArgument);
            }
        }

        let (start, last) = (addr.pfn(), end.pfn());
        if last >= geometry.max_pfn {
            return Err(Error::InvalidArgument);
        }
        Ok((start, last))
    }

    /// Link a mapping into its binding and the index
    fn insert_map(&mut self, binding: BindingId, mut mapping: Mapping) -> Result<MappingId> {
        let vm = self.vm;
        let st = &mut *self.state;
        let id = MappingId::new(st.next_id());

        st.index.insert(mapping.start, mapping.last, id)?;
        mapping.binding = Some(binding);
        st.mappings.insert(id, mapping);

        let b = st.bindings.get_mut(&binding).ok_or(Error::NotFound)?;
        b.invalids.push(id);

        if mapping.is_prt() {
            vm.manager.prt().get();
        }

        vm.mark_per_vm_moved(b.buffer.as_ref(), binding);
        Ok(id)
    }

    /// Map `size` bytes of a binding's buffer at `addr`
    ///
    /// Fails with [`Error::Conflict`] if any page of the range is mapped.
    pub fn bo_map(
        &mut self,
        binding: BindingId,
        addr: GpuAddr,
        offset: u64,
        size: u64,
        flags: PteFlags,
    ) -> Result<MappingId> {
        let (start, last) = self.check_map_args(binding, addr, offset, size)?;

        if let Some(hit) = self.state.index.first_overlap(start, last) {
            log::warn!(
                "{:?}: {:#x}-{:#x} conflicts with {:#x}-{:#x}",
                self.vm.id,
                start,
                last + 1,
                hit.start,
                hit.last + 1
            );
            return Err(Error::Conflict);
        }

        self.insert_map(
            binding,
            Mapping {
                start,
                last,
                offset,
                flags,
                binding: None,
            },
        )
    }

    /// Map at `addr`, replacing whatever is mapped there
    pub fn bo_replace_map(
        &mut self,
        binding: BindingId,
        addr: GpuAddr,
        offset: u64,
        size: u64,
        flags: PteFlags,
    ) -> Result<MappingId> {
        let (start, last) = self.check_map_args(binding, addr, offset, size)?;
        self.clear_mappings(addr, size)?;

        self.insert_map(
            binding,
            Mapping {
                start,
                last,
                offset,
                flags,
                binding: None,
            },
        )
    }

    /// Remove the mapping of `binding` that starts at `addr`
    pub fn bo_unmap(&mut self, binding: BindingId, addr: GpuAddr) -> Result<()> {
        let start = addr.pfn();
        let st = &mut *self.state;
        let b = st.bindings.get_mut(&binding).ok_or(Error::NotFound)?;

        let starts_here = |id: &MappingId| st.mappings.get(id).map_or(false, |m| m.start == start);
        let (id, valid) = match b.valids.iter().copied().find(starts_here) {
            Some(id) => (id, true),
            None => (
                b.invalids.iter().copied().find(starts_here).ok_or(Error::NotFound)?,
                false,
            ),
        };
        b.take_mapping(id);
        let fence = b.last_pt_update.clone();
        st.index.remove(start);

        if valid {
            if let Some(m) = st.mappings.get_mut(&id) {
                m.binding = None;
            }
            st.freed.push_back(id);
        } else if let Some(m) = st.mappings.remove(&id) {
            self.vm.free_mapping(&m, fence.as_ref());
        }
        Ok(())
    }

    /// Remove every mapping in `[addr, addr + size)`
    ///
    /// Mappings crossing the range boundary are split and their outside
    /// parts stay mapped.
    pub fn clear_mappings(&mut self, addr: GpuAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let end = addr.checked_offset(size - 1).ok_or(Error::InvalidArgument)?;
        let (s, e) = (addr.pfn(), end.pfn());

        let vm = self.vm;
        let st = &mut *self.state;
        let hits: Vec<_> = st.index.overlapping(s, e).collect();
        let mut remainders = Vec::new();

        for hit in hits {
            let Some(mut m) = st.mappings.get(&hit.value).copied() else {
                continue;
            };

            if m.start < s {
                remainders.push(Mapping { last: s - 1, ..m });
            }
            if m.last > e {
                remainders.push(Mapping {
                    start: e + 1,
                    offset: m.offset + ((e + 1 - m.start) << GPU_PAGE_SHIFT),
                    ..m
                });
            }

            st.index.remove(hit.start);
            if let Some(b) = m.binding.and_then(|bid| st.bindings.get_mut(&bid)) {
                b.take_mapping(hit.value);
            }

            if m.start < s {
                m.offset += (s - m.start) << GPU_PAGE_SHIFT;
                m.start = s;
            }
            m.last = m.last.min(e);
            m.binding = None;
            st.mappings.insert(hit.value, m);
            st.freed.push_back(hit.value);
        }

        for r in remainders {
            let Some(bid) = r.binding else { continue };
            let id = MappingId::new(st.next_id());
            st.index.insert(r.start, r.last, id)?;
            st.mappings.insert(id, r);
            if let Some(b) = st.bindings.get_mut(&bid) {
                b.invalids.push(id);
                vm.mark_per_vm_moved(b.buffer.as_ref(), bid);
            }
            if r.is_prt() {
                vm.manager.prt().get();
            }
        }
        Ok(())
    }

    /// Mapping covering `addr`
    pub fn lookup_mapping(&self, addr: GpuAddr) -> Option<Mapping> {
        let pfn = addr.pfn();
        let hit = self.state.index.first_overlap(pfn, pfn)?;
        self.state.mappings.get(&hit.value).copied()
    }

    /// Lowest mapping intersecting the page range `[lo, hi]`
    pub fn first_overlap(&self, lo: u64, hi: u64) -> Option<Mapping> {
        let hit = self.state.index.first_overlap(lo, hi)?;
        self.state.mappings.get(&hit.value).copied()
    }

    /// Mapping record by id, live or freed
    pub fn mapping(&self, id: MappingId) -> Option<Mapping> {
        self.state.mappings.get(&id).copied()
    }

    /// Live mappings
    pub fn mapping_count(&self) -> usize {
        self.state.index.len()
    }

    /// Mappings waiting for their entries to be cleared
    pub fn freed_count(&self) -> usize {
        self.state.freed.len()
    }

    /// Directory nodes currently allocated
    pub fn table_count(&self) -> usize {
        self.state.tables.len()
    }

    /// Signal of the last update of per-VM state
    pub fn last_update(&self) -> Option<CompletionSignal> {
        self.state.last_update.clone()
    }

    // =========================================================================
    // COMPUTE MODE
    // =========================================================================

    fn is_root_clean(&self) -> bool {
        let st = &*self.state;
        let root_busy = st
            .tables
            .root()
            .and_then(|r| st.tables.get(r))
            .map_or(true, |n| n.has_children());
        !root_busy && st.bindings.len() == 1 && st.index.is_empty() && st.freed.is_empty()
    }

    /// Turn an empty graphics address space into a compute one
    ///
    /// Reinitializes the root if the ATS setting changes, then switches the
    /// update backend. On failure the address space is left unchanged.
    pub fn make_compute(&mut self) -> Result<()> {
        let vm = self.vm;
        let device = vm.manager.device();

        if !self.is_root_clean() {
            return Err(Error::InvalidArgument);
        }
        let root = self.state.tables.root().ok_or(Error::NotFound)?;

        let ats = device.compute_pte_support_ats();
        if ats != self.state.pte_support_ats {
            let previous = self.state.pte_support_ats;
            self.state.pte_support_ats = ats;
            if let Err(e) = self.clear_table(root) {
                self.state.pte_support_ats = previous;
                return Err(e);
            }
        }

        let mode = vm.manager.config().compute_update;
        if mode == UpdateMode::Cpu {
            for fence in vm.root_resv.fences(FenceUsage::Bookkeep) {
                fence.wait();
            }
        }

        let mut backend = device.update_backend(mode);
        let node = self.state.tables.get(root).ok_or(Error::NotFound)?;
        backend.map_table(node)?;

        let st = &mut *self.state;
        st.backend = backend;
        st.update_mode = mode;
        st.last_update = None;
        vm.compute.store(true, Ordering::Release);
        log::debug!("{:?}: switched to compute, update mode {:?}", vm.id, mode);
        Ok(())
    }

    /// Current page-table update mode
    pub fn update_mode(&self) -> UpdateMode {
        self.state.update_mode
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Keep PRT enabled until every outstanding update of this space retired
    fn prt_fini(&self) {
        let prt = self.vm.manager.prt();
        for fence in self.vm.root_resv.fences(FenceUsage::Bookkeep) {
            prt.get();
            prt.put_after(Some(&fence));
        }
    }

    fn teardown(&mut self) {
        let vm = self.vm;
        let mut prt_fini_needed = vm.manager.device().supports_prt();

        while let Some(id) = self.state.freed.pop_front() {
            if let Some(m) = self.state.mappings.remove(&id) {
                if m.is_prt() && prt_fini_needed {
                    self.prt_fini();
                    prt_fini_needed = false;
                }
                vm.free_mapping(&m, None);
            }
        }

        if !self.state.index.is_empty() {
            log::error!(
                "{:?}: still active mappings inside address space ({})",
                vm.id,
                self.state.index.len()
            );
        }
        let live: Vec<Mapping> = self.state.mappings.drain().map(|(_, m)| m).collect();
        for m in &live {
            vm.free_mapping(m, None);
        }

        let st = &mut *self.state;
        st.index.clear();
        for (bid, b) in st.bindings.drain() {
            if let Some(bo) = &b.buffer {
                vm.manager.unlink(bo.id(), vm.id, bid);
            }
        }
        if let Some(root) = st.tables.root() {
            st.tables.remove_subtree(root);
        }
        st.last_update = None;
        *vm.status.lock() = StatusLists::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{vram_buffer, TestBed};

    const RW: PteFlags = PteFlags::READABLE.union(PteFlags::WRITEABLE);

    #[test]
    fn test_create_has_root() {
        let bed = TestBed::new();
        let vm = bed.vm();
        assert_eq!(vm.binding_count(), 1);
        assert_eq!(vm.status_len(BindingStatus::Idle), 1);
        assert_ne!(vm.pd_addr(), 0);
        assert!(vm.ready());
        assert_eq!(vm.reserve().table_count(), 1);
    }

    #[test]
    fn test_map_conflict_leaves_index_unchanged() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x10_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x4000, RW).unwrap();
        assert_eq!(
            g.bo_map(b, GpuAddr::new(0x12_000), 0, 0x4000, RW),
            Err(Error::Conflict)
        );
        assert_eq!(g.mapping_count(), 1);
        assert!(g.bo_map(b, GpuAddr::new(0x14_000), 0, 0x4000, RW).is_ok());
    }

    #[test]
    fn test_map_argument_checks() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        let bad = [
            (0x1800, 0, 0x1000),
            (0x1000, 0x800, 0x1000),
            (0x1000, 0, 0),
            (0x1000, 0x2000, 0x4000),
        ];
        for (addr, offset, size) in bad {
            assert_eq!(
                g.bo_map(b, GpuAddr::new(addr), offset, size, RW),
                Err(Error::InvalidArgument)
            );
        }
        let past_end = bed.manager.geometry().max_pfn << GPU_PAGE_SHIFT;
        assert_eq!(
            g.bo_map(b, GpuAddr::new(past_end), 0, 0x1000, RW),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            g.bo_map(BindingId::new(999), GpuAddr::new(0x1000), 0, 0x1000, RW),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_map_marks_per_vm_binding_moved() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let own = vram_buffer(0x4000, vm.root_resv());
        let foreign = vram_buffer(0x4000, &Arc::new(Reservation::new()));
        let mut g = vm.reserve();
        let a = g.bo_add(Some(own));
        let b = g.bo_add(Some(foreign));

        g.bo_map(a, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();
        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x4000, RW).unwrap();
        assert_eq!(vm.binding_status(a), Some(BindingStatus::Moved));
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Idle));
    }

    #[test]
    fn test_unmap_valid_goes_to_freed() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x10_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x10_000, RW).unwrap();
        let m = g.first_overlap(0x1, 0x1 + 16).unwrap();
        assert_eq!((m.start, m.last), (1, 16));

        g.bo_update(b, false).unwrap();
        assert_eq!(g.binding(b).unwrap().valid_mappings, 1);

        g.bo_unmap(b, GpuAddr::new(0x1000)).unwrap();
        assert_eq!(g.freed_count(), 1);
        assert_eq!(g.mapping_count(), 0);
        assert_eq!(g.bo_unmap(b, GpuAddr::new(0x1000)), Err(Error::NotFound));
    }

    #[test]
    fn test_unmap_stale_is_released_directly() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        let b = g.bo_add(None);

        g.bo_map(b, GpuAddr::new(0x40_000), 0, 0x2000, PteFlags::PRT).unwrap();
        assert_eq!(bed.manager.prt().users(), 1);
        g.bo_unmap(b, GpuAddr::new(0x40_000)).unwrap();
        assert_eq!(g.freed_count(), 0);
        assert_eq!(bed.manager.prt().users(), 0);
    }

    #[test]
    fn test_split_recomputes_offsets() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x100_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        // [A - 10, B + 10) with A = 0x20, B = 0x30, in pages
        let (a, bb) = (0x20u64, 0x30u64);
        let flags = RW | PteFlags::EXECUTABLE;
        g.bo_map(b, GpuAddr::from_pfn(a - 10), 0x4000, (bb - a + 20) << 12, flags)
            .unwrap();

        g.clear_mappings(GpuAddr::from_pfn(a), (bb - a) << 12).unwrap();

        let head = g.lookup_mapping(GpuAddr::from_pfn(a - 10)).unwrap();
        let tail = g.lookup_mapping(GpuAddr::from_pfn(bb)).unwrap();
        assert_eq!((head.start, head.last, head.offset), (a - 10, a - 1, 0x4000));
        assert_eq!((tail.start, tail.last), (bb, bb + 9));
        assert_eq!(tail.offset, 0x4000 + ((bb - (a - 10)) << 12));
        assert_eq!(head.flags, flags);
        assert_eq!(tail.flags, flags);
        assert_eq!(g.mapping_count(), 2);
        assert!(g.lookup_mapping(GpuAddr::from_pfn(a)).is_none());
        assert_eq!(g.freed_count(), 1);
        assert_eq!(g.binding(b).unwrap().invalid_mappings, 2);
    }

    #[test]
    fn test_clear_exact_and_partial() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x100_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x8000, RW).unwrap();
        g.clear_mappings(GpuAddr::new(0x10_000), 0x8000).unwrap();
        assert_eq!(g.mapping_count(), 0);

        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x8000, RW).unwrap();
        g.clear_mappings(GpuAddr::new(0x10_000), 0x2000).unwrap();
        assert_eq!(g.mapping_count(), 1);
        let rest = g.lookup_mapping(GpuAddr::new(0x12_000)).unwrap();
        assert_eq!((rest.start, rest.last, rest.offset), (0x12, 0x17, 0x2000));

        g.clear_mappings(GpuAddr::new(0x16_000), 0x4000).unwrap();
        let rest = g.lookup_mapping(GpuAddr::new(0x12_000)).unwrap();
        assert_eq!((rest.start, rest.last, rest.offset), (0x12, 0x15, 0x2000));
        assert_eq!(g.freed_count(), 3);
    }

    #[test]
    fn test_replace_map() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x100_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x8000, RW).unwrap();
        g.bo_replace_map(b, GpuAddr::new(0x14_000), 0x20_000, 0x8000, PteFlags::READABLE)
            .unwrap();
        assert_eq!(g.mapping_count(), 2);
        let m = g.lookup_mapping(GpuAddr::new(0x15_000)).unwrap();
        assert_eq!((m.start, m.offset, m.flags), (0x14, 0x20_000, PteFlags::READABLE));
    }

    #[test]
    fn test_bo_del_releases_everything() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x100_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        assert_eq!(g.bo_find(&bo), Some(b));

        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x4000, RW).unwrap();
        g.bo_update(b, false).unwrap();
        g.bo_map(b, GpuAddr::new(0x20_000), 0, 0x4000, RW).unwrap();

        g.bo_del(b).unwrap();
        assert_eq!(g.bo_find(&bo), None);
        assert_eq!(g.mapping_count(), 0);
        assert_eq!(g.freed_count(), 1);
        assert_eq!(vm.binding_status(b), None);
        assert_eq!(g.bo_del(b), Err(Error::NotFound));
    }

    #[test]
    fn test_make_compute_requires_clean_root() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        let b = g.bo_add(None);
        assert_eq!(g.make_compute(), Err(Error::InvalidArgument));
        g.bo_del(b).unwrap();

        g.make_compute().unwrap();
        assert!(vm.is_compute());
        assert_eq!(g.update_mode(), bed.manager.config().compute_update);
    }

    #[test]
    fn test_fini_balances_prt() {
        let bed = TestBed::new();
        let vm = bed.vm();
        {
            let mut g = vm.reserve();
            let b = g.bo_add(None);
            g.bo_map(b, GpuAddr::new(0x100_000), 0, 0x4000, PteFlags::PRT).unwrap();
            g.bo_update(b, false).unwrap();
            g.bo_unmap(b, GpuAddr::new(0x100_000)).unwrap();
            g.bo_map(b, GpuAddr::new(0x200_000), 0, 0x4000, PteFlags::PRT).unwrap();
        }
        assert_eq!(bed.manager.prt().users(), 2);

        bed.backend.signal_all();
        vm.fini();
        assert_eq!(bed.manager.prt().users(), 0);
        assert!(!bed.device.prt_enabled());
        assert_eq!(vm.binding_count(), 0);
    }

    #[test]
    fn test_fini_keeps_prt_until_updates_retire() {
        let bed = TestBed::with_manual_signals();
        let vm = bed.vm();
        {
            let mut g = vm.reserve();
            let b = g.bo_add(None);
            g.bo_map(b, GpuAddr::new(0x100_000), 0, 0x4000, PteFlags::PRT).unwrap();
            g.clear_mappings(GpuAddr::new(0x100_000), 0x4000).unwrap();
            assert_eq!(g.freed_count(), 1);
        }
        // root clear is still in flight
        assert_eq!(vm.root_resv().fences(FenceUsage::Bookkeep).len(), 1);
        assert_eq!(bed.manager.prt().users(), 1);

        vm.fini();
        assert_eq!(bed.manager.prt().users(), 1);
        assert!(bed.device.prt_enabled());

        bed.backend.signal_all();
        assert_eq!(bed.manager.prt().users(), 0);
        assert!(!bed.device.prt_enabled());
    }

    #[test]
    fn test_make_compute_requires_empty_freed_queue() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        let b = g.bo_add(None);
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x1000, PteFlags::PRT).unwrap();
        g.clear_mappings(GpuAddr::new(0x1000), 0x1000).unwrap();
        g.bo_del(b).unwrap();
        assert_eq!(g.freed_count(), 1);
        assert_eq!(g.make_compute(), Err(Error::InvalidArgument));

        g.clear_freed().unwrap();
        g.make_compute().unwrap();
        assert!(vm.is_compute());
    }

    #[test]
    fn test_wait_idle() {
        let bed = TestBed::with_manual_signals();
        let vm = bed.vm();
        {
            let mut g = vm.reserve();
            let b = g.bo_add(Some(vram_buffer(0x4000, vm.root_resv())));
            g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();
            g.bo_update(b, false).unwrap();
        }
        assert_eq!(vm.wait_idle(1_000), Err(Error::Timeout));
        bed.backend.signal_all();
        assert!(vm.wait_idle(1_000).is_ok());
    }

    #[test]
    fn test_task_info() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let info = TaskInfo {
            pid: 7,
            tgid: 7,
            process_name: "glxgears".into(),
            task_name: "glxgears".into(),
        };
        vm.set_task_info(info.clone());
        assert_eq!(vm.task_info(), info);
    }
}
