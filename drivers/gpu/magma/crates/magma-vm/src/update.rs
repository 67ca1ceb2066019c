//! # Page-Table Update Pipeline
//!
//! Every entry write of an address space goes through one of the batch
//! passes below. Each batch is a single `prepare` / `update`* / `commit`
//! sequence on the update backend.
//!
//! ```text
//!   validate_pt_bos   Evicted    ──▶ Relocated | Moved
//!   update_pdes       Relocated  ──▶ Idle
//!   handle_moved      Moved      ──▶ Idle | Evicted
//!                     Invalidated ─▶ Done
//!   clear_freed       freed mappings ──▶ released
//! ```
//!
//! [`VmGuard::update_range`] is the primitive under all of them: it walks
//! the directory tree for a page range, allocates missing directory nodes,
//! frees subtrees an unmap fully covers and writes leaf entries one
//! physically contiguous run at a time.

use alloc::vec::Vec;

use magma_core::{CompletionSignal, Error, FenceUsage, Reservation, Result, GPU_PAGE_SHIFT, GPU_PAGE_SIZE};

use crate::backend::{SyncMode, UpdateParams};
use crate::binding::BindingId;
use crate::buffer::{Buffer, BufferDesc, BufferKind, MemDomains, Residency, VramBlock};
use crate::config::HOLE_START_PFN;
use crate::cursor::ResCursor;
use crate::mapping::PteFlags;
use crate::pt::{Level, PageTable, TableId};
use crate::status::BindingStatus;
use crate::vm::VmGuard;

/// Where the addresses written into leaf entries come from
#[derive(Debug, Clone, Copy)]
pub enum PteSource<'a> {
    /// No backing; only valid for entries without the valid bit
    None,
    /// Linear range starting at the update offset
    Linear,
    /// VRAM block list of the backing buffer
    Vram(&'a [VramBlock]),
    /// One DMA address per CPU page
    Scatter(&'a [u64]),
}

impl<'a> PteSource<'a> {
    /// Source describing where `residency` keeps its pages
    pub fn from_residency(residency: Option<&'a Residency>) -> Self {
        match residency {
            Some(Residency::Vram(blocks)) => PteSource::Vram(blocks),
            Some(Residency::Gtt(pages)) => PteSource::Scatter(pages),
            Some(Residency::Cpu) | None => PteSource::None,
        }
    }
}

/// One call of [`VmGuard::update_range`]
#[derive(Debug, Clone, Copy)]
pub struct RangeUpdate<'a> {
    /// Submit on the immediate queue
    pub immediate: bool,
    /// Caller does not own the update; only existing tables are written
    pub unlocked: bool,
    /// Advance the TLB sequence once the update retires
    pub flush_tlb: bool,
    /// Reservation the update must order against
    pub resv: Option<&'a Reservation>,
    /// First page
    pub start: u64,
    /// Last page, inclusive
    pub last: u64,
    /// Entry flags
    pub flags: PteFlags,
    /// Byte offset into the source
    pub offset: u64,
    /// Added to VRAM addresses
    pub vram_base: u64,
    /// Address source
    pub source: PteSource<'a>,
}

impl<'a> RangeUpdate<'a> {
    /// Locked, delayed update of `[start, last]` without a source
    pub fn new(start: u64, last: u64, flags: PteFlags) -> Self {
        Self {
            immediate: false,
            unlocked: false,
            flush_tlb: false,
            resv: None,
            start,
            last,
            flags,
            offset: 0,
            vram_base: 0,
            source: PteSource::None,
        }
    }
}

/// Placement collaborator run on every evicted binding
pub trait Validator {
    /// Move `buffer` back into a domain the GPU can use
    fn validate(&mut self, buffer: &Buffer) -> Result<()>;
}

impl<F> Validator for F
where
    F: FnMut(&Buffer) -> Result<()>,
{
    fn validate(&mut self, buffer: &Buffer) -> Result<()> {
        self(buffer)
    }
}

/// Largest fragment usable for `[start, end)`
///
/// Returns the fragment size in bits and where the fragment ends. Scattered
/// pages and invalid entries never use fragments.
pub fn fragment(start: u64, end: u64, flags: PteFlags, scattered: bool, max_frag: u32) -> (u32, u64) {
    if scattered || !flags.contains(PteFlags::VALID) || end <= start {
        return (0, end);
    }

    let frag = start.trailing_zeros().min((end - start).ilog2());
    if frag >= max_frag {
        (max_frag, end & !((1u64 << max_frag) - 1))
    } else {
        (frag, start + (1u64 << frag))
    }
}

/// Entries that carry an address
fn has_address(flags: PteFlags) -> bool {
    flags.intersects(PteFlags::VALID | PteFlags::PRT)
}

impl<'a> VmGuard<'a> {
    // =========================================================================
    // DIRECTORY NODES
    // =========================================================================

    /// Write every entry of a node in its own batch
    pub(crate) fn clear_table(&mut self, table: TableId) -> Result<()> {
        let vm = self.vm;
        let geometry = self.geometry();
        let params = UpdateParams::new(vm.id(), geometry.cpu_page_shift);

        let st = &mut *self.state;
        let node = st.tables.get(table).ok_or(Error::NotFound)?;
        let entries = geometry.num_entries(node.level());

        let ats_entries = if st.pte_support_ats && node.parent().is_none() {
            let shift = geometry.level_shift(node.level());
            (HOLE_START_PFN >> shift).min(u64::from(entries)) as u32
        } else {
            0
        };

        st.backend.prepare(&params, None, SyncMode::Explicit)?;
        if ats_entries > 0 {
            st.backend
                .update(&params, node, 0, 0, ats_entries, 0, PteFlags::DEFAULT_ATC)?;
        }
        if ats_entries < entries {
            st.backend.update(
                &params,
                node,
                ats_entries,
                0,
                entries - ats_entries,
                0,
                PteFlags::empty(),
            )?;
        }
        let signal = st.backend.commit(&params)?;
        vm.root_resv.add_fence(signal, FenceUsage::Bookkeep);
        Ok(())
    }

    /// Allocate the child of `parent` at `slot` inside the current batch
    fn alloc_table(&mut self, params: &UpdateParams<'_>, parent: TableId, slot: u32, pfn: u64) -> Result<TableId> {
        let vm = self.vm;
        let geometry = self.geometry();
        let parent_level = self
            .state
            .tables
            .get(parent)
            .map(PageTable::level)
            .ok_or(Error::NotFound)?;
        let level = parent_level.child().ok_or(Error::InvalidArgument)?;
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

        let binding = self.attach(Some(buffer.clone()), true);
        let entries = geometry.num_entries(level);
        let id = self
            .state
            .tables
            .insert(level, entries, Some((parent, slot)), buffer, binding);
        if let Some(b) = self.state.bindings.get_mut(&binding) {
            b.table = Some(id);
        }

        let clear_flags = if self.state.pte_support_ats && level == Level::Ptb && pfn < HOLE_START_PFN {
            PteFlags::DEFAULT_ATC
        } else {
            PteFlags::empty()
        };

        let st = &mut *self.state;
        let node = st.tables.get(id).ok_or(Error::NotFound)?;
        st.backend.map_table(node)?;
        st.backend.update(params, node, 0, 0, entries, 0, clear_flags)?;

        log::trace!("{:?}: allocated {:?} table at slot {} of {:?}", vm.id(), level, slot, parent);
        Ok(id)
    }

    /// Drop a directory subtree and its bindings
    fn free_subtree(&mut self, table: TableId) {
        let vm = self.vm;
        let removed = self.state.tables.remove_subtree(table);

        {
            let mut status = vm.status.lock();
            for node in &removed {
                status.remove(node.binding());
            }
        }
        for node in &removed {
            self.state.bindings.remove(&node.binding());
            vm.manager.unlink(node.buffer().id(), vm.id(), node.binding());
        }
        log::trace!("{:?}: freed {} directory nodes", vm.id(), removed.len());
    }

    /// Write entries for `[start, end)` walking down from the root
    #[allow(clippy::too_many_arguments)]
    fn update_ptes(
        &mut self,
        params: &mut UpdateParams<'_>,
        start: u64,
        end: u64,
        mut dst: u64,
        incr: u64,
        flags: PteFlags,
    ) -> Result<()> {
        let geometry = self.geometry();
        let root = self.state.tables.root().ok_or(Error::NotFound)?;
        let mut pfn = start;

        'walk: while pfn < end {
            let mut node = root;

            loop {
                let level = self
                    .state
                    .tables
                    .get(node)
                    .map(PageTable::level)
                    .ok_or(Error::NotFound)?;

                if level == Level::Ptb {
                    let mask = (1u64 << geometry.block_size) - 1;
                    let upto = end.min((pfn | mask) + 1);
                    let scattered = params.pages_addr.is_some();

                    let st = &mut *self.state;
                    let table = st.tables.get(node).ok_or(Error::NotFound)?;
                    while pfn < upto {
                        let (frag, frag_end) =
                            fragment(pfn, upto, flags, scattered, geometry.fragment_size);
                        let count = frag_end - pfn;
                        let entry_flags = if frag > 0 { flags.with_fragment(frag) } else { flags };
                        st.backend.update(
                            params,
                            table,
                            geometry.entry_index(Level::Ptb, pfn),
                            dst,
                            count as u32,
                            incr,
                            entry_flags,
                        )?;
                        dst += count * incr;
                        pfn = frag_end;
                    }
                    continue 'walk;
                }

                let span = 1u64 << geometry.level_shift(level);
                let slot_start = pfn & !(span - 1);
                let slot_end = slot_start + span;
                let slot = geometry.entry_index(level, pfn);
                let child = self.state.tables.get(node).and_then(|n| n.child(slot));

                match child {
                    Some(child)
                        if flags.is_empty()
                            && !params.unlocked
                            && pfn == slot_start
                            && end >= slot_end =>
                    {
                        self.free_subtree(child);
                        params.table_freed = true;

                        let st = &mut *self.state;
                        let table = st.tables.get(node).ok_or(Error::NotFound)?;
                        st.backend
                            .update(params, table, slot, 0, 1, 0, PteFlags::empty())?;
                        dst += (slot_end - pfn) * incr;
                        pfn = slot_end;
                        continue 'walk;
                    }
                    Some(child) => node = child,
                    None if has_address(flags) => {
                        if params.unlocked {
                            return Err(Error::NotFound);
                        }
                        node = self.alloc_table(params, node, slot, pfn)?;
                    }
                    None => {
                        let next = slot_end.min(end);
                        dst += (next - pfn) * incr;
                        pfn = next;
                        continue 'walk;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // RANGE UPDATE
    // =========================================================================

    /// Write the entries of `[req.start, req.last]`
    ///
    /// Fails with [`Error::Busy`] while an evictor owns the address space.
    pub fn update_range(&mut self, req: RangeUpdate<'_>) -> Result<CompletionSignal> {
        let vm = self.vm;
        let device = vm.manager.device();
        if device.is_unplugged() {
            return Err(Error::DeviceGone);
        }

        let geometry = self.geometry();
        if req.start > req.last || req.last >= geometry.max_pfn {
            return Err(Error::InvalidArgument);
        }
        if req.flags.contains(PteFlags::VALID) && matches!(req.source, PteSource::None) {
            return Err(Error::InvalidArgument);
        }

        let flush_tlb = req.flush_tlb || device.needs_full_tlb_flush();
        let sync = if req.flags.contains(PteFlags::VALID) {
            SyncMode::Explicit
        } else {
            SyncMode::EqOwner
        };

        let evicting = vm.evicting.lock();
        if *evicting {
            return Err(Error::Busy);
        }

        if !req.unlocked {
            let mut last = vm.last_unlocked.lock();
            if !last.is_signaled() {
                vm.root_resv.add_fence(last.clone(), FenceUsage::Bookkeep);
                *last = CompletionSignal::signaled();
            }
        }

        let mut params = UpdateParams::new(vm.id(), geometry.cpu_page_shift);
        params.immediate = req.immediate;
        params.unlocked = req.unlocked;
        self.state.backend.prepare(&params, req.resv, sync)?;

        let num_pages = req.last - req.start + 1;
        let blocks = match req.source {
            PteSource::Vram(blocks) => Some(blocks),
            _ => None,
        };
        let mut cursor = ResCursor::first(blocks, req.offset, num_pages << GPU_PAGE_SHIFT);
        let mut pfn = req.start;

        while cursor.remaining > 0 {
            let mut num_entries = cursor.size >> GPU_PAGE_SHIFT;
            if num_entries == 0 {
                return Err(Error::InvalidArgument);
            }
            params.pages_addr = None;

            let (addr, incr) = match req.source {
                PteSource::Scatter(pages) => {
                    let per_cpu_page = geometry.gpu_pages_per_cpu_page();
                    let cpu_page = geometry.cpu_page_size();
                    let idx = (cursor.start >> geometry.cpu_page_shift) as usize;
                    let cpu_pages = (num_entries / per_cpu_page).max(1) as usize;

                    let first = *pages.get(idx).ok_or(Error::InvalidArgument)?;
                    let follows = |i: usize| -> Result<bool> {
                        let cur = pages.get(i).ok_or(Error::InvalidArgument)?;
                        Ok(*cur == pages[i - 1] + cpu_page)
                    };
                    let contiguous = cpu_pages > 1 && follows(idx + 1)?;

                    let mut count = 1;
                    while count < cpu_pages && follows(idx + count)? == contiguous {
                        count += 1;
                    }
                    if !contiguous && count < cpu_pages && count > 1 {
                        count -= 1;
                    }
                    num_entries = num_entries.min(count as u64 * per_cpu_page);

                    if contiguous {
                        (first + (cursor.start & (cpu_page - 1)), GPU_PAGE_SIZE)
                    } else {
                        params.pages_addr = Some(pages);
                        (cursor.start, GPU_PAGE_SIZE)
                    }
                }
                _ if has_address(req.flags) => (req.vram_base + cursor.start, GPU_PAGE_SIZE),
                _ => (0, 0),
            };

            let end = pfn + num_entries;
            self.update_ptes(&mut params, pfn, end, addr, incr, req.flags)?;
            pfn = end;
            cursor.next(num_entries << GPU_PAGE_SHIFT);
        }

        params.pages_addr = None;
        let signal = self.state.backend.commit(&params)?;

        if req.unlocked {
            *vm.last_unlocked.lock() = signal.clone();
        } else {
            vm.root_resv.add_fence(signal.clone(), FenceUsage::Bookkeep);
        }

        if flush_tlb || params.table_freed {
            vm.tlb.bump_on(&signal);
        }
        drop(evicting);

        log::trace!(
            "{:?}: updated {:#x}-{:#x} flags {:?}",
            vm.id(),
            req.start,
            req.last,
            req.flags
        );
        Ok(signal)
    }

    // =========================================================================
    // BATCH PASSES
    // =========================================================================

    /// Rewrite the parent entries of every relocated directory
    pub fn update_pdes(&mut self, immediate: bool) -> Result<()> {
        let vm = self.vm;
        let device = vm.manager.device();
        let relocated = vm.status.lock().snapshot(BindingStatus::Relocated);
        if relocated.is_empty() {
            return Ok(());
        }
        if device.is_unplugged() {
            return Err(Error::DeviceGone);
        }

        let mut params = UpdateParams::new(vm.id(), self.geometry().cpu_page_shift);
        params.immediate = immediate;
        let vram_base = device.vram_base_offset();

        let st = &mut *self.state;
        st.backend.prepare(&params, None, SyncMode::Explicit)?;

        for binding in &relocated {
            let Some(node) = st
                .bindings
                .get(binding)
                .and_then(|b| b.table)
                .and_then(|t| st.tables.get(t))
            else {
                continue;
            };
            let Some((parent, slot)) = node.parent() else {
                continue;
            };
            let parent = st.tables.get(parent).ok_or(Error::NotFound)?;

            let addr = node
                .buffer()
                .residency()
                .base_address(vram_base)
                .ok_or(Error::InvalidArgument)?;
            let mut flags = PteFlags::VALID;
            device.pde_flags(parent.level(), &mut flags);
            st.backend.update(&params, parent, slot, addr, 1, 0, flags)?;
        }

        let signal = st.backend.commit(&params)?;
        vm.root_resv.add_fence(signal.clone(), FenceUsage::Bookkeep);
        st.last_update = Some(signal.clone());
        vm.tlb.bump_on(&signal);

        let mut status = vm.status.lock();
        for binding in relocated {
            if status.move_if(binding, BindingStatus::Relocated, BindingStatus::Idle) {
                status.set_moved(binding, false);
            }
        }
        Ok(())
    }

    /// Validate every evicted binding and clear the eviction flag
    ///
    /// Directory nodes are remapped and queued for a parent update; other
    /// buffers are queued for a mapping update.
    pub fn validate_pt_bos(&mut self, validator: &mut dyn Validator) -> Result<()> {
        let vm = self.vm;

        loop {
            let Some(binding) = vm.status.lock().first(BindingStatus::Evicted) else {
                break;
            };
            let b = self.state.bindings.get(&binding).ok_or(Error::NotFound)?;
            let (buffer, table) = (b.buffer.clone(), b.table);

            let Some(buffer) = buffer else {
                vm.status.lock().idle(binding);
                continue;
            };
            validator.validate(&buffer)?;
            if let Some(shadow) = buffer.shadow() {
                validator.validate(shadow)?;
            }

            match table {
                Some(table) => {
                    let st = &mut *self.state;
                    let node = st.tables.get(table).ok_or(Error::NotFound)?;
                    st.backend.map_table(node)?;
                    let has_parent = node.parent().is_some();
                    vm.status.lock().relocated(binding, has_parent);
                }
                None => vm.status.lock().moved_state(binding),
            }
        }

        *vm.evicting.lock() = false;
        Ok(())
    }

    /// Rewrite the entries of every mapping of a binding
    ///
    /// With `clear` the entries are written invalid instead of pointing at
    /// the buffer.
    pub fn bo_update(&mut self, binding: BindingId, clear: bool) -> Result<()> {
        let vm = self.vm;
        let device = vm.manager.device();

        let b = self.state.bindings.get(&binding).ok_or(Error::NotFound)?;
        if b.table.is_some() {
            return Err(Error::InvalidArgument);
        }
        let buffer = b.buffer.clone();

        let residency = match &buffer {
            Some(bo) if !clear => Some(bo.residency()),
            _ => None,
        };
        let resv = match &buffer {
            Some(bo) if !clear => bo.resv().clone(),
            _ => vm.root_resv.clone(),
        };
        let flags = match &buffer {
            Some(bo) => {
                let mut flags = Residency::pte_flags(residency.as_ref());
                if bo.is_encrypted() {
                    flags |= PteFlags::TMZ;
                }
                flags
            }
            None => PteFlags::empty(),
        };
        let vram_base = match &residency {
            Some(Residency::Vram(_)) => device.vram_base_offset(),
            _ => 0,
        };
        let per_vm = buffer
            .as_ref()
            .map_or(false, |bo| bo.shares_reservation(&vm.root_resv));
        let moved = vm.status.lock().moved(binding);

        let b = self.state.bindings.get_mut(&binding).ok_or(Error::NotFound)?;
        let mut flush_tlb = false;
        if !clear && moved {
            flush_tlb = true;
            b.invalidate_all();
        } else if b.cleared != clear {
            b.invalidate_all();
        }
        let pending = b.invalids.clone();

        let source = PteSource::from_residency(residency.as_ref());
        for id in pending {
            let Some(mapping) = self.state.mappings.get(&id).copied() else {
                continue;
            };

            let mut update_flags = flags;
            if !mapping.flags.contains(PteFlags::READABLE) {
                update_flags.remove(PteFlags::READABLE);
            }
            if !mapping.flags.contains(PteFlags::WRITEABLE) {
                update_flags.remove(PteFlags::WRITEABLE);
            }
            device.adjust_pte_flags(mapping.flags, &mut update_flags);

            let signal = self.update_range(RangeUpdate {
                flush_tlb,
                resv: Some(&*resv),
                offset: mapping.offset,
                vram_base,
                source,
                ..RangeUpdate::new(mapping.start, mapping.last, update_flags)
            })?;

            let st = &mut *self.state;
            let b = st.bindings.get_mut(&binding).ok_or(Error::NotFound)?;
            if clear || per_vm {
                st.last_update = Some(signal);
            } else {
                b.last_pt_update = Some(signal);
            }
            if b.take_mapping(id).is_some() {
                b.valids.push(id);
            }
        }

        {
            let mut status = vm.status.lock();
            match &buffer {
                Some(bo) if per_vm => {
                    if bo.in_preferred_domain() {
                        status.idle(binding);
                    } else {
                        status.evicted(binding, false);
                    }
                }
                _ => status.done(binding),
            }
            status.set_moved(binding, false);
        }

        if let Some(b) = self.state.bindings.get_mut(&binding) {
            b.cleared = clear;
        }
        Ok(())
    }

    /// Apply every moved and invalidated binding
    ///
    /// Invalidated bindings whose buffer reservation is contended are
    /// cleared instead of waited for.
    pub fn handle_moved(&mut self) -> Result<()> {
        let vm = self.vm;

        loop {
            let Some(binding) = vm.status.lock().first(BindingStatus::Moved) else {
                break;
            };
            self.bo_update(binding, false)?;
        }

        loop {
            let Some(binding) = vm.status.lock().first(BindingStatus::Invalidated) else {
                break;
            };
            let buffer = self
                .state
                .bindings
                .get(&binding)
                .and_then(|b| b.buffer.clone());
            let guard = buffer.as_ref().and_then(|bo| bo.resv().try_lock());
            let clear = guard.is_none() || cfg!(feature = "debug-vm");

            self.bo_update(binding, clear)?;
            drop(guard);
        }
        Ok(())
    }

    /// Clear the entries of every freed mapping and release it
    ///
    /// Returns the signal of the last clearing update. A mapping whose
    /// update fails stays queued.
    pub fn clear_freed(&mut self) -> Result<Option<CompletionSignal>> {
        let vm = self.vm;
        let resv: &Reservation = &vm.root_resv;
        let mut last = None;

        while let Some(id) = self.state.freed.pop_front() {
            let Some(mapping) = self.state.mappings.get(&id).copied() else {
                continue;
            };
            let flags = if self.state.pte_support_ats && mapping.start < HOLE_START_PFN {
                PteFlags::DEFAULT_ATC
            } else {
                PteFlags::empty()
            };

            let result = self.update_range(RangeUpdate {
                flush_tlb: true,
                resv: Some(resv),
                ..RangeUpdate::new(mapping.start, mapping.last, flags)
            });

            match result {
                Ok(signal) => {
                    self.state.mappings.remove(&id);
                    vm.free_mapping(&mapping, Some(&signal));
                    last = Some(signal);
                }
                Err(e) => {
                    self.state.freed.push_front(id);
                    return Err(e);
                }
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use magma_core::{BackendError, GpuAddr};

    use super::*;
    use crate::mock::{gtt_buffer, place_in_vram, vram_buffer, BackendOp, TestBed};

    const RW: PteFlags = PteFlags::READABLE.union(PteFlags::WRITEABLE);

    fn leaf_writes(ops: &[BackendOp]) -> Vec<(u32, u64, u32, u64, PteFlags)> {
        ops.iter()
            .filter_map(|op| match *op {
                BackendOp::Update { level: Level::Ptb, first, addr, count, incr, flags, .. } => {
                    Some((first, addr, count, incr, flags))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fragment_selection() {
        let v = PteFlags::VALID;
        assert_eq!(fragment(0, 512, v, false, 9), (9, 512));
        assert_eq!(fragment(0, 700, v, false, 9), (9, 512));
        assert_eq!(fragment(4, 20, v, false, 9), (2, 8));
        assert_eq!(fragment(1, 17, v, false, 9), (0, 2));
        assert_eq!(fragment(0, 16, PteFlags::empty(), false, 9), (0, 16));
        assert_eq!(fragment(0, 16, v, true, 9), (0, 16));
    }

    #[test]
    fn test_map_unmap_clear_cycle() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x10_000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x10_000, RW).unwrap();
        let m = g.first_overlap(0x1, 0x1 + 16).unwrap();
        assert_eq!((m.start, m.last), (0x1, 0x10));
        g.handle_moved().unwrap();
        g.update_pdes(false).unwrap();

        g.bo_unmap(b, GpuAddr::new(0x1000)).unwrap();
        assert_eq!(g.freed_count(), 1);

        bed.backend.clear();
        g.clear_freed().unwrap();
        let ops = bed.backend.ops();
        let prepares = ops.iter().filter(|op| matches!(op, BackendOp::Prepare { .. })).count();
        let commits = ops.iter().filter(|op| matches!(op, BackendOp::Commit)).count();
        assert_eq!((prepares, commits), (1, 1));

        let leaves = leaf_writes(&ops);
        assert_eq!(leaves.iter().map(|l| l.2).sum::<u32>(), 16);
        assert!(leaves.iter().all(|l| l.1 == 0 && l.4.is_empty()));
        assert_eq!(g.freed_count(), 0);
    }

    #[test]
    fn test_map_allocates_tables_and_writes_vram_addresses() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x8000, vm.root_resv());
        let base = bo.residency().base_address(0).unwrap();
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));
        g.bo_map(b, GpuAddr::new(0x20_0000), 0x1000, 0x4000, RW).unwrap();

        bed.backend.clear();
        g.bo_update(b, false).unwrap();
        assert_eq!(g.table_count(), 4);
        assert_eq!(vm.status_len(BindingStatus::Relocated), 3);

        let leaves = leaf_writes(&bed.backend.ops());
        let writes: Vec<_> = leaves.iter().filter(|l| l.4.contains(PteFlags::VALID)).collect();
        assert_eq!(writes.len(), 1);
        let (first, addr, count, incr, flags) = *writes[0];
        assert_eq!((first, addr, count, incr), (0, base + 0x1000, 4, GPU_PAGE_SIZE));
        assert!(flags.contains(RW | PteFlags::VALID));
        assert!(!flags.contains(PteFlags::EXECUTABLE));

        let before = vm.tlb_seq();
        g.update_pdes(false).unwrap();
        assert_eq!(vm.status_len(BindingStatus::Relocated), 0);
        assert!(vm.tlb_seq() > before);
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Idle));
    }

    #[test]
    fn test_valid_without_source_rejected() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        assert_eq!(
            g.update_range(RangeUpdate::new(1, 1, PteFlags::VALID)).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(
            g.update_range(RangeUpdate::new(4, 1, PteFlags::empty())).err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_scatter_contiguity_merge() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let pages = vec![0x10_0000, 0x10_1000, 0x10_2000, 0x50_0000, 0x70_0000, 0x71_0000];
        let bo = gtt_buffer(pages, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));
        g.bo_map(b, GpuAddr::new(0x40_0000), 0, 0x6000, RW).unwrap();

        bed.backend.clear();
        g.bo_update(b, false).unwrap();
        let leaves: Vec<_> = leaf_writes(&bed.backend.ops())
            .into_iter()
            .filter(|l| l.4.contains(PteFlags::VALID))
            .collect();

        // first three pages are one DMA run, the rest resolve per page
        assert_eq!(leaves[0].1, 0x10_0000);
        assert!(leaves[0].4.contains(PteFlags::SYSTEM | PteFlags::SNOOPED));
        assert_eq!(leaves.iter().map(|l| l.2).sum::<u32>(), 6);
        let tail = leaves.iter().find(|l| l.0 == 3).unwrap();
        assert_eq!((tail.1, tail.2), (0x3000, 3));
        assert!(bed.backend.ops().iter().any(|op| matches!(
            op,
            BackendOp::Update { first: 3, scattered: true, .. }
        )));
    }

    #[test]
    fn test_eviction_blocks_updates() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();

        *vm.evicting.lock() = true;
        assert!(!vm.ready());
        assert_eq!(g.bo_update(b, false), Err(Error::Busy));
        assert_eq!(g.binding(b).unwrap().invalid_mappings, 1);

        g.validate_pt_bos(&mut place_in_vram).unwrap();
        assert!(vm.ready());
        g.bo_update(b, false).unwrap();
        assert_eq!(g.binding(b).unwrap().valid_mappings, 1);
    }

    #[test]
    fn test_validate_routes_tables_and_buffers() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = gtt_buffer(vec![0x1000], vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Evicted));
        assert!(!vm.ready());

        let mut validated = 0;
        g.validate_pt_bos(&mut |buffer: &Buffer| {
            validated += 1;
            place_in_vram(buffer)
        })
        .unwrap();
        assert_eq!(validated, 1);
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Moved));
        assert!(bo.in_preferred_domain());

        bed.manager.invalidate_buffer(&bo, true);
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Evicted));
    }

    #[test]
    fn test_validator_error_keeps_binding_evicted() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = gtt_buffer(vec![0x1000], vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        let mut failing = |_: &Buffer| -> Result<()> { Err(Error::Backend(BackendError::Validate)) };
        assert_eq!(
            g.validate_pt_bos(&mut failing),
            Err(Error::Backend(BackendError::Validate))
        );
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Evicted));
    }

    #[test]
    fn test_unmap_whole_table_frees_subtree() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x20_0000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        // one full page table: 512 pages at a 2 MiB boundary
        g.bo_map(b, GpuAddr::new(0x20_0000), 0, 0x20_0000, RW).unwrap();
        g.bo_update(b, false).unwrap();
        g.update_pdes(false).unwrap();
        let tables = g.table_count();

        g.bo_unmap(b, GpuAddr::new(0x20_0000)).unwrap();
        let before = vm.tlb_seq();
        g.clear_freed().unwrap();
        assert_eq!(g.table_count(), tables - 1);
        assert!(vm.tlb_seq() > before);
        assert_eq!(vm.binding_count(), tables);
    }

    #[test]
    fn test_clear_freed_requeues_on_failure() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();
        g.bo_update(b, false).unwrap();
        g.bo_unmap(b, GpuAddr::new(0x1000)).unwrap();

        bed.backend.fail_next(BackendError::Commit);
        assert_eq!(g.clear_freed().err(), Some(Error::Backend(BackendError::Commit)));
        assert_eq!(g.freed_count(), 1);
        assert!(g.clear_freed().unwrap().is_some());
        assert_eq!(g.freed_count(), 0);
    }

    #[test]
    fn test_device_gone() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        bed.device.set_unplugged(true);
        assert_eq!(
            g.update_range(RangeUpdate::new(1, 1, PteFlags::empty())).err(),
            Some(Error::DeviceGone)
        );
    }

    #[test]
    fn test_full_flush_quirk_bumps_every_update() {
        let bed = TestBed::new();
        bed.device.set_full_tlb_flush(true);
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();

        let before = vm.tlb_seq();
        g.bo_update(b, false).unwrap();
        assert_eq!(vm.tlb_seq(), before + 1);
    }

    #[test]
    fn test_tlb_bump_waits_for_commit_signal() {
        let bed = TestBed::with_manual_signals();
        let vm = bed.vm();
        bed.backend.signal_all();
        let mut g = vm.reserve();
        let b = g.bo_add(None);
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x1000, PteFlags::PRT).unwrap();
        g.bo_update(b, false).unwrap();
        g.update_pdes(false).unwrap();
        bed.backend.signal_all();

        let seq = vm.tlb_seq();
        g.bo_unmap(b, GpuAddr::new(0x1000)).unwrap();
        let signal = g.clear_freed().unwrap().unwrap();
        assert_eq!(vm.tlb_seq(), seq);
        assert!(vm.last_tlb_flush().ptr_eq(&signal));
        assert_eq!(bed.manager.prt().users(), 1);

        bed.backend.signal_all();
        assert_eq!(vm.tlb_seq(), seq + 1);
        assert_eq!(bed.manager.prt().users(), 0);
    }

    #[test]
    fn test_foreign_binding_goes_done() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, &Arc::new(Reservation::new()));
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();

        bed.manager.invalidate_buffer(&bo, false);
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Invalidated));
        g.handle_moved().unwrap();
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Done));
        let info = g.binding(b).unwrap();
        assert_eq!(info.cleared, cfg!(feature = "debug-vm"));
        assert_eq!(info.valid_mappings, 1);
    }

    #[test]
    fn test_contended_foreign_binding_is_cleared() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, &Arc::new(Reservation::new()));
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        g.bo_map(b, GpuAddr::new(0x1000), 0, 0x4000, RW).unwrap();
        bed.manager.invalidate_buffer(&bo, false);

        let held = bo.resv().lock();
        bed.backend.clear();
        g.handle_moved().unwrap();
        drop(held);

        assert!(g.binding(b).unwrap().cleared);
        let leaves = leaf_writes(&bed.backend.ops());
        assert!(leaves.iter().all(|l| !l.4.contains(PteFlags::VALID)));
    }

    #[test]
    fn test_split_remainder_is_rewritten_and_cleared() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let bo = vram_buffer(0x8000, vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));
        g.bo_map(b, GpuAddr::new(0x10_000), 0, 0x8000, RW).unwrap();
        g.handle_moved().unwrap();
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Idle));

        g.clear_mappings(GpuAddr::new(0x10_000), 0x2000).unwrap();
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Moved));
        g.clear_freed().unwrap();
        g.handle_moved().unwrap();
        let info = g.binding(b).unwrap();
        assert_eq!((info.valid_mappings, info.invalid_mappings), (1, 0));

        g.bo_unmap(b, GpuAddr::new(0x12_000)).unwrap();
        assert_eq!(g.freed_count(), 1);
        bed.backend.clear();
        g.clear_freed().unwrap();
        let leaves = leaf_writes(&bed.backend.ops());
        assert_eq!(leaves.iter().map(|l| l.2).sum::<u32>(), 6);
        assert!(leaves.iter().all(|l| l.4.is_empty()));
    }

    #[test]
    fn test_unlocked_update_never_allocates() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let mut g = vm.reserve();
        let req = RangeUpdate {
            unlocked: true,
            ..RangeUpdate::new(0x200, 0x203, PteFlags::PRT)
        };
        assert_eq!(g.update_range(req).err(), Some(Error::NotFound));
        assert_eq!(g.table_count(), 1);
    }

    #[test]
    fn test_unlocked_signal_handoff() {
        let bed = TestBed::with_manual_signals();
        let vm = bed.vm();
        let bo = vram_buffer(0x4000, &Arc::new(Reservation::new()));
        let mut g = vm.reserve();
        g.bo_add(Some(bo.clone()));
        g.update_range(RangeUpdate::new(0x200, 0x203, PteFlags::PRT)).unwrap();
        bed.backend.signal_all();

        let signal = g
            .update_range(RangeUpdate {
                unlocked: true,
                ..RangeUpdate::new(0x200, 0x203, PteFlags::PRT)
            })
            .unwrap();
        assert!(vm.last_unlocked().ptr_eq(&signal));
        assert!(!signal.is_signaled());
        assert!(vm.root_resv().fences(FenceUsage::Bookkeep).is_empty());
        assert!(!bed.manager.evictable(&bo));

        // next locked update takes the pending signal into the reservation
        g.update_range(RangeUpdate::new(0x200, 0x203, PteFlags::empty())).unwrap();
        assert!(vm.last_unlocked().is_signaled());
        assert!(vm
            .root_resv()
            .fences(FenceUsage::Bookkeep)
            .iter()
            .any(|f| f.ptr_eq(&signal)));

        bed.backend.signal_all();
        assert!(bed.manager.evictable(&bo));
        assert!(!vm.ready());
    }

    fn shadowed_buffer(resv: &Arc<Reservation>) -> (Arc<Buffer>, Arc<Buffer>) {
        let shadow = gtt_buffer(vec![0x2000], resv);
        let desc = BufferDesc {
            size: GPU_PAGE_SIZE,
            kind: BufferKind::Normal,
            preferred: MemDomains::VRAM,
            encrypted: false,
            residency: Residency::Gtt(vec![0x1000]),
        };
        (Buffer::with_shadow(desc, resv.clone(), shadow.clone()), shadow)
    }

    #[test]
    fn test_validate_covers_shadow() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let (bo, shadow) = shadowed_buffer(vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo.clone()));
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Evicted));

        let mut seen = Vec::new();
        g.validate_pt_bos(&mut |buffer: &Buffer| {
            seen.push(buffer.id());
            place_in_vram(buffer)
        })
        .unwrap();
        assert_eq!(seen, vec![bo.id(), shadow.id()]);
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Moved));
    }

    #[test]
    fn test_shadow_failure_keeps_binding_evicted() {
        let bed = TestBed::new();
        let vm = bed.vm();
        let (bo, shadow) = shadowed_buffer(vm.root_resv());
        let mut g = vm.reserve();
        let b = g.bo_add(Some(bo));

        let shadow_id = shadow.id();
        let mut failing = |buffer: &Buffer| -> Result<()> {
            if buffer.id() == shadow_id {
                return Err(Error::Backend(BackendError::Validate));
            }
            place_in_vram(buffer)
        };
        assert_eq!(
            g.validate_pt_bos(&mut failing),
            Err(Error::Backend(BackendError::Validate))
        );
        assert_eq!(vm.binding_status(b), Some(BindingStatus::Evicted));
        assert!(!vm.ready());
    }
}
