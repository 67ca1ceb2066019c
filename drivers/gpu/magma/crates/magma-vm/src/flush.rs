//! # Submission-Side Flush
//!
//! Hardware VM ids and the per-job decision of which translation-related
//! commands a ring must emit before the job runs.
//!
//! ```text
//!   grab(vm, job)            pick a VMID, decide vm_needs_flush
//!   need_pipeline_sync(job)  must the ring drain before the flush
//!   flush(ring, job)         pipeline sync ─▶ VM flush ─▶ PASID remap
//!                            ─▶ SPM update ─▶ GDS switch ─▶ fence
//! ```
//!
//! VMID 0 belongs to the kernel and is never handed out.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use magma_core::{CompletionSignal, Error, Result};

use crate::vm::{GpuVm, VmId};

/// Maximum number of hardware VM ids per hub
pub const MAX_VMIDS: usize = 16;

/// Global data share window assigned to a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GdsWindow {
    /// GDS base
    pub gds_base: u32,
    /// GDS size
    pub gds_size: u32,
    /// GWS base
    pub gws_base: u32,
    /// GWS size
    pub gws_size: u32,
    /// OA base
    pub oa_base: u32,
    /// OA size
    pub oa_size: u32,
}

/// State of one hardware VM id
#[derive(Debug, Clone, Default)]
pub struct Vmid {
    owner: Option<VmId>,
    pd_addr: u64,
    flushed_tlb_seq: u64,
    last_flush: Option<CompletionSignal>,
    pasid: u32,
    pasid_mapping: Option<CompletionSignal>,
    reset_count: u64,
    gds: GdsWindow,
    lru: u64,
}

impl Vmid {
    /// Address space currently owning the id
    pub fn owner(&self) -> Option<VmId> {
        self.owner
    }

    /// TLB generation covered by the last flush
    pub fn flushed_tlb_seq(&self) -> u64 {
        self.flushed_tlb_seq
    }

    /// PASID the id is mapped to
    pub fn pasid(&self) -> u32 {
        self.pasid
    }
}

/// Translation state of a job about to be submitted
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// Assigned VM id, 0 for kernel jobs
    pub vmid: u32,
    /// PASID of the submitting address space
    pub pasid: u32,
    /// Root directory address, `None` if the job has no valid root
    pub vm_pd_addr: Option<u64>,
    /// The VM id must be flushed before the job runs
    pub vm_needs_flush: bool,
    /// The GDS window changed
    pub gds_switch_needed: bool,
    /// The SPM VMID must be reprogrammed
    pub spm_update_needed: bool,
    /// Requested GDS window
    pub gds: GdsWindow,
}

/// What a ring can emit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCaps {
    /// VM flush packets
    pub vm_flush: bool,
    /// GDS switch packets
    pub gds_switch: bool,
    /// Register writes, needed for PASID remapping
    pub wreg: bool,
    /// The memory hub supports PASID remapping
    pub pasid_mapping: bool,
    /// Compute ring that needs a pipeline sync on every VM job
    pub compute_vm_bug: bool,
    /// The RLC can reprogram the SPM VMID
    pub spm_vmid: bool,
    /// Switch-buffer packets
    pub switch_buffer: bool,
}

/// Command emission of one ring
pub trait RingEmitter {
    /// Capabilities
    fn caps(&self) -> RingCaps;
    /// Wait for all previous work on the ring
    fn emit_pipeline_sync(&mut self);
    /// Invalidate translations of `vmid` and load `pd_addr`
    fn emit_vm_flush(&mut self, vmid: u32, pd_addr: u64);
    /// Map `vmid` to `pasid`
    fn emit_pasid_mapping(&mut self, vmid: u32, pasid: u32);
    /// Point the SPM at `vmid`
    fn update_spm_vmid(&mut self, vmid: u32);
    /// Load the GDS window of `vmid`
    fn emit_gds_switch(&mut self, vmid: u32, gds: &GdsWindow);
    /// Emit a fence and return its signal
    fn emit_fence(&mut self) -> Result<CompletionSignal>;
    /// Emit a switch buffer
    fn emit_switch_buffer(&mut self) {}
}

bitflags! {
    /// Commands emitted by [`VmidManager::flush`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushActions: u32 {
        /// Pipeline sync
        const PIPELINE_SYNC = 1 << 0;
        /// VM flush
        const VM_FLUSH = 1 << 1;
        /// PASID remap
        const PASID_MAPPING = 1 << 2;
        /// SPM VMID update
        const SPM_UPDATE = 1 << 3;
        /// GDS switch
        const GDS_SWITCH = 1 << 4;
        /// Fence after the flush
        const FENCE = 1 << 5;
    }
}

struct VmidTable {
    ids: ArrayVec<Vmid, MAX_VMIDS>,
    clock: u64,
}

/// Hardware VM ids of one hub
pub struct VmidManager {
    table: spin::Mutex<VmidTable>,
    concurrent_flush: bool,
}

impl VmidManager {
    /// Create `num_ids` ids, clamped to `2..=MAX_VMIDS`
    pub fn new(num_ids: usize, concurrent_flush: bool, reset_count: u64) -> Self {
        let mut ids = ArrayVec::new();
        for _ in 0..num_ids.clamp(2, MAX_VMIDS) {
            ids.push(Vmid {
                reset_count,
                ..Vmid::default()
            });
        }
        Self {
            table: spin::Mutex::new(VmidTable { ids, clock: 0 }),
            concurrent_flush,
        }
    }

    /// Number of ids, the kernel id included
    pub fn len(&self) -> usize {
        self.table.lock().ids.len()
    }

    /// Always false; the kernel id exists
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Snapshot of an id
    pub fn get(&self, vmid: u32) -> Option<Vmid> {
        self.table.lock().ids.get(vmid as usize).cloned()
    }

    /// Assign a VM id to `job` on behalf of `vm`
    ///
    /// Reuses the id `vm` already owns, otherwise takes the least recently
    /// used one. Sets `job.vm_needs_flush` when the id holds stale
    /// translations for `vm`.
    pub fn grab(&self, vm: &GpuVm, job: &mut Job) -> Result<()> {
        let seq = vm.tlb_seq();
        let pd_addr = vm.pd_addr();

        let mut table = self.table.lock();
        table.clock += 1;
        let clock = table.clock;

        let own = table
            .ids
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, id)| id.owner == Some(vm.id()))
            .map(|(i, _)| i);

        let (slot, stolen) = match own {
            Some(i) => (i, false),
            None => {
                let lru = table
                    .ids
                    .iter()
                    .enumerate()
                    .skip(1)
                    .min_by_key(|(_, id)| id.lru)
                    .map(|(i, _)| i)
                    .ok_or(Error::ResourceExhausted)?;
                (lru, true)
            }
        };

        let concurrent_flush = self.concurrent_flush;
        let id = table.ids.get_mut(slot).ok_or(Error::ResourceExhausted)?;
        let needs_flush = stolen
            || id.pd_addr != pd_addr
            || id.flushed_tlb_seq != seq
            || match &id.last_flush {
                None => true,
                Some(f) => !f.is_signaled() && !concurrent_flush,
            };

        if needs_flush {
            id.last_flush = None;
        }
        job.gds_switch_needed = id.gds != job.gds;
        id.gds = job.gds;
        id.owner = Some(vm.id());
        id.pd_addr = pd_addr;
        id.flushed_tlb_seq = seq;
        id.lru = clock;

        job.vmid = slot as u32;
        job.pasid = vm.pasid();
        job.vm_pd_addr = Some(pd_addr);
        job.vm_needs_flush = needs_flush;
        job.spm_update_needed = stolen;

        log::trace!(
            "{:?}: vmid {} (flush {}, tlb seq {})",
            vm.id(),
            slot,
            needs_flush,
            seq
        );
        Ok(())
    }

    /// Forget every id owned by `vm`
    pub fn release(&self, vm: VmId) {
        let mut table = self.table.lock();
        for id in table.ids.iter_mut().filter(|id| id.owner == Some(vm)) {
            id.owner = None;
            id.last_flush = None;
        }
    }

    fn had_gpu_reset(&self, vmid: u32, reset_count: u64) -> bool {
        self.table
            .lock()
            .ids
            .get(vmid as usize)
            .map_or(false, |id| id.reset_count != reset_count)
    }

    /// True if the ring must drain before `job` runs
    pub fn need_pipeline_sync(&self, ring: &dyn RingEmitter, job: &Job, reset_count: u64) -> bool {
        if job.vmid == 0 {
            return false;
        }
        let caps = ring.caps();
        if job.vm_needs_flush || caps.compute_vm_bug {
            return true;
        }
        if caps.gds_switch && job.gds_switch_needed {
            return true;
        }
        self.had_gpu_reset(job.vmid, reset_count)
    }

    /// Emit the translation commands `job` needs
    ///
    /// Returns the emitted commands. A GPU reset since the id was last
    /// flushed forces every command.
    pub fn flush(
        &self,
        ring: &mut dyn RingEmitter,
        job: &Job,
        need_pipe_sync: bool,
        reset_count: u64,
    ) -> Result<FlushActions> {
        let caps = ring.caps();
        let id = self.get(job.vmid).ok_or(Error::InvalidArgument)?;

        let mut gds_switch = job.gds_switch_needed;
        let mut vm_flush = job.vm_needs_flush;
        let mut spm_update = job.spm_update_needed;
        let mut pasid_mapping = false;

        if id.reset_count != reset_count {
            gds_switch = true;
            vm_flush = true;
            pasid_mapping = true;
            spm_update = true;
        }
        if id.pasid != job.pasid || id.pasid_mapping.as_ref().map_or(true, |f| !f.is_signaled()) {
            pasid_mapping = true;
        }

        gds_switch &= caps.gds_switch;
        vm_flush &= caps.vm_flush && job.vm_pd_addr.is_some();
        pasid_mapping &= caps.pasid_mapping && caps.wreg;

        let mut actions = FlushActions::empty();
        if !vm_flush && !gds_switch && !need_pipe_sync {
            return Ok(actions);
        }

        if need_pipe_sync {
            ring.emit_pipeline_sync();
            actions |= FlushActions::PIPELINE_SYNC;
        }
        if let (true, Some(pd_addr)) = (vm_flush, job.vm_pd_addr) {
            ring.emit_vm_flush(job.vmid, pd_addr);
            actions |= FlushActions::VM_FLUSH;
        }
        if pasid_mapping {
            ring.emit_pasid_mapping(job.vmid, job.pasid);
            actions |= FlushActions::PASID_MAPPING;
        }
        if spm_update && caps.spm_vmid {
            ring.update_spm_vmid(job.vmid);
            actions |= FlushActions::SPM_UPDATE;
        }
        if gds_switch {
            ring.emit_gds_switch(job.vmid, &job.gds);
            actions |= FlushActions::GDS_SWITCH;
        }

        if vm_flush || pasid_mapping {
            let fence = ring.emit_fence()?;
            actions |= FlushActions::FENCE;

            let mut table = self.table.lock();
            if let Some(id) = table.ids.get_mut(job.vmid as usize) {
                if vm_flush {
                    id.last_flush = Some(fence.clone());
                    id.reset_count = reset_count;
                }
                if pasid_mapping {
                    id.pasid = job.pasid;
                    id.pasid_mapping = Some(fence);
                }
            }
        }

        if caps.switch_buffer {
            ring.emit_switch_buffer();
            ring.emit_switch_buffer();
        }
        Ok(actions)
    }
}

impl core::fmt::Debug for VmidManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmidManager")
            .field("ids", &self.len())
            .field("concurrent_flush", &self.concurrent_flush)
            .finish()
    }
}
