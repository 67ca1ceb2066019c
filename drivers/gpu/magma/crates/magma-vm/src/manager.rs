//! # VM Manager
//!
//! Device-wide state shared by every address space: configuration and
//! geometry, the PRT counter, the PASID registry, the buffer to binding
//! registry and the hardware VM ids.
//!
//! ```text
//!   ┌──────────────────────── VmManager ────────────────────────┐
//!   │  geometry   prt   vmids                                   │
//!   │  pasids:  pasid  ──▶ GpuVm                                │
//!   │  buffers: buffer ──▶ [(GpuVm, binding)]                   │
//!   └───────────────────────────────────────────────────────────┘
//!         │ create_vm            │ invalidate_buffer / evictable
//!         ▼                      ▼
//!      GpuVm ... GpuVm      external memory manager
//! ```

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use magma_core::{Error, FenceUsage, GpuAddr, Result};

use crate::binding::BindingId;
use crate::buffer::{Buffer, BufferId, BufferKind};
use crate::config::{FaultStop, VmGeometry, VmManagerConfig};
use crate::device::VmDevice;
use crate::flush::{FlushActions, Job, RingEmitter, VmidManager};
use crate::mapping::PteFlags;
use crate::prt::PrtTracker;
use crate::update::{PteSource, RangeUpdate};
use crate::vm::{GpuVm, TaskInfo, VmId};

/// One attachment of a buffer
#[derive(Clone)]
struct BindingLink {
    vm: Weak<GpuVm>,
    vm_id: VmId,
    binding: BindingId,
    has_parent: bool,
}

/// Device-wide VM state
pub struct VmManager {
    device: Arc<dyn VmDevice>,
    config: VmManagerConfig,
    geometry: VmGeometry,
    prt: Arc<PrtTracker>,
    pasids: spin::Mutex<HashMap<u32, Weak<GpuVm>>>,
    buffers: spin::Mutex<HashMap<BufferId, Vec<BindingLink>>>,
    vmids: VmidManager,
    next_vm: AtomicU64,
}

impl VmManager {
    /// Create the manager of `device`
    pub fn new(device: Arc<dyn VmDevice>, config: VmManagerConfig) -> Result<Arc<Self>> {
        let geometry = config.adjust_size()?;
        let vmids = VmidManager::new(
            config.num_vmids,
            config.concurrent_flush,
            device.gpu_reset_count(),
        );

        Ok(Arc::new(Self {
            prt: Arc::new(PrtTracker::new(device.clone())),
            device,
            config,
            geometry,
            pasids: spin::Mutex::new(HashMap::new()),
            buffers: spin::Mutex::new(HashMap::new()),
            vmids,
            next_vm: AtomicU64::new(1),
        }))
    }

    /// Tear down; every address space should be gone by now
    pub fn fini(&self) {
        let pasids = self.pasids.lock();
        if !pasids.is_empty() {
            log::warn!("{} PASIDs still registered at teardown", pasids.len());
        }
    }

    /// Device hooks
    pub fn device(&self) -> &Arc<dyn VmDevice> {
        &self.device
    }

    /// Configuration
    pub fn config(&self) -> &VmManagerConfig {
        &self.config
    }

    /// Derived page-table geometry
    pub fn geometry(&self) -> &VmGeometry {
        &self.geometry
    }

    /// PRT counter
    pub fn prt(&self) -> &Arc<PrtTracker> {
        &self.prt
    }

    /// Hardware VM ids
    pub fn vmids(&self) -> &VmidManager {
        &self.vmids
    }

    // =========================================================================
    // ADDRESS SPACES
    // =========================================================================

    /// Create an address space with a cleared root directory
    pub fn create_vm(self: &Arc<Self>) -> Result<Arc<GpuVm>> {
        if self.device.is_unplugged() {
            return Err(Error::DeviceGone);
        }
        let id = VmId::new(self.next_vm.fetch_add(1, Ordering::Relaxed));
        GpuVm::create(self, id)
    }

    /// Bind `pasid` to `vm`; 0 unbinds
    ///
    /// Fails with [`Error::Conflict`] if another live address space holds
    /// `pasid`.
    pub fn set_pasid(&self, vm: &GpuVm, pasid: u32) -> Result<()> {
        let mut pasids = self.pasids.lock();

        if pasid != 0 {
            if let Some(other) = pasids.get(&pasid).and_then(Weak::upgrade) {
                if other.id() != vm.id() {
                    return Err(Error::Conflict);
                }
            }
        }

        let old = vm.pasid();
        if old == pasid {
            return Ok(());
        }
        if old != 0 {
            pasids.remove(&old);
        }
        if pasid != 0 {
            pasids.insert(pasid, vm.weak());
        }
        vm.store_pasid(pasid);
        Ok(())
    }

    /// Address space bound to `pasid` and whether it is a compute context
    pub fn lookup_pasid(&self, pasid: u32) -> Option<(Arc<GpuVm>, bool)> {
        let vm = self.pasids.lock().get(&pasid).and_then(Weak::upgrade)?;
        let compute = vm.is_compute();
        Some((vm, compute))
    }

    /// Process owning the address space bound to `pasid`
    pub fn task_info(&self, pasid: u32) -> Option<TaskInfo> {
        self.lookup_pasid(pasid).map(|(vm, _)| vm.task_info())
    }

    // =========================================================================
    // BUFFER REGISTRY
    // =========================================================================

    pub(crate) fn link(&self, buffer: BufferId, vm: &GpuVm, binding: BindingId, has_parent: bool) {
        self.buffers.lock().entry(buffer).or_default().push(BindingLink {
            vm: vm.weak(),
            vm_id: vm.id(),
            binding,
            has_parent,
        });
    }

    pub(crate) fn unlink(&self, buffer: BufferId, vm: VmId, binding: BindingId) {
        let mut buffers = self.buffers.lock();
        if let Some(links) = buffers.get_mut(&buffer) {
            links.retain(|l| !(l.vm_id == vm && l.binding == binding));
            if links.is_empty() {
                buffers.remove(&buffer);
            }
        }
    }

    pub(crate) fn find_binding(&self, buffer: BufferId, vm: VmId) -> Option<BindingId> {
        self.buffers
            .lock()
            .get(&buffer)?
            .iter()
            .find(|l| l.vm_id == vm)
            .map(|l| l.binding)
    }

    fn links(&self, buffer: BufferId) -> Vec<BindingLink> {
        self.buffers.lock().get(&buffer).cloned().unwrap_or_default()
    }

    /// The backing memory of `buffer` moved
    ///
    /// With `evicted`, bindings private to an address space are queued for
    /// validation. Everything else is queued for an entry rewrite.
    pub fn invalidate_buffer(&self, buffer: &Buffer, evicted: bool) {
        let is_table = buffer.kind() == BufferKind::Table;

        for link in self.links(buffer.id()) {
            let Some(vm) = link.vm.upgrade() else {
                continue;
            };
            let per_vm = buffer.shares_reservation(vm.root_resv());
            let mut status = vm.status.lock();
            if status.status(link.binding).is_none() {
                continue;
            }

            if evicted && per_vm {
                status.evicted(link.binding, is_table);
                continue;
            }
            if status.moved(link.binding) {
                continue;
            }
            status.set_moved(link.binding, true);

            if is_table {
                status.relocated(link.binding, link.has_parent);
            } else if per_vm {
                status.moved_state(link.binding);
            } else {
                status.invalidated(link.binding);
            }
        }
    }

    /// Try to start evicting `buffer`
    ///
    /// Returns false while the owning address space still uses the buffer.
    /// On success the address space is marked evicting until its next
    /// validation pass.
    pub fn evictable(&self, buffer: &Buffer) -> bool {
        let Some(vm) = self
            .links(buffer.id())
            .into_iter()
            .find_map(|l| l.vm.upgrade())
        else {
            return true;
        };

        if !buffer.resv().test_signaled(FenceUsage::Bookkeep) {
            return false;
        }
        let Some(mut evicting) = vm.evicting.try_lock() else {
            return false;
        };
        if !vm.last_unlocked().is_signaled() {
            return false;
        }
        *evicting = true;
        true
    }

    // =========================================================================
    // FAULTS
    // =========================================================================

    /// Repair a GPU page fault
    ///
    /// Installs a single entry at the faulting page according to the fault
    /// policy. Returns true only if the fault was resolved, which happens
    /// when the SVM layer restores the pages of a compute context.
    pub fn handle_fault(&self, pasid: u32, addr: GpuAddr, write_fault: bool) -> bool {
        let pfn = addr.pfn();
        let Some((vm, compute)) = self.lookup_pasid(pasid) else {
            return false;
        };

        if compute && self.device.restore_svm_pages(pasid, pfn, write_fault) {
            return true;
        }

        let mut guard = vm.reserve();
        match self.lookup_pasid(pasid) {
            Some((current, _)) if Arc::ptr_eq(&current, &vm) => {}
            _ => return false,
        }

        let (flags, value) = if compute {
            (PteFlags::SNOOPED | PteFlags::PRT, 0)
        } else if self.config.fault_stop == FaultStop::Never {
            (
                PteFlags::VALID
                    | PteFlags::SNOOPED
                    | PteFlags::SYSTEM
                    | PteFlags::EXECUTABLE
                    | PteFlags::READABLE
                    | PteFlags::WRITEABLE,
                self.device.dummy_page_addr(),
            )
        } else {
            (PteFlags::VALID | PteFlags::SNOOPED | PteFlags::SYSTEM, 0)
        };

        let result = guard
            .update_range(RangeUpdate {
                immediate: true,
                offset: value,
                source: PteSource::Linear,
                ..RangeUpdate::new(pfn, pfn, flags)
            })
            .and_then(|_| guard.update_pdes(true));

        if let Err(e) = result {
            log::error!("can't handle page fault at {} (pasid {}): {}", addr, pasid, e);
        }
        false
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    /// Assign a VM id to `job`
    pub fn grab_vmid(&self, vm: &GpuVm, job: &mut Job) -> Result<()> {
        self.vmids.grab(vm, job)
    }

    /// True if `ring` must drain before `job` runs
    pub fn need_pipeline_sync(&self, ring: &dyn RingEmitter, job: &Job) -> bool {
        self.vmids
            .need_pipeline_sync(ring, job, self.device.gpu_reset_count())
    }

    /// Emit the translation commands `job` needs on `ring`
    pub fn flush(&self, ring: &mut dyn RingEmitter, job: &Job, need_pipe_sync: bool) -> Result<FlushActions> {
        if self.device.is_unplugged() {
            return Err(Error::DeviceGone);
        }
        self.vmids
            .flush(ring, job, need_pipe_sync, self.device.gpu_reset_count())
    }
}

impl core::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmManager")
            .field("geometry", &self.geometry)
            .field("prt", &self.prt)
            .field("vmids", &self.vmids)
            .finish()
    }
}
