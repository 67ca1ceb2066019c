//! Test doubles: a device, a recording update backend and a ring.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use magma_core::{BackendError, CompletionSignal, Error, Reservation, Result, GPU_PAGE_SIZE};

use crate::backend::{SyncMode, UpdateBackend, UpdateParams};
use crate::buffer::{Buffer, BufferDesc, BufferKind, MemDomains, Residency, VramBlock};
use crate::config::{UpdateMode, VmManagerConfig};
use crate::device::VmDevice;
use crate::flush::{GdsWindow, RingCaps, RingEmitter};
use crate::manager::VmManager;
use crate::mapping::PteFlags;
use crate::pt::{Level, PageTable, TableId};
use crate::vm::GpuVm;

static NEXT_VRAM: AtomicU64 = AtomicU64::new(0x1_0000_0000);

fn alloc_vram(size: u64) -> VramBlock {
    let size = size.next_multiple_of(GPU_PAGE_SIZE);
    VramBlock {
        start: NEXT_VRAM.fetch_add(size, Ordering::Relaxed),
        size,
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// One call seen by the recording backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    MapTable {
        table: TableId,
    },
    Prepare {
        sync: SyncMode,
        has_resv: bool,
    },
    Update {
        table: TableId,
        level: Level,
        first: u32,
        addr: u64,
        count: u32,
        incr: u64,
        flags: PteFlags,
        scattered: bool,
    },
    Commit,
}

#[derive(Default)]
struct LogInner {
    ops: Vec<BackendOp>,
    pending: Vec<CompletionSignal>,
    manual: bool,
    fail: Option<BackendError>,
}

/// Shared log of every backend created by one device
#[derive(Clone, Default)]
pub struct BackendLog {
    inner: Arc<spin::Mutex<LogInner>>,
}

impl BackendLog {
    pub fn ops(&self) -> Vec<BackendOp> {
        self.inner.lock().ops.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().ops.clear();
    }

    /// Commits return pending signals until `signal_all`
    pub fn set_manual(&self, manual: bool) {
        self.inner.lock().manual = manual;
    }

    /// Fail the next call of the given phase
    pub fn fail_next(&self, phase: BackendError) {
        self.inner.lock().fail = Some(phase);
    }

    pub fn signal_all(&self) {
        let pending = core::mem::take(&mut self.inner.lock().pending);
        for signal in pending {
            signal.signal();
        }
    }

    fn record(&self, phase: BackendError, op: BackendOp) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail == Some(phase) {
            inner.fail = None;
            return Err(Error::Backend(phase));
        }
        inner.ops.push(op);
        Ok(())
    }
}

/// Backend that records every call and writes nothing
pub struct RecordingBackend {
    log: BackendLog,
}

impl UpdateBackend for RecordingBackend {
    fn map_table(&mut self, table: &PageTable) -> Result<()> {
        self.log
            .record(BackendError::MapTable, BackendOp::MapTable { table: table.id() })
    }

    fn prepare(&mut self, _params: &UpdateParams<'_>, resv: Option<&Reservation>, sync: SyncMode) -> Result<()> {
        self.log.record(
            BackendError::Prepare,
            BackendOp::Prepare {
                sync,
                has_resv: resv.is_some(),
            },
        )
    }

    fn update(
        &mut self,
        params: &UpdateParams<'_>,
        table: &PageTable,
        first: u32,
        addr: u64,
        count: u32,
        incr: u64,
        flags: PteFlags,
    ) -> Result<()> {
        self.log.record(
            BackendError::Update,
            BackendOp::Update {
                table: table.id(),
                level: table.level(),
                first,
                addr,
                count,
                incr,
                flags,
                scattered: params.pages_addr.is_some(),
            },
        )
    }

    fn commit(&mut self, _params: &UpdateParams<'_>) -> Result<CompletionSignal> {
        self.log.record(BackendError::Commit, BackendOp::Commit)?;
        let mut inner = self.log.inner.lock();
        if inner.manual {
            let signal = CompletionSignal::new();
            inner.pending.push(signal.clone());
            Ok(signal)
        } else {
            Ok(CompletionSignal::signaled())
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

pub struct MockDevice {
    prt: bool,
    prt_enabled: AtomicBool,
    prt_toggles: AtomicU32,
    clock: AtomicU64,
    unplugged: AtomicBool,
    full_tlb_flush: AtomicBool,
    svm_restore: AtomicBool,
    reset_count: AtomicU64,
    pub log: BackendLog,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            prt: true,
            prt_enabled: AtomicBool::new(false),
            prt_toggles: AtomicU32::new(0),
            clock: AtomicU64::new(0),
            unplugged: AtomicBool::new(false),
            full_tlb_flush: AtomicBool::new(false),
            svm_restore: AtomicBool::new(false),
            reset_count: AtomicU64::new(0),
            log: BackendLog::default(),
        }
    }

    pub fn without_prt() -> Self {
        Self {
            prt: false,
            ..Self::new()
        }
    }

    pub fn prt_enabled(&self) -> bool {
        self.prt_enabled.load(Ordering::Acquire)
    }

    pub fn prt_toggles(&self) -> u32 {
        self.prt_toggles.load(Ordering::Acquire)
    }

    pub fn set_unplugged(&self, unplugged: bool) {
        self.unplugged.store(unplugged, Ordering::Release);
    }

    pub fn set_full_tlb_flush(&self, enable: bool) {
        self.full_tlb_flush.store(enable, Ordering::Release);
    }

    pub fn set_svm_restore(&self, enable: bool) {
        self.svm_restore.store(enable, Ordering::Release);
    }

    pub fn gpu_reset(&self) {
        self.reset_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl VmDevice for MockDevice {
    fn is_unplugged(&self) -> bool {
        self.unplugged.load(Ordering::Acquire)
    }

    fn now_ns(&self) -> u64 {
        self.clock.fetch_add(100, Ordering::AcqRel)
    }

    fn supports_prt(&self) -> bool {
        self.prt
    }

    fn set_prt(&self, enable: bool) {
        self.prt_enabled.store(enable, Ordering::Release);
        self.prt_toggles.fetch_add(1, Ordering::AcqRel);
    }

    fn dummy_page_addr(&self) -> u64 {
        0xdead_0000
    }

    fn table_resource(&self, size: u64) -> Result<Residency> {
        Ok(Residency::Vram(vec![alloc_vram(size)]))
    }

    fn update_backend(&self, _mode: UpdateMode) -> Box<dyn UpdateBackend> {
        Box::new(RecordingBackend {
            log: self.log.clone(),
        })
    }

    fn needs_full_tlb_flush(&self) -> bool {
        self.full_tlb_flush.load(Ordering::Acquire)
    }

    fn gpu_reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::Acquire)
    }

    fn restore_svm_pages(&self, _pasid: u32, _pfn: u64, _write_fault: bool) -> bool {
        self.svm_restore.load(Ordering::Acquire)
    }
}

// =============================================================================
// BUFFERS
// =============================================================================

/// Buffer resident in VRAM
pub fn vram_buffer(size: u64, resv: &Arc<Reservation>) -> Arc<Buffer> {
    Buffer::new(
        BufferDesc {
            size,
            kind: BufferKind::Normal,
            preferred: MemDomains::VRAM,
            encrypted: false,
            residency: Residency::Vram(vec![alloc_vram(size)]),
        },
        resv.clone(),
    )
}

/// Buffer that prefers VRAM but lives in system memory
pub fn gtt_buffer(pages: Vec<u64>, resv: &Arc<Reservation>) -> Arc<Buffer> {
    Buffer::new(
        BufferDesc {
            size: pages.len() as u64 * GPU_PAGE_SIZE,
            kind: BufferKind::Normal,
            preferred: MemDomains::VRAM,
            encrypted: false,
            residency: Residency::Gtt(pages),
        },
        resv.clone(),
    )
}

/// Validator moving every buffer into VRAM
pub fn place_in_vram(buffer: &Buffer) -> Result<()> {
    if !buffer.in_preferred_domain() {
        buffer.relocate(Residency::Vram(vec![alloc_vram(buffer.size())]));
    }
    Ok(())
}

// =============================================================================
// TEST BED
// =============================================================================

pub struct TestBed {
    pub device: Arc<MockDevice>,
    pub manager: Arc<VmManager>,
    pub backend: BackendLog,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(f: impl FnOnce(&mut VmManagerConfig)) -> Self {
        let mut config = VmManagerConfig::four_level();
        f(&mut config);
        let device = Arc::new(MockDevice::new());
        let backend = device.log.clone();
        let manager = VmManager::new(device.clone(), config).unwrap();
        Self {
            device,
            manager,
            backend,
        }
    }

    /// Commits stay pending until `backend.signal_all()`
    pub fn with_manual_signals() -> Self {
        let bed = Self::new();
        bed.backend.set_manual(true);
        bed
    }

    pub fn vm(&self) -> Arc<GpuVm> {
        self.manager.create_vm().unwrap()
    }
}

// =============================================================================
// RING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingOp {
    PipelineSync,
    VmFlush(u32, u64),
    PasidMapping(u32, u32),
    SpmVmid(u32),
    GdsSwitch(u32),
    Fence,
    SwitchBuffer,
}

pub struct MockRing {
    caps: RingCaps,
    ops: Vec<RingOp>,
    manual_fences: bool,
}

impl MockRing {
    pub fn new(caps: RingCaps) -> Self {
        Self {
            caps,
            ops: Vec::new(),
            manual_fences: false,
        }
    }

    pub fn set_manual_fences(&mut self, manual: bool) {
        self.manual_fences = manual;
    }

    pub fn ops(&self) -> Vec<RingOp> {
        self.ops.clone()
    }
}

impl RingEmitter for MockRing {
    fn caps(&self) -> RingCaps {
        self.caps
    }

    fn emit_pipeline_sync(&mut self) {
        self.ops.push(RingOp::PipelineSync);
    }

    fn emit_vm_flush(&mut self, vmid: u32, pd_addr: u64) {
        self.ops.push(RingOp::VmFlush(vmid, pd_addr));
    }

    fn emit_pasid_mapping(&mut self, vmid: u32, pasid: u32) {
        self.ops.push(RingOp::PasidMapping(vmid, pasid));
    }

    fn update_spm_vmid(&mut self, vmid: u32) {
        self.ops.push(RingOp::SpmVmid(vmid));
    }

    fn emit_gds_switch(&mut self, vmid: u32, _gds: &GdsWindow) {
        self.ops.push(RingOp::GdsSwitch(vmid));
    }

    fn emit_fence(&mut self) -> Result<CompletionSignal> {
        self.ops.push(RingOp::Fence);
        Ok(if self.manual_fences {
            CompletionSignal::new()
        } else {
            CompletionSignal::signaled()
        })
    }

    fn emit_switch_buffer(&mut self) {
        self.ops.push(RingOp::SwitchBuffer);
    }
}
