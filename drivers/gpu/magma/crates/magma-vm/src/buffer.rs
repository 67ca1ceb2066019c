//! # Buffer Objects
//!
//! The VM manager's view of a buffer: identity, reservation, preferred
//! placement and where the backing memory currently lives.
//!
//! Placement itself is decided elsewhere. When the owner moves a buffer it
//! updates the residency with [`Buffer::relocate`] and reports the move
//! through [`crate::VmManager::invalidate_buffer`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use magma_core::{BufferHandle, Reservation};

use crate::mapping::PteFlags;

/// Buffer identity
pub type BufferId = BufferHandle;

static NEXT_BUFFER: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Memory domains a buffer may live in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemDomains: u32 {
        /// CPU-only memory, not GPU visible
        const CPU = 1 << 0;
        /// System memory reachable through the GART
        const GTT = 1 << 1;
        /// Device-local memory
        const VRAM = 1 << 2;
    }
}

/// Kind of buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Client data
    Normal,
    /// Page directory or page table
    Table,
}

/// Contiguous run of device-local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VramBlock {
    /// Byte offset inside VRAM
    pub start: u64,
    /// Length in bytes
    pub size: u64,
}

/// Where the backing pages of a buffer live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    /// Device-local memory, possibly split into blocks
    Vram(Vec<VramBlock>),
    /// System memory: one DMA address per CPU page
    Gtt(Vec<u64>),
    /// Not GPU accessible
    Cpu,
}

impl Residency {
    /// Domain of this residency
    pub fn domain(&self) -> MemDomains {
        match self {
            Residency::Vram(_) => MemDomains::VRAM,
            Residency::Gtt(_) => MemDomains::GTT,
            Residency::Cpu => MemDomains::CPU,
        }
    }

    /// Address of the first byte as seen by the GPU's page walker
    pub fn base_address(&self, vram_base: u64) -> Option<u64> {
        match self {
            Residency::Vram(blocks) => blocks.first().map(|b| vram_base + b.start),
            Residency::Gtt(pages) => pages.first().copied(),
            Residency::Cpu => None,
        }
    }

    /// Base entry flags for pages of this residency
    ///
    /// Access bits are granted here and narrowed per mapping later.
    pub fn pte_flags(residency: Option<&Self>) -> PteFlags {
        let mut flags = PteFlags::EXECUTABLE | PteFlags::READABLE | PteFlags::WRITEABLE;
        match residency {
            Some(Residency::Vram(_)) => flags |= PteFlags::VALID,
            Some(Residency::Gtt(_)) => {
                flags |= PteFlags::VALID | PteFlags::SYSTEM | PteFlags::SNOOPED;
            }
            Some(Residency::Cpu) | None => {}
        }
        flags
    }
}

/// Description of a new buffer
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Kind
    pub kind: BufferKind,
    /// Domains the buffer should live in
    pub preferred: MemDomains,
    /// Contents are encrypted
    pub encrypted: bool,
    /// Initial residency
    pub residency: Residency,
}

/// A buffer object as tracked by the VM manager
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    size: u64,
    kind: BufferKind,
    preferred: MemDomains,
    encrypted: bool,
    resv: Arc<Reservation>,
    residency: spin::Mutex<Residency>,
    shadow: Option<Arc<Buffer>>,
}

impl Buffer {
    /// Create a buffer that shares `resv`
    ///
    /// Sharing the root reservation of an address space makes the buffer
    /// private to that address space.
    pub fn new(desc: BufferDesc, resv: Arc<Reservation>) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::new(NEXT_BUFFER.fetch_add(1, Ordering::Relaxed)),
            size: desc.size,
            kind: desc.kind,
            preferred: desc.preferred,
            encrypted: desc.encrypted,
            resv,
            residency: spin::Mutex::new(desc.residency),
            shadow: None,
        })
    }

    /// Create a buffer with a shadow copy validated alongside it
    pub fn with_shadow(desc: BufferDesc, resv: Arc<Reservation>, shadow: Arc<Buffer>) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::new(NEXT_BUFFER.fetch_add(1, Ordering::Relaxed)),
            size: desc.size,
            kind: desc.kind,
            preferred: desc.preferred,
            encrypted: desc.encrypted,
            resv,
            residency: spin::Mutex::new(desc.residency),
            shadow: Some(shadow),
        })
    }

    /// Buffer id
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Kind
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Preferred domains
    pub fn preferred(&self) -> MemDomains {
        self.preferred
    }

    /// Contents are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Reservation guarding the buffer
    pub fn resv(&self) -> &Arc<Reservation> {
        &self.resv
    }

    /// Shadow copy, if any
    pub fn shadow(&self) -> Option<&Arc<Buffer>> {
        self.shadow.as_ref()
    }

    /// Snapshot of the current residency
    pub fn residency(&self) -> Residency {
        self.residency.lock().clone()
    }

    /// Record that the backing memory moved
    pub fn relocate(&self, residency: Residency) {
        *self.residency.lock() = residency;
    }

    /// True if the buffer currently lives in one of its preferred domains
    pub fn in_preferred_domain(&self) -> bool {
        self.preferred.intersects(self.residency.lock().domain())
    }

    /// True if the buffer is guarded by `resv`
    pub fn shares_reservation(&self, resv: &Arc<Reservation>) -> bool {
        Arc::ptr_eq(&self.resv, resv)
    }
}
