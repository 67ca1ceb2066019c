//! # Mappings
//!
//! Page-table entry flags and the mapping record: a page range of an
//! address space pointing at an offset inside a buffer.

use bitflags::bitflags;
use magma_core::{Handle, GPU_PAGE_SHIFT};

use crate::binding::BindingId;

bitflags! {
    /// Page-table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PteFlags: u64 {
        /// Entry is valid
        const VALID = 1 << 0;
        /// Target is system memory
        const SYSTEM = 1 << 1;
        /// Accesses snoop CPU caches
        const SNOOPED = 1 << 2;
        /// Target is encrypted
        const TMZ = 1 << 3;
        /// Executable
        const EXECUTABLE = 1 << 4;
        /// Readable
        const READABLE = 1 << 5;
        /// Writeable
        const WRITEABLE = 1 << 6;
        /// Fragment size field
        const FRAGMENT = 0x1f << 7;
        /// Partially resident: unbacked accesses return zero
        const PRT = 1 << 51;
        /// Entry points at a page table rather than a page
        const PDE_PTE = 1 << 54;

        /// Unmapped value when ATS routes the access to the IOMMU
        const DEFAULT_ATC = Self::SYSTEM.bits()
            | Self::SNOOPED.bits()
            | Self::EXECUTABLE.bits()
            | Self::READABLE.bits()
            | Self::WRITEABLE.bits();
    }
}

impl PteFlags {
    /// Set the fragment field to `2^frag` pages
    pub fn with_fragment(self, frag: u32) -> Self {
        let bits = (u64::from(frag) & 0x1f) << 7;
        self.difference(Self::FRAGMENT) | Self::from_bits_retain(bits)
    }

    /// Fragment field value
    pub fn fragment(self) -> u32 {
        ((self.bits() >> 7) & 0x1f) as u32
    }
}

/// Marker for mapping handles
pub struct MappingMarker;

/// Handle to a mapping record
pub type MappingId = Handle<MappingMarker>;

/// One page range mapped onto a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// First GPU page
    pub start: u64,
    /// Last GPU page, inclusive
    pub last: u64,
    /// Byte offset into the buffer
    pub offset: u64,
    /// Requested flags
    pub flags: PteFlags,
    /// Owning binding while live, `None` once detached
    pub binding: Option<BindingId>,
}

impl Mapping {
    /// Number of GPU pages covered
    pub fn num_pages(&self) -> u64 {
        self.last - self.start + 1
    }

    /// First byte address
    pub fn start_addr(&self) -> u64 {
        self.start << GPU_PAGE_SHIFT
    }

    /// True for partially-resident mappings
    pub fn is_prt(&self) -> bool {
        self.flags.contains(PteFlags::PRT)
    }
}
