//! # Resource Cursor
//!
//! Walks the physical backing of a buffer in contiguous runs.

use magma_core::GPU_PAGE_SHIFT;

use crate::buffer::VramBlock;

/// Position inside a buffer's backing memory
///
/// Without a block list the cursor walks a single linear range.
#[derive(Debug, Clone)]
pub struct ResCursor<'a> {
    blocks: &'a [VramBlock],
    block: usize,
    /// Physical start of the current run
    pub start: u64,
    /// Bytes left in the current run
    pub size: u64,
    /// Bytes left overall
    pub remaining: u64,
}

impl<'a> ResCursor<'a> {
    /// Position at byte `start` of the resource, covering `size` bytes
    pub fn first(blocks: Option<&'a [VramBlock]>, start: u64, size: u64) -> Self {
        let blocks = match blocks {
            Some(blocks) if !blocks.is_empty() => blocks,
            _ => {
                return Self {
                    blocks: &[],
                    block: 0,
                    start,
                    size,
                    remaining: size,
                }
            }
        };

        let mut offset = start;
        let mut block = 0;
        while block + 1 < blocks.len() && offset >= blocks[block].size {
            offset -= blocks[block].size;
            block += 1;
        }

        let cur = blocks[block];
        Self {
            blocks,
            block,
            start: cur.start + offset,
            size: cur.size.saturating_sub(offset).min(size),
            remaining: size,
        }
    }

    /// Consume `size` bytes of the current run
    pub fn next(&mut self, size: u64) {
        self.remaining = self.remaining.saturating_sub(size);
        if self.remaining == 0 {
            self.size = 0;
            return;
        }

        self.size = self.size.saturating_sub(size);
        if self.size != 0 {
            self.start += size;
            return;
        }

        self.block += 1;
        match self.blocks.get(self.block) {
            Some(b) => {
                self.start = b.start;
                self.size = b.size.min(self.remaining);
            }
            None => {
                self.start += size;
                self.size = self.remaining;
            }
        }
    }
}

/// Resolve a scatter-list address to the DMA address the GPU should use
///
/// `pages` holds one DMA address per CPU page. `addr` is a byte offset into
/// the buffer. Returns `None` past the end of the list.
pub fn map_gart(pages: &[u64], addr: u64, cpu_page_shift: u32) -> Option<u64> {
    let page = pages.get((addr >> cpu_page_shift) as usize)?;
    let within = addr & ((1u64 << cpu_page_shift) - 1);
    Some((page | within) & !((1u64 << GPU_PAGE_SHIFT) - 1))
}
