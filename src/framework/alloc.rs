use std::collections::HashMap;
use std::sync::Arc;

use super::policy::MnAlloc;
use crate::config::Config;

/// Requests at or below this size round up to the nearest 64 bytes.
const ALLOC_SMALL_THRESH: u64 = 1024;

/// Requests at or below this size round up to the nearest 1024 bytes.
const ALLOC_MED_THRESH: u64 = 8192;

/// Every block starts with `[size: u64 | padding: u64]`; the address handed
/// to the caller points just past it.  The padding word is reserved for
/// future synchronization metadata.
pub const HEADER_SIZE: u64 = 16;

/// The thread-local half of the distributed bump allocator.
///
/// Size-preserving: freed blocks go onto size-class freelists and never
/// coalesce.  The remote half (reserving fresh bytes with a fetch-and-add
/// on a segment's bump counter) lives with the compute thread, which owns
/// the op path; this type only decides sizes and recycles blocks.
pub struct BumpAllocator {
    seg_size: u64,
    freelists: HashMap<u64, Vec<u64>>,
    /// "Really big" free blocks, as (size, block address) pairs.
    big_blocks: Vec<(u64, u64)>,
    /// Picks the segment the next fresh allocation is served from.
    pub policy: MnAlloc,
}

/// The slab class for a request, header included.
pub fn slab_class(size: u64) -> u64 {
    if size <= ALLOC_SMALL_THRESH {
        (size + 63) >> 6 << 6
    } else if size <= ALLOC_MED_THRESH {
        (size + 1023) >> 10 << 10
    } else {
        (size + 63) >> 6 << 6
    }
}

impl BumpAllocator {
    pub fn new(cfg: &Arc<Config>) -> Self {
        let mut freelists = HashMap::new();
        let mut class = 64;
        while class <= ALLOC_SMALL_THRESH {
            freelists.insert(class, Vec::new());
            class += 64;
        }
        class = 2048;
        while class <= ALLOC_MED_THRESH {
            freelists.insert(class, Vec::new());
            class += 1024;
        }
        Self {
            seg_size: cfg.seg_bytes(),
            freelists,
            big_blocks: Vec::new(),
            policy: MnAlloc::new(cfg),
        }
    }

    #[inline]
    pub fn seg_size(&self) -> u64 {
        self.seg_size
    }

    /// The size to reserve for `n` elements of `T`, header included.
    ///
    /// `size_of::<T>()` undercounts variable-sized objects; callers with
    /// trailing arrays must size them as element counts instead.
    pub fn compute_size<T>(&self, n: usize) -> u64 {
        slab_class((std::mem::size_of::<T>() * n) as u64 + HEADER_SIZE)
    }

    /// Satisfy a request from the freelists, if possible.  Returns the body
    /// address (past the header).
    pub fn try_allocate_local(&mut self, size: u64) -> Option<u64> {
        if size > ALLOC_MED_THRESH {
            // Best-fit over the big blocks: smallest one that still fits.
            let best = self
                .big_blocks
                .iter()
                .enumerate()
                .filter(|(_, (sz, _))| *sz >= size)
                .min_by_key(|(_, (sz, _))| *sz)
                .map(|(i, _)| i);
            if let Some(i) = best {
                let (_, addr) = self.big_blocks.remove(i);
                return Some(addr + HEADER_SIZE);
            }
            return None;
        }
        let freelist = self.freelists.entry(size).or_default();
        freelist.pop().map(|addr| addr + HEADER_SIZE)
    }

    /// Put a block back on the freelist for its class.  `size` is the
    /// allocation size stored in the block header, not `size_of::<T>()`.
    /// No remote operation happens; the block is only reusable by this
    /// thread.
    pub fn reclaim(&mut self, body_addr: u64, size: u64) {
        let class = slab_class(size);
        if class > ALLOC_MED_THRESH {
            self.big_blocks.push((class, body_addr - HEADER_SIZE));
        } else {
            self.freelists
                .entry(class)
                .or_default()
                .push(body_addr - HEADER_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_classes() {
        assert_eq!(slab_class(1), 64);
        assert_eq!(slab_class(64), 64);
        assert_eq!(slab_class(65), 128);
        assert_eq!(slab_class(1024), 1024);
        assert_eq!(slab_class(1025), 2048);
        assert_eq!(slab_class(8192), 8192);
        assert_eq!(slab_class(8193), 8256); // big blocks round to 64 again
    }

    #[test]
    fn slab_class_values_are_legal() {
        for req in [1u64, 63, 64, 100, 1000, 1024, 1025, 5000, 8192] {
            let class = slab_class(req);
            assert!(class >= req);
            if class <= 1024 {
                assert_eq!(class % 64, 0);
            } else if class <= 8192 {
                assert_eq!(class % 1024, 0);
            }
        }
    }
}
