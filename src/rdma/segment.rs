use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::AtomicU64;

use log::{debug, info};
use rdma_sys::*;

use super::HUGE_PAGES_AVAILABLE;
use crate::fatal;
use crate::{RmemError, RmemResult};

/// Segments are mapped at or above this address, so small fixed mappings
/// made by the loader and allocator are never in the way.
const MIN_MAP_ADDR: u64 = 1 << 35;

const DEFAULT_ACCESS: u32 = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
    | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0;

/// The first 64 bytes of every segment.
///
/// `allocated` is the bump counter remote fetch-and-adds reserve from;
/// `control_flag` counts compute-thread shutdowns; `barrier` and `root` are
/// only meaningful in segment 0 of memory node 0.
#[repr(C, align(64))]
pub struct ControlBlock {
    pub size: u64,
    pub allocated: AtomicU64,
    pub control_flag: AtomicU64,
    pub barrier: AtomicU64,
    pub root: AtomicU64,
    _reserved: [u64; 3],
}

pub const CONTROL_BLOCK_SIZE: u64 = std::mem::size_of::<ControlBlock>() as u64;
pub const ALLOCATED_OFFSET: u64 = std::mem::offset_of!(ControlBlock, allocated) as u64;
pub const CONTROL_FLAG_OFFSET: u64 = std::mem::offset_of!(ControlBlock, control_flag) as u64;
pub const BARRIER_OFFSET: u64 = std::mem::offset_of!(ControlBlock, barrier) as u64;
pub const ROOT_OFFSET: u64 = std::mem::offset_of!(ControlBlock, root) as u64;

impl ControlBlock {
    /// Place-initialize a control block at the start of a segment.
    ///
    /// `allocated` starts past the block itself so bump allocations can
    /// never hand out the header.
    pub unsafe fn init_at(base: *mut u8, size: u64) {
        let cb = base as *mut ControlBlock;
        (*cb).size = size;
        (*cb).allocated = AtomicU64::new(CONTROL_BLOCK_SIZE);
        (*cb).control_flag = AtomicU64::new(0);
        (*cb).barrier = AtomicU64::new(0);
        (*cb).root = AtomicU64::new(0);
        (*cb)._reserved = [0; 3];
    }

    pub unsafe fn at<'a>(base: *mut u8) -> &'a ControlBlock {
        &*(base as *const ControlBlock)
    }
}

/// Scan /proc/self/maps for an unmapped, `len`-aligned window of `len`
/// bytes at or above `min_addr`.  `len` must be a nonzero power of two.
///
/// The result is raced against any intervening mmap; the caller closes the
/// window by mapping with MAP_FIXED_NOREPLACE immediately.
pub fn find_mmap_location(min_addr: u64, len: u64) -> Option<u64> {
    if len == 0 || len & (len - 1) != 0 {
        fatal!("segment length 0x{:x} is not a power of 2", len);
    }
    let roundup = |v: u64| (v + len - 1) & !(len - 1);

    let mut addr = roundup(min_addr);
    let file = File::open("/proc/self/maps").ok()?;
    for line in BufReader::new(file).lines() {
        let line = line.ok()?;
        // Lines are sorted and non-overlapping: "lower-upper perms ..."
        let mut bounds = line.split(&['-', ' '][..]);
        let lower = u64::from_str_radix(bounds.next()?, 16).ok()?;
        let upper = u64::from_str_radix(bounds.next()?, 16).ok()?;
        if addr + len <= lower {
            break;
        }
        if addr < upper {
            addr = roundup(upper);
        }
    }

    // The address space is exhausted if the window wrapped.
    if addr.checked_add(len).is_none() {
        return None;
    }
    Some(addr)
}

/// A contiguous region of remotely-accessible memory.
///
/// Capacity is a power of two and the mapping is aligned to it.  The
/// interface is deliberately raw; anything richer (an allocator, a control
/// block) is layered on by the owner.
pub struct Segment {
    capacity: u64,
    raw: *mut u8,
    from_huge: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn new(capacity: u64) -> RmemResult<Self> {
        let hint = match find_mmap_location(MIN_MAP_ADDR, capacity) {
            Some(a) => a,
            None => {
                fatal!("no aligned window for a 0x{:x}-byte segment", capacity);
            }
        };

        let from_huge = *HUGE_PAGES_AVAILABLE;
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        if from_huge {
            flags |= libc::MAP_HUGETLB;
        }
        let raw = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                capacity as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            debug!("mmap failed at 0x{:x}: {}", hint, errno::errno());
            return Err(RmemError::RmemSegmentError);
        }

        Ok(Self {
            capacity,
            raw: raw as *mut u8,
            from_huge,
        })
    }

    #[inline]
    pub fn raw(&self) -> *mut u8 {
        self.raw
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Register with a protection domain so the RNIC can address this
    /// memory.  The returned region deregisters on drop and must not
    /// outlive the segment.
    pub fn register_with_pd(&self, pd: *mut ibv_pd) -> RmemResult<MemoryRegion> {
        if pd.is_null() {
            fatal!("cannot register segment with null PD");
        }
        let access = if self.from_huge {
            DEFAULT_ACCESS | ibv_access_flags::IBV_ACCESS_HUGETLB.0
        } else {
            DEFAULT_ACCESS
        };
        let mr = unsafe {
            ibv_reg_mr(
                pd,
                self.raw as *mut libc::c_void,
                self.capacity as usize,
                access as i32,
            )
        };
        if mr.is_null() {
            fatal!("ibv_reg_mr: {}", errno::errno());
        }
        info!(
            "registered region 0x{:x} (length=0x{:x}) ({} pages)",
            self.raw as usize,
            self.capacity,
            if self.from_huge { "2MB" } else { "4KB" }
        );
        Ok(MemoryRegion { mr })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.raw as *mut libc::c_void, self.capacity as usize);
        }
    }
}

/// An ibv_mr handle.  Deregisters on drop.
pub struct MemoryRegion {
    mr: *mut ibv_mr,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_mr {
        self.mr
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn control_block_layout() {
        assert_eq!(CONTROL_BLOCK_SIZE, 64);
        assert_eq!(std::mem::align_of::<ControlBlock>(), 64);
        assert_eq!(std::mem::offset_of!(ControlBlock, size), 0);
        assert_eq!(ALLOCATED_OFFSET, 8);
        assert_eq!(CONTROL_FLAG_OFFSET, 16);
        assert_eq!(BARRIER_OFFSET, 24);
        assert_eq!(ROOT_OFFSET, 32);
    }

    #[test]
    fn control_block_init() {
        let mut backing = [0u8; 128];
        let base = {
            // control blocks sit at segment starts, which are 64-aligned
            let addr = backing.as_mut_ptr() as usize;
            ((addr + 63) & !63) as *mut u8
        };
        unsafe {
            ControlBlock::init_at(base, 1 << 20);
            let cb = ControlBlock::at(base);
            assert_eq!(cb.size, 1 << 20);
            assert_eq!(cb.allocated.load(Ordering::Relaxed), 64);
            assert_eq!(cb.control_flag.load(Ordering::Relaxed), 0);
            assert_eq!(cb.barrier.load(Ordering::Relaxed), 0);
            assert_eq!(cb.root.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn find_location_is_aligned_and_clear() {
        let len = 1 << 20;
        let addr = find_mmap_location(MIN_MAP_ADDR, len).unwrap();
        assert_eq!(addr % len, 0);
        assert!(addr >= MIN_MAP_ADDR);
    }

    #[test]
    fn segment_is_size_aligned() {
        let seg = Segment::new(1 << 20).unwrap();
        assert_eq!(seg.capacity(), 1 << 20);
        assert_eq!(seg.raw() as u64 % seg.capacity(), 0);
        // The mapping is usable memory.
        unsafe {
            std::ptr::write_bytes(seg.raw(), 0xab, 4096);
            assert_eq!(*seg.raw(), 0xab);
        }
    }

    #[test]
    fn segments_do_not_overlap() {
        let a = Segment::new(1 << 20).unwrap();
        let b = Segment::new(1 << 20).unwrap();
        let (lo, hi) = if a.raw() < b.raw() { (&a, &b) } else { (&b, &a) };
        assert!(unsafe { lo.raw().add(lo.capacity() as usize) } <= hi.raw());
    }
}
