//! Locked, bus-visible host memory.
//!
//! The 6205 bus-masters into host memory for the interface buffer, stream
//! rings, the control cache and the async event ring. [`LockedMemory`] is
//! the allocator seam; [`DmaBuffer`] is a cloneable handle to one block that
//! is released when the last handle drops.
//!
//! [`PinnedMemory`] is the host implementation: page aligned, zeroed,
//! optionally `mlock`ed, with 32-bit bus addresses handed out from a base.
//! It keeps a registry so a bus-mastering peer (the software double) can
//! resolve a bus address back to the block.

// Shared memory accessors cast between pointer widths; blocks are page
// aligned and every offset is bounds checked, so the casts are sound.
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{HpiError, Result};
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError, Weak};

const PAGE_SIZE: usize = 4096;

/// Allocator of DMA-visible host memory.
pub trait LockedMemory: Debug + Send + Sync {
    /// Allocate `size` zeroed bytes visible to the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`HpiError::MemoryAlloc`] when the block cannot be provided.
    fn alloc(&self, size: usize) -> Result<DmaBuffer>;
}

struct Block {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    bus_address: u32,
    locked: bool,
}

// SAFETY: Block owns its allocation. All access goes through volatile,
// bounds-checked accessors; concurrent mutation by the DSP is the expected
// mode of use and is why every access is volatile.
unsafe impl Send for Block {}
// SAFETY: see above.
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: ptr/layout.size() were mlock'd together in alloc.
            if let Err(e) = unsafe { munlock(self.ptr.as_ptr().cast(), self.layout.size()) } {
                tracing::warn!("munlock of {:#010x} failed: {e}", self.bus_address);
            }
        }
        // SAFETY: ptr came from alloc_zeroed with exactly this layout and no
        // handle outlives the Block.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        tracing::trace!("Released {} bytes at bus {:#010x}", self.len, self.bus_address);
    }
}

/// Handle to a block of locked host memory.
///
/// Clones share the block. All accessors are volatile.
///
/// # Panics
///
/// Accessors panic when the range falls outside the block; offsets are
/// always derived from fixed layouts, so a panic is a driver bug.
#[derive(Clone)]
pub struct DmaBuffer {
    block: Arc<Block>,
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus_address", &format_args!("{:#010x}", self.block.bus_address))
            .field("len", &self.block.len)
            .finish()
    }
}

impl DmaBuffer {
    /// Address the adapter uses to reach this block.
    #[must_use]
    pub fn bus_address(&self) -> u32 {
        self.block.bus_address
    }

    /// Usable length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block.len
    }

    /// Whether the block is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    /// Whether two handles refer to the same block.
    #[must_use]
    pub fn same_block(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    fn at(&self, offset: usize, width: usize) -> *mut u8 {
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.block.len),
            "DMA access {offset:#x}+{width} outside block of {:#x}",
            self.block.len
        );
        // SAFETY: range checked against len above.
        unsafe { self.block.ptr.as_ptr().add(offset) }
    }

    /// Volatile little-endian `u32` read.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0, "unaligned u32 access at {offset:#x}");
        // SAFETY: in bounds and 4-byte aligned (block is page aligned).
        u32::from_le(unsafe { self.at(offset, 4).cast::<u32>().read_volatile() })
    }

    /// Volatile little-endian `u32` write.
    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0, "unaligned u32 access at {offset:#x}");
        // SAFETY: in bounds and 4-byte aligned.
        unsafe { self.at(offset, 4).cast::<u32>().write_volatile(value.to_le()) };
    }

    /// Volatile little-endian `u16` read.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        assert!(offset % 2 == 0, "unaligned u16 access at {offset:#x}");
        // SAFETY: in bounds and 2-byte aligned.
        u16::from_le(unsafe { self.at(offset, 2).cast::<u16>().read_volatile() })
    }

    /// Volatile little-endian `u16` write.
    pub fn write_u16(&self, offset: usize, value: u16) {
        assert!(offset % 2 == 0, "unaligned u16 access at {offset:#x}");
        // SAFETY: in bounds and 2-byte aligned.
        unsafe { self.at(offset, 2).cast::<u16>().write_volatile(value.to_le()) };
    }

    /// Copy `out.len()` bytes starting at `offset` out of the block.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let src = self.at(offset, out.len());
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: src..src+out.len() checked by `at`.
            *byte = unsafe { src.add(i).read_volatile() };
        }
    }

    /// Copy `data` into the block starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let dst = self.at(offset, data.len());
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: dst..dst+data.len() checked by `at`.
            unsafe { dst.add(i).write_volatile(*byte) };
        }
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        let dst = self.at(offset, len);
        for i in 0..len {
            // SAFETY: dst..dst+len checked by `at`.
            unsafe { dst.add(i).write_volatile(0) };
        }
    }
}

#[derive(Debug, Default)]
struct Pool {
    next_bus: u64,
    blocks: BTreeMap<u32, Weak<Block>>,
}

impl Pool {
    fn prune(&mut self) {
        self.blocks.retain(|_, block| block.strong_count() > 0);
    }

    fn live(&self) -> impl Iterator<Item = Arc<Block>> + '_ {
        self.blocks.values().filter_map(Weak::upgrade)
    }
}

/// Page-aligned host memory with bus addresses assigned from a base.
#[derive(Debug)]
pub struct PinnedMemory {
    pool: Mutex<Pool>,
    bus_base: u32,
    lock_pages: bool,
    limit: Option<usize>,
}

impl PinnedMemory {
    /// Bus address of the first block unless configured otherwise.
    pub const DEFAULT_BUS_BASE: u32 = 0x1000_0000;

    /// Pool whose blocks are `mlock`ed.
    #[must_use]
    pub fn new(bus_base: u32) -> Self {
        Self {
            pool: Mutex::new(Pool {
                next_bus: u64::from(bus_base),
                blocks: BTreeMap::new(),
            }),
            bus_base,
            lock_pages: true,
            limit: None,
        }
    }

    /// Pool whose blocks are not locked (software double, tests).
    #[must_use]
    pub fn unlocked(bus_base: u32) -> Self {
        Self {
            lock_pages: false,
            ..Self::new(bus_base)
        }
    }

    /// Cap the bytes that may be outstanding at once.
    #[must_use]
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// First bus address this pool hands out.
    #[must_use]
    pub fn bus_base(&self) -> u32 {
        self.bus_base
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the live block containing `bus_address`.
    ///
    /// Returns the block and the offset of `bus_address` inside it.
    #[must_use]
    pub fn resolve(&self, bus_address: u32) -> Option<(DmaBuffer, usize)> {
        let pool = self.pool();
        let (start, block) = pool.blocks.range(..=bus_address).next_back()?;
        let block = block.upgrade()?;
        let offset = (bus_address - start) as usize;
        (offset < block.len).then(|| (DmaBuffer { block }, offset))
    }

    /// Number of blocks still referenced.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.pool().live().count()
    }

    /// Bytes still referenced.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.pool().live().map(|b| b.len).sum()
    }
}

impl Default for PinnedMemory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUS_BASE)
    }
}

impl LockedMemory for PinnedMemory {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(HpiError::MemoryAlloc { size });
        }
        let mut pool = self.pool();
        pool.prune();

        if let Some(limit) = self.limit {
            let live: usize = pool.live().map(|b| b.len).sum();
            if live + size > limit {
                tracing::debug!("Allocation of {size} bytes refused: {live} of {limit} in use");
                return Err(HpiError::MemoryAlloc { size });
            }
        }

        let span = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let bus_start = pool.next_bus;
        if bus_start + span as u64 > u64::from(u32::MAX) + 1 {
            return Err(HpiError::MemoryAlloc { size });
        }

        let layout =
            Layout::from_size_align(span, PAGE_SIZE).map_err(|_| HpiError::MemoryAlloc { size })?;
        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HpiError::MemoryAlloc { size })?;

        if self.lock_pages {
            // SAFETY: ptr is valid for span bytes (just allocated).
            if let Err(e) = unsafe { mlock(ptr.as_ptr().cast(), span) } {
                // SAFETY: ptr was allocated above with this layout.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                tracing::warn!("mlock of {span} bytes failed: {e}");
                return Err(HpiError::MemoryAlloc { size });
            }
        }

        let bus_address = bus_start as u32;
        let block = Arc::new(Block {
            ptr,
            len: size,
            layout,
            bus_address,
            locked: self.lock_pages,
        });
        pool.next_bus = bus_start + span as u64;
        pool.blocks.insert(bus_address, Arc::downgrade(&block));

        tracing::debug!("Allocated {size} bytes at bus {bus_address:#010x}");
        Ok(DmaBuffer { block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_zeroed_and_page_spaced() {
        let mem = PinnedMemory::unlocked(0x2000_0000);
        let a = mem.alloc(100).unwrap();
        let b = mem.alloc(5000).unwrap();
        assert_eq!(a.bus_address(), 0x2000_0000);
        assert_eq!(b.bus_address(), 0x2000_1000);
        assert_eq!(a.len(), 100);
        assert_eq!(a.read_u32(96), 0);
        assert_eq!(mem.live_allocations(), 2);
    }

    #[test]
    fn resolve_finds_block_and_offset() {
        let mem = PinnedMemory::unlocked(0x1000_0000);
        let buf = mem.alloc(64).unwrap();
        buf.write_u32(8, 0xDEAD_BEEF);

        let (found, offset) = mem.resolve(0x1000_0008).unwrap();
        assert!(found.same_block(&buf));
        assert_eq!(offset, 8);
        assert_eq!(found.read_u32(offset), 0xDEAD_BEEF);

        assert!(mem.resolve(0x1000_0040).is_none());
        assert!(mem.resolve(0x0FFF_FFFC).is_none());
    }

    #[test]
    fn dropping_last_handle_releases() {
        let mem = PinnedMemory::unlocked(0x1000_0000);
        let buf = mem.alloc(32).unwrap();
        let clone = buf.clone();
        drop(buf);
        assert_eq!(mem.live_allocations(), 1);
        drop(clone);
        assert_eq!(mem.live_allocations(), 0);
        assert!(mem.resolve(0x1000_0000).is_none());
    }

    #[test]
    fn limit_refuses_oversubscription() {
        let mem = PinnedMemory::unlocked(0x1000_0000).with_limit(1024);
        let _a = mem.alloc(1000).unwrap();
        assert!(matches!(mem.alloc(100), Err(HpiError::MemoryAlloc { size: 100 })));
        assert!(matches!(mem.alloc(0), Err(HpiError::MemoryAlloc { size: 0 })));
    }

    #[test]
    fn byte_and_half_word_access() {
        let mem = PinnedMemory::unlocked(0x1000_0000);
        let buf = mem.alloc(16).unwrap();
        buf.write_bytes(1, &[1, 2, 3]);
        let mut out = [0u8; 5];
        buf.read_bytes(0, &mut out);
        assert_eq!(out, [0, 1, 2, 3, 0]);
        buf.write_u16(6, 0xBEEF);
        assert_eq!(buf.read_u16(6), 0xBEEF);
        assert_eq!(buf.read_u32(4), 0xBEEF_0000);
        buf.zero(0, 16);
        assert_eq!(buf.read_u32(0), 0);
    }

    #[test]
    #[should_panic(expected = "outside block")]
    fn out_of_range_access_panics() {
        let mem = PinnedMemory::unlocked(0x1000_0000);
        let buf = mem.alloc(8).unwrap();
        let _ = buf.read_u32(8);
    }

    #[test]
    fn locked_allocation_either_succeeds_or_reports_alloc_failure() {
        // RLIMIT_MEMLOCK may be tiny in containers.
        let mem = PinnedMemory::default();
        match mem.alloc(4096) {
            Ok(buf) => assert_eq!(buf.bus_address(), PinnedMemory::DEFAULT_BUS_BASE),
            Err(e) => assert!(matches!(e, HpiError::MemoryAlloc { .. })),
        }
    }
}
