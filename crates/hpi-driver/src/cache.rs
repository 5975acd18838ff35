//! Host mirror of DSP control values.
//!
//! The DSP advertises a control count after reset; the host allocates one
//! 16-byte entry per control and publishes the block's bus address. Entries
//! flagged valid answer `CONTROL_GET_STATE` without a transport exchange.

use crate::error::Result;
use crate::memory::{DmaBuffer, LockedMemory};
use crate::message::{ControlRequest, ControlResult, Response};
use hpi_chip::hif::control_cache::{
    ENTRY_ATTRIBUTE, ENTRY_CONTROL_INDEX, ENTRY_CONTROL_TYPE, ENTRY_FLAGS, ENTRY_PARAM1,
    ENTRY_PARAM2, ENTRY_SIZE, FLAG_VALID,
};
use tracing::trace;

/// One cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheEntry {
    /// Control index the entry describes
    pub control_index: u16,
    /// Control type
    pub control_type: u16,
    /// Attribute the values belong to
    pub attribute: u16,
    /// Entry flags
    pub flags: u16,
    /// First value
    pub param1: u32,
    /// Second value
    pub param2: u32,
}

impl CacheEntry {
    /// Whether the entry holds a value.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }
}

/// The control cache block.
#[derive(Debug, Clone)]
pub struct ControlCache {
    mem: DmaBuffer,
    count: u32,
}

impl ControlCache {
    /// Allocate a zeroed cache for `count` controls.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error.
    pub fn allocate(memory: &dyn LockedMemory, count: u32) -> Result<Self> {
        let len = count as usize * ENTRY_SIZE;
        let mem = memory.alloc(len)?;
        mem.zero(0, len);
        Ok(Self { mem, count })
    }

    /// Cache over an existing block, as the DSP sees it.
    #[must_use]
    pub fn from_buffer(mem: DmaBuffer) -> Self {
        // Truncation safe: entries are 16 bytes of a sub-4 GB block
        #[allow(clippy::cast_possible_truncation)]
        let count = (mem.len() / ENTRY_SIZE) as u32;
        Self { mem, count }
    }

    /// Bus address to publish.
    #[must_use]
    pub fn bus_address(&self) -> u32 {
        self.mem.bus_address()
    }

    /// Controls covered.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Entry for `control_index`, if in range.
    #[must_use]
    pub fn entry(&self, control_index: u16) -> Option<CacheEntry> {
        if u32::from(control_index) >= self.count {
            return None;
        }
        let base = usize::from(control_index) * ENTRY_SIZE;
        Some(CacheEntry {
            control_index: self.mem.read_u16(base + ENTRY_CONTROL_INDEX),
            control_type: self.mem.read_u16(base + ENTRY_CONTROL_TYPE),
            attribute: self.mem.read_u16(base + ENTRY_ATTRIBUTE),
            flags: self.mem.read_u16(base + ENTRY_FLAGS),
            param1: self.mem.read_u32(base + ENTRY_PARAM1),
            param2: self.mem.read_u32(base + ENTRY_PARAM2),
        })
    }

    /// Overwrite the entry for `entry.control_index`. Out-of-range indices
    /// are ignored.
    pub fn store(&self, entry: &CacheEntry) {
        if u32::from(entry.control_index) >= self.count {
            return;
        }
        let base = usize::from(entry.control_index) * ENTRY_SIZE;
        self.mem.write_u16(base + ENTRY_CONTROL_INDEX, entry.control_index);
        self.mem.write_u16(base + ENTRY_CONTROL_TYPE, entry.control_type);
        self.mem.write_u16(base + ENTRY_ATTRIBUTE, entry.attribute);
        self.mem.write_u32(base + ENTRY_PARAM1, entry.param1);
        self.mem.write_u32(base + ENTRY_PARAM2, entry.param2);
        // Flags last: a valid entry is never half written.
        self.mem.write_u16(base + ENTRY_FLAGS, entry.flags);
    }

    /// Cached answer for a get-state request.
    #[must_use]
    pub fn lookup(&self, req: &ControlRequest) -> Option<ControlResult> {
        let entry = self.entry(req.control_index)?;
        let hit = entry.is_valid()
            && entry.control_index == req.control_index
            && entry.attribute == req.attribute;
        trace!(
            "Control cache {} for control {} attribute {:#06x}",
            if hit { "hit" } else { "miss" },
            req.control_index,
            req.attribute
        );
        hit.then_some(ControlResult {
            param1: entry.param1,
            param2: entry.param2,
        })
    }

    /// Record the value a successful set-state just wrote.
    pub fn sync(&self, req: &ControlRequest, resp: &Response) {
        if !resp.is_ok() {
            return;
        }
        let Some(mut entry) = self.entry(req.control_index) else {
            return;
        };
        entry.control_index = req.control_index;
        entry.attribute = req.attribute;
        entry.param1 = req.param1;
        entry.param2 = req.param2;
        entry.flags |= FLAG_VALID;
        self.store(&entry);
    }
}
