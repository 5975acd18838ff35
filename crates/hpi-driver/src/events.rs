//! Async event ring filled by the DSP.
//!
//! Capacity and indices live in the interface buffer; the ring itself is a
//! separate locked block of 12-byte events. Indices count events, not
//! bytes. One slot stays empty so that equal indices mean empty.

use crate::error::Result;
use crate::hif::InterfaceBuffer;
use crate::memory::{DmaBuffer, LockedMemory};
use crate::message::AsyncEvent;
use hpi_chip::hif::async_buffer::{
    EVENT_OBJECT_INDEX, EVENT_PARAM1, EVENT_PARAM2, EVENT_SIZE, EVENT_TYPE,
};

/// The async event ring.
#[derive(Debug, Clone)]
pub struct AsyncEventRing {
    mem: DmaBuffer,
    size: u32,
}

impl AsyncEventRing {
    /// Allocate a zeroed ring of `size` events.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error.
    pub fn allocate(memory: &dyn LockedMemory, size: u32) -> Result<Self> {
        let len = size as usize * EVENT_SIZE;
        let mem = memory.alloc(len)?;
        mem.zero(0, len);
        Ok(Self { mem, size })
    }

    /// Ring over an existing block, as the DSP sees it.
    #[must_use]
    pub fn from_buffer(mem: DmaBuffer) -> Self {
        // Truncation safe: 12-byte events of a sub-4 GB block
        #[allow(clippy::cast_possible_truncation)]
        let size = (mem.len() / EVENT_SIZE) as u32;
        Self { mem, size }
    }

    /// Bus address to publish.
    #[must_use]
    pub fn bus_address(&self) -> u32 {
        self.mem.bus_address()
    }

    /// Capacity in events, including the empty slot.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Events waiting for the host.
    #[must_use]
    pub fn pending(&self, ib: &InterfaceBuffer) -> u32 {
        if self.size == 0 {
            return 0;
        }
        let host = ib.async_host_index() % self.size;
        let dsp = ib.async_dsp_index() % self.size;
        (dsp + self.size - host) % self.size
    }

    /// Take up to `max` events, advancing the host index.
    #[must_use]
    pub fn take(&self, ib: &InterfaceBuffer, max: usize) -> Vec<AsyncEvent> {
        let count = (self.pending(ib) as usize).min(max);
        let mut host = if self.size == 0 {
            0
        } else {
            ib.async_host_index() % self.size
        };
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let base = host as usize * EVENT_SIZE;
            events.push(AsyncEvent {
                event_type: self.mem.read_u16(base + EVENT_TYPE),
                object_index: self.mem.read_u16(base + EVENT_OBJECT_INDEX),
                param1: self.mem.read_u32(base + EVENT_PARAM1),
                param2: self.mem.read_u32(base + EVENT_PARAM2),
            });
            host = (host + 1) % self.size;
        }
        if count > 0 {
            ib.set_async_host_index(host);
        }
        events
    }

    /// Append an event at the DSP index. Returns false when full.
    pub fn push(&self, ib: &InterfaceBuffer, event: &AsyncEvent) -> bool {
        if self.size < 2 || self.pending(ib) + 1 >= self.size {
            return false;
        }
        let dsp = ib.async_dsp_index() % self.size;
        let base = dsp as usize * EVENT_SIZE;
        self.mem.write_u16(base + EVENT_TYPE, event.event_type);
        self.mem.write_u16(base + EVENT_OBJECT_INDEX, event.object_index);
        self.mem.write_u32(base + EVENT_PARAM1, event.param1);
        self.mem.write_u32(base + EVENT_PARAM2, event.param2);
        ib.set_async_dsp_index((dsp + 1) % self.size);
        true
    }
}
