//! Bus-mastering stream rings.
//!
//! Each stream slot may own a host ring the DSP reads (playback) or fills
//! (record) on its own. Ring state lives in the interface buffer's status
//! blocks: the host owns `host_index`, the DSP owns `dsp_index`. Four bytes
//! stay unused so that equal indices always mean empty.

use crate::error::{HpiError, Result};
use crate::hif::StreamStatus;
use crate::memory::{DmaBuffer, LockedMemory};
use crate::message::ObjectType;
use hpi_chip::hif::{status::GUARD_BYTES, MAX_STREAMS};
use tracing::debug;

/// Stream direction, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Playback: host writes, DSP reads
    Out,
    /// Record: DSP writes, host reads
    In,
}

impl Direction {
    /// Direction of a stream object.
    #[must_use]
    pub const fn from_object(object: ObjectType) -> Option<Self> {
        match object {
            ObjectType::OStream => Some(Self::Out),
            ObjectType::IStream => Some(Self::In),
            _ => None,
        }
    }
}

/// Bytes the writer may add without catching up with the reader.
#[must_use]
pub fn free_space(read_index: u32, write_index: u32, size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    let diff = i64::from(read_index) - i64::from(write_index) - i64::from(GUARD_BYTES);
    // Truncation safe: rem_euclid by a u32 size
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let space = diff.rem_euclid(i64::from(size)) as u32;
    space
}

/// Bytes written but not yet read.
#[must_use]
pub fn bytes_queued(read_index: u32, write_index: u32, size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    let diff = i64::from(write_index) - i64::from(read_index);
    // Truncation safe: rem_euclid by a u32 size
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let queued = diff.rem_euclid(i64::from(size)) as u32;
    queued
}

impl StreamStatus {
    /// Room for the host to write (playback ring).
    #[must_use]
    pub fn space_available(&self) -> u32 {
        free_space(self.dsp_index, self.host_index, self.size)
    }

    /// Bytes the DSP has not yet played (playback ring).
    #[must_use]
    pub fn bytes_to_play(&self) -> u32 {
        bytes_queued(self.dsp_index, self.host_index, self.size)
    }

    /// Bytes recorded and not yet read by the host (record ring).
    #[must_use]
    pub fn data_available(&self) -> u32 {
        bytes_queued(self.host_index, self.dsp_index, self.size)
    }
}

/// Outcome of [`HostBuffers::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Already that size; nothing done
    Unchanged,
    /// A new block replaced whatever was there
    Allocated,
}

/// Host rings for every slot of one direction.
#[derive(Debug)]
pub struct HostBuffers {
    dir: Direction,
    slots: [Option<DmaBuffer>; MAX_STREAMS],
    sizes: [u32; MAX_STREAMS],
}

impl HostBuffers {
    /// No rings.
    #[must_use]
    pub fn new(dir: Direction) -> Self {
        Self {
            dir,
            slots: std::array::from_fn(|_| None),
            sizes: [0; MAX_STREAMS],
        }
    }

    /// Ring size for `index`, 0 if none.
    #[must_use]
    pub fn size(&self, index: usize) -> u32 {
        self.sizes[index]
    }

    /// Ring for `index`, if allocated.
    #[must_use]
    pub fn buffer(&self, index: usize) -> Option<&DmaBuffer> {
        self.slots[index].as_ref()
    }

    /// Make sure `index` owns a ring of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an invalid data size error if the new block cannot be
    /// allocated; the slot is then empty.
    pub fn allocate(
        &mut self,
        memory: &dyn LockedMemory,
        index: usize,
        size: u32,
    ) -> Result<Allocation> {
        if self.sizes[index] == size && (size == 0 || self.slots[index].is_some()) {
            return Ok(Allocation::Unchanged);
        }
        self.free(index);
        match memory.alloc(size as usize) {
            Ok(buf) => {
                debug!(
                    "{:?} stream {index}: {size} byte ring at bus {:#010x}",
                    self.dir,
                    buf.bus_address()
                );
                self.slots[index] = Some(buf);
                self.sizes[index] = size;
                Ok(Allocation::Allocated)
            }
            Err(e) => {
                debug!("{:?} stream {index}: ring allocation failed: {e}", self.dir);
                Err(HpiError::InvalidDataSize {
                    requested: size as usize,
                    available: 0,
                })
            }
        }
    }

    /// Release the ring for `index`.
    pub fn free(&mut self, index: usize) {
        self.slots[index] = None;
        self.sizes[index] = 0;
    }

    /// Release every ring.
    pub fn clear(&mut self) {
        for index in 0..MAX_STREAMS {
            self.free(index);
        }
    }
}

fn advance(index: u32, by: usize, size: u32) -> u32 {
    let next = (u64::from(index) + by as u64) % u64::from(size.max(1));
    // next is below size, so always fits
    u32::try_from(next).unwrap_or(0)
}

fn check_ring(ring: &DmaBuffer, status: &StreamStatus) -> Result<()> {
    if status.size as usize > ring.len() || status.host_index >= status.size.max(1) {
        return Err(HpiError::invalid_operation(format!(
            "status block (host index {}, size {}) does not fit a {} byte ring",
            status.host_index,
            status.size,
            ring.len()
        )));
    }
    Ok(())
}

/// Copy `data` into a playback ring at the host index.
///
/// Returns the new host index. Nothing is copied if `data` does not fit.
///
/// # Errors
///
/// Returns an invalid data size error if `data` exceeds the free space, and
/// an invalid operation error if the status block does not describe `ring`.
pub fn ring_write(ring: &DmaBuffer, status: &StreamStatus, data: &[u8]) -> Result<u32> {
    check_ring(ring, status)?;
    let space = status.space_available() as usize;
    if data.len() > space {
        return Err(HpiError::InvalidDataSize {
            requested: data.len(),
            available: space,
        });
    }
    let host = status.host_index;
    let first = data.len().min((status.size - host) as usize);
    ring.write_bytes(host as usize, &data[..first]);
    let mut next = advance(host, first, status.size);
    if first < data.len() {
        ring.write_bytes(next as usize, &data[first..]);
        next = advance(next, data.len() - first, status.size);
    }
    Ok(next)
}

/// Copy from a record ring at the host index into `out`.
///
/// Returns the new host index. Nothing is copied if `out` is larger than
/// what is available.
///
/// # Errors
///
/// Returns an invalid data size error if `out` exceeds the available data,
/// and an invalid operation error if the status block does not describe
/// `ring`.
pub fn ring_read(ring: &DmaBuffer, status: &StreamStatus, out: &mut [u8]) -> Result<u32> {
    check_ring(ring, status)?;
    let available = status.data_available() as usize;
    if out.len() > available {
        return Err(HpiError::InvalidDataSize {
            requested: out.len(),
            available,
        });
    }
    let host = status.host_index;
    let first = out.len().min((status.size - host) as usize);
    ring.read_bytes(host as usize, &mut out[..first]);
    let mut next = advance(host, first, status.size);
    if first < out.len() {
        ring.read_bytes(next as usize, &mut out[first..]);
        next = advance(next, out.len() - first, status.size);
    }
    Ok(next)
}
