//! HIF: the shared interface buffer and the host side of its protocol.
//!
//! [`InterfaceBuffer`] is a typed view over the locked block whose bus
//! address the DSP learns at boot. [`Transport`] runs the two exchanges the
//! block supports:
//!
//! - **message/response**: idle wait, copy the message, `GET_RESP` doorbell,
//!   ack wait (soft), interrupt wait (hard), copy the response, back to idle;
//! - **bulk relay**: idle wait, `SEND_DATA`/`GET_DATA`, then one doorbell and
//!   interrupt per chunk of the data area, back to idle.
//!
//! One exchange at a time; the caller holds the adapter lock throughout.

use crate::config::HifConfig;
use crate::error::{Fault, HpiError, Result};
use crate::memory::{DmaBuffer, LockedMemory};
use crate::message::{Message, Response};
use crate::poll::{spin_until, Delay, PollConfig};
use crate::stream::Direction;
use crate::window::RegisterWindow;
use hpi_chip::hif::{
    self, async_buffer, cmd, control_cache, status, DATA_SIZE, DSP_ACK, HOST_CMD,
    INTERFACE_BUFFER_SIZE, OVERLAY, RESPONSE_SIZE, TRANSFER_SIZE,
};
use hpi_chip::pcie::PRIMARY_DSP;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Snapshot of one stream's host buffer status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatus {
    /// Samples the DSP has consumed or produced
    pub samples_processed: u32,
    /// Ancillary bytes ready
    pub aux_data_available: u32,
    /// Stream state
    pub state: u32,
    /// DSP side ring index
    pub dsp_index: u32,
    /// Host side ring index
    pub host_index: u32,
    /// Ring size in bytes
    pub size: u32,
}

/// Typed view of the interface buffer.
#[derive(Debug, Clone)]
pub struct InterfaceBuffer {
    mem: DmaBuffer,
}

impl InterfaceBuffer {
    /// Allocate a fresh buffer with the ack word poisoned.
    ///
    /// # Errors
    ///
    /// Returns a memory allocation fault for DSP 0 if the block cannot be
    /// allocated.
    pub fn allocate(memory: &dyn LockedMemory) -> Result<Self> {
        let mem = memory
            .alloc(INTERFACE_BUFFER_SIZE)
            .map_err(|_| HpiError::adapter(PRIMARY_DSP, Fault::MemAlloc))?;
        mem.zero(0, INTERFACE_BUFFER_SIZE);
        let ib = Self { mem };
        ib.set_dsp_ack(hif::ACK_UNINITIALISED);
        Ok(ib)
    }

    /// View over an existing block, as the DSP side sees it.
    ///
    /// # Errors
    ///
    /// Returns a processing error if the block is too small.
    pub fn from_buffer(mem: DmaBuffer) -> Result<Self> {
        if mem.len() < INTERFACE_BUFFER_SIZE {
            return Err(HpiError::processing(format!(
                "interface buffer of {} bytes, need {INTERFACE_BUFFER_SIZE}",
                mem.len()
            )));
        }
        Ok(Self { mem })
    }

    /// Bus address published to the DSP.
    #[must_use]
    pub fn bus_address(&self) -> u32 {
        self.mem.bus_address()
    }

    /// Underlying block.
    #[must_use]
    pub fn buffer(&self) -> &DmaBuffer {
        &self.mem
    }

    /// Host command word.
    #[must_use]
    pub fn host_cmd(&self) -> u32 {
        self.mem.read_u32(HOST_CMD)
    }

    /// Set the host command word.
    pub fn set_host_cmd(&self, value: u32) {
        self.mem.write_u32(HOST_CMD, value);
    }

    /// DSP acknowledge word.
    #[must_use]
    pub fn dsp_ack(&self) -> u32 {
        self.mem.read_u32(DSP_ACK)
    }

    /// Set the acknowledge word. The host only does this before start.
    pub fn set_dsp_ack(&self, value: u32) {
        self.mem.write_u32(DSP_ACK, value);
    }

    /// Bytes in the current bulk chunk.
    #[must_use]
    pub fn transfer_size(&self) -> u32 {
        self.mem.read_u32(TRANSFER_SIZE)
    }

    /// Set the bytes in the current bulk chunk.
    pub fn set_transfer_size(&self, value: u32) {
        self.mem.write_u32(TRANSFER_SIZE, value);
    }

    /// Copy a message into the overlay.
    pub fn write_message(&self, msg: &Message) {
        self.mem.write_bytes(OVERLAY, &msg.encode());
    }

    /// Parse the message in the overlay.
    ///
    /// # Errors
    ///
    /// Returns the decode error for a malformed record.
    pub fn read_message(&self) -> Result<Message> {
        let mut record = [0u8; hif::MESSAGE_SIZE];
        self.mem.read_bytes(OVERLAY, &mut record);
        Message::decode(&record)
    }

    /// Copy a response into the overlay.
    pub fn write_response(&self, resp: &Response) {
        self.mem.write_bytes(OVERLAY, &resp.encode());
    }

    /// Parse the response in the overlay.
    ///
    /// # Errors
    ///
    /// Returns an invalid response error for a malformed record.
    pub fn read_response(&self) -> Result<Response> {
        let mut record = [0u8; RESPONSE_SIZE];
        self.mem.read_bytes(OVERLAY, &mut record);
        Response::decode(&record)
    }

    /// Copy into the start of the data area.
    pub fn write_data(&self, data: &[u8]) {
        assert!(data.len() <= DATA_SIZE, "chunk exceeds the data area");
        self.mem.write_bytes(OVERLAY, data);
    }

    /// Copy out of the start of the data area.
    pub fn read_data(&self, out: &mut [u8]) {
        assert!(out.len() <= DATA_SIZE, "chunk exceeds the data area");
        self.mem.read_bytes(OVERLAY, out);
    }

    /// Controls the DSP advertises for caching.
    #[must_use]
    pub fn cache_control_count(&self) -> u32 {
        self.mem.read_u32(control_cache::NUMBER_OF_CONTROLS)
    }

    /// Advertise a cache size (DSP side).
    pub fn set_cache_control_count(&self, count: u32) {
        self.mem.write_u32(control_cache::NUMBER_OF_CONTROLS, count);
    }

    /// Bus address of the host control cache.
    #[must_use]
    pub fn cache_address(&self) -> u32 {
        self.mem.read_u32(control_cache::PHYSICAL_ADDRESS)
    }

    /// Publish the control cache bus address.
    pub fn set_cache_address(&self, bus_address: u32) {
        self.mem.write_u32(control_cache::PHYSICAL_ADDRESS, bus_address);
    }

    /// Async event ring capacity the DSP advertises.
    #[must_use]
    pub fn async_size(&self) -> u32 {
        self.mem.read_u32(async_buffer::SIZE)
    }

    /// Advertise an async ring capacity (DSP side).
    pub fn set_async_size(&self, size: u32) {
        self.mem.write_u32(async_buffer::SIZE, size);
    }

    /// Bus address of the async event ring.
    #[must_use]
    pub fn async_address(&self) -> u32 {
        self.mem.read_u32(async_buffer::PHYSICAL_ADDRESS)
    }

    /// Publish the async event ring bus address.
    pub fn set_async_address(&self, bus_address: u32) {
        self.mem.write_u32(async_buffer::PHYSICAL_ADDRESS, bus_address);
    }

    /// Async ring host (read) index.
    #[must_use]
    pub fn async_host_index(&self) -> u32 {
        self.mem.read_u32(async_buffer::HOST_INDEX)
    }

    /// Set the async ring host index.
    pub fn set_async_host_index(&self, index: u32) {
        self.mem.write_u32(async_buffer::HOST_INDEX, index);
    }

    /// Async ring DSP (write) index.
    #[must_use]
    pub fn async_dsp_index(&self) -> u32 {
        self.mem.read_u32(async_buffer::DSP_INDEX)
    }

    /// Set the async ring DSP index (DSP side).
    pub fn set_async_dsp_index(&self, index: u32) {
        self.mem.write_u32(async_buffer::DSP_INDEX, index);
    }

    fn status_offset(dir: Direction, index: usize) -> usize {
        match dir {
            Direction::Out => hif::outstream_status(index),
            Direction::In => hif::instream_status(index),
        }
    }

    /// Read a stream status block.
    #[must_use]
    pub fn status(&self, dir: Direction, index: usize) -> StreamStatus {
        let base = Self::status_offset(dir, index);
        StreamStatus {
            samples_processed: self.mem.read_u32(base + status::SAMPLES_PROCESSED),
            aux_data_available: self.mem.read_u32(base + status::AUX_DATA_AVAILABLE),
            state: self.mem.read_u32(base + status::STREAM_STATE),
            dsp_index: self.mem.read_u32(base + status::DSP_INDEX),
            host_index: self.mem.read_u32(base + status::HOST_INDEX),
            size: self.mem.read_u32(base + status::SIZE_IN_BYTES),
        }
    }

    /// Reset a status block for a newly granted ring of `size` bytes.
    pub fn reset_status(&self, dir: Direction, index: usize, size: u32) {
        let base = Self::status_offset(dir, index);
        self.mem.write_u32(base + status::SAMPLES_PROCESSED, 0);
        self.mem.write_u32(base + status::STREAM_STATE, hif::stream_state::STOPPED);
        self.mem.write_u32(base + status::DSP_INDEX, 0);
        self.mem.write_u32(base + status::HOST_INDEX, 0);
        self.mem.write_u32(base + status::SIZE_IN_BYTES, size);
    }

    /// Advance the host index.
    pub fn set_host_index(&self, dir: Direction, index: usize, value: u32) {
        let base = Self::status_offset(dir, index);
        self.mem.write_u32(base + status::HOST_INDEX, value);
    }

    /// Advance the DSP index (DSP side).
    pub fn set_dsp_index(&self, dir: Direction, index: usize, value: u32) {
        let base = Self::status_offset(dir, index);
        self.mem.write_u32(base + status::DSP_INDEX, value);
    }

    /// Update the stream state and sample count (DSP side).
    pub fn set_progress(&self, dir: Direction, index: usize, state: u32, samples: u32) {
        let base = Self::status_offset(dir, index);
        self.mem.write_u32(base + status::STREAM_STATE, state);
        self.mem.write_u32(base + status::SAMPLES_PROCESSED, samples);
    }
}

/// Which way a bulk relay moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Host to DSP
    Send,
    /// DSP to host
    Get,
}

impl BulkOp {
    const fn command(self) -> u32 {
        match self {
            Self::Send => cmd::SEND_DATA,
            Self::Get => cmd::GET_DATA,
        }
    }
}

/// Host side of the HIF protocol for one adapter.
#[derive(Debug)]
pub struct Transport {
    ib: InterfaceBuffer,
    config: HifConfig,
    delay: Arc<dyn Delay>,
    sequence: u32,
}

impl Transport {
    /// Transport over `ib`.
    #[must_use]
    pub fn new(ib: InterfaceBuffer, config: HifConfig, delay: Arc<dyn Delay>) -> Self {
        Self {
            ib,
            config,
            delay,
            sequence: 0,
        }
    }

    /// Interface buffer.
    #[must_use]
    pub fn interface(&self) -> &InterfaceBuffer {
        &self.ib
    }

    /// Message exchanges attempted so far.
    #[must_use]
    pub fn exchanges(&self) -> u32 {
        self.sequence
    }

    fn wait_idle(&self) -> bool {
        let spin = spin_until(
            self.delay.as_ref(),
            PollConfig::new(self.config.timeout_polls, self.config.idle_delay_us),
            || self.ib.dsp_ack() == cmd::IDLE,
        );
        spin.satisfied
    }

    fn back_to_idle(&self, win: &RegisterWindow) {
        self.ib.set_host_cmd(cmd::IDLE);
        win.pulse_doorbell(self.delay.as_ref());
    }

    /// Send `msg` and collect the DSP's response.
    ///
    /// A response carrying a nonzero DSP error is still `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an idle timeout if the interface never went idle, a response
    /// timeout if the DSP never acknowledged or never raised its interrupt,
    /// and an invalid response error if the reply does not answer `msg`.
    pub fn exchange(&mut self, win: &RegisterWindow, msg: &Message) -> Result<Response> {
        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;

        if !self.wait_idle() {
            debug!("({seq}) Timeout waiting for idle, ack {:#x}", self.ib.dsp_ack());
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::IdleTimeout));
        }

        self.ib.write_message(msg);
        self.ib.set_host_cmd(cmd::GET_RESP);
        win.pulse_doorbell(self.delay.as_ref());

        let polls = PollConfig::new(self.config.timeout_polls, 0);
        let ack = spin_until(self.delay.as_ref(), polls, || {
            self.ib.dsp_ack() == cmd::GET_RESP
        });
        if ack.satisfied {
            trace!("({seq}) Transition to GET_RESP after {}", ack.polls);
        } else {
            warn!(
                "({seq}) Timed out waiting for GET_RESP state, ack {:#x}",
                self.ib.dsp_ack()
            );
        }

        let irq = spin_until(self.delay.as_ref(), polls, || win.interrupt_pending());
        if irq.satisfied {
            trace!("({seq}) Interrupt after {}", irq.polls);
        } else {
            warn!("({seq}) No response interrupt for function {:#06x}", msg.function);
        }
        win.clear_interrupt();

        let response = irq.satisfied.then(|| self.ib.read_response());

        self.back_to_idle(win);

        // A late ack is only logged. A missing interrupt means no response.
        if !irq.satisfied {
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::ResponseTimeout));
        }

        if msg.function == crate::message::func::adapter::CLOSE && !self.wait_idle() {
            debug!("({seq}) Timeout waiting for idle after adapter close");
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::IdleTimeout));
        }

        let response = response.unwrap_or_else(|| {
            Err(HpiError::invalid_response("no response copied"))
        })?;
        response.check_answers(msg)?;
        debug!(
            "({seq}) {:?} {:#06x} -> error {}",
            msg.object, msg.function, response.error
        );
        Ok(response)
    }

    /// Relay `data` to the DSP. Returns the bytes moved.
    ///
    /// # Errors
    ///
    /// Returns a DSP hardware error if the interface is not idle or a chunk
    /// is never acknowledged.
    pub fn send_data(&mut self, win: &RegisterWindow, data: &[u8]) -> Result<usize> {
        let len = data.len() & !3;
        self.relay(win, BulkOp::Send, len, |ib, offset, n| {
            ib.write_data(&data[offset..offset + n]);
        })
    }

    /// Fill `out` from the DSP. Returns the bytes moved.
    ///
    /// # Errors
    ///
    /// As for [`send_data`](Self::send_data).
    pub fn get_data(&mut self, win: &RegisterWindow, out: &mut [u8]) -> Result<usize> {
        let len = out.len() & !3;
        self.relay(win, BulkOp::Get, len, |ib, offset, n| {
            ib.read_data(&mut out[offset..offset + n]);
        })
    }

    fn relay(
        &mut self,
        win: &RegisterWindow,
        op: BulkOp,
        len: usize,
        mut copy: impl FnMut(&InterfaceBuffer, usize, usize),
    ) -> Result<usize> {
        let seq = self.sequence;
        if !self.wait_idle() {
            return Err(HpiError::dsp_hardware(format!(
                "interface not idle before {op:?} of {len} bytes"
            )));
        }
        self.ib.set_host_cmd(op.command());

        let chunk = self.config.bulk_chunk.clamp(4, DATA_SIZE) & !3;
        let polls = PollConfig::new(self.config.timeout_polls, self.config.bulk_delay_us);
        let mut moved = 0;
        let mut outcome = Ok(());
        while moved < len {
            let n = (len - moved).min(chunk);
            if op == BulkOp::Send {
                copy(&self.ib, moved, n);
            }
            // Truncation safe: n is at most DATA_SIZE
            #[allow(clippy::cast_possible_truncation)]
            self.ib.set_transfer_size(n as u32);
            win.pulse_doorbell(self.delay.as_ref());

            let irq = spin_until(self.delay.as_ref(), polls, || win.interrupt_pending());
            trace!("({seq}) Spun {} times for data xfer of {n}", irq.polls);
            win.clear_interrupt();
            if !irq.satisfied {
                outcome = Err(HpiError::dsp_hardware(format!(
                    "no interrupt for {op:?} chunk at {moved} of {len}"
                )));
                break;
            }
            if op == BulkOp::Get {
                copy(&self.ib, moved, n);
            }
            moved += n;
        }

        if outcome.is_ok() && self.ib.dsp_ack() != op.command() {
            debug!(
                "({seq}) Ack {:#x} after {op:?}, expected {:#x}",
                self.ib.dsp_ack(),
                op.command()
            );
        }
        self.back_to_idle(win);
        outcome.map(|()| moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PinnedMemory;
    use crate::message::{func, ObjectType};

    #[test]
    fn fresh_buffer_is_zeroed_with_poisoned_ack() {
        let memory = PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE);
        let ib = InterfaceBuffer::allocate(&memory).unwrap();
        assert_eq!(ib.dsp_ack(), hif::ACK_UNINITIALISED);
        assert_eq!(ib.host_cmd(), 0);
        assert_eq!(ib.cache_control_count(), 0);
        assert_eq!(ib.status(Direction::Out, 15), StreamStatus::default());
        assert_eq!(ib.bus_address(), PinnedMemory::DEFAULT_BUS_BASE);
    }

    #[test]
    fn allocation_failure_is_a_mem_alloc_fault() {
        let memory = PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE).with_limit(1024);
        let err = InterfaceBuffer::allocate(&memory).unwrap_err();
        assert_eq!(err.code(), 1001);
    }

    #[test]
    fn status_blocks_do_not_overlap() {
        let memory = PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE);
        let ib = InterfaceBuffer::allocate(&memory).unwrap();
        ib.reset_status(Direction::In, 15, 4096);
        ib.set_host_index(Direction::In, 15, 64);
        ib.reset_status(Direction::Out, 0, 8192);
        ib.set_dsp_index(Direction::Out, 0, 128);

        let input = ib.status(Direction::In, 15);
        assert_eq!(input.size, 4096);
        assert_eq!(input.host_index, 64);
        assert_eq!(input.state, hif::stream_state::STOPPED);
        let output = ib.status(Direction::Out, 0);
        assert_eq!(output.size, 8192);
        assert_eq!(output.dsp_index, 128);
        assert_eq!(output.host_index, 0);
        assert_eq!(ib.async_size(), 0);
    }

    #[test]
    fn message_and_data_share_the_overlay() {
        let memory = PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE);
        let ib = InterfaceBuffer::allocate(&memory).unwrap();
        let msg = Message::new(ObjectType::Adapter, func::adapter::OPEN, 0);
        ib.write_message(&msg);
        assert_eq!(ib.read_message().unwrap().function, func::adapter::OPEN);
        ib.write_data(&[0xEE; 4]);
        assert!(ib.read_message().is_err());
    }
}
