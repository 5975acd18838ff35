//! One booted 6205 adapter.
//!
//! [`AdapterHw`] owns everything the host keeps per adapter: the register
//! window, the HIF transport, the control cache, the async event ring and
//! the stream rings. [`AdapterHw::create`] boots the card and performs the
//! post-boot handshake; [`AdapterHw::handle`] answers one message, either
//! locally from host-side state or through the DSP.
//!
//! Callers serialize access; the dispatcher keeps each adapter behind a
//! mutex so that exactly one exchange is in flight per card.

use crate::boot::{Bootloader, Diagnostics};
use crate::cache::ControlCache;
use crate::config::DriverConfig;
use crate::dspcode::{DspCodeSource, FileCodeSource};
use crate::error::{Fault, HpiError, Result};
use crate::events::AsyncEventRing;
use crate::hif::{InterfaceBuffer, Transport};
use crate::memory::{LockedMemory, PinnedMemory};
use crate::message::{
    controlex_attribute, func, AsyncEventResult, BufferCommand, ControlExResult,
    Message, MessagePayload, ObjectType, Response, ResponsePayload, StreamBody, StreamRequest,
    StreamResult, MAX_EVENTS_PER_RESPONSE,
};
use crate::mmio::PciResource;
use crate::poll::{spin_until, Delay, PollConfig, SpinDelay};
use crate::stream::{ring_read, ring_write, Allocation, Direction, HostBuffers};
use crate::window::RegisterWindow;
use bytes::Bytes;
use hpi_chip::hif::{cmd, MAX_STREAMS};
use hpi_chip::pcie::{AdapterFamily, PRIMARY_DSP};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared services every adapter is built with.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Allocator for the interface buffer, rings, cache and event ring.
    pub memory: Arc<dyn LockedMemory>,
    /// Delay used by every bounded wait.
    pub delay: Arc<dyn Delay>,
    /// Where DSP code images come from.
    pub code: Arc<dyn DspCodeSource>,
    /// Timing and policy.
    pub config: DriverConfig,
}

impl Environment {
    /// Locked host memory, real-time delays and images from
    /// `config.dspcode_dir` (or the conventional firmware directory).
    #[must_use]
    pub fn host(config: DriverConfig) -> Self {
        let dir = config
            .dspcode_dir
            .clone()
            .unwrap_or_else(|| FileCodeSource::DEFAULT_DIR.into());
        Self {
            memory: Arc::new(PinnedMemory::default()),
            delay: Arc::new(SpinDelay),
            code: Arc::new(FileCodeSource::new(dir)),
            config,
        }
    }
}

/// Host-side state of one adapter.
#[derive(Debug)]
pub struct AdapterHw {
    family: AdapterFamily,
    index: u16,
    adapter_type: u16,
    win: RegisterWindow,
    transport: Transport,
    memory: Arc<dyn LockedMemory>,
    delay: Arc<dyn Delay>,
    cache: Option<ControlCache>,
    events: Option<AsyncEventRing>,
    outstreams: HostBuffers,
    instreams: HostBuffers,
    just_reset: [bool; MAX_STREAMS],
    diagnostics: Diagnostics,
    crashed: bool,
    bulk_failures: u32,
    bulk_failures_before_crash: u32,
}

impl AdapterHw {
    /// Boot the adapter at `resource` and complete the start handshake.
    ///
    /// On success the adapter has reported its index and type and is ready
    /// for messages.
    ///
    /// # Errors
    ///
    /// Returns an unknown PCI device fault if the subsystem ID names no
    /// family, a memory allocation fault if the interface buffer cannot be
    /// allocated, the first bootloader fault, a no-interrupt or init-failed
    /// fault if the DSP does not come up, or the DSP's own error for the
    /// identity query.
    pub fn create(resource: &PciResource, env: &Environment) -> Result<Self> {
        let family = AdapterFamily::from_subsys_device_id(resource.subsys_device_id)
            .ok_or_else(|| {
                warn!(
                    "{}: unknown subsystem device {:04x}",
                    resource.address, resource.subsys_device_id
                );
                HpiError::adapter(PRIMARY_DSP, Fault::UnknownPciDevice)
            })?;

        let ib = InterfaceBuffer::allocate(env.memory.as_ref())?;
        let mut win = RegisterWindow::from_resource(resource);

        let diagnostics = {
            let mut boot = Bootloader::new(&mut win, env.delay.as_ref(), &env.config.boot);
            let outcome = boot.run(family, env.code.as_ref(), &ib);
            let diagnostics = boot.diagnostics();
            if let Err(e) = outcome {
                error!("{}: {family} boot failed: {e}", resource.address);
                log_diagnostics(&diagnostics);
                return Err(e);
            }
            diagnostics
        };

        let mut hw = Self {
            family,
            index: 0,
            adapter_type: 0,
            win,
            transport: Transport::new(ib, env.config.hif.clone(), Arc::clone(&env.delay)),
            memory: Arc::clone(&env.memory),
            delay: Arc::clone(&env.delay),
            cache: None,
            events: None,
            outstreams: HostBuffers::new(Direction::Out),
            instreams: HostBuffers::new(Direction::In),
            just_reset: [true; MAX_STREAMS],
            diagnostics,
            crashed: false,
            bulk_failures: 0,
            bulk_failures_before_crash: env.config.bulk_failures_before_crash,
        };
        hw.await_start(env)?;
        hw.setup_host_areas();
        hw.identify()?;
        info!(
            "{}: adapter {} type {:04x} ({family}) ready",
            resource.address, hw.index, hw.adapter_type
        );
        Ok(hw)
    }

    fn await_start(&self, env: &Environment) -> Result<()> {
        let boot = &env.config.boot;
        let irq = spin_until(
            self.delay.as_ref(),
            PollConfig::new(boot.start_timeout_polls, 0),
            || self.win.interrupt_pending(),
        );
        if !irq.satisfied {
            error!("No interrupt from DSP after start");
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::NoInterrupt));
        }
        debug!("Start interrupt after {} polls", irq.polls);
        self.win.clear_interrupt();

        let ib = self.transport.interface();
        let ack = spin_until(
            self.delay.as_ref(),
            PollConfig::new(boot.reset_ack_retries, boot.reset_ack_delay_us),
            || ib.dsp_ack() == cmd::RESET,
        );
        if !ack.satisfied {
            error!("DSP never acknowledged reset, ack {:#x}", ib.dsp_ack());
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::InitFailed));
        }
        Ok(())
    }

    /// Allocate and publish the areas the DSP advertised at reset.
    fn setup_host_areas(&mut self) {
        let ib = self.transport.interface().clone();

        let controls = ib.cache_control_count();
        if controls > 0 {
            match ControlCache::allocate(self.memory.as_ref(), controls) {
                Ok(cache) => {
                    ib.set_cache_address(cache.bus_address());
                    debug!("Control cache: {controls} entries at {:#010x}", cache.bus_address());
                    self.cache = Some(cache);
                }
                Err(e) => warn!("Control cache disabled: {e}"),
            }
        }

        let events = ib.async_size();
        if events > 0 {
            match AsyncEventRing::allocate(self.memory.as_ref(), events) {
                Ok(ring) => {
                    ib.set_async_address(ring.bus_address());
                    debug!("Async events: {events} slots at {:#010x}", ring.bus_address());
                    self.events = Some(ring);
                }
                Err(e) => warn!("Async events disabled: {e}"),
            }
        }

        ib.set_host_cmd(cmd::IDLE);
        self.win.pulse_doorbell(self.delay.as_ref());
    }

    fn identify(&mut self) -> Result<()> {
        let msg = Message::adapter(0, func::adapter::GET_INFO);
        let resp = self.transport.exchange(&self.win, &msg)?;
        if !resp.is_ok() {
            return Err(HpiError::Dsp { code: resp.error });
        }
        let info = resp.adapter().copied().unwrap_or_default();
        self.index = info.adapter_index;
        self.adapter_type = info.adapter_type;
        Ok(())
    }

    /// Adapter index the DSP reported.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Adapter type the DSP reported.
    #[must_use]
    pub fn adapter_type(&self) -> u16 {
        self.adapter_type
    }

    /// Family derived from the PCI subsystem ID.
    #[must_use]
    pub fn family(&self) -> AdapterFamily {
        self.family
    }

    /// Whether the adapter stopped answering.
    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// What the bootloader recorded.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Message exchanges attempted since boot.
    #[must_use]
    pub fn exchanges(&self) -> u32 {
        self.transport.exchanges()
    }

    /// The control cache, if the DSP asked for one.
    #[must_use]
    pub fn control_cache(&self) -> Option<&ControlCache> {
        self.cache.as_ref()
    }

    /// The async event ring, if the DSP asked for one.
    #[must_use]
    pub fn async_events(&self) -> Option<&AsyncEventRing> {
        self.events.as_ref()
    }

    /// Interface buffer shared with the DSP.
    #[must_use]
    pub fn interface(&self) -> &InterfaceBuffer {
        self.transport.interface()
    }

    /// Answer one message addressed to this adapter.
    pub fn handle(&mut self, msg: &Message) -> Response {
        if self.crashed {
            debug!("Adapter {} crashed, refusing {:#06x}", self.index, msg.function);
            return Response::from_error(msg, &HpiError::dsp_hardware("adapter crashed"));
        }
        let outcome = match msg.object {
            ObjectType::Adapter => self.adapter_message(msg),
            ObjectType::Control => self.control_message(msg),
            ObjectType::OStream => self.stream_message(Direction::Out, msg),
            ObjectType::IStream => self.stream_message(Direction::In, msg),
            ObjectType::AsyncEvent => self.async_event_message(msg),
            ObjectType::Subsystem => Err(HpiError::InvalidObject {
                object: msg.object.code(),
            }),
            _ => Ok(self.hw_message(msg)),
        };
        outcome.unwrap_or_else(|e| Response::from_error(msg, &e))
    }

    /// Release every host area. The DSP keeps running until the next reset.
    pub fn teardown(&mut self) {
        debug!("Tearing down adapter {}", self.index);
        self.outstreams.clear();
        self.instreams.clear();
        self.cache = None;
        self.events = None;
    }

    /// Exchange `msg` with the DSP, then relay any bulk data it carries.
    fn hw_message(&mut self, msg: &Message) -> Response {
        if let Err(e) = outgoing_block(msg) {
            return Response::from_error(msg, &e);
        }
        let mut resp = match self.transport.exchange(&self.win, msg) {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_transport_failure() {
                    error!("Adapter {} crashed: {e}", self.index);
                    self.crashed = true;
                }
                return Response::from_error(msg, &e);
            }
        };
        if !resp.is_ok() {
            return resp;
        }

        match self.relay_bulk(msg, &mut resp) {
            Ok(()) => self.bulk_failures = 0,
            Err(e) => {
                self.bulk_failures += 1;
                warn!(
                    "Bulk transfer for {:#06x} failed ({} in a row): {e}",
                    msg.function, self.bulk_failures
                );
                if self.bulk_failures >= self.bulk_failures_before_crash {
                    error!("Adapter {} crashed after repeated bulk failures", self.index);
                    self.crashed = true;
                }
                resp.set_error(&e);
            }
        }
        resp
    }

    fn relay_bulk(&mut self, msg: &Message, resp: &mut Response) -> Result<()> {
        if let Some(block) = outgoing_block(msg)? {
            self.transport.send_data(&self.win, block)?;
            return Ok(());
        }
        match (&msg.payload, msg.function) {
            (MessagePayload::Stream(req), func::istream::READ | func::ostream::ANC_READ)
                if msg.object.is_stream() =>
            {
                if let StreamBody::Data { size, .. } = &req.body {
                    let mut out = vec![0u8; *size as usize];
                    let moved = self.transport.get_data(&self.win, &mut out)?;
                    out.truncate(moved);
                    if let ResponsePayload::Stream(result) = &mut resp.payload {
                        result.data = Bytes::from(out);
                    }
                }
            }
            (MessagePayload::ControlEx(req), func::controlex::GET_STATE)
                if req.attribute == controlex_attribute::BULK_GET =>
            {
                if let ResponsePayload::ControlEx(result) = &mut resp.payload {
                    let mut out = vec![0u8; result.byte_count.min(req.byte_count) as usize];
                    let moved = self.transport.get_data(&self.win, &mut out)?;
                    out.truncate(moved);
                    result.data = Bytes::from(out);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn adapter_message(&mut self, msg: &Message) -> Result<Response> {
        match msg.function {
            func::adapter::GET_INFO
            | func::adapter::GET_ASSERT
            | func::adapter::OPEN
            | func::adapter::CLOSE
            | func::adapter::TEST_ASSERT
            | func::adapter::SELFTEST
            | func::adapter::GET_MODE
            | func::adapter::SET_MODE
            | func::adapter::ENABLE_CAPABILITY
            | func::adapter::FIND_OBJECT
            | func::adapter::GET_PROPERTY => Ok(self.hw_message(msg)),
            function => Err(HpiError::InvalidFunction { function }),
        }
    }

    fn control_message(&mut self, msg: &Message) -> Result<Response> {
        let req = msg
            .control_request()
            .copied()
            .ok_or_else(|| HpiError::processing("control message without a control body"))?;
        match msg.function {
            func::control::GET_STATE => {
                if let Some(hit) = self.cache.as_ref().and_then(|c| c.lookup(&req)) {
                    return Ok(Response {
                        payload: ResponsePayload::Control(hit),
                        ..Response::new(msg)
                    });
                }
                Ok(self.hw_message(msg))
            }
            func::control::GET_INFO => Ok(self.hw_message(msg)),
            func::control::SET_STATE => {
                let resp = self.hw_message(msg);
                if let Some(cache) = &self.cache {
                    cache.sync(&req, &resp);
                }
                Ok(resp)
            }
            function => Err(HpiError::InvalidFunction { function }),
        }
    }

    fn stream_message(&mut self, dir: Direction, msg: &Message) -> Result<Response> {
        let req = msg
            .stream_request()
            .ok_or_else(|| HpiError::processing("stream message without a stream body"))?;
        if usize::from(req.index) >= MAX_STREAMS {
            warn!("{dir:?} stream index {} out of range", req.index);
            return Err(HpiError::InvalidStream { index: req.index });
        }
        let index = usize::from(req.index);

        match (dir, msg.function) {
            (Direction::Out, func::ostream::WRITE) => self.ostream_write(msg, req),
            (Direction::In, func::istream::READ) => self.istream_read(msg, req),
            (Direction::Out, func::ostream::GET_INFO) | (Direction::In, func::istream::GET_INFO) => {
                Ok(self.stream_info(dir, msg, index))
            }
            (Direction::Out, func::ostream::HOSTBUFFER_ALLOC)
            | (Direction::In, func::istream::HOSTBUFFER_ALLOC) => {
                self.host_buffer_alloc(dir, msg, req)
            }
            (Direction::Out, func::ostream::HOSTBUFFER_FREE)
            | (Direction::In, func::istream::HOSTBUFFER_FREE) => {
                self.host_buffer_free(dir, msg, req)
            }
            (Direction::Out, func::ostream::OPEN | func::ostream::RESET) => {
                self.just_reset[index] = true;
                Ok(self.hw_message(msg))
            }
            _ => Ok(self.hw_message(msg)),
        }
    }

    fn buffers(&self, dir: Direction) -> &HostBuffers {
        match dir {
            Direction::Out => &self.outstreams,
            Direction::In => &self.instreams,
        }
    }

    fn buffers_mut(&mut self, dir: Direction) -> &mut HostBuffers {
        match dir {
            Direction::Out => &mut self.outstreams,
            Direction::In => &mut self.instreams,
        }
    }

    fn ostream_write(&mut self, msg: &Message, req: &StreamRequest) -> Result<Response> {
        let index = usize::from(req.index);
        let Some(ring) = self.outstreams.buffer(index).cloned() else {
            return Ok(self.hw_message(msg));
        };
        let StreamBody::Data { format, size, data } = &req.body else {
            return Err(HpiError::processing("stream write without sample data"));
        };
        let block = declared(data, *size)?;

        if self.just_reset[index] {
            self.just_reset[index] = false;
            let set_format = Message::stream(
                ObjectType::OStream,
                msg.adapter_index,
                req.index,
                func::ostream::SET_FORMAT,
                StreamBody::Format(*format),
            );
            let format_resp = self.hw_message(&set_format);
            if !format_resp.is_ok() {
                let mut resp = Response::new(msg);
                resp.error = format_resp.error;
                resp.specific_error = format_resp.specific_error;
                return Ok(resp);
            }
        }

        let ib = self.transport.interface();
        let status = ib.status(Direction::Out, index);
        let host_index = ring_write(&ring, &status, block)?;
        ib.set_host_index(Direction::Out, index, host_index);
        Ok(Response::new(msg))
    }

    fn istream_read(&mut self, msg: &Message, req: &StreamRequest) -> Result<Response> {
        let index = usize::from(req.index);
        let Some(ring) = self.instreams.buffer(index).cloned() else {
            return Ok(self.hw_message(msg));
        };
        let StreamBody::Data { size, .. } = &req.body else {
            return Err(HpiError::processing("stream read without a size"));
        };

        let ib = self.transport.interface();
        let status = ib.status(Direction::In, index);
        let mut out = vec![0u8; *size as usize];
        let host_index = ring_read(&ring, &status, &mut out)?;
        ib.set_host_index(Direction::In, index, host_index);
        Ok(Response {
            payload: ResponsePayload::Stream(StreamResult {
                data: Bytes::from(out),
                ..StreamResult::default()
            }),
            ..Response::new(msg)
        })
    }

    fn stream_info(&mut self, dir: Direction, msg: &Message, index: usize) -> Response {
        if self.buffers(dir).buffer(index).is_none() {
            return self.hw_message(msg);
        }
        let status = self.transport.interface().status(dir, index);
        let data_available = match dir {
            Direction::Out => status.bytes_to_play(),
            Direction::In => status.data_available(),
        };
        // Truncation safe: state values are small enumerants
        #[allow(clippy::cast_possible_truncation)]
        let state = status.state as u16;
        Response {
            payload: ResponsePayload::Stream(StreamResult {
                state,
                buffer_size: status.size,
                data_available,
                samples_transferred: status.samples_processed,
                aux_data_available: status.aux_data_available,
                data: Bytes::new(),
            }),
            ..Response::new(msg)
        }
    }

    fn host_buffer_alloc(
        &mut self,
        dir: Direction,
        msg: &Message,
        req: &StreamRequest,
    ) -> Result<Response> {
        let StreamBody::Buffer { command, size, .. } = &req.body else {
            return Err(HpiError::processing("host buffer alloc without a buffer body"));
        };
        let (command, size) = (*command, *size);
        let index = usize::from(req.index);
        let old_size = self.buffers(dir).size(index);

        let mut resp = Response {
            payload: ResponsePayload::Stream(StreamResult {
                data_available: old_size,
                buffer_size: size,
                ..StreamResult::default()
            }),
            ..Response::new(msg)
        };

        let newly_allocated = match command {
            BufferCommand::External | BufferCommand::InternalAlloc => {
                let memory = Arc::clone(&self.memory);
                match self.buffers_mut(dir).allocate(memory.as_ref(), index, size) {
                    Ok(Allocation::Allocated) => true,
                    Ok(Allocation::Unchanged) => false,
                    Err(e) => {
                        resp.set_error(&e);
                        return Ok(resp);
                    }
                }
            }
            _ => false,
        };

        let grant = (command == BufferCommand::External && newly_allocated)
            || command == BufferCommand::GrantAdapter;
        if !grant {
            return Ok(resp);
        }

        let Some(bus_address) = self.buffers(dir).buffer(index).map(|b| b.bus_address()) else {
            return Err(HpiError::invalid_operation(format!(
                "{dir:?} stream {index}: no host buffer to grant"
            )));
        };
        let ring_size = self.buffers(dir).size(index);
        self.transport.interface().reset_status(dir, index, ring_size);

        let grant_msg = Message::stream(
            msg.object,
            msg.adapter_index,
            req.index,
            msg.function,
            StreamBody::Buffer {
                command,
                size: ring_size,
                pci_address: bus_address,
            },
        );
        let granted = self.hw_message(&grant_msg);
        if !granted.is_ok() && command == BufferCommand::External {
            debug!("{dir:?} stream {index}: grant refused, freeing ring");
            self.buffers_mut(dir).free(index);
        }
        Ok(granted)
    }

    fn host_buffer_free(
        &mut self,
        dir: Direction,
        msg: &Message,
        req: &StreamRequest,
    ) -> Result<Response> {
        let StreamBody::Buffer { command, .. } = &req.body else {
            return Err(HpiError::processing("host buffer free without a buffer body"));
        };
        let command = *command;
        let index = usize::from(req.index);
        if self.buffers(dir).buffer(index).is_none() {
            return Ok(Response::new(msg));
        }

        let mut resp = Response::new(msg);
        if matches!(command, BufferCommand::External | BufferCommand::RevokeAdapter) {
            resp = self.hw_message(msg);
        }
        if matches!(command, BufferCommand::External | BufferCommand::InternalFree) {
            debug!("{dir:?} stream {index}: ring freed");
            self.buffers_mut(dir).free(index);
        }
        Ok(resp)
    }

    fn async_event_message(&mut self, msg: &Message) -> Result<Response> {
        let ib = self.transport.interface();
        let result = match msg.function {
            func::asyncevent::OPEN | func::asyncevent::CLOSE => AsyncEventResult::default(),
            func::asyncevent::GET_COUNT => {
                let pending = self.events.as_ref().map_or(0, |ring| ring.pending(ib));
                AsyncEventResult {
                    count: u16::try_from(pending).unwrap_or(u16::MAX),
                    events: Vec::new(),
                }
            }
            func::asyncevent::GET => {
                let max = match &msg.payload {
                    MessagePayload::AsyncEvent(req) => usize::from(req.max_events),
                    _ => MAX_EVENTS_PER_RESPONSE,
                }
                .min(MAX_EVENTS_PER_RESPONSE);
                let events = self
                    .events
                    .as_ref()
                    .map(|ring| ring.take(ib, max))
                    .unwrap_or_default();
                AsyncEventResult {
                    count: u16::try_from(events.len()).unwrap_or(u16::MAX),
                    events,
                }
            }
            function => return Err(HpiError::InvalidFunction { function }),
        };
        Ok(Response {
            payload: ResponsePayload::AsyncEvent(result),
            ..Response::new(msg)
        })
    }
}

impl Drop for AdapterHw {
    fn drop(&mut self) {
        debug!("Releasing adapter {} ({})", self.index, self.family);
    }
}

fn log_diagnostics(diagnostics: &Diagnostics) {
    if let Some(m) = diagnostics.memory {
        error!("Memory test mismatch: {m}");
    }
    if let Some(m) = diagnostics.hpi_register {
        error!("HPI register mismatch: {m}");
    }
    if let Some(m) = diagnostics.code_verify {
        error!("Code verify mismatch: {m}");
    }
}

/// The first `size` bytes of `data`.
fn declared(data: &[u8], size: u32) -> Result<&[u8]> {
    data.get(..size as usize).ok_or(HpiError::InvalidDataSize {
        requested: size as usize,
        available: data.len(),
    })
}

/// Bytes `msg` sends to the DSP after the exchange, if any.
fn outgoing_block(msg: &Message) -> Result<Option<&[u8]>> {
    match (&msg.payload, msg.function) {
        (MessagePayload::Stream(req), func::ostream::WRITE | func::istream::ANC_WRITE)
            if msg.object.is_stream() =>
        {
            match &req.body {
                StreamBody::Data { size, data, .. } => declared(data, *size).map(Some),
                _ => Ok(None),
            }
        }
        (MessagePayload::ControlEx(req), func::controlex::SET_STATE)
            if req.attribute == controlex_attribute::BULK_SET =>
        {
            declared(&req.data, req.byte_count).map(Some)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedAdapter;

    #[test]
    fn crashed_adapter_is_not_contacted() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let env = card.environment();
        let mut hw = AdapterHw::create(&card.resource(), &env).unwrap();
        let before = hw.exchanges();

        hw.crashed = true;
        let resp = hw.handle(&Message::adapter(0, func::adapter::GET_INFO));
        assert_eq!(resp.error, crate::error::code::DSP_HARDWARE);
        assert_eq!(hw.exchanges(), before);
    }

    #[test]
    fn control_ex_bulk_get_fills_response_data() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let env = card.environment();
        card.set_bulk_block(Bytes::from_static(b"cobranet-block!!"));
        let mut hw = AdapterHw::create(&card.resource(), &env).unwrap();

        let resp = hw.handle(&Message::controlex_bulk_get(0, 3, 64));
        assert!(resp.is_ok(), "error {}", resp.error);
        assert_eq!(
            resp.controlex().map(|r| r.data.clone()),
            Some(Bytes::from_static(b"cobranet-block!!"))
        );
    }

    #[test]
    fn unknown_adapter_function_is_rejected_locally() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let env = card.environment();
        let mut hw = AdapterHw::create(&card.resource(), &env).unwrap();
        let before = hw.exchanges();

        let resp = hw.handle(&Message::adapter(0, 0x02FF));
        assert_eq!(resp.error, crate::error::code::INVALID_FUNC);
        assert_eq!(hw.exchanges(), before);
    }

    #[test]
    fn stream_index_out_of_range() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let env = card.environment();
        let mut hw = AdapterHw::create(&card.resource(), &env).unwrap();

        let resp = hw.handle(&Message::ostream(0, 16, func::ostream::START));
        assert_eq!(resp.error, crate::error::code::INVALID_STREAM);
        let resp = hw.handle(&Message::istream(0, 15, func::istream::START));
        assert!(resp.is_ok());
    }

    #[test]
    fn host_environment_uses_configured_code_dir() {
        let config = DriverConfig {
            dspcode_dir: Some("/tmp/dsp".into()),
            ..DriverConfig::default()
        };
        let env = Environment::host(config);
        assert!(format!("{:?}", env.code).contains("/tmp/dsp"));
    }
}
