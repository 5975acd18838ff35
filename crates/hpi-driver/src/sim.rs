//! Software double of a 6205 adapter.
//!
//! [`SimulatedAdapter`] serves both BARs of a card from a sparse model of
//! the DSP address space and runs a small firmware on every doorbell. It
//! honours the bridge register semantics the bootloader relies on (DSPP
//! reads back with MAP1, HSR INTSRC is write-one-to-clear, DSPINT triggers
//! the DSP), emulates the C6713 host port for two-DSP families, and plays
//! the DSP side of the HIF protocol against the host's interface buffer.
//!
//! Faults are injected through [`SimFaults`] so every error path of the
//! driver can be reached without hardware.

use crate::adapter::Environment;
use crate::cache::{CacheEntry, ControlCache};
use crate::config::DriverConfig;
use crate::dspcode::{ImageBuilder, MemoryCodeSource};
use crate::events::AsyncEventRing;
use crate::hif::InterfaceBuffer;
use crate::memory::{DmaBuffer, LockedMemory, PinnedMemory};
use crate::message::{
    controlex_attribute, func, AdapterResult, AsyncEvent, BufferCommand, ControlExResult,
    ControlResult, Message, MessagePayload, ObjectType, Response, ResponsePayload, StreamBody,
    StreamResult,
};
use crate::mmio::{PciBar, PciResource};
use crate::poll::NoDelay;
use crate::stream::{bytes_queued, free_space, Direction};
use bytes::Bytes;
use hpi_chip::bar::{self, bar0, bar1};
use hpi_chip::hif::control_cache::FLAG_VALID;
use hpi_chip::hif::{cmd, stream_state};
use hpi_chip::pcie::{
    AdapterFamily, CodeImage, AUDIOSCIENCE_SUBSYS_VENDOR_ID, DSP6205_DEVICE_ID, TI_VENDOR_ID,
};
use hpi_chip::regs::{self, c6713_hpi, dspp, emif, hdcr, hsr, memory, pld, pll};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// A bit that never stores a one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckBit {
    /// DSP owning the location
    pub dsp_index: u16,
    /// DSP address
    pub address: u32,
    /// Bits stuck at zero
    pub mask: u32,
}

/// Misbehaviour to inject. Everything is off by default.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// HSR reports a configuration error.
    pub config_error: bool,
    /// HSR never reports the EEPROM as read.
    pub eeprom_not_read: bool,
    /// HDCR PCIBOOT reads clear.
    pub pci_boot_clear: bool,
    /// DSPP ignores writes.
    pub page_stuck: bool,
    /// Writes to EMIF CE2 are lost.
    pub emif_stuck: bool,
    /// C6713 HPIC reads back zero.
    pub hpic_stuck: bool,
    /// C6713 HPIA bits that never store a one.
    pub hpia_stuck_bits: u32,
    /// C6713 PLL stays bypassed.
    pub pll_stuck: bool,
    /// PLD signatures read wrong.
    pub bad_pld: bool,
    /// A memory bit stuck at zero.
    pub memory_stuck: Option<StuckBit>,
    /// Reads of this primary address come back with bit 0 flipped.
    pub corrupt_code_word: Option<u32>,
    /// The host mailbox ignores writes once code is loaded.
    pub mailbox_stuck: bool,
    /// No interrupt when the DSP starts.
    pub no_start_irq: bool,
    /// The DSP starts but never acknowledges reset.
    pub never_ack_reset: bool,
    /// The DSP stops acknowledging IDLE.
    pub ack_stuck: bool,
    /// Responses are written but no interrupt follows.
    pub drop_response_irq: bool,
    /// The DSP answers without moving its ack to GET_RESP.
    pub skip_get_resp_ack: bool,
    /// Responses name the wrong function.
    pub garbled_response: bool,
    /// Bulk chunks are never acknowledged.
    pub bulk_no_irq: bool,
    /// Answer every message with this error code.
    pub dsp_error: Option<u16>,
    /// Refuse host buffer grants with this error code.
    pub grant_error: Option<u16>,
}

/// One recorded BAR write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimWrite {
    /// BAR number
    pub bar: u32,
    /// Byte offset
    pub offset: usize,
    /// Value written
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BulkTarget {
    Stream(Direction, u16),
    ControlEx,
}

#[derive(Debug)]
struct SimState {
    family: AdapterFamily,
    adapter_index: u16,
    subsys_device_id: u16,
    faults: SimFaults,

    hsr: u32,
    page: u32,
    primary: HashMap<u32, u32>,
    secondary: HashMap<u32, u32>,
    hpic: u32,
    hpia: u32,
    hpid_low: u32,

    cache_controls: u32,
    async_events: u32,
    code_loaded: bool,
    started: bool,
    ib: Option<InterfaceBuffer>,

    controls: HashMap<(u16, u16), (u32, u32)>,
    granted: HashMap<(Direction, u16), DmaBuffer>,
    received: HashMap<BulkTarget, Vec<u8>>,
    bulk_target: Option<BulkTarget>,
    bulk_block: Bytes,
    bulk_cursor: usize,
    record_counter: u8,
    formats_set: u32,
    messages: u32,

    writes: Vec<SimWrite>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SimState>,
    memory: Arc<PinnedMemory>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A simulated card.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    shared: Arc<Shared>,
}

/// Subsystem device ID of a representative model of `family`.
#[must_use]
pub const fn model_id(family: AdapterFamily) -> u16 {
    match family {
        AdapterFamily::Asi5000 => 0x5044,
        AdapterFamily::Asi6400 => 0x6416,
        AdapterFamily::Asi6500 => 0x6585,
        AdapterFamily::Asi6600 => 0x6614,
        AdapterFamily::Asi8700 => 0x8702,
    }
}

/// Load address of the first [`demo_image`] record, above the memory test.
pub const DEMO_TEXT: u32 = 0x0000_2000;

/// Load address of the second [`demo_image`] record.
pub const DEMO_DATA: u32 = 0x0000_3000;

/// Small well-formed image for `image`: two records across a continuation.
#[must_use]
pub fn demo_image(image: CodeImage) -> Vec<u32> {
    let id = u32::from(image.id());
    let text: Vec<u32> = (0..24).map(|i| (id << 16) | i).collect();
    ImageBuilder::new()
        .record(DEMO_TEXT, 1, &text)
        .continuation()
        .record(DEMO_DATA, 2, &[id, !id, 0x1234_5678, 0])
        .build()
}

/// Code source holding [`demo_image`] for every image.
#[must_use]
pub fn demo_code_source() -> MemoryCodeSource {
    [
        CodeImage::Asi5000,
        CodeImage::C6205,
        CodeImage::C6413,
        CodeImage::C6600,
        CodeImage::C8713,
    ]
    .into_iter()
    .fold(MemoryCodeSource::new(), |source, image| {
        source.with_image(image, demo_image(image))
    })
}

impl SimulatedAdapter {
    /// Card of `family` with its own host memory pool.
    #[must_use]
    pub fn new(family: AdapterFamily) -> Self {
        Self::with_memory(
            family,
            Arc::new(PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE)),
        )
    }

    /// Card of `family` bus-mastering into `memory`.
    #[must_use]
    pub fn with_memory(family: AdapterFamily, memory: Arc<PinnedMemory>) -> Self {
        let sim = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    family,
                    adapter_index: 0,
                    subsys_device_id: model_id(family),
                    faults: SimFaults::default(),
                    hsr: hsr::EEREAD,
                    page: 0,
                    primary: HashMap::new(),
                    secondary: HashMap::new(),
                    hpic: 0,
                    hpia: 0,
                    hpid_low: 0,
                    cache_controls: 8,
                    async_events: 8,
                    code_loaded: false,
                    started: false,
                    ib: None,
                    controls: HashMap::new(),
                    granted: HashMap::new(),
                    received: HashMap::new(),
                    bulk_target: None,
                    bulk_block: Bytes::new(),
                    bulk_cursor: 0,
                    record_counter: 0,
                    formats_set: 0,
                    messages: 0,
                    writes: Vec::new(),
                }),
                memory,
            }),
        };
        sim.seed_pld();
        sim
    }

    /// Report `index` as the adapter index.
    #[must_use]
    pub fn with_index(self, index: u16) -> Self {
        self.shared.state().adapter_index = index;
        self
    }

    /// Advertise `count` cached controls at reset (0 disables the cache).
    #[must_use]
    pub fn with_cache_controls(self, count: u32) -> Self {
        self.shared.state().cache_controls = count;
        self
    }

    /// Advertise an async ring of `size` events at reset (0 disables it).
    #[must_use]
    pub fn with_async_events(self, size: u32) -> Self {
        self.shared.state().async_events = size;
        self
    }

    /// Enumerate with another subsystem device ID.
    #[must_use]
    pub fn with_subsys_device_id(self, id: u16) -> Self {
        self.shared.state().subsys_device_id = id;
        self
    }

    fn seed_pld(&self) {
        let mut s = self.shared.state();
        let (a, b, c) = if s.faults.bad_pld {
            (0, 0, 0)
        } else {
            (pld::C6205_EXPECT_A, pld::C6205_EXPECT_B, pld::C6713_EXPECT)
        };
        if s.family.primary_has_pld() {
            s.primary.insert(pld::C6205_SIGNATURE_A, 0xF0 | a);
            s.primary.insert(pld::C6205_SIGNATURE_B, 0xF0 | b);
        }
        if s.family.secondary_has_pld() {
            s.secondary.insert(pld::C6713_SIGNATURE, 0x100 | c);
        }
    }

    /// Change the injected faults.
    pub fn inject(&self, change: impl FnOnce(&mut SimFaults)) {
        change(&mut self.shared.state().faults);
        self.seed_pld();
    }

    /// Host memory the card bus-masters into.
    #[must_use]
    pub fn memory(&self) -> Arc<PinnedMemory> {
        Arc::clone(&self.shared.memory)
    }

    /// Environment matching this card: its memory, no delays, demo images
    /// and simulation budgets.
    #[must_use]
    pub fn environment(&self) -> Environment {
        Environment {
            memory: self.memory() as Arc<dyn LockedMemory>,
            delay: Arc::new(NoDelay::new()),
            code: Arc::new(demo_code_source()),
            config: DriverConfig::for_simulation(),
        }
    }

    /// PCI resource whose BARs are this card.
    #[must_use]
    pub fn resource(&self) -> PciResource {
        let s = self.shared.state();
        PciResource {
            address: format!("sim:{:02x}", s.adapter_index),
            vendor_id: TI_VENDOR_ID,
            device_id: DSP6205_DEVICE_ID,
            subsys_vendor_id: AUDIOSCIENCE_SUBSYS_VENDOR_ID,
            subsys_device_id: s.subsys_device_id,
            bar0: Arc::new(SimBar {
                shared: Arc::clone(&self.shared),
                index: bar0::INDEX,
            }),
            bar1: Arc::new(SimBar {
                shared: Arc::clone(&self.shared),
                index: bar1::INDEX,
            }),
        }
    }

    /// Whether the firmware has been started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state().started
    }

    /// Messages the firmware answered.
    #[must_use]
    pub fn messages(&self) -> u32 {
        self.shared.state().messages
    }

    /// SET_FORMAT messages seen.
    #[must_use]
    pub fn formats_set(&self) -> u32 {
        self.shared.state().formats_set
    }

    /// Every BAR write so far.
    #[must_use]
    pub fn writes(&self) -> Vec<SimWrite> {
        self.shared.state().writes.clone()
    }

    /// Word of DSP memory as the card holds it.
    #[must_use]
    pub fn peek(&self, dsp_index: u16, address: u32) -> u32 {
        let s = self.shared.state();
        let map = if dsp_index == 0 { &s.primary } else { &s.secondary };
        map.get(&address).copied().unwrap_or(0)
    }

    /// Block served to bulk gets.
    pub fn set_bulk_block(&self, block: Bytes) {
        let mut s = self.shared.state();
        s.bulk_block = block;
        s.bulk_cursor = 0;
    }

    /// Bytes bulk-sent to an output stream.
    #[must_use]
    pub fn received_on_stream(&self, index: u16) -> Vec<u8> {
        self.received(BulkTarget::Stream(Direction::Out, index))
    }

    /// Bytes bulk-sent with extended control sets.
    #[must_use]
    pub fn received_bulk(&self) -> Vec<u8> {
        self.received(BulkTarget::ControlEx)
    }

    fn received(&self, target: BulkTarget) -> Vec<u8> {
        self.shared
            .state()
            .received
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    /// Write a value into the control cache as the firmware would.
    pub fn publish_control(&self, control_index: u16, attribute: u16, param1: u32, param2: u32) {
        let mut s = self.shared.state();
        s.controls.insert((control_index, attribute), (param1, param2));
        let Some(ib) = s.ib.clone() else {
            return;
        };
        if let Some((buf, _)) = self.shared.memory.resolve(ib.cache_address()) {
            ControlCache::from_buffer(buf).store(&CacheEntry {
                control_index,
                control_type: 0,
                attribute,
                flags: FLAG_VALID,
                param1,
                param2,
            });
        }
    }

    /// Queue an async event. Returns false if there is no ring or it is
    /// full.
    pub fn raise_event(&self, event: AsyncEvent) -> bool {
        let s = self.shared.state();
        let Some(ib) = s.ib.clone() else {
            return false;
        };
        let Some((buf, _)) = self.shared.memory.resolve(ib.async_address()) else {
            return false;
        };
        AsyncEventRing::from_buffer(buf).push(&ib, &event)
    }

    /// Play out up to `max` bytes from a granted output ring.
    #[must_use]
    pub fn consume_playback(&self, index: u16, max: usize) -> Vec<u8> {
        let s = self.shared.state();
        let (Some(ib), Some(ring)) = (s.ib.clone(), s.granted.get(&(Direction::Out, index))) else {
            return Vec::new();
        };
        let slot = usize::from(index);
        let status = ib.status(Direction::Out, slot);
        let queued = bytes_queued(status.dsp_index, status.host_index, status.size) as usize;
        let n = queued.min(max);
        let mut out = vec![0u8; n];
        let mut pos = status.dsp_index as usize;
        for byte in &mut out {
            let mut one = [0u8];
            ring.read_bytes(pos, &mut one);
            *byte = one[0];
            pos = (pos + 1) % status.size as usize;
        }
        ib.set_dsp_index(Direction::Out, slot, u32::try_from(pos).unwrap_or(0));
        ib.set_progress(
            Direction::Out,
            slot,
            stream_state::PLAYING,
            status.samples_processed + u32::try_from(n / 4).unwrap_or(0),
        );
        out
    }

    /// Capture `data` into a granted input ring. Returns the bytes stored.
    pub fn produce_record(&self, index: u16, data: &[u8]) -> usize {
        let s = self.shared.state();
        let (Some(ib), Some(ring)) = (s.ib.clone(), s.granted.get(&(Direction::In, index))) else {
            return 0;
        };
        let slot = usize::from(index);
        let status = ib.status(Direction::In, slot);
        let space = free_space(status.host_index, status.dsp_index, status.size) as usize;
        let n = space.min(data.len());
        let mut pos = status.dsp_index as usize;
        for &byte in &data[..n] {
            ring.write_bytes(pos, &[byte]);
            pos = (pos + 1) % status.size as usize;
        }
        ib.set_dsp_index(Direction::In, slot, u32::try_from(pos).unwrap_or(0));
        ib.set_progress(
            Direction::In,
            slot,
            stream_state::RECORDING,
            status.samples_processed + u32::try_from(n / 4).unwrap_or(0),
        );
        n
    }
}

/// One BAR of a simulated card.
#[derive(Debug)]
struct SimBar {
    shared: Arc<Shared>,
    index: u32,
}

impl PciBar for SimBar {
    fn read32(&self, offset: usize) -> u32 {
        let s = self.shared.state();
        if self.index == bar1::INDEX {
            s.read_bar1(offset)
        } else {
            let addr = s.bar0_address(offset);
            s.read_primary(addr)
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut s = self.shared.state();
        s.writes.push(SimWrite {
            bar: self.index,
            offset,
            value,
        });
        if self.index == bar1::INDEX {
            s.write_bar1(offset, value, &self.shared.memory);
        } else {
            let addr = s.bar0_address(offset);
            s.write_primary(addr, value);
        }
    }

    fn size(&self) -> usize {
        if self.index == bar1::INDEX {
            bar1::SIZE
        } else {
            bar0::SIZE
        }
    }
}

impl SimState {
    fn bar0_address(&self, offset: usize) -> u32 {
        // Truncation safe: BAR0 offsets are below 4 MB
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as u32;
        (self.page << bar0::PAGE_SHIFT) | offset
    }

    fn read_bar1(&self, offset: usize) -> u32 {
        match offset {
            regs::HSR => {
                let mut value = self.hsr;
                if self.faults.eeprom_not_read {
                    value &= !hsr::EEREAD;
                }
                if self.faults.config_error {
                    value |= hsr::CFGERR;
                }
                value
            }
            regs::HDCR => {
                if self.faults.pci_boot_clear {
                    0
                } else {
                    hdcr::PCIBOOT
                }
            }
            regs::DSPP => self.page | dspp::MAP1,
            _ => {
                // Truncation safe: BAR1 offsets are below 8 MB
                #[allow(clippy::cast_possible_truncation)]
                let addr = bar::REGISTER_SPACE_START + offset as u32;
                self.read_primary(addr)
            }
        }
    }

    fn write_bar1(&mut self, offset: usize, value: u32, memory: &PinnedMemory) {
        match offset {
            regs::HSR => {
                if value & hsr::INTSRC != 0 {
                    self.hsr &= !hsr::INTSRC;
                }
                self.hsr = (self.hsr & !hsr::INTAM) | (value & hsr::INTAM);
            }
            regs::HDCR => {
                if value & hdcr::WARMRESET != 0 {
                    self.warm_reset();
                }
                if value & hdcr::DSPINT != 0 {
                    self.doorbell(memory);
                }
            }
            regs::DSPP => {
                if !self.faults.page_stuck {
                    self.page = value & !dspp::MAP1;
                }
            }
            _ => {
                #[allow(clippy::cast_possible_truncation)]
                let addr = bar::REGISTER_SPACE_START + offset as u32;
                if self.faults.emif_stuck && addr == emif::CE2 {
                    return;
                }
                self.write_primary(addr, value);
            }
        }
    }

    fn warm_reset(&mut self) {
        debug!("Simulated {} warm reset", self.family);
        self.code_loaded = false;
        self.started = false;
        self.ib = None;
        self.hsr = hsr::EEREAD;
        self.page = 0;
        self.granted.clear();
        self.bulk_target = None;
    }

    fn read_primary(&self, addr: u32) -> u32 {
        match addr {
            c6713_hpi::HPICL | c6713_hpi::HPICH => {
                if self.faults.hpic_stuck {
                    0
                } else {
                    // HRDY reads set
                    self.hpic | 0x8
                }
            }
            c6713_hpi::HPIAL => self.hpia & c6713_hpi::HALF_MASK,
            c6713_hpi::HPIAH => self.hpia >> 16,
            c6713_hpi::HPIDL | c6713_hpi::HPIDIL => self.read_secondary(self.hpia) & c6713_hpi::HALF_MASK,
            c6713_hpi::HPIDH | c6713_hpi::HPIDIH => self.read_secondary(self.hpia) >> 16,
            _ => {
                let value = self.primary.get(&addr).copied().unwrap_or(0);
                if self.faults.corrupt_code_word == Some(addr) {
                    value ^ 1
                } else {
                    value
                }
            }
        }
    }

    fn write_primary(&mut self, addr: u32, value: u32) {
        match addr {
            c6713_hpi::HPICL | c6713_hpi::HPICH => self.hpic = value & c6713_hpi::HALF_MASK,
            c6713_hpi::HPIAL => {
                let low = value & c6713_hpi::HALF_MASK & !self.faults.hpia_stuck_bits;
                self.hpia = (self.hpia & !c6713_hpi::HALF_MASK) | low;
            }
            c6713_hpi::HPIAH => {
                let high = ((value & c6713_hpi::HALF_MASK) << 16) & !self.faults.hpia_stuck_bits;
                self.hpia = (self.hpia & c6713_hpi::HALF_MASK) | high;
            }
            c6713_hpi::HPIDL | c6713_hpi::HPIDIL => self.hpid_low = value & c6713_hpi::HALF_MASK,
            c6713_hpi::HPIDH | c6713_hpi::HPIDIH => {
                let word = self.hpid_low | ((value & c6713_hpi::HALF_MASK) << 16);
                self.write_secondary(self.hpia, word);
            }
            memory::HOST_MAILBOX if self.faults.mailbox_stuck && self.code_loaded => {}
            _ => {
                if (DEMO_TEXT..memory::C6205_INTERNAL_LEN).contains(&addr) {
                    self.code_loaded = true;
                }
                let value = self.stuck(0, addr, value);
                self.primary.insert(addr, value);
            }
        }
    }

    fn read_secondary(&self, addr: u32) -> u32 {
        self.secondary.get(&addr).copied().unwrap_or(0)
    }

    fn write_secondary(&mut self, addr: u32, value: u32) {
        let value = if addr == pll::PLLCSR && self.faults.pll_stuck {
            pll::BYPASS
        } else {
            self.stuck(1, addr, value)
        };
        self.secondary.insert(addr, value);
    }

    fn stuck(&self, dsp_index: u16, addr: u32, value: u32) -> u32 {
        match self.faults.memory_stuck {
            Some(bit) if bit.dsp_index == dsp_index && bit.address == addr => value & !bit.mask,
            _ => value,
        }
    }

    fn raise_irq(&mut self) {
        self.hsr |= hsr::INTSRC;
    }

    fn doorbell(&mut self, memory: &PinnedMemory) {
        if !self.started {
            self.start(memory);
            return;
        }
        let Some(ib) = self.ib.clone() else {
            return;
        };
        match ib.host_cmd() {
            cmd::IDLE => {
                self.bulk_target = None;
                if !self.faults.ack_stuck {
                    ib.set_dsp_ack(cmd::IDLE);
                }
            }
            cmd::GET_RESP => self.answer(&ib, memory),
            cmd::SEND_DATA => self.bulk_send(&ib),
            cmd::GET_DATA => self.bulk_get(&ib),
            other => trace!("Simulated DSP ignoring host command {other:#x}"),
        }
    }

    fn start(&mut self, memory: &PinnedMemory) {
        if self.faults.no_start_irq {
            debug!("Simulated DSP start swallowed");
            return;
        }
        let mailbox = self.primary.get(&memory::HOST_MAILBOX).copied().unwrap_or(0);
        let Some((buf, 0)) = memory.resolve(mailbox) else {
            debug!("Simulated DSP: mailbox {mailbox:#010x} names no host block");
            return;
        };
        let Ok(ib) = InterfaceBuffer::from_buffer(buf) else {
            return;
        };
        self.started = true;
        if !self.faults.never_ack_reset {
            ib.set_cache_control_count(self.cache_controls);
            ib.set_async_size(self.async_events);
            ib.set_dsp_ack(cmd::RESET);
        }
        self.ib = Some(ib);
        self.raise_irq();
        debug!("Simulated DSP running, interface buffer at {mailbox:#010x}");
    }

    fn answer(&mut self, ib: &InterfaceBuffer, memory: &PinnedMemory) {
        if !self.faults.skip_get_resp_ack {
            ib.set_dsp_ack(cmd::GET_RESP);
        }
        let resp = match ib.read_message() {
            Ok(msg) => {
                self.messages += 1;
                let mut resp = self.firmware(&msg, memory);
                if let Some(code) = self.faults.dsp_error {
                    resp.error = code;
                }
                if self.faults.garbled_response {
                    resp.function = resp.function.wrapping_add(1);
                }
                resp
            }
            Err(e) => {
                debug!("Simulated DSP cannot decode message: {e}");
                return;
            }
        };
        ib.write_response(&resp);
        if !self.faults.drop_response_irq {
            self.raise_irq();
        }
    }

    fn firmware(&mut self, msg: &Message, memory: &PinnedMemory) -> Response {
        let mut resp = Response::new(msg);
        match (&msg.payload, msg.object) {
            (_, ObjectType::Adapter) if msg.function == func::adapter::GET_INFO => {
                resp.payload = ResponsePayload::Adapter(AdapterResult {
                    adapter_index: self.adapter_index,
                    adapter_type: self.subsys_device_id,
                    serial_number: 0x0001_0000 + u32::from(self.adapter_index),
                    version: 0x0300,
                    num_outstreams: 4,
                    num_instreams: 4,
                    ..AdapterResult::default()
                });
            }
            (MessagePayload::Control(req), ObjectType::Control) => match msg.function {
                func::control::SET_STATE => {
                    self.controls
                        .insert((req.control_index, req.attribute), (req.param1, req.param2));
                }
                func::control::GET_STATE => {
                    let (param1, param2) = self
                        .controls
                        .get(&(req.control_index, req.attribute))
                        .copied()
                        .unwrap_or_default();
                    resp.payload = ResponsePayload::Control(ControlResult { param1, param2 });
                }
                _ => {}
            },
            (MessagePayload::ControlEx(req), ObjectType::ControlEx) => {
                if msg.function == func::controlex::SET_STATE
                    && req.attribute == controlex_attribute::BULK_SET
                {
                    self.bulk_target = Some(BulkTarget::ControlEx);
                }
                if msg.function == func::controlex::GET_STATE
                    && req.attribute == controlex_attribute::BULK_GET
                {
                    self.bulk_cursor = 0;
                    self.bulk_target = Some(BulkTarget::ControlEx);
                    // Truncation safe: test blocks are small
                    #[allow(clippy::cast_possible_truncation)]
                    let byte_count = self.bulk_block.len() as u32;
                    resp.payload = ResponsePayload::ControlEx(ControlExResult {
                        byte_count,
                        data: Bytes::new(),
                    });
                }
            }
            (MessagePayload::Stream(req), ObjectType::OStream | ObjectType::IStream) => {
                let dir = if msg.object == ObjectType::OStream {
                    Direction::Out
                } else {
                    Direction::In
                };
                self.stream_firmware(msg, dir, req.index, &req.body, &mut resp, memory);
            }
            _ => {}
        }
        resp
    }

    fn stream_firmware(
        &mut self,
        msg: &Message,
        dir: Direction,
        index: u16,
        body: &StreamBody,
        resp: &mut Response,
        memory: &PinnedMemory,
    ) {
        match msg.function {
            func::ostream::WRITE
            | func::istream::ANC_WRITE
            | func::istream::READ
            | func::ostream::ANC_READ => {
                self.bulk_target = Some(BulkTarget::Stream(dir, index));
            }
            func::ostream::SET_FORMAT if dir == Direction::Out => self.formats_set += 1,
            func::ostream::HOSTBUFFER_ALLOC | func::istream::HOSTBUFFER_ALLOC => {
                if let Some(code) = self.faults.grant_error {
                    resp.error = code;
                    return;
                }
                if let StreamBody::Buffer { pci_address, size, .. } = body {
                    if let Some((ring, 0)) = memory.resolve(*pci_address) {
                        debug!("Simulated DSP: {dir:?} stream {index} granted {size} bytes");
                        self.granted.insert((dir, index), ring);
                    }
                }
            }
            func::ostream::HOSTBUFFER_FREE | func::istream::HOSTBUFFER_FREE => {
                if let StreamBody::Buffer {
                    command: BufferCommand::External | BufferCommand::RevokeAdapter,
                    ..
                } = body
                {
                    self.granted.remove(&(dir, index));
                }
            }
            func::ostream::GET_INFO | func::istream::GET_INFO => {
                resp.payload = ResponsePayload::Stream(StreamResult {
                    state: u16::try_from(stream_state::STOPPED).unwrap_or_default(),
                    ..StreamResult::default()
                });
            }
            _ => {}
        }
    }

    fn bulk_send(&mut self, ib: &InterfaceBuffer) {
        let n = ib.transfer_size() as usize;
        let mut chunk = vec![0u8; n];
        ib.read_data(&mut chunk);
        if let Some(target) = self.bulk_target {
            self.received.entry(target).or_default().extend_from_slice(&chunk);
        }
        ib.set_dsp_ack(cmd::SEND_DATA);
        if !self.faults.bulk_no_irq {
            self.raise_irq();
        }
    }

    fn bulk_get(&mut self, ib: &InterfaceBuffer) {
        let n = ib.transfer_size() as usize;
        let chunk: Vec<u8> = match self.bulk_target {
            Some(BulkTarget::ControlEx) => {
                let start = self.bulk_cursor.min(self.bulk_block.len());
                let end = (start + n).min(self.bulk_block.len());
                self.bulk_cursor = start + n;
                let mut chunk = self.bulk_block[start..end].to_vec();
                chunk.resize(n, 0);
                chunk
            }
            _ => (0..n)
                .map(|_| {
                    self.record_counter = self.record_counter.wrapping_add(1);
                    self.record_counter
                })
                .collect(),
        };
        ib.write_data(&chunk);
        ib.set_dsp_ack(cmd::GET_DATA);
        if !self.faults.bulk_no_irq {
            self.raise_irq();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{BridgeRegister, RegisterWindow};

    #[test]
    fn page_register_reads_back_with_map1() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let win = RegisterWindow::from_resource(&card.resource());
        win.write_reg(BridgeRegister::DspPage, 3);
        assert_eq!(win.read_reg(BridgeRegister::DspPage), 3 | dspp::MAP1);

        card.inject(|f| f.page_stuck = true);
        win.write_reg(BridgeRegister::DspPage, 2);
        assert_eq!(win.read_reg(BridgeRegister::DspPage), 3 | dspp::MAP1);
    }

    #[test]
    fn interrupt_source_is_write_one_to_clear() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let win = RegisterWindow::from_resource(&card.resource());
        card.shared.state().raise_irq();
        assert!(win.interrupt_pending());
        win.write_reg(BridgeRegister::HostStatus, hsr::INTAM);
        assert!(win.interrupt_pending(), "writing zero leaves INTSRC set");
        win.clear_interrupt();
        assert!(!win.interrupt_pending());
    }

    #[test]
    fn paged_and_secondary_memory_are_distinct() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi8700);
        let mut win = RegisterWindow::from_resource(&card.resource());
        win.write_mem32(0, memory::C6205_SDRAM, 0x1111_1111).unwrap();
        win.write_mem32(0, memory::C6205_INTERNAL_DATA, 0x2222_2222).unwrap();
        win.write_mem32(1, memory::C6713_SDRAM, 0x3333_4444).unwrap();

        assert_eq!(card.peek(0, memory::C6205_SDRAM), 0x1111_1111);
        assert_eq!(card.peek(0, memory::C6205_INTERNAL_DATA), 0x2222_2222);
        assert_eq!(card.peek(1, memory::C6713_SDRAM), 0x3333_4444);
        assert_eq!(win.read_mem32(1, memory::C6713_SDRAM).unwrap(), 0x3333_4444);
        assert_eq!(win.read_mem32(0, memory::C6205_SDRAM).unwrap(), 0x1111_1111);
    }

    #[test]
    fn register_space_goes_through_bar1() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let mut win = RegisterWindow::from_resource(&card.resource());
        win.write_mem32(0, emif::CE3, 0xABCD).unwrap();
        assert!(card
            .writes()
            .iter()
            .any(|w| w.bar == bar1::INDEX && w.offset == 0x14 && w.value == 0xABCD));
        assert_eq!(win.read_mem32(0, emif::CE3).unwrap(), 0xABCD);
    }

    #[test]
    fn demo_images_cover_every_family() {
        let source = demo_code_source();
        for family in AdapterFamily::ALL {
            for image in family.code_images().into_iter().flatten() {
                assert!(crate::dspcode::DspCodeSource::open(&source, image).is_ok());
            }
        }
    }
}
