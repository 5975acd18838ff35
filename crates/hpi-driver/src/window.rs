//! Register window: the three bridge registers plus page-banked access to
//! DSP memory.
//!
//! DSP addresses are plain `u32` offsets. [`RegisterWindow::translate`]
//! turns one into a [`MemoryHandle`] naming the BAR and byte offset to use,
//! switching the DSP page register first when the address lies on a page
//! other than the cached one. The secondary DSP has no window of its own:
//! it is reached through its HPI registers, which the primary exposes on
//! CE1, so every secondary access is several primary accesses.

use crate::error::{Fault, HpiError, Result};
use crate::mmio::{PciBar, PciResource};
use crate::poll::Delay;
use hpi_chip::bar;
use hpi_chip::pcie::{PRIMARY_DSP, SECONDARY_DSP};
use hpi_chip::regs::{self, c6713_hpi, hdcr, hsr};
use std::sync::Arc;

/// The C6205 bridge registers in BAR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRegister {
    /// Host status (HSR).
    HostStatus,
    /// Host-to-DSP control (HDCR).
    HostDspControl,
    /// DSP page (DSPP).
    DspPage,
}

impl BridgeRegister {
    /// BAR1 byte offset.
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::HostStatus => regs::HSR,
            Self::HostDspControl => regs::HDCR,
            Self::DspPage => regs::DSPP,
        }
    }
}

/// Which BAR a translated address lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// BAR0, paged DSP memory.
    Memory,
    /// BAR1, DSP register space.
    Registers,
}

/// Typed accessor for one 32-bit DSP location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHandle {
    /// BAR holding the location.
    pub window: Window,
    /// Byte offset within that BAR.
    pub offset: usize,
}

/// Per-adapter register window with the cached DSP page.
#[derive(Debug)]
pub struct RegisterWindow {
    bar0: Arc<dyn PciBar>,
    bar1: Arc<dyn PciBar>,
    page: u32,
}

impl RegisterWindow {
    /// Window over the two BARs. The cached page starts at 0.
    #[must_use]
    pub fn new(bar0: Arc<dyn PciBar>, bar1: Arc<dyn PciBar>) -> Self {
        Self { bar0, bar1, page: 0 }
    }

    /// Window over a PCI resource's BARs.
    #[must_use]
    pub fn from_resource(resource: &PciResource) -> Self {
        Self::new(Arc::clone(&resource.bar0), Arc::clone(&resource.bar1))
    }

    /// Read a bridge register.
    #[must_use]
    pub fn read_reg(&self, reg: BridgeRegister) -> u32 {
        self.bar1.read32(reg.offset())
    }

    /// Write a bridge register.
    pub fn write_reg(&self, reg: BridgeRegister, value: u32) {
        self.bar1.write32(reg.offset(), value);
    }

    /// Whether HSR INTSRC is set.
    #[must_use]
    pub fn interrupt_pending(&self) -> bool {
        self.read_reg(BridgeRegister::HostStatus) & hsr::INTSRC != 0
    }

    /// Acknowledge the DSP-to-host interrupt (INTSRC is write-one-to-clear).
    pub fn clear_interrupt(&self) {
        self.write_reg(BridgeRegister::HostStatus, hsr::INTSRC);
    }

    /// Set then clear HDCR DSPINT.
    pub fn pulse_doorbell(&self, delay: &dyn Delay) {
        let hdcr_value = self.read_reg(BridgeRegister::HostDspControl);
        delay.delay_us(1);
        self.write_reg(BridgeRegister::HostDspControl, hdcr_value | hdcr::DSPINT);
        self.write_reg(BridgeRegister::HostDspControl, hdcr_value & !hdcr::DSPINT);
    }

    /// Page the window believes DSPP holds.
    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Record that DSPP now holds `page` without writing it.
    pub fn assume_page(&mut self, page: u32) {
        self.page = page;
    }

    /// Map a DSP address to the BAR and offset that reach it, switching
    /// pages if needed.
    pub fn translate(&mut self, addr: u32) -> MemoryHandle {
        if bar::is_register_space(addr) {
            return MemoryHandle {
                window: Window::Registers,
                offset: bar::register_offset(addr),
            };
        }
        let page = bar::page_of(addr);
        if page != self.page {
            self.page = page;
            self.write_reg(BridgeRegister::DspPage, page);
        }
        MemoryHandle {
            window: Window::Memory,
            offset: bar::page_offset(addr),
        }
    }

    /// Read through a handle from [`translate`](Self::translate).
    #[must_use]
    pub fn read(&self, handle: MemoryHandle) -> u32 {
        match handle.window {
            Window::Memory => self.bar0.read32(handle.offset),
            Window::Registers => self.bar1.read32(handle.offset),
        }
    }

    /// Write through a handle from [`translate`](Self::translate).
    pub fn write(&self, handle: MemoryHandle, value: u32) {
        match handle.window {
            Window::Memory => self.bar0.write32(handle.offset, value),
            Window::Registers => self.bar1.write32(handle.offset, value),
        }
    }

    /// Read a word of DSP memory.
    ///
    /// # Errors
    ///
    /// Returns a bad DSP index fault for DSPs other than 0 and 1, and an
    /// invalid operation error for an address that is not word aligned.
    pub fn read_mem32(&mut self, dsp_index: u16, addr: u32) -> Result<u32> {
        check_aligned(addr)?;
        match dsp_index {
            PRIMARY_DSP => {
                let handle = self.translate(addr);
                Ok(self.read(handle))
            }
            SECONDARY_DSP => {
                self.set_hpi_address(addr);
                let low = self.read_primary(c6713_hpi::HPIDL);
                let high = self.read_primary(c6713_hpi::HPIDH);
                Ok((high << 16) | (low & c6713_hpi::HALF_MASK))
            }
            other => Err(HpiError::adapter(other, Fault::BadDspIndex)),
        }
    }

    /// Write a word of DSP memory.
    ///
    /// # Errors
    ///
    /// Returns a bad DSP index fault for DSPs other than 0 and 1, and an
    /// invalid operation error for an address that is not word aligned.
    pub fn write_mem32(&mut self, dsp_index: u16, addr: u32, value: u32) -> Result<()> {
        check_aligned(addr)?;
        match dsp_index {
            PRIMARY_DSP => {
                let handle = self.translate(addr);
                self.write(handle, value);
                Ok(())
            }
            SECONDARY_DSP => {
                self.set_hpi_address(addr);
                // 6205 advisory 1.4.4: a dummy read settles the CE1 write.
                let _ = self.read_primary(0);
                self.write_primary(c6713_hpi::HPIDL, value);
                self.write_primary(c6713_hpi::HPIDH, value >> 16);
                let _ = self.read_primary(0);
                Ok(())
            }
            other => Err(HpiError::adapter(other, Fault::BadDspIndex)),
        }
    }

    fn set_hpi_address(&mut self, addr: u32) {
        self.write_primary(c6713_hpi::HPIAL, addr);
        self.write_primary(c6713_hpi::HPIAH, addr >> 16);
    }

    fn read_primary(&mut self, addr: u32) -> u32 {
        let handle = self.translate(addr);
        self.read(handle)
    }

    fn write_primary(&mut self, addr: u32, value: u32) {
        let handle = self.translate(addr);
        self.write(handle, value);
    }
}

fn check_aligned(addr: u32) -> Result<()> {
    if addr % 4 != 0 {
        return Err(HpiError::invalid_operation(format!(
            "DSP address {addr:#010x} is not word aligned"
        )));
    }
    Ok(())
}
