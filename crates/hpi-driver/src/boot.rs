//! Cold boot of the DSPs behind a 6205 bridge.
//!
//! The sequence is linear and stops at the first fault:
//!
//! 1. Warm reset, then check the EEPROM autoload and PCI boot mode.
//! 2. Walk the DSP page register through 1, 2, 3, 0.
//! 3. On two-DSP families, release the secondary from reset so its EMIF
//!    is quiet while the primary boots.
//! 4. Per DSP: EMIF (or C6713 HPI and PLL bring-up), internal memory,
//!    external memory, PLD, then code load and read-back verify.
//! 5. Publish the interface buffer bus address in the host mailbox.
//! 6. Unmask the host interrupt and ring the doorbell.
//!
//! Waiting for the DSP to acknowledge the start is the caller's job.

use crate::config::{BootConfig, VerifyPolicy};
use crate::dspcode::{next_record, DspCodeSource};
use crate::error::{Fault, HpiError, Result};
use crate::hif::InterfaceBuffer;
use crate::poll::Delay;
use crate::window::{BridgeRegister, RegisterWindow};
use hpi_chip::dspcode::{READBACK_INTERVAL, WORD_BYTES};
use hpi_chip::hif::cmd;
use hpi_chip::pcie::{AdapterFamily, CodeImage, PRIMARY_DSP, SECONDARY_DSP};
use hpi_chip::regs::{self, c6713_hpi, dspp, emif, gpo, hdcr, hsr, memory, pld, pll};
use tracing::{debug, error, info, warn};

/// Word the walking-ones and unique-pattern tests write.
const UNIQUE_PATTERN: u32 = 0xA5A5_5A5A;

/// Locations the unique-pattern test covers.
const UNIQUE_PATTERN_WORDS: u32 = 100;

/// Page values the page register round trip writes, ending on 0.
const PAGE_PROBE: [u32; 4] = [1, 2, 3, 0];

/// A location that did not read back what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// DSP the location belongs to
    pub dsp_index: u16,
    /// DSP address (or HPI register)
    pub address: u32,
    /// Value written
    pub expected: u32,
    /// Value read back
    pub observed: u32,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DSP {} @ {:#010x}: wrote {:#010x}, read {:#010x}",
            self.dsp_index, self.address, self.expected, self.observed
        )
    }
}

/// What the bootloader saw go wrong, kept for logging after the fact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Last memory test failure.
    pub memory: Option<Mismatch>,
    /// Last C6713 HPI register or host mailbox failure.
    pub hpi_register: Option<Mismatch>,
    /// Last code verification mismatch.
    pub code_verify: Option<Mismatch>,
}

/// Boots one adapter through its register window.
#[derive(Debug)]
pub struct Bootloader<'a> {
    win: &'a mut RegisterWindow,
    delay: &'a dyn Delay,
    config: &'a BootConfig,
    diagnostics: Diagnostics,
}

impl<'a> Bootloader<'a> {
    /// Bootloader over `win`.
    pub fn new(win: &'a mut RegisterWindow, delay: &'a dyn Delay, config: &'a BootConfig) -> Self {
        Self {
            win,
            delay,
            config,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Faults recorded so far.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Run the whole boot sequence for `family`, leaving the primary DSP
    /// started with `ib` published as its interface buffer.
    ///
    /// # Errors
    ///
    /// Returns the adapter fault of the first step that failed, or the code
    /// source's error if an image cannot be opened.
    pub fn run(
        &mut self,
        family: AdapterFamily,
        code: &dyn DspCodeSource,
        ib: &InterfaceBuffer,
    ) -> Result<()> {
        info!("Booting {family} adapter");
        self.reset_bridge()?;
        self.check_page_register()?;

        if family.has_secondary_dsp() {
            self.release_secondary()?;
        }

        for (dsp_index, image) in (0u16..).zip(family.code_images()) {
            let Some(image) = image else {
                continue;
            };
            debug!("DSP {dsp_index}: image {:04x}", image.id());
            self.config_emif(dsp_index)?;
            self.test_internal_memory(dsp_index)?;
            self.test_external_memory(family, dsp_index)?;
            self.test_pld(family, dsp_index)?;
            self.load_code(dsp_index, image, code)?;
        }

        ib.set_dsp_ack(cmd::UNKNOWN);
        self.publish_mailbox(ib.bus_address())?;
        self.start_primary();
        info!("{family} adapter code loaded, DSP started");
        Ok(())
    }

    /// Warm reset, EEPROM autoload check and PCI boot mode check.
    ///
    /// # Errors
    ///
    /// Returns an EEPROM fault if autoload did not complete cleanly, or a
    /// PCI boot mode fault if the DSP is not waiting for a PCI boot. An
    /// EEPROM fault is returned before anything else is written.
    pub fn reset_bridge(&mut self) -> Result<()> {
        self.win.write_reg(BridgeRegister::HostDspControl, hdcr::WARMRESET);
        self.delay.delay_us(self.config.reset_delay_us);

        let status = self.win.read_reg(BridgeRegister::HostStatus);
        if status & (hsr::CFGERR | hsr::EEREAD) != hsr::EEREAD {
            error!("HSR {status:#x}: EEPROM not read or configuration error");
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::Eeprom));
        }
        // Masks PINTA until the DSP is started.
        self.win.write_reg(BridgeRegister::HostStatus, status | hsr::INTAM);

        let control = self.win.read_reg(BridgeRegister::HostDspControl);
        if control & hdcr::PCIBOOT == 0 {
            error!("HDCR {control:#x}: not in PCI boot mode");
            return Err(HpiError::adapter(PRIMARY_DSP, Fault::PciBootMode));
        }
        debug!("Bridge reset, HSR {status:#x} HDCR {control:#x}");
        Ok(())
    }

    /// Write each probe page to DSPP and require it back with MAP1 set.
    ///
    /// # Errors
    ///
    /// Returns a DSP page fault on the first mismatch.
    pub fn check_page_register(&mut self) -> Result<()> {
        for page in PAGE_PROBE {
            self.win.write_reg(BridgeRegister::DspPage, page);
            let read = self.win.read_reg(BridgeRegister::DspPage);
            if read != page | dspp::MAP1 {
                error!("DSPP wrote {page}, read {read:#x}");
                return Err(HpiError::adapter(PRIMARY_DSP, Fault::DspPage));
            }
        }
        self.win.assume_page(0);
        Ok(())
    }

    fn release_secondary(&mut self) -> Result<()> {
        debug!("Releasing secondary DSP from reset");
        let release = self.config.release_delay_us;
        self.win.write_mem32(PRIMARY_DSP, regs::MCBSP0_PCR, gpo::HOLD_SECONDARY)?;
        self.delay.delay_us(release);
        self.win.write_mem32(PRIMARY_DSP, regs::TIMER1_CTL, 0)?;
        // 6205 advisory 1.4.4
        self.win.read_mem32(PRIMARY_DSP, 0)?;
        self.delay.delay_us(release);
        self.win
            .write_mem32(PRIMARY_DSP, regs::TIMER1_CTL, regs::TIMER1_RELEASE_RESET)?;
        self.delay.delay_us(release);
        Ok(())
    }

    fn config_emif(&mut self, dsp_index: u16) -> Result<()> {
        match dsp_index {
            PRIMARY_DSP => self.config_c6205_emif(),
            SECONDARY_DSP => self.config_c6713(),
            other => Err(HpiError::adapter(other, Fault::BadDspIndex)),
        }
    }

    fn config_c6205_emif(&mut self) -> Result<()> {
        self.win.write_mem32(PRIMARY_DSP, emif::GCTL, emif::c6205::GCTL)?;
        let checked = [
            (emif::CE0, emif::CE_SDRAM),
            (emif::CE1, emif::c6205::CE1_BOOT.encode()),
            (emif::CE2, emif::c6205::CE2.encode()),
            (emif::CE3, emif::c6205::CE3.encode()),
        ];
        for (reg, value) in checked {
            self.win.write_mem32(PRIMARY_DSP, reg, value)?;
            let read = self.win.read_mem32(PRIMARY_DSP, reg)?;
            if read != value {
                error!("EMIF {reg:#010x}: wrote {value:#010x}, read {read:#010x}");
                return Err(HpiError::adapter(PRIMARY_DSP, Fault::Emif));
            }
        }
        self.win
            .write_mem32(PRIMARY_DSP, emif::SDRAMCTL, emif::c6205::SDRAMCTL)?;
        self.win
            .write_mem32(PRIMARY_DSP, emif::SDRAMTIMING, emif::c6205::SDRAMTIMING)?;
        debug!("DSP 0: EMIF configured");
        Ok(())
    }

    /// HPI check, PLL start and EMIF setup of the C6713. HPI registers are
    /// primary addresses; PLL and EMIF registers are secondary addresses.
    fn config_c6713(&mut self) -> Result<()> {
        let dsp = SECONDARY_DSP;

        self.win
            .write_mem32(PRIMARY_DSP, c6713_hpi::HPICL, c6713_hpi::HPIC_HWOB)?;
        self.win
            .write_mem32(PRIMARY_DSP, c6713_hpi::HPICH, c6713_hpi::HPIC_HWOB)?;
        let hpic = self.win.read_mem32(PRIMARY_DSP, c6713_hpi::HPICL)? & c6713_hpi::HPIC_READBACK_MASK;
        if hpic != c6713_hpi::HPIC_HWOB {
            return Err(self.hpi_fault(c6713_hpi::HPICL, c6713_hpi::HPIC_HWOB, hpic, Fault::C6713Hpic));
        }

        for bit in 0..32 {
            let value = 1u32 << bit;
            self.win.write_mem32(PRIMARY_DSP, c6713_hpi::HPIAL, value)?;
            self.win.write_mem32(PRIMARY_DSP, c6713_hpi::HPIAH, value >> 16)?;
            let low = self.win.read_mem32(PRIMARY_DSP, c6713_hpi::HPIAL)? & c6713_hpi::HALF_MASK;
            let high = self.win.read_mem32(PRIMARY_DSP, c6713_hpi::HPIAH)? & c6713_hpi::HALF_MASK;
            let read = low | (high << 16);
            if read != value {
                return Err(self.hpi_fault(c6713_hpi::HPIAH, value, read, Fault::C6713Hpia));
            }
        }

        // The PLL multiplier cannot be set over HPI; run at the default x7.
        let settle = self.config.reset_delay_us;
        self.win.write_mem32(dsp, pll::PLLCSR, pll::BYPASS)?;
        self.delay.delay_us(settle);
        self.win.write_mem32(dsp, pll::PLLDIV3, pll::DIV3)?;
        self.win.write_mem32(dsp, pll::PLLDIV2, pll::DIV2)?;
        self.win.write_mem32(dsp, pll::PLLDIV1, pll::DIV1)?;
        self.delay.delay_us(settle);
        self.win.write_mem32(PRIMARY_DSP, regs::MCBSP0_PCR, gpo::GPO3_HIGH)?;
        self.win.write_mem32(dsp, pll::PLLCSR, pll::ENABLE)?;
        self.delay.delay_us(settle);
        self.win.write_mem32(PRIMARY_DSP, regs::MCBSP0_PCR, gpo::GPO3_LOW)?;

        // The C6713 now runs at full speed; CE1 can drop its wait states.
        self.win
            .write_mem32(PRIMARY_DSP, emif::CE1, emif::c6205::CE1_RUNNING.encode())?;
        self.delay.delay_us(settle);

        let pllcsr = self.win.read_mem32(dsp, pll::PLLCSR)?;
        if pllcsr & pll::STATUS_MASK != pll::ENABLE {
            error!("DSP 1: PLLCSR {pllcsr:#x}, PLL still bypassed");
            return Err(HpiError::adapter(dsp, Fault::C6713Pll));
        }

        self.win.write_mem32(dsp, emif::GCTL, emif::c6713::GCTL)?;
        self.win.write_mem32(dsp, emif::CE0, emif::CE_SDRAM)?;
        self.win.write_mem32(dsp, emif::SDRAMEXT, emif::c6713::SDRAMEXT)?;
        self.win.write_mem32(dsp, emif::SDRAMCTL, emif::c6713::SDRAMCTL)?;
        self.win
            .write_mem32(dsp, emif::SDRAMTIMING, emif::c6713::SDRAMTIMING)?;
        self.delay.delay_us(settle);
        debug!("DSP 1: HPI, PLL and EMIF configured");
        Ok(())
    }

    fn hpi_fault(&mut self, address: u32, expected: u32, observed: u32, fault: Fault) -> HpiError {
        let mismatch = Mismatch {
            dsp_index: SECONDARY_DSP,
            address,
            expected,
            observed,
        };
        error!("{fault}: {mismatch}");
        self.diagnostics.hpi_register = Some(mismatch);
        HpiError::adapter(SECONDARY_DSP, fault)
    }

    fn test_internal_memory(&mut self, dsp_index: u16) -> Result<()> {
        let regions: [(u32, u32); 2] = match dsp_index {
            PRIMARY_DSP => [
                (memory::C6205_INTERNAL_PROGRAM, memory::C6205_INTERNAL_LEN),
                (memory::C6205_INTERNAL_DATA, memory::C6205_INTERNAL_LEN),
            ],
            SECONDARY_DSP => [
                (memory::C6713_INTERNAL, memory::C6713_INTERNAL_LEN),
                (memory::C6713_L2, memory::C6713_L2_LEN),
            ],
            other => return Err(HpiError::adapter(other, Fault::BadDspIndex)),
        };
        for (start, len) in regions {
            self.test_memory(dsp_index, start, len, Fault::InternalMemory)?;
        }
        debug!("DSP {dsp_index}: internal memory ok");
        Ok(())
    }

    fn test_external_memory(&mut self, family: AdapterFamily, dsp_index: u16) -> Result<()> {
        let start = match dsp_index {
            PRIMARY_DSP if family.primary_has_sdram() => memory::C6205_SDRAM,
            PRIMARY_DSP => return Ok(()),
            SECONDARY_DSP => memory::C6713_SDRAM,
            other => return Err(HpiError::adapter(other, Fault::BadDspIndex)),
        };
        self.test_memory(dsp_index, start, memory::SDRAM_LEN, Fault::ExternalMemory)?;
        debug!("DSP {dsp_index}: external memory ok");
        Ok(())
    }

    /// Walking ones over the first word, a unique pattern over the first
    /// hundred words (each followed by a zero in the next word), then zero
    /// the tested region.
    fn test_memory(&mut self, dsp_index: u16, start: u32, len: u32, fault: Fault) -> Result<()> {
        let words = self.config.memory_test_words.min(len / 4);

        let mut pattern = 1u32;
        while pattern != 0 {
            self.check_word(dsp_index, start, pattern, fault)?;
            pattern <<= 1;
        }

        for i in 0..UNIQUE_PATTERN_WORDS.min(words) {
            let addr = start + i * 4;
            self.win.write_mem32(dsp_index, addr, UNIQUE_PATTERN)?;
            self.win.write_mem32(dsp_index, addr + 4, 0)?;
            let read = self.win.read_mem32(dsp_index, addr)?;
            if read != UNIQUE_PATTERN {
                return Err(self.memory_fault(dsp_index, addr, UNIQUE_PATTERN, read, fault));
            }
            self.win.write_mem32(dsp_index, addr, 0)?;
        }

        for i in 0..words {
            self.win.write_mem32(dsp_index, start + i * 4, 0)?;
        }
        Ok(())
    }

    fn check_word(&mut self, dsp_index: u16, addr: u32, value: u32, fault: Fault) -> Result<()> {
        self.win.write_mem32(dsp_index, addr, value)?;
        let read = self.win.read_mem32(dsp_index, addr)?;
        if read != value {
            return Err(self.memory_fault(dsp_index, addr, value, read, fault));
        }
        Ok(())
    }

    fn memory_fault(
        &mut self,
        dsp_index: u16,
        address: u32,
        expected: u32,
        observed: u32,
        fault: Fault,
    ) -> HpiError {
        let mismatch = Mismatch {
            dsp_index,
            address,
            expected,
            observed,
        };
        error!("{fault}: {mismatch}");
        self.diagnostics.memory = Some(mismatch);
        HpiError::adapter(dsp_index, fault)
    }

    fn test_pld(&mut self, family: AdapterFamily, dsp_index: u16) -> Result<()> {
        match dsp_index {
            PRIMARY_DSP if family.primary_has_pld() => {
                let a = self.win.read_mem32(dsp_index, pld::C6205_SIGNATURE_A)?;
                let b = self.win.read_mem32(dsp_index, pld::C6205_SIGNATURE_B)?;
                if a & 0xF != pld::C6205_EXPECT_A || b & 0xF != pld::C6205_EXPECT_B {
                    error!("DSP 0: PLD signature {a:#x}/{b:#x}");
                    return Err(HpiError::adapter(dsp_index, Fault::Pld));
                }
            }
            SECONDARY_DSP if family.secondary_has_pld() => {
                let sig = self.win.read_mem32(dsp_index, pld::C6713_SIGNATURE)?;
                if sig & 0xFF != pld::C6713_EXPECT {
                    error!("DSP 1: PLD signature {sig:#x}");
                    return Err(HpiError::adapter(dsp_index, Fault::Pld));
                }
                self.win
                    .write_mem32(dsp_index, pld::C6713_LED, pld::C6713_LED_ON)?;
            }
            _ => return Ok(()),
        }
        debug!("DSP {dsp_index}: PLD ok");
        Ok(())
    }

    /// Write every record word by word, then rewind and compare.
    fn load_code(&mut self, dsp_index: u16, image: CodeImage, source: &dyn DspCodeSource) -> Result<()> {
        let mut code = source.open(image)?;

        let mut written = 0usize;
        while let Some(record) = next_record(code.as_mut())? {
            let mut addr = record.header.address;
            for (i, &word) in record.words.iter().enumerate() {
                self.win.write_mem32(dsp_index, addr, word)?;
                if i % READBACK_INTERVAL == 0 {
                    // 6205 advisory 1.4.4
                    self.win.read_mem32(dsp_index, addr)?;
                }
                addr = addr.wrapping_add(WORD_BYTES as u32);
            }
            written += record.words.len();
        }
        debug!("DSP {dsp_index}: wrote {written} words of image {:04x}", image.id());

        code.rewind();
        'verify: while let Some(record) = next_record(code.as_mut())? {
            let mut addr = record.header.address;
            for &word in &record.words {
                let read = self.win.read_mem32(dsp_index, addr)?;
                if read != word {
                    let mismatch = Mismatch {
                        dsp_index,
                        address: addr,
                        expected: word,
                        observed: read,
                    };
                    self.diagnostics.code_verify = Some(mismatch);
                    match self.config.verify {
                        VerifyPolicy::Fatal => {
                            error!("Code verify failed: {mismatch}");
                            return Err(HpiError::adapter(dsp_index, Fault::CodeVerify));
                        }
                        VerifyPolicy::LogOnly => {
                            warn!("Code verify mismatch ignored: {mismatch}");
                            break 'verify;
                        }
                    }
                }
                addr = addr.wrapping_add(WORD_BYTES as u32);
            }
        }
        Ok(())
    }

    /// Write the interface buffer address to the host mailbox until it
    /// reads back.
    fn publish_mailbox(&mut self, bus_address: u32) -> Result<()> {
        let mut read = !bus_address;
        for attempt in 1..=self.config.mailbox_retries {
            self.win
                .write_mem32(PRIMARY_DSP, memory::HOST_MAILBOX, bus_address)?;
            read = self.win.read_mem32(PRIMARY_DSP, memory::HOST_MAILBOX)?;
            if read == bus_address {
                debug!("Interface buffer {bus_address:#010x} published after {attempt} attempt(s)");
                return Ok(());
            }
        }
        let mismatch = Mismatch {
            dsp_index: PRIMARY_DSP,
            address: memory::HOST_MAILBOX,
            expected: bus_address,
            observed: read,
        };
        error!("Host mailbox never read back: {mismatch}");
        self.diagnostics.hpi_register = Some(mismatch);
        Err(HpiError::adapter(PRIMARY_DSP, Fault::HpiRegister))
    }

    fn start_primary(&mut self) {
        let status = self.win.read_reg(BridgeRegister::HostStatus);
        self.win
            .write_reg(BridgeRegister::HostStatus, status & !hsr::INTAM);
        let control = self.win.read_reg(BridgeRegister::HostDspControl);
        self.win
            .write_reg(BridgeRegister::HostDspControl, control | hdcr::DSPINT);
        self.delay.delay_us(self.config.start_delay_us);
    }
}
