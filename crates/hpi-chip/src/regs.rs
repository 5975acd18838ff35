//! C6205 bridge registers, EMIF and C6713 setup registers, and the DSP
//! memory map the bootloader touches.
//!
//! Bridge registers (HSR, HDCR, DSPP) are BAR1 byte offsets. Everything else
//! is a DSP address and goes through the register window translation.
//!
//! ```text
//! BAR1 offset  Register  Purpose
//! ──────────── ───────── ───────────────────────────────────────────────
//! 0x27_FFF0    HSR       Host status: interrupt source/mask, EEPROM state
//! 0x27_FFF4    HDCR      Host-to-DSP control: warm reset, doorbell
//! 0x27_FFF8    DSPP      DSP page register selecting the BAR0 window
//! ```

// ── PCI bridge registers (BAR1 offsets) ──────────────────────────────────────

/// Base of the bridge register block inside BAR1.
pub const PCI_IO_OFFSET: usize = 0x0027_FFF0;

/// Host status register.
pub const HSR: usize = PCI_IO_OFFSET;

/// Host-to-DSP control register.
pub const HDCR: usize = PCI_IO_OFFSET + 4;

/// DSP page register.
pub const DSPP: usize = PCI_IO_OFFSET + 8;

/// HSR bit definitions.
pub mod hsr {
    /// DSP-to-host interrupt pending. Write 1 to clear.
    pub const INTSRC: u32 = 0x01;
    /// Interrupt available.
    pub const INTAVAL: u32 = 0x02;
    /// Interrupt mask: when set, PINTA is not driven.
    pub const INTAM: u32 = 0x04;
    /// Configuration error during EEPROM autoload.
    pub const CFGERR: u32 = 0x08;
    /// EEPROM autoload completed.
    pub const EEREAD: u32 = 0x10;
}

/// HDCR bit definitions.
pub mod hdcr {
    /// Warm reset of the DSP core.
    pub const WARMRESET: u32 = 0x01;
    /// Host-to-DSP interrupt (the doorbell).
    pub const DSPINT: u32 = 0x02;
    /// Latched boot mode: set when the DSP waits for a PCI boot.
    pub const PCIBOOT: u32 = 0x04;
}

/// DSPP bit definitions.
pub mod dspp {
    /// Always reads back set on top of the written page.
    pub const MAP1: u32 = 0x400;
}

// ── C6205 peripherals (DSP addresses) ────────────────────────────────────────

/// Timer 1 control. Its output releases the secondary DSP from reset.
pub const TIMER1_CTL: u32 = 0x0198_0000;

/// Timer 1 value that drives the secondary reset line inactive.
pub const TIMER1_RELEASE_RESET: u32 = 4;

/// McBSP0 pin control register, used as general purpose output.
pub const MCBSP0_PCR: u32 = 0x018C_0024;

/// McBSP0 pin control values written during bring-up.
pub mod gpo {
    /// Pins configured as outputs, secondary held in reset.
    pub const HOLD_SECONDARY: u32 = 0x2202;
    /// GPO3 high while the secondary PLL starts.
    pub const GPO3_HIGH: u32 = 0x2A0A;
    /// GPO3 low once the PLL is running.
    pub const GPO3_LOW: u32 = 0x2A02;
}

// ── EMIF ─────────────────────────────────────────────────────────────────────

/// External memory interface registers. The C6205 and C6713 share the map.
pub mod emif {
    /// Global control.
    pub const GCTL: u32 = 0x0180_0000;
    /// CE1 space control.
    pub const CE1: u32 = 0x0180_0004;
    /// CE0 space control.
    pub const CE0: u32 = 0x0180_0008;
    /// CE2 space control.
    pub const CE2: u32 = 0x0180_0010;
    /// CE3 space control.
    pub const CE3: u32 = 0x0180_0014;
    /// SDRAM control.
    pub const SDRAMCTL: u32 = 0x0180_0018;
    /// SDRAM refresh timing.
    pub const SDRAMTIMING: u32 = 0x0180_001C;
    /// SDRAM extension (C6713 only).
    pub const SDRAMEXT: u32 = 0x0180_0020;

    /// CE control value selecting SDRAM.
    pub const CE_SDRAM: u32 = 0x30;
    /// `MTYPE` field for 32-bit asynchronous memory.
    pub const MTYPE_ASYNC32: u32 = 2;

    const WS_OFS: u32 = 28;
    const WST_OFS: u32 = 22;
    const WH_OFS: u32 = 20;
    const RS_OFS: u32 = 16;
    const RST_OFS: u32 = 8;
    const MTYPE_OFS: u32 = 4;
    const RH_OFS: u32 = 0;

    /// Asynchronous CE space timing, in EMIF clock cycles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AsyncTiming {
        /// Write setup.
        pub write_setup: u32,
        /// Write strobe.
        pub write_strobe: u32,
        /// Write hold.
        pub write_hold: u32,
        /// Read setup.
        pub read_setup: u32,
        /// Read strobe.
        pub read_strobe: u32,
        /// Read hold.
        pub read_hold: u32,
    }

    impl AsyncTiming {
        /// One-cycle setup and hold with the given strobes.
        #[must_use]
        pub const fn with_strobes(write_strobe: u32, read_strobe: u32) -> Self {
            Self {
                write_setup: 1,
                write_strobe,
                write_hold: 1,
                read_setup: 1,
                read_strobe,
                read_hold: 1,
            }
        }

        /// Encode as a 32-bit asynchronous CE control word.
        #[must_use]
        pub const fn encode(&self) -> u32 {
            (self.write_setup << WS_OFS)
                | (self.write_strobe << WST_OFS)
                | (self.write_hold << WH_OFS)
                | (self.read_setup << RS_OFS)
                | (self.read_strobe << RST_OFS)
                | (self.read_hold << RH_OFS)
                | (MTYPE_ASYNC32 << MTYPE_OFS)
        }
    }

    /// C6205 bring-up values.
    pub mod c6205 {
        use super::AsyncTiming;

        /// Global control.
        pub const GCTL: u32 = 0x3779;
        /// CE1: secondary HPI, slow while the C6713 runs from its 27 MHz input.
        /// The read strobe wants 71 but the field tops out at 63.
        pub const CE1_BOOT: AsyncTiming = AsyncTiming::with_strobes(63, 63);
        /// CE1 once the C6713 PLL is running.
        pub const CE1_RUNNING: AsyncTiming = AsyncTiming::with_strobes(8, 12);
        /// CE2: second C6713 HPI slot.
        pub const CE2: AsyncTiming = AsyncTiming::with_strobes(28, 63);
        /// CE3: PLD.
        pub const CE3: AsyncTiming = AsyncTiming::with_strobes(10, 10);
        /// SDRAM control for 2M×32 (512×32×4 banks).
        pub const SDRAMCTL: u32 = 0x0711_7000;
        /// SDRAM refresh period.
        pub const SDRAMTIMING: u32 = 0x410;
    }

    /// C6713 bring-up values.
    pub mod c6713 {
        /// Global control.
        pub const GCTL: u32 = 0x34A8;
        /// SDRAM extension.
        pub const SDRAMEXT: u32 = 0x001B_DF29;
        /// SDRAM control.
        pub const SDRAMCTL: u32 = 0x4711_7000;
        /// SDRAM refresh period.
        pub const SDRAMTIMING: u32 = 0x410;
    }
}

// ── C6713 host port (reached through C6205 CE1) ──────────────────────────────

/// C6713 HPI registers as seen from the C6205. Only D15..0 are wired, so
/// every 32-bit quantity moves as a low half and a high half.
pub mod c6713_hpi {
    /// HPIC, low half.
    pub const HPICL: u32 = 0x0140_0000;
    /// HPIC, high half.
    pub const HPICH: u32 = 0x0140_0004;
    /// HPIA, low half.
    pub const HPIAL: u32 = 0x0141_0000;
    /// HPIA, high half.
    pub const HPIAH: u32 = 0x0141_0004;
    /// HPID with auto-increment, low half.
    pub const HPIDIL: u32 = 0x0142_0000;
    /// HPID with auto-increment, high half.
    pub const HPIDIH: u32 = 0x0142_0004;
    /// HPID, low half.
    pub const HPIDL: u32 = 0x0143_0000;
    /// HPID, high half.
    pub const HPIDH: u32 = 0x0143_0004;

    /// HPIC value selecting little-endian half-word order (HWOB).
    pub const HPIC_HWOB: u32 = 1;
    /// Bits of HPIC that are not plain read-back (HRDY).
    pub const HPIC_READBACK_MASK: u32 = 0xFFF7;
    /// Width of each half transfer.
    pub const HALF_MASK: u32 = 0xFFFF;
}

/// C6713 PLL controller.
pub mod pll {
    /// PLL control/status.
    pub const PLLCSR: u32 = 0x01B7_C100;
    /// Divider 1 (CPU).
    pub const PLLDIV1: u32 = 0x01B7_C118;
    /// Divider 2 (peripherals).
    pub const PLLDIV2: u32 = 0x01B7_C11C;
    /// Divider 3 (EMIF).
    pub const PLLDIV3: u32 = 0x01B7_C120;

    /// PLLCSR value bypassing the PLL.
    pub const BYPASS: u32 = 0;
    /// PLLCSR value enabling the PLL.
    pub const ENABLE: u32 = 1;
    /// Enabled divide-by-1.
    pub const DIV1: u32 = 0x8000;
    /// Enabled divide-by-2.
    pub const DIV2: u32 = 0x8001;
    /// Enabled divide-by-3.
    pub const DIV3: u32 = 0x8002;
    /// PLLCSR bits checked after enable.
    pub const STATUS_MASK: u32 = 0xF;
}

// ── Memory map ───────────────────────────────────────────────────────────────

/// DSP memory regions exercised by the bootloader.
pub mod memory {
    /// C6205 internal program memory.
    pub const C6205_INTERNAL_PROGRAM: u32 = 0x0000_0000;
    /// C6205 internal data memory.
    pub const C6205_INTERNAL_DATA: u32 = 0x8000_0000;
    /// Length of each C6205 internal block in bytes.
    pub const C6205_INTERNAL_LEN: u32 = 0x1_0000;
    /// C6205 CE0 SDRAM (ASI5000).
    pub const C6205_SDRAM: u32 = 0x0040_0000;

    /// C6713 internal memory.
    pub const C6713_INTERNAL: u32 = 0x0000_0000;
    /// Length of the C6713 internal block.
    pub const C6713_INTERNAL_LEN: u32 = 0x3_0000;
    /// C6713 internal memory usable as L2 cache.
    pub const C6713_L2: u32 = 0x0003_0000;
    /// Length of the C6713 L2 block.
    pub const C6713_L2_LEN: u32 = 0x1_0000;
    /// C6713 CE0 SDRAM.
    pub const C6713_SDRAM: u32 = 0x8000_0000;

    /// SDRAM length on either DSP.
    pub const SDRAM_LEN: u32 = 0x20_0000;

    /// Primary DSP word that receives the interface buffer bus address.
    pub const HOST_MAILBOX: u32 = 0x8000_0000;
}

/// Signature PLDs.
pub mod pld {
    /// ASI5000 PLD signature word A (CE3).
    pub const C6205_SIGNATURE_A: u32 = 0x0300_0008;
    /// ASI5000 PLD signature word B (CE3).
    pub const C6205_SIGNATURE_B: u32 = 0x0300_000C;
    /// Expected low nibble of signature A.
    pub const C6205_EXPECT_A: u32 = 0x5;
    /// Expected low nibble of signature B.
    pub const C6205_EXPECT_B: u32 = 0xA;

    /// ASI8700 PLD signature (C6713 CE1).
    pub const C6713_SIGNATURE: u32 = 0x9000_0010;
    /// Expected low byte of the C6713 signature.
    pub const C6713_EXPECT: u32 = 0xAA;
    /// ASI8700 PLD LED control.
    pub const C6713_LED: u32 = 0x9000_0000;
    /// LED control value turning the LED on.
    pub const C6713_LED_ON: u32 = 0x02;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_registers_are_consecutive() {
        assert_eq!(HDCR - HSR, 4);
        assert_eq!(DSPP - HDCR, 4);
        assert!(DSPP < crate::bar::bar1::SIZE);
    }

    #[test]
    fn emif_timing_encoding() {
        assert_eq!(emif::c6205::CE1_BOOT.encode(), 0x1FD1_3F21);
        assert_eq!(emif::c6205::CE3.encode(), 0x1291_0A21);
        assert_eq!(emif::c6205::CE1_RUNNING.encode(), 0x1211_0C21);
    }

    #[test]
    fn hpi_registers_sit_outside_register_space() {
        use crate::bar::is_register_space;
        assert!(!is_register_space(c6713_hpi::HPICL));
        assert!(!is_register_space(c6713_hpi::HPIDH));
        assert!(is_register_space(emif::GCTL));
        assert!(is_register_space(TIMER1_CTL));
        assert!(is_register_space(MCBSP0_PCR));
    }
}
