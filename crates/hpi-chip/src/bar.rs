//! PCI BAR layout of the C6205 bridge and DSP address translation.
//!
//! ```text
//! BAR  Size   Purpose
//! ──── ────── ─────────────────────────────────────────────────────────────
//!  0   4 MB   Prefetchable window onto DSP memory, one 4 MB page at a time.
//!             The page is chosen by the DSPP register.
//!  1   8 MB   Non-prefetchable window onto the DSP register space
//!             0x0180_0000..0x0200_0000, plus the PCI bridge registers
//!             (HSR, HDCR, DSPP) near its top.
//! ```
//!
//! A DSP address is either *register space*, reached directly through BAR1,
//! or *memory*, reached through BAR0 after the page register selects
//! `addr >> 22`.

/// BAR0, the paged DSP memory window.
pub mod bar0 {
    /// BAR index.
    pub const INDEX: u32 = 0;
    /// Window size in bytes.
    pub const SIZE: usize = 4 * 1024 * 1024;
    /// Shift from a DSP address to its page number.
    pub const PAGE_SHIFT: u32 = 22;
    /// Mask from a DSP address to its offset inside the window.
    pub const OFFSET_MASK: u32 = 0x003F_FFFF;
}

/// BAR1, the DSP register window.
pub mod bar1 {
    /// BAR index.
    pub const INDEX: u32 = 1;
    /// Window size in bytes.
    pub const SIZE: usize = 8 * 1024 * 1024;
    /// Mask from a register-space DSP address to its BAR1 offset.
    pub const OFFSET_MASK: u32 = 0x007F_FFFF;
}

/// First DSP address served by BAR1.
pub const REGISTER_SPACE_START: u32 = 0x0180_0000;

/// One past the last DSP address served by BAR1.
pub const REGISTER_SPACE_END: u32 = 0x0200_0000;

/// Whether `addr` lies in the DSP register space behind BAR1.
#[must_use]
pub const fn is_register_space(addr: u32) -> bool {
    addr >= REGISTER_SPACE_START && addr < REGISTER_SPACE_END
}

/// BAR1 byte offset of a register-space address.
#[must_use]
pub const fn register_offset(addr: u32) -> usize {
    (addr & bar1::OFFSET_MASK) as usize
}

/// Page number that must be selected to reach `addr` through BAR0.
#[must_use]
pub const fn page_of(addr: u32) -> u32 {
    addr >> bar0::PAGE_SHIFT
}

/// BAR0 byte offset of `addr` once its page is selected.
#[must_use]
pub const fn page_offset(addr: u32) -> usize {
    (addr & bar0::OFFSET_MASK) as usize
}
