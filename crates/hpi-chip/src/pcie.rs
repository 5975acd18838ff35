//! PCI identifiers, adapter families and per-family DSP code images.
//!
//! Every 6205-based adapter enumerates with the TI vendor/device pair. The
//! subsystem device ID carries the AudioScience model number, and its top
//! byte selects the family that decides how many DSPs sit behind the bridge
//! and which code image each one runs.

/// Texas Instruments vendor ID (PCI-SIG assigned).
pub const TI_VENDOR_ID: u16 = 0x104C;

/// TMS320C6205 PCI bridge device ID.
pub const DSP6205_DEVICE_ID: u16 = 0xA106;

/// AudioScience subsystem vendor ID.
pub const AUDIOSCIENCE_SUBSYS_VENDOR_ID: u16 = 0x175C;

/// Index of the DSP behind the PCI bridge (the 6205 itself).
pub const PRIMARY_DSP: u16 = 0;

/// Index of the secondary DSP, a C6713 reached through its HPI port on the
/// primary's CE1.
pub const SECONDARY_DSP: u16 = 1;

/// Code image slots per adapter. Only the first two are ever populated.
pub const MAX_DSPS: usize = 3;

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{TI_VENDOR_ID:04x}:{DSP6205_DEVICE_ID:04x}")
}

/// DSP code image identifiers.
///
/// The numeric value is the family ID the code source is asked for. Files on
/// disk are named `dsp<id in lowercase hex>.bin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CodeImage {
    /// Single-DSP image for the ASI5000 family.
    Asi5000 = 0x5000,
    /// Primary image shared by every two-DSP family.
    C6205 = 0x6205,
    /// Secondary C6413 image (ASI6400).
    C6413 = 0x6413,
    /// Secondary image for the ASI6500 and ASI6600 families.
    C6600 = 0x6600,
    /// Secondary C6713 image (ASI8700).
    C8713 = 0x8713,
}

impl CodeImage {
    /// Family ID handed to the code source.
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Conventional file name for this image.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("dsp{:04x}.bin", self.id())
    }
}

/// Adapter family, selected by the top byte of the subsystem device ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterFamily {
    /// ASI5000: one 6205 with external SDRAM and a CE3 PLD.
    Asi5000,
    /// ASI6400: 6205 plus a C6413.
    Asi6400,
    /// ASI6500.
    Asi6500,
    /// ASI6600.
    Asi6600,
    /// ASI8700: 6205 plus a C6713 with a CE1 PLD.
    Asi8700,
}

impl AdapterFamily {
    /// All families in subsystem-ID order.
    pub const ALL: [Self; 5] = [
        Self::Asi5000,
        Self::Asi6400,
        Self::Asi6500,
        Self::Asi6600,
        Self::Asi8700,
    ];

    /// Identify the family from the subsystem device ID.
    ///
    /// Returns `None` for models this driver cannot boot.
    #[must_use]
    pub const fn from_subsys_device_id(id: u16) -> Option<Self> {
        match id & 0xFF00 {
            0x5000 => Some(Self::Asi5000),
            0x6400 => Some(Self::Asi6400),
            0x6500 => Some(Self::Asi6500),
            0x6600 => Some(Self::Asi6600),
            0x8700 => Some(Self::Asi8700),
            _ => None,
        }
    }

    /// Code images in DSP index order. Unused slots are `None`.
    #[must_use]
    pub const fn code_images(self) -> [Option<CodeImage>; MAX_DSPS] {
        match self {
            Self::Asi5000 => [Some(CodeImage::Asi5000), None, None],
            Self::Asi6400 => [Some(CodeImage::C6205), Some(CodeImage::C6413), None],
            Self::Asi6500 | Self::Asi6600 => {
                [Some(CodeImage::C6205), Some(CodeImage::C6600), None]
            }
            Self::Asi8700 => [Some(CodeImage::C6205), Some(CodeImage::C8713), None],
        }
    }

    /// Number of DSPs that receive a code image.
    #[must_use]
    pub fn dsp_count(self) -> usize {
        self.code_images().iter().filter(|c| c.is_some()).count()
    }

    /// Whether a secondary DSP hangs off the 6205 external bus.
    #[must_use]
    pub const fn has_secondary_dsp(self) -> bool {
        !matches!(self, Self::Asi5000)
    }

    /// Whether the primary DSP has SDRAM on CE0 worth testing.
    #[must_use]
    pub const fn primary_has_sdram(self) -> bool {
        matches!(self, Self::Asi5000)
    }

    /// Whether the primary DSP has a signature PLD on CE3.
    #[must_use]
    pub const fn primary_has_pld(self) -> bool {
        matches!(self, Self::Asi5000)
    }

    /// Whether the secondary DSP has a signature PLD on its CE1.
    #[must_use]
    pub const fn secondary_has_pld(self) -> bool {
        matches!(self, Self::Asi8700)
    }
}

impl std::fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Asi5000 => "ASI5000",
            Self::Asi6400 => "ASI6400",
            Self::Asi6500 => "ASI6500",
            Self::Asi6600 => "ASI6600",
            Self::Asi8700 => "ASI8700",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_subsys_id_uses_top_byte() {
        assert_eq!(AdapterFamily::from_subsys_device_id(0x5044), Some(AdapterFamily::Asi5000));
        assert_eq!(AdapterFamily::from_subsys_device_id(0x6416), Some(AdapterFamily::Asi6400));
        assert_eq!(AdapterFamily::from_subsys_device_id(0x6585), Some(AdapterFamily::Asi6500));
        assert_eq!(AdapterFamily::from_subsys_device_id(0x6614), Some(AdapterFamily::Asi6600));
        assert_eq!(AdapterFamily::from_subsys_device_id(0x8702), Some(AdapterFamily::Asi8700));
        assert_eq!(AdapterFamily::from_subsys_device_id(0x4346), None);
    }

    #[test]
    fn two_dsp_families_load_6205_first() {
        for family in AdapterFamily::ALL {
            let images = family.code_images();
            assert!(images[0].is_some());
            assert!(images[2].is_none());
            if family.has_secondary_dsp() {
                assert_eq!(images[0], Some(CodeImage::C6205));
                assert!(images[1].is_some());
                assert_eq!(family.dsp_count(), 2);
            } else {
                assert_eq!(family.dsp_count(), 1);
            }
        }
    }

    #[test]
    fn code_file_names() {
        assert_eq!(CodeImage::C6205.file_name(), "dsp6205.bin");
        assert_eq!(CodeImage::C8713.file_name(), "dsp8713.bin");
        assert_eq!(lspci_filter(), "104c:a106");
    }
}
