//! DSP code image framing.
//!
//! An image is a flat stream of little-endian `u32` words made of records:
//!
//! ```text
//! ┌────────┬─────────┬──────┬──────────────────────┐
//! │ length │ address │ type │ length × data word   │  record
//! └────────┴─────────┴──────┴──────────────────────┘
//! ...
//! 0xFFFF_FFFE            continuation: the next word is a length
//! 0xFFFF_FFFF            end of image
//! ```
//!
//! `length` counts data words. `address` is the DSP byte address of the
//! first word; consecutive words land at consecutive 4-byte addresses.

/// Length word marking the end of the image.
pub const END_OF_IMAGE: u32 = 0xFFFF_FFFF;

/// Length word marking a segment boundary. The real length follows.
pub const CONTINUATION: u32 = 0xFFFF_FFFE;

/// Header words preceding each record's data.
pub const RECORD_HEADER_WORDS: usize = 3;

/// During load, a dummy read-back follows every write whose index within the
/// record is a multiple of this (6205 advisory 1.4.4).
pub const READBACK_INTERVAL: usize = 4;

/// Bytes per image word.
pub const WORD_BYTES: usize = 4;

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Data words in the record.
    pub length: u32,
    /// DSP byte address of the first word.
    pub address: u32,
    /// Memory type tag. Carried through, never interpreted.
    pub kind: u32,
}

impl RecordHeader {
    /// DSP address one past the record's last word.
    #[must_use]
    pub const fn end_address(&self) -> u32 {
        self.address.wrapping_add(self.length.wrapping_mul(WORD_BYTES as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_not_plausible_lengths() {
        assert_ne!(END_OF_IMAGE, CONTINUATION);
        assert!(CONTINUATION > 0x0100_0000);
    }

    #[test]
    fn record_end_address() {
        let rec = RecordHeader {
            length: 4,
            address: 0x1000,
            kind: 0,
        };
        assert_eq!(rec.end_address(), 0x1010);
    }
}
