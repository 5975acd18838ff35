//! Host interface (HIF): the bus-mastered interface buffer shared between the
//! host and the 6205 firmware.
//!
//! The host allocates one locked block, publishes its bus address in the DSP
//! mailbox, and from then on both sides talk through it. The host writes
//! `host_cmd`, rings the HDCR doorbell, and watches `dsp_ack` and HSR INTSRC.
//!
//! ```text
//! Offset   Size    Field
//! ──────── ─────── ───────────────────────────────────────────────────────
//! 0x0000   4       host_cmd
//! 0x0004   4       dsp_ack
//! 0x0008   4       transfer_size
//! 0x000C   16384   overlay: message | response | bulk data chunk
//! 0x400C   12      control cache descriptor
//! 0x4018   16      async event buffer descriptor
//! 0x4028   384     16 input stream status blocks
//! 0x41A8   384     16 output stream status blocks
//! ```
//!
//! All fields are little-endian `u32` except inside the message and
//! response headers, which pack `u16`s.

// ── Commands and acknowledgements ────────────────────────────────────────────

/// Values written to `host_cmd` and echoed in `dsp_ack`.
pub mod cmd {
    /// DSP has come out of reset and found the interface buffer.
    pub const RESET: u32 = 0;
    /// Nothing in flight.
    pub const IDLE: u32 = 1;
    /// A message sits in the overlay; DSP answers with a response.
    pub const GET_RESP: u32 = 2;
    /// Bulk transfer finished.
    pub const DATA_DONE: u32 = 3;
    /// Host-to-DSP bulk chunk sits in the overlay.
    pub const SEND_DATA: u32 = 0x14;
    /// DSP-to-host bulk chunk requested.
    pub const GET_DATA: u32 = 0x15;
    /// Placeholder ack written before the DSP is started.
    pub const UNKNOWN: u32 = 0xFFFF;
}

/// Value `dsp_ack` holds right after allocation.
pub const ACK_UNINITIALISED: u32 = 0xFFFF_FFFF;

// ── Timing ───────────────────────────────────────────────────────────────────

/// Default poll budget for every HIF wait.
pub const TIMEOUT_POLLS: u32 = 1_000_000;

/// Multiplier on [`TIMEOUT_POLLS`] for the first interrupt after boot.
pub const START_TIMEOUT_FACTOR: u32 = 10;

/// Polls of `dsp_ack` for the reset acknowledgement.
pub const RESET_ACK_RETRIES: u32 = 100;

/// Delay between reset acknowledgement polls (µs).
pub const RESET_ACK_DELAY_US: u32 = 10_000;

/// Delay between idle polls (µs).
pub const IDLE_POLL_DELAY_US: u32 = 1;

/// Delay between bulk chunk interrupt polls (µs).
pub const BULK_POLL_DELAY_US: u32 = 20;

/// Mailbox publish attempts.
pub const MAILBOX_RETRIES: u32 = 10;

// ── Interface buffer layout ──────────────────────────────────────────────────

/// Maximum streams per direction.
pub const MAX_STREAMS: usize = 16;

/// Overlay size, also the bulk chunk size.
pub const DATA_SIZE: usize = 16_384;

/// `host_cmd` offset.
pub const HOST_CMD: usize = 0x0;
/// `dsp_ack` offset.
pub const DSP_ACK: usize = 0x4;
/// `transfer_size` offset.
pub const TRANSFER_SIZE: usize = 0x8;
/// Overlay offset.
pub const OVERLAY: usize = 0xC;

/// Control cache descriptor.
pub mod control_cache {
    /// Descriptor offset.
    pub const BASE: usize = super::OVERLAY + super::DATA_SIZE;
    /// Number of controls the DSP wants cached. Written by the DSP.
    pub const NUMBER_OF_CONTROLS: usize = BASE;
    /// Bus address of the host cache block. Written by the host.
    pub const PHYSICAL_ADDRESS: usize = BASE + 4;
    /// Reserved.
    pub const SPARE: usize = BASE + 8;
    /// Descriptor size.
    pub const LEN: usize = 12;

    /// Bytes per cached control.
    pub const ENTRY_SIZE: usize = 16;
    /// Entry: control index (`u16`).
    pub const ENTRY_CONTROL_INDEX: usize = 0;
    /// Entry: control type (`u16`).
    pub const ENTRY_CONTROL_TYPE: usize = 2;
    /// Entry: attribute (`u16`).
    pub const ENTRY_ATTRIBUTE: usize = 4;
    /// Entry: flags (`u16`).
    pub const ENTRY_FLAGS: usize = 6;
    /// Entry: first parameter.
    pub const ENTRY_PARAM1: usize = 8;
    /// Entry: second parameter.
    pub const ENTRY_PARAM2: usize = 12;
    /// Entry flag: contents are current.
    pub const FLAG_VALID: u16 = 0x1;
}

/// Async event ring descriptor.
pub mod async_buffer {
    /// Descriptor offset.
    pub const BASE: usize = super::control_cache::BASE + super::control_cache::LEN;
    /// Ring capacity in events. Written by the DSP.
    pub const SIZE: usize = BASE;
    /// Host read index.
    pub const HOST_INDEX: usize = BASE + 4;
    /// DSP write index.
    pub const DSP_INDEX: usize = BASE + 8;
    /// Bus address of the host ring. Written by the host.
    pub const PHYSICAL_ADDRESS: usize = BASE + 12;
    /// Descriptor size.
    pub const LEN: usize = 16;

    /// Bytes per event.
    pub const EVENT_SIZE: usize = 12;
    /// Event: type (`u16`).
    pub const EVENT_TYPE: usize = 0;
    /// Event: object index (`u16`).
    pub const EVENT_OBJECT_INDEX: usize = 2;
    /// Event: first parameter.
    pub const EVENT_PARAM1: usize = 4;
    /// Event: second parameter.
    pub const EVENT_PARAM2: usize = 8;
}

/// Per-stream host buffer status block.
pub mod status {
    /// Samples the DSP has processed.
    pub const SAMPLES_PROCESSED: usize = 0;
    /// Ancillary bytes available.
    pub const AUX_DATA_AVAILABLE: usize = 4;
    /// Stream state.
    pub const STREAM_STATE: usize = 8;
    /// DSP side ring index.
    pub const DSP_INDEX: usize = 12;
    /// Host side ring index.
    pub const HOST_INDEX: usize = 16;
    /// Ring size in bytes.
    pub const SIZE_IN_BYTES: usize = 20;
    /// Block size.
    pub const LEN: usize = 24;

    /// Bytes kept free between writer and reader.
    pub const GUARD_BYTES: u32 = 4;
}

/// First input stream status block.
pub const INSTREAM_STATUS: usize = async_buffer::BASE + async_buffer::LEN;

/// First output stream status block.
pub const OUTSTREAM_STATUS: usize = INSTREAM_STATUS + MAX_STREAMS * status::LEN;

/// Total interface buffer size.
pub const INTERFACE_BUFFER_SIZE: usize = OUTSTREAM_STATUS + MAX_STREAMS * status::LEN;

/// Offset of the status block for input stream `index`.
#[must_use]
pub const fn instream_status(index: usize) -> usize {
    INSTREAM_STATUS + index * status::LEN
}

/// Offset of the status block for output stream `index`.
#[must_use]
pub const fn outstream_status(index: usize) -> usize {
    OUTSTREAM_STATUS + index * status::LEN
}

// ── Message and response framing ─────────────────────────────────────────────

/// Header `type` of a message.
pub const TYPE_MESSAGE: u16 = 1;
/// Header `type` of a response.
pub const TYPE_RESPONSE: u16 = 2;

/// Message header size.
pub const MESSAGE_HEADER_SIZE: usize = 12;
/// Message payload area.
pub const MESSAGE_UNION_SIZE: usize = 40;
/// Largest encoded message.
pub const MESSAGE_SIZE: usize = MESSAGE_HEADER_SIZE + MESSAGE_UNION_SIZE;

/// Response header size.
pub const RESPONSE_HEADER_SIZE: usize = 12;
/// Response payload area.
pub const RESPONSE_UNION_SIZE: usize = 48;
/// Largest encoded response.
pub const RESPONSE_SIZE: usize = RESPONSE_HEADER_SIZE + RESPONSE_UNION_SIZE;

/// Stream states reported in status blocks.
pub mod stream_state {
    /// Stopped.
    pub const STOPPED: u32 = 1;
    /// Playing.
    pub const PLAYING: u32 = 2;
    /// Recording.
    pub const RECORDING: u32 = 3;
    /// Output ran dry.
    pub const DRAINED: u32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        assert_eq!(control_cache::BASE, 0x400C);
        assert_eq!(async_buffer::BASE, 0x4018);
        assert_eq!(INSTREAM_STATUS, 0x4028);
        assert_eq!(OUTSTREAM_STATUS, 0x41A8);
        assert_eq!(INTERFACE_BUFFER_SIZE, 0x4328);
        assert_eq!(outstream_status(1) - outstream_status(0), status::LEN);
    }

    #[test]
    fn overlay_holds_message_and_response() {
        assert!(MESSAGE_SIZE <= DATA_SIZE);
        assert!(RESPONSE_SIZE <= DATA_SIZE);
    }

    #[test]
    fn ack_codes_are_distinct() {
        let codes = [
            cmd::RESET,
            cmd::IDLE,
            cmd::GET_RESP,
            cmd::DATA_DONE,
            cmd::SEND_DATA,
            cmd::GET_DATA,
            cmd::UNKNOWN,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
