//! HPI messages and responses.
//!
//! In memory a [`Message`] is a header plus a [`MessagePayload`] keyed by
//! object; a [`Response`] mirrors it with an error code and a
//! [`ResponsePayload`]. On the wire both are fixed-size little-endian
//! records: a 12-byte header followed by a zero-padded union. Bulk data
//! (`Bytes` fields) never travels in the record; the bulk relay moves it
//! through the interface buffer after the exchange.

use crate::error::{HpiError, Result};
use crate::mmio::PciResource;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hpi_chip::hif::{
    MESSAGE_HEADER_SIZE, MESSAGE_SIZE, MESSAGE_UNION_SIZE, RESPONSE_HEADER_SIZE, RESPONSE_SIZE,
    RESPONSE_UNION_SIZE, TYPE_MESSAGE, TYPE_RESPONSE,
};

/// Adapters a subsystem listing can name.
pub const MAX_ADAPTERS: usize = 16;

/// Async events carried by one response.
pub const MAX_EVENTS_PER_RESPONSE: usize = 3;

/// Object a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjectType {
    /// Process-wide adapter registry
    Subsystem = 1,
    /// One adapter
    Adapter = 2,
    /// Playback stream
    OStream = 3,
    /// Record stream
    IStream = 4,
    /// Mixer
    Mixer = 5,
    /// Mixer node
    Node = 6,
    /// Control
    Control = 7,
    /// Non-volatile memory
    NvMemory = 8,
    /// GPIO
    Gpio = 9,
    /// Watchdog
    Watchdog = 10,
    /// Sample clock
    Clock = 11,
    /// Profiler
    Profile = 12,
    /// Control with bulk data
    ControlEx = 13,
    /// Async event ring
    AsyncEvent = 14,
}

impl ObjectType {
    const ALL: [Self; 14] = [
        Self::Subsystem,
        Self::Adapter,
        Self::OStream,
        Self::IStream,
        Self::Mixer,
        Self::Node,
        Self::Control,
        Self::NvMemory,
        Self::Gpio,
        Self::Watchdog,
        Self::Clock,
        Self::Profile,
        Self::ControlEx,
        Self::AsyncEvent,
    ];

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Object for a wire code.
    ///
    /// # Errors
    ///
    /// Returns an invalid object error for unknown codes.
    pub fn from_code(code: u16) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|o| o.code() == code)
            .ok_or(HpiError::InvalidObject { object: code })
    }

    /// Whether this is one of the two stream objects.
    #[must_use]
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::OStream | Self::IStream)
    }
}

/// Function codes, `(object << 8) | n`.
pub mod func {
    /// Subsystem functions.
    pub mod subsys {
        /// Open
        pub const OPEN: u16 = 0x0101;
        /// Version query
        pub const GET_VERSION: u16 = 0x0102;
        /// List adapters
        pub const GET_INFO: u16 = 0x0103;
        /// Bus scan (not supported by this driver)
        pub const FIND_ADAPTERS: u16 = 0x0104;
        /// Create and boot an adapter
        pub const CREATE_ADAPTER: u16 = 0x0105;
        /// Close
        pub const CLOSE: u16 = 0x0106;
        /// Remove an adapter
        pub const DELETE_ADAPTER: u16 = 0x0107;
        /// Driver load
        pub const DRIVER_LOAD: u16 = 0x0108;
        /// Driver unload
        pub const DRIVER_UNLOAD: u16 = 0x0109;
    }

    /// Adapter functions.
    pub mod adapter {
        /// Open
        pub const OPEN: u16 = 0x0201;
        /// Close
        pub const CLOSE: u16 = 0x0202;
        /// Identity and stream counts
        pub const GET_INFO: u16 = 0x0203;
        /// Fetch a DSP assert
        pub const GET_ASSERT: u16 = 0x0204;
        /// Raise a test assert
        pub const TEST_ASSERT: u16 = 0x0205;
        /// Set operating mode
        pub const SET_MODE: u16 = 0x0206;
        /// Get operating mode
        pub const GET_MODE: u16 = 0x0207;
        /// Drive the LED
        pub const ENABLE_CAPABILITY: u16 = 0x0208;
        /// Run the DSP self test
        pub const SELFTEST: u16 = 0x0209;
        /// Look up an object by type
        pub const FIND_OBJECT: u16 = 0x020A;
        /// Query a property
        pub const GET_PROPERTY: u16 = 0x020F;
    }

    /// Output stream functions.
    pub mod ostream {
        /// Open
        pub const OPEN: u16 = 0x0301;
        /// Close
        pub const CLOSE: u16 = 0x0302;
        /// Queue samples
        pub const WRITE: u16 = 0x0303;
        /// Start playback
        pub const START: u16 = 0x0304;
        /// Stop playback
        pub const STOP: u16 = 0x0305;
        /// Reset
        pub const RESET: u16 = 0x0306;
        /// State and fill level
        pub const GET_INFO: u16 = 0x0307;
        /// Check a format
        pub const QUERY_FORMAT: u16 = 0x0308;
        /// Reset ancillary data
        pub const ANC_RESET: u16 = 0x030D;
        /// Ancillary data state
        pub const ANC_GET_INFO: u16 = 0x030E;
        /// Read ancillary data
        pub const ANC_READ: u16 = 0x030F;
        /// Set the sample format
        pub const SET_FORMAT: u16 = 0x0311;
        /// Allocate or grant a host buffer
        pub const HOSTBUFFER_ALLOC: u16 = 0x0312;
        /// Free or revoke a host buffer
        pub const HOSTBUFFER_FREE: u16 = 0x0313;
    }

    /// Input stream functions.
    pub mod istream {
        /// Open
        pub const OPEN: u16 = 0x0401;
        /// Close
        pub const CLOSE: u16 = 0x0402;
        /// Set the sample format
        pub const SET_FORMAT: u16 = 0x0403;
        /// Fetch samples
        pub const READ: u16 = 0x0404;
        /// Start recording
        pub const START: u16 = 0x0405;
        /// Stop recording
        pub const STOP: u16 = 0x0406;
        /// Reset
        pub const RESET: u16 = 0x0407;
        /// State and fill level
        pub const GET_INFO: u16 = 0x0408;
        /// Check a format
        pub const QUERY_FORMAT: u16 = 0x0409;
        /// Reset ancillary data
        pub const ANC_RESET: u16 = 0x040A;
        /// Ancillary data state
        pub const ANC_GET_INFO: u16 = 0x040B;
        /// Write ancillary data
        pub const ANC_WRITE: u16 = 0x040C;
        /// Allocate or grant a host buffer
        pub const HOSTBUFFER_ALLOC: u16 = 0x040D;
        /// Free or revoke a host buffer
        pub const HOSTBUFFER_FREE: u16 = 0x040E;
    }

    /// Control functions.
    pub mod control {
        /// Control description
        pub const GET_INFO: u16 = 0x0701;
        /// Read a value
        pub const GET_STATE: u16 = 0x0702;
        /// Write a value
        pub const SET_STATE: u16 = 0x0703;
    }

    /// Extended control functions.
    pub mod controlex {
        /// Control description
        pub const GET_INFO: u16 = 0x0D01;
        /// Read a value or bulk block
        pub const GET_STATE: u16 = 0x0D02;
        /// Write a value or bulk block
        pub const SET_STATE: u16 = 0x0D03;
    }

    /// Async event functions.
    pub mod asyncevent {
        /// Open
        pub const OPEN: u16 = 0x0E01;
        /// Close
        pub const CLOSE: u16 = 0x0E02;
        /// Events waiting
        pub const GET_COUNT: u16 = 0x0E04;
        /// Take events
        pub const GET: u16 = 0x0E05;
    }
}

/// Extended control attributes that move a bulk block.
pub mod controlex_attribute {
    /// Set state with a block sent after the exchange
    pub const BULK_SET: u16 = 0x0003;
    /// Get state with a block fetched after the exchange
    pub const BULK_GET: u16 = 0x0004;
}

/// Host buffer command carried by HOSTBUFFER_ALLOC and HOSTBUFFER_FREE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCommand {
    /// Host allocates and grants in one step
    External,
    /// Host allocates only
    InternalAlloc,
    /// Grant an allocated buffer to the DSP
    GrantAdapter,
    /// Host frees only
    InternalFree,
    /// Revoke the DSP's use of the buffer
    RevokeAdapter,
}

impl BufferCommand {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::External => 0,
            Self::InternalAlloc => 1,
            Self::GrantAdapter => 2,
            Self::InternalFree => 3,
            Self::RevokeAdapter => 4,
        }
    }

    /// Command for a wire code.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation error for unknown codes.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::External),
            1 => Ok(Self::InternalAlloc),
            2 => Ok(Self::GrantAdapter),
            3 => Ok(Self::InternalFree),
            4 => Ok(Self::RevokeAdapter),
            other => Err(HpiError::invalid_operation(format!(
                "unknown host buffer command {other}"
            ))),
        }
    }
}

/// Sample format descriptor, 20 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Compressed bitrate, 0 for PCM
    pub bitrate: u32,
    /// Format-specific attributes
    pub attributes: u32,
    /// Format-specific mode
    pub mode: u16,
    /// Channel count
    pub channels: u16,
    /// Sample format code
    pub format: u16,
}

impl AudioFormat {
    /// Bytes on the wire.
    pub const WIRE_SIZE: usize = 20;

    /// PCM format of `channels` at `sample_rate`.
    #[must_use]
    pub const fn pcm(format: u16, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bitrate: 0,
            attributes: 0,
            mode: 0,
            channels,
            format,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sample_rate);
        buf.put_u32_le(self.bitrate);
        buf.put_u32_le(self.attributes);
        buf.put_u16_le(self.mode);
        buf.put_u16_le(0);
        buf.put_u16_le(self.channels);
        buf.put_u16_le(self.format);
    }

    fn get(buf: &mut &[u8]) -> Self {
        let sample_rate = buf.get_u32_le();
        let bitrate = buf.get_u32_le();
        let attributes = buf.get_u32_le();
        let mode = buf.get_u16_le();
        buf.advance(2);
        let channels = buf.get_u16_le();
        let format = buf.get_u16_le();
        Self {
            sample_rate,
            bitrate,
            attributes,
            mode,
            channels,
            format,
        }
    }
}

/// One event from the DSP async event ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncEvent {
    /// Event type
    pub event_type: u16,
    /// Index of the object that raised it
    pub object_index: u16,
    /// First parameter
    pub param1: u32,
    /// Second parameter
    pub param2: u32,
}

/// Subsystem message body.
#[derive(Debug, Clone, Default)]
pub struct SubsysRequest {
    /// Adapter to delete
    pub adapter_index: u16,
    /// Card to create. Only the ids travel on the wire.
    pub resource: Option<PciResource>,
}

impl PartialEq for SubsysRequest {
    fn eq(&self, other: &Self) -> bool {
        let ids = |r: &PciResource| {
            (
                r.vendor_id,
                r.device_id,
                r.subsys_vendor_id,
                r.subsys_device_id,
            )
        };
        self.adapter_index == other.adapter_index
            && self.resource.as_ref().map(ids) == other.resource.as_ref().map(ids)
    }
}

/// Adapter message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterRequest {
    /// Mode, assert value or object type
    pub mode: u32,
    /// Object index
    pub index: u16,
    /// Property code
    pub property: u16,
    /// First parameter
    pub parameter1: u16,
    /// Second parameter
    pub parameter2: u16,
}

/// Control message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlRequest {
    /// Control index
    pub control_index: u16,
    /// Attribute
    pub attribute: u16,
    /// First value
    pub param1: u32,
    /// Second value
    pub param2: u32,
}

/// Extended control message body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlExRequest {
    /// Control index
    pub control_index: u16,
    /// Attribute
    pub attribute: u16,
    /// Bulk block length
    pub byte_count: u32,
    /// Block to send for a bulk set
    pub data: Bytes,
}

/// Stream message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamBody {
    /// Function-specific parameter
    Value(u32),
    /// Sample transfer
    Data {
        /// Format of the samples
        format: AudioFormat,
        /// Bytes to move
        size: u32,
        /// Samples to write; empty for reads
        data: Bytes,
    },
    /// Format descriptor
    Format(AudioFormat),
    /// Host buffer command
    Buffer {
        /// What to do
        command: BufferCommand,
        /// Buffer size in bytes
        size: u32,
        /// Bus address granted to the DSP
        pci_address: u32,
    },
}

/// Stream message: index plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Stream index
    pub index: u16,
    /// Body
    pub body: StreamBody,
}

/// Async event message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncEventRequest {
    /// Most events to return
    pub max_events: u16,
}

/// Message payload, keyed by object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    /// No body
    None,
    /// Subsystem body
    Subsystem(SubsysRequest),
    /// Adapter body
    Adapter(AdapterRequest),
    /// Control body
    Control(ControlRequest),
    /// Extended control body
    ControlEx(ControlExRequest),
    /// Stream body
    Stream(StreamRequest),
    /// Async event body
    AsyncEvent(AsyncEventRequest),
    /// Opaque union for objects relayed verbatim
    Raw(Bytes),
}

// SubsysRequest holds Arc<dyn PciBar>; equality above covers ids only.
impl Eq for SubsysRequest {}

/// One HPI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Addressed object
    pub object: ObjectType,
    /// Function code
    pub function: u16,
    /// Adapter index
    pub adapter_index: u16,
    /// DSP index
    pub dsp_index: u16,
    /// Body
    pub payload: MessagePayload,
}

impl Message {
    /// Message with no body.
    #[must_use]
    pub fn new(object: ObjectType, function: u16, adapter_index: u16) -> Self {
        Self {
            object,
            function,
            adapter_index,
            dsp_index: 0,
            payload: MessagePayload::None,
        }
    }

    /// Message with `payload`.
    #[must_use]
    pub fn with_payload(mut self, payload: MessagePayload) -> Self {
        self.payload = payload;
        self
    }

    /// Subsystem message with an empty body.
    #[must_use]
    pub fn subsys(function: u16) -> Self {
        Self::new(ObjectType::Subsystem, function, 0)
            .with_payload(MessagePayload::Subsystem(SubsysRequest::default()))
    }

    /// Create and boot the adapter at `resource`.
    #[must_use]
    pub fn create_adapter(resource: PciResource) -> Self {
        Self::new(ObjectType::Subsystem, func::subsys::CREATE_ADAPTER, 0).with_payload(
            MessagePayload::Subsystem(SubsysRequest {
                adapter_index: 0,
                resource: Some(resource),
            }),
        )
    }

    /// Remove adapter `adapter_index`.
    #[must_use]
    pub fn delete_adapter(adapter_index: u16) -> Self {
        Self::new(ObjectType::Subsystem, func::subsys::DELETE_ADAPTER, adapter_index).with_payload(
            MessagePayload::Subsystem(SubsysRequest {
                adapter_index,
                resource: None,
            }),
        )
    }

    /// Adapter message with a default body.
    #[must_use]
    pub fn adapter(adapter_index: u16, function: u16) -> Self {
        Self::new(ObjectType::Adapter, function, adapter_index)
            .with_payload(MessagePayload::Adapter(AdapterRequest::default()))
    }

    /// Control get-state.
    #[must_use]
    pub fn control_get(adapter_index: u16, control_index: u16, attribute: u16) -> Self {
        Self::new(ObjectType::Control, func::control::GET_STATE, adapter_index).with_payload(
            MessagePayload::Control(ControlRequest {
                control_index,
                attribute,
                ..ControlRequest::default()
            }),
        )
    }

    /// Control set-state.
    #[must_use]
    pub fn control_set(
        adapter_index: u16,
        control_index: u16,
        attribute: u16,
        param1: u32,
        param2: u32,
    ) -> Self {
        Self::new(ObjectType::Control, func::control::SET_STATE, adapter_index).with_payload(
            MessagePayload::Control(ControlRequest {
                control_index,
                attribute,
                param1,
                param2,
            }),
        )
    }

    /// Extended control bulk set.
    #[must_use]
    pub fn controlex_bulk_set(adapter_index: u16, control_index: u16, data: Bytes) -> Self {
        // Truncation safe: bulk blocks are far below 4 GB
        #[allow(clippy::cast_possible_truncation)]
        let byte_count = data.len() as u32;
        Self::new(ObjectType::ControlEx, func::controlex::SET_STATE, adapter_index).with_payload(
            MessagePayload::ControlEx(ControlExRequest {
                control_index,
                attribute: controlex_attribute::BULK_SET,
                byte_count,
                data,
            }),
        )
    }

    /// Extended control bulk get of at most `max_bytes`.
    #[must_use]
    pub fn controlex_bulk_get(adapter_index: u16, control_index: u16, max_bytes: u32) -> Self {
        Self::new(ObjectType::ControlEx, func::controlex::GET_STATE, adapter_index).with_payload(
            MessagePayload::ControlEx(ControlExRequest {
                control_index,
                attribute: controlex_attribute::BULK_GET,
                byte_count: max_bytes,
                data: Bytes::new(),
            }),
        )
    }

    /// Stream message with `body`.
    #[must_use]
    pub fn stream(
        object: ObjectType,
        adapter_index: u16,
        index: u16,
        function: u16,
        body: StreamBody,
    ) -> Self {
        Self::new(object, function, adapter_index)
            .with_payload(MessagePayload::Stream(StreamRequest { index, body }))
    }

    /// Output stream message with a zero parameter.
    #[must_use]
    pub fn ostream(adapter_index: u16, index: u16, function: u16) -> Self {
        Self::stream(ObjectType::OStream, adapter_index, index, function, StreamBody::Value(0))
    }

    /// Input stream message with a zero parameter.
    #[must_use]
    pub fn istream(adapter_index: u16, index: u16, function: u16) -> Self {
        Self::stream(ObjectType::IStream, adapter_index, index, function, StreamBody::Value(0))
    }

    /// Queue `data` on output stream `index`.
    #[must_use]
    pub fn ostream_write(adapter_index: u16, index: u16, format: AudioFormat, data: Bytes) -> Self {
        // Truncation safe: transfers are far below 4 GB
        #[allow(clippy::cast_possible_truncation)]
        let size = data.len() as u32;
        Self::stream(
            ObjectType::OStream,
            adapter_index,
            index,
            func::ostream::WRITE,
            StreamBody::Data { format, size, data },
        )
    }

    /// Fetch `size` bytes from input stream `index`.
    #[must_use]
    pub fn istream_read(adapter_index: u16, index: u16, size: u32) -> Self {
        Self::stream(
            ObjectType::IStream,
            adapter_index,
            index,
            func::istream::READ,
            StreamBody::Data {
                format: AudioFormat::default(),
                size,
                data: Bytes::new(),
            },
        )
    }

    /// Host buffer alloc on a stream object.
    #[must_use]
    pub fn host_buffer_alloc(
        object: ObjectType,
        adapter_index: u16,
        index: u16,
        command: BufferCommand,
        size: u32,
    ) -> Self {
        let function = match object {
            ObjectType::IStream => func::istream::HOSTBUFFER_ALLOC,
            _ => func::ostream::HOSTBUFFER_ALLOC,
        };
        Self::stream(
            object,
            adapter_index,
            index,
            function,
            StreamBody::Buffer {
                command,
                size,
                pci_address: 0,
            },
        )
    }

    /// Host buffer free on a stream object.
    #[must_use]
    pub fn host_buffer_free(
        object: ObjectType,
        adapter_index: u16,
        index: u16,
        command: BufferCommand,
    ) -> Self {
        let function = match object {
            ObjectType::IStream => func::istream::HOSTBUFFER_FREE,
            _ => func::ostream::HOSTBUFFER_FREE,
        };
        Self::stream(
            object,
            adapter_index,
            index,
            function,
            StreamBody::Buffer {
                command,
                size: 0,
                pci_address: 0,
            },
        )
    }

    /// Async event message.
    #[must_use]
    pub fn async_event(adapter_index: u16, function: u16, max_events: u16) -> Self {
        Self::new(ObjectType::AsyncEvent, function, adapter_index)
            .with_payload(MessagePayload::AsyncEvent(AsyncEventRequest { max_events }))
    }

    /// Stream body, if this is a stream message.
    #[must_use]
    pub fn stream_request(&self) -> Option<&StreamRequest> {
        match &self.payload {
            MessagePayload::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Control body, if this is a control message.
    #[must_use]
    pub fn control_request(&self) -> Option<&ControlRequest> {
        match &self.payload {
            MessagePayload::Control(c) => Some(c),
            _ => None,
        }
    }

    /// Extended control body, if this is one.
    #[must_use]
    pub fn controlex_request(&self) -> Option<&ControlExRequest> {
        match &self.payload {
            MessagePayload::ControlEx(c) => Some(c),
            _ => None,
        }
    }

    /// Fixed-size wire record.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
        // Truncation safe: MESSAGE_SIZE is 52
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(MESSAGE_SIZE as u16);
        buf.put_u16_le(TYPE_MESSAGE);
        buf.put_u16_le(self.object.code());
        buf.put_u16_le(self.function);
        buf.put_u16_le(self.adapter_index);
        buf.put_u16_le(self.dsp_index);
        self.put_payload(&mut buf);
        pad_to(&mut buf, MESSAGE_SIZE);
        buf.freeze()
    }

    fn put_payload(&self, buf: &mut BytesMut) {
        match &self.payload {
            MessagePayload::None => {}
            MessagePayload::Subsystem(s) => {
                match &s.resource {
                    Some(r) => {
                        buf.put_u16_le(1);
                        buf.put_u16_le(r.vendor_id);
                        buf.put_u16_le(r.device_id);
                        buf.put_u16_le(r.subsys_vendor_id);
                        buf.put_u16_le(r.subsys_device_id);
                    }
                    None => buf.put_bytes(0, 10),
                }
                buf.put_u16_le(s.adapter_index);
            }
            MessagePayload::Adapter(a) => {
                buf.put_u32_le(a.mode);
                buf.put_u16_le(a.index);
                buf.put_u16_le(a.property);
                buf.put_u16_le(a.parameter1);
                buf.put_u16_le(a.parameter2);
            }
            MessagePayload::Control(c) => {
                buf.put_u16_le(c.control_index);
                buf.put_u16_le(c.attribute);
                buf.put_u32_le(c.param1);
                buf.put_u32_le(c.param2);
            }
            MessagePayload::ControlEx(c) => {
                buf.put_u16_le(c.control_index);
                buf.put_u16_le(c.attribute);
                buf.put_u32_le(c.byte_count);
            }
            MessagePayload::Stream(s) => {
                buf.put_u16_le(s.index);
                buf.put_u16_le(0);
                match &s.body {
                    StreamBody::Value(v) => buf.put_u32_le(*v),
                    StreamBody::Data { format, size, .. } => {
                        format.put(buf);
                        buf.put_u32_le(*size);
                    }
                    StreamBody::Format(format) => format.put(buf),
                    StreamBody::Buffer {
                        command,
                        size,
                        pci_address,
                    } => {
                        buf.put_u32_le(command.code());
                        buf.put_u32_le(*size);
                        buf.put_u32_le(*pci_address);
                    }
                }
            }
            MessagePayload::AsyncEvent(a) => buf.put_u16_le(a.max_events),
            MessagePayload::Raw(raw) => {
                buf.put_slice(&raw[..raw.len().min(MESSAGE_UNION_SIZE)]);
            }
        }
    }

    /// Parse a wire record.
    ///
    /// # Errors
    ///
    /// Returns an invalid type error if the header is not a message, an
    /// invalid object error for unknown objects, and a processing error for
    /// short records or unknown buffer commands.
    pub fn decode(record: &[u8]) -> Result<Self> {
        if record.len() < MESSAGE_SIZE {
            return Err(HpiError::processing(format!(
                "message record of {} bytes, need {MESSAGE_SIZE}",
                record.len()
            )));
        }
        let mut header = &record[..MESSAGE_HEADER_SIZE];
        let _size = header.get_u16_le();
        let kind = header.get_u16_le();
        if kind != TYPE_MESSAGE {
            return Err(HpiError::InvalidType { found: kind });
        }
        let object = ObjectType::from_code(header.get_u16_le())?;
        let function = header.get_u16_le();
        let adapter_index = header.get_u16_le();
        let dsp_index = header.get_u16_le();
        let union = &record[MESSAGE_HEADER_SIZE..MESSAGE_SIZE];
        let payload = decode_message_payload(object, function, union)?;
        Ok(Self {
            object,
            function,
            adapter_index,
            dsp_index,
            payload,
        })
    }
}

fn is_data_function(object: ObjectType, function: u16) -> bool {
    match object {
        ObjectType::OStream => {
            matches!(function, func::ostream::WRITE | func::ostream::ANC_READ)
        }
        ObjectType::IStream => {
            matches!(function, func::istream::READ | func::istream::ANC_WRITE)
        }
        _ => false,
    }
}

fn is_format_function(function: u16) -> bool {
    matches!(
        function,
        func::ostream::SET_FORMAT
            | func::ostream::QUERY_FORMAT
            | func::istream::SET_FORMAT
            | func::istream::QUERY_FORMAT
    )
}

fn is_buffer_function(function: u16) -> bool {
    matches!(
        function,
        func::ostream::HOSTBUFFER_ALLOC
            | func::ostream::HOSTBUFFER_FREE
            | func::istream::HOSTBUFFER_ALLOC
            | func::istream::HOSTBUFFER_FREE
    )
}

fn decode_message_payload(object: ObjectType, function: u16, union: &[u8]) -> Result<MessagePayload> {
    let mut buf = union;
    let payload = match object {
        ObjectType::Subsystem => {
            // Bus type and PCI ids: a resource cannot be rebuilt from them.
            buf.advance(10);
            let adapter_index = buf.get_u16_le();
            MessagePayload::Subsystem(SubsysRequest {
                adapter_index,
                resource: None,
            })
        }
        ObjectType::Adapter => MessagePayload::Adapter(AdapterRequest {
            mode: buf.get_u32_le(),
            index: buf.get_u16_le(),
            property: buf.get_u16_le(),
            parameter1: buf.get_u16_le(),
            parameter2: buf.get_u16_le(),
        }),
        ObjectType::Control => MessagePayload::Control(ControlRequest {
            control_index: buf.get_u16_le(),
            attribute: buf.get_u16_le(),
            param1: buf.get_u32_le(),
            param2: buf.get_u32_le(),
        }),
        ObjectType::ControlEx => MessagePayload::ControlEx(ControlExRequest {
            control_index: buf.get_u16_le(),
            attribute: buf.get_u16_le(),
            byte_count: buf.get_u32_le(),
            data: Bytes::new(),
        }),
        ObjectType::OStream | ObjectType::IStream => {
            let index = buf.get_u16_le();
            buf.advance(2);
            let body = if is_data_function(object, function) {
                let format = AudioFormat::get(&mut buf);
                StreamBody::Data {
                    format,
                    size: buf.get_u32_le(),
                    data: Bytes::new(),
                }
            } else if is_format_function(function) {
                StreamBody::Format(AudioFormat::get(&mut buf))
            } else if is_buffer_function(function) {
                let command = BufferCommand::from_code(buf.get_u32_le())
                    .map_err(|e| HpiError::processing(e.to_string()))?;
                StreamBody::Buffer {
                    command,
                    size: buf.get_u32_le(),
                    pci_address: buf.get_u32_le(),
                }
            } else {
                StreamBody::Value(buf.get_u32_le())
            };
            MessagePayload::Stream(StreamRequest { index, body })
        }
        ObjectType::AsyncEvent => MessagePayload::AsyncEvent(AsyncEventRequest {
            max_events: buf.get_u16_le(),
        }),
        _ => MessagePayload::Raw(Bytes::copy_from_slice(union)),
    };
    Ok(payload)
}

/// Subsystem result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubsysResult {
    /// Driver version
    pub version: u32,
    /// Function-specific data
    pub data: u32,
    /// Adapters registered
    pub num_adapters: u16,
    /// Index of the adapter just created
    pub adapter_index: u16,
    /// Adapter type by index, 0 for empty slots
    pub adapter_list: [u16; MAX_ADAPTERS],
}

/// Adapter result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterResult {
    /// Index the adapter reports for itself
    pub adapter_index: u16,
    /// Adapter type
    pub adapter_type: u16,
    /// Serial number
    pub serial_number: u32,
    /// Hardware version
    pub version: u16,
    /// Output streams
    pub num_outstreams: u16,
    /// Input streams
    pub num_instreams: u16,
    /// First function-specific value
    pub param1: u32,
    /// Second function-specific value
    pub param2: u32,
}

/// Control result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlResult {
    /// First value
    pub param1: u32,
    /// Second value
    pub param2: u32,
}

/// Extended control result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlExResult {
    /// Bytes the DSP has ready for a bulk get
    pub byte_count: u32,
    /// Block fetched by the bulk relay
    pub data: Bytes,
}

/// Stream result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamResult {
    /// Stream state
    pub state: u16,
    /// Host buffer size
    pub buffer_size: u32,
    /// Bytes queued (output) or ready (input)
    pub data_available: u32,
    /// Samples the DSP has processed
    pub samples_transferred: u32,
    /// Ancillary bytes ready
    pub aux_data_available: u32,
    /// Samples fetched by a read
    pub data: Bytes,
}

/// Async event result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncEventResult {
    /// Events waiting (GET_COUNT) or returned (GET)
    pub count: u16,
    /// Events returned
    pub events: Vec<AsyncEvent>,
}

/// Response payload, keyed by object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// No body
    None,
    /// Subsystem result
    Subsystem(SubsysResult),
    /// Adapter result
    Adapter(AdapterResult),
    /// Control result
    Control(ControlResult),
    /// Extended control result
    ControlEx(ControlExResult),
    /// Stream result
    Stream(StreamResult),
    /// Async event result
    AsyncEvent(AsyncEventResult),
    /// Opaque union for objects relayed verbatim
    Raw(Bytes),
}

impl ResponsePayload {
    /// Zeroed payload for `object`.
    #[must_use]
    pub fn default_for(object: ObjectType) -> Self {
        match object {
            ObjectType::Subsystem => Self::Subsystem(SubsysResult::default()),
            ObjectType::Adapter => Self::Adapter(AdapterResult::default()),
            ObjectType::Control => Self::Control(ControlResult::default()),
            ObjectType::ControlEx => Self::ControlEx(ControlExResult::default()),
            ObjectType::OStream | ObjectType::IStream => Self::Stream(StreamResult::default()),
            ObjectType::AsyncEvent => Self::AsyncEvent(AsyncEventResult::default()),
            _ => Self::None,
        }
    }
}

/// One HPI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Object of the message answered
    pub object: ObjectType,
    /// Function of the message answered
    pub function: u16,
    /// HPI error code, 0 on success
    pub error: u16,
    /// Adapter fault detail, 0 if none
    pub specific_error: u16,
    /// Body
    pub payload: ResponsePayload,
}

impl Response {
    /// Successful response to `msg` with a zeroed body.
    #[must_use]
    pub fn new(msg: &Message) -> Self {
        Self {
            object: msg.object,
            function: msg.function,
            error: 0,
            specific_error: 0,
            payload: ResponsePayload::default_for(msg.object),
        }
    }

    /// Response to `msg` carrying `err`.
    #[must_use]
    pub fn from_error(msg: &Message, err: &HpiError) -> Self {
        let mut resp = Self::new(msg);
        resp.set_error(err);
        resp
    }

    /// Replace the error fields with `err`, keeping the body.
    pub fn set_error(&mut self, err: &HpiError) {
        self.error = err.code();
        self.specific_error = err.fault().map_or(0, |f| f.code());
    }

    /// Whether the error code is zero.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    /// Stream result, if any.
    #[must_use]
    pub fn stream(&self) -> Option<&StreamResult> {
        match &self.payload {
            ResponsePayload::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Adapter result, if any.
    #[must_use]
    pub fn adapter(&self) -> Option<&AdapterResult> {
        match &self.payload {
            ResponsePayload::Adapter(a) => Some(a),
            _ => None,
        }
    }

    /// Control result, if any.
    #[must_use]
    pub fn control(&self) -> Option<&ControlResult> {
        match &self.payload {
            ResponsePayload::Control(c) => Some(c),
            _ => None,
        }
    }

    /// Extended control result, if any.
    #[must_use]
    pub fn controlex(&self) -> Option<&ControlExResult> {
        match &self.payload {
            ResponsePayload::ControlEx(c) => Some(c),
            _ => None,
        }
    }

    /// Subsystem result, if any.
    #[must_use]
    pub fn subsys(&self) -> Option<&SubsysResult> {
        match &self.payload {
            ResponsePayload::Subsystem(s) => Some(s),
            _ => None,
        }
    }

    /// Async event result, if any.
    #[must_use]
    pub fn async_events(&self) -> Option<&AsyncEventResult> {
        match &self.payload {
            ResponsePayload::AsyncEvent(a) => Some(a),
            _ => None,
        }
    }

    /// Fixed-size wire record. Error responses declare a header-only size.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_SIZE);
        let size = if self.error == 0 {
            RESPONSE_SIZE
        } else {
            RESPONSE_HEADER_SIZE
        };
        // Truncation safe: at most 60
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(size as u16);
        buf.put_u16_le(TYPE_RESPONSE);
        buf.put_u16_le(self.object.code());
        buf.put_u16_le(self.function);
        buf.put_u16_le(self.error);
        buf.put_u16_le(self.specific_error);
        self.put_payload(&mut buf);
        pad_to(&mut buf, RESPONSE_SIZE);
        buf.freeze()
    }

    fn put_payload(&self, buf: &mut BytesMut) {
        match &self.payload {
            ResponsePayload::None => {}
            ResponsePayload::Subsystem(s) => {
                buf.put_u32_le(s.version);
                buf.put_u32_le(s.data);
                buf.put_u16_le(s.num_adapters);
                buf.put_u16_le(s.adapter_index);
                for ty in s.adapter_list {
                    buf.put_u16_le(ty);
                }
            }
            ResponsePayload::Adapter(a) => {
                buf.put_u16_le(a.adapter_index);
                buf.put_u16_le(a.adapter_type);
                buf.put_u32_le(a.serial_number);
                buf.put_u16_le(a.version);
                buf.put_u16_le(a.num_outstreams);
                buf.put_u16_le(a.num_instreams);
                buf.put_u16_le(0);
                buf.put_u32_le(a.param1);
                buf.put_u32_le(a.param2);
            }
            ResponsePayload::Control(c) => {
                buf.put_u32_le(c.param1);
                buf.put_u32_le(c.param2);
            }
            ResponsePayload::ControlEx(c) => buf.put_u32_le(c.byte_count),
            ResponsePayload::Stream(s) => {
                buf.put_u16_le(s.state);
                buf.put_u16_le(0);
                buf.put_u32_le(s.buffer_size);
                buf.put_u32_le(s.data_available);
                buf.put_u32_le(s.samples_transferred);
                buf.put_u32_le(s.aux_data_available);
            }
            ResponsePayload::AsyncEvent(a) => {
                buf.put_u16_le(a.count);
                buf.put_u16_le(0);
                for e in a.events.iter().take(MAX_EVENTS_PER_RESPONSE) {
                    buf.put_u16_le(e.event_type);
                    buf.put_u16_le(e.object_index);
                    buf.put_u32_le(e.param1);
                    buf.put_u32_le(e.param2);
                }
            }
            ResponsePayload::Raw(raw) => {
                buf.put_slice(&raw[..raw.len().min(RESPONSE_UNION_SIZE)]);
            }
        }
    }

    /// Parse a wire record.
    ///
    /// # Errors
    ///
    /// Returns an invalid response error for short records, a wrong type,
    /// an out-of-range size or an unknown object.
    pub fn decode(record: &[u8]) -> Result<Self> {
        if record.len() < RESPONSE_SIZE {
            return Err(HpiError::invalid_response(format!(
                "record of {} bytes, need {RESPONSE_SIZE}",
                record.len()
            )));
        }
        let mut header = &record[..RESPONSE_HEADER_SIZE];
        let size = usize::from(header.get_u16_le());
        let kind = header.get_u16_le();
        if kind != TYPE_RESPONSE {
            return Err(HpiError::invalid_response(format!("type {kind}")));
        }
        if !(RESPONSE_HEADER_SIZE..=RESPONSE_SIZE).contains(&size) {
            return Err(HpiError::invalid_response(format!("size {size}")));
        }
        let object_code = header.get_u16_le();
        let object = ObjectType::from_code(object_code)
            .map_err(|_| HpiError::invalid_response(format!("object {object_code}")))?;
        let function = header.get_u16_le();
        let error = header.get_u16_le();
        let specific_error = header.get_u16_le();
        let payload = decode_response_payload(object, &record[RESPONSE_HEADER_SIZE..RESPONSE_SIZE]);
        Ok(Self {
            object,
            function,
            error,
            specific_error,
            payload,
        })
    }

    /// Check this response answers `msg`.
    ///
    /// # Errors
    ///
    /// Returns an invalid response error on an object or function mismatch.
    pub fn check_answers(&self, msg: &Message) -> Result<()> {
        if self.object != msg.object {
            return Err(HpiError::invalid_response(format!(
                "object {:?} answers {:?}",
                self.object, msg.object
            )));
        }
        if self.function != msg.function {
            return Err(HpiError::invalid_response(format!(
                "function {:#06x} answers {:#06x}",
                self.function, msg.function
            )));
        }
        Ok(())
    }
}

fn decode_response_payload(object: ObjectType, union: &[u8]) -> ResponsePayload {
    let mut buf = union;
    match object {
        ObjectType::Subsystem => {
            let version = buf.get_u32_le();
            let data = buf.get_u32_le();
            let num_adapters = buf.get_u16_le();
            let adapter_index = buf.get_u16_le();
            let mut adapter_list = [0u16; MAX_ADAPTERS];
            for slot in &mut adapter_list {
                *slot = buf.get_u16_le();
            }
            ResponsePayload::Subsystem(SubsysResult {
                version,
                data,
                num_adapters,
                adapter_index,
                adapter_list,
            })
        }
        ObjectType::Adapter => {
            let adapter_index = buf.get_u16_le();
            let adapter_type = buf.get_u16_le();
            let serial_number = buf.get_u32_le();
            let version = buf.get_u16_le();
            let num_outstreams = buf.get_u16_le();
            let num_instreams = buf.get_u16_le();
            buf.advance(2);
            ResponsePayload::Adapter(AdapterResult {
                adapter_index,
                adapter_type,
                serial_number,
                version,
                num_outstreams,
                num_instreams,
                param1: buf.get_u32_le(),
                param2: buf.get_u32_le(),
            })
        }
        ObjectType::Control => ResponsePayload::Control(ControlResult {
            param1: buf.get_u32_le(),
            param2: buf.get_u32_le(),
        }),
        ObjectType::ControlEx => ResponsePayload::ControlEx(ControlExResult {
            byte_count: buf.get_u32_le(),
            data: Bytes::new(),
        }),
        ObjectType::OStream | ObjectType::IStream => {
            let state = buf.get_u16_le();
            buf.advance(2);
            ResponsePayload::Stream(StreamResult {
                state,
                buffer_size: buf.get_u32_le(),
                data_available: buf.get_u32_le(),
                samples_transferred: buf.get_u32_le(),
                aux_data_available: buf.get_u32_le(),
                data: Bytes::new(),
            })
        }
        ObjectType::AsyncEvent => {
            let count = buf.get_u16_le();
            buf.advance(2);
            let events = (0..usize::from(count).min(MAX_EVENTS_PER_RESPONSE))
                .map(|_| AsyncEvent {
                    event_type: buf.get_u16_le(),
                    object_index: buf.get_u16_le(),
                    param1: buf.get_u32_le(),
                    param2: buf.get_u32_le(),
                })
                .collect();
            ResponsePayload::AsyncEvent(AsyncEventResult { count, events })
        }
        _ => ResponsePayload::Raw(Bytes::copy_from_slice(union)),
    }
}

fn pad_to(buf: &mut BytesMut, len: usize) {
    if buf.len() < len {
        buf.put_bytes(0, len - buf.len());
    }
    buf.truncate(len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let msg = Message::control_set(3, 7, 0x0102, 0xAABB_CCDD, 5);
        let wire = msg.encode();
        assert_eq!(wire.len(), MESSAGE_SIZE);
        assert_eq!(&wire[0..2], &52u16.to_le_bytes());
        assert_eq!(&wire[2..4], &TYPE_MESSAGE.to_le_bytes());
        assert_eq!(&wire[4..6], &7u16.to_le_bytes());
        assert_eq!(&wire[6..8], &0x0703u16.to_le_bytes());
        assert_eq!(&wire[8..10], &3u16.to_le_bytes());
        assert_eq!(&wire[12..14], &7u16.to_le_bytes());
        assert_eq!(&wire[16..20], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn stream_bodies_follow_the_function() {
        let fmt = AudioFormat::pcm(2, 2, 48_000);
        let write = Message::ostream_write(0, 4, fmt, Bytes::from_static(&[1, 2, 3, 4]));
        let back = Message::decode(&write.encode()).unwrap();
        let StreamBody::Data { format, size, data } = &back.stream_request().unwrap().body else {
            panic!("expected data body");
        };
        assert_eq!(*format, fmt);
        assert_eq!(*size, 4);
        assert!(data.is_empty(), "bulk data does not travel in the record");

        let alloc = Message::host_buffer_alloc(ObjectType::IStream, 0, 1, BufferCommand::GrantAdapter, 8192);
        assert_eq!(alloc.function, func::istream::HOSTBUFFER_ALLOC);
        assert_eq!(Message::decode(&alloc.encode()).unwrap(), alloc);

        let start = Message::ostream(0, 2, func::ostream::START);
        assert_eq!(Message::decode(&start.encode()).unwrap(), start);
    }

    #[test]
    fn format_overlays_data_format() {
        let fmt = AudioFormat::pcm(3, 1, 44_100);
        let write = Message::ostream_write(0, 0, fmt, Bytes::new()).encode();
        let set = Message::stream(ObjectType::OStream, 0, 0, func::ostream::SET_FORMAT, StreamBody::Format(fmt)).encode();
        assert_eq!(&write[16..36], &set[16..36]);
    }

    #[test]
    fn decode_rejects_bad_headers() {
        let mut wire = Message::adapter(0, func::adapter::OPEN).encode().to_vec();
        wire[2] = 2;
        assert_eq!(Message::decode(&wire).unwrap_err().code(), 100);
        wire[2] = 1;
        wire[4] = 99;
        assert_eq!(Message::decode(&wire).unwrap_err().code(), 101);
        assert_eq!(Message::decode(&wire[..10]).unwrap_err().code(), 109);
    }

    #[test]
    fn response_round_trip_and_checks() {
        let msg = Message::adapter(0, func::adapter::GET_INFO);
        let mut resp = Response::new(&msg);
        resp.payload = ResponsePayload::Adapter(AdapterResult {
            adapter_index: 2,
            adapter_type: 0x5111,
            num_outstreams: 4,
            num_instreams: 2,
            ..AdapterResult::default()
        });
        let back = Response::decode(&resp.encode()).unwrap();
        assert_eq!(back, resp);
        back.check_answers(&msg).unwrap();

        let other = Message::adapter(0, func::adapter::CLOSE);
        assert_eq!(back.check_answers(&other).unwrap_err().code(), 108);
    }

    #[test]
    fn error_response_is_header_sized() {
        let msg = Message::ostream(0, 1, func::ostream::START);
        let resp = Response::from_error(&msg, &HpiError::adapter(0, crate::error::Fault::ResponseTimeout));
        assert_eq!(resp.error, 1016);
        assert_eq!(resp.specific_error, 16);
        let wire = resp.encode();
        assert_eq!(&wire[0..2], &12u16.to_le_bytes());
        assert_eq!(Response::decode(&wire).unwrap().error, 1016);
    }

    #[test]
    fn response_decode_rejects_garbage() {
        let mut wire = Response::new(&Message::subsys(func::subsys::OPEN)).encode().to_vec();
        wire[2] = 1;
        assert!(matches!(Response::decode(&wire), Err(HpiError::InvalidResponse { .. })));
        wire[2] = 2;
        wire[0] = 200;
        assert!(matches!(Response::decode(&wire), Err(HpiError::InvalidResponse { .. })));
    }

    #[test]
    fn async_events_cap_per_response() {
        let msg = Message::async_event(0, func::asyncevent::GET, 5);
        let mut resp = Response::new(&msg);
        let events: Vec<_> = (0..5)
            .map(|i| AsyncEvent {
                event_type: 1,
                object_index: i,
                param1: u32::from(i),
                param2: 0,
            })
            .collect();
        resp.payload = ResponsePayload::AsyncEvent(AsyncEventResult { count: 3, events: events[..3].to_vec() });
        let back = Response::decode(&resp.encode()).unwrap();
        assert_eq!(back.async_events().unwrap().events, events[..3].to_vec());
    }

    #[test]
    fn opaque_objects_relay_verbatim() {
        let mut raw = vec![0u8; MESSAGE_UNION_SIZE];
        raw[0] = 0x5A;
        raw[39] = 0xA5;
        let msg = Message::new(ObjectType::Mixer, 0x0503, 1).with_payload(MessagePayload::Raw(Bytes::from(raw)));
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }
}
