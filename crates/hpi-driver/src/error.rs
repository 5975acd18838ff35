//! Error types for HPI 6205 operations.
//!
//! Every variant maps to one numeric HPI error code through
//! [`HpiError::code`]. Adapter bring-up and transport faults share the
//! adapter-specific range `1000 + 100 * dsp_index + fault`.

use thiserror::Error;

/// Result type alias for HPI operations
pub type Result<T> = std::result::Result<T, HpiError>;

/// First code of the adapter-specific range.
pub const ADAPTER_ERROR_BASE: u16 = 1000;

/// Generic HPI error codes.
pub mod code {
    /// Message header type is not a message.
    pub const INVALID_TYPE: u16 = 100;
    /// Unknown object.
    pub const INVALID_OBJ: u16 = 101;
    /// Unknown function for the object.
    pub const INVALID_FUNC: u16 = 102;
    /// Response did not match its message.
    pub const INVALID_RESPONSE: u16 = 108;
    /// Message could not be processed.
    pub const PROCESSING_MESSAGE: u16 = 109;
    /// PCI signature is not a 6205 adapter.
    pub const BAD_ADAPTER: u16 = 201;
    /// No adapter with that index.
    pub const BAD_ADAPTER_NUMBER: u16 = 202;
    /// Adapter index already registered.
    pub const DUPLICATE_ADAPTER_NUMBER: u16 = 203;
    /// DSP code image could not be opened or parsed.
    pub const DSP_FILE_NOT_FOUND: u16 = 206;
    /// DSP not responding; adapter crashed.
    pub const DSP_HARDWARE: u16 = 207;
    /// Host memory allocation failed.
    pub const MEMORY_ALLOC: u16 = 208;
    /// Stream index out of range.
    pub const INVALID_STREAM: u16 = 300;
    /// Transfer size exceeds what the buffer holds.
    pub const INVALID_DATASIZE: u16 = 305;
    /// Operation not valid in the current state.
    pub const INVALID_OPERATION: u16 = 310;
}

/// Adapter-specific fault, added to `1000 + 100 * dsp_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Interface buffer could not be allocated.
    MemAlloc,
    /// No interrupt after starting the DSP.
    NoInterrupt,
    /// DSP never acknowledged reset.
    InitFailed,
    /// Subsystem device ID names no known family.
    UnknownPciDevice,
    /// HDCR PCIBOOT clear after warm reset.
    PciBootMode,
    /// DSP page register did not read back.
    DspPage,
    /// DSP index out of range.
    BadDspIndex,
    /// C6713 HPIC did not read back.
    C6713Hpic,
    /// C6713 HPIA walking-ones failure.
    C6713Hpia,
    /// C6713 PLL still bypassed after enable.
    C6713Pll,
    /// Internal memory test failure.
    InternalMemory,
    /// External memory test failure.
    ExternalMemory,
    /// PLD signature mismatch.
    Pld,
    /// Interface never returned to idle.
    IdleTimeout,
    /// DSP never signalled the response.
    ResponseTimeout,
    /// EEPROM autoload not done, or configuration error.
    Eeprom,
    /// EMIF register did not read back.
    Emif,
    /// Host mailbox never read back.
    HpiRegister,
    /// Loaded code image did not read back.
    CodeVerify,
}

impl Fault {
    /// All faults, in code order.
    pub const ALL: [Self; 19] = [
        Self::MemAlloc,
        Self::NoInterrupt,
        Self::InitFailed,
        Self::UnknownPciDevice,
        Self::PciBootMode,
        Self::DspPage,
        Self::BadDspIndex,
        Self::C6713Hpic,
        Self::C6713Hpia,
        Self::C6713Pll,
        Self::InternalMemory,
        Self::ExternalMemory,
        Self::Pld,
        Self::IdleTimeout,
        Self::ResponseTimeout,
        Self::Eeprom,
        Self::Emif,
        Self::HpiRegister,
        Self::CodeVerify,
    ];

    /// Specific code within the adapter range.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::MemAlloc => 1,
            Self::NoInterrupt => 2,
            Self::InitFailed => 3,
            Self::UnknownPciDevice => 5,
            Self::PciBootMode => 6,
            Self::DspPage => 7,
            Self::BadDspIndex => 8,
            Self::C6713Hpic => 9,
            Self::C6713Hpia => 10,
            Self::C6713Pll => 11,
            Self::InternalMemory => 12,
            Self::ExternalMemory => 13,
            Self::Pld => 14,
            Self::IdleTimeout => 15,
            Self::ResponseTimeout => 16,
            Self::Eeprom => 17,
            Self::Emif => 18,
            Self::HpiRegister => 19,
            Self::CodeVerify => 20,
        }
    }

    /// Look a fault up by its specific code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Human readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::MemAlloc => "interface buffer allocation failed",
            Self::NoInterrupt => "no interrupt after DSP start",
            Self::InitFailed => "DSP never acknowledged reset",
            Self::UnknownPciDevice => "unknown PCI subsystem device",
            Self::PciBootMode => "DSP not in PCI boot mode",
            Self::DspPage => "DSP page register fault",
            Self::BadDspIndex => "bad DSP index",
            Self::C6713Hpic => "C6713 HPI control register fault",
            Self::C6713Hpia => "C6713 HPI address register fault",
            Self::C6713Pll => "C6713 PLL fault",
            Self::InternalMemory => "internal memory fault",
            Self::ExternalMemory => "external memory fault",
            Self::Pld => "PLD signature fault",
            Self::IdleTimeout => "timeout waiting for interface idle",
            Self::ResponseTimeout => "timeout waiting for DSP response",
            Self::Eeprom => "EEPROM not read or configuration error",
            Self::Emif => "EMIF configuration fault",
            Self::HpiRegister => "host mailbox register fault",
            Self::CodeVerify => "DSP code verification mismatch",
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors that can occur during HPI operations
#[derive(Debug, Error)]
pub enum HpiError {
    /// Adapter-specific bring-up or transport fault
    #[error("DSP {dsp_index}: {fault}")]
    Adapter {
        /// DSP the fault is attributed to
        dsp_index: u16,
        /// What went wrong
        fault: Fault,
    },

    /// Header type field is not a message
    #[error("Invalid message type {found}")]
    InvalidType {
        /// Type field found
        found: u16,
    },

    /// Object code not recognised
    #[error("Invalid object {object}")]
    InvalidObject {
        /// Object code
        object: u16,
    },

    /// Function not supported by the object
    #[error("Invalid function {function:#06x}")]
    InvalidFunction {
        /// Function code
        function: u16,
    },

    /// Response does not belong to the message
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// What did not match
        reason: String,
    },

    /// Message payload does not fit the function
    #[error("Cannot process message: {reason}")]
    ProcessingMessage {
        /// Reason for failure
        reason: String,
    },

    /// PCI signature is not a 6205 bridge
    #[error("Not a 6205 adapter: {vendor_id:04x}:{device_id:04x}")]
    BadAdapter {
        /// PCI vendor ID
        vendor_id: u16,
        /// PCI device ID
        device_id: u16,
    },

    /// No adapter registered at this index
    #[error("No adapter at index {index}")]
    BadAdapterNumber {
        /// Requested index
        index: u16,
    },

    /// Adapter index already taken
    #[error("Adapter index {index} already registered")]
    DuplicateAdapterNumber {
        /// Index reported by the DSP
        index: u16,
    },

    /// DSP code image unavailable or malformed
    #[error("DSP code {family:04x}: {reason}")]
    DspCode {
        /// Family ID requested
        family: u16,
        /// Reason for failure
        reason: String,
    },

    /// Adapter crashed or bulk transfer failed
    #[error("DSP hardware error: {reason}")]
    DspHardware {
        /// Reason for failure
        reason: String,
    },

    /// Host memory allocation failed
    #[error("Failed to allocate {size} bytes of locked memory")]
    MemoryAlloc {
        /// Requested size
        size: usize,
    },

    /// Stream index out of range
    #[error("Invalid stream index {index}")]
    InvalidStream {
        /// Requested index
        index: u16,
    },

    /// Transfer larger than the ring allows
    #[error("Invalid data size: requested {requested}, available {available}")]
    InvalidDataSize {
        /// Bytes requested
        requested: usize,
        /// Bytes available
        available: usize,
    },

    /// Operation not valid now
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason for failure
        reason: String,
    },

    /// Error code reported by the DSP in a response
    #[error("DSP reported error {code}")]
    Dsp {
        /// Code from the response header
        code: u16,
    },

    /// I/O error during device access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl HpiError {
    /// Create an adapter-specific fault
    pub fn adapter(dsp_index: u16, fault: Fault) -> Self {
        Self::Adapter { dsp_index, fault }
    }

    /// Create an invalid response error
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Create a processing message error
    pub fn processing(reason: impl Into<String>) -> Self {
        Self::ProcessingMessage {
            reason: reason.into(),
        }
    }

    /// Create a DSP code error
    pub fn dsp_code(family: u16, reason: impl Into<String>) -> Self {
        Self::DspCode {
            family,
            reason: reason.into(),
        }
    }

    /// Create a DSP hardware error
    pub fn dsp_hardware(reason: impl Into<String>) -> Self {
        Self::DspHardware {
            reason: reason.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Numeric HPI error code carried in responses.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Adapter { dsp_index, fault } => {
                ADAPTER_ERROR_BASE + 100 * dsp_index + fault.code()
            }
            Self::InvalidType { .. } => code::INVALID_TYPE,
            Self::InvalidObject { .. } => code::INVALID_OBJ,
            Self::InvalidFunction { .. } => code::INVALID_FUNC,
            Self::InvalidResponse { .. } => code::INVALID_RESPONSE,
            Self::ProcessingMessage { .. } => code::PROCESSING_MESSAGE,
            Self::BadAdapter { .. } => code::BAD_ADAPTER,
            Self::BadAdapterNumber { .. } => code::BAD_ADAPTER_NUMBER,
            Self::DuplicateAdapterNumber { .. } => code::DUPLICATE_ADAPTER_NUMBER,
            Self::DspCode { .. } => code::DSP_FILE_NOT_FOUND,
            Self::DspHardware { .. } | Self::Io { .. } => code::DSP_HARDWARE,
            Self::MemoryAlloc { .. } => code::MEMORY_ALLOC,
            Self::InvalidStream { .. } => code::INVALID_STREAM,
            Self::InvalidDataSize { .. } => code::INVALID_DATASIZE,
            Self::InvalidOperation { .. } => code::INVALID_OPERATION,
            Self::Dsp { code } => *code,
        }
    }

    /// The adapter fault, if this is one.
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Self::Adapter { fault, .. } => Some(*fault),
            _ => None,
        }
    }

    /// Whether this error means the DSP can no longer be trusted.
    ///
    /// Hard transport timeouts and corrupted exchanges qualify.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self.fault(),
            Some(Fault::IdleTimeout | Fault::ResponseTimeout)
        ) || matches!(self, Self::InvalidResponse { .. })
    }
}

/// Describe a numeric HPI error code.
#[must_use]
pub fn describe_code(value: u16) -> String {
    if value >= ADAPTER_ERROR_BASE {
        let rel = value - ADAPTER_ERROR_BASE;
        let dsp_index = rel / 100;
        return match Fault::from_code(rel % 100) {
            Some(fault) => format!("DSP {dsp_index}: {fault}"),
            None => format!("DSP {dsp_index}: unknown adapter fault {}", rel % 100),
        };
    }
    let text = match value {
        0 => "no error",
        code::INVALID_TYPE => "invalid message type",
        code::INVALID_OBJ => "invalid object",
        code::INVALID_FUNC => "invalid function",
        code::INVALID_RESPONSE => "invalid response",
        code::PROCESSING_MESSAGE => "error processing message",
        code::BAD_ADAPTER => "not a 6205 adapter",
        code::BAD_ADAPTER_NUMBER => "bad adapter number",
        code::DUPLICATE_ADAPTER_NUMBER => "duplicate adapter number",
        code::DSP_FILE_NOT_FOUND => "DSP code file not found",
        code::DSP_HARDWARE => "DSP hardware error",
        code::MEMORY_ALLOC => "memory allocation failed",
        code::INVALID_STREAM => "invalid stream",
        code::INVALID_DATASIZE => "invalid data size",
        code::INVALID_OPERATION => "invalid operation",
        _ => "unknown error",
    };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_codes_are_offset_by_dsp() {
        assert_eq!(HpiError::adapter(0, Fault::Eeprom).code(), 1017);
        assert_eq!(HpiError::adapter(1, Fault::C6713Pll).code(), 1111);
        assert_eq!(HpiError::adapter(0, Fault::IdleTimeout).code(), 1015);
        assert_eq!(HpiError::adapter(0, Fault::ResponseTimeout).code(), 1016);
    }

    #[test]
    fn fault_codes_round_trip() {
        for fault in Fault::ALL {
            assert_eq!(Fault::from_code(fault.code()), Some(fault));
        }
        assert_eq!(Fault::from_code(4), None);
    }

    #[test]
    fn describe_known_codes() {
        assert_eq!(describe_code(1017), "DSP 0: EEPROM not read or configuration error");
        assert_eq!(describe_code(1108), "DSP 1: bad DSP index");
        assert_eq!(describe_code(305), "invalid data size");
        assert_eq!(describe_code(1004), "DSP 0: unknown adapter fault 4");
    }

    #[test]
    fn transport_failures() {
        assert!(HpiError::adapter(0, Fault::ResponseTimeout).is_transport_failure());
        assert!(HpiError::invalid_response("object").is_transport_failure());
        assert!(!HpiError::adapter(0, Fault::Emif).is_transport_failure());
        assert!(!HpiError::InvalidStream { index: 16 }.is_transport_failure());
        assert!(!HpiError::Dsp { code: 102 }.is_transport_failure());
    }

    #[test]
    fn dsp_codes_pass_through() {
        assert_eq!(HpiError::Dsp { code: 310 }.code(), 310);
        assert_eq!(HpiError::Dsp { code: 310 }.fault(), None);
    }
}
