//! Host driver core for AudioScience HPI adapters built on the TI C6205.
//!
//! The adapter is a C6205 DSP behind its own PCI bridge, optionally with a
//! C6713 second DSP reached through the first one's host port. This crate
//! boots it, talks to its firmware through a shared interface buffer and
//! routes HPI messages to it.
//!
//! # Layers
//!
//! ```text
//! Hpi6205::handle(&Message) -> Response        dispatch
//!   AdapterHw                                  per-adapter state, bulk relay,
//!                                              control cache, stream rings
//!     Transport                                HIF handshake over the
//!                                              interface buffer
//!     Bootloader                               reset, EMIF, memory tests,
//!                                              code load
//!       RegisterWindow                         BAR0 paging, BAR1 registers,
//!                                              secondary DSP access
//!         PciBar                               MappedBar or the software double
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use hpi_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let hpi = Hpi6205::new(Environment::host(DriverConfig::from_env()));
//! let resource = PciResource::from_sysfs("0000:03:00.0")?;
//!
//! let resp = hpi.handle(&Message::create_adapter(resource));
//! let index = resp.subsys().map_or(0, |s| s.adapter_index);
//! let info = hpi.handle(&Message::adapter(index, func::adapter::GET_INFO));
//! println!("{:?}", info.adapter());
//! # Ok(())
//! # }
//! ```
//!
//! Every failure travels back inside the [`Response`] as an HPI error code;
//! [`describe_code`] turns one into text.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod adapter;
pub mod boot;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod dspcode;
mod error;
pub mod events;
pub mod hif;
pub mod memory;
pub mod message;
pub mod mmio;
pub mod poll;
pub mod sim;
pub mod stream;
pub mod window;

/// Chip model re-exported from hpi-chip.
pub mod chip {
    pub use hpi_chip::pcie::{
        lspci_filter, AdapterFamily, CodeImage, AUDIOSCIENCE_SUBSYS_VENDOR_ID, DSP6205_DEVICE_ID,
        TI_VENDOR_ID,
    };
}

pub use adapter::{AdapterHw, Environment};
pub use boot::{Bootloader, Diagnostics, Mismatch};
pub use config::{BootConfig, DriverConfig, HifConfig, VerifyPolicy};
pub use dispatch::{Adapter, AdapterTable, Hpi6205, HpiHandler};
pub use dspcode::{DspCode, DspCodeSource, FileCodeSource, ImageBuilder, MemoryCodeSource};
pub use error::{code, describe_code, Fault, HpiError, Result, ADAPTER_ERROR_BASE};
pub use memory::{DmaBuffer, LockedMemory, PinnedMemory};
pub use message::{func, Message, MessagePayload, ObjectType, Response, ResponsePayload};
pub use mmio::{MappedBar, PciBar, PciResource};
pub use poll::{Delay, NoDelay, SpinDelay};
pub use sim::{SimFaults, SimulatedAdapter};
pub use window::RegisterWindow;

/// Commonly used types.
pub mod prelude {
    pub use crate::chip::AdapterFamily;
    pub use crate::message::{AudioFormat, BufferCommand};
    pub use crate::{
        func, DriverConfig, Environment, Hpi6205, HpiError, HpiHandler, Message, PciResource,
        Response, Result, SimulatedAdapter,
    };
}
