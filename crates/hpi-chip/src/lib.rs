//! Silicon and protocol model for AudioScience HPI adapters built on the
//! TI TMS320C6205 PCI bus-mastering DSP.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the adapter: PCI identifiers and adapter families, the BAR
//! layout and page banking arithmetic, C6205/C6713 register addresses and
//! bit definitions, the host interface (HIF) shared buffer layout, and the
//! DSP code image framing.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, subsystem families, code images per family |
//! | [`bar`] | BAR0 4 MB paged memory window, BAR1 8 MB register window |
//! | [`regs`] | HSR/HDCR/DSPP bits, EMIF, C6713 HPI and PLL registers, memory map |
//! | [`hif`] | HIF command/ack codes and interface buffer byte layout |
//! | [`dspcode`] | DSP code image record framing |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod dspcode;
pub mod hif;
pub mod pcie;
pub mod regs;
