//! PCI BAR access and the PCI resource descriptor of an adapter.
//!
//! [`PciBar`] is the seam between the register window and hardware. On a
//! real machine each BAR is a [`MappedBar`] over the sysfs `resourceN` file;
//! in tests both BARs are served by the software double in [`crate::sim`].

use crate::error::{HpiError, Result};
use hpi_chip::bar::{bar0, bar1};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

/// 32-bit access to one PCI BAR.
///
/// Offsets are byte offsets from the start of the BAR. Callers only pass
/// masked, 4-byte aligned offsets that fit the BAR size checked at map time.
pub trait PciBar: Debug + Send + Sync {
    /// Volatile 32-bit read.
    fn read32(&self, offset: usize) -> u32;

    /// Volatile 32-bit write.
    fn write32(&self, offset: usize, value: u32);

    /// BAR size in bytes.
    fn size(&self) -> usize;
}

/// Memory-mapped PCI BAR backed by `/sys/bus/pci/devices/<addr>/resource<N>`.
#[derive(Debug)]
pub struct MappedBar {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    bar_index: u32,
}

// SAFETY: MappedBar owns its mapping exclusively. Every access is a single
// aligned volatile read or write, which the device tolerates from any thread.
// Ordering between threads is provided by the adapter lock above this layer.
unsafe impl Send for MappedBar {}
// SAFETY: see above; &MappedBar only ever performs volatile 32-bit accesses.
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// Map BAR `bar_index` of the device at `pcie_address`, requiring at
    /// least `min_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the resource file cannot be opened, is smaller than
    /// `min_size`, or mmap fails.
    pub fn map(pcie_address: &str, bar_index: u32, min_size: usize) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource{bar_index}");

        tracing::debug!("Mapping PCI BAR: {path}");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| HpiError::dsp_hardware(format!("Cannot open {path}: {e}")))?;

        // Truncation acceptable: BAR sizes fit in usize on 64-bit
        #[allow(clippy::cast_possible_truncation)]
        let size = file.metadata()?.len() as usize;

        if size < min_size {
            return Err(HpiError::dsp_hardware(format!(
                "BAR{bar_index} of {pcie_address} is {size:#x} bytes, need {min_size:#x}"
            )));
        }

        // SAFETY: fd is open for the lifetime of the mapping (stored in the
        // struct), size is non-zero and equals the resource length, offset 0
        // is page aligned, and the mapping is released in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| HpiError::dsp_hardware(format!("mmap of {path} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| HpiError::dsp_hardware(format!("mmap of {path} returned null")))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({} KB at {ptr:p})",
            size / 1024
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            bar_index,
        })
    }

    fn check(&self, offset: usize) {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "BAR{} access at {offset:#x} outside {:#x}",
            self.bar_index,
            self.size
        );
    }
}

impl PciBar for MappedBar {
    fn read32(&self, offset: usize) -> u32 {
        self.check(offset);
        // SAFETY: offset is aligned and in bounds (checked above); ptr comes
        // from a live MAP_SHARED mapping. Volatile because the device mutates
        // registers and memory behind our back.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("BAR{} read  @ {offset:#08x} = {value:#010x}", self.bar_index);
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        self.check(offset);
        tracing::trace!("BAR{} write @ {offset:#08x} = {value:#010x}", self.bar_index);
        // SAFETY: as for read32; volatile so every write reaches the bus.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in `map`; nothing
        // else unmaps it.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::warn!("munmap of BAR{} failed: {e}", self.bar_index);
        }
    }
}

/// PCI identity and BAR mappings of one adapter.
#[derive(Debug, Clone)]
pub struct PciResource {
    /// Bus address, e.g. `0000:03:00.0`.
    pub address: String,
    /// PCI vendor ID.
    pub vendor_id: u16,
    /// PCI device ID.
    pub device_id: u16,
    /// Subsystem vendor ID.
    pub subsys_vendor_id: u16,
    /// Subsystem device ID (the adapter model).
    pub subsys_device_id: u16,
    /// Paged DSP memory window.
    pub bar0: Arc<dyn PciBar>,
    /// DSP register window.
    pub bar1: Arc<dyn PciBar>,
}

impl PciResource {
    /// Read the IDs of the device at `pcie_address` from sysfs and map both
    /// BARs.
    ///
    /// # Errors
    ///
    /// Returns error if an ID file is missing or unparsable, or a BAR cannot
    /// be mapped.
    pub fn from_sysfs(pcie_address: &str) -> Result<Self> {
        let dir = format!("/sys/bus/pci/devices/{pcie_address}");
        let dir = Path::new(&dir);
        let resource = Self {
            address: pcie_address.to_string(),
            vendor_id: read_sysfs_id(&dir.join("vendor"))?,
            device_id: read_sysfs_id(&dir.join("device"))?,
            subsys_vendor_id: read_sysfs_id(&dir.join("subsystem_vendor"))?,
            subsys_device_id: read_sysfs_id(&dir.join("subsystem_device"))?,
            bar0: Arc::new(MappedBar::map(pcie_address, bar0::INDEX, bar0::SIZE)?),
            bar1: Arc::new(MappedBar::map(pcie_address, bar1::INDEX, bar1::SIZE)?),
        };
        tracing::info!(
            "{pcie_address}: {:04x}:{:04x} subsystem {:04x}:{:04x}",
            resource.vendor_id,
            resource.device_id,
            resource.subsys_vendor_id,
            resource.subsys_device_id
        );
        Ok(resource)
    }
}

fn read_sysfs_id(path: &Path) -> Result<u16> {
    let text = std::fs::read_to_string(path)?;
    parse_hex_id(&text).ok_or_else(|| {
        HpiError::dsp_hardware(format!("{}: cannot parse {:?}", path.display(), text.trim()))
    })
}

/// Parse a sysfs ID such as `0x104c\n`.
pub(crate) fn parse_hex_id(text: &str) -> Option<u16> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sysfs_ids() {
        assert_eq!(parse_hex_id("0x104c\n"), Some(0x104C));
        assert_eq!(parse_hex_id("0xA106"), Some(0xA106));
        assert_eq!(parse_hex_id("175c"), Some(0x175C));
        assert_eq!(parse_hex_id("0x1_0000"), None);
        assert_eq!(parse_hex_id(""), None);
    }

    #[test]
    fn read_id_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subsystem_device");
        std::fs::write(&path, "0x8702\n").unwrap();
        assert_eq!(read_sysfs_id(&path).unwrap(), 0x8702);

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_sysfs_id(&path).is_err());
    }

    #[test]
    fn missing_device_is_an_error() {
        let err = MappedBar::map("ffff:ff:ff.7", 0, bar0::SIZE).unwrap_err();
        assert!(err.to_string().contains("Cannot open"));
    }
}
