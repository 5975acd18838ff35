//! `hpi`: command-line interface for AudioScience HPI 6205 adapters.
//!
//! ```text
//! USAGE:
//!   hpi simulate [--family F]     Boot a simulated adapter and query it
//!   hpi info <pcie-addr>          PCI identity of one adapter
//!   hpi boot <pcie-addr>          Boot a real adapter and query it
//!   hpi image <file>              List the records of a DSP code image
//!   hpi error <code>              Describe an HPI error code
//! ```

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use hpi_driver::chip::{lspci_filter, AdapterFamily};
use hpi_driver::dspcode::{read_all, CodeImageReader};
use hpi_driver::{
    describe_code, func, DriverConfig, Environment, Hpi6205, Message, PciResource,
    SimulatedAdapter,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpi", about = "AudioScience HPI 6205 adapter tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Boot a simulated adapter and run a message round trip.
    Simulate {
        /// Adapter family to simulate.
        #[arg(long, value_enum, default_value_t = Family::Asi6400)]
        family: Family,
    },
    /// Print the PCI identity of one adapter.
    Info {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Boot a real adapter and query it (requires root).
    Boot {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// List the records of a DSP code image file.
    Image {
        /// Image file (little-endian 32-bit words).
        path: std::path::PathBuf,
    },
    /// Describe a numeric HPI error code.
    Error {
        /// Error code, e.g. 1016 or 207.
        code: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Asi5000,
    Asi6400,
    Asi6500,
    Asi6600,
    Asi8700,
}

impl From<Family> for AdapterFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Asi5000 => Self::Asi5000,
            Family::Asi6400 => Self::Asi6400,
            Family::Asi6500 => Self::Asi6500,
            Family::Asi6600 => Self::Asi6600,
            Family::Asi8700 => Self::Asi8700,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Simulate { family } => cmd_simulate(family.into())?,
        Cmd::Info { pcie_addr } => cmd_info(&pcie_addr)?,
        Cmd::Boot { pcie_addr } => cmd_boot(&pcie_addr)?,
        Cmd::Image { path } => cmd_image(&path)?,
        Cmd::Error { code } => println!("{code}: {}", describe_code(code)),
    }

    Ok(())
}

fn cmd_simulate(family: AdapterFamily) -> Result<()> {
    let card = SimulatedAdapter::new(family);
    let hpi = Hpi6205::new(card.environment());
    let index = create(&hpi, card.resource())?;
    report(&hpi, index)?;

    let set = hpi.handle(&Message::control_set(index, 0, 0x0101, 0x1234, 0));
    let get = hpi.handle(&Message::control_get(index, 0, 0x0101));
    let value = get.control().map_or(0, |c| c.param1);
    println!(
        "Control 0     : set error {}, read back {value:#x}",
        set.error
    );
    println!("DSP messages  : {}", card.messages());
    Ok(())
}

fn cmd_info(pcie_addr: &str) -> Result<()> {
    let res = PciResource::from_sysfs(pcie_addr)
        .with_context(|| format!("Failed to open {pcie_addr}"))?;

    println!("PCIe address : {}", res.address);
    println!("Bridge       : {:04x}:{:04x}", res.vendor_id, res.device_id);
    println!(
        "Subsystem    : {:04x}:{:04x}",
        res.subsys_vendor_id, res.subsys_device_id
    );
    match AdapterFamily::from_subsys_device_id(res.subsys_device_id) {
        Some(family) => {
            println!("Family       : {family} ({} DSP)", family.dsp_count());
            for image in family.code_images().into_iter().flatten() {
                println!("  Code image : {}", image.file_name());
            }
        }
        None => println!("Family       : unknown"),
    }
    println!();
    println!("Find others with: lspci {}", lspci_filter());
    Ok(())
}

fn cmd_boot(pcie_addr: &str) -> Result<()> {
    let res = PciResource::from_sysfs(pcie_addr)
        .with_context(|| format!("Failed to open {pcie_addr}"))?;
    let hpi = Hpi6205::new(Environment::host(DriverConfig::from_env()));
    let index = create(&hpi, res)?;
    report(&hpi, index)
}

fn cmd_image(path: &std::path::Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut image = CodeImageReader::from_bytes(0, Bytes::from(bytes))?;
    let records = read_all(&mut image)?;

    println!("{}: {} records", path.display(), records.len());
    for (n, record) in records.iter().enumerate() {
        let h = &record.header;
        println!(
            "  [{n:3}] {:#010x}  {:6} words  type {}",
            h.address, h.length, h.kind
        );
    }
    let words: usize = records.iter().map(|r| r.words.len()).sum();
    println!("Total        : {words} words");
    Ok(())
}

fn create(hpi: &Hpi6205, res: PciResource) -> Result<u16> {
    let address = res.address.clone();
    let resp = hpi.handle(&Message::create_adapter(res));
    if !resp.is_ok() {
        bail!(
            "Adapter {address} failed to start: {} ({})",
            resp.error,
            describe_code(resp.error)
        );
    }
    let index = resp.subsys().map_or(0, |s| s.adapter_index);
    info!("Adapter {address} is index {index}");
    Ok(index)
}

fn report(hpi: &Hpi6205, index: u16) -> Result<()> {
    let resp = hpi.handle(&Message::adapter(index, func::adapter::GET_INFO));
    if !resp.is_ok() {
        bail!("GET_INFO failed: {}", describe_code(resp.error));
    }
    let Some(info) = resp.adapter() else {
        bail!("GET_INFO returned no adapter body");
    };

    let adapter = hpi
        .adapter(index)
        .context("adapter vanished from the table")?;
    let hw = adapter.lock();
    println!("Adapter      : {index} ({})", hw.family());
    println!("Type         : {:04x}", info.adapter_type);
    println!("Serial       : {}", info.serial_number);
    println!("Version      : {:#06x}", info.version);
    println!(
        "Streams      : {} out, {} in",
        info.num_outstreams, info.num_instreams
    );
    println!(
        "Control cache: {}",
        hw.control_cache()
            .map_or_else(|| "none".to_string(), |c| format!("{} entries", c.count()))
    );
    println!(
        "Async events : {}",
        hw.async_events()
            .map_or_else(|| "none".to_string(), |r| format!("{} slots", r.size()))
    );
    Ok(())
}
