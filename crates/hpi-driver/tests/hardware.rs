//! Real-card tests
//!
//! Set `HPI_TEST_DEVICE` to the PCIe address of a 6205-based adapter and
//! `HPI_DSPCODE_DIR` to the directory holding its `dsp*.bin` images.

use hpi_driver::chip::AdapterFamily;
use hpi_driver::{func, DriverConfig, Environment, Hpi6205, Message, PciResource};

fn device() -> String {
    std::env::var("HPI_TEST_DEVICE").unwrap_or_else(|_| "0000:03:00.0".into())
}

#[test]
#[ignore] // Requires hardware
fn test_sysfs_identity() {
    let resource = PciResource::from_sysfs(&device()).expect("map adapter BARs");
    println!("Adapter @ {}", resource.address);
    println!(
        "  {:04x}:{:04x} subsystem {:04x}:{:04x}",
        resource.vendor_id, resource.device_id, resource.subsys_vendor_id, resource.subsys_device_id
    );
    let family = AdapterFamily::from_subsys_device_id(resource.subsys_device_id)
        .expect("known adapter family");
    println!("  Family {family}, {} DSP(s)", family.dsp_count());
}

#[test]
#[ignore] // Requires hardware
fn test_boot_and_identify() {
    let resource = PciResource::from_sysfs(&device()).expect("map adapter BARs");
    let hpi = Hpi6205::new(Environment::host(DriverConfig::from_env()));

    let created = hpi.handle(&Message::create_adapter(resource));
    assert!(
        created.is_ok(),
        "create failed: {}",
        hpi_driver::describe_code(created.error)
    );
    let index = created.subsys().unwrap().adapter_index;

    let info = hpi.handle(&Message::adapter(index, func::adapter::GET_INFO));
    assert!(info.is_ok(), "GET_INFO: {}", hpi_driver::describe_code(info.error));
    let info = info.adapter().unwrap();
    println!(
        "Adapter {index}: type {:04x} serial {} ({} out, {} in)",
        info.adapter_type, info.serial_number, info.num_outstreams, info.num_instreams
    );

    let hw = hpi.adapter(index).unwrap();
    let hw = hw.lock();
    println!("  Control cache: {:?}", hw.control_cache().map(|c| c.count()));
    println!("  Async ring: {:?}", hw.async_events().map(|r| r.size()));
    drop(hw);

    assert!(hpi.handle(&Message::delete_adapter(index)).is_ok());
}
