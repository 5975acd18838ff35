//! Adapter bring-up against the software double
//!
//! Every bootloader step is exercised with a clean card and with the fault
//! that step is meant to catch.

mod common;

use common::{booted, rig, rig_with};
use hpi_chip::bar::bar1;
use hpi_chip::regs::{self, hdcr, memory, pld};
use hpi_driver::boot::Mismatch;
use hpi_driver::chip::{AdapterFamily, CodeImage};
use hpi_driver::hif::InterfaceBuffer;
use hpi_driver::sim::{demo_code_source, StuckBit, DEMO_TEXT};
use hpi_driver::{
    code, describe_code, Bootloader, ImageBuilder, Message, NoDelay, PinnedMemory,
    SimulatedAdapter, VerifyPolicy,
};
use std::sync::Arc;

fn create_error(card: &SimulatedAdapter, hpi: &hpi_driver::Hpi6205) -> u16 {
    let resp = hpi.handle(&Message::create_adapter(card.resource()));
    assert!(!resp.is_ok(), "create unexpectedly succeeded");
    assert_eq!(hpi.adapter_count(), 0, "failed adapter left registered");
    resp.error
}

#[test]
fn clean_boot_every_family() {
    for family in AdapterFamily::ALL {
        let (card, hpi) = booted(family);
        let adapter = hpi.adapter(0).unwrap();
        let hw = adapter.lock();
        assert!(!hw.is_crashed(), "{family}");
        assert_eq!(hw.family(), family);
        assert_eq!(hw.adapter_type(), hpi_driver::sim::model_id(family));
        assert_eq!(hw.diagnostics(), hpi_driver::Diagnostics::default());
        assert!(card.is_running(), "{family}");

        let primary = match family {
            AdapterFamily::Asi5000 => CodeImage::Asi5000,
            _ => CodeImage::C6205,
        };
        let first_word = u32::from(primary.id()) << 16;
        assert_eq!(card.peek(0, DEMO_TEXT), first_word, "{family}");
        assert_eq!(card.peek(0, DEMO_TEXT + 4), first_word | 1, "{family}");
    }
}

#[test]
fn two_dsp_boot_loads_the_secondary() {
    let (card, _hpi) = booted(AdapterFamily::Asi8700);
    assert_eq!(card.peek(1, DEMO_TEXT), u32::from(CodeImage::C8713.id()) << 16);
    assert_eq!(card.peek(1, pld::C6713_LED), pld::C6713_LED_ON);
}

#[test]
fn eeprom_failure_stops_before_any_other_write() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.eeprom_not_read = true);

    let code = create_error(&card, &hpi);
    assert_eq!(code, 1017, "{}", describe_code(code));

    let writes = card.writes();
    assert_eq!(writes.len(), 1, "{writes:?}");
    assert_eq!(writes[0].bar, bar1::INDEX);
    assert_eq!(writes[0].offset, regs::HDCR);
    assert_eq!(writes[0].value, hdcr::WARMRESET);
}

#[test]
fn configuration_error_is_an_eeprom_fault() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.config_error = true);
    assert_eq!(create_error(&card, &hpi), 1017);
}

#[test]
fn bridge_faults() {
    let cases: [(&str, fn(&mut hpi_driver::SimFaults), u16); 3] = [
        ("pci boot", |f| f.pci_boot_clear = true, 1006),
        ("page register", |f| f.page_stuck = true, 1007),
        ("emif", |f| f.emif_stuck = true, 1018),
    ];
    for (name, fault, expected) in cases {
        let (card, hpi) = rig(AdapterFamily::Asi6500);
        card.inject(fault);
        assert_eq!(create_error(&card, &hpi), expected, "{name}");
    }
}

#[test]
fn secondary_dsp_faults() {
    let cases: [(&str, fn(&mut hpi_driver::SimFaults), u16); 4] = [
        ("hpic", |f| f.hpic_stuck = true, 1109),
        ("hpia", |f| f.hpia_stuck_bits = 1 << 20, 1110),
        ("pll", |f| f.pll_stuck = true, 1111),
        ("pld", |f| f.bad_pld = true, 1114),
    ];
    for (name, fault, expected) in cases {
        let (card, hpi) = rig(AdapterFamily::Asi8700);
        card.inject(fault);
        assert_eq!(create_error(&card, &hpi), expected, "{name}");
    }
}

#[test]
fn asi5000_checks_sdram_and_pld() {
    let (card, hpi) = rig(AdapterFamily::Asi5000);
    card.inject(|f| f.bad_pld = true);
    assert_eq!(create_error(&card, &hpi), 1014);

    let (card, hpi) = rig(AdapterFamily::Asi5000);
    card.inject(|f| {
        f.memory_stuck = Some(StuckBit {
            dsp_index: 0,
            address: memory::C6205_SDRAM,
            mask: 0x8000,
        });
    });
    assert_eq!(create_error(&card, &hpi), 1013);
}

#[test]
fn memory_fault_is_recorded_in_diagnostics() {
    let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
    card.inject(|f| {
        f.memory_stuck = Some(StuckBit {
            dsp_index: 0,
            address: memory::C6205_INTERNAL_DATA,
            mask: 0x100,
        });
    });
    let env = card.environment();
    let ib = InterfaceBuffer::allocate(env.memory.as_ref()).unwrap();
    let mut win = hpi_driver::RegisterWindow::from_resource(&card.resource());
    let delay = NoDelay::new();

    let mut boot = Bootloader::new(&mut win, &delay, &env.config.boot);
    let err = boot.run(AdapterFamily::Asi6400, &demo_code_source(), &ib).unwrap_err();
    assert_eq!(err.code(), 1012);
    assert_eq!(
        boot.diagnostics().memory,
        Some(Mismatch {
            dsp_index: 0,
            address: memory::C6205_INTERNAL_DATA,
            expected: 0x100,
            observed: 0,
        })
    );
}

#[test]
fn secondary_memory_fault_names_dsp_one() {
    let (card, hpi) = rig(AdapterFamily::Asi6600);
    card.inject(|f| {
        f.memory_stuck = Some(StuckBit {
            dsp_index: 1,
            address: memory::C6713_L2,
            mask: 1,
        });
    });
    assert_eq!(create_error(&card, &hpi), 1112);
}

#[test]
fn corrupted_code_word_fails_verify_by_default() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.corrupt_code_word = Some(DEMO_TEXT + 8));
    assert_eq!(create_error(&card, &hpi), 1020);
    assert!(!card.is_running());
}

#[test]
fn unaligned_code_record_fails_create_without_panicking() {
    let (card, hpi) = rig_with(AdapterFamily::Asi6400, |env| {
        let image = ImageBuilder::new().record(0x0000_2002, 1, &[1, 2]).build();
        env.code = Arc::new(demo_code_source().with_image(CodeImage::C6205, image));
    });
    assert_eq!(create_error(&card, &hpi), code::DSP_FILE_NOT_FOUND);
    assert!(!card.is_running());
}

#[test]
fn verify_mismatch_can_be_logged_only() {
    let (card, hpi) = rig_with(AdapterFamily::Asi6400, |env| {
        env.config.boot.verify = VerifyPolicy::LogOnly;
    });
    card.inject(|f| f.corrupt_code_word = Some(DEMO_TEXT + 8));
    common::create(&hpi, &card);

    let adapter = hpi.adapter(0).unwrap();
    let mismatch = adapter.lock().diagnostics().code_verify.unwrap();
    assert_eq!(mismatch.address, DEMO_TEXT + 8);
    assert_eq!(mismatch.observed, mismatch.expected ^ 1);
}

#[test]
fn mailbox_that_never_reads_back() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.mailbox_stuck = true);
    assert_eq!(create_error(&card, &hpi), 1019);
}

#[test]
fn start_handshake_timeouts_are_bounded() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.no_start_irq = true);
    assert_eq!(create_error(&card, &hpi), 1002);

    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.never_ack_reset = true);
    assert_eq!(create_error(&card, &hpi), 1003);
}

#[test]
fn unknown_subsystem_device() {
    let card = SimulatedAdapter::new(AdapterFamily::Asi6400).with_subsys_device_id(0x4321);
    let hpi = hpi_driver::Hpi6205::new(card.environment());
    assert_eq!(create_error(&card, &hpi), 1005);
    assert!(card.writes().is_empty());
}

#[test]
fn interface_buffer_allocation_failure_is_fatal() {
    let memory = Arc::new(PinnedMemory::unlocked(PinnedMemory::DEFAULT_BUS_BASE).with_limit(1024));
    let card = SimulatedAdapter::with_memory(AdapterFamily::Asi6400, Arc::clone(&memory));
    let hpi = hpi_driver::Hpi6205::new(card.environment());
    assert_eq!(create_error(&card, &hpi), 1001);
    assert_eq!(memory.live_allocations(), 0);
}

#[test]
fn dsp_error_for_identity_fails_create() {
    let (card, hpi) = rig(AdapterFamily::Asi6400);
    card.inject(|f| f.dsp_error = Some(911));
    assert_eq!(create_error(&card, &hpi), 911);
}
