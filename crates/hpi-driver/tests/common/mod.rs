//! Shared setup for the integration tests.

#![allow(dead_code)]

use hpi_driver::chip::AdapterFamily;
use hpi_driver::{Environment, Hpi6205, Message, SimulatedAdapter};

/// Route driver logs to the test harness when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Card of `family` and a driver wired to it.
pub fn rig(family: AdapterFamily) -> (SimulatedAdapter, Hpi6205) {
    init_logging();
    let card = SimulatedAdapter::new(family);
    let hpi = Hpi6205::new(card.environment());
    (card, hpi)
}

/// Card and driver using a modified environment.
pub fn rig_with(
    family: AdapterFamily,
    tweak: impl FnOnce(&mut Environment),
) -> (SimulatedAdapter, Hpi6205) {
    init_logging();
    let card = SimulatedAdapter::new(family);
    let mut env = card.environment();
    tweak(&mut env);
    (card, Hpi6205::new(env))
}

/// Boot `card` through the subsystem and return its adapter index.
pub fn create(hpi: &Hpi6205, card: &SimulatedAdapter) -> u16 {
    let resp = hpi.handle(&Message::create_adapter(card.resource()));
    assert!(
        resp.is_ok(),
        "create failed: {}",
        hpi_driver::describe_code(resp.error)
    );
    resp.subsys().map(|s| s.adapter_index).unwrap()
}

/// Booted card of `family` at adapter index 0.
pub fn booted(family: AdapterFamily) -> (SimulatedAdapter, Hpi6205) {
    let (card, hpi) = rig(family);
    create(&hpi, &card);
    (card, hpi)
}

/// Message exchanges adapter `index` has attempted.
pub fn exchanges(hpi: &Hpi6205, index: u16) -> u32 {
    hpi.adapter(index).unwrap().lock().exchanges()
}
