//! Message entry point and adapter table.
//!
//! Subsystem messages operate on the table itself; every other message is
//! routed to one adapter and handled under that adapter's lock. The table
//! lock is never held while an adapter boots or exchanges, so adapters run
//! independently.

use crate::adapter::{AdapterHw, Environment};
use crate::error::{HpiError, Result};
use crate::message::{
    func, Message, MessagePayload, ObjectType, Response, ResponsePayload, SubsysResult,
    MAX_ADAPTERS,
};
use crate::mmio::PciResource;
use hpi_chip::pcie::{DSP6205_DEVICE_ID, TI_VENDOR_ID};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Anything that answers HPI messages.
pub trait HpiHandler: Send + Sync {
    /// Answer `msg`. Failures are carried in the response, never returned.
    fn handle(&self, msg: &Message) -> Response;
}

/// Driver version reported by subsystem GET_VERSION and GET_INFO.
#[must_use]
pub fn driver_version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0) & 0xFF;
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let major = parts.next().map_or(0, part);
    let minor = parts.next().map_or(0, part);
    let patch = parts.next().map_or(0, part);
    (major << 16) | (minor << 8) | patch
}

/// One registered adapter.
#[derive(Debug)]
pub struct Adapter {
    adapter_type: u16,
    state: Mutex<AdapterHw>,
}

impl Adapter {
    fn new(hw: AdapterHw) -> Self {
        Self {
            adapter_type: hw.adapter_type(),
            state: Mutex::new(hw),
        }
    }

    /// Model the DSP reported at create. Readable without the lock.
    #[must_use]
    pub fn adapter_type(&self) -> u16 {
        self.adapter_type
    }

    /// Exclusive access to the adapter. Holding the guard keeps every other
    /// message to this adapter waiting.
    pub fn lock(&self) -> MutexGuard<'_, AdapterHw> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adapters by the index their DSP reported.
#[derive(Debug, Default)]
pub struct AdapterTable {
    slots: BTreeMap<u16, Arc<Adapter>>,
}

impl AdapterTable {
    /// Adapter at `index`.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<Arc<Adapter>> {
        self.slots.get(&index).cloned()
    }

    /// Registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn contains(&self, index: u16) -> bool {
        self.slots.contains_key(&index)
    }

    fn insert(&mut self, index: u16, adapter: Arc<Adapter>) {
        self.slots.insert(index, adapter);
    }

    fn remove(&mut self, index: u16) -> Option<Arc<Adapter>> {
        self.slots.remove(&index)
    }

    fn drain(&mut self) -> Vec<Arc<Adapter>> {
        std::mem::take(&mut self.slots).into_values().collect()
    }

    fn summary(&self) -> SubsysResult {
        let mut result = SubsysResult {
            version: driver_version(),
            num_adapters: u16::try_from(self.slots.len()).unwrap_or(u16::MAX),
            ..SubsysResult::default()
        };
        for (&index, adapter) in &self.slots {
            if let Some(slot) = result.adapter_list.get_mut(usize::from(index)) {
                *slot = adapter.adapter_type();
            }
        }
        result
    }
}

/// The 6205 driver: an adapter table plus the services adapters are built
/// with.
#[derive(Debug)]
pub struct Hpi6205 {
    env: Environment,
    adapters: Mutex<AdapterTable>,
}

impl Hpi6205 {
    /// Driver with an empty adapter table.
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            adapters: Mutex::new(AdapterTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, AdapterTable> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adapter registered at `index`.
    #[must_use]
    pub fn adapter(&self, index: u16) -> Option<Arc<Adapter>> {
        self.table().get(index)
    }

    /// Registered adapters.
    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.table().len()
    }

    /// Answer one message.
    pub fn handle(&self, msg: &Message) -> Response {
        if msg.object == ObjectType::Subsystem {
            return self.subsys_message(msg);
        }
        let Some(adapter) = self.adapter(msg.adapter_index) else {
            debug!("No adapter {} for {:#06x}", msg.adapter_index, msg.function);
            return Response::from_error(
                msg,
                &HpiError::BadAdapterNumber {
                    index: msg.adapter_index,
                },
            );
        };
        let mut hw = adapter.lock();
        hw.handle(msg)
    }

    fn subsys_message(&self, msg: &Message) -> Response {
        let mut resp = Response::new(msg);
        match msg.function {
            func::subsys::OPEN | func::subsys::CLOSE | func::subsys::DRIVER_UNLOAD => {}
            func::subsys::DRIVER_LOAD => {
                let stale = self.table().drain();
                for adapter in stale {
                    adapter.lock().teardown();
                }
                info!("Driver loaded");
            }
            func::subsys::GET_VERSION => {
                resp.payload = ResponsePayload::Subsystem(SubsysResult {
                    version: driver_version(),
                    ..SubsysResult::default()
                });
            }
            func::subsys::GET_INFO => {
                resp.payload = ResponsePayload::Subsystem(self.table().summary());
            }
            func::subsys::CREATE_ADAPTER => match self.create_adapter(msg) {
                Ok(result) => resp.payload = ResponsePayload::Subsystem(result),
                Err(e) => resp.set_error(&e),
            },
            func::subsys::DELETE_ADAPTER => {
                if let Err(e) = self.delete_adapter(msg.adapter_index) {
                    resp.set_error(&e);
                }
            }
            function => resp.set_error(&HpiError::InvalidFunction { function }),
        }
        resp
    }

    fn create_adapter(&self, msg: &Message) -> Result<SubsysResult> {
        let resource: &PciResource = match &msg.payload {
            MessagePayload::Subsystem(req) => req.resource.as_ref(),
            _ => None,
        }
        .ok_or_else(|| HpiError::processing("create adapter without a PCI resource"))?;

        if resource.vendor_id != TI_VENDOR_ID || resource.device_id != DSP6205_DEVICE_ID {
            warn!(
                "{}: {:04x}:{:04x} is not a 6205 bridge",
                resource.address, resource.vendor_id, resource.device_id
            );
            return Err(HpiError::BadAdapter {
                vendor_id: resource.vendor_id,
                device_id: resource.device_id,
            });
        }

        let mut hw = AdapterHw::create(resource, &self.env)?;
        let index = hw.index();
        if usize::from(index) >= MAX_ADAPTERS {
            warn!("{}: DSP reported adapter index {index}", resource.address);
            hw.teardown();
            return Err(HpiError::BadAdapterNumber { index });
        }

        let mut table = self.table();
        if table.contains(index) {
            drop(table);
            warn!("{}: adapter index {index} already registered", resource.address);
            hw.teardown();
            return Err(HpiError::DuplicateAdapterNumber { index });
        }
        table.insert(index, Arc::new(Adapter::new(hw)));
        let mut result = table.summary();
        result.adapter_index = index;
        info!("Adapter {index} registered ({} total)", table.len());
        Ok(result)
    }

    fn delete_adapter(&self, index: u16) -> Result<()> {
        let adapter = self
            .table()
            .remove(index)
            .ok_or(HpiError::BadAdapterNumber { index })?;
        adapter.lock().teardown();
        info!("Adapter {index} deleted");
        Ok(())
    }
}

impl HpiHandler for Hpi6205 {
    fn handle(&self, msg: &Message) -> Response {
        Hpi6205::handle(self, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use crate::sim::SimulatedAdapter;
    use hpi_chip::pcie::AdapterFamily;

    #[test]
    fn messages_for_unknown_adapters_are_rejected() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let hpi = Hpi6205::new(card.environment());
        let resp = hpi.handle(&Message::adapter(3, func::adapter::GET_INFO));
        assert_eq!(resp.error, code::BAD_ADAPTER_NUMBER);
    }

    #[test]
    fn wrong_pci_signature_is_a_bad_adapter() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let hpi = Hpi6205::new(card.environment());
        let mut resource = card.resource();
        resource.device_id = 0x9050;
        let resp = hpi.handle(&Message::create_adapter(resource));
        assert_eq!(resp.error, code::BAD_ADAPTER);
        assert!(card.writes().is_empty(), "card untouched");
        assert_eq!(hpi.adapter_count(), 0);
    }

    #[test]
    fn find_adapters_is_not_supported() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let hpi = Hpi6205::new(card.environment());
        let resp = hpi.handle(&Message::subsys(func::subsys::FIND_ADAPTERS));
        assert_eq!(resp.error, code::INVALID_FUNC);
        for function in [
            func::subsys::OPEN,
            func::subsys::CLOSE,
            func::subsys::DRIVER_UNLOAD,
        ] {
            assert!(hpi.handle(&Message::subsys(function)).is_ok());
        }
    }

    #[test]
    fn create_lists_then_driver_load_wipes() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6600).with_index(2);
        let hpi = Hpi6205::new(card.environment());

        let resp = hpi.handle(&Message::create_adapter(card.resource()));
        assert!(resp.is_ok(), "error {}", resp.error);
        let created = resp.subsys().copied().unwrap();
        assert_eq!(created.adapter_index, 2);
        assert_eq!(created.num_adapters, 1);
        assert_eq!(created.adapter_list[2], 0x6614);

        let info = hpi.handle(&Message::subsys(func::subsys::GET_INFO));
        assert_eq!(info.subsys().unwrap().adapter_list[2], 0x6614);
        assert_eq!(info.subsys().unwrap().version, driver_version());

        assert!(hpi.handle(&Message::subsys(func::subsys::DRIVER_LOAD)).is_ok());
        assert_eq!(hpi.adapter_count(), 0);
    }

    #[test]
    fn subsystem_info_does_not_wait_for_a_busy_adapter() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let hpi = Arc::new(Hpi6205::new(card.environment()));
        assert!(hpi.handle(&Message::create_adapter(card.resource())).is_ok());

        let adapter = hpi.adapter(0).unwrap();
        let busy = adapter.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let caller = Arc::clone(&hpi);
        let handle = std::thread::spawn(move || {
            let resp = caller.handle(&Message::subsys(func::subsys::GET_INFO));
            let _ = tx.send(resp);
        });
        let resp = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        drop(busy);
        handle.join().unwrap();

        assert_eq!(resp.subsys().unwrap().adapter_list[0], 0x6416);
        assert_eq!(adapter.adapter_type(), 0x6416);
    }

    #[test]
    fn delete_unknown_adapter() {
        let card = SimulatedAdapter::new(AdapterFamily::Asi6400);
        let hpi = Hpi6205::new(card.environment());
        let resp = hpi.handle(&Message::delete_adapter(5));
        assert_eq!(resp.error, code::BAD_ADAPTER_NUMBER);
    }

    #[test]
    fn version_packs_semver() {
        assert_eq!(driver_version() >> 16, 0);
        assert_eq!((driver_version() >> 8) & 0xFF, 1);
    }
}
