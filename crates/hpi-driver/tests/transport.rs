//! Message exchange, crash promotion and bulk relay through the dispatcher

mod common;

use bytes::Bytes;
use common::{booted, create, exchanges, rig, rig_with};
use hpi_driver::chip::AdapterFamily;
use hpi_driver::message::AsyncEvent;
use hpi_driver::{code, func, Message, MessagePayload, SimFaults};
use std::sync::Arc;
use std::thread;

#[test]
fn adapter_info_round_trip() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let before = card.messages();

    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert!(resp.is_ok());
    let info = resp.adapter().unwrap();
    assert_eq!(info.adapter_type, 0x6416);
    assert_eq!(info.num_outstreams, 4);
    assert_eq!(card.messages(), before + 1);
}

#[test]
fn dsp_errors_pass_through_without_crashing() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.dsp_error = Some(456));
    let resp = hpi.handle(&Message::adapter(0, func::adapter::SELFTEST));
    assert_eq!(resp.error, 456);
    assert!(!hpi.adapter(0).unwrap().lock().is_crashed());
}

#[test]
fn late_ack_is_tolerated() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.skip_get_resp_ack = true);
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert!(resp.is_ok(), "error {}", resp.error);
    assert!(!hpi.adapter(0).unwrap().lock().is_crashed());
}

#[test]
fn missing_response_interrupt_crashes_the_adapter() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.drop_response_irq = true);

    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert_eq!(resp.error, 1016);
    assert!(hpi.adapter(0).unwrap().lock().is_crashed());

    let answered = card.messages();
    let sent = exchanges(&hpi, 0);
    card.inject(|f| *f = SimFaults::default());
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert_eq!(resp.error, code::DSP_HARDWARE);
    assert_eq!(card.messages(), answered, "crashed adapter contacted");
    assert_eq!(exchanges(&hpi, 0), sent);
}

#[test]
fn recreating_a_crashed_adapter_clears_the_crash() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.garbled_response = true);
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert_eq!(resp.error, code::INVALID_RESPONSE);
    assert!(hpi.adapter(0).unwrap().lock().is_crashed());

    card.inject(|f| *f = SimFaults::default());
    assert!(hpi.handle(&Message::delete_adapter(0)).is_ok());
    assert_eq!(create(&hpi, &card), 0);
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert!(resp.is_ok());
}

#[test]
fn interface_that_never_idles() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.ack_stuck = true);

    // The ack is still idle from the previous exchange.
    assert!(hpi.handle(&Message::adapter(0, func::adapter::GET_INFO)).is_ok());
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert_eq!(resp.error, 1015);
    let resp = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
    assert_eq!(resp.error, code::DSP_HARDWARE);
}

#[test]
fn duplicate_adapter_index_is_rejected() {
    let (first, hpi) = rig(AdapterFamily::Asi6400);
    create(&hpi, &first);

    let second = hpi_driver::SimulatedAdapter::with_memory(AdapterFamily::Asi6600, first.memory());
    let live = first.memory().live_allocations();
    let resp = hpi.handle(&Message::create_adapter(second.resource()));
    assert_eq!(resp.error, code::DUPLICATE_ADAPTER_NUMBER);
    assert_eq!(hpi.adapter_count(), 1);
    // Only the interface buffer the second card still points at survives.
    assert_eq!(
        first.memory().live_allocations(),
        live + 1,
        "rejected adapter's host areas released"
    );

    let second = second.with_index(1);
    assert_eq!(create(&hpi, &second), 1);
    assert_eq!(hpi.adapter_count(), 2);
}

#[test]
fn concurrent_callers_are_serialized_per_adapter() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let hpi = Arc::new(hpi);
    let before = card.messages();

    let workers: Vec<_> = (0..4u16)
        .map(|t| {
            let hpi = Arc::clone(&hpi);
            thread::spawn(move || {
                for i in 0..25u32 {
                    let set = Message::control_set(0, 100 + t, 0x0101, i, u32::from(t));
                    assert!(hpi.handle(&set).is_ok());
                    let info = hpi.handle(&Message::adapter(0, func::adapter::GET_INFO));
                    assert!(info.is_ok(), "error {}", info.error);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(card.messages(), before + 200);
    assert!(!hpi.adapter(0).unwrap().lock().is_crashed());
}

#[test]
fn control_cache_answers_without_the_dsp() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    assert!(hpi.handle(&Message::control_set(0, 2, 0x0101, 7, 9)).is_ok());

    let sent = exchanges(&hpi, 0);
    let resp = hpi.handle(&Message::control_get(0, 2, 0x0101));
    let value = resp.control().copied().unwrap();
    assert_eq!((value.param1, value.param2), (7, 9));
    assert_eq!(exchanges(&hpi, 0), sent, "cache hit went to the DSP");

    card.publish_control(4, 0x0200, 11, 12);
    let resp = hpi.handle(&Message::control_get(0, 4, 0x0200));
    assert_eq!(resp.control().map(|c| c.param1), Some(11));
    assert_eq!(exchanges(&hpi, 0), sent);

    let resp = hpi.handle(&Message::control_get(0, 2, 0x0102));
    assert!(resp.is_ok());
    assert_eq!(exchanges(&hpi, 0), sent + 1, "other attribute misses");
}

#[test]
fn without_a_cache_every_get_goes_to_the_dsp() {
    let card = hpi_driver::SimulatedAdapter::new(AdapterFamily::Asi6400).with_cache_controls(0);
    let hpi = hpi_driver::Hpi6205::new(card.environment());
    create(&hpi, &card);
    assert!(hpi.adapter(0).unwrap().lock().control_cache().is_none());

    assert!(hpi.handle(&Message::control_set(0, 1, 1, 3, 4)).is_ok());
    let sent = exchanges(&hpi, 0);
    let resp = hpi.handle(&Message::control_get(0, 1, 1));
    assert_eq!(resp.control().map(|c| (c.param1, c.param2)), Some((3, 4)));
    assert_eq!(exchanges(&hpi, 0), sent + 1);
}

#[test]
fn bulk_set_is_chunked_through_the_interface_buffer() {
    let (card, hpi) = rig_with(AdapterFamily::Asi6400, |env| env.config.hif.bulk_chunk = 4096);
    create(&hpi, &card);

    let block: Vec<u8> = (0..10_002u32).map(|i| (i % 251) as u8).collect();
    let resp = hpi.handle(&Message::controlex_bulk_set(0, 1, Bytes::from(block.clone())));
    assert!(resp.is_ok(), "error {}", resp.error);
    assert_eq!(card.received_bulk(), block[..10_000].to_vec());
}

#[test]
fn bulk_set_longer_than_its_data_is_rejected() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let sent = exchanges(&hpi, 0);

    let mut msg = Message::controlex_bulk_set(0, 1, Bytes::from_static(&[1, 2, 3, 4]));
    if let MessagePayload::ControlEx(req) = &mut msg.payload {
        req.byte_count = 8;
    }
    let resp = hpi.handle(&msg);
    assert_eq!(resp.error, code::INVALID_DATASIZE);
    assert_eq!(exchanges(&hpi, 0), sent);
    assert!(card.received_bulk().is_empty());
}

#[test]
fn bulk_get_uses_the_dsp_byte_count() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let block: Vec<u8> = (0..40_000u32).map(|i| (i % 13) as u8).collect();
    card.set_bulk_block(Bytes::from(block.clone()));

    let resp = hpi.handle(&Message::controlex_bulk_get(0, 1, 65_536));
    assert!(resp.is_ok(), "error {}", resp.error);
    let result = resp.controlex().unwrap();
    assert_eq!(result.byte_count, 40_000);
    assert_eq!(result.data, Bytes::from(block));
}

#[test]
fn repeated_bulk_timeouts_crash_the_adapter() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    card.inject(|f| f.bulk_no_irq = true);
    let payload = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);

    for attempt in 1..=3 {
        let resp = hpi.handle(&Message::controlex_bulk_set(0, 1, payload.clone()));
        assert_eq!(resp.error, code::DSP_HARDWARE, "attempt {attempt}");
        let crashed = hpi.adapter(0).unwrap().lock().is_crashed();
        assert_eq!(crashed, attempt == 3, "attempt {attempt}");
    }
}

#[test]
fn async_events_are_read_from_the_ring() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let sent = exchanges(&hpi, 0);
    for n in 0..5u16 {
        assert!(card.raise_event(AsyncEvent {
            event_type: 1,
            object_index: n,
            param1: u32::from(n),
            param2: 0,
        }));
    }

    let count = hpi.handle(&Message::async_event(0, func::asyncevent::GET_COUNT, 0));
    assert_eq!(count.async_events().unwrap().count, 5);

    let got = hpi.handle(&Message::async_event(0, func::asyncevent::GET, 10));
    let events = &got.async_events().unwrap().events;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].object_index, 0);
    assert_eq!(events[2].object_index, 2);

    let got = hpi.handle(&Message::async_event(0, func::asyncevent::GET, 10));
    assert_eq!(got.async_events().unwrap().count, 2);
    assert_eq!(exchanges(&hpi, 0), sent, "events are host-side only");
}

#[test]
fn subsystem_object_is_not_an_adapter_object() {
    let (_card, hpi) = booted(AdapterFamily::Asi6400);
    let hw_resp = hpi
        .adapter(0)
        .unwrap()
        .lock()
        .handle(&Message::subsys(func::subsys::GET_INFO));
    assert_eq!(hw_resp.error, code::INVALID_OBJ);
}
