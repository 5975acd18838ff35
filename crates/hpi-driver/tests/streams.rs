//! Bus-mastering stream rings and the bulk fallback

mod common;

use bytes::Bytes;
use common::{booted, exchanges};
use hpi_chip::hif::stream_state;
use hpi_driver::chip::AdapterFamily;
use hpi_driver::message::{AudioFormat, BufferCommand, ObjectType, StreamBody};
use hpi_driver::{code, func, Hpi6205, Message, SimulatedAdapter};

const RING: u32 = 4096;

fn pcm() -> AudioFormat {
    AudioFormat::pcm(2, 2, 48_000)
}

fn samples(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(3).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

/// Write claiming `size` bytes while carrying `data`.
fn short_write(size: u32, data: Bytes) -> Message {
    let body = StreamBody::Data {
        format: pcm(),
        size,
        data,
    };
    Message::stream(ObjectType::OStream, 0, 0, func::ostream::WRITE, body)
}

fn alloc(hpi: &Hpi6205, object: ObjectType, command: BufferCommand, size: u32) -> u16 {
    hpi.handle(&Message::host_buffer_alloc(object, 0, 0, command, size))
        .error
}

fn free(hpi: &Hpi6205, object: ObjectType, command: BufferCommand) -> u16 {
    hpi.handle(&Message::host_buffer_free(object, 0, 0, command))
        .error
}

fn playback_rig() -> (SimulatedAdapter, Hpi6205) {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    assert_eq!(alloc(&hpi, ObjectType::OStream, BufferCommand::External, RING), 0);
    (card, hpi)
}

#[test]
fn repeated_alloc_of_the_same_size_is_a_no_op() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let memory = card.memory();
    let live = memory.live_allocations();
    let answered = card.messages();

    assert_eq!(alloc(&hpi, ObjectType::OStream, BufferCommand::External, RING), 0);
    assert_eq!(memory.live_allocations(), live + 1);
    assert_eq!(card.messages(), answered + 1, "grant sent");

    let resp = hpi.handle(&Message::host_buffer_alloc(
        ObjectType::OStream,
        0,
        0,
        BufferCommand::External,
        RING,
    ));
    assert!(resp.is_ok());
    assert_eq!(resp.stream().unwrap().data_available, RING, "previous size");
    assert_eq!(memory.live_allocations(), live + 1);
    assert_eq!(card.messages(), answered + 1, "no second grant");
}

#[test]
fn playback_ring_carries_samples_to_the_dsp() {
    let (card, hpi) = playback_rig();
    let first = samples(1000, 1);
    let second = samples(500, 7);

    assert!(hpi.handle(&Message::ostream_write(0, 0, pcm(), first.clone())).is_ok());
    assert_eq!(card.formats_set(), 1);
    assert!(hpi.handle(&Message::ostream_write(0, 0, pcm(), second.clone())).is_ok());
    assert_eq!(card.formats_set(), 1, "format only follows a reset");

    let sent = exchanges(&hpi, 0);
    let info = hpi.handle(&Message::ostream(0, 0, func::ostream::GET_INFO));
    let status = info.stream().cloned().unwrap();
    assert_eq!(status.data_available, 1500);
    assert_eq!(status.buffer_size, RING);
    assert_eq!(exchanges(&hpi, 0), sent, "status read from host memory");

    let played = card.consume_playback(0, RING as usize);
    assert_eq!(played, [first.as_ref(), second.as_ref()].concat());

    let info = hpi.handle(&Message::ostream(0, 0, func::ostream::GET_INFO));
    let status = info.stream().cloned().unwrap();
    assert_eq!(status.data_available, 0);
    assert_eq!(u32::from(status.state), stream_state::PLAYING);
    assert_eq!(status.samples_transferred, 375);
}

#[test]
fn playback_wraps_around_the_ring() {
    let (card, hpi) = playback_rig();
    let mut expected = Vec::new();
    let mut played = Vec::new();
    for seed in 0..5u8 {
        let block = samples(1500, seed);
        let resp = hpi.handle(&Message::ostream_write(0, 0, pcm(), block.clone()));
        assert!(resp.is_ok(), "block {seed}: error {}", resp.error);
        expected.extend_from_slice(&block);
        played.extend(card.consume_playback(0, 1500));
    }
    assert_eq!(played, expected);
}

#[test]
fn reset_resends_the_format() {
    let (card, hpi) = playback_rig();
    assert!(hpi.handle(&Message::ostream_write(0, 0, pcm(), samples(64, 0))).is_ok());
    assert!(hpi.handle(&Message::ostream(0, 0, func::ostream::RESET)).is_ok());
    assert!(hpi.handle(&Message::ostream_write(0, 0, pcm(), samples(64, 0))).is_ok());
    assert_eq!(card.formats_set(), 2);
}

#[test]
fn oversized_write_is_rejected_untouched() {
    let (card, hpi) = playback_rig();
    let resp = hpi.handle(&Message::ostream_write(0, 0, pcm(), samples(RING as usize, 0)));
    assert_eq!(resp.error, code::INVALID_DATASIZE);

    let adapter = hpi.adapter(0).unwrap();
    let status = adapter
        .lock()
        .interface()
        .status(hpi_driver::stream::Direction::Out, 0);
    assert_eq!((status.host_index, status.dsp_index), (0, 0));
    assert!(card.consume_playback(0, RING as usize).is_empty());

    // Four guard bytes stay free.
    let resp = hpi.handle(&Message::ostream_write(0, 0, pcm(), samples(RING as usize - 4, 0)));
    assert!(resp.is_ok(), "error {}", resp.error);
}

#[test]
fn write_shorter_than_its_size_is_rejected_before_the_ring() {
    let (card, hpi) = playback_rig();
    let resp = hpi.handle(&short_write(100, samples(64, 0)));
    assert_eq!(resp.error, code::INVALID_DATASIZE);
    assert_eq!(card.formats_set(), 0, "format held until a valid write");
    assert!(card.consume_playback(0, RING as usize).is_empty());

    let resp = hpi.handle(&short_write(64, samples(64, 0)));
    assert!(resp.is_ok(), "error {}", resp.error);
    assert_eq!(card.consume_playback(0, RING as usize).len(), 64);
}

#[test]
fn record_ring_delivers_captured_samples() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    assert_eq!(alloc(&hpi, ObjectType::IStream, BufferCommand::External, RING), 0);

    let captured = samples(800, 9);
    assert_eq!(card.produce_record(0, &captured), 800);

    let sent = exchanges(&hpi, 0);
    let info = hpi.handle(&Message::istream(0, 0, func::istream::GET_INFO));
    let status = info.stream().cloned().unwrap();
    assert_eq!(status.data_available, 800);
    assert_eq!(u32::from(status.state), stream_state::RECORDING);

    let resp = hpi.handle(&Message::istream_read(0, 0, 600));
    assert_eq!(resp.stream().unwrap().data, captured.slice(..600));
    let resp = hpi.handle(&Message::istream_read(0, 0, 300));
    assert_eq!(resp.error, code::INVALID_DATASIZE, "only 200 left");
    let resp = hpi.handle(&Message::istream_read(0, 0, 200));
    assert_eq!(resp.stream().unwrap().data, captured.slice(600..));
    assert_eq!(exchanges(&hpi, 0), sent, "ring reads stay on the host");
}

#[test]
fn refused_grant_releases_the_ring() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let live = card.memory().live_allocations();
    card.inject(|f| f.grant_error = Some(code::INVALID_OPERATION));

    let err = alloc(&hpi, ObjectType::OStream, BufferCommand::External, RING);
    assert_eq!(err, code::INVALID_OPERATION);
    assert_eq!(card.memory().live_allocations(), live);

    let sent = exchanges(&hpi, 0);
    assert!(hpi
        .handle(&Message::ostream(0, 0, func::ostream::GET_INFO))
        .is_ok());
    assert_eq!(exchanges(&hpi, 0), sent + 1, "no ring, so the DSP answers");
}

#[test]
fn external_free_revokes_and_releases() {
    let (card, hpi) = playback_rig();
    let live = card.memory().live_allocations();
    let answered = card.messages();

    assert_eq!(free(&hpi, ObjectType::OStream, BufferCommand::External), 0);
    assert_eq!(card.messages(), answered + 1, "revoke sent");
    assert_eq!(card.memory().live_allocations(), live - 1);

    assert_eq!(free(&hpi, ObjectType::OStream, BufferCommand::External), 0);
    assert_eq!(card.messages(), answered + 1, "nothing left to revoke");
}

#[test]
fn split_alloc_grant_revoke_free() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let live = card.memory().live_allocations();
    let answered = card.messages();

    assert_eq!(alloc(&hpi, ObjectType::OStream, BufferCommand::InternalAlloc, RING), 0);
    assert_eq!(card.memory().live_allocations(), live + 1);
    assert_eq!(card.messages(), answered, "allocation is host-only");

    assert_eq!(alloc(&hpi, ObjectType::OStream, BufferCommand::GrantAdapter, 0), 0);
    assert_eq!(card.messages(), answered + 1);
    assert!(hpi
        .handle(&Message::ostream_write(0, 0, pcm(), samples(32, 0)))
        .is_ok());
    assert_eq!(card.consume_playback(0, 64).len(), 32);

    assert_eq!(free(&hpi, ObjectType::OStream, BufferCommand::RevokeAdapter), 0);
    assert_eq!(card.messages(), answered + 3, "format and revoke");
    assert_eq!(card.memory().live_allocations(), live + 1, "revoke keeps the ring");

    assert_eq!(free(&hpi, ObjectType::OStream, BufferCommand::InternalFree), 0);
    assert_eq!(card.messages(), answered + 3);
    assert_eq!(card.memory().live_allocations(), live);
}

#[test]
fn streams_without_a_ring_fall_back_to_bulk_transfers() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);

    let block = samples(64, 5);
    let resp = hpi.handle(&Message::ostream_write(0, 0, pcm(), block.clone()));
    assert!(resp.is_ok(), "error {}", resp.error);
    assert_eq!(card.received_on_stream(0), block.to_vec());
    assert_eq!(card.formats_set(), 0, "format travels with the DSP's own write");

    let resp = hpi.handle(&Message::istream_read(0, 0, 8));
    assert!(resp.is_ok(), "error {}", resp.error);
    assert_eq!(resp.stream().unwrap().data.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn bulk_write_shorter_than_its_size_never_reaches_the_dsp() {
    let (card, hpi) = booted(AdapterFamily::Asi6400);
    let answered = card.messages();

    let resp = hpi.handle(&short_write(100, samples(64, 0)));
    assert_eq!(resp.error, code::INVALID_DATASIZE);
    assert_eq!(card.messages(), answered);
    assert!(card.received_on_stream(0).is_empty());
    assert!(!hpi.adapter(0).unwrap().lock().is_crashed());
}

#[test]
fn stream_index_out_of_range() {
    let (_card, hpi) = booted(AdapterFamily::Asi6400);
    let resp = hpi.handle(&Message::ostream(0, 16, func::ostream::START));
    assert_eq!(resp.error, code::INVALID_STREAM);
    let resp = hpi.handle(&Message::istream_read(0, 31, 4));
    assert_eq!(resp.error, code::INVALID_STREAM);
}
