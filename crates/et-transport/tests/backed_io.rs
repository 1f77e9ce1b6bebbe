//! BackedWriter / BackedReader の結合テスト

use std::sync::Arc;
use std::time::Duration;

use et_crypto::{CryptoHandler, Direction};
use et_proto::SequenceHeader;
use et_transport::{
    BackedReader, BackedWriter, InMemorySocketHandler, Packet, SocketHandler, SocketHandlerExt,
    WriteOutcome,
};

const KEY: &[u8] = b"12345678901234567890123456789012";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn crypto() -> CryptoHandler {
    CryptoHandler::new(KEY, Direction::ToServer).unwrap()
}

#[test]
fn test_writer_to_reader_single_packet() {
    init_tracing();
    let handler = Arc::new(InMemorySocketHandler::new());
    let fd = handler.create_loopback();
    let mut writer = BackedWriter::new(handler.clone(), crypto(), Some(fd));
    let mut reader = BackedReader::new(handler.clone(), crypto(), Some(fd));

    let outcome = writer.write(&Packet::new(42, "hello backed io")).unwrap();
    assert_eq!(outcome, WriteOutcome::Success);

    let packet = reader.read().unwrap().expect("packet should be available");
    assert_eq!(packet.header(), 42);
    assert_eq!(packet.payload(), b"hello backed io");
    assert_eq!(reader.sequence_number(), 1);
}

#[test]
fn test_order_preserved_over_pair() {
    init_tracing();
    let handler = Arc::new(InMemorySocketHandler::new());
    let (a, b) = handler.create_pair();
    let mut writer = BackedWriter::new(handler.clone(), crypto(), Some(a));
    let mut reader = BackedReader::new(handler.clone(), crypto(), Some(b));

    let payloads: Vec<String> = (0..20).map(|i| format!("message {i}")).collect();
    for payload in &payloads {
        assert_eq!(writer.write(&Packet::new(1, payload.as_str())).unwrap(), WriteOutcome::Success);
    }

    let mut received = Vec::new();
    while let Some(packet) = reader.read().unwrap() {
        received.push(String::from_utf8(packet.into_payload()).unwrap());
        assert_eq!(reader.sequence_number(), received.len() as i64);
    }
    assert_eq!(received, payloads);
}

#[test]
fn test_backlog_recovered_after_disconnect() {
    init_tracing();
    let handler = Arc::new(InMemorySocketHandler::new());
    let fd = handler.create_loopback();
    let mut writer = BackedWriter::new(handler.clone(), crypto(), Some(fd));

    writer.write(&Packet::new(1, "first")).unwrap();
    writer.write(&Packet::new(2, "second")).unwrap();

    handler.close(fd);
    writer.invalidate_socket();

    let recovered = writer.recover(0).unwrap();
    assert_eq!(recovered.len(), 2);

    let decryptor = crypto();
    let expected = [(1, "first"), (2, "second")];
    for (bytes, (sequence, payload)) in recovered.iter().zip(expected) {
        let mut packet = Packet::deserialize(bytes).unwrap();
        assert_eq!(packet.sequence_number(), Some(sequence));
        packet.decrypt(&decryptor).unwrap();
        assert_eq!(packet.payload(), payload.as_bytes());
    }
}

#[test]
fn test_reader_revive_delivers_once() {
    init_tracing();
    let handler = Arc::new(InMemorySocketHandler::new());
    let mut encryptor = crypto();
    let mut cached = Packet::new(7, "cached-payload");
    cached.encrypt(&mut encryptor).unwrap();

    let mut reader = BackedReader::new(handler.clone(), crypto(), None);
    let (fd, _peer) = handler.create_pair();
    reader.revive(fd, vec![cached.serialize()]);

    assert!(reader.has_data());
    let packet = reader.read().unwrap().unwrap();
    assert_eq!(packet.header(), 7);
    assert_eq!(packet.payload(), b"cached-payload");
    assert_eq!(reader.sequence_number(), 1);
    assert!(reader.read().unwrap().is_none());
    assert_eq!(reader.sequence_number(), 1);
}

#[test]
fn test_failed_writes_replayed_to_new_reader() {
    init_tracing();
    let handler = Arc::new(InMemorySocketHandler::new());
    let (a, b) = handler.create_pair();
    let mut writer = BackedWriter::new(handler.clone(), crypto(), Some(a));
    let mut reader = BackedReader::new(handler.clone(), crypto(), Some(b));

    writer.write(&Packet::new(1, "delivered")).unwrap();
    assert_eq!(reader.read().unwrap().unwrap().payload(), b"delivered");

    handler.close(b);
    assert_eq!(writer.write(&Packet::new(1, "in flight")).unwrap(), WriteOutcome::Failure);
    handler.close(a);
    writer.invalidate_socket();
    reader.invalidate_socket();

    let replay = writer.recover(reader.sequence_number()).unwrap();
    let (c, d) = handler.create_pair();
    writer.revive(c);
    reader.revive(d, replay);

    writer.write(&Packet::new(1, "after")).unwrap();
    assert_eq!(reader.read().unwrap().unwrap().payload(), b"in flight");
    assert_eq!(reader.read().unwrap().unwrap().payload(), b"after");
    assert_eq!(reader.sequence_number(), 3);
}

#[test]
fn test_proto_helpers_roundtrip() {
    let handler = InMemorySocketHandler::new();
    let (a, b) = handler.create_pair();
    let timeout = Some(Duration::from_secs(1));

    handler
        .write_proto(a, &SequenceHeader { sequence_number: 41 }, timeout)
        .unwrap();
    let header: SequenceHeader = handler.read_proto(b, timeout).unwrap();
    assert_eq!(header.sequence_number, 41);

    handler.write_b64(a, b"passkey bytes").unwrap();
    assert_eq!(handler.read_b64(b, 13).unwrap(), b"passkey bytes");
}

#[test]
fn test_read_all_times_out() {
    let handler = InMemorySocketHandler::new();
    let (a, _b) = handler.create_pair();
    let mut buf = [0u8; 4];
    let err = handler
        .read_all(a, &mut buf, Some(Duration::from_millis(20)))
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}
