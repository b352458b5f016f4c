//! Codec Tests
//!
//! Tests for the binary command format and modified UTF-8 strings.

use std::io::Cursor;

use bytes::BytesMut;
use turnlink::protocol::{
    decode_command, encode_command, put_string, read_command, read_magic, read_string,
    write_command, write_magic, Command, CommandTypeRegistry, Value, MAX_ARGUMENTS,
};
use turnlink::{LinkError, ProtocolError};

fn registry_with(names: &[&str]) -> CommandTypeRegistry {
    let registry = CommandTypeRegistry::new();
    for name in names {
        registry.register(name).unwrap();
    }
    registry
}

// =============================================================================
// Command Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_every_tag() {
    let registry = registry_with(&["STATE"]);
    let cmd = Command::new(registry.resolve("STATE").unwrap())
        .with("none", Value::Null)
        .with("flag", true)
        .with("turn", -7i32)
        .with("clock", 1_700_000_000_123i64)
        .with("ratio", 0.5f32)
        .with("score", -12.25f64)
        .with("player", "bob")
        .with("board", vec![1u8, 2, 3, 255]);

    let decoded = decode_command(&encode_command(&cmd).unwrap(), &registry).unwrap();

    assert_eq!(decoded.type_name(), "STATE");
    assert_eq!(decoded, cmd);
    assert_eq!(decoded.get("none"), Some(&Value::Null));
    assert_eq!(decoded.get_bool("flag"), Some(true));
    assert_eq!(decoded.get_i32("turn"), Some(-7));
    assert_eq!(decoded.get_i64("clock"), Some(1_700_000_000_123));
    assert_eq!(decoded.get("ratio"), Some(&Value::Float32(0.5)));
    assert_eq!(decoded.get_f64("score"), Some(-12.25));
    assert_eq!(decoded.get_str("player"), Some("bob"));
    assert_eq!(decoded.get_blob("board"), Some(&[1u8, 2, 3, 255][..]));
}

#[test]
fn test_decode_preserves_argument_order() {
    let registry = registry_with(&["ORDERED"]);
    let cmd = Command::new(registry.resolve("ORDERED").unwrap())
        .with("z", 1i32)
        .with("a", 2i32)
        .with("m", 3i32);

    let decoded = decode_command(&encode_command(&cmd).unwrap(), &registry).unwrap();
    let keys: Vec<&str> = decoded.arguments().keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["z", "a", "m"]);
}

#[test]
fn test_empty_command_layout() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().ping.clone());
    let encoded = encode_command(&cmd).unwrap();

    // len(4) "PING" count(0)
    assert_eq!(encoded, vec![0, 4, b'P', b'I', b'N', b'G', 0, 0, 0, 0]);
}

#[test]
fn test_int_argument_layout_is_big_endian() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().cl_connection_speed.clone()).with("speed", 258i32);
    let encoded = encode_command(&cmd).unwrap();

    let tail = &encoded[encoded.len() - 5..];
    assert_eq!(tail, &[2, 0, 0, 1, 2]);
}

#[test]
fn test_unknown_type_rejected() {
    let sender = registry_with(&["ONLY_HERE"]);
    let receiver = CommandTypeRegistry::new();
    let cmd = Command::new(sender.resolve("ONLY_HERE").unwrap());

    let err = decode_command(&encode_command(&cmd).unwrap(), &receiver).unwrap_err();
    assert!(matches!(
        err,
        LinkError::Protocol(ProtocolError::UnknownType(ref name)) if name == "ONLY_HERE"
    ));
}

#[test]
fn test_unknown_tag_rejected() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().message.clone()).with("msg", Value::Null);
    let mut encoded = encode_command(&cmd).unwrap();
    let last = encoded.len() - 1;
    encoded[last] = 42;

    let err = decode_command(&encoded, &registry).unwrap_err();
    assert!(matches!(
        err,
        LinkError::Protocol(ProtocolError::UnknownArgumentTag(42))
    ));
}

#[test]
fn test_truncated_input_is_io_error() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().message.clone()).with("msg", "hello");
    let encoded = encode_command(&cmd).unwrap();

    let err = decode_command(&encoded[..encoded.len() - 2], &registry).unwrap_err();
    assert!(matches!(err, LinkError::Io(_)));
    assert!(err.is_disconnect());
}

#[test]
fn test_negative_argument_count_rejected() {
    let registry = CommandTypeRegistry::new();
    let mut bytes = encode_command(&Command::new(registry.reserved().ping.clone())).unwrap();
    let n = bytes.len();
    bytes[n - 4..].copy_from_slice(&(-1i32).to_be_bytes());

    let err = decode_command(&bytes, &registry).unwrap_err();
    assert!(matches!(err, LinkError::Protocol(ProtocolError::Malformed(_))));
}

#[test]
fn test_argument_limit_enforced_on_encode() {
    let registry = CommandTypeRegistry::new();
    let message = registry.reserved().message.clone();

    let mut at_limit = Command::new(message.clone());
    for i in 0..MAX_ARGUMENTS {
        at_limit.set(format!("k{}", i), i);
    }
    let encoded = encode_command(&at_limit).unwrap();
    assert_eq!(decode_command(&encoded, &registry).unwrap().len(), MAX_ARGUMENTS as usize);

    let mut over = at_limit.clone();
    over.set("one_more", true);
    let err = encode_command(&over).unwrap_err();
    assert!(matches!(err, LinkError::Protocol(ProtocolError::Malformed(_))));

    // Nothing reaches the stream either
    let mut sink = Vec::new();
    assert!(write_command(&mut sink, &over).is_err());
    assert!(sink.is_empty());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_write_read_stream_sequence() {
    let registry = CommandTypeRegistry::new();
    let reserved = registry.reserved();
    let mut buf = Vec::new();

    write_magic(&mut buf, 0xDEAD_BEEF_0000_0001).unwrap();
    write_command(&mut buf, &Command::new(reserved.message.clone()).with("msg", "one")).unwrap();
    write_command(&mut buf, &Command::new(reserved.message.clone()).with("msg", "two")).unwrap();

    let mut cursor = Cursor::new(buf);
    assert_eq!(read_magic(&mut cursor).unwrap(), 0xDEAD_BEEF_0000_0001);
    assert_eq!(read_command(&mut cursor, &registry).unwrap().get_str("msg"), Some("one"));
    assert_eq!(read_command(&mut cursor, &registry).unwrap().get_str("msg"), Some("two"));
    assert!(read_command(&mut cursor, &registry).is_err());
}

#[test]
fn test_write_records_type_stats() {
    let registry = registry_with(&["STAT"]);
    let ty = registry.resolve("STAT").unwrap();
    let mut sink = Vec::new();

    let small = write_command(&mut sink, &Command::new(ty.clone())).unwrap();
    let large = write_command(&mut sink, &Command::new(ty.clone()).with("k", "value")).unwrap();

    let stats = ty.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.min_bytes, small);
    assert_eq!(stats.max_bytes, large);
    assert_eq!(stats.total_bytes, (small + large) as u64);
    assert_eq!(stats.average(), (small + large) as f64 / 2.0);
    assert!(registry.stats_report().contains("STAT"));
}

// =============================================================================
// Modified UTF-8 Tests
// =============================================================================

fn encode_str(s: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, s).unwrap();
    buf.to_vec()
}

#[test]
fn test_nul_uses_two_bytes() {
    assert_eq!(encode_str("a\0b"), vec![0, 4, b'a', 0xC0, 0x80, b'b']);
}

#[test]
fn test_supplementary_char_uses_surrogate_pair() {
    // U+1F600 -> D83D DE00 -> two 3-byte sequences
    let encoded = encode_str("\u{1F600}");
    assert_eq!(encoded, vec![0, 6, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]);
}

#[test]
fn test_string_roundtrip_mixed_scripts() {
    for s in ["", "plain", "naïve café", "日本語", "nul\0inside", "emoji \u{1F3B2} dice"] {
        let mut cursor = Cursor::new(encode_str(s));
        assert_eq!(read_string(&mut cursor).unwrap(), s);
    }
}

#[test]
fn test_string_too_long() {
    let mut buf = BytesMut::new();
    let long = "x".repeat(70_000);
    let err = put_string(&mut buf, &long).unwrap_err();
    assert!(matches!(
        err,
        LinkError::Protocol(ProtocolError::StringTooLong(70_000))
    ));
}

#[test]
fn test_invalid_utf8_rejected() {
    let mut cursor = Cursor::new(vec![0u8, 2, 0xC0, 0x20]);
    let err = read_string(&mut cursor).unwrap_err();
    assert!(matches!(err, LinkError::Protocol(ProtocolError::InvalidUtf8)));
}

// =============================================================================
// Blob Value Tests
// =============================================================================

#[test]
fn test_serialized_blob_travels_as_blob() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Board {
        cells: Vec<u8>,
        to_move: String,
    }

    let registry = registry_with(&["BOARD"]);
    let board = Board {
        cells: vec![0, 1, 2, 1],
        to_move: "white".to_string(),
    };
    let cmd = Command::new(registry.resolve("BOARD").unwrap())
        .with("state", Value::from_serialize(&board).unwrap());

    let decoded = decode_command(&encode_command(&cmd).unwrap(), &registry).unwrap();
    let value = decoded.get("state").unwrap();
    assert_eq!(value.kind(), "blob");
    assert_eq!(value.deserialize_blob::<Board>().unwrap(), board);
}
