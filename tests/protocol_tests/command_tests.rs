//! Command Tests
//!
//! Tests for the command type registry and argument maps.

use std::sync::Arc;
use std::thread;

use turnlink::protocol::{names, Command, CommandTypeRegistry, Value};
use turnlink::LinkError;

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_reserved_types_preregistered() {
    let registry = CommandTypeRegistry::new();
    assert_eq!(registry.len(), names::RESERVED.len());

    for (ordinal, name) in names::RESERVED.iter().enumerate() {
        let ty = registry.resolve(name).unwrap();
        assert_eq!(ty.ordinal(), ordinal);
        assert!(ty.is_reserved());
    }
    assert_eq!(registry.reserved().message.name(), "MESSAGE");
}

#[test]
fn test_register_custom_type() {
    let registry = CommandTypeRegistry::new();
    let ty = registry.register("MOVE").unwrap();

    assert_eq!(ty.name(), "MOVE");
    assert_eq!(ty.ordinal(), names::RESERVED.len());
    assert!(!ty.is_reserved());
    assert_eq!(registry.get("MOVE"), Some(ty));
}

#[test]
fn test_duplicate_name_conflicts() {
    let registry = CommandTypeRegistry::new();
    registry.register("MOVE").unwrap();

    assert!(matches!(registry.register("MOVE"), Err(LinkError::TypeConflict(ref n)) if n == "MOVE"));
    assert!(matches!(registry.register(names::PING), Err(LinkError::TypeConflict(_))));
    assert!(matches!(registry.register(""), Err(LinkError::Config(_))));
}

#[test]
fn test_get_or_register_is_idempotent() {
    let registry = CommandTypeRegistry::new();
    let first = registry.get_or_register("ATTACK").unwrap();
    let second = registry.get_or_register("ATTACK").unwrap();

    assert_eq!(first, second);
    assert_eq!(first.ordinal(), second.ordinal());
    assert_eq!(registry.len(), names::RESERVED.len() + 1);
}

#[test]
fn test_concurrent_get_or_register_yields_one_type() {
    let registry = Arc::new(CommandTypeRegistry::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get_or_register("RACE").unwrap().ordinal())
        })
        .collect();

    let ordinals: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ordinals.iter().all(|o| *o == ordinals[0]));
    assert_eq!(registry.len(), names::RESERVED.len() + 1);
}

#[test]
fn test_types_listed_in_registration_order() {
    let registry = CommandTypeRegistry::new();
    registry.register("B_SECOND").unwrap();
    registry.register("A_THIRD").unwrap();

    let all = registry.types();
    let tail: Vec<&str> = all[all.len() - 2..].iter().map(|t| t.name()).collect();
    assert_eq!(tail, vec!["B_SECOND", "A_THIRD"]);
    assert!(all.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_unknown_type_resolution_fails() {
    let registry = CommandTypeRegistry::new();
    assert!(registry.get("NOPE").is_none());
    assert!(registry.resolve("NOPE").is_err());
}

// =============================================================================
// Argument Map Tests
// =============================================================================

#[test]
fn test_put_rejects_duplicate_key() {
    let registry = CommandTypeRegistry::new();
    let mut cmd = Command::new(registry.reserved().message.clone());

    cmd.put("msg", "first").unwrap();
    let err = cmd.put("msg", "second").unwrap_err();

    assert!(matches!(err, LinkError::DuplicateArgument(ref k) if k == "msg"));
    assert_eq!(cmd.get_str("msg"), Some("first"));
}

#[test]
fn test_set_overwrites_in_place() {
    let registry = CommandTypeRegistry::new();
    let mut cmd = Command::new(registry.reserved().properties.clone())
        .with("a", 1i32)
        .with("b", 2i32);
    cmd.set("a", 10i32);

    let keys: Vec<&String> = cmd.arguments().keys().collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert_eq!(cmd.get_i32("a"), Some(10));
}

#[test]
fn test_remove_keeps_remaining_order() {
    let registry = CommandTypeRegistry::new();
    let mut cmd = Command::new(registry.reserved().properties.clone())
        .with("a", 1i32)
        .with("b", 2i32)
        .with("c", 3i32);

    assert_eq!(cmd.remove("b"), Some(Value::Int32(2)));
    let keys: Vec<&String> = cmd.arguments().keys().collect();
    assert_eq!(keys, vec!["a", "c"]);
    assert_eq!(cmd.len(), 2);
    assert!(!cmd.contains("b"));
}

#[test]
fn test_typed_getters_widen_but_do_not_coerce() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().ping.clone())
        .with("small", 5i32)
        .with("text", "5");

    assert_eq!(cmd.get_i64("small"), Some(5));
    assert_eq!(cmd.get_i32("text"), None);
    assert_eq!(cmd.get_str("small"), None);
    assert_eq!(cmd.get_str("missing"), None);
}

#[test]
fn test_display_format() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().message.clone())
        .with("msg", "hi")
        .with("turn", 3i32);

    assert_eq!(cmd.to_string(), "MESSAGE {msg=\"hi\", turn=3}");
    assert_eq!(Command::new(registry.reserved().ping.clone()).to_string(), "PING");
}

#[test]
fn test_option_values_become_null() {
    let registry = CommandTypeRegistry::new();
    let cmd = Command::new(registry.reserved().properties.clone())
        .with("team", None::<String>)
        .with("seat", Some(2i32));

    assert!(cmd.get("team").unwrap().is_null());
    assert_eq!(cmd.get_i32("seat"), Some(2));
}
