//! Remote Call Tests
//!
//! Tests for method dispatch, reply construction and correlation ids,
//! without sockets.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use turnlink::network::{
    correlation_id, execute_command, MethodTable, PendingCalls, RemoteError, RemoteInvocable,
    RemoteObjects, RemoteReply, CORRELATION_SUFFIX_LEN,
};
use turnlink::protocol::{names, Command, CommandTypeRegistry, Value};

struct Calculator;

impl RemoteInvocable for Calculator {
    fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value, RemoteError> {
        match (method, params.as_slice()) {
            ("add", [a, b]) => {
                let a = a.as_i32().ok_or_else(|| RemoteError::BadParams("a".into()))?;
                let b = b.as_i32().ok_or_else(|| RemoteError::BadParams("b".into()))?;
                Ok(Value::Int32(a + b))
            }
            ("abort", []) => Err(RemoteError::Cancelled),
            ("nothing", []) => Ok(Value::Null),
            _ => Err(RemoteError::NoSuchMethod(method.to_string())),
        }
    }
}

fn objects_with_calculator() -> RemoteObjects {
    let objects = RemoteObjects::new();
    objects.register("calc", Arc::new(Calculator));
    objects
}

fn returned(reply: &Command) -> Value {
    reply.get("returns").unwrap().deserialize_blob::<Value>().unwrap()
}

// =============================================================================
// Correlation Id Tests
// =============================================================================

#[test]
fn test_correlation_id_format() {
    let id = correlation_id("add", "calc");
    let (prefix, suffix) = id.split_at(id.len() - CORRELATION_SUFFIX_LEN);

    assert_eq!(prefix, "add_calc_");
    assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(correlation_id("add", "calc"), id);
}

// =============================================================================
// Request Construction Tests
// =============================================================================

#[test]
fn test_execute_command_layout() {
    let registry = CommandTypeRegistry::new();
    let cmd = execute_command(
        registry.reserved(),
        "calc",
        "add",
        &[Value::Int32(2), Value::Int32(3)],
        Some("add_calc_x"),
    )
    .unwrap();

    assert_eq!(cmd.type_name(), names::SVR_EXECUTE_REMOTE);
    let keys: Vec<&str> = cmd.arguments().keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["method", "target", "numParams", "param0", "param1", "responseId"]);
    assert_eq!(cmd.get_i32("numParams"), Some(2));
    assert_eq!(cmd.get("param1").unwrap().deserialize_blob::<Value>().unwrap(), Value::Int32(3));
}

#[test]
fn test_fire_and_forget_has_no_response_id() {
    let registry = CommandTypeRegistry::new();
    let cmd = execute_command(registry.reserved(), "calc", "add", &[], None).unwrap();
    assert!(!cmd.contains("responseId"));
}

// =============================================================================
// Callee Tests
// =============================================================================

#[test]
fn test_execute_returns_value() {
    let registry = CommandTypeRegistry::new();
    let objects = objects_with_calculator();
    let request = execute_command(
        registry.reserved(),
        "calc",
        "add",
        &[Value::Int32(2), Value::Int32(3)],
        Some("id-1"),
    )
    .unwrap();

    let reply = objects.execute(&request, registry.reserved()).unwrap();
    assert_eq!(reply.type_name(), names::CL_REMOTE_RETURNS);
    assert_eq!(reply.get_str("responseId"), Some("id-1"));
    assert_eq!(returned(&reply), Value::Int32(5));
}

#[test]
fn test_execute_without_response_id_still_runs() {
    let registry = CommandTypeRegistry::new();
    let counter = Arc::new(AtomicI32::new(0));
    let objects = RemoteObjects::new();
    objects.register(
        "counter",
        Arc::new(MethodTable::new(Arc::clone(&counter)).method("bump", 0, |c, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })),
    );

    let request = execute_command(registry.reserved(), "counter", "bump", &[], None).unwrap();
    assert!(objects.execute(&request, registry.reserved()).is_none());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_execute_failure_returns_null() {
    let registry = CommandTypeRegistry::new();
    let objects = objects_with_calculator();

    for (target, method) in [("calc", "missing"), ("nobody", "add")] {
        let request =
            execute_command(registry.reserved(), target, method, &[], Some("id")).unwrap();
        let reply = objects.execute(&request, registry.reserved()).unwrap();
        assert_eq!(reply.get("returns"), Some(&Value::Null));
        assert!(!reply.contains("cancelled"));
    }
}

#[test]
fn test_execute_cancelled_sets_flag() {
    let registry = CommandTypeRegistry::new();
    let objects = objects_with_calculator();
    let request = execute_command(registry.reserved(), "calc", "abort", &[], Some("id")).unwrap();

    let reply = objects.execute(&request, registry.reserved()).unwrap();
    assert_eq!(reply.get_bool("cancelled"), Some(true));
    assert!(!reply.contains("returns"));
}

#[test]
fn test_null_return_is_serialized() {
    let registry = CommandTypeRegistry::new();
    let objects = objects_with_calculator();
    let request = execute_command(registry.reserved(), "calc", "nothing", &[], Some("id")).unwrap();

    let reply = objects.execute(&request, registry.reserved()).unwrap();
    assert_eq!(returned(&reply), Value::Null);
}

#[test]
fn test_method_table_dispatches_on_arity() {
    let table = MethodTable::new(())
        .method("greet", 0, |_, _| Ok(Value::from("hello")))
        .method("greet", 1, |_, p| {
            Ok(Value::from(format!("hello {}", p[0].as_str().unwrap_or("?"))))
        });

    assert_eq!(table.invoke("greet", vec![]).unwrap(), Value::from("hello"));
    assert_eq!(
        table.invoke("greet", vec![Value::from("ann")]).unwrap(),
        Value::from("hello ann")
    );
    assert!(matches!(
        table.invoke("greet", vec![Value::Null, Value::Null]),
        Err(RemoteError::NoSuchMethod(_))
    ));
}

#[test]
fn test_register_replaces_and_unregister_removes() {
    let objects = objects_with_calculator();
    assert!(objects.contains("calc"));
    objects.register("calc", Arc::new(Calculator));
    assert_eq!(objects.len(), 1);

    assert!(objects.unregister("calc").is_some());
    assert!(objects.is_empty());
    assert!(objects.unregister("calc").is_none());
}

// =============================================================================
// Caller Bookkeeping Tests
// =============================================================================

#[test]
fn test_unknown_reply_is_ignored() {
    let registry = CommandTypeRegistry::new();
    let calls = PendingCalls::new();
    let reply = Command::new(registry.reserved().cl_remote_returns.clone())
        .with("responseId", "nobody_waits")
        .with("returns", Value::from_serialize(&Value::Int32(1)).unwrap());

    calls.resolve_command(&reply);
    assert!(!calls.resolve("nobody_waits", RemoteReply::Cancelled));
    assert!(calls.is_empty());
}

#[test]
fn test_close_with_no_waiters() {
    let calls = PendingCalls::new();
    assert_eq!(calls.close(), 0);
    calls.reopen();
    assert_eq!(calls.len(), 0);
}

#[test]
fn test_reply_helpers() {
    assert_eq!(RemoteReply::Returned(Value::Int32(5)).into_value(), Some(Value::Int32(5)));
    assert_eq!(RemoteReply::Returned(Value::Null).into_value(), None);
    assert_eq!(RemoteReply::Cancelled.into_value(), None);
    assert!(RemoteReply::Disconnected.is_cancelled());
    assert!(!RemoteReply::Returned(Value::Null).is_cancelled());
}
