//! Remote Method Calls
//!
//! Either peer can register objects under a string id and let the other
//! side invoke methods on them by name.
//!
//! ## Request / Response
//! ```text
//! SVR_EXECUTE_REMOTE { method, target, numParams, param0..paramN, responseId? }
//! CL_REMOTE_RETURNS  { responseId, returns }  |  { responseId, cancelled=true }
//! ```
//!
//! Parameters and return values travel as blobs holding a bincode-encoded
//! [`Value`]. A call without `responseId` is fire-and-forget. Result-bearing
//! calls are matched to their reply through [`PendingCalls`] by correlation
//! id `"{method}_{target}_{32 random alphanumerics}"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

use crate::error::Result;
use crate::protocol::{Command, ReservedTypes, Value};

/// Length of the random part of a correlation id
pub const CORRELATION_SUFFIX_LEN: usize = 32;

// =============================================================================
// Callee Side
// =============================================================================

/// Why a local invocation produced no value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("no method {0}")]
    NoSuchMethod(String),

    #[error("bad parameters: {0}")]
    BadParams(String),

    /// The invocation was abandoned before it completed
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// An object whose methods the peer may call
pub trait RemoteInvocable: Send + Sync {
    fn invoke(&self, method: &str, params: Vec<Value>) -> std::result::Result<Value, RemoteError>;
}

type Method<T> =
    Box<dyn Fn(&T, &[Value]) -> std::result::Result<Value, RemoteError> + Send + Sync>;

/// Name + arity dispatch table over a plain object
///
/// For objects that do not implement [`RemoteInvocable`] themselves.
pub struct MethodTable<T> {
    target: T,
    methods: HashMap<(String, usize), Method<T>>,
}

impl<T: Send + Sync> MethodTable<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            methods: HashMap::new(),
        }
    }

    /// Register `name` taking exactly `arity` parameters
    pub fn method<F>(mut self, name: &str, arity: usize, f: F) -> Self
    where
        F: Fn(&T, &[Value]) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.methods.insert((name.to_string(), arity), Box::new(f));
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }
}

impl<T: Send + Sync> RemoteInvocable for MethodTable<T> {
    fn invoke(&self, method: &str, params: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        let key = (method.to_string(), params.len());
        match self.methods.get(&key) {
            Some(f) => f(&self.target, &params),
            None => Err(RemoteError::NoSuchMethod(format!("{}/{}", method, params.len()))),
        }
    }
}

/// Objects registered for invocation by the peer, keyed by id
#[derive(Default)]
pub struct RemoteObjects {
    objects: RwLock<HashMap<String, Arc<dyn RemoteInvocable>>>,
}

impl RemoteObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` under `id`, replacing any previous holder
    pub fn register(&self, id: impl Into<String>, object: Arc<dyn RemoteInvocable>) {
        self.objects.write().insert(id.into(), object);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn RemoteInvocable>> {
        self.objects.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Run an incoming SVR_EXECUTE_REMOTE; returns the reply to send, if any
    pub fn execute(&self, command: &Command, reserved: &ReservedTypes) -> Option<Command> {
        let response_id = command.get_str("responseId").map(str::to_string);
        let outcome = self.invoke_command(command);

        let response_id = response_id?;
        let mut reply = Command::new(reserved.cl_remote_returns.clone()).with("responseId", response_id);
        match outcome {
            Ok(value) => match Value::from_serialize(&value) {
                Ok(blob) => reply.set("returns", blob),
                Err(e) => {
                    tracing::error!("Failed to serialize return value: {}", e);
                    reply.set("returns", Value::Null);
                }
            },
            Err(RemoteError::Cancelled) => reply.set("cancelled", true),
            Err(e) => {
                tracing::warn!("Remote call failed: {}", e);
                reply.set("returns", Value::Null);
            }
        }
        Some(reply)
    }

    fn invoke_command(&self, command: &Command) -> std::result::Result<Value, RemoteError> {
        let method = command
            .get_str("method")
            .ok_or_else(|| RemoteError::BadParams("missing method".to_string()))?;
        let target = command
            .get_str("target")
            .ok_or_else(|| RemoteError::BadParams("missing target".to_string()))?;
        let count = command.get_i32("numParams").unwrap_or(0).max(0) as usize;

        let mut params = Vec::with_capacity(count);
        for i in 0..count {
            let key = format!("param{}", i);
            let param = command
                .get(&key)
                .ok_or_else(|| RemoteError::BadParams(format!("missing {}", key)))?
                .deserialize_blob::<Value>()
                .map_err(|e| RemoteError::BadParams(format!("{}: {}", key, e)))?;
            params.push(param);
        }

        let object = self
            .objects
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RemoteError::Failed(format!("no object registered as '{}'", target)))?;

        tracing::debug!("Invoking {}.{} with {} params", target, method, params.len());
        object.invoke(method, params)
    }
}

// =============================================================================
// Caller Side
// =============================================================================

/// How a result-bearing call ended
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply {
    /// The peer answered with a value (possibly null)
    Returned(Value),

    /// The peer or the caller cancelled the invocation
    Cancelled,

    /// The connection closed before an answer arrived
    Disconnected,
}

impl RemoteReply {
    /// The returned value; cancelled and disconnected both map to None
    pub fn into_value(self) -> Option<Value> {
        match self {
            RemoteReply::Returned(Value::Null) => None,
            RemoteReply::Returned(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemoteReply::Cancelled | RemoteReply::Disconnected)
    }
}

/// Outstanding result-bearing calls of one connection
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, Sender<RemoteReply>>>,
    closed: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: &str) -> Receiver<RemoteReply> {
        let (sender, receiver) = channel::bounded(1);
        let mut calls = self.calls.lock();
        if self.closed.load(Ordering::SeqCst) {
            let _ = sender.send(RemoteReply::Disconnected);
        } else {
            calls.insert(id.to_string(), sender);
        }
        receiver
    }

    /// Deliver a reply; false if nobody waits for `id`
    pub fn resolve(&self, id: &str, reply: RemoteReply) -> bool {
        match self.calls.lock().remove(id) {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Handle an incoming CL_REMOTE_RETURNS
    pub fn resolve_command(&self, command: &Command) {
        let Some(id) = command.get_str("responseId") else {
            tracing::warn!("Remote return without responseId");
            return;
        };

        let reply = if command.get_bool("cancelled").unwrap_or(false) {
            RemoteReply::Cancelled
        } else {
            match command.get("returns") {
                Some(blob @ Value::Blob(_)) => match blob.deserialize_blob::<Value>() {
                    Ok(value) => RemoteReply::Returned(value),
                    Err(e) => {
                        tracing::error!("Failed to decode return of {}: {}", id, e);
                        RemoteReply::Returned(Value::Null)
                    }
                },
                _ => RemoteReply::Returned(Value::Null),
            }
        };

        if !self.resolve(id, reply) {
            tracing::debug!("No pending call for {}", id);
        }
    }

    fn remove(&self, id: &str) {
        self.calls.lock().remove(id);
    }

    /// Resolve every waiter as disconnected and refuse new ones
    pub fn close(&self) -> usize {
        let mut calls = self.calls.lock();
        self.closed.store(true, Ordering::SeqCst);
        let count = calls.len();
        for (_, sender) in calls.drain() {
            let _ = sender.send(RemoteReply::Disconnected);
        }
        count
    }

    /// Accept calls again after a reconnect
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// Handle to one outstanding result-bearing call
///
/// Dropping the handle deregisters the correlation id.
pub struct PendingCall {
    id: String,
    receiver: Receiver<RemoteReply>,
    calls: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the reply arrives or the connection closes
    pub fn wait(self) -> RemoteReply {
        self.receiver.recv().unwrap_or(RemoteReply::Cancelled)
    }

    /// Wait at most `timeout`; None leaves the call pending
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RemoteReply> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(RemoteReply::Cancelled),
        }
    }

    /// Give up on the call; a late reply is discarded
    pub fn cancel(self) -> RemoteReply {
        self.calls.remove(&self.id);
        RemoteReply::Cancelled
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
    }
}

/// Generate `"{method}_{target}_{random}"`
pub fn correlation_id(method: &str, target: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}_{}_{}", method, target, suffix)
}

/// Build an SVR_EXECUTE_REMOTE command
pub fn execute_command(
    reserved: &ReservedTypes,
    target: &str,
    method: &str,
    params: &[Value],
    response_id: Option<&str>,
) -> Result<Command> {
    let mut command = Command::new(reserved.svr_execute_remote.clone())
        .with("method", method)
        .with("target", target)
        .with("numParams", params.len() as i32);

    for (i, param) in params.iter().enumerate() {
        command.set(format!("param{}", i), Value::from_serialize(param)?);
    }
    if let Some(id) = response_id {
        command.set("responseId", id);
    }

    Ok(command)
}

/// Register a correlation id, send the request through `send`, and return
/// the handle to wait on
pub(crate) fn begin_call<F>(
    calls: &Arc<PendingCalls>,
    reserved: &ReservedTypes,
    target: &str,
    method: &str,
    params: &[Value],
    send: F,
) -> Result<PendingCall>
where
    F: FnOnce(Command) -> Result<()>,
{
    let id = correlation_id(method, target);
    let command = execute_command(reserved, target, method, params, Some(&id))?;

    let receiver = calls.register(&id);
    let call = PendingCall {
        id,
        receiver,
        calls: Arc::clone(calls),
    };

    // On failure the handle is dropped, which deregisters the id
    send(command)?;
    Ok(call)
}
