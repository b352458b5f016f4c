//! Game Client
//!
//! Initiating side of a session. The client runs four threads per session:
//! the outbound-queue writer, a reader that decodes commands into a bounded
//! channel, a processor that interprets them and calls the listeners, and
//! an invoker for the server's remote calls. The reader resolves
//! CL_REMOTE_RETURNS itself, so a listener or remote object may block on a
//! call to the server.
//!
//! ## States
//! ```text
//! READY ──connect──▶ CONNECTING ──SVR_CONNECTED──▶ CONNECTED
//!   ▲                    │                             │
//!   └──reset── DISCONNECTED ◀──────────────────────────┘
//!                  │
//!                  └──reconnect_async──▶ CONNECTING
//! ```

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::cipher::{BoxRead, BoxWrite};
use crate::config::ClientConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{names, read_command, write_magic, Command, CommandTypeRegistry, Value};

use super::dispatch::Dispatcher;
use super::queue::{OutboundQueue, QueueHooks};
use super::remote::{begin_call, execute_command, PendingCall, PendingCalls, RemoteInvocable, RemoteObjects, RemoteReply};
use super::{now_millis, wrap_streams, MAGIC};

/// Connection state of a [`GameClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Ready,
    Connecting,
    Connected,
    Disconnected,
}

/// Client-side events; every method has a no-op default
pub trait ClientListener: Send + Sync {
    fn on_connected(&self) {}

    /// `server_initiated` is true when the server sent SVR_DISCONNECT
    fn on_disconnected(&self, _reason: &str, _server_initiated: bool) {}

    /// A non-protocol command arrived
    fn on_command(&self, _command: &Command) {}

    fn on_message(&self, _message: &str) {}

    /// Round-trip time of the last keep-alive ping
    fn on_ping(&self, _round_trip_ms: i64) {}

    /// The server pushed PROPERTIES; receives the merged server properties
    fn on_properties_changed(&self, _properties: &HashMap<String, Value>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// Our own disconnect(); say goodbye
    Local,
    /// SVR_DISCONNECT received
    Server,
    /// Read failure, parse failure or blocked channel
    Transport,
}

struct ClientInner {
    state: ClientState,
    socket: Option<TcpStream>,
    address: Option<(String, u16)>,
    disconnect_reason: Option<String>,
}

struct ClientShared {
    config: ClientConfig,

    registry: Arc<CommandTypeRegistry>,

    inner: Mutex<ClientInner>,

    state_changed: Condvar,

    /// Bumped per connect attempt; threads of older sessions stand down
    session: AtomicU64,

    queue: OutboundQueue,

    listeners: RwLock<Vec<Arc<dyn ClientListener>>>,

    /// Local properties sent with CL_CONNECT and PROPERTIES
    properties: RwLock<IndexMap<String, Value>>,

    server_properties: RwLock<HashMap<String, Value>>,

    server_name: RwLock<Option<String>>,

    password: RwLock<Option<String>>,

    /// Last measured round-trip time, -1 when unknown
    last_ping_ms: AtomicI64,

    pending: Arc<PendingCalls>,

    remote_objects: RemoteObjects,

    self_ref: Weak<ClientShared>,
}

/// TCP game client
pub struct GameClient {
    shared: Arc<ClientShared>,
}

impl GameClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::clone(&config.registry);
        let queue = OutboundQueue::new(
            format!("client-{}", config.name),
            config.queue_capacity,
            Duration::from_millis(config.keep_alive_ms),
        );
        let password = config.password.clone();

        let shared = Arc::new_cyclic(|self_ref| ClientShared {
            config,
            registry,
            inner: Mutex::new(ClientInner {
                state: ClientState::Ready,
                socket: None,
                address: None,
                disconnect_reason: None,
            }),
            state_changed: Condvar::new(),
            session: AtomicU64::new(0),
            queue,
            listeners: RwLock::new(Vec::new()),
            properties: RwLock::new(IndexMap::new()),
            server_properties: RwLock::new(HashMap::new()),
            server_name: RwLock::new(None),
            password: RwLock::new(password),
            last_ping_ms: AtomicI64::new(-1),
            pending: Arc::new(PendingCalls::new()),
            remote_objects: RemoteObjects::new(),
            self_ref: self_ref.clone(),
        });

        Ok(Self { shared })
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Connect and block until the server accepts or rejects us
    pub fn connect_blocking(&self, host: &str, port: u16) -> Result<()> {
        self.shared.connect_blocking(host, port)
    }

    /// Disconnect from the server; no-op unless connecting or connected
    pub fn disconnect(&self, reason: &str) {
        let session = self.shared.session.load(Ordering::SeqCst);
        self.shared.close_session(session, reason, CloseKind::Local);
    }

    /// Reconnect to the last address in the background
    pub fn reconnect_async(&self) -> Result<JoinHandle<Result<()>>> {
        let (host, port) = {
            let inner = self.shared.inner.lock();
            if inner.state != ClientState::Disconnected {
                return Err(LinkError::InvalidState(format!(
                    "reconnect requires DISCONNECTED, client is {:?}",
                    inner.state
                )));
            }
            inner
                .address
                .clone()
                .ok_or_else(|| LinkError::InvalidState("no previous address".to_string()))?
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("client-{}-reconnect", self.shared.config.name))
            .spawn(move || {
                let result = shared.connect_blocking(&host, port);
                if let Err(e) = &result {
                    tracing::warn!("Reconnect to {}:{} failed: {}", host, port, e);
                }
                result
            })?;
        Ok(handle)
    }

    /// Return to READY; only valid while idle
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ClientState::Ready | ClientState::Disconnected => {
                inner.state = ClientState::Ready;
                inner.disconnect_reason = None;
                *self.shared.server_name.write() = None;
                self.shared.server_properties.write().clear();
                Ok(())
            }
            state => Err(LinkError::InvalidState(format!("cannot reset while {:?}", state))),
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    pub fn send_command(&self, command: Command) -> Result<()> {
        self.shared.send_command(command)
    }

    pub fn send_message(&self, message: &str) -> Result<()> {
        let command = Command::new(self.shared.registry.reserved().message.clone()).with("msg", message);
        self.send_command(command)
    }

    /// Report an error to the server log
    pub fn send_error(&self, message: &str) -> Result<()> {
        let command = Command::new(self.shared.registry.reserved().cl_error.clone()).with("msg", message);
        self.send_command(command)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Set one property; pushed immediately when connected
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        self.shared.properties.write().insert(key.clone(), value.clone());
        self.shared.push_properties(vec![(key, value)]);
    }

    /// Set several properties; pushed as one PROPERTIES command when connected
    pub fn set_properties<I, K, V>(&self, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let changed: Vec<(String, Value)> = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        {
            let mut local = self.shared.properties.write();
            for (key, value) in &changed {
                local.insert(key.clone(), value.clone());
            }
        }
        self.shared.push_properties(changed);
    }

    pub fn properties(&self) -> IndexMap<String, Value> {
        self.shared.properties.read().clone()
    }

    pub fn server_properties(&self) -> HashMap<String, Value> {
        self.shared.server_properties.read().clone()
    }

    /// Password used to answer the server's challenge
    pub fn set_password(&self, password: Option<String>) {
        *self.shared.password.write() = password;
    }

    // =========================================================================
    // Listeners and Remote Invocation
    // =========================================================================

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.shared.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Make `object` callable by the server under `id`
    pub fn register_remote_object(&self, id: impl Into<String>, object: Arc<dyn RemoteInvocable>) {
        self.shared.remote_objects.register(id, object);
    }

    pub fn unregister_remote_object(&self, id: &str) {
        self.shared.remote_objects.unregister(id);
    }

    /// Invoke `method` on the server's object `target`
    pub fn execute_method_on_remote(
        &self,
        target: &str,
        returns_result: bool,
        method: &str,
        params: &[Value],
    ) -> Result<Option<Value>> {
        if returns_result {
            Ok(self.call_remote(target, method, params)?.into_value())
        } else {
            self.execute_on_remote(target, method, params)?;
            Ok(None)
        }
    }

    pub fn execute_on_remote(&self, target: &str, method: &str, params: &[Value]) -> Result<()> {
        let command = execute_command(self.shared.registry.reserved(), target, method, params, None)?;
        self.send_command(command)
    }

    pub fn call_remote(&self, target: &str, method: &str, params: &[Value]) -> Result<RemoteReply> {
        Ok(self.begin_remote_call(target, method, params)?.wait())
    }

    pub fn begin_remote_call(&self, target: &str, method: &str, params: &[Value]) -> Result<PendingCall> {
        let shared = &self.shared;
        begin_call(&shared.pending, shared.registry.reserved(), target, method, params, |command| {
            shared.send_command(command)
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> ClientState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Reason of the last disconnect, if any
    pub fn disconnect_reason(&self) -> Option<String> {
        self.shared.inner.lock().disconnect_reason.clone()
    }

    pub fn server_name(&self) -> Option<String> {
        self.shared.server_name.read().clone()
    }

    pub fn last_ping_ms(&self) -> Option<i64> {
        match self.shared.last_ping_ms.load(Ordering::Relaxed) {
            ms if ms >= 0 => Some(ms),
            _ => None,
        }
    }

    /// Current keep-alive interval (the server's once connected)
    pub fn keep_alive(&self) -> Duration {
        self.shared.queue.idle_timeout()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.disconnect("client dropped");
    }
}

// =============================================================================
// Session Machinery
// =============================================================================

impl ClientShared {
    fn connect_blocking(&self, host: &str, port: u16) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ClientState::Ready | ClientState::Disconnected => {}
                state => {
                    return Err(LinkError::InvalidState(format!("cannot connect while {:?}", state)));
                }
            }
            inner.state = ClientState::Connecting;
            inner.address = Some((host.to_string(), port));
            inner.disconnect_reason = None;
        }
        tracing::info!("Connecting to {}:{} as {}", host, port, self.config.name);

        let session = match self.open_session(host, port) {
            Ok(session) => session,
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.state == ClientState::Connecting {
                    inner.state = ClientState::Disconnected;
                    inner.disconnect_reason = Some(e.to_string());
                    if let Some(socket) = inner.socket.take() {
                        let _ = socket.shutdown(Shutdown::Both);
                    }
                }
                drop(inner);
                self.queue.stop(false);
                return Err(e);
            }
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        let mut inner = self.inner.lock();
        while inner.state == ClientState::Connecting {
            if self.state_changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        match inner.state {
            ClientState::Connected => Ok(()),
            ClientState::Connecting => {
                drop(inner);
                self.close_session(session, "connect timed out", CloseKind::Local);
                Err(LinkError::Timeout(format!("no SVR_CONNECTED from {}:{}", host, port)))
            }
            _ => Err(LinkError::Rejected(
                inner
                    .disconnect_reason
                    .clone()
                    .unwrap_or_else(|| "disconnected".to_string()),
            )),
        }
    }

    /// Open the socket, send the preamble and CL_CONNECT, start the threads
    fn open_session(&self, host: &str, port: u16) -> Result<u64> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let timeout = match self.config.read_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        let mut raw_writer = stream.try_clone()?;
        write_magic(&mut raw_writer, MAGIC)?;

        let input: BoxRead = Box::new(stream.try_clone()?);
        let output: BoxWrite = Box::new(raw_writer);
        let (input, output) = wrap_streams(self.config.cipher.as_deref(), input, output);

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.lock().socket = Some(stream);
        self.pending.reopen();
        self.last_ping_ms.store(-1, Ordering::Relaxed);

        self.queue.set_idle_timeout(Duration::from_millis(self.config.keep_alive_ms));
        let hooks = Arc::new(ClientHooks {
            shared: self.self_ref.clone(),
            session,
        });
        self.queue.start_with_hooks(output, hooks)?;

        let mut connect = Command::new(self.registry.reserved().cl_connect.clone());
        for (key, value) in self.properties.read().iter() {
            connect.set(key.clone(), value.clone());
        }
        connect.set("name", self.config.name.as_str());
        connect.set("version", self.config.version.as_str());
        self.queue.add(connect)?;

        let shared = self
            .self_ref
            .upgrade()
            .ok_or_else(|| LinkError::InvalidState("client dropped".to_string()))?;
        let (sender, receiver) = channel::bounded(self.config.channel_capacity);
        let invoker = Dispatcher::spawn(
            format!("client-{}-invoke-{}", self.config.name, session),
            self.config.channel_capacity,
        )?;

        {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("client-{}-reader", self.config.name))
                .spawn(move || shared.read_loop(BufReader::new(input), sender, invoker, session))?;
        }
        thread::Builder::new()
            .name(format!("client-{}-processor", self.config.name))
            .spawn(move || shared.process_loop(receiver, session))?;

        Ok(session)
    }

    /// True while `session` is the live session
    fn is_live(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
            && matches!(
                self.inner.lock().state,
                ClientState::Connecting | ClientState::Connected
            )
    }

    fn read_loop(
        &self,
        mut reader: BufReader<BoxRead>,
        sender: Sender<Command>,
        invoker: Dispatcher,
        session: u64,
    ) {
        let block_timeout = Duration::from_millis(self.config.channel_block_timeout_ms);

        while self.is_live(session) {
            match read_command(&mut reader, &self.registry) {
                Ok(command) if command.type_name() == names::CL_REMOTE_RETURNS => {
                    self.pending.resolve_command(&command);
                }
                Ok(command) if command.type_name() == names::SVR_EXECUTE_REMOTE => {
                    let Some(shared) = self.self_ref.upgrade() else {
                        break;
                    };
                    let job = move || {
                        if shared.is_live(session) {
                            shared.invoke_remote(&command);
                        }
                    };
                    if let Err(e) = invoker.submit(job, block_timeout) {
                        tracing::warn!("Remote invocation dropped: {}", e);
                        self.close_session(session, "channel block", CloseKind::Transport);
                        break;
                    }
                }
                Ok(command) => {
                    tracing::trace!("{} <- {}", self.config.name, command);
                    let last = command.type_name() == names::SVR_DISCONNECT;
                    match sender.send_timeout(command, block_timeout) {
                        // Nothing follows a goodbye; leave the EOF to the processor
                        Ok(()) if last => break,
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            self.close_session(session, "channel block", CloseKind::Transport);
                            break;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => break,
                    }
                }
                Err(e) => {
                    if self.is_live(session) {
                        let reason = match &e {
                            LinkError::Protocol(_) => format!("exception parsing: {}", e),
                            e if e.is_timeout() => "read timeout".to_string(),
                            e if e.is_disconnect() => "connection lost".to_string(),
                            e => e.to_string(),
                        };
                        self.close_session(session, &reason, CloseKind::Transport);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Reader of {} exited", self.config.name);
    }

    fn process_loop(&self, receiver: Receiver<Command>, session: u64) {
        for command in receiver.iter() {
            if !self.is_live(session) {
                break;
            }
            self.process_command(command, session);
        }
        tracing::debug!("Processor of {} exited", self.config.name);
    }

    fn process_command(&self, command: Command, session: u64) {
        match command.type_name() {
            names::SVR_CONNECTED => {
                let server_name = command.get_str("name").unwrap_or("").to_string();
                if let Some(ms) = command.get_i64("keepAlive").filter(|ms| *ms > 0) {
                    self.queue.set_idle_timeout(Duration::from_millis(ms as u64));
                }
                *self.server_name.write() = Some(server_name.clone());

                {
                    let mut inner = self.inner.lock();
                    if self.session.load(Ordering::SeqCst) != session
                        || inner.state != ClientState::Connecting
                    {
                        return;
                    }
                    inner.state = ClientState::Connected;
                    self.state_changed.notify_all();
                }

                tracing::info!("Connected to server '{}'", server_name);
                for listener in self.listeners() {
                    listener.on_connected();
                }
            }
            names::PING => {
                // Bare pings are the server's keep-alive
                let Some(sent) = command.get_i64("time") else {
                    return;
                };
                let round_trip = (now_millis() - sent).max(0);
                self.last_ping_ms.store(round_trip, Ordering::Relaxed);
                for listener in self.listeners() {
                    listener.on_ping(round_trip);
                }
                let speed = Command::new(self.registry.reserved().cl_connection_speed.clone())
                    .with("speed", round_trip.min(i32::MAX as i64) as i32);
                if let Err(e) = self.queue.add(speed) {
                    tracing::debug!("Failed to report speed: {}", e);
                }
            }
            names::MESSAGE => {
                let message = command.get_str("msg").unwrap_or("");
                for listener in self.listeners() {
                    listener.on_message(message);
                }
            }
            names::PROPERTIES => {
                let merged = {
                    let mut props = self.server_properties.write();
                    for (key, value) in command.arguments() {
                        props.insert(key.clone(), value.clone());
                    }
                    props.clone()
                };
                for listener in self.listeners() {
                    listener.on_properties_changed(&merged);
                }
            }
            names::PASSWORD => {
                let password = self.password.read().clone().unwrap_or_default();
                let answer = Command::new(self.registry.reserved().password.clone())
                    .with("password", password);
                if let Err(e) = self.queue.add(answer) {
                    tracing::debug!("Failed to answer password challenge: {}", e);
                }
            }
            names::SVR_DISCONNECT => {
                let reason = command.get_str("reason").unwrap_or("disconnected by server");
                self.close_session(session, reason, CloseKind::Server);
            }
            _ => {
                for listener in self.listeners() {
                    listener.on_command(&command);
                }
            }
        }
    }

    /// Runs on the invoker thread
    fn invoke_remote(&self, command: &Command) {
        if let Some(reply) = self.remote_objects.execute(command, self.registry.reserved()) {
            if let Err(e) = self.queue.add(reply) {
                tracing::debug!("Failed to return remote result: {}", e);
            }
        }
    }

    /// Tear down `session` if it is still live
    fn close_session(&self, session: u64, reason: &str, kind: CloseKind) {
        let socket = {
            let mut inner = self.inner.lock();
            if self.session.load(Ordering::SeqCst) != session
                || !matches!(inner.state, ClientState::Connecting | ClientState::Connected)
            {
                return;
            }
            inner.state = ClientState::Disconnected;
            inner.disconnect_reason = Some(reason.to_string());
            self.state_changed.notify_all();
            inner.socket.take()
        };
        tracing::info!("Disconnected from server: {}", reason);

        if kind == CloseKind::Local {
            let goodbye = Command::new(self.registry.reserved().cl_disconnect.clone())
                .with("reason", reason);
            if let Err(e) = self.queue.add(goodbye) {
                tracing::debug!("Could not send disconnect: {}", e);
            }
        }
        self.queue.stop(kind == CloseKind::Local);

        let cancelled = self.pending.close();
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending calls", cancelled);
        }

        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
        }

        let server_initiated = kind == CloseKind::Server;
        for listener in self.listeners() {
            listener.on_disconnected(reason, server_initiated);
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        if self.inner.lock().state != ClientState::Connected {
            return Err(LinkError::NotConnected);
        }
        self.queue.add(command)
    }

    fn push_properties(&self, changed: Vec<(String, Value)>) {
        if changed.is_empty() || self.inner.lock().state != ClientState::Connected {
            return;
        }
        let mut command = Command::new(self.registry.reserved().properties.clone());
        for (key, value) in changed {
            command.set(key, value);
        }
        if let Err(e) = self.send_command(command) {
            tracing::debug!("Failed to push properties: {}", e);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ClientListener>> {
        self.listeners.read().clone()
    }
}

/// Outbound queue callbacks for the client
struct ClientHooks {
    shared: Weak<ClientShared>,
    session: u64,
}

impl QueueHooks for ClientHooks {
    fn on_timeout(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.session.load(Ordering::SeqCst) != self.session {
            return;
        }
        let ping = Command::new(shared.registry.reserved().ping.clone()).with("time", now_millis());
        if let Err(e) = shared.send_command(ping) {
            tracing::trace!("Ping skipped: {}", e);
        }
    }

    fn on_failed(&self, error: &LinkError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close_session(self.session, &format!("write failed: {}", error), CloseKind::Transport);
        }
    }
}
