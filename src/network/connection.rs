//! Client Connection
//!
//! Server-side view of one connected client. A connection is keyed by the
//! name the client chose at connect time and survives transport failures so
//! the same client can reconnect into it.
//!
//! The reader answers pings and resolves remote-call replies itself. Client
//! commands, property updates and remote-object invocations run on dispatch
//! threads so a listener may block on a call to the same client.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cipher::{BoxRead, BoxWrite};
use crate::error::{LinkError, ProtocolError, Result};
use crate::protocol::{names, read_command, Command, CommandTypeRegistry, Value};

use super::dispatch::Dispatcher;
use super::queue::{OutboundQueue, QueueHooks};
use super::remote::{begin_call, execute_command, PendingCall, PendingCalls, RemoteReply};
use super::server::ServerShared;
use super::ConnectionStatus;

/// Events of one connection
pub trait ConnectionListener: Send + Sync {
    /// A non-protocol command arrived and no handler consumed it
    fn on_command(&self, _conn: &Arc<ClientConnection>, _command: &Command) {}

    fn on_disconnected(&self, _conn: &Arc<ClientConnection>, _reason: &str) {}

    fn on_properties_changed(&self, _conn: &Arc<ClientConnection>) {}
}

/// First look at application commands; return true to consume the command
pub trait CommandHandler: Send + Sync {
    fn handle(&self, conn: &Arc<ClientConnection>, command: &Command) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Claimed by a handshake that has not finished yet
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Why a connection is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// The server side asked for it; tell the client
    Local,
    /// The client sent CL_DISCONNECT
    Peer,
    /// Read or write failure; keep the entry for reconnection
    Transport,
}

struct Link {
    state: LinkState,
    socket: Option<TcpStream>,
    peer_addr: String,
}

/// Server-side connection to one client
pub struct ClientConnection {
    /// Unique name the client connected with
    name: String,

    server: Weak<ServerShared>,

    registry: Arc<CommandTypeRegistry>,

    queue: OutboundQueue,

    link: Mutex<Link>,

    /// Bumped on every attach; stale loops compare against it
    session: AtomicU64,

    reader_active: AtomicBool,

    attributes: RwLock<HashMap<String, Value>>,

    status: Mutex<ConnectionStatus>,

    /// Last reported round-trip time, -1 when unknown
    speed_ms: AtomicI64,

    kicked: AtomicBool,

    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,

    handler: RwLock<Option<Arc<dyn CommandHandler>>>,

    pending: Arc<PendingCalls>,

    channel_capacity: usize,

    channel_block_timeout: Duration,

    self_ref: Weak<ClientConnection>,
}

/// Dispatch threads of one session, owned by its reader
struct Workers {
    /// Client commands, properties and CL_DISCONNECT, in arrival order
    events: Dispatcher,
    /// SVR_EXECUTE_REMOTE invocations
    invoker: Dispatcher,
}

impl ClientConnection {
    /// Create a connection in the claimed-by-handshake state
    pub(crate) fn new(name: &str, server: &Arc<ServerShared>) -> Arc<Self> {
        let config = server.config();
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            server: Arc::downgrade(server),
            registry: Arc::clone(&config.registry),
            queue: OutboundQueue::new(format!("conn-{}", name), config.queue_capacity, config.keep_alive()),
            link: Mutex::new(Link {
                state: LinkState::Connecting,
                socket: None,
                peer_addr: "unknown".to_string(),
            }),
            session: AtomicU64::new(0),
            reader_active: AtomicBool::new(false),
            attributes: RwLock::new(HashMap::new()),
            status: Mutex::new(ConnectionStatus::Unknown),
            speed_ms: AtomicI64::new(-1),
            kicked: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            pending: Arc::new(PendingCalls::new()),
            channel_capacity: config.channel_capacity,
            channel_block_timeout: Duration::from_millis(config.channel_block_timeout_ms),
            self_ref: self_ref.clone(),
        })
    }

    // =========================================================================
    // Lifecycle (driven by the server handshake)
    // =========================================================================

    /// Claim a disconnected connection for a reconnect handshake
    pub(crate) fn try_claim(&self) -> bool {
        let mut link = self.link.lock();
        if link.state == LinkState::Disconnected {
            link.state = LinkState::Connecting;
            true
        } else {
            false
        }
    }

    /// Undo a claim after the handshake failed late
    pub(crate) fn release_claim(&self) {
        let mut link = self.link.lock();
        if link.state == LinkState::Connecting {
            link.state = LinkState::Disconnected;
        }
    }

    /// Start the loops on a freshly handshaken socket
    ///
    /// `welcome` is queued before the read loop starts so it is the first
    /// command the client sees. A connection kicked while its handshake was
    /// still running is refused here.
    pub(crate) fn attach(
        &self,
        socket: TcpStream,
        reader: BufReader<BoxRead>,
        writer: BoxWrite,
        connect: &Command,
        welcome: Command,
    ) -> Result<()> {
        let peer_addr = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        {
            let mut attributes = self.attributes.write();
            for (key, value) in connect.arguments() {
                attributes.insert(key.clone(), value.clone());
            }
        }

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.reopen();
        *self.status.lock() = ConnectionStatus::Unknown;
        self.speed_ms.store(-1, Ordering::Relaxed);

        let hooks = Arc::new(ConnectionHooks {
            conn: self.self_ref.clone(),
            session,
        });
        self.queue.start_with_hooks(writer, hooks)?;

        {
            // kick() sets the flag before taking this lock
            let mut link = self.link.lock();
            if self.is_kicked() {
                drop(link);
                let goodbye = Command::new(self.registry.reserved().svr_disconnect.clone())
                    .with("reason", "kicked");
                if let Err(e) = self.queue.add(goodbye) {
                    tracing::debug!("Could not refuse {}: {}", self.name, e);
                }
                self.queue.stop(true);
                let _ = socket.shutdown(Shutdown::Both);
                return Err(ProtocolError::Banned(self.name.clone()).into());
            }
            link.state = LinkState::Connected;
            link.socket = Some(socket);
            link.peer_addr = peer_addr.clone();
        }

        if let Err(e) = self.queue.add(welcome) {
            self.close("failed to queue welcome", CloseKind::Transport);
            return Err(e);
        }

        let workers = match self.spawn_workers(session) {
            Ok(workers) => workers,
            Err(e) => {
                self.close("failed to start dispatchers", CloseKind::Transport);
                return Err(e);
            }
        };

        let conn = self
            .self_ref
            .upgrade()
            .ok_or_else(|| LinkError::InvalidState("connection dropped".to_string()))?;
        self.reader_active.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("conn-{}-reader", self.name))
            .spawn(move || conn.read_loop(reader, workers, session));
        if let Err(e) = spawned {
            self.reader_active.store(false, Ordering::SeqCst);
            self.close("failed to start reader", CloseKind::Transport);
            return Err(e.into());
        }

        tracing::info!("Client {} connected from {}", self.name, peer_addr);
        Ok(())
    }

    fn spawn_workers(&self, session: u64) -> Result<Workers> {
        Ok(Workers {
            events: Dispatcher::spawn(format!("conn-{}-events-{}", self.name, session), self.channel_capacity)?,
            invoker: Dispatcher::spawn(format!("conn-{}-invoke-{}", self.name, session), self.channel_capacity)?,
        })
    }

    fn read_loop(self: Arc<Self>, mut reader: BufReader<BoxRead>, workers: Workers, session: u64) {
        tracing::debug!("Read loop for {} started", self.name);

        loop {
            if self.session.load(Ordering::SeqCst) != session || !self.is_connected() {
                break;
            }

            match read_command(&mut reader, &self.registry) {
                Ok(command) => {
                    tracing::trace!("{} <- {}", self.name, command);
                    if !self.route(command, &workers, session) {
                        break;
                    }
                }
                Err(e) => {
                    if self.session.load(Ordering::SeqCst) == session && self.is_connected() {
                        let reason = if e.is_timeout() {
                            "read timeout".to_string()
                        } else if e.is_disconnect() {
                            "connection lost".to_string()
                        } else {
                            e.to_string()
                        };
                        tracing::debug!("Read from {} failed: {}", self.name, e);
                        self.close(&reason, CloseKind::Transport);
                    }
                    break;
                }
            }
        }

        if self.session.load(Ordering::SeqCst) == session {
            self.reader_active.store(false, Ordering::SeqCst);
        }
        tracing::debug!("Read loop for {} exited", self.name);
    }

    /// Handle a command on the reader or hand it to a worker
    ///
    /// Returns false when the reader should stop.
    fn route(self: &Arc<Self>, command: Command, workers: &Workers, session: u64) -> bool {
        match command.type_name() {
            names::PING => {
                // Echo as-is so the client can measure the round trip
                if let Err(e) = self.queue.add(command) {
                    tracing::debug!("Failed to echo ping to {}: {}", self.name, e);
                }
                true
            }
            names::CL_CONNECTION_SPEED => {
                if let Some(speed) = command.get_i64("speed") {
                    self.speed_ms.store(speed, Ordering::Relaxed);
                    let status = ConnectionStatus::from_speed(speed);
                    *self.status.lock() = status;
                    tracing::trace!("{} speed {}ms ({})", self.name, speed, status);
                }
                true
            }
            names::CL_ERROR => {
                tracing::error!(
                    "Client {} reported error: {} {}",
                    self.name,
                    command.get_str("msg").unwrap_or(""),
                    command.get_str("stack").unwrap_or("")
                );
                true
            }
            names::CL_REMOTE_RETURNS => {
                self.pending.resolve_command(&command);
                true
            }
            names::SVR_EXECUTE_REMOTE => self.hand_off(&workers.invoker, command, session),
            names::CL_DISCONNECT => {
                // The client answers nothing after its goodbye
                let cancelled = self.pending.close();
                if cancelled > 0 {
                    tracing::debug!("Cancelled {} pending calls on {}", cancelled, self.name);
                }
                self.hand_off(&workers.events, command, session);
                false
            }
            _ => self.hand_off(&workers.events, command, session),
        }
    }

    fn hand_off(self: &Arc<Self>, worker: &Dispatcher, command: Command, session: u64) -> bool {
        let conn = Arc::clone(self);
        let job = move || {
            if conn.session.load(Ordering::SeqCst) == session && conn.is_connected() {
                conn.process_command(command);
            }
        };
        match worker.submit(job, self.channel_block_timeout) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dispatch on {} failed: {}", worker.label(), e);
                self.close("channel block", CloseKind::Transport);
                false
            }
        }
    }

    /// Runs on a dispatch thread
    fn process_command(&self, command: Command) {
        match command.type_name() {
            names::CL_DISCONNECT => {
                let reason = command.get_str("reason").unwrap_or("client disconnected");
                self.close(reason, CloseKind::Peer);
            }
            names::PROPERTIES => {
                {
                    let mut attributes = self.attributes.write();
                    for (key, value) in command.arguments() {
                        attributes.insert(key.clone(), value.clone());
                    }
                }
                if let Some(conn) = self.self_ref.upgrade() {
                    for listener in self.listeners.read().clone() {
                        listener.on_properties_changed(&conn);
                    }
                    if let Some(server) = self.server.upgrade() {
                        for listener in server.listeners() {
                            listener.on_properties_changed(&conn);
                        }
                    }
                }
            }
            names::SVR_EXECUTE_REMOTE => {
                let Some(server) = self.server.upgrade() else {
                    return;
                };
                if let Some(reply) = server.remote_objects().execute(&command, self.registry.reserved()) {
                    if let Err(e) = self.queue.add(reply) {
                        tracing::debug!("Failed to return remote result to {}: {}", self.name, e);
                    }
                }
            }
            _ => self.dispatch(&command),
        }
    }

    fn dispatch(&self, command: &Command) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if handler.handle(&conn, command) {
                return;
            }
        }

        for listener in self.listeners.read().clone() {
            listener.on_command(&conn, command);
        }
        if let Some(server) = self.server.upgrade() {
            for listener in server.listeners() {
                listener.on_command(&conn, command);
            }
        }
    }

    fn close(&self, reason: &str, kind: CloseKind) {
        {
            let mut link = self.link.lock();
            if link.state != LinkState::Connected {
                return;
            }
            link.state = LinkState::Disconnecting;
        }
        tracing::info!("Disconnecting {}: {}", self.name, reason);

        if let Some(conn) = self.self_ref.upgrade() {
            for listener in self.listeners.read().clone() {
                listener.on_disconnected(&conn, reason);
            }
            if let Some(server) = self.server.upgrade() {
                for listener in server.listeners() {
                    listener.on_disconnected(&conn, reason);
                }
            }
        }

        if kind == CloseKind::Local {
            let goodbye = Command::new(self.registry.reserved().svr_disconnect.clone())
                .with("reason", reason);
            if let Err(e) = self.queue.add(goodbye) {
                tracing::debug!("Could not send disconnect to {}: {}", self.name, e);
            }
        }
        self.queue.stop(kind != CloseKind::Transport);

        let cancelled = self.pending.close();
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending calls on {}", cancelled, self.name);
        }

        {
            let mut link = self.link.lock();
            if let Some(socket) = link.socket.take() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            link.state = LinkState::Disconnected;
        }

        if kind != CloseKind::Transport && !self.is_kicked() {
            if let (Some(server), Some(conn)) = (self.server.upgrade(), self.self_ref.upgrade()) {
                server.remove_connection(&conn);
            }
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> String {
        self.link.lock().peer_addr.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().state == LinkState::Connected
    }

    /// Connected or in the middle of a handshake / disconnect
    pub(crate) fn is_busy(&self) -> bool {
        self.link.lock().state != LinkState::Disconnected
    }

    pub(crate) fn is_reader_active(&self) -> bool {
        self.reader_active.load(Ordering::SeqCst)
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Last round-trip time the client reported
    pub fn speed_ms(&self) -> Option<i64> {
        match self.speed_ms.load(Ordering::Relaxed) {
            ms if ms >= 0 => Some(ms),
            _ => None,
        }
    }

    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().clone()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn set_command_handler(&self, handler: Option<Arc<dyn CommandHandler>>) {
        *self.handler.write() = handler;
    }

    /// Queue a command for this client
    pub fn send_command(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.queue.add(command)
    }

    pub fn send_message(&self, message: &str) -> Result<()> {
        let command = Command::new(self.registry.reserved().message.clone()).with("msg", message);
        self.send_command(command)
    }

    /// Disconnect and forget this connection; no-op if not connected
    pub fn disconnect(&self, reason: &str) {
        self.close(reason, CloseKind::Local);
    }

    /// Disconnect and refuse reconnects under this name until unkicked
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        tracing::info!("Kicking {}", self.name);
        self.close("kicked", CloseKind::Local);
    }

    pub fn unkick(&self) {
        self.kicked.store(false, Ordering::SeqCst);
        tracing::info!("Unkicked {}", self.name);
    }

    // =========================================================================
    // Remote Invocation
    // =========================================================================

    /// Invoke `method` on the client's object `target`
    ///
    /// With `returns_result` the call blocks until the client answers or the
    /// connection closes; cancelled and disconnected both yield None.
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

    /// Fire-and-forget invocation
    pub fn execute_on_remote(&self, target: &str, method: &str, params: &[Value]) -> Result<()> {
        let command = execute_command(self.registry.reserved(), target, method, params, None)?;
        self.send_command(command)
    }

    /// Result-bearing invocation, blocking until it resolves
    pub fn call_remote(&self, target: &str, method: &str, params: &[Value]) -> Result<RemoteReply> {
        Ok(self.begin_remote_call(target, method, params)?.wait())
    }

    /// Start a result-bearing invocation and return its handle
    pub fn begin_remote_call(&self, target: &str, method: &str, params: &[Value]) -> Result<PendingCall> {
        begin_call(&self.pending, self.registry.reserved(), target, method, params, |command| {
            self.send_command(command)
        })
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.link.lock();
        f.debug_struct("ClientConnection")
            .field("name", &self.name)
            .field("state", &link.state)
            .field("peer_addr", &link.peer_addr)
            .field("kicked", &self.is_kicked())
            .finish()
    }
}

/// Outbound queue callbacks for a server-side connection
struct ConnectionHooks {
    conn: Weak<ClientConnection>,
    session: u64,
}

impl ConnectionHooks {
    fn current(&self) -> Option<Arc<ClientConnection>> {
        self.conn
            .upgrade()
            .filter(|c| c.session.load(Ordering::SeqCst) == self.session)
    }
}

impl QueueHooks for ConnectionHooks {
    fn on_timeout(&self) {
        let Some(conn) = self.current() else {
            return;
        };
        // Bare ping: keeps the socket warm, the client does not answer it
        let ping = Command::new(conn.registry.reserved().ping.clone());
        if let Err(e) = conn.send_command(ping) {
            tracing::trace!("Keep-alive to {} skipped: {}", conn.name, e);
        }
    }

    fn on_failed(&self, error: &LinkError) {
        if let Some(conn) = self.current() {
            conn.close(&format!("write failed: {}", error), CloseKind::Transport);
        }
    }
}
