//! Game Server
//!
//! Accepts sockets, runs the handshake and keeps the name → connection
//! registry.

use std::collections::HashMap;
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::cipher::{BoxRead, BoxWrite};
use crate::config::ServerConfig;
use crate::error::{LinkError, ProtocolError, Result};
use crate::protocol::{names, read_command, read_magic, write_command, Command, Value};

use super::connection::ClientConnection;
use super::remote::{RemoteInvocable, RemoteObjects};
use super::{wrap_streams, MAGIC};

/// How often the non-blocking accept loop polls
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Server-wide events; every method has a no-op default
pub trait ServerListener: Send + Sync {
    fn on_connected(&self, _conn: &Arc<ClientConnection>) {}

    /// A known name came back after losing its connection
    fn on_reconnected(&self, _conn: &Arc<ClientConnection>) {}

    fn on_disconnected(&self, _conn: &Arc<ClientConnection>, _reason: &str) {}

    fn on_command(&self, _conn: &Arc<ClientConnection>, _command: &Command) {}

    fn on_properties_changed(&self, _conn: &Arc<ClientConnection>) {}

    fn on_server_stopped(&self) {}
}

/// State shared by the server handle, its threads and its connections
pub(crate) struct ServerShared {
    config: ServerConfig,

    /// Registry of known clients; mutated by handshakes, read by broadcasts
    connections: Mutex<HashMap<String, Arc<ClientConnection>>>,

    listeners: RwLock<Vec<Arc<dyn ServerListener>>>,

    remote_objects: RemoteObjects,

    running: AtomicBool,

    /// Sockets whose handshake thread is still running, by handshake id
    handshakes: Mutex<HashMap<u64, TcpStream>>,

    next_handshake: AtomicU64,
}

impl ServerShared {
    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn ServerListener>> {
        self.listeners.read().clone()
    }

    pub(crate) fn remote_objects(&self) -> &RemoteObjects {
        &self.remote_objects
    }

    /// Drop `conn` from the registry if it is still the registered one
    pub(crate) fn remove_connection(&self, conn: &Arc<ClientConnection>) {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(conn.name()) {
            if Arc::ptr_eq(existing, conn) {
                connections.remove(conn.name());
                tracing::debug!("Removed {} from registry", conn.name());
            }
        }
    }

    fn connected(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .lock()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }
}

/// TCP game server
pub struct GameServer {
    shared: Arc<ServerShared>,

    accept_thread: Mutex<Option<JoinHandle<()>>>,

    local_addr: Mutex<Option<SocketAddr>>,
}

impl GameServer {
    /// Create a new server with the given config; does not bind yet
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                connections: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                remote_objects: RemoteObjects::new(),
                running: AtomicBool::new(false),
                handshakes: Mutex::new(HashMap::new()),
                next_handshake: AtomicU64::new(0),
            }),
            accept_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind and start accepting in the background
    pub fn listen(&self) -> Result<SocketAddr> {
        let mut accept_thread = self.accept_thread.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(LinkError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.shared.config.listen_addr())?;
        // Non-blocking so the loop can notice stop()
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("turnlink-accept".to_string())
            .spawn(move || accept_loop(shared, listener));
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        *accept_thread = Some(handle);
        *self.local_addr.lock() = Some(addr);
        tracing::info!(
            "Server '{}' v{} listening on {}",
            self.shared.config.name,
            self.shared.config.version,
            addr
        );
        Ok(addr)
    }

    /// Stop accepting, disconnect every client and clear the registry
    ///
    /// Handshakes still in flight are cut off first, so no client comes
    /// online once `on_server_stopped` has fired.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping server '{}'", self.shared.config.name);

        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Accept thread panicked");
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.shared.config.stop_timeout_ms);

        for socket in self.shared.handshakes.lock().values() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        while !self.shared.handshakes.lock().is_empty() {
            if Instant::now() >= deadline {
                tracing::error!("Unclean stoppage: handshakes still running after {}ms", self.shared.config.stop_timeout_ms);
                break;
            }
            thread::sleep(ACCEPT_POLL);
        }

        let connections: Vec<Arc<ClientConnection>> =
            self.shared.connections.lock().values().cloned().collect();
        for conn in &connections {
            conn.disconnect("server stopping");
        }

        while connections.iter().any(|c| c.is_connected() || c.is_reader_active()) {
            if Instant::now() >= deadline {
                tracing::error!("Unclean stoppage: clients still active after {}ms", self.shared.config.stop_timeout_ms);
                break;
            }
            thread::sleep(ACCEPT_POLL);
        }

        self.shared.connections.lock().clear();
        *self.local_addr.lock() = None;

        for listener in self.shared.listeners() {
            listener.on_server_stopped();
        }
        tracing::info!("Server stopped");
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    /// Send to every connected client; failures are logged per client
    pub fn broadcast_command(&self, command: &Command) {
        for conn in self.shared.connected() {
            if let Err(e) = conn.send_command(command.clone()) {
                tracing::warn!("Broadcast of {} to {} failed: {}", command.type_name(), conn.name(), e);
            }
        }
    }

    pub fn broadcast_message(&self, message: &str) {
        let command = Command::new(self.shared.config.registry.reserved().message.clone())
            .with("msg", message);
        self.broadcast_command(&command);
    }

    /// Fire-and-forget invocation on every connected client
    pub fn broadcast_execute_method_on_remote(&self, target: &str, method: &str, params: &[Value]) {
        for conn in self.shared.connected() {
            if let Err(e) = conn.execute_on_remote(target, method, params) {
                tracing::warn!("Broadcast call {}.{} to {} failed: {}", target, method, conn.name(), e);
            }
        }
    }

    // =========================================================================
    // Registry Access
    // =========================================================================

    pub fn connection(&self, name: &str) -> Option<Arc<ClientConnection>> {
        self.shared.connections.lock().get(name).cloned()
    }

    /// Every registered connection, connected or not
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.shared.connections.lock().values().cloned().collect()
    }

    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .connected()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn connected_count(&self) -> usize {
        self.shared.connected().len()
    }

    /// Kick by name; false if no such connection
    pub fn kick(&self, name: &str) -> bool {
        match self.connection(name) {
            Some(conn) => {
                conn.kick();
                true
            }
            None => false,
        }
    }

    pub fn unkick(&self, name: &str) -> bool {
        match self.connection(name) {
            Some(conn) => {
                conn.unkick();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Listeners and Remote Objects
    // =========================================================================

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServerListener>) {
        self.shared.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Make `object` callable by clients under `id`
    pub fn register_remote_object(&self, id: impl Into<String>, object: Arc<dyn RemoteInvocable>) {
        self.shared.remote_objects.register(id, object);
    }

    pub fn unregister_remote_object(&self, id: &str) {
        self.shared.remote_objects.unregister(id);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Accept Loop and Handshake
// =============================================================================

fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!("Accepted socket from {}", addr);
                let tracked = match stream.try_clone() {
                    Ok(tracked) => tracked,
                    Err(e) => {
                        tracing::error!("Dropping socket from {}: {}", addr, e);
                        continue;
                    }
                };
                let id = shared.next_handshake.fetch_add(1, Ordering::SeqCst);
                shared.handshakes.lock().insert(id, tracked);

                let worker = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("handshake-{}", addr))
                    .spawn(move || handshake(worker, stream, addr, id));
                if let Err(e) = spawned {
                    tracing::error!("Failed to spawn handshake for {}: {}", addr, e);
                    shared.handshakes.lock().remove(&id);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!("Accept loop exited");
}

fn handshake(shared: Arc<ServerShared>, stream: TcpStream, addr: SocketAddr, id: u64) {
    if let Err(e) = perform_handshake(&shared, stream) {
        tracing::warn!("Rejected connection from {}: {}", addr, e);
    }
    shared.handshakes.lock().remove(&id);
}

fn perform_handshake(shared: &Arc<ServerShared>, stream: TcpStream) -> Result<()> {
    let config = &shared.config;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let handshake_timeout = Some(Duration::from_millis(config.handshake_timeout_ms));
    stream.set_read_timeout(handshake_timeout)?;
    stream.set_write_timeout(handshake_timeout)?;

    let mut raw_reader = stream.try_clone()?;
    let magic = read_magic(&mut raw_reader)?;
    if magic != MAGIC {
        let _ = stream.shutdown(Shutdown::Both);
        return Err(ProtocolError::BadMagic(magic).into());
    }

    let input: BoxRead = Box::new(raw_reader);
    let output: BoxWrite = Box::new(stream.try_clone()?);
    let (input, mut output) = wrap_streams(config.cipher.as_deref(), input, output);
    let mut reader = BufReader::new(input);

    let (conn, connect, reconnect) = match negotiate(shared, &mut reader, &mut output) {
        Ok(result) => result,
        Err(e) => {
            let reason = match &e {
                LinkError::Protocol(p) => p.to_string(),
                other => other.to_string(),
            };
            let goodbye = Command::new(config.registry.reserved().svr_disconnect.clone())
                .with("reason", reason);
            let _ = write_command(&mut output, &goodbye);
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e);
        }
    };

    let session_timeout = match config.read_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let socket_setup = stream
        .set_read_timeout(session_timeout)
        .and_then(|_| stream.set_write_timeout(session_timeout));
    if let Err(e) = socket_setup {
        abandon_claim(shared, &conn, reconnect);
        return Err(e.into());
    }

    let welcome = Command::new(config.registry.reserved().svr_connected.clone())
        .with("name", config.name.as_str())
        .with("keepAlive", i32::try_from(config.keep_alive_ms).unwrap_or(i32::MAX));

    if let Err(e) = conn.attach(stream, reader, output, &connect, welcome) {
        abandon_claim(shared, &conn, reconnect);
        return Err(e);
    }

    // stop() may have run between the registry claim and attach
    if !shared.running.load(Ordering::SeqCst) {
        conn.disconnect("server stopping");
        shared.remove_connection(&conn);
        return Err(ProtocolError::ServerStopping.into());
    }

    for listener in shared.listeners() {
        if reconnect {
            listener.on_reconnected(&conn);
        } else {
            listener.on_connected(&conn);
        }
    }
    Ok(())
}

/// Read CL_CONNECT, check version and password, then claim a registry slot
fn negotiate(
    shared: &Arc<ServerShared>,
    reader: &mut BufReader<BoxRead>,
    output: &mut BoxWrite,
) -> Result<(Arc<ClientConnection>, Command, bool)> {
    let config = &shared.config;

    let connect = read_command(reader, &config.registry).map_err(|e| match e {
        LinkError::Protocol(p) => LinkError::Protocol(ProtocolError::Malformed(p.to_string())),
        other => other,
    })?;
    if connect.type_name() != names::CL_CONNECT {
        return Err(ProtocolError::Malformed(format!(
            "expected {}, got {}",
            names::CL_CONNECT,
            connect.type_name()
        ))
        .into());
    }

    let version = connect.get_str("version").ok_or(ProtocolError::MissingVersion)?;
    if !config.version_policy.is_compatible(&config.version, version) {
        return Err(ProtocolError::IncompatibleVersion {
            server: config.version.clone(),
            client: version.to_string(),
        }
        .into());
    }

    let name = connect
        .get_str("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProtocolError::Malformed("missing name".to_string()))?
        .to_string();

    if let Some(password) = &config.password {
        write_command(output, &Command::new(config.registry.reserved().password.clone()))?;
        let answer = read_command(reader, &config.registry)?;
        if answer.type_name() != names::PASSWORD || answer.get_str("password") != Some(password.as_str()) {
            return Err(ProtocolError::BadPassword.into());
        }
    }

    let mut connections = shared.connections.lock();
    // stop() clears the registry under this lock after clearing the flag
    if !shared.running.load(Ordering::SeqCst) {
        return Err(ProtocolError::ServerStopping.into());
    }
    if let Some(existing) = connections.get(&name) {
        if existing.is_busy() {
            return Err(ProtocolError::DuplicateName(name).into());
        }
        if existing.is_kicked() {
            return Err(ProtocolError::Banned(name).into());
        }
        if !existing.try_claim() {
            return Err(ProtocolError::DuplicateName(name).into());
        }
        tracing::debug!("{} is reconnecting", name);
        return Ok((Arc::clone(existing), connect, true));
    }

    let live = connections.values().filter(|c| c.is_busy()).count();
    if live >= config.max_connections {
        return Err(ProtocolError::MaxConnections(config.max_connections).into());
    }

    let conn = ClientConnection::new(&name, shared);
    connections.insert(name, Arc::clone(&conn));
    Ok((conn, connect, false))
}

fn abandon_claim(shared: &Arc<ServerShared>, conn: &Arc<ClientConnection>, reconnect: bool) {
    conn.release_claim();
    // Kicked names stay registered so the ban sticks
    if !reconnect && !conn.is_kicked() {
        shared.remove_connection(conn);
    }
}
