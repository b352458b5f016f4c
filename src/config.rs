//! Configuration for turnlink
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cipher::Cipher;
use crate::error::{LinkError, Result};
use crate::protocol::CommandTypeRegistry;

/// Lowest port a server may listen on
pub const MIN_PORT: u16 = 1000;

/// Smallest useful connection limit
pub const MIN_MAX_CONNECTIONS: usize = 2;

// =============================================================================
// Version Compatibility
// =============================================================================

/// Decides whether a client's version may talk to this server
pub trait VersionPolicy: Send + Sync {
    fn is_compatible(&self, server_version: &str, client_version: &str) -> bool;
}

/// Versions must match exactly
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactVersion;

impl VersionPolicy for ExactVersion {
    fn is_compatible(&self, server_version: &str, client_version: &str) -> bool {
        server_version == client_version
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for a [`GameServer`](crate::network::GameServer)
#[derive(Clone)]
pub struct ServerConfig {
    /// Name reported to clients in SVR_CONNECTED
    pub name: String,

    /// Interface to bind
    pub bind_host: String,

    /// TCP listen port (>= 1000)
    pub port: u16,

    /// Max concurrently connected clients (>= 2)
    pub max_connections: usize,

    /// Version string clients must be compatible with
    pub version: String,

    /// Shared password clients must answer the PASSWORD challenge with
    pub password: Option<String>,

    /// Optional stream cipher applied after the magic number
    pub cipher: Option<Arc<dyn Cipher>>,

    /// Disconnect a client that is silent this long (milliseconds)
    pub read_timeout_ms: u64,

    /// Idle time before the server sends a keep-alive (milliseconds)
    pub keep_alive_ms: u64,

    /// Socket timeout while the handshake runs (milliseconds)
    pub handshake_timeout_ms: u64,

    /// Outbound queue capacity per connection
    pub queue_capacity: usize,

    /// Commands waiting for a connection's dispatch thread
    pub channel_capacity: usize,

    /// How long a reader waits on a full dispatch channel (milliseconds)
    pub channel_block_timeout_ms: u64,

    /// How long stop() waits for clients to go away (milliseconds)
    pub stop_timeout_ms: u64,

    /// Version compatibility check
    pub version_policy: Arc<dyn VersionPolicy>,

    /// Command types known to this server
    pub registry: Arc<CommandTypeRegistry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "turnlink".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port: 16000,
            max_connections: 8,
            version: "1.0".to_string(),
            password: None,
            cipher: None,
            read_timeout_ms: 20_000,
            keep_alive_ms: 10_000,
            handshake_timeout_ms: 5_000,
            queue_capacity: 32,
            channel_capacity: 64,
            channel_block_timeout_ms: 5_000,
            stop_timeout_ms: 5_000,
            version_policy: Arc::new(ExactVersion),
            registry: CommandTypeRegistry::shared(),
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Check the knobs that have hard lower bounds
    pub fn validate(&self) -> Result<()> {
        if self.port < MIN_PORT {
            return Err(LinkError::Config(format!(
                "port {} is below {}",
                self.port, MIN_PORT
            )));
        }
        if self.max_connections < MIN_MAX_CONNECTIONS {
            return Err(LinkError::Config(format!(
                "max_connections {} is below {}",
                self.max_connections, MIN_MAX_CONNECTIONS
            )));
        }
        if self.version.is_empty() {
            return Err(LinkError::Config("version must not be empty".to_string()));
        }
        if self.queue_capacity == 0 || self.channel_capacity == 0 {
            return Err(LinkError::Config("capacities must be positive".to_string()));
        }
        // Sent to clients as an int32 in SVR_CONNECTED
        if self.keep_alive_ms > i32::MAX as u64 {
            return Err(LinkError::Config(format!(
                "keep_alive_ms {} exceeds {}",
                self.keep_alive_ms,
                i32::MAX
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("bind_host", &self.bind_host)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("version", &self.version)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("cipher", &self.cipher.is_some())
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("keep_alive_ms", &self.keep_alive_ms)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("queue_capacity", &self.queue_capacity)
            .field("channel_capacity", &self.channel_capacity)
            .field("channel_block_timeout_ms", &self.channel_block_timeout_ms)
            .field("stop_timeout_ms", &self.stop_timeout_ms)
            .finish()
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.config.bind_host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.config.cipher = Some(cipher);
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the keep-alive interval (in milliseconds)
    pub fn keep_alive_ms(mut self, ms: u64) -> Self {
        self.config.keep_alive_ms = ms;
        self
    }

    /// Set the handshake socket timeout (in milliseconds)
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.config.handshake_timeout_ms = ms;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set how long a reader may block on a full dispatch channel (in milliseconds)
    pub fn channel_block_timeout_ms(mut self, ms: u64) -> Self {
        self.config.channel_block_timeout_ms = ms;
        self
    }

    /// Set how long stop() waits for clients (in milliseconds)
    pub fn stop_timeout_ms(mut self, ms: u64) -> Self {
        self.config.stop_timeout_ms = ms;
        self
    }

    pub fn version_policy(mut self, policy: Arc<dyn VersionPolicy>) -> Self {
        self.config.version_policy = policy;
        self
    }

    pub fn registry(mut self, registry: Arc<CommandTypeRegistry>) -> Self {
        self.config.registry = registry;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for a [`GameClient`](crate::network::GameClient)
#[derive(Clone)]
pub struct ClientConfig {
    /// Name this client claims on the server (must be unique there)
    pub name: String,

    /// Version sent in CL_CONNECT
    pub version: String,

    /// Answer to the server's PASSWORD challenge
    pub password: Option<String>,

    /// Optional stream cipher, must match the server's
    pub cipher: Option<Arc<dyn Cipher>>,

    /// Disconnect if the server is silent this long (milliseconds)
    pub read_timeout_ms: u64,

    /// Idle time before the client pings (milliseconds); replaced by the
    /// server's keepAlive once connected
    pub keep_alive_ms: u64,

    /// How long connect_blocking waits for SVR_CONNECTED (milliseconds)
    pub connect_timeout_ms: u64,

    /// Outbound queue capacity
    pub queue_capacity: usize,

    /// Capacity of the reader → processor channel
    pub channel_capacity: usize,

    /// Disconnect if the processor leaves the channel full this long (milliseconds)
    pub channel_block_timeout_ms: u64,

    /// Command types known to this client
    pub registry: Arc<CommandTypeRegistry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            version: "1.0".to_string(),
            password: None,
            cipher: None,
            read_timeout_ms: 20_000,
            keep_alive_ms: 10_000,
            connect_timeout_ms: 10_000,
            queue_capacity: 32,
            channel_capacity: 64,
            channel_block_timeout_ms: 5_000,
            registry: CommandTypeRegistry::shared(),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LinkError::Config("client name must not be empty".to_string()));
        }
        if self.version.is_empty() {
            return Err(LinkError::Config("version must not be empty".to_string()));
        }
        if self.queue_capacity == 0 || self.channel_capacity == 0 {
            return Err(LinkError::Config("capacities must be positive".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("cipher", &self.cipher.is_some())
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("keep_alive_ms", &self.keep_alive_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("queue_capacity", &self.queue_capacity)
            .field("channel_capacity", &self.channel_capacity)
            .field("channel_block_timeout_ms", &self.channel_block_timeout_ms)
            .finish()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.config.cipher = Some(cipher);
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the keep-alive interval (in milliseconds)
    pub fn keep_alive_ms(mut self, ms: u64) -> Self {
        self.config.keep_alive_ms = ms;
        self
    }

    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the channel block timeout (in milliseconds)
    pub fn channel_block_timeout_ms(mut self, ms: u64) -> Self {
        self.config.channel_block_timeout_ms = ms;
        self
    }

    pub fn registry(mut self, registry: Arc<CommandTypeRegistry>) -> Self {
        self.config.registry = registry;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
