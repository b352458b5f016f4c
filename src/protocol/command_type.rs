//! Command type registry
//!
//! Command types form an open set: the transport pre-registers its reserved
//! types and applications add their own by name. The name is the wire
//! identifier; the ordinal only records registration order for local
//! comparisons and is never transmitted.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::error::{LinkError, ProtocolError, Result};

/// Names of the protocol-internal command types
pub mod names {
    pub const CL_CONNECT: &str = "CL_CONNECT";
    pub const CL_DISCONNECT: &str = "CL_DISCONNECT";
    pub const CL_ERROR: &str = "CL_ERROR";
    pub const CL_CONNECTION_SPEED: &str = "CL_CONNECTION_SPEED";
    pub const CL_REMOTE_RETURNS: &str = "CL_REMOTE_RETURNS";
    pub const SVR_CONNECTED: &str = "SVR_CONNECTED";
    pub const SVR_DISCONNECT: &str = "SVR_DISCONNECT";
    pub const SVR_EXECUTE_REMOTE: &str = "SVR_EXECUTE_REMOTE";
    pub const PING: &str = "PING";
    pub const PROPERTIES: &str = "PROPERTIES";
    pub const PASSWORD: &str = "PASSWORD";
    pub const MESSAGE: &str = "MESSAGE";

    /// All reserved names in registration order
    pub const RESERVED: &[&str] = &[
        CL_CONNECT,
        CL_DISCONNECT,
        CL_ERROR,
        CL_CONNECTION_SPEED,
        CL_REMOTE_RETURNS,
        SVR_CONNECTED,
        SVR_DISCONNECT,
        SVR_EXECUTE_REMOTE,
        PING,
        PROPERTIES,
        PASSWORD,
        MESSAGE,
    ];
}

// =============================================================================
// Traffic Statistics
// =============================================================================

/// Accumulated byte counts for one command type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub count: u64,
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub total_bytes: u64,
}

impl TypeStats {
    fn record(&mut self, bytes: usize) {
        if self.count == 0 || bytes < self.min_bytes {
            self.min_bytes = bytes;
        }
        if bytes > self.max_bytes {
            self.max_bytes = bytes;
        }
        self.count += 1;
        self.total_bytes += bytes as u64;
    }

    /// Mean encoded size, 0 when nothing was sent
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.count as f64
        }
    }
}

// =============================================================================
// CommandType
// =============================================================================

struct TypeInner {
    name: String,
    ordinal: usize,
    stats: Mutex<TypeStats>,
}

/// Handle to a registered command type
///
/// Cheap to clone. Equality and hashing use the name; ordering uses the
/// registration ordinal.
#[derive(Clone)]
pub struct CommandType {
    inner: Arc<TypeInner>,
}

impl CommandType {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub fn is_reserved(&self) -> bool {
        names::RESERVED.contains(&self.name())
    }

    /// Snapshot of the traffic statistics
    pub fn stats(&self) -> TypeStats {
        *self.inner.stats.lock()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.inner.stats.lock().record(bytes);
    }
}

impl PartialEq for CommandType {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for CommandType {}

impl Hash for CommandType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl PartialOrd for CommandType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommandType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.ordinal.cmp(&other.inner.ordinal)
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandType({}#{})", self.inner.name, self.inner.ordinal)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

// =============================================================================
// Reserved Types
// =============================================================================

/// Handles to the protocol-internal types of one registry
#[derive(Debug, Clone)]
pub struct ReservedTypes {
    pub cl_connect: CommandType,
    pub cl_disconnect: CommandType,
    pub cl_error: CommandType,
    pub cl_connection_speed: CommandType,
    pub cl_remote_returns: CommandType,
    pub svr_connected: CommandType,
    pub svr_disconnect: CommandType,
    pub svr_execute_remote: CommandType,
    pub ping: CommandType,
    pub properties: CommandType,
    pub password: CommandType,
    pub message: CommandType,
}

// =============================================================================
// Registry
// =============================================================================

/// Append-only name → type table
///
/// Entries are never removed, so a handle stays valid for the life of the
/// registry.
pub struct CommandTypeRegistry {
    types: RwLock<HashMap<String, CommandType>>,
    reserved: ReservedTypes,
}

impl CommandTypeRegistry {
    /// Create a registry holding only the reserved types
    pub fn new() -> Self {
        let mut types = HashMap::new();
        let mut make = |name: &str| {
            let ty = CommandType {
                inner: Arc::new(TypeInner {
                    name: name.to_string(),
                    ordinal: types.len(),
                    stats: Mutex::new(TypeStats::default()),
                }),
            };
            types.insert(name.to_string(), ty.clone());
            ty
        };

        let reserved = ReservedTypes {
            cl_connect: make(names::CL_CONNECT),
            cl_disconnect: make(names::CL_DISCONNECT),
            cl_error: make(names::CL_ERROR),
            cl_connection_speed: make(names::CL_CONNECTION_SPEED),
            cl_remote_returns: make(names::CL_REMOTE_RETURNS),
            svr_connected: make(names::SVR_CONNECTED),
            svr_disconnect: make(names::SVR_DISCONNECT),
            svr_execute_remote: make(names::SVR_EXECUTE_REMOTE),
            ping: make(names::PING),
            properties: make(names::PROPERTIES),
            password: make(names::PASSWORD),
            message: make(names::MESSAGE),
        };

        Self {
            types: RwLock::new(types),
            reserved,
        }
    }

    /// Process-wide registry, created on first use
    pub fn shared() -> Arc<CommandTypeRegistry> {
        static SHARED: OnceLock<Arc<CommandTypeRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(CommandTypeRegistry::new())))
    }

    /// Register a new type; fails if the name is taken
    pub fn register(&self, name: &str) -> Result<CommandType> {
        if name.is_empty() {
            return Err(LinkError::Config("command type name must not be empty".to_string()));
        }

        let mut types = self.types.write();
        if types.contains_key(name) {
            return Err(LinkError::TypeConflict(name.to_string()));
        }

        let ty = CommandType {
            inner: Arc::new(TypeInner {
                name: name.to_string(),
                ordinal: types.len(),
                stats: Mutex::new(TypeStats::default()),
            }),
        };
        types.insert(name.to_string(), ty.clone());
        tracing::debug!("Registered command type {} (ordinal {})", name, ty.ordinal());

        Ok(ty)
    }

    /// Return the existing type or register it
    pub fn get_or_register(&self, name: &str) -> Result<CommandType> {
        if let Some(ty) = self.get(name) {
            return Ok(ty);
        }
        match self.register(name) {
            // Lost a race with another registration of the same name
            Err(LinkError::TypeConflict(_)) => self.resolve(name),
            other => other,
        }
    }

    pub fn get(&self, name: &str) -> Option<CommandType> {
        self.types.read().get(name).cloned()
    }

    /// Look up a type by its wire name
    pub fn resolve(&self, name: &str) -> Result<CommandType> {
        self.get(name)
            .ok_or_else(|| ProtocolError::UnknownType(name.to_string()).into())
    }

    pub fn reserved(&self) -> &ReservedTypes {
        &self.reserved
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    /// All types in registration order
    pub fn types(&self) -> Vec<CommandType> {
        let mut all: Vec<CommandType> = self.types.read().values().cloned().collect();
        all.sort();
        all
    }

    /// Table of per-type traffic, one line per type that was sent at least once
    pub fn stats_report(&self) -> String {
        let mut report = format!(
            "{:<24} {:>8} {:>8} {:>8} {:>10} {:>12}\n",
            "TYPE", "COUNT", "MIN", "MAX", "AVG", "TOTAL"
        );
        for ty in self.types() {
            let stats = ty.stats();
            if stats.count == 0 {
                continue;
            }
            report.push_str(&format!(
                "{:<24} {:>8} {:>8} {:>8} {:>10.1} {:>12}\n",
                ty.name(),
                stats.count,
                stats.min_bytes,
                stats.max_bytes,
                stats.average(),
                stats.total_bytes
            ));
        }
        report
    }
}

impl Default for CommandTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTypeRegistry")
            .field("types", &self.len())
            .finish()
    }
}
