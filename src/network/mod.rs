//! Network Module
//!
//! TCP server, client and the per-connection machinery they share.
//!
//! ## Architecture
//! - Server: one accept thread, one short-lived handshake thread per socket
//! - Per connection: a read thread, an outbound-queue writer thread and
//!   dispatch threads for listener callbacks and remote-object invocations
//! - Readers resolve remote-call replies themselves, so a call made from a
//!   callback never waits on its own thread
//!
//! ## Handshake
//! ```text
//! client                               server
//!   │── magic (8) ─────────────────────▶│  mismatch: close, no reply
//!   │── CL_CONNECT {name, version, ..} ─▶│  version / name / capacity checks
//!   │◀──────────────────── PASSWORD ─────│  only when a password is set
//!   │── PASSWORD {password} ────────────▶│
//!   │◀─── SVR_CONNECTED {name, keepAlive}│  or SVR_DISCONNECT {reason}
//! ```

mod queue;
mod dispatch;
mod remote;
mod connection;
mod server;
mod client;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cipher::{BoxRead, BoxWrite, Cipher};

pub use queue::{OutboundQueue, QueueHooks, DEFAULT_CAPACITY, DEFAULT_IDLE_TIMEOUT, MAX_CONSECUTIVE_ERRORS};
pub use dispatch::Dispatcher;
pub use remote::{
    correlation_id, execute_command, MethodTable, PendingCall, PendingCalls, RemoteError,
    RemoteInvocable, RemoteObjects, RemoteReply, CORRELATION_SUFFIX_LEN,
};
pub use connection::{ClientConnection, CommandHandler, ConnectionListener};
pub use server::{GameServer, ServerListener};
pub use client::{ClientListener, ClientState, GameClient};

/// Preamble every client writes before its first command
pub const MAGIC: u64 = 0x7475_726E_6C69_6E6B;

/// Link quality derived from the reported round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Red,
    Yellow,
    Green,
}

/// Lower bounds (milliseconds) checked top to bottom
const SPEED_THRESHOLDS: [(i64, ConnectionStatus); 3] = [
    (500, ConnectionStatus::Red),
    (200, ConnectionStatus::Yellow),
    (0, ConnectionStatus::Green),
];

impl ConnectionStatus {
    pub fn from_speed(speed_ms: i64) -> Self {
        SPEED_THRESHOLDS
            .iter()
            .find(|(min, _)| speed_ms >= *min)
            .map(|(_, status)| *status)
            .unwrap_or(ConnectionStatus::Unknown)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Unknown => "UNKNOWN",
            ConnectionStatus::Red => "RED",
            ConnectionStatus::Yellow => "YELLOW",
            ConnectionStatus::Green => "GREEN",
        };
        f.write_str(s)
    }
}

/// Apply the optional cipher to both halves of a socket
pub(crate) fn wrap_streams(
    cipher: Option<&dyn Cipher>,
    input: BoxRead,
    output: BoxWrite,
) -> (BoxRead, BoxWrite) {
    match cipher {
        Some(cipher) => (cipher.decrypt(input), cipher.encrypt(output)),
        None => (input, output),
    }
}

/// Wall clock in unix milliseconds
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
