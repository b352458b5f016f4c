//! # Turnlink
//!
//! A TCP command transport for turn-based multiplayer games:
//! - Typed, self-describing commands with ordered named arguments
//! - One outbound queue per link with keep-alive on idle
//! - Handshake with version check, unique names, password and capacity limits
//! - Remote method invocation with correlated replies, in both directions
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  GameClient  │  │  GameClient  │  │  GameClient  │
//! │ reader/proc  │  │ reader/proc  │  │ reader/proc  │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │  magic + commands (optional cipher)│
//! ┌──────▼─────────────────▼─────────────────▼───────┐
//! │                    GameServer                    │
//! │        (accept thread, handshake threads)        │
//! └──────┬─────────────────┬─────────────────┬───────┘
//!        ▼                 ▼                 ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Connection  │  │  Connection  │  │  Connection  │
//! │reader + queue│  │reader + queue│  │reader + queue│
//! └──────────────┘  └──────────────┘  └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod cipher;
pub mod protocol;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LinkError, ProtocolError, Result};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Command, CommandType, CommandTypeRegistry, Value};
pub use network::{ClientConnection, ClientListener, ClientState, GameClient, GameServer, ServerListener};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Turnlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
