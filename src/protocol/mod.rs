//! Protocol Module
//!
//! Defines the wire protocol spoken between game servers and clients.
//!
//! ## Command Format
//! ```text
//! ┌─────────────┬───────────┬─────────────────────────────┐
//! │ Type (str)  │ Count (4) │    Count × typed argument   │
//! └─────────────┴───────────┴─────────────────────────────┘
//! ```
//!
//! ### Reserved Types
//! - CL_CONNECT / SVR_CONNECTED:        handshake
//! - CL_DISCONNECT / SVR_DISCONNECT:    graceful close, rejection
//! - PING / CL_CONNECTION_SPEED:        keep-alive and round-trip time
//! - PROPERTIES / PASSWORD / MESSAGE:   session metadata and chat
//! - SVR_EXECUTE_REMOTE / CL_REMOTE_RETURNS: remote method calls
//! - CL_ERROR:                          error report from a client
//!
//! Applications register additional types by name on a
//! [`CommandTypeRegistry`].

mod value;
mod command_type;
mod command;
mod codec;

pub use value::{
    Value, TAG_BLOB, TAG_BOOL, TAG_FLOAT32, TAG_FLOAT64, TAG_INT32, TAG_INT64, TAG_NULL,
    TAG_STRING,
};
pub use command_type::{names, CommandType, CommandTypeRegistry, ReservedTypes, TypeStats};
pub use command::Command;
pub use codec::{
    decode_command, encode_command, put_string, read_command, read_magic, read_string,
    write_command, write_magic, MAX_ARGUMENTS, MAX_BLOB_SIZE, MAX_STRING_BYTES,
};
