//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format (all integers big-endian)
//! ```text
//! ┌─────────────┬───────────┬──────────────────────────────────────────┐
//! │ Type (str)  │ Count (4) │ Count × [ Key (str) │ Tag (1) │ Value ]  │
//! └─────────────┴───────────┴──────────────────────────────────────────┘
//! ```
//!
//! Strings are a 2-byte length followed by modified UTF-8: NUL is written as
//! `C0 80` and characters outside the BMP as two 3-byte surrogates.
//!
//! ### Values by Tag
//! - 0 null:    nothing
//! - 1 bool:    1 byte
//! - 2 int32:   4 bytes
//! - 3 int64:   8 bytes
//! - 4 float32: 4 bytes
//! - 5 float64: 8 bytes
//! - 6 string:  length-prefixed string
//! - 7 blob:    length (4) + raw bytes

use std::io::{Cursor, Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use super::value::*;
use super::{Command, CommandTypeRegistry};

/// Maximum blob size (16 MB)
pub const MAX_BLOB_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum number of arguments in one command
pub const MAX_ARGUMENTS: i32 = 4096;

/// Longest encodable string in bytes
pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

// =============================================================================
// Modified UTF-8 Strings
// =============================================================================

/// Append a length-prefixed modified UTF-8 string
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let mut encoded = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => encoded.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                encoded.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                encoded.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }

    if encoded.len() > MAX_STRING_BYTES {
        return Err(ProtocolError::StringTooLong(encoded.len()).into());
    }

    buf.put_u16(encoded.len() as u16);
    buf.put_slice(&encoded);
    Ok(())
}

/// Read a length-prefixed modified UTF-8 string
pub fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = u16::from_be_bytes(read_array(reader)?) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;

    let mut units = Vec::with_capacity(len);
    let mut i = 0;
    while i < len {
        let b0 = bytes[i] as u16;
        if b0 & 0x80 == 0 {
            units.push(b0);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = continuation(&bytes, i + 1)?;
            units.push(((b0 & 0x1F) << 6) | b1);
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = continuation(&bytes, i + 1)?;
            let b2 = continuation(&bytes, i + 2)?;
            units.push(((b0 & 0x0F) << 12) | (b1 << 6) | b2);
            i += 3;
        } else {
            return Err(ProtocolError::InvalidUtf8.into());
        }
    }

    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf8.into())
}

fn continuation(bytes: &[u8], index: usize) -> Result<u16> {
    match bytes.get(index) {
        Some(&b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
        _ => Err(ProtocolError::InvalidUtf8.into()),
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

// =============================================================================
// Command Encoding/Decoding
// =============================================================================

/// Encode a command to bytes
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    // Anything read_command would refuse must not reach the wire
    if command.len() > MAX_ARGUMENTS as usize {
        return Err(ProtocolError::Malformed(format!(
            "{}: too many arguments {} (max {})",
            command.type_name(),
            command.len(),
            MAX_ARGUMENTS
        ))
        .into());
    }

    let mut buf = BytesMut::with_capacity(64);
    put_string(&mut buf, command.type_name())?;
    buf.put_i32(command.len() as i32);

    for (key, value) in command.arguments() {
        put_string(&mut buf, key)?;
        put_value(&mut buf, value)?;
    }

    Ok(buf.to_vec())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<()> {
    buf.put_u8(value.tag());
    match value {
        Value::Null => {}
        Value::Bool(v) => buf.put_u8(*v as u8),
        Value::Int32(v) => buf.put_i32(*v),
        Value::Int64(v) => buf.put_i64(*v),
        Value::Float32(v) => buf.put_f32(*v),
        Value::Float64(v) => buf.put_f64(*v),
        Value::String(v) => put_string(buf, v)?,
        Value::Blob(v) => {
            if v.len() > MAX_BLOB_SIZE as usize {
                return Err(ProtocolError::Malformed(format!(
                    "blob too large: {} bytes (max {})",
                    v.len(),
                    MAX_BLOB_SIZE
                ))
                .into());
            }
            buf.put_i32(v.len() as i32);
            buf.put_slice(v);
        }
    }
    Ok(())
}

/// Decode a command from a complete byte slice
pub fn decode_command(bytes: &[u8], registry: &CommandTypeRegistry) -> Result<Command> {
    let mut cursor = Cursor::new(bytes);
    read_command(&mut cursor, registry)
}

/// Read one command from a stream
///
/// Blocks until a complete command is received or an error occurs
pub fn read_command<R: Read>(reader: &mut R, registry: &CommandTypeRegistry) -> Result<Command> {
    let type_name = read_string(reader)?;
    let command_type = registry.resolve(&type_name)?;

    let count = i32::from_be_bytes(read_array(reader)?);
    if !(0..=MAX_ARGUMENTS).contains(&count) {
        return Err(ProtocolError::Malformed(format!(
            "{}: bad argument count {}",
            type_name, count
        ))
        .into());
    }

    let mut command = Command::new(command_type);
    for _ in 0..count {
        let key = read_string(reader)?;
        let value = read_value(reader)?;
        command.set(key, value);
    }

    Ok(command)
}

fn read_value<R: Read>(reader: &mut R) -> Result<Value> {
    let [tag] = read_array::<_, 1>(reader)?;
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            let [b] = read_array::<_, 1>(reader)?;
            Value::Bool(b != 0)
        }
        TAG_INT32 => Value::Int32(i32::from_be_bytes(read_array(reader)?)),
        TAG_INT64 => Value::Int64(i64::from_be_bytes(read_array(reader)?)),
        TAG_FLOAT32 => Value::Float32(f32::from_be_bytes(read_array(reader)?)),
        TAG_FLOAT64 => Value::Float64(f64::from_be_bytes(read_array(reader)?)),
        TAG_STRING => Value::String(read_string(reader)?),
        TAG_BLOB => {
            let len = i32::from_be_bytes(read_array(reader)?);
            if len < 0 || len as u32 > MAX_BLOB_SIZE {
                return Err(ProtocolError::Malformed(format!("bad blob length {}", len)).into());
            }
            let mut blob = vec![0u8; len as usize];
            reader.read_exact(&mut blob)?;
            Value::Blob(blob)
        }
        other => return Err(ProtocolError::UnknownArgumentTag(other).into()),
    };
    Ok(value)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Write a command to a stream and flush it
///
/// Returns the number of bytes written and records them in the type's stats
pub fn write_command<W: Write + ?Sized>(writer: &mut W, command: &Command) -> Result<usize> {
    let bytes = encode_command(command)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    command.command_type().record_sent(bytes.len());
    Ok(bytes.len())
}

/// Write the 8-byte connection preamble
pub fn write_magic<W: Write + ?Sized>(writer: &mut W, magic: u64) -> Result<()> {
    writer.write_all(&magic.to_be_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read the 8-byte connection preamble
pub fn read_magic<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

