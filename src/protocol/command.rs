//! Command definitions
//!
//! A command is a registered type plus an insertion-ordered map of named
//! arguments.

use std::fmt;

use indexmap::IndexMap;

use crate::error::{LinkError, Result};
use super::{CommandType, Value};

/// A single protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Registered type tag
    command_type: CommandType,

    /// Arguments in insertion order (keys unique)
    arguments: IndexMap<String, Value>,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_type,
            arguments: IndexMap::new(),
        }
    }

    /// Builder-style setter; overwrites an existing key in place
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert a new argument, failing if the key already exists
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if self.arguments.contains_key(&key) {
            return Err(LinkError::DuplicateArgument(key));
        }
        self.arguments.insert(key, value.into());
        Ok(())
    }

    /// Insert or overwrite an argument
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.arguments.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.arguments.shift_remove(key)
    }

    pub fn command_type(&self) -> &CommandType {
        &self.command_type
    }

    pub fn type_name(&self) -> &str {
        self.command_type.name()
    }

    pub fn arguments(&self) -> &IndexMap<String, Value> {
        &self.arguments
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.arguments.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }

    // =========================================================================
    // Typed Getters
    // =========================================================================

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_blob(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_blob)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_type.name())?;
        if self.arguments.is_empty() {
            return Ok(());
        }
        write!(f, " {{")?;
        for (i, (key, value)) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}
