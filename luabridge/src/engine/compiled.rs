use std::fmt;
use std::sync::Arc;

use luabridge_vm::proto;

use super::context::ScriptContext;
use super::ScriptEngine;
use crate::error::{LoadError, Result};
use crate::object::Object;

/// A precompiled chunk.
///
/// Holds only the dumped bytes; evaluating it loads them again, so one
/// chunk can be evaluated any number of times, by any engine.
#[derive(Clone, PartialEq, Eq)]
pub struct CompiledChunk {
    bytes: Arc<[u8]>,
}

impl CompiledChunk {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    /// Wraps bytes produced by [`CompiledChunk::as_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> std::result::Result<Self, LoadError> {
        if !proto::is_binary(&bytes) {
            return Err(LoadError::new("not a precompiled chunk"));
        }
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn eval(&self, engine: &ScriptEngine, ctx: &ScriptContext) -> Result<Object> {
        engine.eval_chunk(self, ctx)
    }
}

impl fmt::Debug for CompiledChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledChunk({} bytes)", self.bytes.len())
    }
}
