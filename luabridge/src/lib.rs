//! Host-side views over values living in a [`luabridge_vm::State`].
//!
//! [`TableMap`] and [`TableList`] expose a script table as a map or a list,
//! [`Bindings`] exposes the global namespace, and [`ScriptEngine`] compiles,
//! evaluates and invokes scripts. Every operation locks the shared
//! [`Runtime`] and leaves its operand stack as it found it.

pub mod bindings;
pub mod config;
pub mod engine;
pub mod error;
pub mod object;
pub mod runtime;
pub mod table_list;
pub mod table_map;

pub use bindings::{Bindings, Scope, SimpleBindings, StringKey};
pub use config::{EngineConfig, EngineConfigBuilder, LoggerConfig};
pub use engine::{
    CompiledChunk, EngineFactory, InterfaceProxy, ScriptContext, ScriptEngine, SharedReader,
};
pub use error::{Error, LoadError, Result, ScriptError};
pub use object::{FunctionRef, Object, TableRef};
pub use runtime::{Runtime, StackGuard};
pub use table_list::TableList;
pub use table_map::{AnyKey, Entry, KeyPolicy, TableMap, TableSource};

pub use luabridge_nls::Encoding;
pub use luabridge_vm::{SharedWriter, UserData};
