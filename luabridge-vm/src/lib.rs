//! A small single-threaded Lua 5.1 subset runtime driven through an
//! index-addressed stack protocol.

pub mod ast;
pub mod compiler;
pub mod error;
mod exec;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod proto;
pub mod state;
mod stdlib;
pub mod table;
pub mod value;

pub use error::{LuaError, LuaResult};
pub use state::{SharedWriter, State, MAX_CALL_DEPTH};
pub use table::Table;
pub use value::{Function, NativeFunction, TableId, UserData, Value};
