use lazy_static::lazy_static;
use log::{debug, warn};
use luabridge_nls::DecodeError;
use luabridge_vm::LuaError;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref LOCATION: Regex = Regex::new(r"^(.+?):(\d+):").unwrap();
}

#[derive(Error, Debug)]
pub enum Error {
    /// Nil, NaN or a key the map's policy refuses.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Lists never hold nil, it would punch a hole in the sequence.
    #[error("nil element at index {index}")]
    NilElement { index: usize },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("{0}")]
    NoSuchMethod(String),

    #[error("object is not a table")]
    NotATable,

    #[error("transcoding error: {0}")]
    Transcoding(#[from] DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stack protocol failure inside the runtime.
    #[error(transparent)]
    Lua(#[from] LuaError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A chunk failed to parse or to undump.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
    pub source_name: Option<String>,
    pub line_number: Option<u32>,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let (source_name, line_number) = match parse_location(&message) {
            Some((name, line)) => (Some(name), Some(line)),
            None => (None, None),
        };
        Self {
            message,
            source_name,
            line_number,
        }
    }
}

impl From<LuaError> for LoadError {
    fn from(err: LuaError) -> Self {
        LoadError::new(err.message())
    }
}

/// A script raised an error while running.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub source_name: Option<String>,
    pub line_number: Option<u32>,
    pub traceback: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let (source_name, line_number) = match parse_location(&message) {
            Some((name, line)) => (Some(name), Some(line)),
            None => (None, None),
        };
        Self {
            message,
            source_name,
            line_number,
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

impl From<LuaError> for ScriptError {
    fn from(err: LuaError) -> Self {
        let traceback = err.traceback().map(str::to_string);
        ScriptError::new(err.message()).with_traceback(traceback)
    }
}

/// Splits `"<source>:<line>: <message>"` into its source name and line.
///
/// Anything else, including a line number that does not fit in `u32`,
/// yields `None` and the error stays unlocated.
pub fn parse_location(message: &str) -> Option<(String, u32)> {
    let Some(caps) = LOCATION.captures(message) else {
        debug!("no location in error message: {message:?}");
        return None;
    };
    let name = caps.get(1)?.as_str();
    let digits = caps.get(2)?.as_str();
    match digits.parse::<u32>() {
        Ok(line) => Some((name.to_string(), line)),
        Err(_) => {
            warn!("line number {digits} in error message does not fit, leaving it unlocated");
            None
        }
    }
}
