use thiserror::Error;

/// Errors raised by the runtime.
///
/// `Syntax` and `Runtime` messages already carry the `<chunk>:<line>:` prefix
/// when one is known.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LuaError {
    #[error("{0}")]
    Syntax(String),

    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
    },

    #[error("{0}")]
    Undump(String),

    #[error("unable to dump given function")]
    Dump,

    #[error("{0}")]
    Api(String),
}

impl LuaError {
    pub fn runtime(message: impl Into<String>) -> Self {
        LuaError::Runtime {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        LuaError::Api(message.into())
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn traceback(&self) -> Option<&str> {
        match self {
            LuaError::Runtime { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    pub fn is_load_error(&self) -> bool {
        matches!(self, LuaError::Syntax(_) | LuaError::Undump(_))
    }
}

pub type LuaResult<T> = Result<T, LuaError>;
