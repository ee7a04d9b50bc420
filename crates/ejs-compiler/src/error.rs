//! Compilation errors.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot open input '{path}': {reason}")]
    OpenInput { path: String, reason: String },

    #[error("duplicate input file '{path}'")]
    DuplicateInput { path: String },

    #[error("{0}")]
    Pool(#[from] ejs_bytecode::PoolError),

    #[error("decode error: {0}")]
    Decode(#[from] ejs_bytecode::DecodeError),

    #[error("compilation failed with {errors} error(s)")]
    Failed { errors: u32 },

    #[error("fatal: {message}")]
    Fatal { message: String },

    #[error("internal compiler error: {message}")]
    Internal { message: String },
}

impl CompileError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
