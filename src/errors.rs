//! Typed error kinds for the introspection engine.
//!
//! The CLI layer (`main.rs`) deals in `anyhow::Error` like the rest of this
//! crate, but it needs to distinguish a handful of outcomes to pick an exit
//! code and print a useful hint. `EngineError` is the seam: every fallible
//! engine-layer function returns `Result<T, EngineError>`, and `?` converts
//! it into `anyhow::Error` at the CLI boundary same as any other error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No such process: {0}")]
    ProcessNotFound(remoteprocess::Pid),

    #[error("{0}")]
    Engine(String),

    #[error("{0}")]
    InvalidPythonProcess(String),

    #[error("{0}")]
    NotEnoughInformation(String),

    #[error("Unable to find maps for the executable {path}: {detail}")]
    MissingExecutableMaps { path: PathBuf, detail: String },

    #[error("Found more than one libpython mapped into the process: {0:?}")]
    MultipleLibpython(Vec<PathBuf>),

    #[error("{path} is not a valid ELF/Mach-O/PE executable: {cause}")]
    InvalidExecutable { path: PathBuf, cause: String },

    #[error("The executable automatically located from the core file does not exist: {path}")]
    DetectedExecutableNotFound { path: PathBuf },

    #[error("Failed to read {len} bytes at 0x{addr:016x}: {cause}")]
    MemoryReadError {
        addr: usize,
        len: usize,
        cause: String,
    },
}

impl EngineError {
    /// Process exit code this error kind should produce, per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::InvalidPythonProcess(_) => 2,
            _ => 1,
        }
    }

    pub fn memory(addr: usize, len: usize, cause: impl std::fmt::Display) -> EngineError {
        EngineError::MemoryReadError {
            addr,
            len,
            cause: cause.to_string(),
        }
    }

    pub fn invalid_executable(path: PathBuf, cause: impl std::fmt::Display) -> EngineError {
        EngineError::InvalidExecutable {
            path,
            cause: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
