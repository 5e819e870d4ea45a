use std::path::PathBuf;

use cryptoki_sys::CK_RV;
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced to the host. Provider status codes from `C_Initialize`
/// and `C_Finalize` are not errors; they are returned as values.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to load library {}: {source}", .path.display())]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("{} is not a PKCS#11 provider: {reason}", .path.display())]
    InvalidProvider { path: PathBuf, reason: String },
    #[error("{function} failed with CK_RV {rv:#x}")]
    Provider { function: &'static str, rv: CK_RV },
    #[error("provider handle has been released")]
    Released,
    #[error("unknown provider handle {0}")]
    InvalidHandle(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

impl BridgeError {
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
