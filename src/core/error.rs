// This module defines the error types shared by the backend contract and the session
// manager, using the thiserror crate for idiomatic Rust error handling. BackendError is
// what a CompilerBackend implementation reports when one of its calls fails: a rejected
// configuration step, a failed compile of source text or a file, a failed relocation, or
// a missing/unloadable backend library. SessionError is what the session orchestrator
// propagates to its caller: configuration failures are fatal to the session, compile and
// relocation failures are fatal to that step only, and lazy-table or stub errors are
// wrapped transparently. Registration failures never surface here; they are logged and
// counted instead.

//! Error types for the hostlink runtime.
//!
//! Using thiserror for idiomatic error handling.

use std::path::PathBuf;

use thiserror::Error;

use crate::plt::PltError;
use crate::x64::StubError;

/// Error reported by a compiler backend implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("compilation of {unit} failed")]
    CompileFailed {
        unit: String,
    },

    #[error("relocation failed")]
    RelocationFailed,

    #[error("could not write output file {path:?}")]
    OutputFailed {
        path: PathBuf,
    },

    #[error("backend library unavailable: {reason}")]
    Library {
        reason: String,
    },

    #[error("operation not supported by this backend: {operation}")]
    Unsupported {
        operation: &'static str,
    },
}

/// Main error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to create backend instance: {reason}")]
    BackendCreation {
        reason: String,
    },

    #[error("backend configuration failed while {step}")]
    Configuration {
        step: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("compilation failed")]
    Compile(#[source] BackendError),

    #[error("relocation failed")]
    Relocation(#[source] BackendError),

    #[error("output failed")]
    Output(#[source] BackendError),

    #[error("entry point not found: {name}")]
    EntryPointNotFound {
        name: String,
    },

    #[error("lazy symbol table is not enabled for this session")]
    PltDisabled,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Plt(#[from] PltError),

    #[error(transparent)]
    Stub(#[from] StubError),
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
