// This module is the hub for the pieces every other part of hostlink builds on: the
// compiler backend contract (CompilerBackend, SymbolLookup, SymbolAddr, OutputMode), the
// shared error types, the call-convention adapter applied to symbols fetched from loaded
// modules, the backend session manager that wires the platform profile, builtin registry,
// runtime helpers, diagnostic classifier and lazy symbol table into one configured
// backend instance, and a recording backend used as a test double by unit and
// integration tests.

//! Core hostlink infrastructure.
//!
//! # Key Components
//!
//! ## Backend contract (`backend`)
//! - [`CompilerBackend`], implemented by the external C compiler binding
//! - [`SymbolLookup`], the narrow view the lazy symbol table needs
//!
//! ## Session management (`session`)
//! - Fixed configuration order for every backend instance
//! - Compile, relocate and run helpers
//!
//! ## Call adaptation (`abi`)
//! - Process-wide [`CallAdapter`] applied to loaded module symbols

pub mod abi;
pub mod backend;
pub mod error;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use abi::{call_adapter, install_call_adapter, wrap_symbol, CallAdapter, NativeCallAdapter};

pub use backend::{
    BackendLookup,
    CompilerBackend,
    ErrorCallback,
    LookupFn,
    OutputMode,
    SharedBackend,
    SymbolAddr,
    SymbolLookup,
};

pub use error::{BackendError, SessionError, SessionResult};

pub use session::{
    BackendSession,
    PltConfig,
    SessionBuilder,
    SessionConfig,
    SessionStats,
};
