//! hostlink - run-time C compilation linked against the host process.
//!
//! hostlink configures an external C compiler backend so that freshly compiled
//! code can call back into the host's own functions as if everything had been
//! statically linked together.
//!
//! # Primary Usage
//!
//! ```ignore
//! use hostlink::core::{BackendSession, SessionConfig};
//! use hostlink::tcc::TccLibrary;
//!
//! let tcc = TccLibrary::open_default()?;
//! let mut session = BackendSession::create(tcc.instance()?, SessionConfig::from_env())?;
//! session.compile_source("int main(void) { return puts(\"hi\") < 0; }")?;
//! session.relocate()?;
//! let status = unsafe { session.run_main(&["demo".to_string()])? };
//! ```
//!
//! # Architecture
//!
//! - [`platform`] - OS/architecture detection, option string, search paths
//! - [`registry`] - builtin host symbols and the module loader
//! - [`helpers`] - per-architecture runtime helper sources
//! - [`diagnostics`] - backend message classification
//! - [`plt`] - lazy symbol table
//! - [`core`] - backend contract and session manager
//! - [`x64`] - x86-64 trampolines, call stubs and ABI thunks
//! - [`tcc`] - `libtcc` backend

pub mod core;
pub mod diagnostics;
pub mod helpers;
pub mod platform;
pub mod plt;
pub mod registry;
pub mod tcc;
pub mod x64;

pub use crate::core::{
    BackendError, BackendSession, CompilerBackend, OutputMode, PltConfig, SessionConfig,
    SessionError, SessionResult, SessionStats, SymbolAddr, SymbolLookup,
};
pub use crate::diagnostics::{classify, DiagnosticClassifier, Disposition};
pub use crate::platform::{Arch, OsKind, PlatformProfile};
pub use crate::plt::{PltEntry, PltError, PltStats, PltTable};
pub use crate::registry::{BuiltinRegistry, RegistrationReport};
