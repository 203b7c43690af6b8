//! x86-64 machine code emitted at run time.
//!
//! This module contains all x86-64 specific code:
//! - Executable memory mappings
//! - The lazy-binding resolver trampoline and per-entry call stubs
//! - System V to Microsoft x64 bridging thunks
//!
//! Everything is assembled with iced-x86 at address zero; the generated code
//! is position independent and copied into its final mapping afterwards.

pub mod exec_memory;
pub mod stubs;
pub mod thunk;

use iced_x86::code_asm::CodeAssembler;
use iced_x86::IcedError;
use thiserror::Error;

pub use exec_memory::ExecMemory;
pub use stubs::{ResolverTrampoline, StubBlock, STUB_SLOT_SIZE};
pub use thunk::MsAbiThunks;

/// Errors from emitting or mapping machine code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("could not map {size} bytes of executable memory: {reason}")]
    Map { size: usize, reason: String },

    #[error("could not make code executable: {reason}")]
    Protect { reason: String },

    #[error("executable stubs are not supported on this host")]
    Unsupported,
}

impl From<IcedError> for StubError {
    fn from(e: IcedError) -> Self {
        StubError::Assembly(e.to_string())
    }
}

/// Run `build` against a fresh 64-bit assembler and return the encoded bytes.
pub(crate) fn assemble<F>(build: F) -> Result<Vec<u8>, StubError>
where
    F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
{
    let mut asm = CodeAssembler::new(64)?;
    build(&mut asm)?;
    Ok(asm.assemble(0)?)
}

/// Whether this host can run the emitted code.
pub const fn host_supported() -> bool {
    cfg!(all(unix, target_arch = "x86_64"))
}
