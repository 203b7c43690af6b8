//! Compiler backend contract.
//!
//! The C parser and code generator live outside this crate. Everything the
//! runtime needs from them is expressed by [`CompilerBackend`]; the lazy symbol
//! table only needs the narrower [`SymbolLookup`] view.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::BackendError;

/// A non-null address of a host or compiled symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolAddr(NonZeroUsize);

impl SymbolAddr {
    /// Wrap a raw address; `None` for null.
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wrap a raw pointer; `None` for null.
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// The address as an integer.
    pub fn get(self) -> usize {
        self.0.get()
    }

    /// The address as an untyped pointer.
    pub fn as_ptr(self) -> *const c_void {
        self.0.get() as *const c_void
    }
}

impl fmt::Display for SymbolAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// What the backend produces from the compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Relocate into this process and run in place.
    #[default]
    Memory,
    /// Relocatable object file.
    Object,
    /// Standalone executable.
    Executable,
    /// Preprocess only.
    Preprocess,
}

impl OutputMode {
    /// Whether the unit is relocated into the host process.
    pub fn is_in_process(self) -> bool {
        matches!(self, OutputMode::Memory)
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputMode::Memory => "memory",
            OutputMode::Object => "object",
            OutputMode::Executable => "executable",
            OutputMode::Preprocess => "preprocess",
        };
        f.write_str(name)
    }
}

/// Receives every raw diagnostic line the backend produces.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Contract between the runtime and an external C compiler backend.
///
/// One value is one backend instance for one compilation unit. The error
/// callback and output mode must be set before the first compile call; the
/// session manager guarantees that ordering.
pub trait CompilerBackend: Send {
    /// Install the sink for raw error and warning text.
    fn set_error_callback(&mut self, callback: ErrorCallback);

    /// Select what the unit is compiled into.
    fn set_output_mode(&mut self, mode: OutputMode) -> Result<(), BackendError>;

    /// Apply a command-line style option string.
    fn set_option_string(&mut self, options: &str) -> Result<(), BackendError>;

    fn add_include_path(&mut self, path: &Path) -> Result<(), BackendError>;

    fn add_library_path(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Bind `name` to a host address for relocation.
    fn add_symbol(&mut self, name: &str, address: SymbolAddr) -> Result<(), BackendError>;

    /// Compile a unit from source text.
    fn compile(&mut self, source: &str) -> Result<(), BackendError>;

    /// Compile a unit from a file on disk.
    fn compile_file(&mut self, path: &Path) -> Result<(), BackendError>;

    /// Relocate compiled code into the process.
    fn relocate(&mut self) -> Result<(), BackendError>;

    /// Look up a symbol of the compiled unit (after relocation).
    fn get_symbol(&self, name: &str) -> Option<SymbolAddr>;

    /// Address of a callable entry point of the compiled unit.
    fn get_compiled_entry_point(&self, name: &str) -> Option<SymbolAddr> {
        self.get_symbol(name)
    }

    /// Write the unit to disk in object/executable mode.
    fn output_file(&mut self, path: &Path) -> Result<(), BackendError> {
        let _ = path;
        Err(BackendError::Unsupported {
            operation: "output_file",
        })
    }
}

/// Name-to-address lookup used by the lazy symbol table.
///
/// Calls may come from any thread running compiled code.
pub trait SymbolLookup: Send + Sync {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolAddr>;
}

/// A backend shared between its session and the lazy symbol table.
pub type SharedBackend<B> = Arc<Mutex<B>>;

/// [`SymbolLookup`] over a shared backend's `get_symbol`.
pub struct BackendLookup<B> {
    backend: SharedBackend<B>,
}

impl<B> BackendLookup<B> {
    pub fn new(backend: SharedBackend<B>) -> Self {
        Self { backend }
    }
}

impl<B: CompilerBackend> SymbolLookup for BackendLookup<B> {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.backend.lock().get_symbol(name)
    }
}

/// [`SymbolLookup`] backed by a closure.
pub struct LookupFn<F>(pub F);

impl<F> SymbolLookup for LookupFn<F>
where
    F: Fn(&str) -> Option<SymbolAddr> + Send + Sync,
{
    fn lookup_symbol(&self, name: &str) -> Option<SymbolAddr> {
        (self.0)(name)
    }
}
