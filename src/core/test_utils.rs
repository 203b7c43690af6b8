//! Test utilities for backend-facing code.
//!
//! [`RecordingBackend`] stands in for a real compiler backend. It records
//! every call in order into a shared [`BackendLog`] and can be told to fail
//! specific operations, which is enough to test registration, helper
//! injection and session ordering without a C compiler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use super::backend::{CompilerBackend, ErrorCallback, OutputMode, SymbolAddr};
use super::error::BackendError;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    SetErrorCallback,
    SetOutputMode(OutputMode),
    SetOptionString(String),
    AddIncludePath(PathBuf),
    AddLibraryPath(PathBuf),
    AddSymbol { name: String, address: SymbolAddr },
    Compile { source: String },
    CompileFile(PathBuf),
    Relocate,
    OutputFile(PathBuf),
}

/// Call history shared between a [`RecordingBackend`] and its test.
#[derive(Debug, Default)]
pub struct BackendLog {
    calls: Mutex<Vec<BackendCall>>,
    symbol_lookups: AtomicUsize,
}

impl BackendLog {
    /// Snapshot of every call so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Names passed to `add_symbol`, in order.
    pub fn added_symbols(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                BackendCall::AddSymbol { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sources passed to `compile`, in order.
    pub fn compiled_sources(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Compile { source } => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    /// Position of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&BackendCall) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(pred)
    }

    /// How many times `get_symbol` was called.
    pub fn symbol_lookups(&self) -> usize {
        self.symbol_lookups.load(Ordering::Relaxed)
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

/// In-memory [`CompilerBackend`] that records instead of compiling.
///
/// Symbols set up with [`define`](Self::define) play the part of the
/// compiled unit's own definitions and become visible through `get_symbol`
/// after `relocate`.
pub struct RecordingBackend {
    log: Arc<BackendLog>,
    callback: Option<ErrorCallback>,
    output_mode: Option<OutputMode>,
    relocated: bool,
    bound: HashMap<String, SymbolAddr>,
    defined: HashMap<String, SymbolAddr>,
    failing_symbols: HashSet<String>,
    failing_markers: Vec<String>,
    compile_messages: Vec<String>,
    reject_options: bool,
}

impl RecordingBackend {
    pub fn new() -> (Self, Arc<BackendLog>) {
        let log = Arc::new(BackendLog::default());
        let backend = Self {
            log: Arc::clone(&log),
            callback: None,
            output_mode: None,
            relocated: false,
            bound: HashMap::new(),
            defined: HashMap::new(),
            failing_symbols: HashSet::new(),
            failing_markers: Vec::new(),
            compile_messages: Vec::new(),
            reject_options: false,
        };
        (backend, log)
    }

    /// Make `add_symbol(name, ..)` fail.
    pub fn fail_symbol(&mut self, name: &str) {
        self.failing_symbols.insert(name.to_string());
    }

    /// Make any compile whose source contains `marker` fail.
    pub fn fail_compile_containing(&mut self, marker: &str) {
        self.failing_markers.push(marker.to_string());
    }

    /// Make `set_option_string` fail.
    pub fn reject_options(&mut self) {
        self.reject_options = true;
    }

    /// Pretend the compiled unit defines `name` at `address`.
    pub fn define(&mut self, name: &str, address: SymbolAddr) {
        self.defined.insert(name.to_string(), address);
    }

    /// Send `message` through the error callback on every compile.
    pub fn emit_on_compile(&mut self, message: &str) {
        self.compile_messages.push(message.to_string());
    }

    /// Address bound through `add_symbol`, if any.
    pub fn bound_symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.bound.get(name).copied()
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    fn check_ready(&self, operation: &'static str) -> Result<(), BackendError> {
        if self.callback.is_none() || self.output_mode.is_none() {
            return Err(BackendError::Rejected {
                operation,
                reason: "error callback and output mode must be set first".to_string(),
            });
        }
        Ok(())
    }

    fn run_compile(&mut self, unit: &str, source: &str) -> Result<(), BackendError> {
        self.check_ready("compile")?;
        if let Some(callback) = &self.callback {
            for message in &self.compile_messages {
                callback(message);
            }
        }
        if self.failing_markers.iter().any(|m| source.contains(m.as_str())) {
            return Err(BackendError::CompileFailed {
                unit: unit.to_string(),
            });
        }
        Ok(())
    }
}

impl CompilerBackend for RecordingBackend {
    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.log.record(BackendCall::SetErrorCallback);
        self.callback = Some(callback);
    }

    fn set_output_mode(&mut self, mode: OutputMode) -> Result<(), BackendError> {
        self.log.record(BackendCall::SetOutputMode(mode));
        self.output_mode = Some(mode);
        Ok(())
    }

    fn set_option_string(&mut self, options: &str) -> Result<(), BackendError> {
        self.log.record(BackendCall::SetOptionString(options.to_string()));
        if self.reject_options {
            return Err(BackendError::Rejected {
                operation: "set_option_string",
                reason: format!("unsupported options '{options}'"),
            });
        }
        Ok(())
    }

    fn add_include_path(&mut self, path: &Path) -> Result<(), BackendError> {
        self.log.record(BackendCall::AddIncludePath(path.to_path_buf()));
        Ok(())
    }

    fn add_library_path(&mut self, path: &Path) -> Result<(), BackendError> {
        self.log.record(BackendCall::AddLibraryPath(path.to_path_buf()));
        Ok(())
    }

    fn add_symbol(&mut self, name: &str, address: SymbolAddr) -> Result<(), BackendError> {
        self.log.record(BackendCall::AddSymbol {
            name: name.to_string(),
            address,
        });
        if self.failing_symbols.contains(name) {
            return Err(BackendError::Rejected {
                operation: "add_symbol",
                reason: format!("'{name}' refused"),
            });
        }
        self.bound.insert(name.to_string(), address);
        Ok(())
    }

    fn compile(&mut self, source: &str) -> Result<(), BackendError> {
        self.log.record(BackendCall::Compile {
            source: source.to_string(),
        });
        self.run_compile("<string>", source)
    }

    fn compile_file(&mut self, path: &Path) -> Result<(), BackendError> {
        self.log.record(BackendCall::CompileFile(path.to_path_buf()));
        let source = std::fs::read_to_string(path).unwrap_or_default();
        self.run_compile(&path.display().to_string(), &source)
    }

    fn relocate(&mut self) -> Result<(), BackendError> {
        self.log.record(BackendCall::Relocate);
        self.check_ready("relocate")?;
        self.relocated = true;
        Ok(())
    }

    fn get_symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.log.symbol_lookups.fetch_add(1, Ordering::Relaxed);
        if !self.relocated {
            return None;
        }
        self.defined.get(name).copied()
    }

    fn output_file(&mut self, path: &Path) -> Result<(), BackendError> {
        self.log.record(BackendCall::OutputFile(path.to_path_buf()));
        match self.output_mode {
            Some(mode) if !mode.is_in_process() => Ok(()),
            _ => Err(BackendError::OutputFailed {
                path: path.to_path_buf(),
            }),
        }
    }
}
