// This module provides the backend session manager, the orchestrator that turns a bare
// CompilerBackend into one configured instance for one compilation unit. Building a
// session runs a fixed sequence: the diagnostic classifier is attached as the error sink,
// the output mode is selected, the platform option string and search paths are applied,
// the builtin registry is pushed, the architecture's runtime helpers are compiled once,
// and finally the optional lazy symbol table is created and activated. Configuration
// failures abort the build; registration and helper failures are logged and recorded.
// After build-up the session compiles sources, binds lazy call stubs, relocates (resolving
// every PLT entry eagerly when asked to), looks up entry points and runs main. The
// backend is shared with the PLT through Arc<Mutex<_>> so resolver calls arriving from
// threads running compiled code can query it; the session never holds that lock while
// calling into the table. SessionStats gathers the per-session counters for reporting.

//! Backend session management.
//!
//! A [`BackendSession`] owns one configured backend instance for the lifetime
//! of one compilation unit (or one REPL, which keeps a session alive across
//! evaluations).

use std::ffi::{c_char, c_int, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

use super::backend::{CompilerBackend, OutputMode, SharedBackend, SymbolAddr, SymbolLookup};
use super::error::{BackendError, SessionError, SessionResult};
use crate::diagnostics::{DiagnosticClassifier, DiagnosticCounts, DiagnosticSink, StderrSink};
use crate::helpers::{self, InjectionOutcome};
use crate::platform::{self, PathKind, PlatformProfile};
use crate::plt::{self, PltEntry, PltStats, PltTable};
use crate::registry::loader::SystemLibraries;
use crate::registry::{BuiltinRegistry, RegistrationReport};
use crate::x64::{StubBlock, StubError};

/// Environment variable selecting the lazy symbol table mode.
pub const PLT_MODE_VAR: &str = "HOSTLINK_PLT";
/// Environment variable carrying extra backend options.
pub const OPTIONS_VAR: &str = "HOSTLINK_OPTIONS";

/// Lazy symbol table settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PltConfig {
    /// Resolve on first call; otherwise everything is resolved at relocation.
    pub lazy: bool,
    /// 0 selects [`plt::DEFAULT_CAPACITY`].
    pub initial_capacity: usize,
}

impl PltConfig {
    pub fn lazy() -> Self {
        Self {
            lazy: true,
            initial_capacity: 0,
        }
    }

    pub fn eager() -> Self {
        Self {
            lazy: false,
            initial_capacity: 0,
        }
    }
}

impl Default for PltConfig {
    fn default() -> Self {
        Self::lazy()
    }
}

/// How a session configures its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub output_mode: OutputMode,
    /// Appended after the platform options.
    pub extra_options: Vec<String>,
    /// Apply the platform's include and library search lists.
    pub default_search_paths: bool,
    pub include_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    pub inject_helpers: bool,
    /// `None` disables the lazy symbol table.
    pub plt: Option<PltConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::Memory,
            extra_options: Vec::new(),
            default_search_paths: true,
            include_paths: Vec::new(),
            library_paths: Vec::new(),
            inject_helpers: true,
            plt: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `HOSTLINK_PLT` and `HOSTLINK_OPTIONS`.
    pub fn from_env() -> Self {
        let plt = std::env::var(PLT_MODE_VAR).ok();
        let options = std::env::var(OPTIONS_VAR).ok();
        Self::default().with_env_values(plt.as_deref(), options.as_deref())
    }

    /// Apply raw environment values.
    ///
    /// `plt` accepts `off`, `lazy` or `eager` (case-insensitive); anything
    /// else is ignored with a warning. `options` is split on whitespace.
    pub fn with_env_values(mut self, plt: Option<&str>, options: Option<&str>) -> Self {
        if let Some(mode) = plt {
            match mode.trim().to_ascii_lowercase().as_str() {
                "" | "off" | "0" => self.plt = None,
                "lazy" | "1" => self.plt = Some(PltConfig::lazy()),
                "eager" => self.plt = Some(PltConfig::eager()),
                other => log::warn!("Ignoring {}={:?}", PLT_MODE_VAR, other),
            }
        }
        if let Some(options) = options {
            self.extra_options
                .extend(options.split_whitespace().map(str::to_string));
        }
        self
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    pub fn with_include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn without_default_search_paths(mut self) -> Self {
        self.default_search_paths = false;
        self
    }

    pub fn without_helpers(mut self) -> Self {
        self.inject_helpers = false;
        self
    }

    pub fn with_plt(mut self, plt: PltConfig) -> Self {
        self.plt = Some(plt);
        self
    }
}

/// Per-session counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub registration: RegistrationReport,
    pub helpers: InjectionOutcome,
    pub diagnostics: DiagnosticCounts,
    pub plt: Option<PltStats>,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session ===")?;
        writeln!(f, "Builtins:    {}", self.registration)?;
        writeln!(f, "Helpers:     {}", self.helpers)?;
        writeln!(
            f,
            "Diagnostics: {} warnings, {} errors, {} suppressed",
            self.diagnostics.warnings, self.diagnostics.errors, self.diagnostics.suppressed
        )?;
        if let Some(plt) = &self.plt {
            write!(f, "{plt}")?;
        }
        Ok(())
    }
}

/// Resolver used by a session's lazy symbol table.
///
/// Order: the compiled unit, then the builtin registry, then the host's C
/// runtime libraries. Names bound to call stubs skip the compiled unit,
/// whose symbol table would hand back the stub itself.
struct SessionLookup<B> {
    backend: SharedBackend<B>,
    registry: Arc<BuiltinRegistry>,
    stubbed: Arc<RwLock<HashSet<String>>>,
}

impl<B: CompilerBackend> SymbolLookup for SessionLookup<B> {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolAddr> {
        if !self.stubbed.read().contains(name) {
            if let Some(addr) = self.backend.lock().get_symbol(name) {
                return Some(addr);
            }
        }
        self.registry
            .lookup(name)
            .or_else(|| SystemLibraries::host().lookup_symbol(name))
    }
}

/// Call stubs handed to the backend, with the entries they point into.
struct BoundStubs {
    _block: StubBlock,
    _entries: Vec<Arc<PltEntry>>,
}

/// Builder for a [`BackendSession`].
pub struct SessionBuilder<B> {
    backend: B,
    config: SessionConfig,
    profile: Option<PlatformProfile>,
    registry: Option<Arc<BuiltinRegistry>>,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl<B: CompilerBackend + 'static> SessionBuilder<B> {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure for `profile` instead of the detected platform.
    pub fn profile(mut self, profile: PlatformProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Register `registry` instead of the host table.
    pub fn registry(mut self, registry: Arc<BuiltinRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Send diagnostics to `sink` instead of standard error.
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run the configuration sequence.
    pub fn build(self) -> SessionResult<BackendSession<B>> {
        let SessionBuilder {
            mut backend,
            config,
            profile,
            registry,
            sink,
        } = self;

        let profile = profile.unwrap_or_else(|| PlatformProfile::current().clone());
        let registry = registry.unwrap_or_else(|| {
            if profile == *PlatformProfile::current() {
                Arc::new(BuiltinRegistry::host().clone())
            } else {
                Arc::new(BuiltinRegistry::for_profile(&profile))
            }
        });
        let classifier = DiagnosticClassifier::new(sink.unwrap_or_else(|| Arc::new(StderrSink)));

        log::debug!("Configuring backend for {} ({})", profile, config.output_mode);
        backend.set_error_callback(classifier.callback());
        backend
            .set_output_mode(config.output_mode)
            .map_err(|source| SessionError::Configuration {
                step: "setting the output mode",
                source,
            })?;

        let options = profile.option_string_with(&config.extra_options);
        log::debug!("Backend options: {}", options);
        backend
            .set_option_string(&options)
            .map_err(|source| SessionError::Configuration {
                step: "applying the option string",
                source,
            })?;

        apply_search_paths(&mut backend, &config, &profile);

        let registration = registry.register(&mut backend);

        let helpers = if config.inject_helpers {
            helpers::inject(&mut backend, profile.arch)
        } else {
            InjectionOutcome::NotNeeded
        };

        let backend = Arc::new(Mutex::new(backend));
        let stubbed = Arc::new(RwLock::new(HashSet::new()));
        let plt = config.plt.map(|plt_config| {
            let lookup = SessionLookup {
                backend: Arc::clone(&backend),
                registry: Arc::clone(&registry),
                stubbed: Arc::clone(&stubbed),
            };
            PltTable::init(Arc::new(lookup), plt_config.lazy, plt_config.initial_capacity)
        });

        Ok(BackendSession {
            backend,
            config,
            profile,
            classifier,
            registry,
            registration,
            helpers,
            plt,
            stubbed,
            stubs: Vec::new(),
            relocated: false,
        })
    }
}

fn apply_search_paths<B: CompilerBackend>(
    backend: &mut B,
    config: &SessionConfig,
    profile: &PlatformProfile,
) {
    let lists = |kind: PathKind| -> Vec<PathBuf> {
        if !config.default_search_paths {
            return Vec::new();
        }
        if profile == PlatformProfile::current() {
            platform::search_paths(kind)
        } else {
            let env_value = std::env::var(kind.env_var()).ok();
            platform::search_paths_from(kind, profile, env_value.as_deref())
        }
    };

    let includes = lists(PathKind::Include)
        .into_iter()
        .chain(config.include_paths.iter().cloned());
    for path in includes {
        if let Err(e) = backend.add_include_path(&path) {
            log::warn!("Could not add include path {}: {}", path.display(), e);
        }
    }

    let libraries = lists(PathKind::Library)
        .into_iter()
        .chain(config.library_paths.iter().cloned());
    for path in libraries {
        if let Err(e) = backend.add_library_path(&path) {
            log::warn!("Could not add library path {}: {}", path.display(), e);
        }
    }
}

/// One configured backend instance.
pub struct BackendSession<B: CompilerBackend> {
    backend: SharedBackend<B>,
    config: SessionConfig,
    profile: PlatformProfile,
    classifier: DiagnosticClassifier,
    registry: Arc<BuiltinRegistry>,
    registration: RegistrationReport,
    helpers: InjectionOutcome,
    plt: Option<PltTable>,
    stubbed: Arc<RwLock<HashSet<String>>>,
    stubs: Vec<BoundStubs>,
    relocated: bool,
}

impl<B: CompilerBackend + 'static> BackendSession<B> {
    /// Start configuring a session around `backend`.
    pub fn builder(backend: B) -> SessionBuilder<B> {
        SessionBuilder {
            backend,
            config: SessionConfig::default(),
            profile: None,
            registry: None,
            sink: None,
        }
    }

    /// Configure `backend` for the detected platform.
    pub fn create(backend: B, config: SessionConfig) -> SessionResult<Self> {
        Self::builder(backend).config(config).build()
    }

    /// Like [`create`](Self::create), for a backend that can fail to come up.
    pub fn create_with(
        factory: impl FnOnce() -> Result<B, BackendError>,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let backend = factory().map_err(|e| SessionError::BackendCreation {
            reason: e.to_string(),
        })?;
        Self::create(backend, config)
    }

    /// Compile source text into the unit.
    pub fn compile_source(&mut self, source: &str) -> SessionResult<()> {
        self.backend.lock().compile(source).map_err(SessionError::Compile)
    }

    /// Compile a file into the unit.
    pub fn compile_file(&mut self, path: &Path) -> SessionResult<()> {
        log::debug!("Compiling {}", path.display());
        self.backend
            .lock()
            .compile_file(path)
            .map_err(SessionError::Compile)
    }

    /// Register `name` with the lazy symbol table.
    pub fn add_lazy_symbol(&mut self, name: &str) -> SessionResult<usize> {
        Ok(self.plt_table()?.add_symbol(name)?)
    }

    /// Register every undefined symbol of a relocatable object.
    pub fn register_object_imports(&mut self, data: &[u8]) -> SessionResult<Vec<usize>> {
        Ok(plt::register_undefined(self.plt_table()?, data)?)
    }

    /// Bind every lazy entry without a call stub to a fresh one.
    ///
    /// Each name is handed to the backend with its stub's address, so calls
    /// from code compiled afterwards go through the table. Returns how many
    /// stubs were bound.
    pub fn bind_lazy_stubs(&mut self) -> SessionResult<usize> {
        let table = self.plt_table()?.clone();
        if !plt::machine_stubs_available() {
            return Err(StubError::Unsupported.into());
        }

        let pending: Vec<Arc<PltEntry>> = {
            let stubbed = self.stubbed.read();
            table
                .entries()
                .into_iter()
                .filter(|entry| !stubbed.contains(entry.name()))
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let ptrs: Vec<usize> = pending.iter().map(|e| e.as_ptr() as usize).collect();
        let block = StubBlock::new(&ptrs)?;

        let mut bound = 0;
        {
            let mut backend = self.backend.lock();
            let mut stubbed = self.stubbed.write();
            for (i, entry) in pending.iter().enumerate() {
                let Some(addr) = block.stub_address(i).and_then(SymbolAddr::new) else {
                    continue;
                };
                match backend.add_symbol(entry.name(), addr) {
                    Ok(()) => {
                        stubbed.insert(entry.name().to_string());
                        bound += 1;
                    }
                    Err(e) => log::warn!("Could not bind stub for '{}': {}", entry.name(), e),
                }
            }
        }

        log::debug!("Bound {} lazy call stubs", bound);
        self.stubs.push(BoundStubs {
            _block: block,
            _entries: pending,
        });
        Ok(bound)
    }

    /// Relocate the unit into this process.
    ///
    /// An eager lazy symbol table resolves every entry here.
    pub fn relocate(&mut self) -> SessionResult<()> {
        if !self.config.output_mode.is_in_process() {
            return Err(SessionError::InvalidState(format!(
                "cannot relocate in {} mode",
                self.config.output_mode
            )));
        }
        self.backend.lock().relocate().map_err(SessionError::Relocation)?;
        self.relocated = true;

        if let Some(table) = &self.plt {
            if !table.is_lazy() {
                table.resolve_all();
            }
        }
        Ok(())
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// Address of a compiled entry point.
    pub fn entry_point(&self, name: &str) -> SessionResult<SymbolAddr> {
        if !self.relocated {
            return Err(SessionError::InvalidState(
                "entry points are only available after relocation".to_string(),
            ));
        }
        self.backend
            .lock()
            .get_compiled_entry_point(name)
            .ok_or_else(|| SessionError::EntryPointNotFound {
                name: name.to_string(),
            })
    }

    /// Call the unit's `main(argc, argv)`.
    ///
    /// # Safety
    ///
    /// The compiled `main` must have the C signature
    /// `int main(int, char **)` and must not violate memory safety.
    pub unsafe fn run_main(&self, args: &[String]) -> SessionResult<i32> {
        let entry = self.entry_point("main")?;

        let owned: Vec<CString> = args
            .iter()
            .map(|a| CString::new(a.replace('\0', "")))
            .collect::<Result<_, _>>()
            .map_err(|e| SessionError::InvalidState(e.to_string()))?;
        let mut argv: Vec<*mut c_char> = owned.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        argv.push(std::ptr::null_mut());

        type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;
        let main: MainFn = std::mem::transmute::<*const std::ffi::c_void, MainFn>(entry.as_ptr());
        // No backend lock may be held here; compiled code can reenter through the table.
        Ok(main(owned.len() as c_int, argv.as_mut_ptr()))
    }

    /// Write the unit to `path` (object and executable modes).
    pub fn output_file(&mut self, path: &Path) -> SessionResult<()> {
        if self.config.output_mode.is_in_process() {
            return Err(SessionError::InvalidState(
                "output files need object or executable mode".to_string(),
            ));
        }
        self.backend
            .lock()
            .output_file(path)
            .map_err(SessionError::Output)
    }

    fn plt_table(&self) -> SessionResult<&PltTable> {
        self.plt.as_ref().ok_or(SessionError::PltDisabled)
    }
}

impl<B: CompilerBackend> BackendSession<B> {
    pub fn plt(&self) -> Option<&PltTable> {
        self.plt.as_ref()
    }

    pub fn backend(&self) -> &SharedBackend<B> {
        &self.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    pub fn registry(&self) -> &BuiltinRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &DiagnosticClassifier {
        &self.classifier
    }

    pub fn registration(&self) -> RegistrationReport {
        self.registration
    }

    pub fn helpers(&self) -> &InjectionOutcome {
        &self.helpers
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            registration: self.registration,
            helpers: self.helpers.clone(),
            diagnostics: self.classifier.counts(),
            plt: self.plt.as_ref().map(PltTable::stats),
        }
    }
}

impl<B: CompilerBackend> Drop for BackendSession<B> {
    fn drop(&mut self) {
        if let Some(table) = self.plt.take() {
            table.teardown();
        }
    }
}

impl<B: CompilerBackend> fmt::Debug for BackendSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("profile", &self.profile)
            .field("output_mode", &self.config.output_mode)
            .field("registration", &self.registration)
            .field("relocated", &self.relocated)
            .field("plt", &self.plt)
            .finish()
    }
}
