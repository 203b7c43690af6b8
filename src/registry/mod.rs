// This module holds the builtin symbol registry: the fixed set of host functions and
// globals made callable from freshly compiled code. The host table is described as a list
// of BuiltinSpec values, each tagged with the capability it needs. Building a registry
// filters that list once against a PlatformProfile into an ordered, immutable sequence plus
// a hashbrown name index, so nothing is null-checked at registration time. Registration
// pushes the host globals first and the table second into a CompilerBackend; a failed
// individual registration is logged and counted but never aborts the batch.

//! Builtin symbol registry.

pub mod loader;
mod table;
pub mod wrappers;

use std::ffi::c_void;
use std::fmt;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::core::{CompilerBackend, SymbolAddr};
use crate::platform::PlatformProfile;

pub use loader::{LoaderError, ModuleLoader, SharedLibraryLoader};

/// Platform capability a builtin depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Any,
    /// Unavailable on a Windows profile.
    Posix,
}

impl Capability {
    pub fn available_on(self, profile: &PlatformProfile) -> bool {
        match self {
            Capability::Any => true,
            Capability::Posix => profile.os.is_posix(),
        }
    }
}

/// One row of a builtin table, before platform filtering.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinSpec {
    pub name: &'static str,
    pub requires: Capability,
    /// `None` when the host does not provide the symbol.
    pub provider: Option<SymbolAddr>,
}

impl BuiltinSpec {
    pub fn new(name: &'static str, requires: Capability, provider: *const c_void) -> Self {
        Self {
            name,
            requires,
            provider: SymbolAddr::from_ptr(provider),
        }
    }

    pub fn any(name: &'static str, provider: *const c_void) -> Self {
        Self::new(name, Capability::Any, provider)
    }

    pub fn posix(name: &'static str, provider: *const c_void) -> Self {
        Self::new(name, Capability::Posix, provider)
    }

    /// Address if this entry can be used under `profile`.
    fn resolve_for(&self, profile: &PlatformProfile) -> Option<SymbolAddr> {
        self.provider.filter(|_| self.requires.available_on(profile))
    }
}

/// An available builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinSymbol {
    pub name: &'static str,
    pub address: SymbolAddr,
}

/// Outcome of pushing a registry into one backend instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationReport {
    pub registered: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for RegistrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} registered, {} skipped, {} failed",
            self.registered, self.skipped, self.failed
        )
    }
}

/// Immutable, platform-filtered set of builtins.
#[derive(Debug, Clone)]
pub struct BuiltinRegistry {
    globals: Vec<BuiltinSymbol>,
    symbols: Vec<BuiltinSymbol>,
    index: HashMap<&'static str, SymbolAddr>,
    unavailable: Vec<&'static str>,
    /// Bind `errno` to the registering thread's slot.
    thread_errno: bool,
}

static HOST: Lazy<BuiltinRegistry> =
    Lazy::new(|| BuiltinRegistry::for_profile(PlatformProfile::current()));

impl BuiltinRegistry {
    /// Filter `specs` and `globals` for `profile`.
    pub fn new(specs: Vec<BuiltinSpec>, globals: Vec<BuiltinSpec>, profile: &PlatformProfile) -> Self {
        let mut unavailable = Vec::new();
        let mut filter = |list: Vec<BuiltinSpec>| -> Vec<BuiltinSymbol> {
            list.into_iter()
                .filter_map(|spec| match spec.resolve_for(profile) {
                    Some(address) => Some(BuiltinSymbol {
                        name: spec.name,
                        address,
                    }),
                    None => {
                        log::debug!("Builtin '{}' unavailable on {}", spec.name, profile.os);
                        unavailable.push(spec.name);
                        None
                    }
                })
                .collect()
        };
        let globals = filter(globals);
        let symbols = filter(specs);

        let mut index = HashMap::with_capacity(globals.len() + symbols.len());
        for symbol in globals.iter().chain(symbols.iter()) {
            index.entry(symbol.name).or_insert(symbol.address);
        }

        Self {
            globals,
            symbols,
            index,
            unavailable,
            thread_errno: false,
        }
    }

    /// The host table filtered for `profile`.
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        Self {
            thread_errno: true,
            ..Self::new(table::host_builtins(), table::host_globals(), profile)
        }
    }

    /// Address of `errno` as seen from the calling thread.
    pub fn errno_slot(&self) -> Option<SymbolAddr> {
        if self.thread_errno {
            table::thread_errno()
        } else {
            None
        }
    }

    /// Process-wide registry for the detected platform.
    pub fn host() -> &'static BuiltinRegistry {
        &HOST
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolAddr> {
        match self.index.get(name) {
            Some(address) => Some(*address),
            None if name == "errno" => self.errno_slot(),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn globals(&self) -> &[BuiltinSymbol] {
        &self.globals
    }

    /// Available table entries, in table order.
    pub fn symbols(&self) -> &[BuiltinSymbol] {
        &self.symbols
    }

    /// Names filtered out for this platform.
    pub fn unavailable(&self) -> &[&'static str] {
        &self.unavailable
    }

    pub fn len(&self) -> usize {
        let errno = self.errno_slot().is_some() && !self.index.contains_key("errno");
        self.globals.len() + self.symbols.len() + usize::from(errno)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push every available builtin into `backend`, globals first.
    pub fn register<B: CompilerBackend + ?Sized>(&self, backend: &mut B) -> RegistrationReport {
        let mut report = RegistrationReport {
            skipped: self.unavailable.len(),
            ..RegistrationReport::default()
        };

        // errno is resolved here, on the thread that owns the session.
        let errno = self
            .errno_slot()
            .filter(|_| !self.index.contains_key("errno"))
            .map(|address| ("errno", address));
        let globals = self.globals.iter().map(|s| (s.name, s.address));
        let symbols = self.symbols.iter().map(|s| (s.name, s.address));

        for (name, address) in globals.chain(errno).chain(symbols) {
            match backend.add_symbol(name, address) {
                Ok(()) => {
                    log::trace!("Registered builtin '{}' at {}", name, address);
                    report.registered += 1;
                }
                Err(e) => {
                    log::warn!("Failed to register builtin '{}': {}", name, e);
                    report.failed += 1;
                }
            }
        }

        log::debug!("Builtin registration: {}", report);
        report
    }
}
