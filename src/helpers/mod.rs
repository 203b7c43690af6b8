//! Architecture runtime helpers.
//!
//! The backend emits calls to a few compiler-support routines it never
//! defines itself. Each supported architecture has one C fragment providing
//! them; it is compiled into every backend instance once, after the builtin
//! symbols are registered.

use std::fmt;

use crate::core::{BackendError, CompilerBackend};
use crate::platform::Arch;

/// One architecture's helper source.
#[derive(Debug)]
pub struct HelperFragment {
    pub arch: Arch,
    /// Routines the fragment defines.
    pub symbols: &'static [&'static str],
    pub source: &'static str,
}

static AARCH64_TF: HelperFragment = HelperFragment {
    arch: Arch::Aarch64,
    symbols: &[
        "__extenddftf2",
        "__trunctfdf2",
        "__lttf2",
        "__gttf2",
        "__letf2",
        "__getf2",
    ],
    source: include_str!("aarch64_tf.c"),
};

static X86_64_DI: HelperFragment = HelperFragment {
    arch: Arch::X86_64,
    symbols: &[
        "__divdi3",
        "__moddi3",
        "__udivdi3",
        "__umoddi3",
        "__ashldi3",
        "__ashrdi3",
        "__lshrdi3",
    ],
    source: include_str!("x86_64_di.c"),
};

/// Helper fragment for `arch`, if it needs one.
pub fn fragment_for(arch: Arch) -> Option<&'static HelperFragment> {
    match arch {
        Arch::Aarch64 => Some(&AARCH64_TF),
        Arch::X86_64 => Some(&X86_64_DI),
        Arch::Other => None,
    }
}

/// Result of one injection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// No fragment for this architecture.
    NotNeeded,
    Injected { symbols: usize },
    /// The fragment did not compile. Not fatal to the session.
    Failed(BackendError),
}

impl InjectionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, InjectionOutcome::Failed(_))
    }
}

impl fmt::Display for InjectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionOutcome::NotNeeded => f.write_str("not needed"),
            InjectionOutcome::Injected { symbols } => write!(f, "injected {symbols} helpers"),
            InjectionOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Compile the helper fragment for `arch` into `backend`.
pub fn inject<B: CompilerBackend + ?Sized>(backend: &mut B, arch: Arch) -> InjectionOutcome {
    let Some(fragment) = fragment_for(arch) else {
        log::debug!("No runtime helpers needed for {}", arch);
        return InjectionOutcome::NotNeeded;
    };

    match backend.compile(fragment.source) {
        Ok(()) => {
            log::debug!("Injected {} runtime helpers for {}", fragment.symbols.len(), arch);
            InjectionOutcome::Injected {
                symbols: fragment.symbols.len(),
            }
        }
        Err(e) => {
            log::warn!("Runtime helpers for {} failed to compile: {}", arch, e);
            InjectionOutcome::Failed(e)
        }
    }
}
