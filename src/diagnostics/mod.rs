//! Backend diagnostic classification.
//!
//! The backend reports every problem as one line of text. [`classify`] decides
//! what that line means for the host: dropped, shown as a warning, or shown as
//! an error. Classification never affects whether a compile succeeded; that is
//! decided by the backend's return code alone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::ErrorCallback;

/// Prefix of every line this crate prints for a diagnostic.
pub const MESSAGE_PREFIX: &str = "hostlink";

/// Outcome of classifying one backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Suppressed,
    Warning,
    Error,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Suppressed => "suppressed",
            Disposition::Warning => "warning",
            Disposition::Error => "error",
        };
        f.write_str(name)
    }
}

/// Classify a raw backend message. First matching rule wins.
pub fn classify(message: &str) -> Disposition {
    if message.contains("warning: implicit declaration") {
        Disposition::Suppressed
    } else if message.contains("warning:") {
        Disposition::Warning
    } else if message.contains("include file") && message.contains("not found") {
        Disposition::Warning
    } else if message.contains("defined twice") || message.contains("undefined symbol") {
        Disposition::Warning
    } else {
        Disposition::Error
    }
}

/// Receives classified diagnostics. Suppressed messages never reach a sink.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, disposition: Disposition, message: &str);
}

/// Prints diagnostics to standard error with the crate prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, disposition: Disposition, message: &str) {
        eprintln!("{MESSAGE_PREFIX}: {disposition}: {message}");
    }
}

/// One recorded diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub disposition: Disposition,
    pub message: String,
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.filtered(Disposition::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.filtered(Disposition::Error)
    }

    fn filtered(&self, disposition: Disposition) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|d| d.disposition == disposition)
            .map(|d| d.message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, disposition: Disposition, message: &str) {
        self.events.lock().push(Diagnostic {
            disposition,
            message: message.to_string(),
        });
    }
}

/// Snapshot of classifier counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub suppressed: u64,
    pub warnings: u64,
    pub errors: u64,
}

/// Error sink attached to a backend instance.
///
/// Cheap to clone; clones share counters and sink.
#[derive(Clone)]
pub struct DiagnosticClassifier {
    inner: Arc<ClassifierInner>,
}

struct ClassifierInner {
    sink: Arc<dyn DiagnosticSink>,
    suppressed: AtomicU64,
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl DiagnosticClassifier {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            inner: Arc::new(ClassifierInner {
                sink,
                suppressed: AtomicU64::new(0),
                warnings: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    /// Classify one message, count it and forward it to the sink.
    pub fn on_message(&self, raw: &str) -> Disposition {
        let disposition = classify(raw);
        let counter = match disposition {
            Disposition::Suppressed => &self.inner.suppressed,
            Disposition::Warning => &self.inner.warnings,
            Disposition::Error => &self.inner.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if disposition != Disposition::Suppressed {
            self.inner.sink.emit(disposition, raw);
        }
        disposition
    }

    pub fn counts(&self) -> DiagnosticCounts {
        DiagnosticCounts {
            suppressed: self.inner.suppressed.load(Ordering::Relaxed),
            warnings: self.inner.warnings.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    /// Callback form for [`crate::core::CompilerBackend::set_error_callback`].
    pub fn callback(&self) -> ErrorCallback {
        let this = self.clone();
        Box::new(move |message: &str| {
            this.on_message(message);
        })
    }
}

impl Default for DiagnosticClassifier {
    fn default() -> Self {
        Self::new(Arc::new(StderrSink))
    }
}

impl fmt::Debug for DiagnosticClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticClassifier")
            .field("counts", &self.counts())
            .finish()
    }
}
