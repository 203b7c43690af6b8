use std::ffi::c_void;
use std::sync::Arc;

use hostlink::core::test_utils::{BackendCall, RecordingBackend};
use hostlink::core::{BackendSession, PltConfig, SessionConfig, SessionError, SymbolAddr};
use hostlink::diagnostics::CollectingSink;
use hostlink::platform::{Arch, OsKind, PlatformProfile};
use hostlink::registry::{BuiltinRegistry, BuiltinSpec, RegistrationReport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn addr(n: usize) -> *const c_void {
    n as *const c_void
}

/// Five builtins; on Windows `fork` and the missing provider drop out.
fn five_builtins(profile: &PlatformProfile) -> Arc<BuiltinRegistry> {
    let specs = vec![
        BuiltinSpec::any("puts", addr(0x1000)),
        BuiltinSpec::any("malloc", addr(0x2000)),
        BuiltinSpec::posix("fork", addr(0x3000)),
        BuiltinSpec::any("strlen", addr(0x4000)),
        BuiltinSpec::any("not_in_this_host", std::ptr::null()),
    ];
    Arc::new(BuiltinRegistry::new(specs, Vec::new(), profile))
}

#[test]
fn end_to_end_registration_helpers_and_lazy_symbol() {
    init_logging();
    let profile = PlatformProfile::new(OsKind::Windows, Arch::X86_64);

    let (mut backend, log) = RecordingBackend::new();
    backend.define("lazy_target", SymbolAddr::new(0x5000).unwrap());

    let mut session = BackendSession::builder(backend)
        .config(
            SessionConfig::default()
                .without_default_search_paths()
                .with_plt(PltConfig::lazy()),
        )
        .registry(five_builtins(&profile))
        .profile(profile)
        .sink(Arc::new(CollectingSink::new()))
        .build()
        .unwrap();

    assert_eq!(
        session.registration(),
        RegistrationReport {
            registered: 3,
            skipped: 2,
            failed: 0
        }
    );
    assert_eq!(log.added_symbols(), vec!["puts", "malloc", "strlen"]);

    let helper_compiles = log
        .compiled_sources()
        .iter()
        .filter(|s| s.contains("__divdi3"))
        .count();
    assert_eq!(helper_compiles, 1);

    let index = session.add_lazy_symbol("lazy_target").unwrap();
    session
        .compile_source("int puts(const char *); int lazy_target(void);\nint main(void) { puts(\"x\"); return lazy_target(); }")
        .unwrap();
    session.relocate().unwrap();

    let table = session.plt().unwrap().clone();
    for _ in 0..10 {
        assert_eq!(table.resolve_index(index).unwrap().get(), 0x5000);
    }

    let stats = table.stats();
    assert_eq!(stats.lazy_resolved, 1);
    assert_eq!(stats.failures, 0);
    assert_eq!(table.get_by_index(index).unwrap().call_count(), 10);
    assert_eq!(log.symbol_lookups(), 1);

    // registration count is unchanged by compiling
    assert_eq!(log.count(|c| matches!(c, BackendCall::AddSymbol { .. })), 3);
}

#[test]
fn registry_failures_do_not_stop_the_session() {
    init_logging();
    let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
    let (mut backend, _log) = RecordingBackend::new();
    backend.fail_symbol("malloc");

    let session = BackendSession::builder(backend)
        .config(SessionConfig::default().without_default_search_paths().without_helpers())
        .registry(five_builtins(&profile))
        .profile(profile)
        .build()
        .unwrap();

    let report = session.registration();
    assert_eq!(report.registered, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
}

#[test]
fn compile_errors_fail_only_that_call() {
    init_logging();
    let profile = PlatformProfile::new(OsKind::Linux, Arch::Other);
    let (mut backend, _log) = RecordingBackend::new();
    backend.fail_compile_containing("syntax error here");

    let sink = Arc::new(CollectingSink::new());
    let mut session = BackendSession::builder(backend)
        .config(SessionConfig::default().without_default_search_paths())
        .registry(five_builtins(&profile))
        .profile(profile)
        .sink(sink)
        .build()
        .unwrap();

    assert!(matches!(
        session.compile_source("syntax error here"),
        Err(SessionError::Compile(_))
    ));
    session.compile_source("int ok;").unwrap();
    session.relocate().unwrap();
}

#[test]
fn arch_without_helpers_injects_nothing() {
    let profile = PlatformProfile::new(OsKind::Linux, Arch::Other);
    let (backend, log) = RecordingBackend::new();
    let session = BackendSession::builder(backend)
        .config(SessionConfig::default().without_default_search_paths())
        .registry(five_builtins(&profile))
        .profile(profile)
        .build()
        .unwrap();

    assert!(!session.helpers().is_failure());
    assert!(log.compiled_sources().is_empty());
}

#[test]
fn stats_report_mentions_every_part() {
    let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
    let (backend, _log) = RecordingBackend::new();
    let mut session = BackendSession::builder(backend)
        .config(
            SessionConfig::default()
                .without_default_search_paths()
                .with_plt(PltConfig::eager()),
        )
        .registry(five_builtins(&profile))
        .profile(profile)
        .build()
        .unwrap();

    session.add_lazy_symbol("puts").unwrap();
    session.relocate().unwrap();

    let text = session.stats().to_string();
    assert!(text.contains("Builtins:    4 registered, 1 skipped, 0 failed"));
    assert!(text.contains("injected 7 helpers"));
    assert!(text.contains("=== PLT Statistics ==="));
}
