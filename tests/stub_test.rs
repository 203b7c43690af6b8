//! Lazy call stubs executed for real. x86-64 Linux only.
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::ffi::c_int;
use std::sync::Arc;

use hostlink::core::test_utils::RecordingBackend;
use hostlink::core::{BackendSession, PltConfig, SessionConfig, SymbolAddr};
use hostlink::platform::{Arch, OsKind, PlatformProfile};
use hostlink::plt::{self, EntryState, PltTable};
use hostlink::registry::{BuiltinRegistry, BuiltinSpec};
use hostlink::x64::{MsAbiThunks, StubBlock};

extern "C" fn triple(x: c_int) -> c_int {
    x * 3
}

fn session_with(registry: Vec<BuiltinSpec>) -> BackendSession<RecordingBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
    let registry = Arc::new(BuiltinRegistry::new(registry, Vec::new(), &profile));
    let (backend, _log) = RecordingBackend::new();
    BackendSession::builder(backend)
        .config(
            SessionConfig::default()
                .without_default_search_paths()
                .without_helpers()
                .with_plt(PltConfig::lazy()),
        )
        .registry(registry)
        .profile(profile)
        .build()
        .unwrap()
}

fn stub_of(session: &BackendSession<RecordingBackend>, name: &str) -> usize {
    session
        .backend()
        .lock()
        .bound_symbol(name)
        .map(SymbolAddr::get)
        .unwrap()
}

#[test]
fn stub_resolves_registry_symbol_on_first_call() {
    assert!(plt::machine_stubs_available());

    // Registered lazily only, so the backend never sees the real address.
    let mut session = session_with(Vec::new());
    session.add_lazy_symbol("toupper").unwrap();
    assert_eq!(session.bind_lazy_stubs().unwrap(), 1);
    session.relocate().unwrap();

    let stub: extern "C" fn(c_int) -> c_int =
        unsafe { std::mem::transmute(stub_of(&session, "toupper")) };
    for _ in 0..10 {
        assert_eq!(stub(b'a' as c_int), b'A' as c_int);
    }

    let entry = session.plt().unwrap().find_by_name("toupper").unwrap();
    assert_eq!(entry.state(), EntryState::Resolved);
    assert_eq!(session.plt().unwrap().stats().lazy_resolved, 1);
}

#[test]
fn stub_prefers_builtin_over_system_library() {
    let spec = BuiltinSpec::any("triple", triple as *const std::ffi::c_void);
    let mut session = session_with(vec![spec]);
    session.add_lazy_symbol("triple").unwrap();
    session.bind_lazy_stubs().unwrap();
    session.relocate().unwrap();

    let stub: extern "C" fn(c_int) -> c_int =
        unsafe { std::mem::transmute(stub_of(&session, "triple")) };
    assert_eq!(stub(14), 42);

    let entry = session.plt().unwrap().find_by_name("triple").unwrap();
    assert_eq!(entry.jump_target(), triple as usize);
}

#[test]
fn binding_twice_only_stubs_new_entries() {
    let mut session = session_with(Vec::new());
    session.add_lazy_symbol("toupper").unwrap();
    assert_eq!(session.bind_lazy_stubs().unwrap(), 1);
    assert_eq!(session.bind_lazy_stubs().unwrap(), 0);
    session.add_lazy_symbol("tolower").unwrap();
    assert_eq!(session.bind_lazy_stubs().unwrap(), 1);
}

#[test]
fn standalone_table_with_stub_block() {
    let lookup = hostlink::core::LookupFn(|name: &str| {
        (name == "triple").then(|| SymbolAddr::new(triple as usize)).flatten()
    });
    let table = PltTable::new(Arc::new(lookup), true, 0);
    let index = table.add_symbol("triple").unwrap();
    let entry = table.get_by_index(index).unwrap();
    let block = StubBlock::new(&[entry.as_ptr() as usize]).unwrap();

    let stub: extern "C" fn(c_int) -> c_int =
        unsafe { std::mem::transmute(block.stub_address(0).unwrap()) };
    assert_eq!(stub(2), 6);
    assert_eq!(stub(3), 9);
    assert!(entry.is_resolved());
}

extern "win64" fn sum_six(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64) -> i64 {
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f
}

#[test]
fn ms_abi_thunk_through_adapter() {
    use hostlink::core::CallAdapter;

    let thunks = MsAbiThunks::new();
    let target = SymbolAddr::new(sum_six as usize).unwrap();
    let wrapped = thunks.wrap("winlib", target).unwrap();
    assert_ne!(wrapped, target);
    // Same target, same thunk.
    assert_eq!(thunks.wrap("winlib", target).unwrap(), wrapped);

    let call: extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64 =
        unsafe { std::mem::transmute(wrapped.get()) };
    assert_eq!(call(1, 1, 1, 1, 1, 1), 21);
}
