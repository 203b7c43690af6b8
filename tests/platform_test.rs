use hostlink::platform::{
    detect_from, search_paths_from, Arch, OsKind, OsSignals, PathKind, PlatformProfile,
};
use hostlink::registry::BuiltinRegistry;

fn signals(sysname: Option<&str>, ostype: Option<&str>) -> OsSignals {
    OsSignals {
        sysname: sysname.map(str::to_string),
        ostype: ostype.map(str::to_string),
        ..OsSignals::default()
    }
}

#[test]
fn detection_is_deterministic() {
    let cases = [
        (signals(Some("Linux"), None), OsKind::Linux),
        (signals(Some("Darwin"), Some("linux-gnu")), OsKind::Darwin),
        (signals(Some("MINGW64_NT-10.0"), None), OsKind::Windows),
        (signals(Some("SunOS"), Some("darwin22")), OsKind::Darwin),
        (signals(None, None), OsKind::Unix),
    ];
    for (input, expected) in cases {
        let a = detect_from(&input, Arch::X86_64);
        let b = detect_from(&input, Arch::X86_64);
        assert_eq!(a, b);
        assert_eq!(a.os, expected, "{input:?}");
    }
}

#[test]
fn option_strings_per_os() {
    let expect = [
        (
            OsKind::Windows,
            Arch::X86_64,
            "-nostdlib -nostdinc -D__HOSTLINK__ -D_WIN32 -DWIN32 -D_WINDOWS",
        ),
        (
            OsKind::Darwin,
            Arch::Aarch64,
            "-nostdlib -nostdinc -D__HOSTLINK__ -D__APPLE__ -D__MACH__ -DTCC_TARGET_MACHO -DTCC_TARGET_ARM64",
        ),
        (
            OsKind::Darwin,
            Arch::X86_64,
            "-nostdlib -nostdinc -D__HOSTLINK__ -D__APPLE__ -D__MACH__ -DTCC_TARGET_MACHO",
        ),
        (
            OsKind::Linux,
            Arch::Aarch64,
            "-nostdlib -nostdinc -D__HOSTLINK__ -D__unix__ -D__linux__",
        ),
        (OsKind::Unix, Arch::Other, "-nostdlib -nostdinc -D__HOSTLINK__ -D__unix__"),
    ];
    for (os, arch, options) in expect {
        assert_eq!(PlatformProfile::new(os, arch).option_string(), options);
    }
}

#[test]
fn current_profile_is_stable() {
    let a = PlatformProfile::current();
    let b = PlatformProfile::current();
    assert!(std::ptr::eq(a, b));
    assert_eq!(a.arch, Arch::host());
    #[cfg(target_os = "linux")]
    assert_eq!(a.os, OsKind::Linux);
}

#[test]
fn library_search_list_keeps_env_order() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let value = format!("{};{}", second.path().display(), first.path().display());

    let windows = PlatformProfile::new(OsKind::Windows, Arch::X86_64);
    assert_eq!(
        search_paths_from(PathKind::Library, &windows, Some(&value)),
        vec![second.path().to_path_buf(), first.path().to_path_buf()]
    );
}

#[test]
fn windows_profile_drops_posix_builtins() {
    let windows = PlatformProfile::new(OsKind::Windows, Arch::X86_64);
    let registry = BuiltinRegistry::for_profile(&windows);
    assert!(registry.lookup("malloc").is_some());
    assert!(registry.lookup("fork").is_none());
    assert!(registry.lookup("waitpid").is_none());
    #[cfg(unix)]
    assert!(registry.unavailable().contains(&"fork"));
}
