// This module classifies the host platform for the compiler backend. OsSignals captures
// every input the classification looks at (the uname sysname plus the WINDIR, SystemRoot,
// OSTYPE and HOME fallbacks), so detect_from is a pure function of its arguments and the
// process-wide profile is just detect_from applied to the live environment, memoized once
// with once_cell. The resulting PlatformProfile carries the OS kind, the target
// architecture and the ordered set of macro definitions a compile session passes to the
// backend; option_string renders them into the backend's command-line syntax. Search path
// discovery lives in the paths submodule.

//! Platform profile detection.
//!
//! Detection never fails: when nothing identifies the OS the profile falls back
//! to [`OsKind::Unix`].

pub mod paths;

use std::fmt;

use once_cell::sync::Lazy;

pub use paths::{search_paths, search_paths_from, split_path_list, PathKind};

/// Marker definition every session passes to the backend.
pub const HOST_MARKER_DEFINE: &str = "__HOSTLINK__";

/// Options every session starts from, before the profile's defines.
const BASE_OPTIONS: [&str; 2] = ["-nostdlib", "-nostdinc"];

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsKind {
    Linux,
    Darwin,
    Windows,
    /// Any other Unix, and the fallback when nothing matched.
    Unix,
}

impl OsKind {
    /// Delimiter of path-list environment variables.
    pub fn path_list_separator(self) -> char {
        match self {
            OsKind::Windows => ';',
            _ => ':',
        }
    }

    pub fn is_posix(self) -> bool {
        !matches!(self, OsKind::Windows)
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsKind::Linux => "linux",
            OsKind::Darwin => "darwin",
            OsKind::Windows => "windows",
            OsKind::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// Target architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    /// Architecture this crate was compiled for.
    pub fn host() -> Self {
        Self::from_name(std::env::consts::ARCH)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "x86_64" | "amd64" => Arch::X86_64,
            "aarch64" | "arm64" => Arch::Aarch64,
            _ => Arch::Other,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Other => "other",
        };
        f.write_str(name)
    }
}

/// Raw inputs to OS classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsSignals {
    /// `uname` sysname, when the OS identification facility exists.
    pub sysname: Option<String>,
    pub windir: Option<String>,
    pub system_root: Option<String>,
    pub ostype: Option<String>,
    pub home: Option<String>,
}

impl OsSignals {
    /// Gather signals from the running process.
    pub fn from_process() -> Self {
        Self {
            sysname: host_sysname(),
            windir: non_empty_var("WINDIR"),
            system_root: non_empty_var("SystemRoot"),
            ostype: non_empty_var("OSTYPE"),
            home: non_empty_var("HOME"),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(unix)]
fn host_sysname() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let sysname = unsafe { std::ffi::CStr::from_ptr(uts.sysname.as_ptr()) };
    let sysname = sysname.to_string_lossy().into_owned();
    (!sysname.is_empty()).then_some(sysname)
}

#[cfg(not(unix))]
fn host_sysname() -> Option<String> {
    None
}

/// Detected platform classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub os: OsKind,
    pub arch: Arch,
    /// Macro definitions for the backend, in emission order, without `-D`.
    pub defines: Vec<&'static str>,
}

impl PlatformProfile {
    /// Build the profile for an explicit OS and architecture.
    pub fn new(os: OsKind, arch: Arch) -> Self {
        let mut defines = Vec::new();
        match os {
            OsKind::Windows => defines.extend(["_WIN32", "WIN32", "_WINDOWS"]),
            OsKind::Darwin => {
                defines.extend(["__APPLE__", "__MACH__", "TCC_TARGET_MACHO"]);
                if arch == Arch::Aarch64 {
                    defines.push("TCC_TARGET_ARM64");
                }
            }
            OsKind::Linux => defines.extend(["__unix__", "__linux__"]),
            OsKind::Unix => defines.push("__unix__"),
        }
        Self { os, arch, defines }
    }

    /// Process-wide profile, detected once.
    pub fn current() -> &'static PlatformProfile {
        static CURRENT: Lazy<PlatformProfile> = Lazy::new(detect);
        &CURRENT
    }

    pub fn has_define(&self, define: &str) -> bool {
        self.defines.iter().any(|d| *d == define)
    }

    /// Backend option string for this profile.
    pub fn option_string(&self) -> String {
        self.option_string_with::<&str>(&[])
    }

    /// Backend option string with caller options appended.
    pub fn option_string_with<S: AsRef<str>>(&self, extra: &[S]) -> String {
        let mut parts: Vec<String> = BASE_OPTIONS.iter().map(|s| s.to_string()).collect();
        parts.push(format!("-D{HOST_MARKER_DEFINE}"));
        parts.extend(self.defines.iter().map(|d| format!("-D{d}")));
        parts.extend(
            extra
                .iter()
                .map(|s| s.as_ref().trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        parts.join(" ")
    }
}

impl fmt::Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} [{}]", self.os, self.arch, self.defines.join(", "))
    }
}

/// Detect the running platform.
pub fn detect() -> PlatformProfile {
    let profile = detect_from(&OsSignals::from_process(), Arch::host());
    log::debug!("Detected platform profile: {}", profile);
    profile
}

/// Classify explicit signals. Same input, same profile.
pub fn detect_from(signals: &OsSignals, arch: Arch) -> PlatformProfile {
    PlatformProfile::new(classify_os(signals), arch)
}

fn classify_os(signals: &OsSignals) -> OsKind {
    if let Some(kind) = signals.sysname.as_deref().and_then(classify_sysname) {
        return kind;
    }

    let windows_dir = signals
        .windir
        .as_deref()
        .or(signals.system_root.as_deref())
        .filter(|v| !v.is_empty());
    if windows_dir.is_some() {
        return OsKind::Windows;
    }

    if let Some(ostype) = signals.ostype.as_deref() {
        if ostype.contains("darwin") || ostype.contains("mac") {
            return OsKind::Darwin;
        }
        if ostype.contains("linux") {
            return OsKind::Linux;
        }
    }

    if let Some(home) = signals.home.as_deref() {
        if home.contains("/Library/Application Support") {
            return OsKind::Darwin;
        }
    }

    OsKind::Unix
}

fn classify_sysname(sysname: &str) -> Option<OsKind> {
    if sysname.eq_ignore_ascii_case("windows")
        || starts_with_ignore_case(sysname, "CYGWIN_NT")
        || starts_with_ignore_case(sysname, "MINGW")
    {
        Some(OsKind::Windows)
    } else if sysname.eq_ignore_ascii_case("darwin") {
        Some(OsKind::Darwin)
    } else if sysname.eq_ignore_ascii_case("linux") {
        Some(OsKind::Linux)
    } else {
        None
    }
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}
