//! Include and library search path discovery.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use super::{Arch, OsKind, PlatformProfile};

/// Extra include directories. `C_INCLUDE_PATH` is not read.
pub const INCLUDE_PATH_VAR: &str = "HOSTLINK_INCLUDE_PATHS";
pub const LIBRARY_PATH_VAR: &str = "HOSTLINK_LIBRARY_PATHS";

/// Which search list to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Include,
    Library,
}

impl PathKind {
    pub fn env_var(self) -> &'static str {
        match self {
            PathKind::Include => INCLUDE_PATH_VAR,
            PathKind::Library => LIBRARY_PATH_VAR,
        }
    }
}

const LOCAL_INCLUDE_DIRS: [&str; 3] = ["./include", "./lib/include", "../include"];

const DARWIN_INCLUDE_DIRS: [&str; 2] = ["/opt/homebrew/include", "/usr/local/include"];

fn gnu_triple(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::X86_64 => Some("x86_64-linux-gnu"),
        Arch::Aarch64 => Some("aarch64-linux-gnu"),
        Arch::Other => None,
    }
}

/// Curated include candidates for a profile, before the existence filter.
pub fn include_candidates(profile: &PlatformProfile) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = LOCAL_INCLUDE_DIRS.iter().map(PathBuf::from).collect();
    match profile.os {
        OsKind::Windows => {}
        OsKind::Darwin => out.extend(DARWIN_INCLUDE_DIRS.iter().map(PathBuf::from)),
        OsKind::Linux | OsKind::Unix => {
            let triple = gnu_triple(profile.arch);
            if let Some(triple) = triple {
                // compiler builtin headers
                for version in ["11", "12"] {
                    out.push(PathBuf::from(format!("/usr/lib/gcc/{triple}/{version}/include")));
                }
            }
            out.push(PathBuf::from("/usr/local/include"));
            if let Some(triple) = triple {
                out.push(PathBuf::from(format!("/usr/include/{triple}")));
            }
            out.push(PathBuf::from("/usr/include"));
            out.push(PathBuf::from("/opt/local/include"));
        }
    }
    out
}

/// Split a path-list value: trim each entry, drop empty ones, keep order.
pub fn split_path_list(value: &str, separator: char) -> Vec<PathBuf> {
    value
        .split(separator)
        .map(|entry| entry.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn existing_dirs(paths: impl IntoIterator<Item = PathBuf>) -> impl Iterator<Item = PathBuf> {
    paths.into_iter().filter(|p| is_dir(p))
}

fn is_dir(path: &Path) -> bool {
    let exists = path.is_dir();
    if !exists {
        log::trace!("Skipping missing search directory {}", path.display());
    }
    exists
}

/// Search list for `kind` from an explicit profile and env value.
pub fn search_paths_from(
    kind: PathKind,
    profile: &PlatformProfile,
    env_value: Option<&str>,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if kind == PathKind::Include {
        out.extend(existing_dirs(include_candidates(profile)));
    }
    append_env_paths(&mut out, profile.os, env_value);
    out
}

fn append_env_paths(out: &mut Vec<PathBuf>, os: OsKind, env_value: Option<&str>) {
    if let Some(value) = env_value {
        out.extend(existing_dirs(split_path_list(
            value,
            os.path_list_separator(),
        )));
    }
}

/// Search list for `kind` on the running host.
///
/// Existing include candidates are looked up once per process; the
/// environment part is re-read on every call.
pub fn search_paths(kind: PathKind) -> Vec<PathBuf> {
    static INCLUDE_CACHE: OnceCell<Vec<PathBuf>> = OnceCell::new();

    let profile = PlatformProfile::current();
    let mut out = Vec::new();
    if kind == PathKind::Include {
        let cached = INCLUDE_CACHE
            .get_or_init(|| existing_dirs(include_candidates(profile)).collect());
        out.extend(cached.iter().cloned());
    }
    let env_value = std::env::var(kind.env_var()).ok();
    append_env_paths(&mut out, profile.os, env_value.as_deref());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_path_list() {
        assert_eq!(
            split_path_list(" /a : /b::\t/c ", ':'),
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert_eq!(
            split_path_list("C:\\inc;;D:\\x", ';'),
            vec![PathBuf::from("C:\\inc"), PathBuf::from("D:\\x")]
        );
        assert!(split_path_list("", ':').is_empty());
    }

    #[test]
    fn test_env_dirs_filtered_and_ordered() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let missing = a.path().join("does-not-exist");
        let value = format!(
            "{}:{}: :{}",
            b.path().display(),
            missing.display(),
            a.path().display()
        );

        let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
        let libs = search_paths_from(PathKind::Library, &profile, Some(&value));
        assert_eq!(libs, vec![b.path().to_path_buf(), a.path().to_path_buf()]);
    }

    #[test]
    fn test_library_paths_only_from_env() {
        let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
        assert!(search_paths_from(PathKind::Library, &profile, None).is_empty());
    }

    #[test]
    fn test_windows_uses_semicolon() {
        let a = tempfile::tempdir().unwrap();
        let value = format!("{};", a.path().display());
        let profile = PlatformProfile::new(OsKind::Windows, Arch::X86_64);
        let libs = search_paths_from(PathKind::Library, &profile, Some(&value));
        assert_eq!(libs, vec![a.path().to_path_buf()]);
    }

    #[test]
    fn test_include_candidates_per_os() {
        let windows = PlatformProfile::new(OsKind::Windows, Arch::X86_64);
        assert_eq!(include_candidates(&windows).len(), LOCAL_INCLUDE_DIRS.len());

        let mac = PlatformProfile::new(OsKind::Darwin, Arch::Aarch64);
        assert!(include_candidates(&mac).contains(&PathBuf::from("/opt/homebrew/include")));

        let linux = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
        let candidates = include_candidates(&linux);
        assert_eq!(candidates[0], PathBuf::from("./include"));
        assert!(candidates.contains(&PathBuf::from("/usr/include/x86_64-linux-gnu")));
        let usr = candidates.iter().position(|p| p == Path::new("/usr/include"));
        let local = candidates.iter().position(|p| p == Path::new("/usr/local/include"));
        assert!(local < usr);
    }

    #[test]
    fn test_include_list_puts_env_last() {
        let extra = tempfile::tempdir().unwrap();
        let profile = PlatformProfile::new(OsKind::Linux, Arch::X86_64);
        let value = extra.path().display().to_string();
        let includes = search_paths_from(PathKind::Include, &profile, Some(&value));
        assert_eq!(includes.last(), Some(&extra.path().to_path_buf()));
        assert!(includes.iter().all(|p| p.is_dir()));
    }

    #[test]
    fn test_dedicated_env_vars_only() {
        let ours = tempfile::tempdir().unwrap();
        let gcc = tempfile::tempdir().unwrap();
        std::env::set_var(INCLUDE_PATH_VAR, ours.path());
        std::env::set_var(LIBRARY_PATH_VAR, ours.path());
        std::env::set_var("C_INCLUDE_PATH", gcc.path());
        std::env::set_var("LIBRARY_PATH", gcc.path());

        let includes = search_paths(PathKind::Include);
        let libs = search_paths(PathKind::Library);

        std::env::remove_var(INCLUDE_PATH_VAR);
        std::env::remove_var(LIBRARY_PATH_VAR);
        std::env::remove_var("C_INCLUDE_PATH");
        std::env::remove_var("LIBRARY_PATH");

        let ours = ours.path().to_path_buf();
        let gcc = gcc.path().to_path_buf();
        assert_eq!(includes.last(), Some(&ours));
        assert!(!includes.contains(&gcc));
        assert_eq!(libs, vec![ours]);
    }

    proptest! {
        #[test]
        fn prop_split_never_yields_blank_entries(value in "[ a-z/:\t]{0,40}") {
            for entry in split_path_list(&value, ':') {
                let text = entry.to_string_lossy().into_owned();
                prop_assert!(!text.is_empty());
                prop_assert!(!text.contains(':'));
                prop_assert_eq!(text.trim(), text.as_str());
            }
        }
    }
}
