//! The host builtin table.

use std::ffi::c_void;

use super::loader;
use crate::core::SymbolAddr;
use super::wrappers::*;
use super::{BuiltinSpec, Capability};

macro_rules! builtins {
    ($($cap:ident $name:literal => $provider:expr),* $(,)?) => {
        vec![$(BuiltinSpec::new($name, Capability::$cap, $provider as *const c_void)),*]
    };
}

/// Entries every host provides.
fn portable_builtins() -> Vec<BuiltinSpec> {
    builtins![
        // memory
        Any "malloc" => libc::malloc,
        Any "calloc" => libc::calloc,
        Any "realloc" => libc::realloc,
        Any "free" => libc::free,
        Any "getenv" => libc::getenv,
        Any "atoi" => libc::atoi,
        Any "atof" => libc::atof,
        Any "atol" => libc::atol,

        // string and memory wrappers
        Any "strlen" => hl_strlen,
        Any "strcmp" => hl_strcmp,
        Any "strncmp" => hl_strncmp,
        Any "strcpy" => hl_strcpy,
        Any "strncpy" => hl_strncpy,
        Any "strcat" => hl_strcat,
        Any "strchr" => hl_strchr,
        Any "strrchr" => hl_strrchr,
        Any "strstr" => hl_strstr,
        Any "strtok" => hl_strtok,
        Any "strtol" => hl_strtol,
        Any "strerror" => hl_strerror,
        Any "memcpy" => hl_memcpy,
        Any "memmove" => hl_memmove,
        Any "memset" => hl_memset,
        Any "memcmp" => libc::memcmp,

        Any "isdigit" => libc::isdigit,
        Any "isalpha" => libc::isalpha,
        Any "abs" => libc::abs,
        Any "labs" => libc::labs,
        Any "sin" => hl_sin,
        Any "cos" => hl_cos,
        Any "sqrt" => hl_sqrt,

        Any "IsLinux" => hl_is_linux,
        Any "IsWindows" => hl_is_windows,
        Any "IsXnu" => hl_is_xnu,

        // module loading
        Any "__import" => loader::hl_import,
        Any "__import_sym" => loader::hl_import_sym,
        Any "__import_free" => loader::hl_import_free,
        Any "__dlopen" => loader::hl_dlopen,
        Any "__dlsym" => loader::hl_dlsym,
        Any "dlopen" => loader::hl_dlopen,
        Any "dlsym" => loader::hl_dlsym,
        Any "dlclose" => loader::hl_dlclose,
        Any "dlerror" => loader::hl_dlerror,

        Any "exit" => libc::exit,
        Any "abort" => libc::abort,
        Any "system" => libc::system,
    ]
}

#[cfg(unix)]
fn unix_builtins() -> Vec<BuiltinSpec> {
    builtins![
        // formatted I/O
        Any "printf" => libc::printf,
        Any "sprintf" => libc::sprintf,
        Any "snprintf" => libc::snprintf,
        Any "fprintf" => libc::fprintf,
        Any "sscanf" => libc::sscanf,

        Any "strcasecmp" => hl_strcasecmp,
        Any "strftime" => hl_strftime,
        Any "strdup" => libc::strdup,

        // stdio
        Any "fopen" => libc::fopen,
        Any "fclose" => libc::fclose,
        Any "fread" => libc::fread,
        Any "fwrite" => libc::fwrite,
        Any "fseek" => libc::fseek,
        Any "ftell" => libc::ftell,
        Any "fgets" => libc::fgets,
        Any "fputs" => libc::fputs,
        Any "fputc" => libc::fputc,
        Any "fflush" => libc::fflush,
        Any "perror" => libc::perror,
        Any "fileno" => libc::fileno,
        Any "popen" => libc::popen,
        Any "pclose" => libc::pclose,

        // file descriptors
        Any "open" => libc::open,
        Any "read" => libc::read,
        Any "write" => libc::write,
        Any "close" => libc::close,
        Any "pipe" => libc::pipe,
        Any "dup" => libc::dup,
        Any "dup2" => libc::dup2,
        Any "fcntl" => libc::fcntl,

        // file system
        Any "stat" => libc::stat,
        Any "fstat" => libc::fstat,
        Any "lstat" => libc::lstat,
        Any "access" => libc::access,
        Any "unlink" => libc::unlink,
        Any "mkdir" => libc::mkdir,
        Any "rmdir" => libc::rmdir,
        Any "chmod" => libc::chmod,
        Any "getcwd" => libc::getcwd,
        Any "realpath" => libc::realpath,
        Any "symlink" => libc::symlink,
        Any "readlink" => libc::readlink,
        Any "opendir" => libc::opendir,
        Any "readdir" => libc::readdir,
        Any "closedir" => libc::closedir,

        // process control
        Posix "fork" => libc::fork,
        Posix "execv" => libc::execv,
        Posix "execve" => libc::execve,
        Posix "execvp" => libc::execvp,
        Posix "waitpid" => libc::waitpid,
        Posix "kill" => libc::kill,
        Posix "getppid" => libc::getppid,
        Posix "setrlimit" => libc::setrlimit,
        Any "_exit" => libc::_exit,
        Any "getpid" => libc::getpid,
        Any "getuid" => libc::getuid,
        Any "geteuid" => libc::geteuid,
        Any "getgid" => libc::getgid,
        Any "getegid" => libc::getegid,
        Any "getopt" => libc::getopt,
        Any "uname" => libc::uname,

        // signals
        Posix "sigaction" => libc::sigaction,
        Posix "sigemptyset" => libc::sigemptyset,
        Posix "sigaddset" => libc::sigaddset,
        Posix "sigdelset" => libc::sigdelset,
        Posix "sigfillset" => libc::sigfillset,
        Posix "sigprocmask" => libc::sigprocmask,

        // threads
        Any "pthread_create" => libc::pthread_create,
        Any "pthread_join" => libc::pthread_join,
        Any "pthread_mutex_init" => libc::pthread_mutex_init,
        Any "pthread_mutex_lock" => libc::pthread_mutex_lock,
        Any "pthread_mutex_unlock" => libc::pthread_mutex_unlock,
        Any "pthread_mutex_destroy" => libc::pthread_mutex_destroy,

        // time
        Any "clock_gettime" => libc::clock_gettime,
        Any "gettimeofday" => libc::gettimeofday,
        Any "nanosleep" => libc::nanosleep,
        Any "sleep" => libc::sleep,
        Any "usleep" => libc::usleep,
        Any "time" => libc::time,
        Any "localtime" => libc::localtime,

        // sockets
        Any "socket" => libc::socket,
        Any "bind" => libc::bind,
        Any "listen" => libc::listen,
        Any "accept" => libc::accept,
        Any "connect" => libc::connect,
        Any "send" => libc::send,
        Any "recv" => libc::recv,
        Any "shutdown" => libc::shutdown,
        Any "setsockopt" => libc::setsockopt,
        Any "htons" => hl_htons,
        Any "htonl" => hl_htonl,
        Any "select" => libc::select,
        Any "poll" => libc::poll,

        // terminal
        Any "isatty" => libc::isatty,
        Any "tcgetattr" => libc::tcgetattr,
        Any "tcsetattr" => libc::tcsetattr,
    ]
}

/// The full host table, in registration order.
pub(super) fn host_builtins() -> Vec<BuiltinSpec> {
    let mut specs = portable_builtins();
    #[cfg(unix)]
    specs.extend(unix_builtins());
    specs
}

#[cfg(unix)]
mod host_vars {
    use std::ffi::{c_char, c_int};

    extern "C" {
        #[cfg_attr(any(target_os = "macos", target_os = "ios"), link_name = "__stdinp")]
        pub static mut stdin: *mut libc::FILE;
        #[cfg_attr(any(target_os = "macos", target_os = "ios"), link_name = "__stdoutp")]
        pub static mut stdout: *mut libc::FILE;
        #[cfg_attr(any(target_os = "macos", target_os = "ios"), link_name = "__stderrp")]
        pub static mut stderr: *mut libc::FILE;
        pub static mut optind: c_int;
        pub static mut optarg: *mut c_char;
        pub static mut opterr: c_int;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn errno_address() -> *const c_int {
        unsafe { libc::__errno_location() }
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    pub fn errno_address() -> *const c_int {
        unsafe { libc::__error() }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    pub fn errno_address() -> *const c_int {
        std::ptr::null()
    }
}

/// Host streams and globals, bound individually before the table.
#[cfg(unix)]
pub(super) fn host_globals() -> Vec<BuiltinSpec> {
    use std::ptr::addr_of;

    vec![
        BuiltinSpec::any("stdin", addr_of!(host_vars::stdin).cast()),
        BuiltinSpec::any("stdout", addr_of!(host_vars::stdout).cast()),
        BuiltinSpec::any("stderr", addr_of!(host_vars::stderr).cast()),
        BuiltinSpec::any("optind", addr_of!(host_vars::optind).cast()),
        BuiltinSpec::any("optarg", addr_of!(host_vars::optarg).cast()),
        BuiltinSpec::any("opterr", addr_of!(host_vars::opterr).cast()),
    ]
}

#[cfg(not(unix))]
pub(super) fn host_globals() -> Vec<BuiltinSpec> {
    Vec::new()
}

/// `errno` of the calling thread. Thread-local, so never cached.
#[cfg(unix)]
pub(super) fn thread_errno() -> Option<SymbolAddr> {
    SymbolAddr::new(host_vars::errno_address() as usize)
}

#[cfg(not(unix))]
pub(super) fn thread_errno() -> Option<SymbolAddr> {
    None
}
