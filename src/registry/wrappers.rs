//! Thin `extern "C"` wrappers handed to compiled code in place of raw libc
//! symbols.
//!
//! The host toolchain may attach attributes to its string and memory
//! routines that the backend's calling assumptions do not honour, so compiled
//! code gets a plain out-of-line function instead. Math and byte-order
//! helpers live here because the libc crate does not export them as
//! functions.

use std::ffi::{c_char, c_int, c_long, c_void};

use crate::platform::{OsKind, PlatformProfile};

pub extern "C" fn hl_strlen(s: *const c_char) -> usize {
    unsafe { libc::strlen(s) }
}

pub extern "C" fn hl_strcmp(a: *const c_char, b: *const c_char) -> c_int {
    unsafe { libc::strcmp(a, b) }
}

pub extern "C" fn hl_strncmp(a: *const c_char, b: *const c_char, n: usize) -> c_int {
    unsafe { libc::strncmp(a, b, n) }
}

#[cfg(unix)]
pub extern "C" fn hl_strcasecmp(a: *const c_char, b: *const c_char) -> c_int {
    unsafe { libc::strcasecmp(a, b) }
}

pub extern "C" fn hl_strcpy(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    unsafe { libc::strcpy(dst, src) }
}

pub extern "C" fn hl_strncpy(dst: *mut c_char, src: *const c_char, n: usize) -> *mut c_char {
    unsafe { libc::strncpy(dst, src, n) }
}

pub extern "C" fn hl_strcat(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    unsafe { libc::strcat(dst, src) }
}

pub extern "C" fn hl_strchr(s: *const c_char, c: c_int) -> *mut c_char {
    unsafe { libc::strchr(s, c) }
}

pub extern "C" fn hl_strrchr(s: *const c_char, c: c_int) -> *mut c_char {
    unsafe { libc::strrchr(s, c) }
}

pub extern "C" fn hl_strstr(haystack: *const c_char, needle: *const c_char) -> *mut c_char {
    unsafe { libc::strstr(haystack, needle) }
}

pub extern "C" fn hl_strtok(s: *mut c_char, delim: *const c_char) -> *mut c_char {
    unsafe { libc::strtok(s, delim) }
}

pub extern "C" fn hl_strtol(s: *const c_char, end: *mut *mut c_char, base: c_int) -> c_long {
    unsafe { libc::strtol(s, end, base) }
}

pub extern "C" fn hl_strerror(errnum: c_int) -> *mut c_char {
    unsafe { libc::strerror(errnum) }
}

#[cfg(unix)]
pub extern "C" fn hl_strftime(
    buf: *mut c_char,
    max: usize,
    format: *const c_char,
    tm: *const libc::tm,
) -> usize {
    unsafe { libc::strftime(buf, max, format, tm) }
}

pub extern "C" fn hl_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    unsafe { libc::memcpy(dst, src, n) }
}

pub extern "C" fn hl_memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    unsafe { libc::memmove(dst, src, n) }
}

pub extern "C" fn hl_memset(dst: *mut c_void, c: c_int, n: usize) -> *mut c_void {
    unsafe { libc::memset(dst, c, n) }
}

pub extern "C" fn hl_sin(x: f64) -> f64 {
    x.sin()
}

pub extern "C" fn hl_cos(x: f64) -> f64 {
    x.cos()
}

pub extern "C" fn hl_sqrt(x: f64) -> f64 {
    x.sqrt()
}

pub extern "C" fn hl_htons(v: u16) -> u16 {
    v.to_be()
}

pub extern "C" fn hl_htonl(v: u32) -> u32 {
    v.to_be()
}

pub extern "C" fn hl_is_linux() -> c_int {
    (PlatformProfile::current().os == OsKind::Linux) as c_int
}

pub extern "C" fn hl_is_windows() -> c_int {
    (PlatformProfile::current().os == OsKind::Windows) as c_int
}

pub extern "C" fn hl_is_xnu() -> c_int {
    (PlatformProfile::current().os == OsKind::Darwin) as c_int
}
