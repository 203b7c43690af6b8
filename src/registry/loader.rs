//! Module loading primitives exposed to compiled code.
//!
//! Compiled code sees `__import`, `__import_sym`, `__import_free` and the
//! `dlopen` family. All of them go through the installed [`ModuleLoader`];
//! every symbol handed out is passed through the installed call adapter.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use libloading::Library;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::core::abi::wrap_symbol;
use crate::core::{SymbolAddr, SymbolLookup};
use crate::platform::{OsKind, PlatformProfile};
use crate::x64::StubError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("could not load module {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("symbol '{symbol}' not found in {module}")]
    SymbolNotFound { module: String, symbol: String },

    #[error("unknown module handle {0:#x}")]
    UnknownHandle(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Adapter(#[from] StubError),
}

/// Opaque handle to an imported module. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(NonZeroUsize);

impl ModuleHandle {
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Import, look up and release modules on behalf of compiled code.
pub trait ModuleLoader: Send + Sync {
    fn import(&self, path: &str) -> Result<ModuleHandle, LoaderError>;

    /// Handle for the running program itself.
    fn import_process(&self) -> Result<ModuleHandle, LoaderError> {
        Err(LoaderError::InvalidArgument("module path is null"))
    }

    fn import_sym(&self, handle: ModuleHandle, symbol: &str) -> Result<SymbolAddr, LoaderError>;

    fn import_free(&self, handle: ModuleHandle) -> Result<(), LoaderError>;
}

/// File names to try for `path`, most specific first.
///
/// The literal path always comes first. A path without an extension is
/// retried with each platform extension, then with a `lib` prefix.
pub fn library_candidates(path: &str, os: OsKind) -> Vec<String> {
    let mut out = vec![path.to_string()];

    let (dir, file) = match path.rfind(['/', '\\']) {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    };
    if file.is_empty() || file.contains('.') {
        return out;
    }

    let extensions: &[&str] = match os {
        OsKind::Windows => &[".dll"],
        OsKind::Darwin => &[".dylib", ".so"],
        OsKind::Linux | OsKind::Unix => &[".so", ".dylib"],
    };
    for ext in extensions {
        out.push(format!("{dir}{file}{ext}"));
    }
    if !file.starts_with("lib") {
        for ext in extensions {
            out.push(format!("{dir}lib{file}{ext}"));
        }
    }
    out
}

fn open_library(path: &str, os: OsKind) -> Result<Library, LoaderError> {
    let mut last_reason = String::new();
    for candidate in library_candidates(path, os) {
        match unsafe { Library::new(&candidate) } {
            Ok(library) => {
                log::debug!("Loaded module {} as {}", path, candidate);
                return Ok(library);
            }
            Err(e) => last_reason = e.to_string(),
        }
    }
    Err(LoaderError::Load {
        path: path.to_string(),
        reason: last_reason,
    })
}

fn raw_symbol(library: &Library, symbol: &str) -> Option<SymbolAddr> {
    let sym = unsafe { library.get::<*const c_void>(symbol.as_bytes()) }.ok()?;
    SymbolAddr::from_ptr(*sym)
}

struct LoadedModule {
    name: String,
    library: Library,
}

/// Loads shared libraries with `libloading`.
pub struct SharedLibraryLoader {
    os: OsKind,
    modules: Mutex<HashMap<usize, LoadedModule>>,
    next_handle: AtomicUsize,
}

impl SharedLibraryLoader {
    pub fn new(os: OsKind) -> Self {
        Self {
            os,
            modules: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(1),
        }
    }

    fn insert(&self, name: String, library: Library) -> ModuleHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.modules.lock().insert(raw, LoadedModule { name, library });
        // counter starts at 1
        ModuleHandle(NonZeroUsize::new(raw).unwrap_or(NonZeroUsize::MAX))
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }
}

impl Default for SharedLibraryLoader {
    fn default() -> Self {
        Self::new(PlatformProfile::current().os)
    }
}

impl ModuleLoader for SharedLibraryLoader {
    fn import(&self, path: &str) -> Result<ModuleHandle, LoaderError> {
        if path.is_empty() {
            return Err(LoaderError::InvalidArgument("module path is empty"));
        }
        let library = open_library(path, self.os)?;
        Ok(self.insert(path.to_string(), library))
    }

    fn import_process(&self) -> Result<ModuleHandle, LoaderError> {
        #[cfg(unix)]
        let library: Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let library: Library = libloading::os::windows::Library::this()
            .map_err(|e| LoaderError::Load {
                path: "<process>".to_string(),
                reason: e.to_string(),
            })?
            .into();
        Ok(self.insert("<process>".to_string(), library))
    }

    fn import_sym(&self, handle: ModuleHandle, symbol: &str) -> Result<SymbolAddr, LoaderError> {
        let modules = self.modules.lock();
        let module = modules
            .get(&handle.get())
            .ok_or(LoaderError::UnknownHandle(handle.get()))?;
        let addr = raw_symbol(&module.library, symbol).ok_or_else(|| {
            LoaderError::SymbolNotFound {
                module: module.name.clone(),
                symbol: symbol.to_string(),
            }
        })?;
        Ok(wrap_symbol(&module.name, addr)?)
    }

    fn import_free(&self, handle: ModuleHandle) -> Result<(), LoaderError> {
        match self.modules.lock().remove(&handle.get()) {
            Some(module) => {
                log::debug!("Released module {}", module.name);
                Ok(())
            }
            None => Err(LoaderError::UnknownHandle(handle.get())),
        }
    }
}

static LOADER: Lazy<RwLock<Arc<dyn ModuleLoader>>> =
    Lazy::new(|| RwLock::new(Arc::new(SharedLibraryLoader::default())));

/// Replace the process-wide loader, returning the previous one.
pub fn install_loader(loader: Arc<dyn ModuleLoader>) -> Arc<dyn ModuleLoader> {
    std::mem::replace(&mut *LOADER.write(), loader)
}

pub fn loader() -> Arc<dyn ModuleLoader> {
    LOADER.read().clone()
}

/// The host's C runtime libraries, opened once.
pub struct SystemLibraries {
    libraries: Vec<(String, Library)>,
}

impl SystemLibraries {
    pub fn open(os: OsKind) -> Self {
        let groups: &[&[&str]] = match os {
            OsKind::Windows => &[&["msvcrt.dll"]],
            OsKind::Linux => &[&["libc.so.6", "libc.so"], &["libm.so.6", "libm.so"]],
            OsKind::Darwin | OsKind::Unix => &[&["libSystem.B.dylib"]],
        };

        let mut libraries = Vec::new();
        for group in groups {
            let opened = group
                .iter()
                .find_map(|name| unsafe { Library::new(name) }.ok().map(|lib| (name.to_string(), lib)));
            match opened {
                Some(entry) => libraries.push(entry),
                None => log::debug!("No system library found among {:?}", group),
            }
        }
        Self { libraries }
    }

    /// Libraries for the detected platform, opened on first use.
    pub fn host() -> &'static SystemLibraries {
        static HOST: Lazy<SystemLibraries> =
            Lazy::new(|| SystemLibraries::open(PlatformProfile::current().os));
        &HOST
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.libraries.iter().map(|(name, _)| name.as_str())
    }
}

impl SymbolLookup for SystemLibraries {
    fn lookup_symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.libraries.iter().find_map(|(module, library)| {
            let addr = raw_symbol(library, name)?;
            match wrap_symbol(module, addr) {
                Ok(wrapped) => Some(wrapped),
                Err(e) => {
                    log::warn!("Could not adapt '{}' from {}: {}", name, module, e);
                    None
                }
            }
        })
    }
}

thread_local! {
    static DL_ERROR: RefCell<DlErrorSlot> = RefCell::new(DlErrorSlot::default());
}

#[derive(Default)]
struct DlErrorSlot {
    pending: Option<CString>,
    returned: Option<CString>,
}

fn set_dl_error(error: &LoaderError) {
    log::debug!("Module loader: {}", error);
    let text = CString::new(error.to_string().replace('\0', " ")).ok();
    DL_ERROR.with(|slot| slot.borrow_mut().pending = text);
}

fn clear_dl_error() {
    DL_ERROR.with(|slot| slot.borrow_mut().pending = None);
}

unsafe fn c_str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        CStr::from_ptr(ptr).to_str().ok()
    }
}

fn report<T>(result: Result<T, LoaderError>) -> Option<T> {
    match result {
        Ok(value) => {
            clear_dl_error();
            Some(value)
        }
        Err(e) => {
            set_dl_error(&e);
            None
        }
    }
}

fn handle_ptr(handle: Option<ModuleHandle>) -> *mut c_void {
    handle.map_or(std::ptr::null_mut(), |h| h.get() as *mut c_void)
}

/// `void *__import(const char *path)`
pub extern "C" fn hl_import(path: *const c_char) -> *mut c_void {
    let result = match unsafe { c_str_arg(path) } {
        Some(path) => loader().import(path),
        None => Err(LoaderError::InvalidArgument("module path is not valid UTF-8 text")),
    };
    handle_ptr(report(result))
}

/// `void *__import_sym(void *module, const char *symbol)`
pub extern "C" fn hl_import_sym(module: *mut c_void, symbol: *const c_char) -> *mut c_void {
    let result = match (ModuleHandle::from_raw(module as usize), unsafe { c_str_arg(symbol) }) {
        (Some(handle), Some(symbol)) => loader().import_sym(handle, symbol),
        (None, _) => Err(LoaderError::UnknownHandle(0)),
        (_, None) => Err(LoaderError::InvalidArgument("symbol name is not valid UTF-8 text")),
    };
    report(result).map_or(std::ptr::null_mut(), |addr| addr.get() as *mut c_void)
}

/// `int __import_free(void *module)`
pub extern "C" fn hl_import_free(module: *mut c_void) -> c_int {
    let result = ModuleHandle::from_raw(module as usize)
        .ok_or(LoaderError::UnknownHandle(0))
        .and_then(|handle| loader().import_free(handle));
    if report(result).is_some() {
        0
    } else {
        -1
    }
}

/// `void *dlopen(const char *path, int flags)`; flags are ignored.
pub extern "C" fn hl_dlopen(path: *const c_char, _flags: c_int) -> *mut c_void {
    if path.is_null() {
        return handle_ptr(report(loader().import_process()));
    }
    hl_import(path)
}

/// `void *dlsym(void *handle, const char *symbol)`
pub extern "C" fn hl_dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    hl_import_sym(handle, symbol)
}

/// `int dlclose(void *handle)`
pub extern "C" fn hl_dlclose(handle: *mut c_void) -> c_int {
    hl_import_free(handle)
}

/// `char *dlerror(void)`: last error of this thread, then cleared.
pub extern "C" fn hl_dlerror() -> *const c_char {
    DL_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.returned = slot.pending.take();
        slot.returned
            .as_ref()
            .map_or(std::ptr::null(), |text| text.as_ptr())
    })
}
