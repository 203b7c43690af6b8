//! [`CompilerBackend`] over a dynamically loaded `libtcc`.
//!
//! The library is opened at run time with `libloading`, so hostlink builds
//! and tests without a C compiler installed. Set `HOSTLINK_LIBTCC` to point
//! at a specific `libtcc` build.

use std::ffi::{c_char, c_int, c_void, CStr, CString, OsStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;

use crate::core::{BackendError, CompilerBackend, ErrorCallback, OutputMode, SymbolAddr};
use crate::platform::PlatformProfile;
use crate::registry::loader::library_candidates;

/// Environment variable naming the `libtcc` to load.
pub const LIBTCC_VAR: &str = "HOSTLINK_LIBTCC";

const DEFAULT_LIBRARY: &str = "libtcc";

// tcc_set_output_type values
const OUTPUT_MEMORY: c_int = 1;
const OUTPUT_EXE: c_int = 2;
const OUTPUT_OBJ: c_int = 3;
const OUTPUT_PREPROCESS: c_int = 5;

/// Lets `tcc_relocate` allocate the code memory itself.
const RELOCATE_AUTO: *mut c_void = 1 as *mut c_void;

#[repr(C)]
struct TccState {
    _private: [u8; 0],
}

type ErrorFunc = extern "C" fn(*mut c_void, *const c_char);

/// Entry points copied out of the loaded library.
#[derive(Clone, Copy)]
struct TccApi {
    new: unsafe extern "C" fn() -> *mut TccState,
    delete: unsafe extern "C" fn(*mut TccState),
    set_error_func: unsafe extern "C" fn(*mut TccState, *mut c_void, ErrorFunc),
    set_options: unsafe extern "C" fn(*mut TccState, *const c_char),
    set_output_type: unsafe extern "C" fn(*mut TccState, c_int) -> c_int,
    add_include_path: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    add_library_path: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    add_symbol: unsafe extern "C" fn(*mut TccState, *const c_char, *const c_void) -> c_int,
    add_file: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    compile_string: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
    relocate: unsafe extern "C" fn(*mut TccState, *mut c_void) -> c_int,
    get_symbol: unsafe extern "C" fn(*mut TccState, *const c_char) -> *mut c_void,
    output_file: unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int,
}

fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, BackendError> {
    let sym = unsafe { lib.get::<T>(name.as_bytes()) }.map_err(|e| BackendError::Library {
        reason: format!("missing {name}: {e}"),
    })?;
    Ok(*sym)
}

impl TccApi {
    fn load(lib: &Library) -> Result<Self, BackendError> {
        Ok(Self {
            new: symbol(lib, "tcc_new")?,
            delete: symbol(lib, "tcc_delete")?,
            set_error_func: symbol(lib, "tcc_set_error_func")?,
            set_options: symbol(lib, "tcc_set_options")?,
            set_output_type: symbol(lib, "tcc_set_output_type")?,
            add_include_path: symbol(lib, "tcc_add_include_path")?,
            add_library_path: symbol(lib, "tcc_add_library_path")?,
            add_symbol: symbol(lib, "tcc_add_symbol")?,
            add_file: symbol(lib, "tcc_add_file")?,
            compile_string: symbol(lib, "tcc_compile_string")?,
            relocate: symbol(lib, "tcc_relocate")?,
            get_symbol: symbol(lib, "tcc_get_symbol")?,
            output_file: symbol(lib, "tcc_output_file")?,
        })
    }
}

/// A loaded `libtcc`. One library serves any number of backend instances.
pub struct TccLibrary {
    api: TccApi,
    path: String,
    _library: Library,
}

impl TccLibrary {
    /// Load `libtcc` from `path`.
    pub fn open(path: impl AsRef<OsStr>) -> Result<Arc<Self>, BackendError> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(|e| BackendError::Library {
            reason: format!("{}: {}", path.to_string_lossy(), e),
        })?;
        let api = TccApi::load(&library)?;
        log::debug!("Loaded libtcc from {}", path.to_string_lossy());
        Ok(Arc::new(Self {
            api,
            path: path.to_string_lossy().into_owned(),
            _library: library,
        }))
    }

    /// Load from `HOSTLINK_LIBTCC`, or search the usual library names.
    pub fn open_default() -> Result<Arc<Self>, BackendError> {
        if let Some(path) = std::env::var_os(LIBTCC_VAR) {
            return Self::open(path);
        }
        let mut last = None;
        for candidate in library_candidates(DEFAULT_LIBRARY, PlatformProfile::current().os) {
            match Self::open(&candidate) {
                Ok(library) => return Ok(library),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(BackendError::Library {
            reason: "no libtcc candidates".to_string(),
        }))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create a fresh backend instance.
    pub fn instance(self: &Arc<Self>) -> Result<TccBackend, BackendError> {
        let state = NonNull::new(unsafe { (self.api.new)() }).ok_or_else(|| {
            BackendError::Library {
                reason: "tcc_new returned null".to_string(),
            }
        })?;
        Ok(TccBackend {
            library: Arc::clone(self),
            state,
            callback: None,
        })
    }
}

/// One `TCCState`.
pub struct TccBackend {
    library: Arc<TccLibrary>,
    state: NonNull<TccState>,
    // Boxed twice so the opaque pointer handed to libtcc stays put.
    callback: Option<Box<ErrorCallback>>,
}

// A TCCState is only touched through &mut self or under the session's lock.
unsafe impl Send for TccBackend {}

extern "C" fn forward_error(opaque: *mut c_void, message: *const c_char) {
    if opaque.is_null() || message.is_null() {
        return;
    }
    let callback = unsafe { &*(opaque as *const ErrorCallback) };
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    // Unwinding into C is undefined behaviour.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| callback(&text)));
}

fn c_string(value: &str, operation: &'static str) -> Result<CString, BackendError> {
    CString::new(value).map_err(|_| BackendError::Rejected {
        operation,
        reason: "contains a NUL byte".to_string(),
    })
}

fn path_string(path: &Path, operation: &'static str) -> Result<CString, BackendError> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes()).map_err(|_| BackendError::Rejected {
            operation,
            reason: "path contains a NUL byte".to_string(),
        })
    }
    #[cfg(not(unix))]
    {
        c_string(&path.to_string_lossy(), operation)
    }
}

impl TccBackend {
    fn api(&self) -> &TccApi {
        &self.library.api
    }

    fn check(&self, rc: c_int, operation: &'static str) -> Result<(), BackendError> {
        if rc < 0 {
            Err(BackendError::Rejected {
                operation,
                reason: format!("libtcc returned {rc}"),
            })
        } else {
            Ok(())
        }
    }
}

impl CompilerBackend for TccBackend {
    fn set_error_callback(&mut self, callback: ErrorCallback) {
        let boxed = Box::new(callback);
        let opaque = &*boxed as *const ErrorCallback as *mut c_void;
        unsafe { (self.api().set_error_func)(self.state.as_ptr(), opaque, forward_error) };
        // Replacing drops the old callback only after libtcc points at the new one.
        self.callback = Some(boxed);
    }

    fn set_output_mode(&mut self, mode: OutputMode) -> Result<(), BackendError> {
        let code = match mode {
            OutputMode::Memory => OUTPUT_MEMORY,
            OutputMode::Executable => OUTPUT_EXE,
            OutputMode::Object => OUTPUT_OBJ,
            OutputMode::Preprocess => OUTPUT_PREPROCESS,
        };
        let rc = unsafe { (self.api().set_output_type)(self.state.as_ptr(), code) };
        self.check(rc, "set_output_mode")
    }

    fn set_option_string(&mut self, options: &str) -> Result<(), BackendError> {
        let options = c_string(options, "set_option_string")?;
        unsafe { (self.api().set_options)(self.state.as_ptr(), options.as_ptr()) };
        Ok(())
    }

    fn add_include_path(&mut self, path: &Path) -> Result<(), BackendError> {
        let path = path_string(path, "add_include_path")?;
        let rc = unsafe { (self.api().add_include_path)(self.state.as_ptr(), path.as_ptr()) };
        self.check(rc, "add_include_path")
    }

    fn add_library_path(&mut self, path: &Path) -> Result<(), BackendError> {
        let path = path_string(path, "add_library_path")?;
        let rc = unsafe { (self.api().add_library_path)(self.state.as_ptr(), path.as_ptr()) };
        self.check(rc, "add_library_path")
    }

    fn add_symbol(&mut self, name: &str, address: SymbolAddr) -> Result<(), BackendError> {
        let name = c_string(name, "add_symbol")?;
        let rc = unsafe {
            (self.api().add_symbol)(self.state.as_ptr(), name.as_ptr(), address.as_ptr())
        };
        self.check(rc, "add_symbol")
    }

    fn compile(&mut self, source: &str) -> Result<(), BackendError> {
        let text = c_string(source, "compile")?;
        let rc = unsafe { (self.api().compile_string)(self.state.as_ptr(), text.as_ptr()) };
        if rc < 0 {
            return Err(BackendError::CompileFailed {
                unit: "<string>".to_string(),
            });
        }
        Ok(())
    }

    fn compile_file(&mut self, path: &Path) -> Result<(), BackendError> {
        let file = path_string(path, "compile_file")?;
        let rc = unsafe { (self.api().add_file)(self.state.as_ptr(), file.as_ptr()) };
        if rc < 0 {
            return Err(BackendError::CompileFailed {
                unit: path.display().to_string(),
            });
        }
        Ok(())
    }

    fn relocate(&mut self) -> Result<(), BackendError> {
        let rc = unsafe { (self.api().relocate)(self.state.as_ptr(), RELOCATE_AUTO) };
        if rc < 0 {
            return Err(BackendError::RelocationFailed);
        }
        Ok(())
    }

    fn get_symbol(&self, name: &str) -> Option<SymbolAddr> {
        let name = CString::new(name).ok()?;
        let ptr = unsafe { (self.api().get_symbol)(self.state.as_ptr(), name.as_ptr()) };
        SymbolAddr::from_ptr(ptr)
    }

    fn output_file(&mut self, path: &Path) -> Result<(), BackendError> {
        let file = path_string(path, "output_file")?;
        let rc = unsafe { (self.api().output_file)(self.state.as_ptr(), file.as_ptr()) };
        if rc < 0 {
            return Err(BackendError::OutputFailed {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

impl Drop for TccBackend {
    fn drop(&mut self) {
        unsafe { (self.api().delete)(self.state.as_ptr()) };
    }
}
