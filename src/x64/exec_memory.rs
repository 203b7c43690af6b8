//! Read-execute memory mappings holding generated code.

use std::ptr::NonNull;

use super::StubError;

/// A private mapping that holds a finished piece of machine code.
///
/// The mapping is written once while still read-write, then flipped to
/// read-execute and never touched again. It is unmapped on drop.
#[derive(Debug)]
pub struct ExecMemory {
    ptr: NonNull<u8>,
    map_len: usize,
    code_len: usize,
}

// Immutable after construction.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

impl ExecMemory {
    /// Map `code` into fresh executable memory.
    #[cfg(unix)]
    pub fn new(code: &[u8]) -> Result<Self, StubError> {
        if code.is_empty() {
            return Err(StubError::Assembly("empty code buffer".to_string()));
        }
        let map_len = round_to_page(code.len());

        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(StubError::Map {
                size: map_len,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| StubError::Map {
            size: map_len,
            reason: "mmap returned null".to_string(),
        })?;
        let memory = Self {
            ptr,
            map_len,
            code_len: code.len(),
        };

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), memory.ptr.as_ptr(), code.len());
            if libc::mprotect(raw, map_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                // dropping `memory` unmaps the region
                return Err(StubError::Protect {
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
        }

        log::trace!("Mapped {} bytes of code at {:p}", code.len(), memory.ptr);
        Ok(memory)
    }

    #[cfg(not(unix))]
    pub fn new(_code: &[u8]) -> Result<Self, StubError> {
        Err(StubError::Unsupported)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Length of the code, not of the mapping.
    pub fn len(&self) -> usize {
        self.code_len
    }

    pub fn is_empty(&self) -> bool {
        self.code_len == 0
    }

    /// The mapped code bytes.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.code_len) }
    }
}

#[cfg(unix)]
impl Drop for ExecMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.map_len);
        }
    }
}

#[cfg(unix)]
fn round_to_page(len: usize) -> usize {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    len.div_ceil(page) * page
}
