//! System V to Microsoft x64 bridging thunks.
//!
//! Compiled code calls with the System V convention. A function living in a
//! module built for the Microsoft x64 convention is reached through a small
//! thunk that moves the first four integer arguments into `rcx, rdx, r8, r9`,
//! spills the fifth and sixth into the callee's stack slots and reserves the
//! 32-byte home area.

use hashbrown::HashMap;
use iced_x86::code_asm::*;
use parking_lot::Mutex;

use super::{assemble, ExecMemory, StubError};
use crate::core::{CallAdapter, SymbolAddr};

/// Home area plus two stack argument slots; keeps `rsp` 16-byte aligned.
const FRAME_SIZE: i32 = 48;

/// Encode a thunk calling `target` with the Microsoft x64 convention.
pub fn thunk_code(target: u64) -> Result<Vec<u8>, StubError> {
    assemble(|a| {
        a.push(rbp)?;
        a.mov(rbp, rsp)?;
        a.sub(rsp, FRAME_SIZE)?;

        a.mov(qword_ptr(rsp + 32), r8)?;
        a.mov(qword_ptr(rsp + 40), r9)?;
        a.mov(r9, rcx)?;
        a.mov(r8, rdx)?;
        a.mov(rdx, rsi)?;
        a.mov(rcx, rdi)?;

        a.mov(rax, target)?;
        a.call(rax)?;

        a.mov(rsp, rbp)?;
        a.pop(rbp)?;
        a.ret()?;
        Ok(())
    })
}

/// Generates and caches one thunk per target address.
#[derive(Debug, Default)]
pub struct MsAbiThunks {
    thunks: Mutex<HashMap<usize, ExecMemory>>,
}

impl MsAbiThunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thunk address for `target`, emitting it on first use.
    pub fn thunk_for(&self, target: SymbolAddr) -> Result<SymbolAddr, StubError> {
        let mut thunks = self.thunks.lock();
        if let Some(existing) = thunks.get(&target.get()) {
            return SymbolAddr::new(existing.addr()).ok_or(StubError::Unsupported);
        }

        let code = ExecMemory::new(&thunk_code(target.get() as u64)?)?;
        let addr = code.addr();
        thunks.insert(target.get(), code);
        log::debug!("Emitted ms-abi thunk for {} at {:#x}", target, addr);
        SymbolAddr::new(addr).ok_or(StubError::Unsupported)
    }

    pub fn len(&self) -> usize {
        self.thunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.lock().is_empty()
    }
}

impl CallAdapter for MsAbiThunks {
    fn wrap(&self, _module: &str, address: SymbolAddr) -> Result<SymbolAddr, StubError> {
        self.thunk_for(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thunk_shuffles_arguments() {
        let bytes = thunk_code(0x1000).unwrap();
        // push rbp; mov rbp, rsp
        assert_eq!(&bytes[..4], &[0x55, 0x48, 0x89, 0xE5]);
        // mov rsp, rbp; pop rbp; ret
        assert_eq!(&bytes[bytes.len() - 5..], &[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }
}

#[cfg(all(test, unix, target_arch = "x86_64"))]
mod exec_tests {
    use super::*;

    extern "win64" fn weighted(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64) -> i64 {
        a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f
    }

    #[test]
    fn test_thunk_calls_win64_function() {
        let thunks = MsAbiThunks::new();
        let target = SymbolAddr::new(weighted as usize).unwrap();
        let thunk = thunks.thunk_for(target).unwrap();
        let f: extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64 =
            unsafe { std::mem::transmute(thunk.get()) };

        assert_eq!(f(1, 1, 1, 1, 1, 1), 21);
        assert_eq!(f(1, 2, 3, 4, 5, 6), 91);
    }

    #[test]
    fn test_thunks_are_cached() {
        let thunks = MsAbiThunks::new();
        let target = SymbolAddr::new(weighted as usize).unwrap();
        let first = thunks.thunk_for(target).unwrap();
        let second = thunks.wrap("mod", target).unwrap();
        assert_eq!(first, second);
        assert_eq!(thunks.len(), 1);
    }
}
