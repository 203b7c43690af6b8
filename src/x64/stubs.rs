//! Lazy-binding machine code: the resolver trampoline and per-entry call stubs.
//!
//! A call stub loads its entry pointer into `r11` and jumps through the
//! entry's first word (`jump_target`). While the entry is unresolved that word
//! holds the trampoline, which saves the argument registers, calls the resolve
//! function with the entry pointer and tail-jumps to the returned address. A
//! failed resolution returns 0 to the original call site.

use iced_x86::code_asm::*;

use super::{assemble, ExecMemory, StubError};

/// Bytes reserved per call stub.
pub const STUB_SLOT_SIZE: usize = 16;

/// Stack space for the eight vector argument registers, plus 8 for alignment.
const XMM_SAVE_AREA: i32 = 8 * 16 + 8;

/// The shared resolver trampoline.
#[derive(Debug)]
pub struct ResolverTrampoline {
    code: ExecMemory,
}

impl ResolverTrampoline {
    /// Emit a trampoline calling `resolve_fn(entry) -> address`.
    ///
    /// `resolve_fn` must use the System V calling convention.
    pub fn new(resolve_fn: usize) -> Result<Self, StubError> {
        let bytes = trampoline_code(resolve_fn as u64)?;
        Ok(Self {
            code: ExecMemory::new(&bytes)?,
        })
    }

    pub fn address(&self) -> usize {
        self.code.addr()
    }
}

fn trampoline_code(resolve_fn: u64) -> Result<Vec<u8>, StubError> {
    const XMM_ARGS: [AsmRegisterXmm; 8] = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];

    assemble(|a| {
        let mut fail = a.create_label();

        for reg in [rdi, rsi, rdx, rcx, r8, r9, rax, r11] {
            a.push(reg)?;
        }
        a.sub(rsp, XMM_SAVE_AREA)?;
        for (i, reg) in XMM_ARGS.into_iter().enumerate() {
            a.movdqu(xmmword_ptr(rsp + (i as i32) * 16), reg)?;
        }

        a.mov(rdi, r11)?;
        a.mov(rax, resolve_fn)?;
        a.call(rax)?;
        a.mov(r10, rax)?;

        for (i, reg) in XMM_ARGS.into_iter().enumerate() {
            a.movdqu(reg, xmmword_ptr(rsp + (i as i32) * 16))?;
        }
        a.add(rsp, XMM_SAVE_AREA)?;
        for reg in [r11, rax, r9, r8, rcx, rdx, rsi, rdi] {
            a.pop(reg)?;
        }

        a.test(r10, r10)?;
        a.je(fail)?;
        a.jmp(r10)?;

        a.set_label(&mut fail)?;
        a.xor(eax, eax)?;
        a.ret()?;
        Ok(())
    })
}

/// Encode one call stub for the entry at `entry_ptr`, padded to a full slot.
pub fn call_stub_code(entry_ptr: usize) -> Result<Vec<u8>, StubError> {
    let mut bytes = assemble(|a| {
        a.mov(r11, entry_ptr as u64)?;
        a.jmp(qword_ptr(r11))?;
        Ok(())
    })?;
    if bytes.len() > STUB_SLOT_SIZE {
        return Err(StubError::Assembly(format!(
            "call stub is {} bytes, slot holds {}",
            bytes.len(),
            STUB_SLOT_SIZE
        )));
    }
    bytes.resize(STUB_SLOT_SIZE, 0xCC);
    Ok(bytes)
}

/// A contiguous run of call stubs, one slot per entry pointer.
#[derive(Debug)]
pub struct StubBlock {
    code: ExecMemory,
    count: usize,
}

impl StubBlock {
    pub fn new(entry_ptrs: &[usize]) -> Result<Self, StubError> {
        let mut bytes = Vec::with_capacity(entry_ptrs.len() * STUB_SLOT_SIZE);
        for &entry in entry_ptrs {
            bytes.extend(call_stub_code(entry)?);
        }
        Ok(Self {
            code: ExecMemory::new(&bytes)?,
            count: entry_ptrs.len(),
        })
    }

    /// Address of the `i`th stub.
    pub fn stub_address(&self, i: usize) -> Option<usize> {
        (i < self.count).then(|| self.code.addr() + i * STUB_SLOT_SIZE)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}


#[cfg(all(test, unix, target_arch = "x86_64"))]
mod exec_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(C)]
    struct FakeEntry {
        jump_target: AtomicUsize,
        resolved: usize,
    }

    extern "C" fn add_three(a: i64, b: i64, c: i64) -> i64 {
        a + b + c
    }

    extern "C" fn resolve_fake(entry: *const FakeEntry) -> usize {
        let entry = unsafe { &*entry };
        entry.jump_target.store(entry.resolved, Ordering::Release);
        entry.resolved
    }

    extern "C" fn resolve_nothing(_entry: *const FakeEntry) -> usize {
        0
    }

    #[test]
    fn test_stub_resolves_through_trampoline() {
        let trampoline = ResolverTrampoline::new(resolve_fake as usize).unwrap();
        let entry = Box::new(FakeEntry {
            jump_target: AtomicUsize::new(trampoline.address()),
            resolved: add_three as usize,
        });
        let block = StubBlock::new(&[&*entry as *const FakeEntry as usize]).unwrap();
        let stub: extern "C" fn(i64, i64, i64) -> i64 =
            unsafe { std::mem::transmute(block.stub_address(0).unwrap()) };

        assert_eq!(stub(1, 2, 3), 6);
        assert_eq!(entry.jump_target.load(Ordering::Acquire), add_three as usize);
        // second call goes straight to the target
        assert_eq!(stub(10, 20, 30), 60);
    }

    #[test]
    fn test_failed_resolution_returns_zero() {
        let trampoline = ResolverTrampoline::new(resolve_nothing as usize).unwrap();
        let entry = Box::new(FakeEntry {
            jump_target: AtomicUsize::new(trampoline.address()),
            resolved: 0,
        });
        let block = StubBlock::new(&[&*entry as *const FakeEntry as usize]).unwrap();
        let stub: extern "C" fn(i64) -> i64 =
            unsafe { std::mem::transmute(block.stub_address(0).unwrap()) };

        assert_eq!(stub(5), 0);
        assert!(block.stub_address(1).is_none());
    }
}
