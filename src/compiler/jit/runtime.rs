//! Per-call runtime state and the helpers compiled code calls into
//!
//! Compiled functions receive a pointer to a [`Runtime`] as their first
//! argument. They read cell memory through `cells`/`len` directly and call
//! the `extern "C"` helpers below for anything that allocates, touches
//! strings, or runs a native builtin. Helpers record failures in
//! `Runtime::error` and return a nonzero status.

use super::{CallContext, NativeFn};
use crate::error::{Error, Result};
use crate::runtime::{KernelEnv, Memory, Ptr, SlotType, Word};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub(super) const ALLOCA: &str = "ax.rt.alloca";
pub(super) const MARK: &str = "ax.rt.mark";
pub(super) const RELEASE: &str = "ax.rt.release";
pub(super) const CALL_NATIVE: &str = "ax.rt.call_native";
pub(super) const INDEX_ERROR: &str = "ax.rt.index_error";
pub(super) const MEMORY_FAULT: &str = "ax.rt.memory_fault";
pub(super) const UNREACHABLE: &str = "ax.rt.unreachable";
pub(super) const STR_STORE: &str = "ax.rt.str_store";
pub(super) const STR_LEN: &str = "ax.rt.str_len";
pub(super) const STR_RESIZE: &str = "ax.rt.str_resize";
pub(super) const STR_COPY: &str = "ax.rt.str_copy";

/// Byte offset of `Runtime::cells`
pub(super) const CELLS_OFFSET: i32 = 0;
/// Byte offset of `Runtime::len`
pub(super) const LEN_OFFSET: i32 = 8;

/// State of one call into compiled code
///
/// `cells` and `len` mirror the memory arena and are refreshed by every
/// helper that may reallocate it.
#[repr(C)]
pub(super) struct Runtime<'a> {
    cells: *mut Word,
    len: u64,
    memory: *mut Memory,
    env: *mut (dyn KernelEnv + 'a),
    names: &'a [String],
    error: Option<Error>,
}

impl<'a> Runtime<'a> {
    pub(super) fn new(memory: &'a mut Memory, env: &'a mut dyn KernelEnv, names: &'a [String]) -> Self {
        let mut rt = Self {
            cells: std::ptr::null_mut(),
            len: 0,
            memory,
            env,
            names,
            error: None,
        };
        rt.sync();
        rt
    }

    /// Pointer handed to compiled code
    pub(super) fn as_ptr(&mut self) -> *mut u8 {
        self as *mut Self as *mut u8
    }

    pub(super) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    fn sync(&mut self) {
        // SAFETY: `memory` outlives the runtime and no other borrow is live
        let memory = unsafe { &mut *self.memory };
        self.len = memory.mark() as u64;
        self.cells = memory.cells_ptr();
    }

    fn memory(&mut self) -> &mut Memory {
        // SAFETY: as in `sync`
        unsafe { &mut *self.memory }
    }

    fn fail(&mut self, err: Error) -> u32 {
        if self.error.is_none() {
            self.error = Some(err);
        }
        1
    }

    /// Run a helper body, turning errors and panics into a failed status
    fn guard(&mut self, body: impl FnOnce(&mut Self) -> Result<u32>) -> u32 {
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut *self)));
        self.sync();
        match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => self.fail(err),
            Err(_) => self.fail(Error::execution("kernel helper panicked")),
        }
    }
}

/// SAFETY: `rt` must come from [`Runtime::as_ptr`] of a live runtime
unsafe fn runtime<'r>(rt: *mut u8) -> &'r mut Runtime<'r> {
    &mut *(rt as *mut Runtime<'r>)
}

fn slot_of(code: u32, count: u32) -> Result<SlotType> {
    let n = count as usize;
    match code {
        Word::TAG_STR => Ok(SlotType::Str),
        Word::TAG_HANDLE => Ok(SlotType::Handles(n)),
        tag => Word::kind_of_tag(tag)
            .map(|k| SlotType::Array(k, n))
            .ok_or_else(|| Error::execution(format!("no slot layout for cell tag {}", tag))),
    }
}

extern "C" fn alloca(rt: *mut u8, code: u32, count: u32) -> u32 {
    let rt = unsafe { runtime(rt) };
    let mut cell = 0;
    let status = rt.guard(|rt| {
        let slot = slot_of(code, count)?;
        cell = rt.memory().alloca(slot).0;
        Ok(0)
    });
    // on failure the error is recorded and the returned cell faults on first use
    if status == 0 {
        cell
    } else {
        u32::MAX
    }
}

extern "C" fn mark(rt: *mut u8) -> u64 {
    let rt = unsafe { runtime(rt) };
    rt.memory().mark() as u64
}

extern "C" fn release(rt: *mut u8, mark: u64) {
    let rt = unsafe { runtime(rt) };
    rt.memory().release(mark as usize);
    rt.sync();
}

extern "C" fn call_native(
    rt: *mut u8,
    func: *const u8,
    args: *const Word,
    argc: u32,
    out: *mut Word,
    ret_tag: u32,
) -> u32 {
    let rt = unsafe { runtime(rt) };
    // SAFETY: `func` is the address registered for a `NativeFn` symbol
    let func: NativeFn = unsafe { std::mem::transmute::<*const u8, NativeFn>(func) };
    let args: &[Word] = if argc == 0 {
        &[]
    } else {
        // SAFETY: compiled code passes `argc` initialised words
        unsafe { std::slice::from_raw_parts(args, argc as usize) }
    };
    rt.guard(|rt| {
        let result = {
            // SAFETY: memory and env are exclusively lent to this call
            let mut ctx = CallContext {
                memory: unsafe { &mut *rt.memory },
                env: unsafe { &mut *rt.env },
            };
            func(&mut ctx, args)?
        };
        if let Some(kind) = Word::kind_of_tag(ret_tag) {
            // SAFETY: `out` points at a word sized slot of the caller
            unsafe { out.write(result.cast(kind)) };
        }
        Ok(0)
    })
}

extern "C" fn index_error(rt: *mut u8, index: i64, len: i64) -> u32 {
    let rt = unsafe { runtime(rt) };
    rt.fail(Error::execution(format!(
        "index {} out of range for a container of {} elements",
        index, len
    )))
}

extern "C" fn memory_fault(rt: *mut u8, cell: i64) -> u32 {
    let rt = unsafe { runtime(rt) };
    rt.fail(Error::execution(format!(
        "memory access out of bounds at cell {}",
        cell
    )))
}

extern "C" fn unreachable(rt: *mut u8, func: u32, block: u32) -> u32 {
    let rt = unsafe { runtime(rt) };
    let name = rt
        .names
        .get(func as usize)
        .cloned()
        .unwrap_or_else(|| format!("#{}", func));
    rt.fail(Error::execution(format!(
        "reached unreachable code in {} (bb{})",
        name, block
    )))
}

extern "C" fn str_store(rt: *mut u8, cell: u32, bytes: *const u8, len: u64) -> u32 {
    let rt = unsafe { runtime(rt) };
    let bytes: &[u8] = if len == 0 {
        &[]
    } else {
        // SAFETY: points at a constant data object of `len` bytes
        unsafe { std::slice::from_raw_parts(bytes, len as usize) }
    };
    rt.guard(|rt| rt.memory().write_string(Ptr(cell), bytes).map(|_| 0))
}

extern "C" fn str_len(rt: *mut u8, cell: u32) -> i64 {
    let rt = unsafe { runtime(rt) };
    let mut len = -1;
    rt.guard(|rt| {
        len = rt.memory().string(Ptr(cell))?.len() as i64;
        Ok(0)
    });
    len
}

extern "C" fn str_resize(rt: *mut u8, cell: u32, len: i64) -> u32 {
    let rt = unsafe { runtime(rt) };
    rt.guard(|rt| {
        rt.memory().string_mut(Ptr(cell))?.resize(len.max(0) as usize, 0);
        Ok(0)
    })
}

extern "C" fn str_copy(rt: *mut u8, dst: u32, offset: i64, src: u32) -> u32 {
    let rt = unsafe { runtime(rt) };
    rt.guard(|rt| {
        rt.memory()
            .copy_string(Ptr(dst), offset.max(0) as usize, Ptr(src))
            .map(|_| 0)
    })
}

/// Helper symbols registered with the JIT linker
pub(super) fn symbols() -> Vec<(&'static str, *const u8)> {
    vec![
        (ALLOCA, alloca as *const u8),
        (MARK, mark as *const u8),
        (RELEASE, release as *const u8),
        (CALL_NATIVE, call_native as *const u8),
        (INDEX_ERROR, index_error as *const u8),
        (MEMORY_FAULT, memory_fault as *const u8),
        (UNREACHABLE, unreachable as *const u8),
        (STR_STORE, str_store as *const u8),
        (STR_LEN, str_len as *const u8),
        (STR_RESIZE, str_resize as *const u8),
        (STR_COPY, str_copy as *const u8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NullEnv;
    use crate::types::ScalarKind;

    #[test]
    fn test_header_layout() {
        let mut memory = Memory::new();
        memory.alloca(SlotType::Array(ScalarKind::Int32, 4));
        let mut env = NullEnv;
        let mut rt = Runtime::new(&mut memory, &mut env, &[]);
        let base = rt.as_ptr();
        let len = unsafe { *(base.add(LEN_OFFSET as usize) as *const u64) };
        assert_eq!(len, 4);
        let cells = unsafe { *(base.add(CELLS_OFFSET as usize) as *const *mut Word) };
        assert_eq!(unsafe { *cells.add(3) }, Word::I32(0));
    }

    #[test]
    fn test_helpers_report_through_the_runtime() {
        let mut memory = Memory::new();
        let mut env = NullEnv;
        let names = vec!["kernel".to_string()];
        let mut rt = Runtime::new(&mut memory, &mut env, &names);
        let p = rt.as_ptr();
        let cell = alloca(p, Word::TAG_STR, 1);
        assert_eq!(str_store(p, cell, b"ab".as_ptr(), 2), 0);
        assert_eq!(str_len(p, cell), 2);
        // resizing a scalar cell fails and keeps the first error
        let scalar = alloca(p, Word::tag_of(ScalarKind::Float), 2);
        assert_eq!(str_resize(p, scalar, 4), 1);
        assert_eq!(unreachable(p, 0, 3), 1);
        let err = rt.take_error().unwrap().to_string();
        assert!(err.contains("string access to scalar cell"), "{}", err);
        assert_eq!(rt.len, 3);
    }
}
