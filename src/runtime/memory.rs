//! Kernel memory: a bump-allocated arena of cells shared by all frames of one worker
//!
//! Cells are plain [`Word`]s so compiled kernels address them directly. String
//! cells hold a [`Word::Str`] id into a side table of byte buffers.

use super::value::{Ptr, Word};
use crate::error::{Error, Result};
use crate::types::ScalarKind;

/// Layout of a stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// One scalar cell
    Scalar(ScalarKind),
    /// `len` consecutive scalar cells
    Array(ScalarKind, usize),
    /// One string cell
    Str,
    /// `len` consecutive handle cells
    Handles(usize),
}

impl SlotType {
    /// Number of cells the slot occupies
    pub fn cells(&self) -> usize {
        match self {
            SlotType::Scalar(_) | SlotType::Str => 1,
            SlotType::Array(_, n) | SlotType::Handles(n) => *n,
        }
    }
}

/// Arena of cells; frames allocate with [`Memory::alloca`] and release by
/// truncating back to a [`Memory::mark`]
#[derive(Debug, Default)]
pub struct Memory {
    cells: Vec<Word>,
    // (owning cell, bytes), ordered by cell
    strings: Vec<(u32, Vec<u8>)>,
}

impl Memory {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Current top of the arena
    pub fn mark(&self) -> usize {
        self.cells.len()
    }

    /// Release everything allocated since `mark`
    pub fn release(&mut self, mark: usize) {
        self.cells.truncate(mark);
        while matches!(self.strings.last(), Some((cell, _)) if *cell as usize >= mark) {
            self.strings.pop();
        }
    }

    /// Base address of the cells; invalidated by any allocation
    pub(crate) fn cells_ptr(&mut self) -> *mut Word {
        self.cells.as_mut_ptr()
    }

    fn push_string(&mut self, bytes: Vec<u8>) {
        let cell = self.cells.len() as u32;
        let id = self.strings.len() as u32;
        self.strings.push((cell, bytes));
        self.cells.push(Word::Str(id));
    }

    /// Allocate a zero-initialised slot
    pub fn alloca(&mut self, slot: SlotType) -> Ptr {
        let base = Ptr(self.cells.len() as u32);
        match slot {
            SlotType::Scalar(kind) => self.cells.push(Word::zero(kind)),
            SlotType::Array(kind, n) => self
                .cells
                .extend(std::iter::repeat(Word::zero(kind)).take(n)),
            SlotType::Str => self.push_string(Vec::new()),
            SlotType::Handles(n) => self
                .cells
                .extend(std::iter::repeat(Word::Handle(0)).take(n)),
        }
        base
    }

    /// Allocate and fill a slot of words
    pub fn alloc_words(&mut self, words: &[Word]) -> Ptr {
        let base = Ptr(self.cells.len() as u32);
        self.cells.extend_from_slice(words);
        base
    }

    /// Allocate a string slot holding `bytes`
    pub fn alloc_string(&mut self, bytes: &[u8]) -> Ptr {
        let base = Ptr(self.cells.len() as u32);
        self.push_string(bytes.to_vec());
        base
    }

    fn cell(&self, ptr: Ptr) -> Result<&Word> {
        self.cells.get(ptr.0 as usize).ok_or_else(|| {
            Error::execution(format!("memory access out of bounds at cell {}", ptr.0))
        })
    }

    fn cell_mut(&mut self, ptr: Ptr) -> Result<&mut Word> {
        self.cells.get_mut(ptr.0 as usize).ok_or_else(|| {
            Error::execution(format!("memory access out of bounds at cell {}", ptr.0))
        })
    }

    /// Load the word stored at `ptr`
    pub fn load(&self, ptr: Ptr) -> Result<Word> {
        match self.cell(ptr)? {
            Word::Str(_) => Err(Error::execution(format!(
                "scalar load from string cell {}",
                ptr.0
            ))),
            w => Ok(*w),
        }
    }

    /// Store a word at `ptr`; scalars are converted to the kind the cell holds
    pub fn store(&mut self, ptr: Ptr, value: Word) -> Result<()> {
        let cell = self.cell_mut(ptr)?;
        *cell = match (*cell, value.kind()) {
            (Word::Str(_), _) => {
                return Err(Error::execution(format!(
                    "scalar store to string cell {}",
                    ptr.0
                )))
            }
            (current, Some(_)) => match current.kind() {
                Some(kind) => value.cast(kind),
                None => value,
            },
            (_, None) => value,
        };
        Ok(())
    }

    /// Read `len` consecutive words
    pub fn read_words(&self, ptr: Ptr, len: usize) -> Result<Vec<Word>> {
        (0..len).map(|i| self.load(ptr.offset(i))).collect()
    }

    /// Read `len` consecutive words as f64
    pub fn read_f64s(&self, ptr: Ptr, len: usize) -> Result<Vec<f64>> {
        (0..len)
            .map(|i| self.load(ptr.offset(i)).map(|w| w.as_f64()))
            .collect()
    }

    /// Write words starting at `ptr`, converting each to the kind already stored
    pub fn write_words(&mut self, ptr: Ptr, words: &[Word]) -> Result<()> {
        for (i, w) in words.iter().enumerate() {
            self.store(ptr.offset(i), *w)?;
        }
        Ok(())
    }

    /// Write f64 values, converting to the kind already stored
    pub fn write_f64s(&mut self, ptr: Ptr, values: &[f64]) -> Result<()> {
        let words: Vec<Word> = values.iter().map(|v| Word::F64(*v)).collect();
        self.write_words(ptr, &words)
    }

    fn string_id(&self, ptr: Ptr) -> Result<usize> {
        match self.cell(ptr)? {
            Word::Str(id) if (*id as usize) < self.strings.len() => Ok(*id as usize),
            _ => Err(Error::execution(format!(
                "string access to scalar cell {}",
                ptr.0
            ))),
        }
    }

    /// Borrow the bytes of a string cell
    pub fn string(&self, ptr: Ptr) -> Result<&[u8]> {
        let id = self.string_id(ptr)?;
        Ok(&self.strings[id].1)
    }

    /// Mutably borrow the bytes of a string cell
    pub fn string_mut(&mut self, ptr: Ptr) -> Result<&mut Vec<u8>> {
        let id = self.string_id(ptr)?;
        Ok(&mut self.strings[id].1)
    }

    /// Copy the string at `ptr` into an owned `String` (lossy UTF-8)
    pub fn read_string(&self, ptr: Ptr) -> Result<String> {
        Ok(String::from_utf8_lossy(self.string(ptr)?).into_owned())
    }

    /// Replace the contents of the string cell at `ptr`
    pub fn write_string(&mut self, ptr: Ptr, value: &[u8]) -> Result<()> {
        let bytes = self.string_mut(ptr)?;
        bytes.clear();
        bytes.extend_from_slice(value);
        Ok(())
    }

    /// Copy the string at `src` into `dst` starting at byte `offset`, growing `dst`
    pub fn copy_string(&mut self, dst: Ptr, offset: usize, src: Ptr) -> Result<()> {
        let bytes = self.string(src)?.to_vec();
        let target = self.string_mut(dst)?;
        let end = offset + bytes.len();
        if target.len() < end {
            target.resize(end, 0);
        }
        target[offset..end].copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloca_and_release() {
        let mut mem = Memory::new();
        let mark = mem.mark();
        let v = mem.alloca(SlotType::Array(ScalarKind::Float, 3));
        assert_eq!(mem.load(v.offset(2)).unwrap(), Word::F32(0.0));
        mem.release(mark);
        assert!(mem.load(v).is_err());
    }

    #[test]
    fn test_write_words_converts_to_slot_kind() {
        let mut mem = Memory::new();
        let v = mem.alloca(SlotType::Array(ScalarKind::Int32, 2));
        mem.write_words(v, &[Word::F64(1.9), Word::F64(-2.2)]).unwrap();
        assert_eq!(mem.read_words(v, 2).unwrap(), vec![Word::I32(1), Word::I32(-2)]);
    }

    #[test]
    fn test_string_cells() {
        let mut mem = Memory::new();
        let s = mem.alloca(SlotType::Str);
        mem.write_string(s, b"abc").unwrap();
        assert_eq!(mem.read_string(s).unwrap(), "abc");
        assert!(mem.load(s).is_err());
        assert!(mem.store(s, Word::I32(1)).is_err());
    }

    #[test]
    fn test_release_drops_strings_of_the_frame() {
        let mut mem = Memory::new();
        let outer = mem.alloc_string(b"keep");
        let mark = mem.mark();
        let inner = mem.alloca(SlotType::Str);
        mem.copy_string(inner, 2, outer).unwrap();
        assert_eq!(mem.string(inner).unwrap(), b"\0\0keep");
        mem.release(mark);
        assert!(mem.string(inner).is_err());
        let again = mem.alloca(SlotType::Str);
        assert_eq!(mem.string(again).unwrap(), b"");
        assert_eq!(mem.read_string(outer).unwrap(), "keep");
    }

    #[test]
    fn test_store_keeps_cell_kind() {
        let mut mem = Memory::new();
        let c = mem.alloca(SlotType::Scalar(ScalarKind::Float));
        mem.store(c, Word::F64(0.5)).unwrap();
        assert_eq!(mem.load(c).unwrap(), Word::F32(0.5));
    }
}
