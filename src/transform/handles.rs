//! Generation-stamped handles to payload operations.
//!
//! A [Handle] is an index into a [HandleArena] plus the generation of its entry at the time the
//! handle was issued. Invalidating an entry bumps its generation, so every copy of an older handle
//! is detected as stale on dereference.

use crate::ir::{OpId, Program};
use crate::transform::TransformError;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Clone, Debug)]
struct Entry {
    payload: Vec<OpId>,
    generation: u32,
    consumed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct HandleArena {
    entries: Vec<Entry>,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, payload: Vec<OpId>) -> Handle {
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            payload,
            generation: 0,
            consumed: false,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    fn entry(&self, handle: Handle) -> Result<&Entry, TransformError> {
        let entry = self
            .entries
            .get(handle.index as usize)
            .ok_or(TransformError::UnknownHandle(handle))?;
        if entry.consumed {
            return Err(TransformError::ConsumedHandle(handle));
        }
        if entry.generation != handle.generation {
            return Err(TransformError::StaleHandle(handle));
        }
        Ok(entry)
    }

    /// The live payload of `handle`.
    pub fn get<'a>(&'a self, program: &Program, handle: Handle) -> Result<&'a [OpId], TransformError> {
        let entry = self.entry(handle)?;
        if entry.payload.iter().any(|op| program.is_erased(*op)) {
            return Err(TransformError::ErasedPayload(handle));
        }
        Ok(&entry.payload)
    }

    /// Returns `true` if `handle` can still be dereferenced.
    pub fn is_valid(&self, program: &Program, handle: Handle) -> bool {
        self.get(program, handle).is_ok()
    }

    /// Marks `handle` as consumed. Later dereferences fail.
    pub fn consume(&mut self, handle: Handle) -> Result<(), TransformError> {
        self.entry(handle)?;
        self.entries[handle.index as usize].consumed = true;
        Ok(())
    }

    /// Invalidates every entry with a payload op nested strictly inside one of `boundary`.
    /// Returns the number of invalidated entries.
    pub fn invalidate_within(&mut self, program: &Program, boundary: &[OpId]) -> usize {
        let mut invalidated = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.consumed) {
            let inside = entry.payload.iter().any(|op| {
                boundary
                    .iter()
                    .any(|b| program.is_erased(*op) || program.is_proper_ancestor(*b, *op))
            });
            if inside {
                entry.generation += 1;
                invalidated += 1;
            }
        }
        invalidated
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%h{}#{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::arith;
    use crate::ir::Builder;

    #[test]
    fn test_stale_and_consumed_handles_are_reported() {
        let mut program = Program::new();
        let (func, body) = program.add_function("f", &[], &[]);
        let mut b = Builder::at_end(&mut program, body);
        let one = arith::constant_index(&mut b, 1);
        let constant = program.defining_op(one).unwrap();

        let mut arena = HandleArena::new();
        let func_handle = arena.insert(vec![func]);
        let inner = arena.insert(vec![constant]);
        let copy = inner;
        assert_eq!(arena.get(&program, inner), Ok(&[constant][..]));

        assert_eq!(arena.invalidate_within(&program, &[func]), 1);
        assert_eq!(arena.get(&program, copy), Err(TransformError::StaleHandle(copy)));
        // The boundary itself stays valid.
        assert!(arena.is_valid(&program, func_handle));

        arena.consume(func_handle).unwrap();
        assert_eq!(
            arena.get(&program, func_handle),
            Err(TransformError::ConsumedHandle(func_handle))
        );
        assert_eq!(
            arena.consume(func_handle),
            Err(TransformError::ConsumedHandle(func_handle))
        );
    }

    #[test]
    fn test_erased_payload_is_reported() {
        let mut program = Program::new();
        let (_, body) = program.add_function("f", &[], &[]);
        let mut b = Builder::at_end(&mut program, body);
        let one = arith::constant_index(&mut b, 1);
        let constant = program.defining_op(one).unwrap();
        let mut arena = HandleArena::new();
        let handle = arena.insert(vec![constant]);
        program.erase_op(constant);
        assert_eq!(
            arena.get(&program, handle),
            Err(TransformError::ErasedPayload(handle))
        );
    }
}
