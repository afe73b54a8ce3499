//! Scoped local variable bindings

use crate::compiler::ir::Reg;
use crate::error::{Error, Result};
use crate::types::Type;
use std::collections::HashMap;

/// Storage of a declared local
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Local {
    /// Slot pointer
    pub ptr: Reg,
    /// Declared type
    pub ty: Type,
}

/// Result of a successful declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
    /// No visible binding had this name
    Fresh,
    /// An enclosing scope already binds the name
    Shadows,
}

#[derive(Debug)]
struct Scope {
    id: usize,
    names: HashMap<String, Local>,
}

/// Stack of scopes keyed by a monotonically increasing scope id
///
/// Leaving a scope drops its bindings; instructions already emitted for the
/// scope are unaffected.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    next_id: usize,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Table holding only the outermost scope
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                id: 0,
                names: HashMap::new(),
            }],
            next_id: 1,
        }
    }

    /// Enter a nested scope and return its id
    pub fn push(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.scopes.push(Scope {
            id,
            names: HashMap::new(),
        });
        id
    }

    /// Leave the innermost scope; the outermost scope is never removed
    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Id of the innermost scope
    pub fn current(&self) -> usize {
        self.scopes.last().map(|s| s.id).unwrap_or(0)
    }

    /// Number of active scopes
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Bind `name` in the innermost scope
    pub fn declare(&mut self, name: &str, local: Local) -> Result<Declared> {
        let shadows = self.scopes[..self.scopes.len() - 1]
            .iter()
            .any(|s| s.names.contains_key(name));
        let scope = self
            .scopes
            .last_mut()
            .ok_or_else(|| Error::execution("symbol table has no scope"))?;
        if scope.names.contains_key(name) {
            return Err(Error::Redeclaration {
                name: name.to_string(),
            });
        }
        scope.names.insert(name.to_string(), local);
        Ok(if shadows {
            Declared::Shadows
        } else {
            Declared::Fresh
        })
    }

    /// Innermost visible binding of `name`
    pub fn find(&self, name: &str) -> Option<Local> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.names.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(r: u32) -> Local {
        Local {
            ptr: Reg(r),
            ty: Type::INT32,
        }
    }

    #[test]
    fn test_redeclaration_in_one_scope() {
        let mut table = SymbolTable::new();
        assert_eq!(table.declare("a", local(0)), Ok(Declared::Fresh));
        assert!(matches!(
            table.declare("a", local(1)),
            Err(Error::Redeclaration { .. })
        ));
    }

    #[test]
    fn test_shadowing_and_scope_exit() {
        let mut table = SymbolTable::new();
        table.declare("a", local(0)).unwrap();
        let id = table.push();
        assert!(id > table.scopes[0].id);
        assert_eq!(table.declare("a", local(1)), Ok(Declared::Shadows));
        assert_eq!(table.find("a").map(|l| l.ptr), Some(Reg(1)));
        table.pop();
        assert_eq!(table.find("a").map(|l| l.ptr), Some(Reg(0)));
        assert_eq!(table.current(), 0);
    }

    #[test]
    fn test_scope_ids_increase() {
        let mut table = SymbolTable::new();
        let a = table.push();
        table.pop();
        let b = table.push();
        assert!(b > a);
        table.pop();
        table.pop();
        assert_eq!(table.depth(), 1);
    }
}
