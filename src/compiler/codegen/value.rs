//! Operands produced while lowering expressions

use crate::compiler::ir::Reg;
use crate::error::{Error, Result};
use crate::runtime::SlotType;
use crate::types::{ScalarKind, Type};

/// Result of lowering one expression
///
/// Scalars live in registers. Containers and strings live in frame slots and
/// are carried as pointers; a slot value never outlives the kernel frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Statement-like expression with no result (void calls)
    Void,
    /// Immediate scalar
    Scalar {
        /// Register holding the value
        reg: Reg,
        /// Kind of the register
        kind: ScalarKind,
    },
    /// Pointer to an array or string slot
    Slot {
        /// Register holding the slot pointer
        ptr: Reg,
        /// Type stored in the slot
        ty: Type,
    },
}

impl Value {
    /// Type of the operand
    pub fn ty(&self) -> Type {
        match self {
            Value::Void => Type::Void,
            Value::Scalar { kind, .. } => Type::Scalar(*kind),
            Value::Slot { ty, .. } => *ty,
        }
    }

    /// Register carrying the operand
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Value::Void => None,
            Value::Scalar { reg, .. } => Some(*reg),
            Value::Slot { ptr, .. } => Some(*ptr),
        }
    }
}

/// An assignable location
#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    /// Local variable slot
    Local {
        /// Slot pointer
        ptr: Reg,
        /// Declared type
        ty: Type,
    },
    /// One element of a local container
    Element {
        /// Element pointer
        ptr: Reg,
        /// Element kind
        kind: ScalarKind,
    },
    /// Whole attribute or voxel value
    Attribute {
        /// Attribute name
        name: String,
        /// Access type
        ty: Type,
    },
    /// One element of a container attribute
    AttributeElement {
        /// Attribute name
        name: String,
        /// Access type of the whole attribute
        ty: Type,
        /// Element index register
        index: Reg,
    },
}

impl Place {
    /// Type of a value stored into the place
    pub fn ty(&self) -> Type {
        match self {
            Place::Local { ty, .. } | Place::Attribute { ty, .. } => *ty,
            Place::Element { kind, .. } => Type::Scalar(*kind),
            Place::AttributeElement { ty, .. } => {
                Type::Scalar(ty.element().unwrap_or(ScalarKind::Float))
            }
        }
    }
}

/// Outcome of lowering a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Control continues to the next statement
    Next,
    /// The current block was terminated by return, break or continue
    Diverged,
}

/// Frame slot layout for a value type
pub fn slot_type(ty: Type) -> Result<SlotType> {
    match ty {
        Type::Scalar(kind) => Ok(SlotType::Scalar(kind)),
        Type::Array { elem, len } => Ok(SlotType::Array(elem, len)),
        Type::String => Ok(SlotType::Str),
        Type::Void => Err(Error::TypeError {
            expected: "a value type".to_string(),
            got: "void".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_types() {
        let v3f = Type::vec(ScalarKind::Float, 3);
        let elem = Place::AttributeElement {
            name: "v".into(),
            ty: v3f,
            index: Reg(0),
        };
        assert_eq!(elem.ty(), Type::FLOAT);
        assert_eq!(Value::Slot { ptr: Reg(1), ty: v3f }.ty(), v3f);
        assert!(slot_type(Type::Void).is_err());
    }
}
