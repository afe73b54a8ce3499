//! # Type & Value Model
//!
//! Every value the language manipulates is one of:
//!
//! - a **scalar** of kind `bool < int16 < int32 < int64 < float < double`
//! - a fixed-size **array** of scalars: vectors (2, 3 or 4 elements) and square
//!   matrices (9 or 16 elements)
//! - a **string**
//!
//! ## Precedence
//!
//! [`ScalarKind::precedence`] returns the wider of two scalar kinds under the
//! fixed ordering above. [`Type::precedence`] extends this element-wise to
//! containers; a size-1 operand (a bare scalar) broadcasts against a larger
//! container while two containers of different sizes have no common type.
//!
//! ## Names
//!
//! Types print with their surface names (`int32`, `vec3f`, `mat4d`, `string`)
//! so diagnostics read the same way programs are written.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element kinds, declared in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Boolean
    Bool,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
}

impl ScalarKind {
    /// All kinds in precedence order
    pub const ALL: [ScalarKind; 6] = [
        ScalarKind::Bool,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::Float,
        ScalarKind::Double,
    ];

    /// Return the wider of two kinds
    pub fn precedence(a: ScalarKind, b: ScalarKind) -> ScalarKind {
        a.max(b)
    }

    /// True for the three integer kinds (bool excluded)
    pub fn is_integer(self) -> bool {
        matches!(self, ScalarKind::Int16 | ScalarKind::Int32 | ScalarKind::Int64)
    }

    /// True for float and double
    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::Float | ScalarKind::Double)
    }

    /// Size in bytes of the natural storage of this kind
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Bool => 1,
            ScalarKind::Int16 => 2,
            ScalarKind::Int32 | ScalarKind::Float => 4,
            ScalarKind::Int64 | ScalarKind::Double => 8,
        }
    }

    /// Surface name of the kind
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int16 => "int16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
        }
    }

    /// Suffix letter used by vector and matrix names
    fn suffix(self) -> Option<char> {
        match self {
            ScalarKind::Int32 => Some('i'),
            ScalarKind::Float => Some('f'),
            ScalarKind::Double => Some('d'),
            _ => None,
        }
    }

    fn from_suffix(c: char) -> Option<ScalarKind> {
        match c {
            'i' => Some(ScalarKind::Int32),
            'f' => Some(ScalarKind::Float),
            'd' => Some(ScalarKind::Double),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A complete value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// No value (statements, void functions)
    Void,
    /// Single scalar
    Scalar(ScalarKind),
    /// Fixed-length array of one scalar kind (vectors and matrices)
    Array {
        /// Element kind
        elem: ScalarKind,
        /// Number of elements
        len: usize,
    },
    /// Byte string
    String,
}

impl Type {
    /// `bool`
    pub const BOOL: Type = Type::Scalar(ScalarKind::Bool);
    /// `int16`
    pub const INT16: Type = Type::Scalar(ScalarKind::Int16);
    /// `int32`
    pub const INT32: Type = Type::Scalar(ScalarKind::Int32);
    /// `int64`
    pub const INT64: Type = Type::Scalar(ScalarKind::Int64);
    /// `float`
    pub const FLOAT: Type = Type::Scalar(ScalarKind::Float);
    /// `double`
    pub const DOUBLE: Type = Type::Scalar(ScalarKind::Double);

    /// Array type of `len` elements
    pub fn array(elem: ScalarKind, len: usize) -> Type {
        Type::Array { elem, len }
    }

    /// Vector of 2, 3 or 4 elements
    pub fn vec(elem: ScalarKind, n: usize) -> Type {
        Type::Array { elem, len: n }
    }

    /// Square matrix of dimension 3 or 4
    pub fn mat(elem: ScalarKind, dim: usize) -> Type {
        Type::Array {
            elem,
            len: dim * dim,
        }
    }

    /// Parse a surface type name (`float`, `vec3i`, `mat4d`, `int`, `string`)
    pub fn parse(name: &str) -> Option<Type> {
        let t = match name {
            "bool" => Type::BOOL,
            "int16" => Type::INT16,
            "int" | "int32" => Type::INT32,
            "int64" => Type::INT64,
            "float" => Type::FLOAT,
            "double" => Type::DOUBLE,
            "string" => Type::String,
            "void" => Type::Void,
            _ => {
                let (shape, rest) = match (name.strip_prefix("vec"), name.strip_prefix("mat")) {
                    (Some(rest), _) => ("vec", rest),
                    (_, Some(rest)) => ("mat", rest),
                    _ => return None,
                };
                let mut chars = rest.chars();
                let (Some(digit), Some(suffix), None) = (chars.next(), chars.next(), chars.next())
                else {
                    return None;
                };
                let n = digit.to_digit(10)? as usize;
                let elem = ScalarKind::from_suffix(suffix)?;
                match shape {
                    "vec" if (2..=4).contains(&n) => Type::vec(elem, n),
                    "mat" if n == 3 || n == 4 => Type::mat(elem, n),
                    _ => return None,
                }
            }
        };
        Some(t)
    }

    /// True for `Scalar(_)`
    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    /// True for `Array{..}`
    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    /// True for `String`
    pub fn is_string(&self) -> bool {
        matches!(self, Type::String)
    }

    /// True for `Void`
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// True for 9 and 16 element arrays
    pub fn is_matrix(&self) -> bool {
        matches!(self, Type::Array { len: 9 | 16, .. })
    }

    /// Scalar kind of a scalar, element kind of an array
    pub fn element(&self) -> Option<ScalarKind> {
        match self {
            Type::Scalar(k) => Some(*k),
            Type::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Number of scalar elements (1 for scalars, 0 for void and strings)
    pub fn len(&self) -> usize {
        match self {
            Type::Scalar(_) => 1,
            Type::Array { len, .. } => *len,
            _ => 0,
        }
    }

    /// True when the type carries no scalar elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matrix dimension (3 or 4) of a matrix type
    pub fn matrix_dim(&self) -> Option<usize> {
        match self {
            Type::Array { len: 9, .. } => Some(3),
            Type::Array { len: 16, .. } => Some(4),
            _ => None,
        }
    }

    /// Same shape with a different element kind
    pub fn with_element(&self, kind: ScalarKind) -> Type {
        match self {
            Type::Scalar(_) => Type::Scalar(kind),
            Type::Array { len, .. } => Type::Array {
                elem: kind,
                len: *len,
            },
            other => *other,
        }
    }

    /// Wider of two types, element-wise for containers
    ///
    /// Returns `None` for incompatible shapes: two containers of different
    /// lengths, strings mixed with numbers, or void.
    pub fn precedence(a: &Type, b: &Type) -> Option<Type> {
        match (a, b) {
            (Type::Scalar(x), Type::Scalar(y)) => {
                Some(Type::Scalar(ScalarKind::precedence(*x, *y)))
            }
            (Type::Array { elem: x, len: n }, Type::Array { elem: y, len: m }) => {
                if n != m {
                    return None;
                }
                Some(Type::Array {
                    elem: ScalarKind::precedence(*x, *y),
                    len: *n,
                })
            }
            (Type::Scalar(x), Type::Array { elem, len })
            | (Type::Array { elem, len }, Type::Scalar(x)) => Some(Type::Array {
                elem: ScalarKind::precedence(*x, *elem),
                len: *len,
            }),
            (Type::String, Type::String) => Some(Type::String),
            _ => None,
        }
    }

    /// Whether a value of this type may be implicitly converted to `target`
    ///
    /// Scalars convert among themselves, arrays convert element-wise when the
    /// lengths agree and a scalar may broadcast into an array. Strings only
    /// convert to strings.
    pub fn converts_to(&self, target: &Type) -> bool {
        match (self, target) {
            (Type::Scalar(_), Type::Scalar(_)) => true,
            (Type::Array { len: n, .. }, Type::Array { len: m, .. }) => n == m,
            (Type::Scalar(_), Type::Array { .. }) => true,
            (Type::String, Type::String) => true,
            (Type::Void, Type::Void) => true,
            _ => false,
        }
    }
}

impl From<ScalarKind> for Type {
    fn from(kind: ScalarKind) -> Self {
        Type::Scalar(kind)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Scalar(k) => f.write_str(k.name()),
            Type::String => f.write_str("string"),
            Type::Array { elem, len } => {
                let named = match (len, elem.suffix()) {
                    (2..=4, Some(s)) => Some(format!("vec{}{}", len, s)),
                    (9, Some(s)) => Some(format!("mat3{}", s)),
                    (16, Some(s)) => Some(format!("mat4{}", s)),
                    _ => None,
                };
                match named {
                    Some(n) => f.write_str(&n),
                    None => write!(f, "{}[{}]", elem, len),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_precedence_ordering() {
        use ScalarKind::*;
        assert_eq!(ScalarKind::precedence(Bool, Int16), Int16);
        assert_eq!(ScalarKind::precedence(Int64, Int32), Int64);
        assert_eq!(ScalarKind::precedence(Int64, Float), Float);
        assert_eq!(ScalarKind::precedence(Double, Float), Double);
        assert_eq!(ScalarKind::precedence(Bool, Bool), Bool);
    }

    #[test]
    fn test_container_precedence_is_elementwise() {
        let v3i = Type::vec(ScalarKind::Int32, 3);
        let v3f = Type::vec(ScalarKind::Float, 3);
        assert_eq!(Type::precedence(&v3i, &v3f), Some(v3f));
        assert_eq!(
            Type::precedence(&Type::DOUBLE, &v3i),
            Some(Type::vec(ScalarKind::Double, 3))
        );
        assert_eq!(
            Type::precedence(&v3i, &Type::vec(ScalarKind::Int32, 4)),
            None
        );
        assert_eq!(Type::precedence(&Type::String, &Type::FLOAT), None);
    }

    #[test]
    fn test_parse_and_display_roundtrip_names() {
        for name in [
            "bool", "int16", "int32", "int64", "float", "double", "vec2i", "vec3f", "vec4d",
            "mat3f", "mat4d", "mat3i", "mat4i", "string",
        ] {
            let t = Type::parse(name).unwrap();
            assert_eq!(t.to_string(), name);
        }
        assert_eq!(Type::parse("int"), Some(Type::INT32));
        assert_eq!(Type::parse("mat3i"), Some(Type::mat(ScalarKind::Int32, 3)));
        assert_eq!(Type::parse("vec5f"), None);
        assert_eq!(Type::parse("mat2f"), None);
        assert_eq!(Type::parse("vec3l"), None);
    }

    #[test]
    fn test_parse_rejects_non_ascii_names() {
        for name in ["abé3f", "vecé3", "maé3f", "vec3é", "éééé", "mat4\u{1f600}", "vé"] {
            assert_eq!(Type::parse(name), None, "{}", name);
        }
    }

    #[test]
    fn test_matrix_shape() {
        let m = Type::mat(ScalarKind::Float, 4);
        assert!(m.is_matrix());
        assert_eq!(m.matrix_dim(), Some(4));
        assert_eq!(m.len(), 16);
        assert!(!Type::vec(ScalarKind::Float, 4).is_matrix());
    }
}
