//! String builtins and the string helpers used by generated code

use super::native::string;
use super::{Availability, FunctionGroup, FunctionRegistry, Signature};
use crate::compiler::jit::CallContext;
use crate::error::Result;
use crate::runtime::Word;
use crate::types::Type;
use sha2::{Digest, Sha256};

/// Leading integer of `s` in the manner of C `atoi`; 0 when there is none
pub fn parse_int_prefix(s: &str) -> i64 {
    let t = s.trim_start();
    let (negative, digits) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let mut value: i64 = 0;
    for c in digits.bytes().take_while(|c| c.is_ascii_digit()) {
        value = value.wrapping_mul(10).wrapping_add((c - b'0') as i64);
    }
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Longest leading float of `s`; 0 when there is none
pub fn parse_float_prefix(s: &str) -> f64 {
    let t = s.trim_start();
    let end = t
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    (1..=end)
        .rev()
        .find_map(|n| t[..n].parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// First eight bytes of the SHA-256 digest, little endian
pub fn hash_str(s: &str) -> i64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(bytes)
}

fn atoi(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(Word::I32(parse_int_prefix(&string(ctx, args, 0)?) as i32))
}

fn atof(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(Word::F64(parse_float_prefix(&string(ctx, args, 0)?)))
}

fn hash(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(Word::I64(hash_str(&string(ctx, args, 0)?)))
}

/// Three-way comparison of two strings: -1, 0 or 1
fn strcmp(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let a = string(ctx, args, 0)?;
    let b = string(ctx, args, 1)?;
    Ok(Word::I32(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.insert("atoi", Availability::All, || {
        FunctionGroup::new("atoi").with(Signature::native(vec![Type::String], Type::INT32, atoi))
    });
    registry.insert("atof", Availability::All, || {
        FunctionGroup::new("atof").with(Signature::native(vec![Type::String], Type::DOUBLE, atof))
    });
    registry.insert("hash", Availability::All, || {
        FunctionGroup::new("hash").with(Signature::native(vec![Type::String], Type::INT64, hash))
    });
    registry.insert("ax.strcmp", Availability::All, || {
        FunctionGroup::new("ax.strcmp")
            .internal()
            .with(Signature::native(vec![Type::String, Type::String], Type::INT32, strcmp))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atoi_prefix() {
        assert_eq!(parse_int_prefix("  42abc"), 42);
        assert_eq!(parse_int_prefix("-17"), -17);
        assert_eq!(parse_int_prefix("abc"), 0);
    }

    #[test]
    fn test_atof_prefix() {
        assert_eq!(parse_float_prefix("2.5e2x"), 250.0);
        assert_eq!(parse_float_prefix("-0.5"), -0.5);
        assert_eq!(parse_float_prefix("x1"), 0.0);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_str("foo"), hash_str("foo"));
        assert_ne!(hash_str("foo"), hash_str("bar"));
    }
}
