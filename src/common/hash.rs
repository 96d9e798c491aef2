// Map-key hashing rules (§3.1, §4.1 "is-hashable").
//
// A value is hashable iff it is null, a bool, a number, or a string. Arrays,
// maps, functions, natives and errors are reference types whose identity
// isn't structural, so the language rejects them as map keys at runtime
// rather than hashing by pointer (which would make key lookup depend on
// allocation order).
use crate::common::object::Value;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Null,
    Bool(bool),
    Fixed(i64),
    /// Bitwise representation of a float, so floats hash/compare
    /// consistently with equality on `f64` bit patterns.
    FloatBits(u64),
    Str(String),
}

impl HashKey {
    pub fn from_value(value: &Value) -> Result<HashKey, String> {
        match value {
            Value::Null => Ok(HashKey::Null),
            Value::Bool(b) => Ok(HashKey::Bool(*b)),
            Value::Fixed(i) => Ok(HashKey::Fixed(*i)),
            // A float that's numerically a whole number hashes the same as
            // the equivalent fixed-number, so `m[1]` and `m[1.0]` (equal
            // under `values_equal`) address the same map entry.
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(HashKey::Fixed(*f as i64)),
            Value::Float(f) => Ok(HashKey::FloatBits(f.to_bits())),
            Value::Str(s) => Ok(HashKey::Str(unsafe { s.as_ref().data.clone() })),
            other => Err(format!(
                "TypeMismatchException: unusable as map key (type '{}' is not hashable)",
                other.type_name()
            )),
        }
    }
}

/// Hashes a raw `str` without allocating a `HashKey` — used by the GC's
/// string pool/dedup table.
pub fn hash_str(s: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}
