//! Managed-side value representation.
//!
//! `Value` is what application code hands the dispatcher and what the
//! dispatcher (or a trampoline) hands back: scalars, strings, interned
//! native handles, and registered callback trampolines.

use crate::registry::Wrapper;
use crate::trampoline::TrampolineId;

/// A value crossing the native-call boundary.
#[derive(Debug, Clone)]
pub enum Value {
    /// 64-bit integer; narrower declared widths truncate on marshal and
    /// sign- or zero-extend on unmarshal. Unsigned 64-bit values travel as
    /// the same bit pattern.
    Int(i64),
    /// Double-precision float; `Float { width: W32 }` slots narrow to f32.
    Float(f64),
    Bool(bool),
    Str(String),
    /// An interned native handle.
    Handle(Wrapper),
    /// A registered callback trampoline, marshalled as its function pointer.
    Callback(TrampolineId),
    Null,
    /// No value (void returns).
    Void,
}

impl Value {
    /// Short name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Handle(_) => "handle",
            Self::Callback(_) => "callback",
            Self::Null => "null",
            Self::Void => "void",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Wrapper> {
        match self {
            Self::Handle(w) => Some(w),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            // Handle equality is identity, not structural.
            (Self::Handle(a), Self::Handle(b)) => a.same_identity(b),
            (Self::Callback(a), Self::Callback(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Void, Self::Void) => true,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Int(7).as_f64(), None);
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Str("x".into()).as_str(), Some("x"));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(3i64), Value::Int(3));
        assert_eq!(Value::from("hi"), Value::Str("hi".into()));
        assert_eq!(Value::from(false), Value::Bool(false));
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }
}
