//! Argument marshalling: managed values into native call slots.
//!
//! A `Slot` owns the native representation of one argument for the duration
//! of the call frame; borrowed strings and buffers stay alive because the
//! managed values are held on the caller's stack for the whole synchronous
//! call. Slots must not move between `as_arg` and the invocation, so the
//! dispatcher collects them into a `Vec` first and only then borrows args.

use std::ffi::CString;
use std::os::raw::{c_char, c_void};

use libffi::middle;

use crate::descriptor::{FloatWidth, IntWidth, Ownership, TypeDesc};
use crate::registry::RegistryError;
use crate::trampoline::TrampolineRegistry;
use crate::value::Value;

/// Native representation of one argument, alive for the call frame.
pub(crate) enum Slot {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
    /// Borrowed string: the CString is the backing storage.
    Str { ptr: *const c_char, _keep: CString },
}

impl Slot {
    pub fn as_arg(&self) -> middle::Arg {
        match self {
            Self::I8(v) => middle::arg(v),
            Self::U8(v) => middle::arg(v),
            Self::I16(v) => middle::arg(v),
            Self::U16(v) => middle::arg(v),
            Self::I32(v) => middle::arg(v),
            Self::U32(v) => middle::arg(v),
            Self::I64(v) => middle::arg(v),
            Self::U64(v) => middle::arg(v),
            Self::F32(v) => middle::arg(v),
            Self::F64(v) => middle::arg(v),
            Self::Ptr(v) => middle::arg(v),
            Self::Str { ptr, .. } => middle::arg(ptr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// Value incompatible with the declared descriptor.
    TypeMismatch {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },
    /// Callback argument names a trampoline that was never registered.
    UnknownTrampoline { index: usize },
    /// Interior NUL byte; not representable as a C string.
    InvalidString { index: usize },
    Handle { index: usize, source: RegistryError },
}

impl core::fmt::Display for MarshalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TypeMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "argument {}: expected a {} value, got {}",
                index, expected, got
            ),
            Self::UnknownTrampoline { index } => {
                write!(f, "argument {}: unregistered trampoline", index)
            }
            Self::InvalidString { index } => {
                write!(f, "argument {}: string contains an interior NUL byte", index)
            }
            Self::Handle { index, source } => {
                write!(f, "argument {}: {}", index, source)
            }
        }
    }
}

impl std::error::Error for MarshalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handle { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn mismatch(index: usize, desc: &TypeDesc, value: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        index,
        expected: desc.kind_name(),
        got: value.type_name(),
    }
}

/// Side-effect-free compatibility check. Run over the whole argument list
/// before any slot is built, so a failing call never transfers ownership or
/// mints native state.
pub(crate) fn check_args(
    descs: &[TypeDesc],
    values: &[Value],
    trampolines: &TrampolineRegistry,
) -> Result<(), MarshalError> {
    for (index, (desc, value)) in descs.iter().zip(values).enumerate() {
        match (desc, value) {
            (TypeDesc::Integer { .. }, Value::Int(_)) => {}
            (TypeDesc::Float { .. }, Value::Float(_)) => {}
            (TypeDesc::Boolean, Value::Bool(_)) => {}
            (TypeDesc::String { .. }, Value::Str(s)) => {
                if s.as_bytes().contains(&0) {
                    return Err(MarshalError::InvalidString { index });
                }
            }
            (TypeDesc::String { .. }, Value::Null) => {}
            (TypeDesc::Handle { .. }, Value::Handle(wrapper)) => {
                wrapper
                    .ptr()
                    .map_err(|source| MarshalError::Handle { index, source })?;
            }
            (TypeDesc::Handle { .. }, Value::Null) => {}
            (TypeDesc::Callback { .. }, Value::Callback(id)) => {
                if trampolines.code_ptr(*id).is_none() {
                    return Err(MarshalError::UnknownTrampoline { index });
                }
            }
            (TypeDesc::Callback { .. }, Value::Null) => {}
            (TypeDesc::Null, Value::Null) => {}
            (desc, value) => return Err(mismatch(index, desc, value)),
        }
    }
    Ok(())
}

/// Builds native slots for a pre-checked argument list. Owned handles have
/// their release disarmed here; the callee takes over.
pub(crate) fn marshal_args(
    descs: &[TypeDesc],
    values: &[Value],
    trampolines: &TrampolineRegistry,
) -> Result<Vec<Slot>, MarshalError> {
    let mut slots = Vec::with_capacity(descs.len());
    for (index, (desc, value)) in descs.iter().zip(values).enumerate() {
        slots.push(marshal_one(index, desc, value, trampolines)?);
    }
    Ok(slots)
}

fn marshal_one(
    index: usize,
    desc: &TypeDesc,
    value: &Value,
    trampolines: &TrampolineRegistry,
) -> Result<Slot, MarshalError> {
    match (desc, value) {
        (TypeDesc::Integer { width, signed }, Value::Int(v)) => {
            Ok(match (width, signed) {
                (IntWidth::W8, true) => Slot::I8(*v as i8),
                (IntWidth::W8, false) => Slot::U8(*v as u8),
                (IntWidth::W16, true) => Slot::I16(*v as i16),
                (IntWidth::W16, false) => Slot::U16(*v as u16),
                (IntWidth::W32, true) => Slot::I32(*v as i32),
                (IntWidth::W32, false) => Slot::U32(*v as u32),
                (IntWidth::W64, true) => Slot::I64(*v),
                (IntWidth::W64, false) => Slot::U64(*v as u64),
            })
        }
        (TypeDesc::Float { width }, Value::Float(v)) => Ok(match width {
            FloatWidth::W32 => Slot::F32(*v as f32),
            FloatWidth::W64 => Slot::F64(*v),
        }),
        (TypeDesc::Boolean, Value::Bool(b)) => Ok(Slot::U8(u8::from(*b))),
        (TypeDesc::String { ownership }, Value::Str(s)) => {
            let c = CString::new(s.as_str())
                .map_err(|_| MarshalError::InvalidString { index })?;
            match ownership {
                Ownership::Borrowed => {
                    let ptr = c.as_ptr();
                    Ok(Slot::Str { ptr, _keep: c })
                }
                // The callee frees with the platform allocator, so the copy
                // must come from it too.
                Ownership::Owned => {
                    let dup = unsafe { libc::strdup(c.as_ptr()) };
                    Ok(Slot::Ptr(dup as *mut c_void))
                }
            }
        }
        (TypeDesc::Handle { ownership, .. }, Value::Handle(wrapper)) => {
            let ptr = match ownership {
                Ownership::Borrowed => wrapper.ptr(),
                Ownership::Owned => wrapper.transfer(),
            }
            .map_err(|source| MarshalError::Handle { index, source })?;
            Ok(Slot::Ptr(ptr))
        }
        (TypeDesc::Callback { .. }, Value::Callback(id)) => trampolines
            .code_ptr(*id)
            .map(|code| Slot::Ptr(code as *mut c_void))
            .ok_or(MarshalError::UnknownTrampoline { index }),
        (
            TypeDesc::String { .. } | TypeDesc::Handle { .. } | TypeDesc::Callback { .. }
            | TypeDesc::Null,
            Value::Null,
        ) => Ok(Slot::Ptr(std::ptr::null_mut())),
        (desc, value) => Err(mismatch(index, desc, value)),
    }
}
