//! Type descriptors for values crossing the native-call boundary.
//!
//! Descriptors are immutable, serializable data consumed by every other
//! component: the layout manager sizes fields from them, the dispatcher
//! marshals arguments per them, and trampolines decode native callback
//! arguments with them. The only behavior here is validation.

use serde::{Deserialize, Serialize};

/// Width of an integer slot in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntWidth {
    W8 = 8,
    W16 = 16,
    W32 = 32,
    W64 = 64,
}

impl IntWidth {
    /// Size of the slot in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }
}

/// Width of a floating-point slot in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloatWidth {
    W32 = 32,
    W64 = 64,
}

impl FloatWidth {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }
}

/// Whether crossing the boundary transfers responsibility for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// Receiver becomes responsible for eventual release.
    Owned,
    /// Pointer remains owned by the other side; must not outlive the call.
    Borrowed,
}

/// How a native object's lifetime is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    /// Intrinsic increment/decrement operations drive the lifetime.
    RefCounted,
    /// Plain-old-data struct allocated by value; freed by a destructor.
    Boxed,
}

/// The invocation protocol of a callback trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrampolineKind {
    /// Event/signal subscription: any number of invocations, void return,
    /// released on explicit disconnect.
    Closure,
    /// Idle/timeout-style source: the managed boolean return decides whether
    /// the source stays armed (`true`) or disarms (`false`).
    OneShotSource,
    /// Single-shot cleanup: invoked exactly once when the owning native
    /// object is destroyed or its data slot cleared.
    DestroyNotify,
    /// Free-form signature with an explicit typed return value.
    Custom,
}

/// A tagged description of one argument or return slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDesc {
    Integer {
        width: IntWidth,
        signed: bool,
    },
    Float {
        width: FloatWidth,
    },
    Boolean,
    /// Null pointer slot.
    Null,
    /// No value (return slots only).
    Void,
    String {
        ownership: Ownership,
    },
    Handle {
        kind: HandleKind,
        ownership: Ownership,
        /// Declared runtime type name; the registry may narrow it at wrap time.
        type_name: String,
        /// Library holding the type's destructor symbol, if any.
        library: Option<String>,
        /// Destructor symbol for owned boxed handles.
        destructor: Option<String>,
    },
    Callback {
        kind: TrampolineKind,
        arg_types: Vec<TypeDesc>,
        return_type: Option<Box<TypeDesc>>,
    },
}

impl TypeDesc {
    /// Size of the native slot in bytes. Pointer-bearing descriptors are
    /// pointer-sized; `Void` occupies no space.
    pub fn size(&self) -> usize {
        match self {
            Self::Integer { width, .. } => width.bytes(),
            Self::Float { width } => width.bytes(),
            Self::Boolean => 1,
            Self::Void => 0,
            Self::Null | Self::String { .. } | Self::Handle { .. } | Self::Callback { .. } => {
                std::mem::size_of::<*const ()>()
            }
        }
    }

    /// Alignment requirement of the native slot. Scalars are naturally
    /// aligned on every supported target.
    #[inline]
    pub fn align(&self) -> usize {
        self.size().max(1)
    }

    #[inline]
    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Integer { .. })
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float { .. })
    }

    /// Whether the slot carries a pointer at the ABI level.
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::String { .. } | Self::Handle { .. } | Self::Callback { .. }
        )
    }

    /// Short name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "float",
            Self::Boolean => "boolean",
            Self::Null => "null",
            Self::Void => "void",
            Self::String { .. } => "string",
            Self::Handle { .. } => "handle",
            Self::Callback { .. } => "callback",
        }
    }

    /// Rejects descriptors with internally inconsistent fields.
    ///
    /// Callbacks may not nest: a callback's return type or argument types
    /// cannot themselves be callbacks. Non-`Custom` trampoline kinds have a
    /// protocol-fixed return (void or boolean) and reject an explicit one.
    /// Handles must name a runtime type.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        match self {
            Self::Handle { type_name, .. } => {
                if type_name.is_empty() {
                    return Err(DescriptorError::EmptyHandleType);
                }
                Ok(())
            }
            Self::Callback {
                kind,
                arg_types,
                return_type,
            } => {
                for arg in arg_types {
                    if matches!(arg, Self::Callback { .. }) {
                        return Err(DescriptorError::NestedCallbackArgument);
                    }
                    arg.validate()?;
                }
                if let Some(ret) = return_type {
                    if matches!(**ret, Self::Callback { .. }) {
                        return Err(DescriptorError::NestedCallbackReturn);
                    }
                    if *kind != TrampolineKind::Custom {
                        return Err(DescriptorError::FixedReturnKind { kind: *kind });
                    }
                    ret.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Malformed-descriptor errors, caught before any native call is attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorError {
    /// A callback's return type is itself a callback.
    NestedCallbackReturn,
    /// A callback's argument list contains a callback.
    NestedCallbackArgument,
    /// A handle descriptor with an empty runtime type name.
    EmptyHandleType,
    /// An explicit return type on a trampoline kind whose return is fixed
    /// by protocol (void for Closure/DestroyNotify, boolean for OneShotSource).
    FixedReturnKind { kind: TrampolineKind },
    /// `Void` used for an argument slot.
    VoidArgument { index: usize },
    /// A native call declared to return a callback pointer; those cannot be
    /// re-wrapped as managed values.
    CallbackReturn,
}

impl core::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NestedCallbackReturn => write!(f, "callback return type cannot be a callback"),
            Self::NestedCallbackArgument => {
                write!(f, "callback argument types cannot contain a callback")
            }
            Self::EmptyHandleType => write!(f, "handle descriptor requires a runtime type name"),
            Self::FixedReturnKind { kind } => write!(
                f,
                "trampoline kind {:?} has a protocol-fixed return and rejects an explicit one",
                kind
            ),
            Self::VoidArgument { index } => {
                write!(f, "argument {} declared void", index)
            }
            Self::CallbackReturn => {
                write!(f, "native calls cannot return callback pointers")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}
