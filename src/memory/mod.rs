//! Native buffer allocation and typed field access.
//!
//! A `NativeBuffer` is a fixed-size, zero-initialized memory region tagged
//! with a type name (for downstream identification) and an owning library
//! (for destructor resolution). It is created once, mutated through typed
//! reads and writes at byte offsets, and never resized. Scalar access is
//! bounds- and alignment-checked; pointer-bearing fields (strings, handles)
//! are decoded one layer up, where the handle registry is available.

mod layout;

pub use layout::{LayoutError, StructLayout};

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tracing::trace;

use crate::descriptor::{FloatWidth, IntWidth, TypeDesc};
use crate::value::Value;

/// Buffers are aligned for any scalar the descriptor system can express.
const BUFFER_ALIGN: usize = 16;

/// A fixed-size native memory region.
pub struct NativeBuffer {
    ptr: NonNull<u8>,
    len: usize,
    type_tag: String,
    library: Option<String>,
}

// Raw memory owned exclusively by this buffer. Access from multiple threads
// is governed by the engine's single-native-thread contract.
unsafe impl Send for NativeBuffer {}
unsafe impl Sync for NativeBuffer {}

impl NativeBuffer {
    /// Allocates a zero-initialized buffer sized for round-tripping through
    /// native calls.
    pub fn alloc(
        size: usize,
        type_tag: impl Into<String>,
        library: Option<String>,
    ) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }

        let layout = Layout::from_size_align(size, BUFFER_ALIGN)
            .map_err(|_| MemoryError::AllocationFailed { size })?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::AllocationFailed { size })?;

        let type_tag = type_tag.into();
        trace!(event = "buffer_alloc", size_bytes = size, tag = %type_tag);

        Ok(Self {
            ptr,
            len: size,
            type_tag,
            library,
        })
    }

    /// Raw pointer to the buffer's first byte, for passing by reference.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Type name this buffer was tagged with at allocation.
    #[inline]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Library owning the buffer's type, for destructor resolution.
    #[inline]
    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    fn check_access(&self, desc: &TypeDesc, offset: usize) -> Result<(), MemoryError> {
        let size = desc.size();
        if offset.checked_add(size).map_or(true, |end| end > self.len) {
            return Err(MemoryError::OutOfBounds {
                offset,
                size,
                len: self.len,
            });
        }
        let align = desc.align();
        if offset % align != 0 {
            return Err(MemoryError::InvalidAlignment { offset, align });
        }
        Ok(())
    }

    /// Reads a scalar field at the given byte offset.
    ///
    /// Integers narrower than 64 bits sign- or zero-extend; an unsigned
    /// 64-bit field returns its bit pattern as `Int`.
    ///
    /// # Errors
    ///
    /// `OutOfBounds` if the field does not fit, `InvalidAlignment` if the
    /// offset violates the descriptor's alignment, `UnsupportedField` for
    /// pointer-bearing descriptors (handled by the engine layer).
    pub fn read(&self, desc: &TypeDesc, offset: usize) -> Result<Value, MemoryError> {
        self.check_access(desc, offset)?;
        let field = unsafe { self.ptr.as_ptr().add(offset) };

        match desc {
            TypeDesc::Integer { width, signed } => {
                let raw = unsafe {
                    match (width, signed) {
                        (IntWidth::W8, true) => field.cast::<i8>().read() as i64,
                        (IntWidth::W8, false) => field.cast::<u8>().read() as i64,
                        (IntWidth::W16, true) => field.cast::<i16>().read() as i64,
                        (IntWidth::W16, false) => field.cast::<u16>().read() as i64,
                        (IntWidth::W32, true) => field.cast::<i32>().read() as i64,
                        (IntWidth::W32, false) => field.cast::<u32>().read() as i64,
                        (IntWidth::W64, true) => field.cast::<i64>().read(),
                        (IntWidth::W64, false) => field.cast::<u64>().read() as i64,
                    }
                };
                Ok(Value::Int(raw))
            }
            TypeDesc::Float { width } => {
                let raw = unsafe {
                    match width {
                        FloatWidth::W32 => field.cast::<f32>().read() as f64,
                        FloatWidth::W64 => field.cast::<f64>().read(),
                    }
                };
                Ok(Value::Float(raw))
            }
            TypeDesc::Boolean => {
                let raw = unsafe { field.cast::<u8>().read() };
                Ok(Value::Bool(raw != 0))
            }
            other => Err(MemoryError::UnsupportedField {
                kind: other.kind_name(),
            }),
        }
    }

    /// Writes a scalar field at the given byte offset.
    ///
    /// Integers truncate to the declared width; `Float { W32 }` narrows.
    ///
    /// # Errors
    ///
    /// As [`NativeBuffer::read`], plus `FieldTypeMismatch` when the value
    /// does not match the descriptor.
    pub fn write(&self, desc: &TypeDesc, offset: usize, value: &Value) -> Result<(), MemoryError> {
        self.check_access(desc, offset)?;
        let field = unsafe { self.ptr.as_ptr().add(offset) };

        match (desc, value) {
            (TypeDesc::Integer { width, .. }, Value::Int(v)) => unsafe {
                match width {
                    IntWidth::W8 => field.cast::<u8>().write(*v as u8),
                    IntWidth::W16 => field.cast::<u16>().write(*v as u16),
                    IntWidth::W32 => field.cast::<u32>().write(*v as u32),
                    IntWidth::W64 => field.cast::<u64>().write(*v as u64),
                }
            },
            (TypeDesc::Float { width }, Value::Float(v)) => unsafe {
                match width {
                    FloatWidth::W32 => field.cast::<f32>().write(*v as f32),
                    FloatWidth::W64 => field.cast::<f64>().write(*v),
                }
            },
            (TypeDesc::Boolean, Value::Bool(b)) => unsafe {
                field.cast::<u8>().write(u8::from(*b));
            },
            (desc, value) => {
                return Err(MemoryError::FieldTypeMismatch {
                    expected: desc.kind_name(),
                    got: value.type_name(),
                })
            }
        }

        Ok(())
    }

    /// Reads a raw pointer slot at the given byte offset. Used by the engine
    /// layer to decode string and handle fields.
    pub(crate) fn read_ptr(
        &self,
        desc: &TypeDesc,
        offset: usize,
    ) -> Result<*mut core::ffi::c_void, MemoryError> {
        self.check_access(desc, offset)?;
        let field = unsafe { self.ptr.as_ptr().add(offset) };
        Ok(unsafe { field.cast::<*mut core::ffi::c_void>().read() })
    }

    /// Writes a raw pointer slot at the given byte offset. The engine layer
    /// owns the lifetime of whatever the pointer refers to.
    pub(crate) fn write_ptr(
        &self,
        desc: &TypeDesc,
        offset: usize,
        ptr: *mut core::ffi::c_void,
    ) -> Result<(), MemoryError> {
        self.check_access(desc, offset)?;
        let field = unsafe { self.ptr.as_ptr().add(offset) };
        unsafe { field.cast::<*mut core::ffi::c_void>().write(ptr) };
        Ok(())
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        trace!(event = "buffer_free", size_bytes = self.len, tag = %self.type_tag);
        // Layout was validated at alloc time.
        let layout = unsafe { Layout::from_size_align_unchecked(self.len, BUFFER_ALIGN) };
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl core::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("type_tag", &self.type_tag)
            .finish()
    }
}

/// Buffer access errors. All operations are synchronous and deterministic;
/// there are no hidden retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
    InvalidAlignment {
        offset: usize,
        align: usize,
    },
    AllocationFailed {
        size: usize,
    },
    ZeroSize,
    /// Pointer-bearing descriptors are decoded by the engine layer, not here.
    UnsupportedField {
        kind: &'static str,
    },
    FieldTypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    /// String field value with an interior NUL byte; not storable as C data.
    InteriorNul {
        offset: usize,
    },
    /// Field access on a handle that does not own an engine-allocated buffer.
    NotABuffer,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfBounds { offset, size, len } => write!(
                f,
                "field access at offset {} (size {}) exceeds buffer length {}",
                offset, size, len
            ),
            Self::InvalidAlignment { offset, align } => write!(
                f,
                "offset {} violates required alignment {}",
                offset, align
            ),
            Self::AllocationFailed { size } => write!(f, "failed to allocate {} bytes", size),
            Self::ZeroSize => write!(f, "zero-sized buffers are not allocatable"),
            Self::UnsupportedField { kind } => {
                write!(f, "{} fields are not scalar buffer accesses", kind)
            }
            Self::FieldTypeMismatch { expected, got } => {
                write!(f, "expected a {} value, got {}", expected, got)
            }
            Self::InteriorNul { offset } => {
                write!(f, "string at offset {} contains an interior NUL byte", offset)
            }
            Self::NotABuffer => write!(f, "handle does not own an engine-allocated buffer"),
        }
    }
}

impl std::error::Error for MemoryError {}
