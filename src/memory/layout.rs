//! C struct layout computation.
//!
//! Field offsets follow standard C rules: fields are placed in declaration
//! order, the running offset rounds up to each field's alignment before
//! placement, and the final size rounds up to the maximum field alignment.
//! Scalars are naturally aligned on every target this engine supports
//! (x86-64 SysV and Win64, AArch64); i686's 4-byte f64 alignment is a known
//! divergence and is not special-cased.

use serde::{Deserialize, Serialize};

use crate::descriptor::TypeDesc;

/// Computed layout of a native struct described field-by-field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructLayout {
    offsets: Vec<usize>,
    size: usize,
    align: usize,
}

impl StructLayout {
    /// Computes offsets, total size, and alignment for the given fields.
    ///
    /// # Errors
    ///
    /// Rejects an empty field list and `Void` fields, which have no
    /// representable native layout.
    pub fn compute(fields: &[TypeDesc]) -> Result<Self, LayoutError> {
        if fields.is_empty() {
            return Err(LayoutError::EmptyStruct);
        }

        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;

        for (index, field) in fields.iter().enumerate() {
            if matches!(field, TypeDesc::Void) {
                return Err(LayoutError::VoidField { index });
            }

            let align = field.align();
            offset = round_up(offset, align);
            offsets.push(offset);
            offset += field.size();
            max_align = max_align.max(align);
        }

        Ok(Self {
            offsets,
            size: round_up(offset, max_align),
            align: max_align,
        })
    }

    /// Byte offset of each field in declaration order.
    #[inline]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total size including tail padding.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment of the whole struct.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }
}

#[inline]
const fn round_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Struct layout errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    EmptyStruct,
    VoidField { index: usize },
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmptyStruct => write!(f, "struct layout requires at least one field"),
            Self::VoidField { index } => write!(f, "field {} is void", index),
        }
    }
}

impl std::error::Error for LayoutError {}
