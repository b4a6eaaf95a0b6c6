//! Tensor element type descriptors: a bit width plus a numeric
//! category.

use std::fmt;

/// Numeric category of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementCategory {
    SignedInt,
    UnsignedInt,
    Float,
}

/// A tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementType {
    pub category: ElementCategory,
    pub bit_width: u8,
}

impl ElementType {
    pub const I8: Self = Self::new(ElementCategory::SignedInt, 8);
    pub const I16: Self = Self::new(ElementCategory::SignedInt, 16);
    pub const I32: Self = Self::new(ElementCategory::SignedInt, 32);
    pub const I64: Self = Self::new(ElementCategory::SignedInt, 64);
    pub const U8: Self = Self::new(ElementCategory::UnsignedInt, 8);
    pub const U32: Self = Self::new(ElementCategory::UnsignedInt, 32);
    pub const F16: Self = Self::new(ElementCategory::Float, 16);
    pub const F32: Self = Self::new(ElementCategory::Float, 32);
    pub const F64: Self = Self::new(ElementCategory::Float, 64);

    pub const fn new(category: ElementCategory, bit_width: u8) -> Self {
        Self {
            category,
            bit_width,
        }
    }

    /// Bytes per element. Sub-byte types round up.
    pub const fn byte_size(self) -> usize {
        self.bit_width.div_ceil(8) as usize
    }

    /// Stable numeric code used on the wire and across the VM boundary.
    pub fn code(self) -> u32 {
        let category = match self.category {
            ElementCategory::SignedInt => 1u32,
            ElementCategory::UnsignedInt => 2,
            ElementCategory::Float => 3,
        };
        (category << 8) | self.bit_width as u32
    }

    /// Decodes a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        let category = match code >> 8 {
            1 => ElementCategory::SignedInt,
            2 => ElementCategory::UnsignedInt,
            3 => ElementCategory::Float,
            _ => return None,
        };
        Some(Self::new(category, (code & 0xff) as u8))
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.category {
            ElementCategory::SignedInt => 'i',
            ElementCategory::UnsignedInt => 'u',
            ElementCategory::Float => 'f',
        };
        write!(f, "{prefix}{}", self.bit_width)
    }
}
