// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Closed set of element types a staged variable may carry.
//!
//! The numeric tags are shared with readers and are part of the wire contract:
//! new types may only be appended, existing tags never change.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::VariableError;

/// Type tag carried by every [`VariableDescriptor`](crate::VariableDescriptor).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementType {
    /// UTF-8 string, value shapes only.
    String = 0,
    #[allow(missing_docs)]
    Int8 = 1,
    #[allow(missing_docs)]
    Int16 = 2,
    #[allow(missing_docs)]
    Int32 = 3,
    #[allow(missing_docs)]
    Int64 = 4,
    #[allow(missing_docs)]
    UInt8 = 5,
    #[allow(missing_docs)]
    UInt16 = 6,
    #[allow(missing_docs)]
    UInt32 = 7,
    #[allow(missing_docs)]
    UInt64 = 8,
    #[allow(missing_docs)]
    Float32 = 9,
    #[allow(missing_docs)]
    Float64 = 10,
    /// `(re, im)` pair of `f32`.
    ComplexFloat32 = 11,
    /// `(re, im)` pair of `f64`.
    ComplexFloat64 = 12,
}

impl ElementType {
    /// Every supported type, in tag order.
    pub const ALL: [ElementType; 13] = [
        ElementType::String,
        ElementType::Int8,
        ElementType::Int16,
        ElementType::Int32,
        ElementType::Int64,
        ElementType::UInt8,
        ElementType::UInt16,
        ElementType::UInt32,
        ElementType::UInt64,
        ElementType::Float32,
        ElementType::Float64,
        ElementType::ComplexFloat32,
        ElementType::ComplexFloat64,
    ];

    /// Try to convert a wire tag back into an element type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Wire tag of this element type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Encoded size of one element, `None` for variable-length strings.
    pub fn size(self) -> Option<usize> {
        match self {
            ElementType::String => None,
            ElementType::Int8 | ElementType::UInt8 => Some(1),
            ElementType::Int16 | ElementType::UInt16 => Some(2),
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => Some(4),
            ElementType::Int64
            | ElementType::UInt64
            | ElementType::Float64
            | ElementType::ComplexFloat32 => Some(8),
            ElementType::ComplexFloat64 => Some(16),
        }
    }

    /// Returns `true` for every type except [`ElementType::String`].
    pub fn is_numeric(self) -> bool {
        !matches!(self, ElementType::String)
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::String => "string",
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::UInt8 => "uint8",
            ElementType::UInt16 => "uint16",
            ElementType::UInt32 => "uint32",
            ElementType::UInt64 => "uint64",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::ComplexFloat32 => "complex64",
            ElementType::ComplexFloat64 => "complex128",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = VariableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lowered)
            .ok_or(VariableError::UnknownElementType(s.to_string()))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A Rust type that maps onto exactly one [`ElementType`].
///
/// Sealed: the element set is closed and shared with readers.
pub trait Element: sealed::Sealed + Clone + Send + Sync + 'static {
    /// The tag recorded in the variable descriptor.
    const TYPE: ElementType;

    /// Append `values` to `out` in the staging payload encoding (little-endian).
    fn encode(values: &[Self], out: &mut BytesMut);
}

macro_rules! impl_numeric_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const TYPE: ElementType = ElementType::$tag;

                fn encode(values: &[Self], out: &mut BytesMut) {
                    out.reserve(std::mem::size_of_val(values));
                    for value in values {
                        out.put_slice(&value.to_le_bytes());
                    }
                }
            }
        )*
    };
}

impl_numeric_element!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
);

macro_rules! impl_complex_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for [$ty; 2] {}

            impl Element for [$ty; 2] {
                const TYPE: ElementType = ElementType::$tag;

                fn encode(values: &[Self], out: &mut BytesMut) {
                    out.reserve(std::mem::size_of_val(values));
                    for [re, im] in values {
                        out.put_slice(&re.to_le_bytes());
                        out.put_slice(&im.to_le_bytes());
                    }
                }
            }
        )*
    };
}

impl_complex_element!(f32 => ComplexFloat32, f64 => ComplexFloat64);

impl sealed::Sealed for String {}

impl Element for String {
    const TYPE: ElementType = ElementType::String;

    // u64 length prefix, then the raw UTF-8 bytes
    fn encode(values: &[Self], out: &mut BytesMut) {
        for value in values {
            out.put_u64_le(value.len() as u64);
            out.put_slice(value.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T: Element>(values: &[T]) -> Vec<u8> {
        let mut out = BytesMut::new();
        T::encode(values, &mut out);
        out.to_vec()
    }

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(ElementType::String.as_u8(), 0);
        assert_eq!(ElementType::Int32.as_u8(), 3);
        assert_eq!(ElementType::Float64.as_u8(), 10);
        assert_eq!(ElementType::ComplexFloat64.as_u8(), 12);
        assert_eq!(ElementType::from_u8(13), None);
        assert_eq!(ElementType::from_u8(255), None);
    }

    #[test]
    fn test_all_is_in_tag_order() {
        for (index, ty) in ElementType::ALL.iter().enumerate() {
            assert_eq!(ty.as_u8() as usize, index);
            assert_eq!(ElementType::from_u8(index as u8), Some(*ty));
        }
    }

    #[test]
    fn test_from_str_is_case_insensitive() {
        assert_eq!("FLOAT64".parse::<ElementType>().unwrap(), ElementType::Float64);
        assert_eq!("complex64".parse::<ElementType>().unwrap(), ElementType::ComplexFloat32);
        assert!(matches!(
            "float16".parse::<ElementType>(),
            Err(VariableError::UnknownElementType(_))
        ));
    }

    #[test]
    fn test_rust_types_map_to_tags() {
        assert_eq!(<i8 as Element>::TYPE, ElementType::Int8);
        assert_eq!(<u64 as Element>::TYPE, ElementType::UInt64);
        assert_eq!(<[f32; 2] as Element>::TYPE, ElementType::ComplexFloat32);
        assert_eq!(<String as Element>::TYPE, ElementType::String);
    }

    #[test]
    fn test_numeric_encoding_is_little_endian() {
        assert_eq!(encode(&[1i32, 256]), vec![1, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(encode(&[0x0102u16]), vec![0x02, 0x01]);
        assert_eq!(encode(&[1.0f64]), 1.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_encoded_length_matches_size() {
        assert_eq!(
            encode(&[[1.0f64, 2.0]]).len(),
            ElementType::ComplexFloat64.size().unwrap()
        );
        assert_eq!(encode(&[0u8; 7]).len(), 7);
        assert_eq!(
            encode(&[[0f32; 2]; 3]).len(),
            3 * ElementType::ComplexFloat32.size().unwrap()
        );
    }

    #[test]
    fn test_string_encoding_is_length_prefixed() {
        let bytes = encode(&["ab".to_string()]);
        assert_eq!(&bytes[..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..], b"ab");
        assert_eq!(ElementType::String.size(), None);
        assert!(!ElementType::String.is_numeric());
    }
}
