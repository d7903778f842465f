// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Variable descriptors.
//!
//! A [`VariableDescriptor`] records the name, element type and shape of one
//! variable's contribution to a step. Descriptors are immutable once handed to
//! a step buffer and are keyed by name within that step.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::element::{Element, ElementType};

/// Placeholder used in the shape of a [`ShapeKind::JoinedArray`] to mark the
/// dimension along which per-rank blocks are concatenated.
pub const JOINED_DIM: u64 = u64::MAX;

/// Errors raised while building or validating a variable contribution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    /// Variables must be named.
    #[error("Variable name must not be empty")]
    EmptyName,

    /// A type name did not match any supported element type.
    #[error("Unknown element type: {0}")]
    UnknownElementType(String),

    /// The data handed to a put does not match the descriptor's element type.
    #[error("Variable {name}: declared as {declared}, data is {actual}")]
    TypeMismatch {
        /// Variable name.
        name: String,
        /// Type recorded in the descriptor.
        declared: ElementType,
        /// Type of the data slice.
        actual: ElementType,
    },

    /// Shape, start and count disagree with the shape kind.
    #[error("Variable {name}: invalid shape: {reason}")]
    InvalidShape {
        /// Variable name.
        name: String,
        /// What is wrong.
        reason: String,
    },

    /// `start + count` exceeds the global shape in some dimension.
    #[error("Variable {name}: block exceeds global shape in dimension {dim}")]
    OutOfBounds {
        /// Variable name.
        name: String,
        /// Offending dimension.
        dim: usize,
    },

    /// The number of elements provided does not match the descriptor.
    #[error("Variable {name}: expected {expected} elements, got {actual}")]
    CountMismatch {
        /// Variable name.
        name: String,
        /// Elements implied by the descriptor.
        expected: u64,
        /// Elements provided.
        actual: u64,
    },

    /// A variable with this name was already put in the current step.
    #[error("Variable {0} was already put in this step")]
    Duplicate(String),
}

/// How a variable is laid out across the process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// A single value shared by the whole group.
    GlobalValue,
    /// One value per rank.
    LocalValue,
    /// A block of a global N-dimensional array.
    GlobalArray,
    /// A rank-local array with no global shape.
    LocalArray,
    /// A block concatenated with the other ranks' blocks along one dimension.
    JoinedArray,
}

impl ShapeKind {
    /// Value shapes carry exactly one element and no dimensions.
    pub fn is_value(self) -> bool {
        matches!(self, ShapeKind::GlobalValue | ShapeKind::LocalValue)
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShapeKind::GlobalValue => "global-value",
            ShapeKind::LocalValue => "local-value",
            ShapeKind::GlobalArray => "global-array",
            ShapeKind::LocalArray => "local-array",
            ShapeKind::JoinedArray => "joined-array",
        };
        f.write_str(name)
    }
}

/// Name, type and shape of one variable's contribution to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    name: String,
    element_type: ElementType,
    shape_kind: ShapeKind,
    shape: Vec<u64>,
    start: Vec<u64>,
    count: Vec<u64>,
}

impl VariableDescriptor {
    /// Build a descriptor from raw parts and validate it.
    pub fn new(
        name: impl Into<String>,
        element_type: ElementType,
        shape_kind: ShapeKind,
        shape: Vec<u64>,
        start: Vec<u64>,
        count: Vec<u64>,
    ) -> Result<Self, VariableError> {
        let descriptor = Self {
            name: name.into(),
            element_type,
            shape_kind,
            shape,
            start,
            count,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// A single value shared by the whole group.
    pub fn global_value<T: Element>(name: impl Into<String>) -> Result<Self, VariableError> {
        Self::new(name, T::TYPE, ShapeKind::GlobalValue, vec![], vec![], vec![])
    }

    /// One value per rank.
    pub fn local_value<T: Element>(name: impl Into<String>) -> Result<Self, VariableError> {
        Self::new(name, T::TYPE, ShapeKind::LocalValue, vec![], vec![], vec![])
    }

    /// This rank's `count`-sized block at `start` of a global array of `shape`.
    pub fn global_array<T: Element>(
        name: impl Into<String>,
        shape: Vec<u64>,
        start: Vec<u64>,
        count: Vec<u64>,
    ) -> Result<Self, VariableError> {
        Self::new(name, T::TYPE, ShapeKind::GlobalArray, shape, start, count)
    }

    /// A rank-local array of `count` dimensions.
    pub fn local_array<T: Element>(
        name: impl Into<String>,
        count: Vec<u64>,
    ) -> Result<Self, VariableError> {
        Self::new(name, T::TYPE, ShapeKind::LocalArray, vec![], vec![], count)
    }

    /// A block joined with the other ranks' blocks along the dimension marked
    /// [`JOINED_DIM`] in `shape`.
    pub fn joined_array<T: Element>(
        name: impl Into<String>,
        shape: Vec<u64>,
        count: Vec<u64>,
    ) -> Result<Self, VariableError> {
        let start = vec![0; count.len()];
        Self::new(name, T::TYPE, ShapeKind::JoinedArray, shape, start, count)
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    #[allow(missing_docs)]
    pub fn shape_kind(&self) -> ShapeKind {
        self.shape_kind
    }

    /// Global dimensions; empty for values and local arrays.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Offsets of this rank's block; empty for values and local arrays.
    pub fn start(&self) -> &[u64] {
        &self.start
    }

    /// Local dimensions of this rank's block; empty for values.
    pub fn count(&self) -> &[u64] {
        &self.count
    }

    /// Number of elements this rank contributes.
    pub fn element_count(&self) -> Result<u64, VariableError> {
        if self.shape_kind.is_value() {
            return Ok(1);
        }
        self.count
            .iter()
            .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| self.invalid("element count overflows u64"))
    }

    /// Check that `provided` elements of type `actual` satisfy this descriptor.
    pub fn check_data(&self, actual: ElementType, provided: usize) -> Result<(), VariableError> {
        if actual != self.element_type {
            return Err(VariableError::TypeMismatch {
                name: self.name.clone(),
                declared: self.element_type,
                actual,
            });
        }
        let expected = self.element_count()?;
        if expected != provided as u64 {
            return Err(VariableError::CountMismatch {
                name: self.name.clone(),
                expected,
                actual: provided as u64,
            });
        }
        Ok(())
    }

    /// Validate shape, start and count against the shape kind.
    pub fn validate(&self) -> Result<(), VariableError> {
        if self.name.is_empty() {
            return Err(VariableError::EmptyName);
        }
        if self.element_type == ElementType::String && !self.shape_kind.is_value() {
            return Err(self.invalid("string variables must be values"));
        }

        match self.shape_kind {
            ShapeKind::GlobalValue | ShapeKind::LocalValue => {
                if !self.shape.is_empty() || !self.start.is_empty() || !self.count.is_empty() {
                    return Err(self.invalid("values take no dimensions"));
                }
            }
            ShapeKind::LocalArray => {
                if !self.shape.is_empty() || !self.start.is_empty() {
                    return Err(self.invalid("local arrays have no global shape or start"));
                }
                if self.count.is_empty() {
                    return Err(self.invalid("local arrays need at least one dimension"));
                }
            }
            ShapeKind::GlobalArray => {
                self.check_ranks()?;
                if self.shape.contains(&JOINED_DIM) {
                    return Err(self.invalid("global arrays cannot contain a joined dimension"));
                }
                for dim in 0..self.shape.len() {
                    let end = self.start[dim].checked_add(self.count[dim]);
                    if end.is_none_or(|end| end > self.shape[dim]) {
                        return Err(VariableError::OutOfBounds {
                            name: self.name.clone(),
                            dim,
                        });
                    }
                }
            }
            ShapeKind::JoinedArray => {
                self.check_ranks()?;
                let joined = self.shape.iter().filter(|d| **d == JOINED_DIM).count();
                if joined != 1 {
                    return Err(self.invalid("joined arrays need exactly one joined dimension"));
                }
                for dim in 0..self.shape.len() {
                    if self.shape[dim] != JOINED_DIM && self.count[dim] != self.shape[dim] {
                        return Err(VariableError::OutOfBounds {
                            name: self.name.clone(),
                            dim,
                        });
                    }
                }
            }
        }

        self.element_count().map(|_| ())
    }

    fn check_ranks(&self) -> Result<(), VariableError> {
        if self.shape.is_empty() {
            return Err(self.invalid("arrays need at least one dimension"));
        }
        if self.shape.len() != self.start.len() || self.shape.len() != self.count.len() {
            return Err(self.invalid(&format!(
                "shape/start/count ranks differ ({}/{}/{})",
                self.shape.len(),
                self.start.len(),
                self.count.len()
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> VariableError {
        VariableError::InvalidShape {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_have_one_element() {
        let global = VariableDescriptor::global_value::<f64>("time").unwrap();
        assert_eq!(global.shape_kind(), ShapeKind::GlobalValue);
        assert_eq!(global.element_count().unwrap(), 1);

        let local = VariableDescriptor::local_value::<String>("host").unwrap();
        assert_eq!(local.element_type(), ElementType::String);
        assert_eq!(local.element_count().unwrap(), 1);
    }

    #[test]
    fn test_global_array_bounds() {
        let block =
            VariableDescriptor::global_array::<f32>("u", vec![10, 8], vec![5, 0], vec![5, 8])
                .unwrap();
        assert_eq!(block.element_count().unwrap(), 40);

        let err = VariableDescriptor::global_array::<f32>("u", vec![10, 8], vec![6, 0], vec![5, 8])
            .unwrap_err();
        assert_eq!(
            err,
            VariableError::OutOfBounds {
                name: "u".into(),
                dim: 0
            }
        );
    }

    #[test]
    fn test_rank_mismatch_is_rejected() {
        let err = VariableDescriptor::global_array::<i32>("v", vec![10], vec![0, 0], vec![5])
            .unwrap_err();
        assert!(matches!(err, VariableError::InvalidShape { .. }));
    }

    #[test]
    fn test_string_arrays_are_rejected() {
        let err = VariableDescriptor::local_array::<String>("names", vec![3]).unwrap_err();
        assert!(matches!(err, VariableError::InvalidShape { .. }));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert_eq!(
            VariableDescriptor::global_value::<u8>("").unwrap_err(),
            VariableError::EmptyName
        );
    }

    #[test]
    fn test_joined_array_needs_one_joined_dim() {
        let joined =
            VariableDescriptor::joined_array::<f64>("rows", vec![JOINED_DIM, 4], vec![3, 4])
                .unwrap();
        assert_eq!(joined.element_count().unwrap(), 12);

        let err = VariableDescriptor::joined_array::<f64>("rows", vec![6, 4], vec![3, 4])
            .unwrap_err();
        assert!(matches!(err, VariableError::InvalidShape { .. }));
    }

    #[test]
    fn test_check_data() {
        let desc = VariableDescriptor::local_array::<i64>("ids", vec![2, 3]).unwrap();
        assert!(desc.check_data(ElementType::Int64, 6).is_ok());
        assert!(matches!(
            desc.check_data(ElementType::Int32, 6),
            Err(VariableError::TypeMismatch { .. })
        ));
        assert_eq!(
            desc.check_data(ElementType::Int64, 5).unwrap_err(),
            VariableError::CountMismatch {
                name: "ids".into(),
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn test_descriptor_serde() {
        let desc =
            VariableDescriptor::global_array::<u16>("p", vec![4], vec![2], vec![2]).unwrap();
        let encoded = rmp_serde::to_vec(&desc).unwrap();
        let decoded: VariableDescriptor = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, desc);
    }
}
