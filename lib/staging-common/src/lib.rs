// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

mod channel;
mod element;
mod endpoint;
mod variable;

pub use channel::{ChannelKind, ChannelRole, LibraryKey, ParseChannelError};
pub use element::{Element, ElementType};
pub use endpoint::{
    DEFAULT_BASE_PORT, EndpointError, EndpointRecord, EndpointTable, derive_ports,
    format_socket_addr,
};
pub use variable::{JOINED_DIM, ShapeKind, VariableDescriptor, VariableError};
