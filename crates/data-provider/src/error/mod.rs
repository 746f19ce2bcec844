// SPDX-License-Identifier: GPL-3.0

//! Error types for data provider operations.
//!
//! This module contains all error types used throughout the `data-provider` crate,
//! organized by context:
//!
//! - [`buffer::BufferError`] - Validation failures raised by the edit buffer.
//! - [`provider::ProviderError`] - Errors surfaced by provider reads and iterations.

pub mod buffer;
pub mod provider;

pub use buffer::BufferError;
pub use provider::ProviderError;
