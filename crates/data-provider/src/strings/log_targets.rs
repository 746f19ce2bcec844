// SPDX-License-Identifier: GPL-3.0

//! Log targets used by the provider wrappers.

/// Target for the edit-buffering wrapper.
pub const BUFFERING: &str = "data_provider::buffering";
/// Target for the iterator-sharing cache wrapper.
pub const CACHED: &str = "data_provider::cached";
