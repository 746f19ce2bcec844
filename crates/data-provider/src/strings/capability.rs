// SPDX-License-Identifier: GPL-3.0

//! Capability names as advertised through `getCapability`.

/// Name of the key lookup capability.
pub const FETCH_BY_KEYS: &str = "fetchByKeys";
/// Name of the offset access capability.
pub const FETCH_BY_OFFSET: &str = "fetchByOffset";
/// Name of the iteration capability.
pub const FETCH_FIRST: &str = "fetchFirst";
/// Name of the filtering capability.
pub const FILTER: &str = "filter";
/// Name of the sorting capability.
pub const SORT: &str = "sort";
