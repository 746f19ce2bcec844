// SPDX-License-Identifier: GPL-3.0

//! The data provider contract.
//!
//! A [`DataProvider`] is a keyed, sortable, filterable collection read through
//! asynchronous pages. Leaf providers implement it directly; the wrappers in this crate
//! implement it on top of another provider.

use crate::{
	error::ProviderError,
	filter::AttributeOperator,
	models::{
		ContainsKeysResults, DataProviderEvent, Emptiness, FetchByKeysParameters, FetchByKeysResults,
		FetchByOffsetParameters, FetchByOffsetResults, FetchListParameters, IterationResult,
		ProviderData, ProviderKey,
	},
	strings::capability,
};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tokio::sync::broadcast;

/// Forward-only cursor over the pages of one iteration.
///
/// An iterator is not restartable: start a new iteration with
/// [`DataProvider::fetch_first`] instead.
#[async_trait]
pub trait FetchListIterator<K: ProviderKey, D: ProviderData>: Send {
	/// Fetch the next page.
	async fn next(&mut self) -> Result<IterationResult<K, D>, ProviderError>;
}

/// Boxed iterator returned by [`DataProvider::fetch_first`].
pub type BoxedIterator<K, D> = Box<dyn FetchListIterator<K, D>>;

/// Shared handle to a provider.
pub type SharedProvider<K, D> = Arc<dyn DataProvider<K, D>>;

/// Keyed, pageable, observable collection.
#[async_trait]
pub trait DataProvider<K: ProviderKey, D: ProviderData>: Send + Sync {
	/// Start a new iteration.
	fn fetch_first(&self, params: FetchListParameters) -> BoxedIterator<K, D>;

	/// Fetch rows by key. Missing keys are absent from the result.
	async fn fetch_by_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<FetchByKeysResults<K, D>, ProviderError>;

	/// Fetch a range of rows by position.
	async fn fetch_by_offset(
		&self,
		params: FetchByOffsetParameters,
	) -> Result<FetchByOffsetResults<K, D>, ProviderError>;

	/// Check which keys exist.
	async fn contains_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<ContainsKeysResults<K>, ProviderError>;

	/// Describe an optional feature, or `None` if unsupported.
	fn get_capability(&self, name: CapabilityName) -> Option<Capability>;

	/// Total number of rows, or `None` if unknown.
	async fn get_total_size(&self) -> Result<Option<usize>, ProviderError>;

	/// Whether the provider has rows, as far as it knows without fetching.
	fn is_empty(&self) -> Emptiness;

	/// Receive `mutate`, `refresh` and other provider events.
	fn subscribe(&self) -> broadcast::Receiver<DataProviderEvent<K, D>>;

	/// Optimized key containers, when the provider offers them.
	fn key_collections(&self) -> Option<Arc<dyn KeyCollections<K, D>>> {
		None
	}
}

/// Optional capability: key sets and maps tuned for the provider's key type.
pub trait KeyCollections<K: ProviderKey, D: ProviderData>: Send + Sync {
	/// Build a key set.
	fn create_key_set(&self, keys: Vec<K>) -> IndexSet<K>;

	/// Build a map keyed by row key.
	fn create_key_map(&self, entries: Vec<(K, D)>) -> IndexMap<K, D>;
}

/// Names of the capabilities a provider may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityName {
	/// Key lookups.
	FetchByKeys,
	/// Positional access.
	FetchByOffset,
	/// Iteration.
	FetchFirst,
	/// Filtering.
	Filter,
	/// Sorting.
	Sort,
}

impl CapabilityName {
	/// The name as used by the contract.
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::FetchByKeys => capability::FETCH_BY_KEYS,
			Self::FetchByOffset => capability::FETCH_BY_OFFSET,
			Self::FetchFirst => capability::FETCH_FIRST,
			Self::Filter => capability::FILTER,
			Self::Sort => capability::SORT,
		}
	}
}

impl fmt::Display for CapabilityName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CapabilityName {
	type Err = ProviderError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			capability::FETCH_BY_KEYS => Ok(Self::FetchByKeys),
			capability::FETCH_BY_OFFSET => Ok(Self::FetchByOffset),
			capability::FETCH_FIRST => Ok(Self::FetchFirst),
			capability::FILTER => Ok(Self::Filter),
			capability::SORT => Ok(Self::Sort),
			other => Err(ProviderError::InvalidParameter(format!("unknown capability: {other}"))),
		}
	}
}

/// How key lookups are served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyLookup {
	/// By scanning rows.
	Iteration,
	/// By direct lookup.
	Lookup,
}

/// How positional access is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OffsetAccess {
	/// By iterating up to the offset.
	Iteration,
	/// By direct indexing.
	RandomAccess,
}

/// What an iteration keeps around after returning it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CachingPolicy {
	/// Nothing.
	None,
	/// Every row of the provider.
	All,
	/// Rows visited by the current iteration.
	VisitedByCurrentIterator,
}

/// Description of a supported capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
	/// Key lookups.
	FetchByKeys {
		/// Lookup strategy.
		implementation: KeyLookup,
		/// Several keys are resolved in one request.
		multi_key_lookup: bool,
	},
	/// Positional access.
	FetchByOffset {
		/// Access strategy.
		implementation: OffsetAccess,
	},
	/// Iteration.
	FetchFirst {
		/// Row caching performed by the provider.
		caching: CachingPolicy,
		/// The `attributes` parameter is honored.
		attribute_filter: bool,
		/// `total_filtered_row_count` can be reported.
		total_filtered_row_count: bool,
	},
	/// Filtering.
	Filter {
		/// Supported attribute operators.
		operators: Vec<AttributeOperator>,
		/// Free-text filters are supported.
		text_filter: bool,
	},
	/// Sorting.
	Sort {
		/// More than one sort criterion is honored.
		multiple_attributes: bool,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capability_names_round_trip_through_strings() {
		for name in [
			CapabilityName::FetchByKeys,
			CapabilityName::FetchByOffset,
			CapabilityName::FetchFirst,
			CapabilityName::Filter,
			CapabilityName::Sort,
		] {
			assert_eq!(name.as_str().parse::<CapabilityName>().unwrap(), name);
		}
	}

	#[test]
	fn unknown_capability_is_rejected() {
		let err = "dedup".parse::<CapabilityName>().unwrap_err();
		assert!(err.to_string().contains("unknown capability: dedup"));
	}
}
