// SPDX-License-Identifier: GPL-3.0

//! Construction options for the provider wrappers.

use crate::{
	buffer::KeyGenerator,
	events::EVENT_CHANNEL_CAPACITY,
	filter::FilterCriterion,
	models::{ProviderData, ProviderKey},
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Decides whether a row payload satisfies a filter.
pub type RowFilter<D> = Arc<dyn Fn(&FilterCriterion, &D) -> bool + Send + Sync>;

/// Options of a [`BufferingDataProvider`](crate::BufferingDataProvider).
pub struct BufferingOptions<K, D> {
	/// Generates keys for rows added without one. Defaults to
	/// [`ProviderKey::generate`].
	pub key_generator: Option<KeyGenerator<K, D>>,
	/// Evaluates iteration filters against source rows.
	///
	/// Used to tell whether the `add_before_key` of a buffered add is part of a filtered
	/// iteration. Without it, adds anchored under a filter are placed at the top.
	pub filter_evaluator: Option<RowFilter<D>>,
	/// Capacity of the provider's event channel.
	pub event_capacity: usize,
}

impl<K, D> Default for BufferingOptions<K, D> {
	fn default() -> Self {
		Self { key_generator: None, filter_evaluator: None, event_capacity: EVENT_CHANNEL_CAPACITY }
	}
}

impl<K: ProviderKey, D: ProviderData> BufferingOptions<K, D> {
	/// Generate keys with `generator`.
	pub fn with_key_generator(mut self, generator: impl Fn(&D) -> K + Send + Sync + 'static) -> Self {
		self.key_generator = Some(Arc::new(generator));
		self
	}

	/// Evaluate iteration filters with `evaluator`.
	pub fn with_filter_evaluator(
		mut self,
		evaluator: impl Fn(&FilterCriterion, &D) -> bool + Send + Sync + 'static,
	) -> Self {
		self.filter_evaluator = Some(Arc::new(evaluator));
		self
	}
}

impl<K: ProviderKey> BufferingOptions<K, serde_json::Value> {
	/// Options for JSON rows, evaluating filters with [`FilterCriterion::matches`].
	pub fn json() -> Self {
		Self::default().with_filter_evaluator(|filter, row| filter.matches(row))
	}
}

impl<K, D> fmt::Debug for BufferingOptions<K, D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BufferingOptions")
			.field("key_generator", &self.key_generator.is_some())
			.field("filter_evaluator", &self.filter_evaluator.is_some())
			.field("event_capacity", &self.event_capacity)
			.finish()
	}
}

/// Whether yielded pages carry the source's filtered row count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilteredRowCount {
	/// Ask the source for the count and attach it to every page.
	Enabled,
	/// Never ask for nor attach the count.
	#[default]
	Disabled,
}

/// Options of a
/// [`CachedIteratorResultsDataProvider`](crate::CachedIteratorResultsDataProvider).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachedResultsOptions {
	/// Filtered row count handling.
	pub include_filtered_row_count: FilteredRowCount,
	/// Capacity of the provider's event channel.
	pub event_capacity: usize,
}

impl Default for CachedResultsOptions {
	fn default() -> Self {
		Self { include_filtered_row_count: FilteredRowCount::Disabled, event_capacity: EVENT_CHANNEL_CAPACITY }
	}
}

impl CachedResultsOptions {
	/// Attach filtered row counts to yielded pages.
	pub fn with_filtered_row_count(mut self) -> Self {
		self.include_filtered_row_count = FilteredRowCount::Enabled;
		self
	}
}
