// SPDX-License-Identifier: GPL-3.0

//! Append-only store of rows fetched by the active iteration.
//!
//! The cache mirrors the upstream order for one fetch signature. Rows are appended as
//! upstream pages arrive and spliced in place when the source reports mutations. The
//! positions of every splice are reported back so read cursors can follow them.
//!
//! Rows are indexed by key, so key lookups do not scan the cached prefix. Keys are
//! unique within a source; a repeated key replaces the cached row in place.

use crate::{
	models::{Item, ItemMetadata, MutationDetail, OperationDetail, ProviderData, ProviderKey},
	positions::IndexChange,
};
use indexmap::IndexMap;

/// One cached row.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<K, D> {
	/// Row payload.
	pub data: D,
	/// Row identity.
	pub metadata: ItemMetadata<K>,
}

/// Rows fetched so far for the active fetch signature.
#[derive(Clone, Debug)]
pub struct ResultCache<K, D> {
	entries: IndexMap<K, CacheEntry<K, D>>,
	done: bool,
	total_filtered_row_count: Option<usize>,
}

impl<K, D> Default for ResultCache<K, D> {
	fn default() -> Self {
		Self { entries: IndexMap::new(), done: false, total_filtered_row_count: None }
	}
}

impl<K: ProviderKey, D: ProviderData> ResultCache<K, D> {
	/// Create an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Drop every row and forget that the upstream iteration finished.
	pub fn reset(&mut self) {
		self.entries.clear();
		self.done = false;
		self.total_filtered_row_count = None;
	}

	/// Append one upstream page.
	pub fn append(&mut self, data: Vec<D>, metadata: Vec<ItemMetadata<K>>) {
		self.entries.extend(
			data.into_iter()
				.zip(metadata)
				.map(|(data, metadata)| (metadata.key.clone(), CacheEntry { data, metadata })),
		);
	}

	/// Mark the upstream iteration as fully drained.
	pub fn set_done(&mut self, done: bool) {
		self.done = done;
	}

	/// Returns `true` once every upstream row is cached.
	pub fn is_done(&self) -> bool {
		self.done
	}

	/// Record the filtered row count last reported upstream.
	pub fn set_total_filtered_row_count(&mut self, count: Option<usize>) {
		if count.is_some() {
			self.total_filtered_row_count = count;
		}
	}

	/// Filtered row count last reported upstream, adjusted for mutations since.
	pub fn total_filtered_row_count(&self) -> Option<usize> {
		self.total_filtered_row_count
	}

	/// Number of cached rows.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Returns `true` if no rows are cached.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Copy out up to `size` rows starting at `offset`.
	pub fn slice(&self, offset: usize, size: usize) -> (Vec<D>, Vec<ItemMetadata<K>>) {
		self.range(offset, size).map(|entry| (entry.data.clone(), entry.metadata.clone())).unzip()
	}

	/// Rows in `[offset, offset + size)` as items.
	pub fn items(&self, offset: usize, size: usize) -> Vec<Item<K, D>> {
		self.range(offset, size)
			.map(|entry| Item { metadata: entry.metadata.clone(), data: entry.data.clone() })
			.collect()
	}

	fn range(&self, offset: usize, size: usize) -> impl Iterator<Item = &CacheEntry<K, D>> {
		self.entries.values().skip(offset).take(size)
	}

	/// Position of the row with `key`.
	pub fn index_of(&self, key: &K) -> Option<usize> {
		self.entries.get_index_of(key)
	}

	/// The cached row with `key`.
	pub fn get(&self, key: &K) -> Option<Item<K, D>> {
		self.entries
			.get(key)
			.map(|entry| Item { metadata: entry.metadata.clone(), data: entry.data.clone() })
	}

	/// Integrate a source mutation and report the resulting position changes in the
	/// order they were applied.
	///
	/// Removals and updates match rows by key. Additions are placed at their reported
	/// index, before their `add_before_key`, or after their `after_key`; an addition
	/// that lands beyond the cached prefix of an unfinished iteration is left for the
	/// upstream iterator to deliver.
	pub fn process_mutations(&mut self, detail: &MutationDetail<K, D>) -> Vec<IndexChange> {
		let mut changes = Vec::new();
		if let Some(remove) = &detail.remove {
			self.process_removals(remove, &mut changes);
		}
		if let Some(add) = &detail.add {
			self.process_additions(add, &mut changes);
		}
		if let Some(update) = &detail.update {
			self.process_updates(update);
		}
		changes
	}

	fn process_removals(&mut self, remove: &OperationDetail<K, D>, changes: &mut Vec<IndexChange>) {
		for key in &remove.keys {
			if let Some((index, _, _)) = self.entries.shift_remove_full(key) {
				changes.push(IndexChange::Removed(index));
			}
		}
		if let Some(count) = self.total_filtered_row_count.as_mut() {
			*count = count.saturating_sub(remove.len());
		}
	}

	fn process_additions(&mut self, add: &OperationDetail<K, D>, changes: &mut Vec<IndexChange>) {
		for (i, key) in add.keys.iter().enumerate() {
			let Some(data) = add.data_at(i) else { continue };
			if self.entries.contains_key(key) {
				continue;
			}
			let Some(index) = self.insertion_index(add, i) else { continue };
			let metadata = add.metadata.get(i).cloned().unwrap_or_else(|| ItemMetadata::new(key.clone()));
			self.entries.shift_insert(index, key.clone(), CacheEntry { data: data.clone(), metadata });
			changes.push(IndexChange::Added(index));
		}
		if let Some(count) = self.total_filtered_row_count.as_mut() {
			*count += add.len();
		}
	}

	fn insertion_index(&self, add: &OperationDetail<K, D>, i: usize) -> Option<usize> {
		let len = self.entries.len();
		if let Some(index) = add.index_at(i) {
			return (index < len || (index == len && self.done)).then_some(index);
		}
		if let Some(before) = add.add_before_key_at(i) {
			return self.index_of(before).or(self.done.then_some(len));
		}
		if let Some(after) = add.after_key_at(i) {
			return self.index_of(after).map(|index| index + 1).or(self.done.then_some(len));
		}
		self.done.then_some(len)
	}

	fn process_updates(&mut self, update: &OperationDetail<K, D>) {
		for (i, key) in update.keys.iter().enumerate() {
			let Some(data) = update.data_at(i) else { continue };
			if let Some(entry) = self.entries.get_mut(key) {
				entry.data = data.clone();
				if let Some(metadata) = update.metadata.get(i) {
					entry.metadata = metadata.clone();
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cache_with(keys: &[&str]) -> ResultCache<String, String> {
		let mut cache = ResultCache::new();
		cache.append(
			keys.iter().map(|k| format!("data-{k}")).collect(),
			keys.iter().map(|k| ItemMetadata::new(k.to_string())).collect(),
		);
		cache
	}

	fn keys(cache: &ResultCache<String, String>) -> Vec<String> {
		cache.items(0, usize::MAX).into_iter().map(|item| item.metadata.key).collect()
	}

	#[test]
	fn slice_serves_cached_prefix() {
		let cache = cache_with(&["a", "b", "c"]);

		let (data, metadata) = cache.slice(1, 5);

		assert_eq!(data, vec!["data-b".to_string(), "data-c".to_string()]);
		assert_eq!(metadata.len(), 2);
	}

	#[test]
	fn removals_match_by_key_and_report_positions() {
		let mut cache = cache_with(&["a", "b", "c", "d"]);
		let detail = MutationDetail::removed(OperationDetail::from_keys(vec!["c".to_string(), "a".to_string()]));

		let changes = cache.process_mutations(&detail);

		assert_eq!(changes, vec![IndexChange::Removed(2), IndexChange::Removed(0)]);
		assert_eq!(keys(&cache), vec!["b", "d"]);
	}

	#[test]
	fn removal_of_uncached_key_changes_nothing() {
		let mut cache = cache_with(&["a"]);
		let detail = MutationDetail::removed(OperationDetail::from_keys(vec!["z".to_string()]).with_indexes(vec![0]));

		assert!(cache.process_mutations(&detail).is_empty());
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn addition_at_index_inside_prefix() {
		let mut cache = cache_with(&["a", "b"]);
		let detail = MutationDetail::added(
			OperationDetail::from_items(vec![Item::new("n".to_string(), "data-n".to_string())]).with_indexes(vec![1]),
		);

		assert_eq!(cache.process_mutations(&detail), vec![IndexChange::Added(1)]);
		assert_eq!(keys(&cache), vec!["a", "n", "b"]);
	}

	#[test]
	fn addition_beyond_unfinished_prefix_is_skipped() {
		let mut cache = cache_with(&["a", "b"]);
		let detail = MutationDetail::added(OperationDetail::from_items(vec![Item::new(
			"n".to_string(),
			"data-n".to_string(),
		)]));

		assert!(cache.process_mutations(&detail).is_empty());

		cache.set_done(true);
		assert_eq!(cache.process_mutations(&detail), vec![IndexChange::Added(2)]);
	}

	#[test]
	fn addition_before_key() {
		let mut cache = cache_with(&["a", "b"]);
		let detail = MutationDetail::added(
			OperationDetail::from_items(vec![Item::new("n".to_string(), "data-n".to_string())])
				.with_add_before_keys(vec![Some("b".to_string())]),
		);

		assert_eq!(cache.process_mutations(&detail), vec![IndexChange::Added(1)]);
	}

	#[test]
	fn additions_after_the_same_key_keep_their_own_anchor() {
		let mut cache = cache_with(&["a", "b"]);
		let detail = MutationDetail::added(
			OperationDetail::from_items(vec![
				Item::new("x".to_string(), "data-x".to_string()),
				Item::new("y".to_string(), "data-y".to_string()),
			])
			.with_after_keys(vec![Some("a".to_string()), Some("a".to_string())]),
		);

		assert_eq!(cache.process_mutations(&detail), vec![IndexChange::Added(1), IndexChange::Added(1)]);
		assert_eq!(keys(&cache), vec!["a", "y", "x", "b"]);
	}

	#[test]
	fn key_lookups_follow_splices() {
		let mut cache = cache_with(&["a", "b", "c"]);
		cache.process_mutations(&MutationDetail::removed(OperationDetail::from_keys(vec!["a".to_string()])));
		cache.process_mutations(&MutationDetail::added(
			OperationDetail::from_items(vec![Item::new("n".to_string(), "data-n".to_string())]).with_indexes(vec![1]),
		));

		assert_eq!(cache.index_of(&"b".to_string()), Some(0));
		assert_eq!(cache.index_of(&"n".to_string()), Some(1));
		assert_eq!(cache.index_of(&"c".to_string()), Some(2));
		assert_eq!(cache.index_of(&"a".to_string()), None);
		assert_eq!(cache.get(&"c".to_string()).map(|item| item.data), Some("data-c".to_string()));

		cache.reset();
		assert_eq!(cache.index_of(&"b".to_string()), None);
	}

	#[test]
	fn updates_replace_data_without_moving_rows() {
		let mut cache = cache_with(&["a", "b"]);
		let detail =
			MutationDetail::updated(OperationDetail::from_items(vec![Item::new("b".to_string(), "new".to_string())]));

		assert!(cache.process_mutations(&detail).is_empty());
		assert_eq!(cache.get(&"b".to_string()).unwrap().data, "new");
	}

	#[test]
	fn filtered_row_count_follows_mutations() {
		let mut cache = cache_with(&["a", "b"]);
		cache.set_total_filtered_row_count(Some(10));
		cache.set_done(true);

		cache.process_mutations(&MutationDetail::removed(OperationDetail::from_keys(vec!["a".to_string()])));
		cache.process_mutations(&MutationDetail::added(OperationDetail::from_items(vec![
			Item::new("x".to_string(), "x".to_string()),
			Item::new("y".to_string(), "y".to_string()),
		])));

		assert_eq!(cache.total_filtered_row_count(), Some(11));
	}

	#[test]
	fn reset_clears_rows_and_done() {
		let mut cache = cache_with(&["a"]);
		cache.set_done(true);

		cache.reset();

		assert!(cache.is_empty());
		assert!(!cache.is_done());
	}
}
