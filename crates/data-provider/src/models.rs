// SPDX-License-Identifier: GPL-3.0

//! Core data types shared by every provider: items, fetch parameters and results,
//! buffered edits, and mutation event payloads.

use crate::filter::{FilterCriterion, SortCriterion};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::{fmt, fmt::Debug, hash::Hash};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Number of rows requested per page when a fetch does not specify a size.
pub const DEFAULT_FETCH_SIZE: usize = 25;

/// Identifier of a row.
///
/// Keys are opaque to the providers: they are only hashed and compared. Uniqueness is
/// enforced by the data source, not here.
pub trait ProviderKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
	/// Produce a fresh placeholder key for a row added without one.
	///
	/// Returns `None` for key types that cannot be synthesized, in which case adding a
	/// keyless row requires a configured key generator.
	fn generate() -> Option<Self> {
		None
	}
}

impl ProviderKey for String {
	fn generate() -> Option<Self> {
		Some(Uuid::new_v4().to_string())
	}
}

impl ProviderKey for Uuid {
	fn generate() -> Option<Self> {
		Some(Uuid::new_v4())
	}
}

macro_rules! impl_provider_key {
	($($ty:ty),* $(,)?) => {
		$(impl ProviderKey for $ty {})*
	};
}

impl_provider_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Row payload. Providers never inspect it.
pub trait ProviderData: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> ProviderData for T {}

/// Identity of a row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemMetadata<K> {
	/// Row key.
	pub key: K,
}

impl<K> ItemMetadata<K> {
	/// Create metadata for `key`.
	pub fn new(key: K) -> Self {
		Self { key }
	}
}

/// A single row plus its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct Item<K, D> {
	/// Row identity.
	pub metadata: ItemMetadata<K>,
	/// Row payload.
	pub data: D,
}

impl<K, D> Item<K, D> {
	/// Create an item from a key and its payload.
	pub fn new(key: K, data: D) -> Self {
		Self { metadata: ItemMetadata::new(key), data }
	}

	/// The row key.
	pub fn key(&self) -> &K {
		&self.metadata.key
	}
}

/// A row whose payload may be absent, as carried by remove edits.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemWithOptionalData<K, D> {
	/// Row identity.
	pub metadata: ItemMetadata<K>,
	/// Row payload, if known.
	pub data: Option<D>,
}

impl<K, D> ItemWithOptionalData<K, D> {
	/// Identify a row by key only.
	pub fn key_only(key: K) -> Self {
		Self { metadata: ItemMetadata::new(key), data: None }
	}

	/// The row key.
	pub fn key(&self) -> &K {
		&self.metadata.key
	}
}

impl<K, D> From<Item<K, D>> for ItemWithOptionalData<K, D> {
	fn from(item: Item<K, D>) -> Self {
		Self { metadata: item.metadata, data: Some(item.data) }
	}
}

/// A row to be added. A `None` key asks the buffer to generate one.
#[derive(Clone, Debug, PartialEq)]
pub struct NewItem<K, D> {
	/// Key of the new row, if the caller already knows it.
	pub key: Option<K>,
	/// Payload of the new row.
	pub data: D,
}

impl<K, D> NewItem<K, D> {
	/// A new row with a caller supplied key.
	pub fn with_key(key: K, data: D) -> Self {
		Self { key: Some(key), data }
	}

	/// A new row whose key will be generated.
	pub fn keyless(data: D) -> Self {
		Self { key: None, data }
	}
}

impl<K, D> From<Item<K, D>> for NewItem<K, D> {
	fn from(item: Item<K, D>) -> Self {
		Self { key: Some(item.metadata.key), data: item.data }
	}
}

/// Kind of a buffered edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
	/// A row that does not exist in the source yet.
	Add,
	/// A source row scheduled for deletion.
	Remove,
	/// A source row with replaced data.
	Update,
}

impl fmt::Display for EditOperation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Add => write!(f, "add"),
			Self::Remove => write!(f, "remove"),
			Self::Update => write!(f, "update"),
		}
	}
}

/// Lifecycle status of a buffered edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditStatus {
	/// Not yet handed to the caller's submit step.
	Unsubmitted,
	/// Being written by the caller.
	Submitting,
	/// Written successfully. Terminal: the edit leaves the buffer.
	Submitted,
}

impl fmt::Display for EditStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unsubmitted => write!(f, "unsubmitted"),
			Self::Submitting => write!(f, "submitting"),
			Self::Submitted => write!(f, "submitted"),
		}
	}
}

/// Severity of an [`ItemMessage`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
	/// A failure.
	#[default]
	Error,
	/// A problem that did not prevent the operation.
	Warning,
	/// Informational only.
	Info,
	/// Positive confirmation.
	Confirmation,
}

/// Message attached to an edit, typically the reason a submission failed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMessage {
	/// How serious the message is.
	pub severity: MessageSeverity,
	/// Short description.
	pub summary: String,
	/// Optional longer description.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl ItemMessage {
	/// An error message with the given summary.
	pub fn error(summary: impl Into<String>) -> Self {
		Self { severity: MessageSeverity::Error, summary: summary.into(), detail: None }
	}

	/// Attach a detailed description.
	pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
		self.detail = Some(detail.into());
		self
	}
}

/// A buffered local change that has not been committed to the source yet.
#[derive(Clone, Debug, PartialEq)]
pub struct EditItem<K, D> {
	/// What the edit does.
	pub operation: EditOperation,
	/// Affected row. Adds and updates always carry data.
	pub item: ItemWithOptionalData<K, D>,
	/// Lifecycle status.
	pub status: EditStatus,
	/// Last submission error, if any.
	pub error: Option<ItemMessage>,
	/// Requested position of an added row.
	pub add_before_key: Option<K>,
}

impl<K, D> EditItem<K, D> {
	pub(crate) fn new(operation: EditOperation, item: ItemWithOptionalData<K, D>) -> Self {
		Self { operation, item, status: EditStatus::Unsubmitted, error: None, add_before_key: None }
	}

	/// Key of the edited row.
	pub fn key(&self) -> &K {
		&self.item.metadata.key
	}
}

/// Parameters of an iteration started with `fetch_first`.
#[derive(Clone, Debug, Default)]
pub struct FetchListParameters {
	/// Rows per page. Defaults to [`DEFAULT_FETCH_SIZE`].
	pub size: Option<usize>,
	/// Ordering to apply, most significant first.
	pub sort_criteria: Vec<SortCriterion>,
	/// Rows must match this filter.
	pub filter_criterion: Option<FilterCriterion>,
	/// Attributes to include in each row. `None` means all.
	pub attributes: Option<Vec<String>>,
	/// Ask the source to report the total number of rows matching the filter.
	pub include_filtered_row_count: bool,
	/// Abort signal.
	pub signal: Option<CancellationToken>,
}

impl FetchListParameters {
	/// Parameters with every option unset.
	pub fn new() -> Self {
		Self::default()
	}

	/// Set the page size.
	pub fn with_size(mut self, size: usize) -> Self {
		self.size = Some(size);
		self
	}

	/// Set the sort criteria.
	pub fn with_sort(mut self, sort_criteria: Vec<SortCriterion>) -> Self {
		self.sort_criteria = sort_criteria;
		self
	}

	/// Set the filter.
	pub fn with_filter(mut self, filter: FilterCriterion) -> Self {
		self.filter_criterion = Some(filter);
		self
	}

	/// Restrict the returned attributes.
	pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
		self.attributes = Some(attributes);
		self
	}

	/// Attach an abort signal.
	pub fn with_signal(mut self, signal: CancellationToken) -> Self {
		self.signal = Some(signal);
		self
	}

	/// Effective page size.
	pub fn fetch_size(&self) -> usize {
		self.size.unwrap_or(DEFAULT_FETCH_SIZE)
	}

	/// Returns `true` if the attached signal has already fired.
	pub fn is_aborted(&self) -> bool {
		self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
	}
}

/// One page of rows produced by an iterator.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchListResult<K, D> {
	/// Parameters the iteration was started with.
	pub fetch_parameters: FetchListParameters,
	/// Row payloads.
	pub data: Vec<D>,
	/// Row identities, parallel to `data`.
	pub metadata: Vec<ItemMetadata<K>>,
	/// Total rows matching the filter, when requested and known.
	pub total_filtered_row_count: Option<usize>,
}

impl<K, D> FetchListResult<K, D> {
	/// A page without rows.
	pub fn empty(fetch_parameters: FetchListParameters) -> Self {
		Self { fetch_parameters, data: Vec::new(), metadata: Vec::new(), total_filtered_row_count: None }
	}

	/// Number of rows in the page.
	pub fn len(&self) -> usize {
		self.data.len()
	}

	/// Returns `true` if the page holds no rows.
	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Keys of the rows, in page order.
	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.metadata.iter().map(|m| &m.key)
	}
}

impl<K: Clone, D: Clone> FetchListResult<K, D> {
	/// Rows of the page as items.
	pub fn items(&self) -> Vec<Item<K, D>> {
		self.metadata
			.iter()
			.zip(self.data.iter())
			.map(|(m, d)| Item { metadata: m.clone(), data: d.clone() })
			.collect()
	}
}

// `CancellationToken` has no notion of equality; two parameter sets are compared by value.
impl PartialEq for FetchListParameters {
	fn eq(&self, other: &Self) -> bool {
		self.size == other.size &&
			self.sort_criteria == other.sort_criteria &&
			self.filter_criterion == other.filter_criterion &&
			self.attributes == other.attributes &&
			self.include_filtered_row_count == other.include_filtered_row_count
	}
}

/// Outcome of one `next()` call on an iterator.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationResult<K, D> {
	/// The page produced by this call.
	pub value: FetchListResult<K, D>,
	/// `true` once the iteration has nothing more to produce.
	pub done: bool,
}

impl<K, D> IterationResult<K, D> {
	/// An empty, terminal result.
	pub fn finished(fetch_parameters: FetchListParameters) -> Self {
		Self { value: FetchListResult::empty(fetch_parameters), done: true }
	}
}

/// Whether a key lookup covers all rows or only those visited so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchScope {
	/// Every row of the provider.
	#[default]
	Global,
	/// Only rows already fetched by the current iteration.
	Local,
}

/// Parameters of `fetch_by_keys` and `contains_keys`.
#[derive(Clone, Debug)]
pub struct FetchByKeysParameters<K> {
	/// Keys to look up, in caller order.
	pub keys: IndexSet<K>,
	/// Attributes to include in each row. `None` means all.
	pub attributes: Option<Vec<String>>,
	/// Lookup scope.
	pub scope: FetchScope,
	/// Abort signal.
	pub signal: Option<CancellationToken>,
}

impl<K: ProviderKey> FetchByKeysParameters<K> {
	/// Look up the given keys.
	pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
		Self { keys: keys.into_iter().collect(), attributes: None, scope: FetchScope::Global, signal: None }
	}

	/// Attach an abort signal.
	pub fn with_signal(mut self, signal: CancellationToken) -> Self {
		self.signal = Some(signal);
		self
	}

	/// Restrict the returned attributes.
	pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
		self.attributes = Some(attributes);
		self
	}

	/// The same parameters for a different key set.
	pub fn with_keys(&self, keys: impl IntoIterator<Item = K>) -> Self {
		Self {
			keys: keys.into_iter().collect(),
			attributes: self.attributes.clone(),
			scope: self.scope,
			signal: self.signal.clone(),
		}
	}

	/// Returns `true` if the attached signal has already fired.
	pub fn is_aborted(&self) -> bool {
		self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
	}
}

/// Result of `fetch_by_keys`. Missing keys are absent from `results`.
#[derive(Clone, Debug)]
pub struct FetchByKeysResults<K, D> {
	/// Parameters of the request.
	pub fetch_parameters: FetchByKeysParameters<K>,
	/// Found rows, in the order the keys were requested.
	pub results: IndexMap<K, Item<K, D>>,
}

/// Result of `contains_keys`.
#[derive(Clone, Debug)]
pub struct ContainsKeysResults<K> {
	/// Parameters of the request.
	pub contains_parameters: FetchByKeysParameters<K>,
	/// Keys that exist, in the order they were requested.
	pub results: IndexSet<K>,
}

/// Parameters of `fetch_by_offset`.
#[derive(Clone, Debug, Default)]
pub struct FetchByOffsetParameters {
	/// Index of the first row to return.
	pub offset: usize,
	/// Maximum rows to return. Defaults to [`DEFAULT_FETCH_SIZE`].
	pub size: Option<usize>,
	/// Ordering to apply, most significant first.
	pub sort_criteria: Vec<SortCriterion>,
	/// Rows must match this filter.
	pub filter_criterion: Option<FilterCriterion>,
	/// Attributes to include in each row. `None` means all.
	pub attributes: Option<Vec<String>>,
	/// Abort signal.
	pub signal: Option<CancellationToken>,
}

impl FetchByOffsetParameters {
	/// Request `size` rows starting at `offset`.
	pub fn new(offset: usize, size: usize) -> Self {
		Self { offset, size: Some(size), ..Default::default() }
	}

	/// Effective number of rows requested.
	pub fn fetch_size(&self) -> usize {
		self.size.unwrap_or(DEFAULT_FETCH_SIZE)
	}

	/// Returns `true` if the attached signal has already fired.
	pub fn is_aborted(&self) -> bool {
		self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
	}

	/// The equivalent iteration parameters, used when offsets are served by iterating.
	pub fn to_list_parameters(&self) -> FetchListParameters {
		FetchListParameters {
			size: self.size,
			sort_criteria: self.sort_criteria.clone(),
			filter_criterion: self.filter_criterion.clone(),
			attributes: self.attributes.clone(),
			include_filtered_row_count: false,
			signal: self.signal.clone(),
		}
	}
}

/// Result of `fetch_by_offset`.
#[derive(Clone, Debug)]
pub struct FetchByOffsetResults<K, D> {
	/// Parameters of the request.
	pub fetch_parameters: FetchByOffsetParameters,
	/// Rows starting at the requested offset.
	pub results: Vec<Item<K, D>>,
	/// `true` if no rows exist past the returned ones.
	pub done: bool,
}

/// Answer of `is_empty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emptiness {
	/// The provider has no rows.
	Yes,
	/// The provider has at least one row.
	No,
	/// Not known without fetching.
	Unknown,
}

/// Rows affected by one kind of mutation.
///
/// `metadata`, `data`, `indexes`, `add_before_keys` and `after_keys` are parallel to
/// `keys`.
#[derive(Clone, Debug)]
pub struct OperationDetail<K, D> {
	/// Affected keys.
	pub keys: IndexSet<K>,
	/// Identities of the affected rows.
	pub metadata: Vec<ItemMetadata<K>>,
	/// New payloads. Absent for removals that do not report them.
	pub data: Option<Vec<D>>,
	/// Row positions in the provider's ordering, when known.
	pub indexes: Option<Vec<usize>>,
	/// For additions: key of the row each added row was inserted before.
	pub add_before_keys: Option<Vec<Option<K>>>,
	/// For additions: key of the row each added row was inserted after.
	pub after_keys: Option<Vec<Option<K>>>,
}

impl<K: Hash + Eq, D: PartialEq> PartialEq for OperationDetail<K, D> {
	fn eq(&self, other: &Self) -> bool {
		// Key order is part of the detail: the other lists are parallel to it.
		self.keys.iter().eq(other.keys.iter()) &&
			self.metadata == other.metadata &&
			self.data == other.data &&
			self.indexes == other.indexes &&
			self.add_before_keys == other.add_before_keys &&
			self.after_keys == other.after_keys
	}
}

impl<K: ProviderKey, D: ProviderData> OperationDetail<K, D> {
	/// Detail covering the given items.
	pub fn from_items(items: impl IntoIterator<Item = Item<K, D>>) -> Self {
		let mut keys = IndexSet::new();
		let mut metadata = Vec::new();
		let mut data = Vec::new();
		for item in items {
			keys.insert(item.metadata.key.clone());
			metadata.push(item.metadata);
			data.push(item.data);
		}
		Self { keys, metadata, data: Some(data), indexes: None, add_before_keys: None, after_keys: None }
	}

	/// Detail covering keys only.
	pub fn from_keys(keys: impl IntoIterator<Item = K>) -> Self {
		let keys: IndexSet<K> = keys.into_iter().collect();
		let metadata = keys.iter().cloned().map(ItemMetadata::new).collect();
		Self { keys, metadata, data: None, indexes: None, add_before_keys: None, after_keys: None }
	}

	/// Attach row positions.
	pub fn with_indexes(mut self, indexes: Vec<usize>) -> Self {
		self.indexes = Some(indexes);
		self
	}

	/// Attach insertion anchors.
	pub fn with_add_before_keys(mut self, add_before_keys: Vec<Option<K>>) -> Self {
		self.add_before_keys = Some(add_before_keys);
		self
	}

	/// Attach the keys each added row follows.
	pub fn with_after_keys(mut self, after_keys: Vec<Option<K>>) -> Self {
		self.after_keys = Some(after_keys);
		self
	}

	/// Number of affected rows.
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	/// Returns `true` if no rows are affected.
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Position of the `i`-th affected row, if reported.
	pub fn index_at(&self, i: usize) -> Option<usize> {
		self.indexes.as_ref().and_then(|indexes| indexes.get(i).copied())
	}

	/// Payload of the `i`-th affected row, if reported.
	pub fn data_at(&self, i: usize) -> Option<&D> {
		self.data.as_ref().and_then(|data| data.get(i))
	}

	/// Insertion anchor of the `i`-th added row, if reported.
	pub fn add_before_key_at(&self, i: usize) -> Option<&K> {
		self.add_before_keys.as_ref().and_then(|keys| keys.get(i)).and_then(Option::as_ref)
	}

	/// Key of the row the `i`-th added row follows, if reported.
	pub fn after_key_at(&self, i: usize) -> Option<&K> {
		self.after_keys.as_ref().and_then(|keys| keys.get(i)).and_then(Option::as_ref)
	}

	/// Keep only the rows for which `keep` returns `true`, preserving every parallel list.
	pub fn retain(&mut self, mut keep: impl FnMut(usize, &K) -> bool) {
		let mask: Vec<bool> = self.keys.iter().enumerate().map(|(i, k)| keep(i, k)).collect();
		if mask.iter().all(|kept| *kept) {
			return;
		}
		fn filter<T>(values: Vec<T>, mask: &[bool]) -> Vec<T> {
			values
				.into_iter()
				.zip(mask.iter())
				.filter_map(|(value, kept)| kept.then_some(value))
				.collect()
		}
		self.keys = filter(std::mem::take(&mut self.keys).into_iter().collect(), &mask)
			.into_iter()
			.collect();
		self.metadata = filter(std::mem::take(&mut self.metadata), &mask);
		self.data = self.data.take().map(|data| filter(data, &mask));
		self.indexes = self.indexes.take().map(|indexes| filter(indexes, &mask));
		self.add_before_keys = self.add_before_keys.take().map(|keys| filter(keys, &mask));
		self.after_keys = self.after_keys.take().map(|keys| filter(keys, &mask));
	}
}

/// Payload of a `mutate` event.
#[derive(Clone, Debug)]
pub struct MutationDetail<K, D> {
	/// Rows added to the provider.
	pub add: Option<OperationDetail<K, D>>,
	/// Rows removed from the provider.
	pub remove: Option<OperationDetail<K, D>>,
	/// Rows whose data changed.
	pub update: Option<OperationDetail<K, D>>,
}

impl<K: Hash + Eq, D: PartialEq> PartialEq for MutationDetail<K, D> {
	fn eq(&self, other: &Self) -> bool {
		self.add == other.add && self.remove == other.remove && self.update == other.update
	}
}

impl<K, D> Default for MutationDetail<K, D> {
	fn default() -> Self {
		Self { add: None, remove: None, update: None }
	}
}

impl<K: ProviderKey, D: ProviderData> MutationDetail<K, D> {
	/// A mutation that only adds rows.
	pub fn added(detail: OperationDetail<K, D>) -> Self {
		Self { add: Some(detail), ..Default::default() }
	}

	/// A mutation that only removes rows.
	pub fn removed(detail: OperationDetail<K, D>) -> Self {
		Self { remove: Some(detail), ..Default::default() }
	}

	/// A mutation that only updates rows.
	pub fn updated(detail: OperationDetail<K, D>) -> Self {
		Self { update: Some(detail), ..Default::default() }
	}

	/// Returns `true` if the mutation affects no rows.
	pub fn is_empty(&self) -> bool {
		[&self.add, &self.remove, &self.update]
			.into_iter()
			.all(|op| op.as_ref().is_none_or(OperationDetail::is_empty))
	}
}

/// Events published by providers.
#[derive(Clone, Debug)]
pub enum DataProviderEvent<K, D> {
	/// Rows were added, removed or updated.
	Mutate(MutationDetail<K, D>),
	/// Everything previously fetched may be stale.
	Refresh,
	/// The set of submittable edits may have changed.
	SubmittableChange(Vec<EditItem<K, D>>),
}

impl<K: Hash + Eq, D: PartialEq> PartialEq for DataProviderEvent<K, D> {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Mutate(a), Self::Mutate(b)) => a == b,
			(Self::Refresh, Self::Refresh) => true,
			(Self::SubmittableChange(a), Self::SubmittableChange(b)) => a == b,
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_keys_generate_uuids() {
		let key = String::generate().unwrap();
		assert!(Uuid::parse_str(&key).is_ok());
		assert_ne!(Some(key), String::generate());
	}

	#[test]
	fn integer_keys_do_not_generate() {
		assert_eq!(u64::generate(), None);
	}

	#[test]
	fn retain_keeps_parallel_lists_aligned() {
		let mut detail: OperationDetail<String, i32> = OperationDetail::from_items(vec![
			Item::new("a".to_string(), 1),
			Item::new("b".to_string(), 2),
			Item::new("c".to_string(), 3),
		])
		.with_indexes(vec![0, 1, 2]);

		detail.retain(|_, key| key != "b");

		assert_eq!(detail.keys.iter().collect::<Vec<_>>(), vec!["a", "c"]);
		assert_eq!(detail.data, Some(vec![1, 3]));
		assert_eq!(detail.indexes, Some(vec![0, 2]));
		assert_eq!(detail.metadata[1].key, "c");
	}

	#[test]
	fn retain_drops_anchors_of_removed_rows() {
		let mut detail: OperationDetail<String, i32> =
			OperationDetail::from_keys(vec!["x".to_string(), "y".to_string()])
				.with_after_keys(vec![Some("a".to_string()), None]);

		detail.retain(|_, key| key != "x");

		assert_eq!(detail.after_keys, Some(vec![None]));
		assert_eq!(detail.after_key_at(0), None);
	}

	#[test]
	fn details_with_reordered_keys_differ() {
		let forward: OperationDetail<String, i32> =
			OperationDetail::from_keys(vec!["a".to_string(), "b".to_string()]).with_indexes(vec![0, 1]);
		let reversed: OperationDetail<String, i32> =
			OperationDetail::from_keys(vec!["b".to_string(), "a".to_string()]).with_indexes(vec![0, 1]);

		assert_eq!(forward, forward.clone());
		assert_ne!(forward, reversed);
		assert_ne!(MutationDetail::removed(forward), MutationDetail::removed(reversed));
	}

	#[test]
	fn mutation_detail_is_empty_ignores_empty_operations() {
		let detail: MutationDetail<String, i32> =
			MutationDetail::removed(OperationDetail::from_keys(Vec::<String>::new()));
		assert!(detail.is_empty());
		assert!(!MutationDetail::<String, i32>::removed(OperationDetail::from_keys(vec!["k".into()])).is_empty());
	}

	#[test]
	fn aborted_parameters_are_detected() {
		let token = CancellationToken::new();
		let params = FetchListParameters::new().with_signal(token.clone());
		assert!(!params.is_aborted());
		token.cancel();
		assert!(params.is_aborted());
	}

	#[test]
	fn edit_enums_display_lowercase() {
		assert_eq!(EditOperation::Update.to_string(), "update");
		assert_eq!(EditStatus::Submitting.to_string(), "submitting");
	}
}
