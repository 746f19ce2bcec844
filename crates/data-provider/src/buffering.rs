// SPDX-License-Identifier: GPL-3.0

//! Edit-buffering overlay.
//!
//! [`BufferingDataProvider`] keeps local adds, removes and updates in an [`EditBuffer`]
//! and presents the wrapped source as if they had already been applied:
//!
//! - key lookups answer from the buffer first and delegate the rest in one batch;
//! - iteration hides removed rows, substitutes updated data and splices added rows in
//!   before their `add_before_key` (or at the top of the list);
//! - source mutations are re-announced with positions translated into the merged view;
//! - a source refresh drops edits of rows that no longer exist.
//!
//! Writing edits to the backend is up to the caller, who reports progress back through
//! [`BufferingDataProvider::set_item_status`].

use crate::{
	buffer::EditBuffer,
	config::{BufferingOptions, RowFilter},
	error::{BufferError, ProviderError},
	events::{EventBus, SourceEventHandler, spawn_source_listener},
	models::{
		ContainsKeysResults, DataProviderEvent, EditItem, EditOperation, EditStatus, Emptiness,
		FetchByKeysParameters, FetchByKeysResults, FetchByOffsetParameters, FetchByOffsetResults,
		FetchListParameters, FetchListResult, Item, ItemMessage, ItemMetadata, ItemWithOptionalData,
		IterationResult, MutationDetail, NewItem, ProviderData, ProviderKey,
	},
	positions::{IndexChange, PositionLedger},
	provider::{
		BoxedIterator, Capability, CapabilityName, DataProvider, FetchListIterator, KeyCollections,
		SharedProvider,
	},
	strings::log_targets::BUFFERING,
};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace, warn};
use std::{
	collections::HashSet,
	sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Visible edits keyed by row key, in buffer order.
type EditSnapshot<K, D> = IndexMap<K, EditItem<K, D>>;

/// How one requested key is answered.
enum KeyResolution<K, D> {
	/// From buffered data.
	Buffered(D),
	/// Hidden by a buffered remove.
	Removed,
	/// By the source, under this key.
	Source(K),
}

struct BufferingInner<K: ProviderKey, D: ProviderData> {
	source: SharedProvider<K, D>,
	buffer: Mutex<EditBuffer<K, D>>,
	ledger: Mutex<PositionLedger<K>>,
	filter_evaluator: Option<RowFilter<D>>,
	events: EventBus<DataProviderEvent<K, D>>,
}

/// Data provider overlaying buffered local edits on a source.
///
/// Must be created inside a Tokio runtime.
pub struct BufferingDataProvider<K: ProviderKey, D: ProviderData> {
	inner: Arc<BufferingInner<K, D>>,
	_listener: DropGuard,
}

impl<K: ProviderKey, D: ProviderData> BufferingDataProvider<K, D> {
	/// Wrap `source`.
	pub fn new(source: SharedProvider<K, D>, options: BufferingOptions<K, D>) -> Self {
		let receiver = source.subscribe();
		let inner = Arc::new(BufferingInner {
			source,
			buffer: Mutex::new(EditBuffer::new(options.key_generator)),
			ledger: Mutex::new(PositionLedger::default()),
			filter_evaluator: options.filter_evaluator,
			events: EventBus::new(options.event_capacity),
		});
		let shutdown = CancellationToken::new();
		spawn_source_listener(receiver, Arc::downgrade(&inner), shutdown.clone(), BUFFERING);
		Self { inner, _listener: shutdown.drop_guard() }
	}

	/// Buffer a new row, placed before `add_before_key` when iterating.
	///
	/// Returns the row's key, generated if `item.key` is `None`.
	pub fn add_item(&self, item: NewItem<K, D>, add_before_key: Option<K>) -> Result<K, BufferError> {
		let key = self.inner.edit(|buffer| buffer.add_item(item, add_before_key))?;
		debug!(target: BUFFERING, "Buffered add of {key:?}");
		Ok(key)
	}

	/// Buffer the removal of a row.
	pub fn remove_item(&self, item: ItemWithOptionalData<K, D>) -> Result<(), BufferError> {
		let key = item.key().clone();
		self.inner.edit(|buffer| buffer.remove_item(item))?;
		debug!(target: BUFFERING, "Buffered remove of {key:?}");
		Ok(())
	}

	/// Buffer new data for a row.
	pub fn update_item(&self, item: Item<K, D>) -> Result<(), BufferError> {
		let key = item.key().clone();
		self.inner.edit(|buffer| buffer.update_item(item))?;
		debug!(target: BUFFERING, "Buffered update of {key:?}");
		Ok(())
	}

	/// Report submission progress of `edit`. See [`EditBuffer::set_item_status`].
	pub fn set_item_status(
		&self,
		edit: &EditItem<K, D>,
		status: EditStatus,
		error: Option<ItemMessage>,
		new_key: Option<K>,
	) -> Result<(), BufferError> {
		self.inner.edit(|buffer| buffer.set_item_status(edit, status, error, new_key))?;
		debug!(target: BUFFERING, "Edit of {:?} is now {status}", edit.key());
		Ok(())
	}

	/// Unsubmitted edits that may be submitted now.
	pub fn get_submittable_items(&self) -> Result<Vec<EditItem<K, D>>, BufferError> {
		Ok(self.inner.lock_buffer()?.get_submittable_items())
	}

	/// Discard every unsubmitted edit.
	pub fn reset_all_unsubmitted_items(&self) -> Result<(), BufferError> {
		self.inner.edit(|buffer| {
			buffer.reset_all_unsubmitted_items();
			Ok(())
		})
	}

	/// Discard the unsubmitted edit of `key`, if any.
	pub fn reset_unsubmitted_item(&self, key: &K) -> Result<(), BufferError> {
		self.inner.edit(|buffer| {
			buffer.reset_unsubmitted_item(key);
			Ok(())
		})
	}

	/// The edit currently visible for `key`.
	pub fn get_item(&self, key: &K) -> Result<Option<EditItem<K, D>>, BufferError> {
		Ok(self.inner.lock_buffer()?.get_item(key).cloned())
	}

	/// The real key a generated key was submitted as.
	pub fn resolve_generated_key(&self, key: &K) -> Result<Option<K>, BufferError> {
		Ok(self.inner.lock_buffer()?.resolve_generated_key(key).cloned())
	}

	fn iterate(&self, params: FetchListParameters, track_positions: bool) -> BufferingIterator<K, D> {
		BufferingIterator {
			upstream: self.inner.source.fetch_first(params.clone()),
			inner: self.inner.clone(),
			params,
			inserted: HashSet::new(),
			source_offset: 0,
			started: false,
			finished: false,
			track_positions,
		}
	}
}

impl<K: ProviderKey, D: ProviderData> BufferingInner<K, D> {
	fn lock_buffer(&self) -> Result<MutexGuard<'_, EditBuffer<K, D>>, BufferError> {
		self.buffer.lock().map_err(|err| BufferError::Lock(err.to_string()))
	}

	fn lock_ledger(&self) -> Result<MutexGuard<'_, PositionLedger<K>>, ProviderError> {
		self.ledger.lock().map_err(|err| ProviderError::Lock(err.to_string()))
	}

	/// Run a buffer operation and announce the submittable edits after it.
	fn edit<T>(
		&self,
		operation: impl FnOnce(&mut EditBuffer<K, D>) -> Result<T, BufferError>,
	) -> Result<T, BufferError> {
		let (result, submittable) = {
			let mut buffer = self.lock_buffer()?;
			let result = operation(&mut *buffer)?;
			(result, buffer.get_submittable_items())
		};
		self.events.publish(DataProviderEvent::SubmittableChange(submittable));
		Ok(result)
	}

	fn visible_edits(&self) -> Result<EditSnapshot<K, D>, BufferError> {
		Ok(self
			.lock_buffer()?
			.visible_items()
			.into_iter()
			.map(|edit| (edit.key().clone(), edit))
			.collect())
	}

	/// Decide, for every requested key, whether the buffer or the source answers it.
	///
	/// A generated key that was submitted under a real key is looked up under the real
	/// key.
	fn resolve_keys(&self, keys: &IndexSet<K>) -> Result<IndexMap<K, KeyResolution<K, D>>, BufferError> {
		let buffer = self.lock_buffer()?;
		let resolve = |key: &K| {
			let real = buffer.resolve_generated_key(key).unwrap_or(key);
			let edit = buffer.get_item(key).or_else(|| buffer.get_item(real));
			let buffered = match edit {
				Some(edit) if edit.operation == EditOperation::Remove => Some(KeyResolution::Removed),
				Some(edit) => edit.item.data.clone().map(KeyResolution::Buffered),
				None => None,
			};
			buffered.unwrap_or_else(|| KeyResolution::Source(real.clone()))
		};
		Ok(keys.iter().map(|key| (key.clone(), resolve(key))).collect())
	}

	/// Anchors of buffered adds that will not show up in the merged stream of `params`.
	///
	/// An anchor is missing when the buffer removes it, when the source lacks it, or when
	/// it falls outside the iteration's filter. Under a filter with no evaluator its
	/// membership cannot be told, and it counts as missing.
	async fn orphan_anchors(
		&self,
		edits: &EditSnapshot<K, D>,
		params: &FetchListParameters,
	) -> Result<HashSet<K>, ProviderError> {
		let mut orphans = HashSet::new();
		let mut lookups = IndexSet::new();
		let anchors = edits
			.values()
			.filter(|edit| edit.operation == EditOperation::Add)
			.filter_map(|edit| edit.add_before_key.clone());
		for anchor in anchors {
			match edits.get(&anchor).map(|edit| edit.operation) {
				Some(EditOperation::Add) => {},
				Some(EditOperation::Remove) => {
					orphans.insert(anchor);
				},
				_ => {
					lookups.insert(anchor);
				},
			}
		}
		if lookups.is_empty() {
			return Ok(orphans);
		}
		let mut lookup = FetchByKeysParameters::new(lookups.iter().cloned());
		lookup.signal = params.signal.clone();
		match (&params.filter_criterion, &self.filter_evaluator) {
			(None, _) => {
				let found = self.source.contains_keys(lookup).await?.results;
				orphans.extend(lookups.into_iter().filter(|anchor| !found.contains(anchor)));
			},
			(Some(filter), Some(evaluate)) => {
				let found = self.source.fetch_by_keys(lookup).await?.results;
				orphans.extend(
					lookups
						.into_iter()
						.filter(|anchor| !found.get(anchor).is_some_and(|item| evaluate(filter, &item.data))),
				);
			},
			(Some(_), None) => {
				debug!(target: BUFFERING, "No filter evaluator, {} anchors treated as absent", lookups.len());
				orphans.extend(lookups);
			},
		}
		Ok(orphans)
	}

	/// Rewrite a source mutation for consumers of the merged view.
	fn translate_mutation(&self, mut detail: MutationDetail<K, D>) -> Result<MutationDetail<K, D>, ProviderError> {
		let buffer = self.lock_buffer()?;
		let mut ledger = self.lock_ledger()?;
		let operation = |key: &K| buffer.get_item(key).map(|edit| edit.operation);
		let hidden_active = |key: &K| matches!(operation(key), Some(EditOperation::Remove | EditOperation::Add));
		let anchor_active = |key: &K| operation(key) == Some(EditOperation::Add);

		if let Some(remove) = detail.remove.as_mut() {
			let mut removed = remove.indexes.clone().unwrap_or_default();
			remove.retain(|_, key| operation(key) != Some(EditOperation::Remove));
			if let Some(indexes) = remove.indexes.as_mut() {
				for index in indexes.iter_mut() {
					*index = ledger.translate(*index, hidden_active, anchor_active);
				}
			}
			removed.sort_unstable_by(|a, b| b.cmp(a));
			for index in removed {
				ledger.apply(IndexChange::Removed(index));
			}
		}
		if let Some(add) = detail.add.as_mut() {
			let mut added = add.indexes.clone().unwrap_or_default();
			added.sort_unstable();
			for index in added {
				ledger.apply(IndexChange::Added(index));
			}
			// Rows already shown through a buffered add are not announced twice.
			add.retain(|_, key| operation(key) != Some(EditOperation::Add));
			if let Some(indexes) = add.indexes.as_mut() {
				for index in indexes.iter_mut() {
					*index = ledger.translate(*index, hidden_active, anchor_active);
				}
			}
		}
		if let Some(update) = detail.update.as_mut() {
			update.retain(|_, key| operation(key) != Some(EditOperation::Remove));
			let keys: Vec<K> = update.keys.iter().cloned().collect();
			if let Some(data) = update.data.as_mut() {
				for (key, slot) in keys.iter().zip(data.iter_mut()) {
					if let Some(buffered) = buffer.get_item(key).and_then(|edit| edit.item.data.clone()) {
						*slot = buffered;
					}
				}
			}
			if let Some(indexes) = update.indexes.as_mut() {
				for index in indexes.iter_mut() {
					*index = ledger.translate(*index, hidden_active, anchor_active);
				}
			}
		}
		Ok(detail)
	}

	/// Drop buffered removes and updates of rows the source no longer has.
	async fn drop_vanished_edits(&self) -> Result<(), ProviderError> {
		let keys = self.lock_buffer()?.unsubmitted_keys(&[EditOperation::Remove, EditOperation::Update]);
		if keys.is_empty() {
			return Ok(());
		}
		let found = self.source.fetch_by_keys(FetchByKeysParameters::new(keys.iter().cloned())).await?;
		let vanished: Vec<K> = keys.into_iter().filter(|key| !found.results.contains_key(key)).collect();
		if vanished.is_empty() {
			return Ok(());
		}
		let submittable = {
			let mut buffer = self.lock_buffer()?;
			for key in &vanished {
				let operation = buffer.unsubmitted_item(key).map(|edit| edit.operation);
				if matches!(operation, Some(EditOperation::Remove | EditOperation::Update)) {
					buffer.reset_unsubmitted_item(key);
				}
			}
			buffer.get_submittable_items()
		};
		debug!(target: BUFFERING, "Dropped edits of {} rows missing after refresh", vanished.len());
		self.events.publish(DataProviderEvent::SubmittableChange(submittable));
		Ok(())
	}

	/// Keys of the visible buffered adds and removes.
	fn edit_keys(&self) -> Result<(Vec<K>, Vec<K>), BufferError> {
		let mut adds = Vec::new();
		let mut removes = Vec::new();
		for edit in self.lock_buffer()?.visible_items() {
			match edit.operation {
				EditOperation::Add => adds.push(edit.key().clone()),
				EditOperation::Remove => removes.push(edit.key().clone()),
				EditOperation::Update => {},
			}
		}
		Ok((adds, removes))
	}
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> SourceEventHandler<K, D> for BufferingInner<K, D> {
	async fn on_mutate(&self, detail: MutationDetail<K, D>) {
		match self.translate_mutation(detail) {
			Ok(translated) if translated.is_empty() => {
				trace!(target: BUFFERING, "Source mutation fully hidden by buffered edits");
			},
			Ok(translated) => {
				self.events.publish(DataProviderEvent::Mutate(translated));
			},
			Err(err) => warn!(target: BUFFERING, "Unable to translate source mutation: {err}"),
		}
	}

	async fn on_refresh(&self) {
		if let Err(err) = self.drop_vanished_edits().await {
			warn!(target: BUFFERING, "Unable to check buffered edits after refresh: {err}");
		}
		match self.lock_ledger() {
			Ok(mut ledger) => ledger.clear(),
			Err(err) => warn!(target: BUFFERING, "{err}"),
		}
		self.events.publish(DataProviderEvent::Refresh);
	}

	async fn on_other(&self, event: DataProviderEvent<K, D>) {
		self.events.publish(event);
	}
}

/// Builds one merged page.
struct PageBuilder<'a, K: ProviderKey, D: ProviderData> {
	edits: &'a EditSnapshot<K, D>,
	inserted: &'a mut HashSet<K>,
	ledger: Option<&'a mut PositionLedger<K>>,
	data: Vec<D>,
	metadata: Vec<ItemMetadata<K>>,
}

impl<K: ProviderKey, D: ProviderData> PageBuilder<'_, K, D> {
	fn push(&mut self, metadata: ItemMetadata<K>, data: D) {
		self.metadata.push(metadata);
		self.data.push(data);
	}

	/// Emit a buffered add once, preceded by the adds anchored before it.
	fn insert_add(&mut self, edit: &EditItem<K, D>, position: usize) {
		let key = edit.key().clone();
		if !self.inserted.insert(key.clone()) {
			return;
		}
		self.insert_anchored(&key, position);
		if let Some(data) = edit.item.data.clone() {
			self.push(ItemMetadata::new(key.clone()), data);
		}
		if let Some(ledger) = self.ledger.as_deref_mut() {
			ledger.anchor(key, position);
		}
	}

	fn insert_anchored(&mut self, anchor: &K, position: usize) {
		let edits = self.edits;
		for edit in edits
			.values()
			.filter(|edit| edit.operation == EditOperation::Add && edit.add_before_key.as_ref() == Some(anchor))
		{
			self.insert_add(edit, position);
		}
	}

	/// Merge the source row at `position`.
	fn source_row(&mut self, metadata: ItemMetadata<K>, data: D, position: usize) {
		let key = metadata.key.clone();
		let edits = self.edits;
		let edit = edits.get(&key);
		// Removed, or an add already shown elsewhere.
		let hidden = edit.is_some_and(|edit| match edit.operation {
			EditOperation::Remove => true,
			EditOperation::Add => self.inserted.contains(&key),
			EditOperation::Update => false,
		});
		if hidden {
			if let Some(ledger) = self.ledger.as_deref_mut() {
				ledger.hide(key, position);
			}
			return;
		}
		self.insert_anchored(&key, position);
		match edit {
			Some(edit) => {
				if edit.operation == EditOperation::Add {
					self.inserted.insert(key);
				}
				self.push(metadata, edit.item.data.clone().unwrap_or(data));
			},
			None => self.push(metadata, data),
		}
	}
}

/// Iterator over the merged view.
struct BufferingIterator<K: ProviderKey, D: ProviderData> {
	inner: Arc<BufferingInner<K, D>>,
	upstream: BoxedIterator<K, D>,
	params: FetchListParameters,
	/// Buffered adds already yielded.
	inserted: HashSet<K>,
	/// Source rows consumed so far.
	source_offset: usize,
	started: bool,
	finished: bool,
	/// Record hidden and inserted rows in the provider's ledger.
	track_positions: bool,
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> FetchListIterator<K, D> for BufferingIterator<K, D> {
	async fn next(&mut self) -> Result<IterationResult<K, D>, ProviderError> {
		if self.finished {
			return Ok(IterationResult::finished(self.params.clone()));
		}
		let page = self.upstream.next().await?;
		let edits = self.inner.visible_edits()?;
		let orphans = if self.started {
			HashSet::new()
		} else {
			self.inner.orphan_anchors(&edits, &self.params).await?
		};

		let inner = self.inner.clone();
		let mut ledger = if self.track_positions { Some(inner.lock_ledger()?) } else { None };
		let mut builder = PageBuilder {
			edits: &edits,
			inserted: &mut self.inserted,
			ledger: ledger.as_deref_mut(),
			data: Vec::with_capacity(page.value.len()),
			metadata: Vec::with_capacity(page.value.len()),
		};
		if !self.started {
			// Newest first at the top of the list.
			for edit in edits.values().rev().filter(|edit| {
				edit.operation == EditOperation::Add &&
					edit.add_before_key.as_ref().is_none_or(|anchor| orphans.contains(anchor))
			}) {
				builder.insert_add(edit, 0);
			}
			self.started = true;
		}
		for (data, metadata) in page.value.data.into_iter().zip(page.value.metadata) {
			builder.source_row(metadata, data, self.source_offset);
			self.source_offset += 1;
		}
		if page.done {
			// Anchors that left the source during the iteration leave their adds for last.
			for edit in edits.values().filter(|edit| edit.operation == EditOperation::Add) {
				builder.insert_add(edit, self.source_offset);
			}
			self.finished = true;
		}
		trace!(target: BUFFERING, "Merged page of {} rows (done: {})", builder.data.len(), page.done);
		let value = FetchListResult {
			fetch_parameters: self.params.clone(),
			data: builder.data,
			metadata: builder.metadata,
			total_filtered_row_count: page.value.total_filtered_row_count,
		};
		Ok(IterationResult { value, done: page.done })
	}
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> DataProvider<K, D> for BufferingDataProvider<K, D> {
	fn fetch_first(&self, params: FetchListParameters) -> BoxedIterator<K, D> {
		match self.inner.lock_ledger() {
			Ok(mut ledger) => ledger.clear(),
			Err(err) => warn!(target: BUFFERING, "{err}"),
		}
		Box::new(self.iterate(params, true))
	}

	async fn fetch_by_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<FetchByKeysResults<K, D>, ProviderError> {
		let resolutions = self.inner.resolve_keys(&params.keys)?;
		let delegated: IndexSet<K> = resolutions
			.values()
			.filter_map(|resolution| match resolution {
				KeyResolution::Source(key) => Some(key.clone()),
				_ => None,
			})
			.collect();
		let fetched = if delegated.is_empty() {
			IndexMap::new()
		} else {
			self.inner.source.fetch_by_keys(params.with_keys(delegated)).await?.results
		};
		let mut results = IndexMap::with_capacity(resolutions.len());
		for (key, resolution) in resolutions {
			let item = match resolution {
				KeyResolution::Buffered(data) => Some(Item::new(key.clone(), data)),
				KeyResolution::Removed => None,
				KeyResolution::Source(source_key) =>
					fetched.get(&source_key).map(|item| Item::new(key.clone(), item.data.clone())),
			};
			if let Some(item) = item {
				results.insert(key, item);
			}
		}
		Ok(FetchByKeysResults { fetch_parameters: params, results })
	}

	async fn fetch_by_offset(
		&self,
		params: FetchByOffsetParameters,
	) -> Result<FetchByOffsetResults<K, D>, ProviderError> {
		let end = params.offset.saturating_add(params.fetch_size());
		let mut iterator = self.iterate(params.to_list_parameters(), false);
		let mut rows = Vec::new();
		let mut exhausted = false;
		while rows.len() < end {
			let page = iterator.next().await?;
			rows.extend(page.value.items());
			if page.done {
				exhausted = true;
				break;
			}
		}
		let total = rows.len();
		let results: Vec<_> = rows.into_iter().skip(params.offset).take(params.fetch_size()).collect();
		let done = exhausted && params.offset + results.len() >= total;
		Ok(FetchByOffsetResults { fetch_parameters: params, results, done })
	}

	async fn contains_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<ContainsKeysResults<K>, ProviderError> {
		let resolutions = self.inner.resolve_keys(&params.keys)?;
		let delegated: IndexSet<K> = resolutions
			.values()
			.filter_map(|resolution| match resolution {
				KeyResolution::Source(key) => Some(key.clone()),
				_ => None,
			})
			.collect();
		let found = if delegated.is_empty() {
			IndexSet::new()
		} else {
			self.inner.source.contains_keys(params.with_keys(delegated)).await?.results
		};
		let results = resolutions
			.into_iter()
			.filter(|(_, resolution)| match resolution {
				KeyResolution::Buffered(_) => true,
				KeyResolution::Removed => false,
				KeyResolution::Source(source_key) => found.contains(source_key),
			})
			.map(|(key, _)| key)
			.collect();
		Ok(ContainsKeysResults { contains_parameters: params, results })
	}

	fn get_capability(&self, name: CapabilityName) -> Option<Capability> {
		self.inner.source.get_capability(name)
	}

	async fn get_total_size(&self) -> Result<Option<usize>, ProviderError> {
		let Some(size) = self.inner.source.get_total_size().await? else {
			return Ok(None);
		};
		let (adds, removes) = self.inner.edit_keys()?;
		if adds.is_empty() && removes.is_empty() {
			return Ok(Some(size));
		}
		let lookup = FetchByKeysParameters::new(adds.iter().chain(&removes).cloned());
		let present = self.inner.source.contains_keys(lookup).await?.results;
		// Adds of existing rows replace them in place; removes of unknown rows hide nothing.
		let added = adds.iter().filter(|key| !present.contains(*key)).count();
		let removed = removes.iter().filter(|key| present.contains(*key)).count();
		Ok(Some((size + added).saturating_sub(removed)))
	}

	fn is_empty(&self) -> Emptiness {
		let Ok((adds, removes)) = self.inner.edit_keys() else {
			return Emptiness::Unknown;
		};
		if !adds.is_empty() {
			return Emptiness::No;
		}
		match self.inner.source.is_empty() {
			Emptiness::No if !removes.is_empty() => Emptiness::Unknown,
			emptiness => emptiness,
		}
	}

	fn subscribe(&self) -> broadcast::Receiver<DataProviderEvent<K, D>> {
		self.inner.events.subscribe()
	}

	fn key_collections(&self) -> Option<Arc<dyn KeyCollections<K, D>>> {
		self.inner.source.key_collections()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		filter::{AttributeOperator, FilterCriterion},
		models::OperationDetail,
		testing::{ArrayDataProvider, Row, rows},
	};
	use serde_json::json;

	type Provider = BufferingDataProvider<String, Row>;

	fn wrap(source: &ArrayDataProvider) -> Provider {
		wrap_with(source, BufferingOptions::default())
	}

	fn wrap_with(source: &ArrayDataProvider, options: BufferingOptions<String, Row>) -> Provider {
		BufferingDataProvider::new(Arc::new(source.clone()), options)
	}

	fn without_id(id: u64) -> FetchListParameters {
		FetchListParameters::new().with_filter(FilterCriterion::attribute(AttributeOperator::Ne, "id", json!(id)))
	}

	fn key(k: &str) -> String {
		k.to_string()
	}

	async fn collect_keys(provider: &Provider, params: FetchListParameters) -> Vec<String> {
		let mut iterator = provider.fetch_first(params);
		let mut keys = Vec::new();
		loop {
			let page = iterator.next().await.unwrap();
			keys.extend(page.value.keys().cloned());
			if page.done {
				return keys;
			}
		}
	}

	async fn next_mutation(
		events: &mut broadcast::Receiver<DataProviderEvent<String, Row>>,
	) -> MutationDetail<String, Row> {
		loop {
			if let DataProviderEvent::Mutate(detail) = events.recv().await.unwrap() {
				return detail;
			}
		}
	}

	#[tokio::test]
	async fn generated_key_is_found_without_source_call() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);

		let generated = provider.add_item(NewItem::keyless(json!({ "name": "A" })), None).unwrap();
		let contained = provider.contains_keys(FetchByKeysParameters::new([generated.clone()])).await.unwrap();

		assert!(contained.results.contains(&generated));
		assert_eq!(source.contains_keys_calls(), 0);
	}

	#[tokio::test]
	async fn key_lookups_merge_buffer_and_source_in_caller_order() {
		let source = ArrayDataProvider::with_rows(5);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("n1"), json!({ "name": "new" })), None).unwrap();
		provider.update_item(Item::new(key("k2"), json!({ "name": "changed" }))).unwrap();
		provider.remove_item(ItemWithOptionalData::key_only(key("k3"))).unwrap();

		let keys = ["k4", "n1", "k3", "k2", "k0", "zz"].map(String::from);
		let fetched = provider.fetch_by_keys(FetchByKeysParameters::new(keys)).await.unwrap();

		assert_eq!(fetched.results.keys().collect::<Vec<_>>(), vec!["k4", "n1", "k2", "k0"]);
		assert_eq!(fetched.results["k2"].data["name"], "changed");
		assert_eq!(source.fetch_by_keys_calls(), 1);
		assert_eq!(source.last_fetch_by_keys(), vec![key("k4"), key("k0"), key("zz")]);
	}

	#[tokio::test]
	async fn fully_buffered_lookup_skips_source() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap();

		let fetched = provider.fetch_by_keys(FetchByKeysParameters::new([key("k0")])).await.unwrap();

		assert!(fetched.results.is_empty());
		assert_eq!(source.fetch_by_keys_calls(), 0);
	}

	#[tokio::test]
	async fn iteration_overlays_every_edit_kind() {
		let source = ArrayDataProvider::with_rows(5);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k1"))).unwrap();
		provider.update_item(Item::new(key("k2"), json!({ "name": "changed" }))).unwrap();
		provider.add_item(NewItem::with_key(key("n1"), json!({ "name": "top" })), None).unwrap();
		provider.add_item(NewItem::with_key(key("n2"), json!({ "name": "anchored" })), Some(key("k3"))).unwrap();

		let mut iterator = provider.fetch_first(FetchListParameters::new().with_size(10));
		let page = iterator.next().await.unwrap();

		assert_eq!(page.value.keys().collect::<Vec<_>>(), vec!["n1", "k0", "k2", "n2", "k3", "k4"]);
		assert_eq!(page.value.data[2]["name"], "changed");
		assert!(page.done);
	}

	#[tokio::test]
	async fn newest_unanchored_add_comes_first() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("a"), json!({})), None).unwrap();
		provider.add_item(NewItem::with_key(key("b"), json!({})), None).unwrap();

		assert_eq!(collect_keys(&provider, FetchListParameters::new()).await, vec!["b", "a", "k0"]);
	}

	#[tokio::test]
	async fn adds_are_yielded_once_across_pages() {
		let source = ArrayDataProvider::with_rows(4);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("top"), json!({})), None).unwrap();
		provider.add_item(NewItem::with_key(key("mid"), json!({})), Some(key("k3"))).unwrap();
		provider.add_item(NewItem::with_key(key("chained"), json!({})), Some(key("mid"))).unwrap();

		let keys = collect_keys(&provider, FetchListParameters::new().with_size(2)).await;

		assert_eq!(keys, vec!["top", "k0", "k1", "k2", "chained", "mid", "k3"]);
	}

	#[tokio::test]
	async fn add_with_unknown_anchor_goes_to_top() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("n"), json!({})), Some(key("gone"))).unwrap();

		assert_eq!(collect_keys(&provider, FetchListParameters::new()).await, vec!["n", "k0", "k1"]);
		assert_eq!(source.last_fetch_by_keys(), vec![key("gone")]);
	}

	#[tokio::test]
	async fn add_before_removed_row_goes_to_top() {
		let source = ArrayDataProvider::with_rows(4);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k2"))).unwrap();
		provider.add_item(NewItem::with_key(key("n"), json!({})), Some(key("k2"))).unwrap();

		assert_eq!(collect_keys(&provider, FetchListParameters::new()).await, vec!["n", "k0", "k1", "k3"]);
		assert_eq!(source.contains_keys_calls(), 0);
	}

	#[tokio::test]
	async fn add_before_filtered_out_row_goes_to_top() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap_with(&source, BufferingOptions::json());
		provider.add_item(NewItem::with_key(key("n"), json!({})), Some(key("k1"))).unwrap();

		assert_eq!(collect_keys(&provider, without_id(1)).await, vec!["n", "k0", "k2"]);
		assert_eq!(source.last_fetch_by_keys(), vec![key("k1")]);
	}

	#[tokio::test]
	async fn add_before_row_inside_filter_stays_anchored() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap_with(&source, BufferingOptions::json());
		provider.add_item(NewItem::with_key(key("n"), json!({})), Some(key("k2"))).unwrap();

		assert_eq!(collect_keys(&provider, without_id(1)).await, vec!["k0", "n", "k2"]);
	}

	#[tokio::test]
	async fn filtered_add_without_evaluator_goes_to_top() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("n"), json!({})), Some(key("k2"))).unwrap();

		assert_eq!(collect_keys(&provider, without_id(1)).await, vec!["n", "k0", "k2"]);
		assert_eq!(source.fetch_by_keys_calls(), 0);
	}

	#[tokio::test]
	async fn buffered_add_already_in_source_is_not_repeated() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("k1"), json!({ "name": "local" })), None).unwrap();

		let mut iterator = provider.fetch_first(FetchListParameters::new());
		let page = iterator.next().await.unwrap();

		assert_eq!(page.value.keys().collect::<Vec<_>>(), vec!["k1", "k0"]);
		assert_eq!(page.value.data[0]["name"], "local");
	}

	#[tokio::test]
	async fn every_buffer_operation_announces_submittable_items() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		let mut events = provider.subscribe();

		provider.update_item(Item::new(key("k0"), json!({ "name": "x" }))).unwrap();
		let DataProviderEvent::SubmittableChange(items) = events.recv().await.unwrap() else {
			panic!("expected submittable change")
		};
		assert_eq!(items.len(), 1);

		provider.reset_unsubmitted_item(&key("k0")).unwrap();
		provider.reset_unsubmitted_item(&key("k0")).unwrap();
		assert_eq!(events.recv().await.unwrap(), DataProviderEvent::SubmittableChange(Vec::new()));
		assert_eq!(events.recv().await.unwrap(), DataProviderEvent::SubmittableChange(Vec::new()));
	}

	#[tokio::test]
	async fn rejected_edit_is_not_announced() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap();
		let mut events = provider.subscribe();

		let err = provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap_err();

		assert!(matches!(err, BufferError::DuplicateEdit { existing: EditOperation::Remove, .. }));
		assert!(events.try_recv().is_err());
	}

	#[tokio::test]
	async fn failed_submission_restores_edit_with_error() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);
		provider.update_item(Item::new(key("k0"), json!({ "name": "x" }))).unwrap();
		let edit = provider.get_submittable_items().unwrap().remove(0);

		provider.set_item_status(&edit, EditStatus::Submitting, None, None).unwrap();
		assert!(provider.get_submittable_items().unwrap().is_empty());
		let submitting = provider.get_item(&key("k0")).unwrap().unwrap();
		provider
			.set_item_status(&submitting, EditStatus::Unsubmitted, Some(ItemMessage::error("rejected")), None)
			.unwrap();

		let restored = provider.get_item(&key("k0")).unwrap().unwrap();
		assert_eq!(restored.status, EditStatus::Unsubmitted);
		assert_eq!(restored.error, Some(ItemMessage::error("rejected")));
	}

	#[tokio::test]
	async fn removing_local_add_leaves_no_edit() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("k1"), json!({})), None).unwrap();

		provider.remove_item(ItemWithOptionalData::key_only(key("k1"))).unwrap();

		assert_eq!(provider.get_item(&key("k1")).unwrap(), None);
		assert!(provider.get_submittable_items().unwrap().is_empty());
	}

	#[tokio::test]
	async fn submitted_generated_key_resolves_to_real_row() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);
		let generated = provider.add_item(NewItem::keyless(json!({ "name": "A" })), None).unwrap();
		let edit = provider.get_submittable_items().unwrap().remove(0);
		provider.set_item_status(&edit, EditStatus::Submitting, None, None).unwrap();
		let submitting = provider.get_item(&generated).unwrap().unwrap();
		provider.set_item_status(&submitting, EditStatus::Submitted, None, Some(key("real"))).unwrap();
		source.set_rows(rows(&["k0", "real"]));

		let fetched = provider.fetch_by_keys(FetchByKeysParameters::new([generated.clone()])).await.unwrap();

		assert_eq!(provider.resolve_generated_key(&generated).unwrap(), Some(key("real")));
		assert_eq!(fetched.results[&generated].data["name"], "real");
		assert_eq!(fetched.results[&generated].metadata.key, generated);
		assert_eq!(source.last_fetch_by_keys(), vec![key("real")]);
	}

	#[tokio::test]
	async fn source_removal_is_translated_past_hidden_rows() {
		let source = ArrayDataProvider::with_rows(5);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k1"))).unwrap();
		collect_keys(&provider, FetchListParameters::new()).await;
		let mut events = provider.subscribe();

		source.remove_keys(&["k3"]);
		let removed = next_mutation(&mut events).await.remove.unwrap();

		assert_eq!(removed.keys.into_iter().collect::<Vec<_>>(), vec!["k3"]);
		assert_eq!(removed.indexes, Some(vec![2]));
	}

	#[tokio::test]
	async fn source_addition_is_translated_past_inserted_rows() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("n"), json!({})), None).unwrap();
		collect_keys(&provider, FetchListParameters::new()).await;
		let mut events = provider.subscribe();

		source.insert_rows(2, rows(&["x"]));
		let detail = next_mutation(&mut events).await;

		assert_eq!(detail.add.unwrap().indexes, Some(vec![3]));
	}

	#[tokio::test]
	async fn source_updates_respect_buffered_edits() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap();
		provider.update_item(Item::new(key("k1"), json!({ "name": "local" }))).unwrap();
		let mut events = provider.subscribe();

		source.update_rows(vec![
			Item::new(key("k0"), json!({ "name": "remote" })),
			Item::new(key("k1"), json!({ "name": "remote" })),
			Item::new(key("k2"), json!({ "name": "remote" })),
		]);
		let update = next_mutation(&mut events).await.update.unwrap();

		assert_eq!(update.keys.iter().collect::<Vec<_>>(), vec!["k1", "k2"]);
		assert_eq!(update.data.unwrap(), vec![json!({ "name": "local" }), json!({ "name": "remote" })]);
	}

	#[tokio::test]
	async fn fully_hidden_mutation_is_not_forwarded() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap();
		let mut events = provider.subscribe();

		source.emit(DataProviderEvent::Mutate(MutationDetail::removed(OperationDetail::from_keys([key("k0")]))));
		source.refresh();

		assert_eq!(events.recv().await.unwrap(), DataProviderEvent::Refresh);
	}

	#[tokio::test]
	async fn refresh_drops_edits_of_vanished_rows() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k1"))).unwrap();
		provider.update_item(Item::new(key("k2"), json!({ "name": "local" }))).unwrap();
		provider.add_item(NewItem::with_key(key("n"), json!({})), None).unwrap();
		let mut events = provider.subscribe();

		source.set_rows(rows(&["k0", "k1"]));
		source.refresh();

		let DataProviderEvent::SubmittableChange(items) = events.recv().await.unwrap() else {
			panic!("expected submittable change")
		};
		assert_eq!(items.iter().map(|edit| edit.key().as_str()).collect::<Vec<_>>(), vec!["k1", "n"]);
		assert_eq!(events.recv().await.unwrap(), DataProviderEvent::Refresh);
	}

	#[tokio::test]
	async fn refresh_keeps_edits_when_source_lookup_fails() {
		let source = ArrayDataProvider::with_rows(2);
		let provider = wrap(&source);
		provider.update_item(Item::new(key("k0"), json!({}))).unwrap();
		let mut events = provider.subscribe();

		source.fail_next_fetch("offline");
		source.set_rows(Vec::new());
		source.refresh();

		assert_eq!(events.recv().await.unwrap(), DataProviderEvent::Refresh);
		assert_eq!(provider.get_submittable_items().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn size_and_emptiness_account_for_edits() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.remove_item(ItemWithOptionalData::key_only(key("k0"))).unwrap();
		assert_eq!(provider.is_empty(), Emptiness::Unknown);

		provider.add_item(NewItem::with_key(key("a"), json!({})), None).unwrap();
		provider.add_item(NewItem::with_key(key("b"), json!({})), None).unwrap();

		assert_eq!(provider.get_total_size().await.unwrap(), Some(4));
		assert_eq!(provider.is_empty(), Emptiness::No);

		source.report_unknown_size();
		assert_eq!(provider.get_total_size().await.unwrap(), None);
	}

	#[tokio::test]
	async fn size_ignores_edits_that_keep_the_row_count() {
		let source = ArrayDataProvider::with_rows(3);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("k1"), json!({ "name": "local" })), None).unwrap();
		provider.remove_item(ItemWithOptionalData::key_only(key("missing"))).unwrap();

		assert_eq!(provider.get_total_size().await.unwrap(), Some(3));
		assert_eq!(collect_keys(&provider, FetchListParameters::new()).await.len(), 3);
	}

	#[tokio::test]
	async fn fetch_by_offset_reads_merged_view() {
		let source = ArrayDataProvider::with_rows(5);
		let provider = wrap(&source);
		provider.add_item(NewItem::with_key(key("n"), json!({})), None).unwrap();
		provider.remove_item(ItemWithOptionalData::key_only(key("k1"))).unwrap();

		let middle = provider.fetch_by_offset(FetchByOffsetParameters::new(1, 2)).await.unwrap();
		let tail = provider.fetch_by_offset(FetchByOffsetParameters::new(3, 10)).await.unwrap();

		assert_eq!(middle.results.iter().map(|item| item.key().as_str()).collect::<Vec<_>>(), vec!["k0", "k2"]);
		assert!(!middle.done);
		assert_eq!(tail.results.iter().map(|item| item.key().as_str()).collect::<Vec<_>>(), vec!["k3", "k4"]);
		assert!(tail.done);
		assert_eq!(source.fetch_by_offset_calls(), 0);
	}

	#[tokio::test]
	async fn capabilities_pass_through() {
		let source = ArrayDataProvider::with_rows(1);
		let provider = wrap(&source);

		assert_eq!(
			provider.get_capability(CapabilityName::FetchByOffset),
			source.get_capability(CapabilityName::FetchByOffset)
		);
	}
}
