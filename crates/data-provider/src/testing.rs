// SPDX-License-Identifier: GPL-3.0

//! In-memory provider for exercising the wrappers in tests.
//!
//! [`ArrayDataProvider`] keeps JSON rows in a vector, evaluates filters and sort
//! criteria itself, counts every call it receives and publishes mutation events when
//! its rows are changed through the helper methods.

use crate::{
	error::ProviderError,
	events::EventBus,
	filter::{AttributeOperator, SortCriterion},
	models::{
		ContainsKeysResults, DataProviderEvent, Emptiness, FetchByKeysParameters, FetchByKeysResults,
		FetchByOffsetParameters, FetchByOffsetResults, FetchListParameters, FetchListResult, Item,
		IterationResult, MutationDetail, OperationDetail,
	},
	provider::{
		BoxedIterator, CachingPolicy, Capability, CapabilityName, DataProvider, FetchListIterator, KeyLookup,
		OffsetAccess,
	},
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::{
	io,
	sync::{
		Arc, Mutex, MutexGuard, PoisonError,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
};
use tokio::sync::{Semaphore, broadcast};

/// Row payload of an [`ArrayDataProvider`].
pub type Row = Value;

/// Rows keyed `k0`, `k1`, ... with an `id` and a `name`.
pub fn numbered_rows(count: usize) -> Vec<Item<String, Row>> {
	(0..count)
		.map(|i| Item::new(format!("k{i}"), json!({ "id": i, "name": format!("Row {i}") })))
		.collect()
}

/// One row per key, named after its key.
pub fn rows(keys: &[&str]) -> Vec<Item<String, Row>> {
	keys.iter().map(|key| Item::new(key.to_string(), json!({ "name": key }))).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct CallCounters {
	fetch_first: AtomicUsize,
	next: AtomicUsize,
	fetch_by_keys: AtomicUsize,
	contains_keys: AtomicUsize,
	fetch_by_offset: AtomicUsize,
}

struct ArrayState {
	rows: Mutex<Vec<Item<String, Row>>>,
	events: EventBus<DataProviderEvent<String, Row>>,
	calls: CallCounters,
	gate: Mutex<Option<Arc<Semaphore>>>,
	failure: Mutex<Option<String>>,
	last_fetch_by_keys: Mutex<Vec<String>>,
	size_unknown: AtomicBool,
}

impl ArrayState {
	/// Rows matching `params`, in the requested order.
	fn view(&self, params: &FetchListParameters) -> Vec<Item<String, Row>> {
		let mut view: Vec<_> = lock(&self.rows)
			.iter()
			.filter(|item| params.filter_criterion.as_ref().is_none_or(|filter| filter.matches(&item.data)))
			.cloned()
			.collect();
		if !params.sort_criteria.is_empty() {
			view.sort_by(|a, b| SortCriterion::compare_all(&params.sort_criteria, &a.data, &b.data));
		}
		view
	}

	fn take_failure(&self) -> Result<(), ProviderError> {
		match lock(&self.failure).take() {
			Some(message) => Err(ProviderError::upstream(io::Error::other(message))),
			None => Ok(()),
		}
	}

	fn find(&self, keys: &[String]) -> Vec<Item<String, Row>> {
		let rows = lock(&self.rows);
		keys.iter().filter_map(|key| rows.iter().find(|item| &item.metadata.key == key).cloned()).collect()
	}
}

fn project(data: &Value, attributes: &Option<Vec<String>>) -> Value {
	match (attributes, data) {
		(Some(attributes), Value::Object(fields)) => Value::Object(
			fields
				.iter()
				.filter(|(name, _)| attributes.contains(name))
				.map(|(name, value)| (name.clone(), value.clone()))
				.collect::<Map<_, _>>(),
		),
		_ => data.clone(),
	}
}

/// Vector-backed provider with call counters and controllable fetches.
#[derive(Clone)]
pub struct ArrayDataProvider {
	state: Arc<ArrayState>,
}

impl ArrayDataProvider {
	/// Provider over `rows`.
	pub fn new(rows: Vec<Item<String, Row>>) -> Self {
		Self {
			state: Arc::new(ArrayState {
				rows: Mutex::new(rows),
				events: EventBus::default(),
				calls: CallCounters::default(),
				gate: Mutex::new(None),
				failure: Mutex::new(None),
				last_fetch_by_keys: Mutex::new(Vec::new()),
				size_unknown: AtomicBool::new(false),
			}),
		}
	}

	/// Provider over [`numbered_rows`].
	pub fn with_rows(count: usize) -> Self {
		Self::new(numbered_rows(count))
	}

	/// Make every later `next()` wait for a permit of the returned semaphore.
	pub fn hold_fetches(&self) -> Arc<Semaphore> {
		let gate = Arc::new(Semaphore::new(0));
		*lock(&self.state.gate) = Some(gate.clone());
		gate
	}

	/// Fail the next `next()` or key lookup with an upstream error.
	pub fn fail_next_fetch(&self, message: &str) {
		*lock(&self.state.failure) = Some(message.to_string());
	}

	/// Report the total size as unknown from now on.
	pub fn report_unknown_size(&self) {
		self.state.size_unknown.store(true, Ordering::SeqCst);
	}

	/// Current rows.
	pub fn rows(&self) -> Vec<Item<String, Row>> {
		lock(&self.state.rows).clone()
	}

	/// Replace every row without publishing an event.
	pub fn set_rows(&self, rows: Vec<Item<String, Row>>) {
		*lock(&self.state.rows) = rows;
	}

	/// Insert `items` at `index` and publish the addition.
	pub fn insert_rows(&self, index: usize, items: Vec<Item<String, Row>>) {
		let index = {
			let mut rows = lock(&self.state.rows);
			let index = index.min(rows.len());
			for (offset, item) in items.iter().enumerate() {
				rows.insert(index + offset, item.clone());
			}
			index
		};
		let indexes = (index..index + items.len()).collect();
		self.emit(DataProviderEvent::Mutate(MutationDetail::added(
			OperationDetail::from_items(items).with_indexes(indexes),
		)));
	}

	/// Append `items` and publish the addition.
	pub fn push_rows(&self, items: Vec<Item<String, Row>>) {
		let len = lock(&self.state.rows).len();
		self.insert_rows(len, items);
	}

	/// Remove the rows with `keys` and publish the removal with their former indexes.
	pub fn remove_keys(&self, keys: &[&str]) {
		let removed = {
			let mut rows = lock(&self.state.rows);
			let removed: Vec<(usize, Item<String, Row>)> = rows
				.iter()
				.enumerate()
				.filter(|(_, item)| keys.contains(&item.metadata.key.as_str()))
				.map(|(index, item)| (index, item.clone()))
				.collect();
			rows.retain(|item| !keys.contains(&item.metadata.key.as_str()));
			removed
		};
		let (indexes, items): (Vec<_>, Vec<_>) = removed.into_iter().unzip();
		self.emit(DataProviderEvent::Mutate(MutationDetail::removed(
			OperationDetail::from_items(items).with_indexes(indexes),
		)));
	}

	/// Replace the data of existing rows and publish the update.
	pub fn update_rows(&self, items: Vec<Item<String, Row>>) {
		let mut indexes = Vec::new();
		{
			let mut rows = lock(&self.state.rows);
			for item in &items {
				if let Some(index) = rows.iter().position(|row| row.metadata.key == item.metadata.key) {
					rows[index].data = item.data.clone();
					indexes.push(index);
				}
			}
		}
		self.emit(DataProviderEvent::Mutate(MutationDetail::updated(
			OperationDetail::from_items(items).with_indexes(indexes),
		)));
	}

	/// Publish a refresh.
	pub fn refresh(&self) {
		self.emit(DataProviderEvent::Refresh);
	}

	/// Publish an arbitrary event.
	pub fn emit(&self, event: DataProviderEvent<String, Row>) {
		self.state.events.publish(event);
	}

	pub fn fetch_first_calls(&self) -> usize {
		self.state.calls.fetch_first.load(Ordering::SeqCst)
	}

	pub fn next_calls(&self) -> usize {
		self.state.calls.next.load(Ordering::SeqCst)
	}

	pub fn fetch_by_keys_calls(&self) -> usize {
		self.state.calls.fetch_by_keys.load(Ordering::SeqCst)
	}

	pub fn contains_keys_calls(&self) -> usize {
		self.state.calls.contains_keys.load(Ordering::SeqCst)
	}

	pub fn fetch_by_offset_calls(&self) -> usize {
		self.state.calls.fetch_by_offset.load(Ordering::SeqCst)
	}

	/// Keys of the last `fetch_by_keys` or `contains_keys` call.
	pub fn last_fetch_by_keys(&self) -> Vec<String> {
		lock(&self.state.last_fetch_by_keys).clone()
	}

	fn record_keys(&self, params: &FetchByKeysParameters<String>) -> Vec<String> {
		let keys: Vec<String> = params.keys.iter().cloned().collect();
		*lock(&self.state.last_fetch_by_keys) = keys.clone();
		keys
	}
}

/// Iterator over a live [`ArrayDataProvider`].
///
/// Resumes after the last row it returned, so rows removed or inserted before that row
/// do not make it skip or repeat rows.
struct ArrayIterator {
	state: Arc<ArrayState>,
	params: FetchListParameters,
	resume_after: Option<String>,
	returned: usize,
	done: bool,
}

#[async_trait]
impl FetchListIterator<String, Row> for ArrayIterator {
	async fn next(&mut self) -> Result<IterationResult<String, Row>, ProviderError> {
		self.state.calls.next.fetch_add(1, Ordering::SeqCst);
		if self.params.is_aborted() {
			return Err(ProviderError::Aborted);
		}
		let gate = lock(&self.state.gate).clone();
		if let Some(gate) = gate {
			gate.acquire().await.map_err(ProviderError::upstream)?.forget();
		}
		self.state.take_failure()?;
		if self.done {
			return Ok(IterationResult::finished(self.params.clone()));
		}
		let view = self.state.view(&self.params);
		let start = match &self.resume_after {
			Some(last) => view
				.iter()
				.position(|item| &item.metadata.key == last)
				.map_or(self.returned.min(view.len()), |index| index + 1),
			None => 0,
		};
		let page: Vec<_> = view.iter().skip(start).take(self.params.fetch_size()).collect();
		self.returned = start + page.len();
		if let Some(last) = page.last() {
			self.resume_after = Some(last.metadata.key.clone());
		}
		self.done = self.returned >= view.len();
		let value = FetchListResult {
			fetch_parameters: self.params.clone(),
			data: page.iter().map(|item| project(&item.data, &self.params.attributes)).collect(),
			metadata: page.iter().map(|item| item.metadata.clone()).collect(),
			total_filtered_row_count: self.params.include_filtered_row_count.then_some(view.len()),
		};
		Ok(IterationResult { value, done: self.done })
	}
}

#[async_trait]
impl DataProvider<String, Row> for ArrayDataProvider {
	fn fetch_first(&self, params: FetchListParameters) -> BoxedIterator<String, Row> {
		self.state.calls.fetch_first.fetch_add(1, Ordering::SeqCst);
		Box::new(ArrayIterator { state: self.state.clone(), params, resume_after: None, returned: 0, done: false })
	}

	async fn fetch_by_keys(
		&self,
		params: FetchByKeysParameters<String>,
	) -> Result<FetchByKeysResults<String, Row>, ProviderError> {
		self.state.calls.fetch_by_keys.fetch_add(1, Ordering::SeqCst);
		if params.is_aborted() {
			return Err(ProviderError::Aborted);
		}
		self.state.take_failure()?;
		let keys = self.record_keys(&params);
		let results = self
			.state
			.find(&keys)
			.into_iter()
			.map(|item| {
				let data = project(&item.data, &params.attributes);
				(item.metadata.key.clone(), Item { metadata: item.metadata, data })
			})
			.collect();
		Ok(FetchByKeysResults { fetch_parameters: params, results })
	}

	async fn fetch_by_offset(
		&self,
		params: FetchByOffsetParameters,
	) -> Result<FetchByOffsetResults<String, Row>, ProviderError> {
		self.state.calls.fetch_by_offset.fetch_add(1, Ordering::SeqCst);
		if params.is_aborted() {
			return Err(ProviderError::Aborted);
		}
		let view = self.state.view(&params.to_list_parameters());
		let results: Vec<_> = view
			.iter()
			.skip(params.offset)
			.take(params.fetch_size())
			.map(|item| Item { metadata: item.metadata.clone(), data: project(&item.data, &params.attributes) })
			.collect();
		let done = params.offset + results.len() >= view.len();
		Ok(FetchByOffsetResults { fetch_parameters: params, results, done })
	}

	async fn contains_keys(
		&self,
		params: FetchByKeysParameters<String>,
	) -> Result<ContainsKeysResults<String>, ProviderError> {
		self.state.calls.contains_keys.fetch_add(1, Ordering::SeqCst);
		if params.is_aborted() {
			return Err(ProviderError::Aborted);
		}
		self.state.take_failure()?;
		let keys = self.record_keys(&params);
		let results = self.state.find(&keys).into_iter().map(|item| item.metadata.key).collect();
		Ok(ContainsKeysResults { contains_parameters: params, results })
	}

	fn get_capability(&self, name: CapabilityName) -> Option<Capability> {
		Some(match name {
			CapabilityName::FetchByKeys =>
				Capability::FetchByKeys { implementation: KeyLookup::Lookup, multi_key_lookup: true },
			CapabilityName::FetchByOffset => Capability::FetchByOffset { implementation: OffsetAccess::RandomAccess },
			CapabilityName::FetchFirst => Capability::FetchFirst {
				caching: CachingPolicy::None,
				attribute_filter: true,
				total_filtered_row_count: true,
			},
			CapabilityName::Filter => Capability::Filter {
				operators: vec![
					AttributeOperator::Eq,
					AttributeOperator::Ne,
					AttributeOperator::Lt,
					AttributeOperator::Le,
					AttributeOperator::Gt,
					AttributeOperator::Ge,
					AttributeOperator::Contains,
					AttributeOperator::StartsWith,
					AttributeOperator::EndsWith,
					AttributeOperator::Present,
				],
				text_filter: true,
			},
			CapabilityName::Sort => Capability::Sort { multiple_attributes: true },
		})
	}

	async fn get_total_size(&self) -> Result<Option<usize>, ProviderError> {
		if self.state.size_unknown.load(Ordering::SeqCst) {
			return Ok(None);
		}
		Ok(Some(lock(&self.state.rows).len()))
	}

	fn is_empty(&self) -> Emptiness {
		if self.state.size_unknown.load(Ordering::SeqCst) {
			return Emptiness::Unknown;
		}
		if lock(&self.state.rows).is_empty() { Emptiness::Yes } else { Emptiness::No }
	}

	fn subscribe(&self) -> broadcast::Receiver<DataProviderEvent<String, Row>> {
		self.state.events.subscribe()
	}
}
