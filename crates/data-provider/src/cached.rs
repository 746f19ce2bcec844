// SPDX-License-Identifier: GPL-3.0

//! Iterator-sharing result cache.
//!
//! This module provides the [`CachedIteratorResultsDataProvider`], which lets any number
//! of consumers iterate the same query while the wrapped source is iterated only once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               CachedIteratorResultsDataProvider                 │
//! │                                                                 │
//! │   consumer.next() ──► Row cached? ─── Yes ──► Serve from cache  │
//! │                           │                                     │
//! │                           No                                    │
//! │                           │                                     │
//! │                           ▼                                     │
//! │                  Fetch in flight? ─── Yes ──► Await it          │
//! │                           │                       │             │
//! │                           No                      │             │
//! │                           │                       │             │
//! │                           ▼                       │             │
//! │               One upstream next() ──► Append ─────┘             │
//! │                                          │                      │
//! │                                          ▼                      │
//! │                                   Serve from cache              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `fetch_first` with the same [`FetchSignature`] returns a new consumer over the
//! same cache. A different signature, or a `refresh` from the source, retires the
//! cache, the upstream iterator and every consumer created before it.

use crate::{
	cache::ResultCache,
	config::{CachedResultsOptions, FilteredRowCount},
	error::ProviderError,
	events::{EventBus, SourceEventHandler, spawn_source_listener},
	filter::{FilterCriterion, SortCriterion},
	models::{
		ContainsKeysResults, DataProviderEvent, Emptiness, FetchByKeysParameters, FetchByKeysResults,
		FetchByOffsetParameters, FetchByOffsetResults, FetchListParameters, FetchListResult, Item,
		IterationResult, MutationDetail, ProviderData, ProviderKey,
	},
	provider::{
		BoxedIterator, CachingPolicy, Capability, CapabilityName, DataProvider, FetchListIterator,
		KeyCollections, SharedProvider,
	},
	strings::log_targets::CACHED,
};
use async_trait::async_trait;
use futures::{
	FutureExt,
	future::{BoxFuture, Shared},
};
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace, warn};
use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

/// The parts of a fetch that decide whether two fetches ask the same question.
#[derive(Clone, Debug)]
pub struct FetchSignature {
	attributes: Option<Vec<String>>,
	filter_criterion: Option<FilterCriterion>,
	sort_criteria: Vec<SortCriterion>,
	size: Option<usize>,
	signal: Option<CancellationToken>,
}

impl FetchSignature {
	/// Signature of an iteration request.
	pub fn new(params: &FetchListParameters) -> Self {
		Self {
			attributes: params.attributes.clone(),
			filter_criterion: params.filter_criterion.clone(),
			sort_criteria: params.sort_criteria.clone(),
			size: params.size,
			signal: params.signal.clone(),
		}
	}

	/// Returns `true` if `other` can reuse the results fetched for `self`.
	///
	/// Criteria are compared structurally. A request carrying a live signal never
	/// matches a signature whose signal has since been aborted.
	pub fn is_same_query(&self, other: &Self) -> bool {
		self.attributes == other.attributes &&
			self.filter_criterion == other.filter_criterion &&
			self.sort_criteria == other.sort_criteria &&
			self.size == other.size &&
			!(self.is_aborted() && !other.is_aborted())
	}

	fn is_aborted(&self) -> bool {
		self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
	}

	/// Returns `true` if rows cached under this signature carry every attribute `requested`
	/// asks for.
	fn covers_attributes(&self, requested: &Option<Vec<String>>) -> bool {
		self.attributes.is_none() || &self.attributes == requested
	}
}

/// Result of awaiting a shared upstream fetch.
#[derive(Clone, Debug)]
pub enum FetchOutcome<K, D> {
	/// The page was appended to the active cache.
	Fresh(IterationResult<K, D>),
	/// The page belongs to an iterator retired while the fetch was in flight.
	Stale(IterationResult<K, D>),
	/// The caller's signal fired first.
	Aborted,
}

type SharedFetch<K, D> = Shared<BoxFuture<'static, Result<FetchOutcome<K, D>, ProviderError>>>;

/// Read position of one consumer.
#[derive(Clone, Copy, Debug, Default)]
struct ClientIteratorState {
	offset: usize,
}

/// The upstream iterator shared by every consumer of the active signature.
struct SharedIteratorState<K: ProviderKey, D: ProviderData> {
	iterator: Arc<tokio::sync::Mutex<BoxedIterator<K, D>>>,
	/// Upstream fetch in flight, if any.
	fetch: Option<SharedFetch<K, D>>,
	/// Rows pulled from the upstream iterator so far.
	fetch_offset: usize,
}

struct CacheState<K: ProviderKey, D: ProviderData> {
	cache: ResultCache<K, D>,
	signature: Option<FetchSignature>,
	shared: Option<SharedIteratorState<K, D>>,
	/// Bumped whenever the shared iterator is replaced or discarded.
	generation: u64,
	clients: HashMap<u64, ClientIteratorState>,
	next_client_id: u64,
}

impl<K: ProviderKey, D: ProviderData> CacheState<K, D> {
	fn retire(&mut self) {
		self.cache.reset();
		self.signature = None;
		self.shared = None;
		self.clients.clear();
		self.generation += 1;
	}

	/// The active signature, if its iteration is still live.
	fn active_signature(&self) -> Option<&FetchSignature> {
		self.shared.as_ref().and(self.signature.as_ref())
	}
}

enum CacheRead<K: ProviderKey, D: ProviderData> {
	Hit(IterationResult<K, D>),
	Pending(SharedFetch<K, D>),
	Retired,
}

struct CachedInner<K: ProviderKey, D: ProviderData> {
	source: SharedProvider<K, D>,
	options: CachedResultsOptions,
	state: Mutex<CacheState<K, D>>,
	events: EventBus<DataProviderEvent<K, D>>,
}

/// Data provider that shares one upstream iteration between many consumers.
///
/// # Cancellation
///
/// A call whose signal is already aborted bypasses the cache and is delegated to the
/// source as is. A signal aborted while a consumer waits for a shared fetch only ends
/// that consumer's wait: the fetch itself keeps running for everyone else.
///
/// # Runtime
///
/// Must be created inside a Tokio runtime: construction spawns the task that follows the
/// source's events.
pub struct CachedIteratorResultsDataProvider<K: ProviderKey, D: ProviderData> {
	inner: Arc<CachedInner<K, D>>,
	_listener: DropGuard,
}

impl<K: ProviderKey, D: ProviderData> CachedIteratorResultsDataProvider<K, D> {
	/// Wrap `source`.
	pub fn new(source: SharedProvider<K, D>, options: CachedResultsOptions) -> Self {
		let receiver = source.subscribe();
		let inner = Arc::new(CachedInner {
			source,
			events: EventBus::new(options.event_capacity),
			options,
			state: Mutex::new(CacheState {
				cache: ResultCache::new(),
				signature: None,
				shared: None,
				generation: 0,
				clients: HashMap::new(),
				next_client_id: 0,
			}),
		});
		let shutdown = CancellationToken::new();
		spawn_source_listener(receiver, Arc::downgrade(&inner), shutdown.clone(), CACHED);
		Self { inner, _listener: shutdown.drop_guard() }
	}

	/// Start a consumer, returning the concrete iterator type.
	pub fn fetch_first_cached(&self, params: FetchListParameters) -> CachedIterator<K, D> {
		let params = self.inner.with_row_count_option(params);
		if params.is_aborted() {
			debug!(target: CACHED, "Signal already aborted, delegating iteration to the source");
			let upstream = self.inner.source.fetch_first(params.clone());
			return CachedIterator { inner: self.inner.clone(), params, mode: IteratorMode::Bypass(upstream) };
		}
		let mode = match self.inner.register_client(&params) {
			Ok((client_id, generation)) => IteratorMode::Shared { client_id, generation },
			Err(err) => IteratorMode::Failed(Some(err)),
		};
		CachedIterator { inner: self.inner.clone(), params, mode }
	}

	/// Number of rows currently cached.
	pub fn cached_row_count(&self) -> Result<usize, ProviderError> {
		Ok(self.inner.lock_state()?.cache.len())
	}

	/// Rows pulled from the active upstream iterator so far.
	pub fn upstream_rows_fetched(&self) -> Result<usize, ProviderError> {
		Ok(self.inner.lock_state()?.shared.as_ref().map_or(0, |shared| shared.fetch_offset))
	}

	/// Returns `true` once the active upstream iteration is fully cached.
	pub fn is_fully_cached(&self) -> Result<bool, ProviderError> {
		let state = self.inner.lock_state()?;
		Ok(state.shared.is_some() && state.cache.is_done())
	}
}

impl<K: ProviderKey, D: ProviderData> CachedInner<K, D> {
	fn lock_state(&self) -> Result<MutexGuard<'_, CacheState<K, D>>, ProviderError> {
		self.state.lock().map_err(|err| ProviderError::Lock(err.to_string()))
	}

	fn with_row_count_option(&self, mut params: FetchListParameters) -> FetchListParameters {
		params.include_filtered_row_count = self.options.include_filtered_row_count == FilteredRowCount::Enabled;
		params
	}

	fn row_count(&self, count: Option<usize>) -> Option<usize> {
		match self.options.include_filtered_row_count {
			FilteredRowCount::Enabled => count,
			FilteredRowCount::Disabled => None,
		}
	}

	/// Attach a new consumer, replacing the shared iterator if the signature changed.
	fn register_client(&self, params: &FetchListParameters) -> Result<(u64, u64), ProviderError> {
		let mut guard = self.lock_state()?;
		let state = &mut *guard;
		let signature = FetchSignature::new(params);
		let reusable = state.active_signature().is_some_and(|current| current.is_same_query(&signature));
		if !reusable {
			state.retire();
			// The shared iteration outlives any single consumer's signal.
			let upstream = self.source.fetch_first(FetchListParameters { signal: None, ..params.clone() });
			state.shared = Some(SharedIteratorState {
				iterator: Arc::new(tokio::sync::Mutex::new(upstream)),
				fetch: None,
				fetch_offset: 0,
			});
			debug!(target: CACHED, "Started shared iteration (generation {})", state.generation);
		}
		state.signature = Some(signature);
		let client_id = state.next_client_id;
		state.next_client_id += 1;
		state.clients.insert(client_id, ClientIteratorState::default());
		Ok((client_id, state.generation))
	}

	/// Serve a consumer from the cache, or hand back the fetch it must wait for.
	fn read(
		self: &Arc<Self>,
		client_id: u64,
		generation: u64,
		params: &FetchListParameters,
	) -> Result<CacheRead<K, D>, ProviderError> {
		let mut guard = self.lock_state()?;
		let state = &mut *guard;
		if state.generation != generation {
			return Ok(CacheRead::Retired);
		}
		let Some(client) = state.clients.get_mut(&client_id) else {
			return Ok(CacheRead::Retired);
		};
		let len = state.cache.len();
		if client.offset < len || state.cache.is_done() {
			let (data, metadata) = state.cache.slice(client.offset, params.fetch_size());
			client.offset += data.len();
			trace!(target: CACHED, "Consumer {client_id} served {} cached rows", data.len());
			let value = FetchListResult {
				fetch_parameters: params.clone(),
				data,
				metadata,
				total_filtered_row_count: self.row_count(state.cache.total_filtered_row_count()),
			};
			return Ok(CacheRead::Hit(IterationResult { value, done: state.cache.is_done() && client.offset == len }));
		}
		let Some(shared) = state.shared.as_mut() else {
			return Ok(CacheRead::Retired);
		};
		if let Some(fetch) = &shared.fetch {
			trace!(target: CACHED, "Consumer {client_id} joined the fetch in flight");
			return Ok(CacheRead::Pending(fetch.clone()));
		}
		let fetch = self.start_fetch(generation, shared.iterator.clone());
		shared.fetch = Some(fetch.clone());
		Ok(CacheRead::Pending(fetch))
	}

	/// Issue the single upstream `next()` for the active generation.
	///
	/// The call runs on its own task so it completes even if every waiting consumer gives
	/// up on it.
	fn start_fetch(
		self: &Arc<Self>,
		generation: u64,
		iterator: Arc<tokio::sync::Mutex<BoxedIterator<K, D>>>,
	) -> SharedFetch<K, D> {
		debug!(target: CACHED, "Fetching next upstream page (generation {generation})");
		let inner = self.clone();
		let handle = tokio::spawn(async move {
			let result = iterator.lock().await.next().await;
			inner.complete_fetch(generation, result)
		});
		async move { handle.await.map_err(|err| ProviderError::Task(err.to_string()))? }
			.boxed()
			.shared()
	}

	/// Apply an upstream page to the cache, unless its iterator was retired meanwhile.
	fn complete_fetch(
		&self,
		generation: u64,
		result: Result<IterationResult<K, D>, ProviderError>,
	) -> Result<FetchOutcome<K, D>, ProviderError> {
		let mut guard = self.lock_state()?;
		let state = &mut *guard;
		if state.generation != generation {
			debug!(target: CACHED, "Discarding page of retired generation {generation}");
			return result.map(FetchOutcome::Stale);
		}
		let Some(shared) = state.shared.as_mut() else {
			return result.map(FetchOutcome::Stale);
		};
		shared.fetch = None;
		let page = result?;
		shared.fetch_offset += page.value.len();
		state.cache.append(page.value.data.clone(), page.value.metadata.clone());
		state.cache.set_total_filtered_row_count(page.value.total_filtered_row_count);
		if page.done {
			state.cache.set_done(true);
		}
		debug!(
			target: CACHED,
			"Cached {} upstream rows ({} total, done: {})",
			page.value.len(),
			state.cache.len(),
			page.done
		);
		Ok(FetchOutcome::Fresh(page))
	}

	fn forget_client(&self, client_id: u64) {
		if let Ok(mut state) = self.state.lock() {
			state.clients.remove(&client_id);
		}
	}

	fn client_offset(&self, client_id: u64, generation: u64) -> Option<usize> {
		let state = self.state.lock().ok()?;
		if state.generation != generation {
			return None;
		}
		state.clients.get(&client_id).map(|client| client.offset)
	}

	/// Split `keys` into rows found in the cache and keys the source must resolve.
	fn lookup_cached(
		&self,
		keys: &IndexSet<K>,
		attributes: &Option<Vec<String>>,
	) -> Result<(IndexMap<K, Item<K, D>>, Vec<K>), ProviderError> {
		let state = self.lock_state()?;
		let usable = state.active_signature().is_some_and(|signature| signature.covers_attributes(attributes));
		let mut found = IndexMap::new();
		let mut missing = Vec::new();
		for key in keys {
			match state.cache.get(key).filter(|_| usable) {
				Some(item) => {
					found.insert(key.clone(), item);
				},
				None => missing.push(key.clone()),
			}
		}
		Ok((found, missing))
	}

	fn offset_from_cache(
		&self,
		params: &FetchByOffsetParameters,
	) -> Result<Option<FetchByOffsetResults<K, D>>, ProviderError> {
		let state = self.lock_state()?;
		let Some(signature) = state.active_signature() else {
			return Ok(None);
		};
		let same_view = signature.sort_criteria == params.sort_criteria &&
			signature.filter_criterion == params.filter_criterion &&
			signature.covers_attributes(&params.attributes);
		let end = params.offset.saturating_add(params.fetch_size());
		if !same_view || (end > state.cache.len() && !state.cache.is_done()) {
			return Ok(None);
		}
		let results = state.cache.items(params.offset, params.fetch_size());
		let done = state.cache.is_done() && params.offset + results.len() >= state.cache.len();
		Ok(Some(FetchByOffsetResults { fetch_parameters: params.clone(), results, done }))
	}
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> SourceEventHandler<K, D> for CachedInner<K, D> {
	async fn on_mutate(&self, detail: MutationDetail<K, D>) {
		match self.lock_state() {
			Ok(mut guard) => {
				let state = &mut *guard;
				if state.shared.is_some() {
					let changes = state.cache.process_mutations(&detail);
					for change in &changes {
						for client in state.clients.values_mut() {
							client.offset = change.shift_cursor(client.offset);
						}
					}
					debug!(target: CACHED, "Applied {} position changes from source mutation", changes.len());
				}
			},
			Err(err) => warn!(target: CACHED, "Unable to apply source mutation: {err}"),
		}
		self.events.publish(DataProviderEvent::Mutate(detail));
	}

	async fn on_refresh(&self) {
		match self.lock_state() {
			Ok(mut state) => state.retire(),
			Err(err) => warn!(target: CACHED, "Unable to discard cache on refresh: {err}"),
		}
		debug!(target: CACHED, "Source refreshed, cache discarded");
		self.events.publish(DataProviderEvent::Refresh);
	}

	async fn on_other(&self, event: DataProviderEvent<K, D>) {
		self.events.publish(event);
	}
}

enum IteratorMode<K: ProviderKey, D: ProviderData> {
	/// Reads the shared cache.
	Shared { client_id: u64, generation: u64 },
	/// Delegates to an uncached source iterator.
	Bypass(BoxedIterator<K, D>),
	/// Could not be registered; reports the error once.
	Failed(Option<ProviderError>),
}

/// One consumer of a [`CachedIteratorResultsDataProvider`].
pub struct CachedIterator<K: ProviderKey, D: ProviderData> {
	inner: Arc<CachedInner<K, D>>,
	params: FetchListParameters,
	mode: IteratorMode<K, D>,
}

impl<K: ProviderKey, D: ProviderData> CachedIterator<K, D> {
	/// Index of the next cached row this consumer will read.
	///
	/// `None` for consumers that bypass the cache or were retired.
	pub fn offset(&self) -> Option<usize> {
		match self.mode {
			IteratorMode::Shared { client_id, generation } => self.inner.client_offset(client_id, generation),
			_ => None,
		}
	}

	/// Stale pages with rows are passed through as not done; empty ones end the iteration.
	fn stale_result(&self, result: IterationResult<K, D>) -> IterationResult<K, D> {
		if result.value.is_empty() {
			return IterationResult::finished(self.params.clone());
		}
		let mut value = result.value;
		value.total_filtered_row_count = self.inner.row_count(value.total_filtered_row_count);
		IterationResult { value, done: false }
	}
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> FetchListIterator<K, D> for CachedIterator<K, D> {
	async fn next(&mut self) -> Result<IterationResult<K, D>, ProviderError> {
		let (client_id, generation) = match &mut self.mode {
			IteratorMode::Shared { client_id, generation } => (*client_id, *generation),
			IteratorMode::Bypass(upstream) => return upstream.next().await,
			IteratorMode::Failed(err) => {
				return match err.take() {
					Some(err) => Err(err),
					None => Ok(IterationResult::finished(self.params.clone())),
				};
			},
		};
		if self.params.is_aborted() {
			debug!(target: CACHED, "Signal aborted, delegating page to the source");
			return self.inner.source.fetch_first(self.params.clone()).next().await;
		}
		loop {
			let pending = match self.inner.read(client_id, generation, &self.params)? {
				CacheRead::Hit(result) => return Ok(result),
				CacheRead::Retired => return Ok(IterationResult::finished(self.params.clone())),
				CacheRead::Pending(fetch) => fetch,
			};
			let outcome = match self.params.signal.clone() {
				Some(signal) => tokio::select! {
					biased;

					_ = signal.cancelled() => FetchOutcome::Aborted,

					outcome = pending => outcome?,
				},
				None => pending.await?,
			};
			match outcome {
				FetchOutcome::Fresh(_) => continue,
				FetchOutcome::Stale(result) => return Ok(self.stale_result(result)),
				FetchOutcome::Aborted => return Err(ProviderError::Aborted),
			}
		}
	}
}

impl<K: ProviderKey, D: ProviderData> Drop for CachedIterator<K, D> {
	fn drop(&mut self) {
		if let IteratorMode::Shared { client_id, .. } = self.mode {
			self.inner.forget_client(client_id);
		}
	}
}

#[async_trait]
impl<K: ProviderKey, D: ProviderData> DataProvider<K, D> for CachedIteratorResultsDataProvider<K, D> {
	fn fetch_first(&self, params: FetchListParameters) -> BoxedIterator<K, D> {
		Box::new(self.fetch_first_cached(params))
	}

	async fn fetch_by_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<FetchByKeysResults<K, D>, ProviderError> {
		if params.is_aborted() {
			return self.inner.source.fetch_by_keys(params).await;
		}
		let (mut found, missing) = self.inner.lookup_cached(&params.keys, &params.attributes)?;
		debug!(target: CACHED, "fetch_by_keys: {} cached, {} delegated", found.len(), missing.len());
		if !missing.is_empty() {
			let fetched = self.inner.source.fetch_by_keys(params.with_keys(missing)).await?;
			found.extend(fetched.results);
		}
		let results = params
			.keys
			.iter()
			.filter_map(|key| found.swap_remove(key).map(|item| (key.clone(), item)))
			.collect();
		Ok(FetchByKeysResults { fetch_parameters: params, results })
	}

	async fn fetch_by_offset(
		&self,
		params: FetchByOffsetParameters,
	) -> Result<FetchByOffsetResults<K, D>, ProviderError> {
		if !params.is_aborted() &&
			let Some(results) = self.inner.offset_from_cache(&params)?
		{
			return Ok(results);
		}
		self.inner.source.fetch_by_offset(params).await
	}

	async fn contains_keys(
		&self,
		params: FetchByKeysParameters<K>,
	) -> Result<ContainsKeysResults<K>, ProviderError> {
		if params.is_aborted() {
			return self.inner.source.contains_keys(params).await;
		}
		let (found, missing) = self.inner.lookup_cached(&params.keys, &None)?;
		let mut contained: IndexSet<K> = found.into_keys().collect();
		if !missing.is_empty() {
			contained.extend(self.inner.source.contains_keys(params.with_keys(missing)).await?.results);
		}
		let results = params.keys.iter().filter(|key| contained.contains(*key)).cloned().collect();
		Ok(ContainsKeysResults { contains_parameters: params, results })
	}

	fn get_capability(&self, name: CapabilityName) -> Option<Capability> {
		match name {
			CapabilityName::FetchFirst => {
				let (attribute_filter, total_filtered_row_count) = match self.inner.source.get_capability(name) {
					Some(Capability::FetchFirst { attribute_filter, total_filtered_row_count, .. }) =>
						(attribute_filter, total_filtered_row_count),
					_ => (false, false),
				};
				Some(Capability::FetchFirst {
					caching: CachingPolicy::VisitedByCurrentIterator,
					attribute_filter,
					total_filtered_row_count: total_filtered_row_count &&
						self.inner.options.include_filtered_row_count == FilteredRowCount::Enabled,
				})
			},
			_ => self.inner.source.get_capability(name),
		}
	}

	async fn get_total_size(&self) -> Result<Option<usize>, ProviderError> {
		let cached = {
			let state = self.inner.lock_state()?;
			match state.active_signature() {
				Some(signature) if signature.filter_criterion.is_none() && state.cache.is_done() =>
					Some(state.cache.len()),
				_ => None,
			}
		};
		match cached {
			Some(size) => Ok(Some(size)),
			None => self.inner.source.get_total_size().await,
		}
	}

	fn is_empty(&self) -> Emptiness {
		if let Ok(state) = self.inner.lock_state() &&
			state.active_signature().is_some_and(|signature| signature.filter_criterion.is_none())
		{
			if !state.cache.is_empty() {
				return Emptiness::No;
			}
			if state.cache.is_done() {
				return Emptiness::Yes;
			}
		}
		self.inner.source.is_empty()
	}

	fn subscribe(&self) -> broadcast::Receiver<DataProviderEvent<K, D>> {
		self.inner.events.subscribe()
	}

	fn key_collections(&self) -> Option<Arc<dyn KeyCollections<K, D>>> {
		self.inner.source.key_collections()
	}
}
