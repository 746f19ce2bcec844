// SPDX-License-Identifier: GPL-3.0

//! In-memory buffer of pending local edits.
//!
//! Each key owns two slots: one for the edit the user is still working on
//! (`Unsubmitted`) and one for the edit the caller is currently writing to the backend
//! (`Submitting`). A submitted edit leaves the buffer immediately.
//!
//! ```text
//!                 set_item_status(Submitting)
//!   Unsubmitted ───────────────────────────────► Submitting
//!        ▲                                           │
//!        │    set_item_status(Unsubmitted, error)    │ set_item_status(Submitted)
//!        └───────────────────────────────────────────┤
//!                                                    ▼
//!                                               (removed)
//! ```
//!
//! While an edit is submitting, the user may keep editing the same row: the new edit
//! lands in the unsubmitted slot and always wins visibility over the submitting one.

use crate::{
	error::BufferError,
	models::{
		EditItem, EditOperation, EditStatus, Item, ItemMessage, ItemWithOptionalData, NewItem,
		ProviderData, ProviderKey,
	},
};
use indexmap::IndexMap;
use std::{collections::HashMap, fmt, sync::Arc};

/// Produces a key for a row added without one.
pub type KeyGenerator<K, D> = Arc<dyn Fn(&D) -> K + Send + Sync>;

/// The two edit slots of one key.
#[derive(Clone, Debug)]
struct KeyEdits<K, D> {
	unsubmitted: Option<EditItem<K, D>>,
	submitting: Option<EditItem<K, D>>,
}

impl<K, D> Default for KeyEdits<K, D> {
	fn default() -> Self {
		Self { unsubmitted: None, submitting: None }
	}
}

impl<K, D> KeyEdits<K, D> {
	fn is_empty(&self) -> bool {
		self.unsubmitted.is_none() && self.submitting.is_none()
	}

	/// The edit consumers should see: the newest one.
	fn visible(&self) -> Option<&EditItem<K, D>> {
		self.unsubmitted.as_ref().or(self.submitting.as_ref())
	}

	fn items_mut(&mut self) -> impl Iterator<Item = &mut EditItem<K, D>> {
		self.unsubmitted.iter_mut().chain(self.submitting.iter_mut())
	}
}

/// Pending local edits keyed by row key.
pub struct EditBuffer<K, D> {
	edits: IndexMap<K, KeyEdits<K, D>>,
	generated_keys: HashMap<K, K>,
	key_generator: Option<KeyGenerator<K, D>>,
}

impl<K: fmt::Debug, D: fmt::Debug> fmt::Debug for EditBuffer<K, D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EditBuffer")
			.field("edits", &self.edits)
			.field("generated_keys", &self.generated_keys)
			.field("key_generator", &self.key_generator.is_some())
			.finish()
	}
}

impl<K: ProviderKey, D: ProviderData> Default for EditBuffer<K, D> {
	fn default() -> Self {
		Self::new(None)
	}
}

impl<K: ProviderKey, D: ProviderData> EditBuffer<K, D> {
	/// Create an empty buffer.
	///
	/// Without a `key_generator`, keyless adds fall back to [`ProviderKey::generate`].
	pub fn new(key_generator: Option<KeyGenerator<K, D>>) -> Self {
		Self { edits: IndexMap::new(), generated_keys: HashMap::new(), key_generator }
	}

	/// Buffer a new row.
	///
	/// Returns the key the row is buffered under, generated if `item.key` is `None`.
	///
	/// Re-adding a row with an unsubmitted remove restores it as an update.
	pub fn add_item(&mut self, item: NewItem<K, D>, add_before_key: Option<K>) -> Result<K, BufferError> {
		let key = match item.key {
			Some(key) => key,
			None => self.generate_key(&item.data)?,
		};
		let slot = &mut self.edits.entry(key.clone()).or_default().unsubmitted;
		match slot.as_ref().map(|edit| edit.operation) {
			Some(existing @ (EditOperation::Add | EditOperation::Update)) =>
				return Err(duplicate(&key, existing)),
			Some(EditOperation::Remove) => {
				*slot = Some(EditItem::new(
					EditOperation::Update,
					Item::new(key.clone(), item.data).into(),
				));
			},
			None => {
				let mut edit = EditItem::new(EditOperation::Add, Item::new(key.clone(), item.data).into());
				edit.add_before_key = add_before_key;
				*slot = Some(edit);
			},
		}
		Ok(key)
	}

	/// Buffer the removal of a row.
	///
	/// Removing a row that was only added locally cancels the add.
	pub fn remove_item(&mut self, item: ItemWithOptionalData<K, D>) -> Result<(), BufferError> {
		let key = item.metadata.key.clone();
		let entry = self.edits.entry(key.clone()).or_default();
		match entry.unsubmitted.as_ref().map(|edit| edit.operation) {
			Some(EditOperation::Remove) => return Err(duplicate(&key, EditOperation::Remove)),
			Some(EditOperation::Add) => {
				entry.unsubmitted = None;
				self.prune(&key);
			},
			Some(EditOperation::Update) => {
				let previous = entry.unsubmitted.take().and_then(|edit| edit.item.data);
				let data = item.data.or(previous);
				entry.unsubmitted = Some(EditItem::new(
					EditOperation::Remove,
					ItemWithOptionalData { metadata: item.metadata, data },
				));
			},
			None => entry.unsubmitted = Some(EditItem::new(EditOperation::Remove, item)),
		}
		Ok(())
	}

	/// Buffer new data for a row.
	///
	/// Updating a row with an unsubmitted add or update replaces that edit's data.
	pub fn update_item(&mut self, item: Item<K, D>) -> Result<(), BufferError> {
		let key = item.metadata.key.clone();
		if let Some(EditOperation::Remove) = self.unsubmitted_item(&key).map(|edit| edit.operation) {
			return Err(duplicate(&key, EditOperation::Remove));
		}
		let slot = &mut self.edits.entry(key).or_default().unsubmitted;
		match slot.as_mut() {
			Some(edit) => {
				edit.item.data = Some(item.data);
				edit.error = None;
			},
			None => *slot = Some(EditItem::new(EditOperation::Update, item.into())),
		}
		Ok(())
	}

	/// Move an edit through its lifecycle.
	///
	/// Permitted transitions: `Unsubmitted -> Submitting`, `Submitting -> Unsubmitted`
	/// (failure, optionally with `error`) and `Submitting -> Submitted` (success). When a
	/// failed submission finds a newer unsubmitted edit for the same key, the error is
	/// attached to the newer edit and the failed one is discarded.
	///
	/// `new_key` records the real key of a row buffered under a generated key.
	pub fn set_item_status(
		&mut self,
		edit: &EditItem<K, D>,
		status: EditStatus,
		error: Option<ItemMessage>,
		new_key: Option<K>,
	) -> Result<(), BufferError> {
		use EditStatus::*;
		let key = edit.key().clone();
		let transition = (edit.status, status);
		if !matches!(transition, (Unsubmitted, Submitting) | (Submitting, Unsubmitted) | (Submitting, Submitted)) {
			return Err(BufferError::InvalidStatusTransition { from: edit.status, to: status });
		}
		let not_found = || BufferError::EditNotFound { key: format!("{key:?}"), status: edit.status };
		let entry = self.edits.get_mut(&key).ok_or_else(not_found)?;
		match transition {
			(Unsubmitted, Submitting) => {
				if entry.submitting.is_some() {
					return Err(BufferError::SubmissionInProgress { key: format!("{key:?}") });
				}
				let mut item = entry.unsubmitted.take().ok_or_else(not_found)?;
				item.status = Submitting;
				item.error = error;
				entry.submitting = Some(item);
			},
			(Submitting, Unsubmitted) => {
				let mut item = entry.submitting.take().ok_or_else(not_found)?;
				match entry.unsubmitted.as_mut() {
					Some(newer) => newer.error = error,
					None => {
						item.status = Unsubmitted;
						item.error = error;
						entry.unsubmitted = Some(item);
					},
				}
			},
			_ => {
				entry.submitting.take().ok_or_else(not_found)?;
			},
		}
		self.prune(&key);
		if let Some(new_key) = new_key {
			self.record_generated_key(key, new_key);
		}
		Ok(())
	}

	/// Unsubmitted edits whose key has no submission in progress, in buffer order.
	pub fn get_submittable_items(&self) -> Vec<EditItem<K, D>> {
		self.edits
			.values()
			.filter(|edits| edits.submitting.is_none())
			.filter_map(|edits| edits.unsubmitted.clone())
			.collect()
	}

	/// Discard every unsubmitted edit.
	pub fn reset_all_unsubmitted_items(&mut self) {
		for edits in self.edits.values_mut() {
			edits.unsubmitted = None;
		}
		self.edits.retain(|_, edits| !edits.is_empty());
	}

	/// Discard the unsubmitted edit of `key`, if any.
	pub fn reset_unsubmitted_item(&mut self, key: &K) {
		if let Some(edits) = self.edits.get_mut(key) {
			edits.unsubmitted = None;
			self.prune(key);
		}
	}

	/// The edit consumers see for `key`: the unsubmitted one if present, else the
	/// submitting one.
	pub fn get_item(&self, key: &K) -> Option<&EditItem<K, D>> {
		self.edits.get(key).and_then(KeyEdits::visible)
	}

	/// The unsubmitted edit of `key`.
	pub fn unsubmitted_item(&self, key: &K) -> Option<&EditItem<K, D>> {
		self.edits.get(key).and_then(|edits| edits.unsubmitted.as_ref())
	}

	/// The edit of `key` currently being submitted.
	pub fn submitting_item(&self, key: &K) -> Option<&EditItem<K, D>> {
		self.edits.get(key).and_then(|edits| edits.submitting.as_ref())
	}

	/// Visible edits of every key, in buffer order.
	pub fn visible_items(&self) -> Vec<EditItem<K, D>> {
		self.edits.values().filter_map(KeyEdits::visible).cloned().collect()
	}

	/// Keys whose unsubmitted edit has one of the given operations.
	pub fn unsubmitted_keys(&self, operations: &[EditOperation]) -> Vec<K> {
		self.edits
			.iter()
			.filter(|(_, edits)| {
				edits.unsubmitted.as_ref().is_some_and(|edit| operations.contains(&edit.operation))
			})
			.map(|(key, _)| key.clone())
			.collect()
	}

	/// The real key a generated key was submitted as.
	pub fn resolve_generated_key(&self, key: &K) -> Option<&K> {
		self.generated_keys.get(key)
	}

	/// Number of keys with at least one edit.
	pub fn len(&self) -> usize {
		self.edits.len()
	}

	/// Returns `true` if no edits are buffered.
	pub fn is_empty(&self) -> bool {
		self.edits.is_empty()
	}

	fn generate_key(&self, data: &D) -> Result<K, BufferError> {
		match &self.key_generator {
			Some(generator) => Ok(generator(data)),
			None => K::generate().ok_or(BufferError::KeyGeneration),
		}
	}

	fn prune(&mut self, key: &K) {
		if self.edits.get(key).is_some_and(KeyEdits::is_empty) {
			self.edits.shift_remove(key);
		}
	}

	/// Map `placeholder` to `real` and move pending edits over to the real key.
	fn record_generated_key(&mut self, placeholder: K, real: K) {
		if placeholder == real {
			return;
		}
		if !self.edits.contains_key(&real) &&
			let Some((index, _, mut edits)) = self.edits.shift_remove_full(&placeholder)
		{
			for edit in edits.items_mut() {
				edit.item.metadata.key = real.clone();
			}
			self.edits.shift_insert(index, real.clone(), edits);
		}
		for edit in self.edits.values_mut().flat_map(KeyEdits::items_mut) {
			if edit.add_before_key.as_ref() == Some(&placeholder) {
				edit.add_before_key = Some(real.clone());
			}
		}
		self.generated_keys.insert(placeholder, real);
	}
}

fn duplicate<K: fmt::Debug>(key: &K, existing: EditOperation) -> BufferError {
	BufferError::DuplicateEdit { key: format!("{key:?}"), existing }
}
