// SPDX-License-Identifier: GPL-3.0

//! Row position bookkeeping under mutations.
//!
//! Two kinds of positions move when rows are added or removed upstream:
//!
//! - read cursors (the next index a consumer will read), shifted by
//!   [`IndexChange::shift_cursor`];
//! - row positions (where a known row currently sits), shifted by
//!   [`IndexChange::shift_row`].
//!
//! A cursor sitting exactly on an added or removed index does not move: the consumer
//! reads whatever row now occupies that index next.

use std::{collections::HashMap, hash::Hash};

/// One physical change to an ordered row list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexChange {
	/// The row at this index was removed.
	Removed(usize),
	/// A row was inserted at this index.
	Added(usize),
}

impl IndexChange {
	/// Move a read cursor past this change.
	pub fn shift_cursor(self, cursor: usize) -> usize {
		match self {
			Self::Removed(index) if cursor > index => cursor - 1,
			Self::Added(index) if cursor > index => cursor + 1,
			_ => cursor,
		}
	}

	/// Move the position of a surviving row past this change.
	///
	/// Returns `None` if the row itself was the one removed.
	pub fn shift_row(self, position: usize) -> Option<usize> {
		match self {
			Self::Removed(index) if position == index => None,
			Self::Removed(index) if position > index => Some(position - 1),
			Self::Added(index) if position >= index => Some(position + 1),
			_ => Some(position),
		}
	}
}

/// Source positions of rows whose visibility a wrapper altered.
///
/// Used to translate positions reported by a source into positions in the wrapper's
/// merged view: rows the wrapper hides shift later rows up, rows it inserts shift them
/// down.
#[derive(Debug)]
pub(crate) struct PositionLedger<K> {
	/// Source position of each hidden row.
	hidden: HashMap<K, usize>,
	/// Source position each inserted row was placed before.
	anchors: HashMap<K, usize>,
}

impl<K> Default for PositionLedger<K> {
	fn default() -> Self {
		Self { hidden: HashMap::new(), anchors: HashMap::new() }
	}
}

impl<K: Clone + Eq + Hash> PositionLedger<K> {
	/// Record that the source row at `position` is hidden.
	pub fn hide(&mut self, key: K, position: usize) {
		self.hidden.insert(key, position);
	}

	/// Record that an inserted row sits before source position `position`.
	pub fn anchor(&mut self, key: K, position: usize) {
		self.anchors.insert(key, position);
	}

	/// Forget everything.
	pub fn clear(&mut self) {
		self.hidden.clear();
		self.anchors.clear();
	}

	/// Translate a source position into a merged-view position.
	///
	/// Only entries for which `hidden_active`/`anchor_active` still hold are counted, so
	/// edits dropped from the buffer stop affecting translation.
	pub fn translate(
		&self,
		position: usize,
		hidden_active: impl Fn(&K) -> bool,
		anchor_active: impl Fn(&K) -> bool,
	) -> usize {
		let inserted = self
			.anchors
			.iter()
			.filter(|(key, anchor)| **anchor <= position && anchor_active(key))
			.count();
		let hidden = self
			.hidden
			.iter()
			.filter(|(key, hidden)| **hidden < position && hidden_active(key))
			.count();
		(position + inserted).saturating_sub(hidden)
	}

	/// Apply a source-side change to every recorded position.
	pub fn apply(&mut self, change: IndexChange) {
		self.hidden.retain(|_, position| match change.shift_row(*position) {
			Some(shifted) => {
				*position = shifted;
				true
			},
			None => false,
		});
		// An anchor names a gap rather than a row, so it survives the removal of the
		// row it preceded.
		for anchor in self.anchors.values_mut() {
			*anchor = match change {
				IndexChange::Removed(index) if *anchor > index => *anchor - 1,
				IndexChange::Added(index) if *anchor > index => *anchor + 1,
				_ => *anchor,
			};
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hidden_positions(ledger: &PositionLedger<&str>) -> Vec<usize> {
		let mut positions: Vec<usize> = ledger.hidden.values().copied().collect();
		positions.sort_unstable();
		positions
	}

	#[test]
	fn cursor_after_removed_index_moves_back() {
		assert_eq!(IndexChange::Removed(2).shift_cursor(5), 4);
		assert_eq!(IndexChange::Removed(5).shift_cursor(5), 5);
		assert_eq!(IndexChange::Removed(7).shift_cursor(5), 5);
	}

	#[test]
	fn cursor_after_added_index_moves_forward() {
		assert_eq!(IndexChange::Added(2).shift_cursor(5), 6);
		assert_eq!(IndexChange::Added(5).shift_cursor(5), 5);
	}

	#[test]
	fn removed_row_has_no_position() {
		assert_eq!(IndexChange::Removed(3).shift_row(3), None);
		assert_eq!(IndexChange::Removed(3).shift_row(4), Some(3));
		assert_eq!(IndexChange::Added(3).shift_row(3), Some(4));
	}

	#[test]
	fn ledger_translates_through_hidden_and_inserted_rows() {
		let mut ledger = PositionLedger::default();
		ledger.anchor("new", 0);
		ledger.hide("gone", 1);

		// Source row 0 sits after the inserted row.
		assert_eq!(ledger.translate(0, |_| true, |_| true), 1);
		// Source row 3: +1 inserted, -1 hidden.
		assert_eq!(ledger.translate(3, |_| true, |_| true), 3);
		// Dropped edits no longer count.
		assert_eq!(ledger.translate(3, |_| false, |_| true), 4);
	}

	#[test]
	fn ledger_follows_source_changes() {
		let mut ledger = PositionLedger::default();
		ledger.hide("a", 4);
		ledger.hide("b", 1);

		ledger.apply(IndexChange::Removed(1));
		assert_eq!(hidden_positions(&ledger), vec![3]);

		ledger.apply(IndexChange::Added(0));
		assert_eq!(hidden_positions(&ledger), vec![4]);
	}
}
