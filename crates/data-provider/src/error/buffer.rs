// SPDX-License-Identifier: GPL-3.0

//! Edit buffer error types.

use crate::models::{EditOperation, EditStatus};
use thiserror::Error;

/// Errors raised synchronously by the edit buffer.
///
/// None of these leave the buffer in a modified state: validation happens before any
/// entry is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
	/// An unsubmitted edit of an incompatible kind already exists for the key.
	#[error("An unsubmitted {existing} edit already exists for key {key}")]
	DuplicateEdit {
		/// Debug rendering of the conflicting key.
		key: String,
		/// Operation of the edit already in the buffer.
		existing: EditOperation,
	},
	/// No edit with the given key and status is buffered.
	#[error("No {status} edit found for key {key}")]
	EditNotFound {
		/// Debug rendering of the key.
		key: String,
		/// Status the caller expected the edit to have.
		status: EditStatus,
	},
	/// The requested status change is not one of the permitted transitions.
	#[error("Invalid edit status transition: {from} -> {to}")]
	InvalidStatusTransition {
		/// Current status.
		from: EditStatus,
		/// Requested status.
		to: EditStatus,
	},
	/// Another edit for the same key is already being submitted.
	#[error("An edit for key {key} is already being submitted")]
	SubmissionInProgress {
		/// Debug rendering of the key.
		key: String,
	},
	/// The item had no key and none could be generated.
	#[error("Unable to generate a key: no key generator configured for this key type")]
	KeyGeneration,
	/// Lock acquire error.
	#[error("Edit buffer acquire error: {0}")]
	Lock(String),
}
