// SPDX-License-Identifier: GPL-3.0

//! Provider error types.

use crate::error::BufferError;
use std::{error::Error as StdError, sync::Arc};
use thiserror::Error;

/// Errors that can occur when reading from a data provider.
///
/// The type is `Clone` so a single upstream failure can be handed to every consumer
/// awaiting the same shared fetch.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
	/// The caller's abort signal fired before the result was available.
	#[error("The operation was aborted")]
	Aborted,
	/// The wrapped data source rejected the request.
	#[error("Data source error: {0}")]
	Upstream(Arc<dyn StdError + Send + Sync>),
	/// A request parameter was rejected by the provider.
	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),
	/// Edit buffer error.
	#[error(transparent)]
	Buffer(#[from] BufferError),
	/// Lock acquire error.
	#[error("Provider state acquire error: {0}")]
	Lock(String),
	/// A background fetch task failed to complete.
	#[error("Background fetch failed: {0}")]
	Task(String),
}

impl ProviderError {
	/// Wrap an arbitrary error raised by a data source.
	pub fn upstream<E: StdError + Send + Sync + 'static>(err: E) -> Self {
		Self::Upstream(Arc::new(err))
	}

	/// Returns `true` if this error reports an aborted request.
	pub fn is_aborted(&self) -> bool {
		matches!(self, Self::Aborted)
	}
}
