// SPDX-License-Identifier: GPL-3.0

//! Keyed, pageable data providers and two composable wrappers over them.
//!
//! A [`DataProvider`] exposes a collection through asynchronous page iteration, key
//! lookups and positional access, and publishes `mutate`/`refresh` events. The wrappers
//! implement the same contract on top of another provider, so they stack freely.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Consumers                              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    BufferingDataProvider                        │
//! │       (local adds/removes/updates overlaid on the source)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               CachedIteratorResultsDataProvider                 │
//! │      (one upstream iteration shared by every consumer)          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Source DataProvider                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod buffer;
mod buffering;
mod cache;
mod cached;
pub mod config;
pub mod error;
mod events;
pub mod filter;
pub mod models;
mod positions;
pub mod provider;
mod strings;
#[cfg(any(test, feature = "integration-tests"))]
pub mod testing;

pub use buffer::{EditBuffer, KeyGenerator};
pub use buffering::BufferingDataProvider;
pub use cache::{CacheEntry, ResultCache};
pub use cached::{CachedIterator, CachedIteratorResultsDataProvider, FetchOutcome, FetchSignature};
pub use config::{BufferingOptions, CachedResultsOptions, FilteredRowCount, RowFilter};
pub use error::{BufferError, ProviderError};
pub use events::{EVENT_CHANNEL_CAPACITY, EventBus};
pub use positions::IndexChange;
pub use provider::{BoxedIterator, DataProvider, FetchListIterator, SharedProvider};
pub use strings::capability;
