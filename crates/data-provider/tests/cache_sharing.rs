// SPDX-License-Identifier: GPL-3.0

//! Integration tests for iteration sharing in the result cache.

#![cfg(feature = "integration-tests")]

use anyhow::Result;
use data_provider::{
	CachedIteratorResultsDataProvider, CachedResultsOptions, DataProvider, ProviderError,
	models::{FetchByOffsetParameters, FetchListParameters},
	testing::{ArrayDataProvider, Row},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn cached(source: &ArrayDataProvider) -> CachedIteratorResultsDataProvider<String, Row> {
	let _ = env_logger::try_init();
	CachedIteratorResultsDataProvider::new(Arc::new(source.clone()), CachedResultsOptions::default())
}

#[tokio::test]
async fn late_consumer_replays_cached_prefix() -> Result<()> {
	let source = ArrayDataProvider::with_rows(25);
	let provider = cached(&source);
	let params = FetchListParameters::new().with_size(5);

	let mut leader = provider.fetch_first(params.clone());
	leader.next().await?;
	leader.next().await?;
	assert_eq!(source.next_calls(), 2);

	let mut follower = provider.fetch_first(params);
	let mut seen = Vec::new();
	for _ in 0..3 {
		seen.extend(follower.next().await?.value.keys().cloned());
	}

	assert_eq!(seen.len(), 15);
	assert_eq!(seen.first().map(String::as_str), Some("k0"));
	// Only the third page needed the source.
	assert_eq!(source.next_calls(), 3);
	Ok(())
}

#[tokio::test]
async fn many_concurrent_consumers_share_each_page() -> Result<()> {
	let source = ArrayDataProvider::with_rows(12);
	let provider = Arc::new(cached(&source));
	let params = FetchListParameters::new().with_size(4);

	let consumers: Vec<_> = (0..8)
		.map(|_| {
			let mut iterator = provider.fetch_first(params.clone());
			tokio::spawn(async move {
				let mut keys = Vec::new();
				loop {
					let page = iterator.next().await?;
					keys.extend(page.value.keys().cloned());
					if page.done {
						return Ok::<_, ProviderError>(keys);
					}
				}
			})
		})
		.collect();

	for consumer in consumers {
		assert_eq!(consumer.await??.len(), 12);
	}
	assert_eq!(source.next_calls(), 3);
	assert!(provider.is_fully_cached()?);
	Ok(())
}

#[tokio::test]
async fn aborted_consumer_does_not_touch_cache() -> Result<()> {
	let source = ArrayDataProvider::with_rows(5);
	let provider = cached(&source);
	let signal = CancellationToken::new();
	signal.cancel();

	let mut iterator = provider.fetch_first(FetchListParameters::new().with_signal(signal.clone()));
	assert!(iterator.next().await.unwrap_err().is_aborted());

	let mut offset = FetchByOffsetParameters::new(0, 2);
	offset.signal = Some(signal);
	assert!(provider.fetch_by_offset(offset).await.unwrap_err().is_aborted());
	assert_eq!(provider.cached_row_count()?, 0);
	Ok(())
}
