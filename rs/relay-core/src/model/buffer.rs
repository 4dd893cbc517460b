use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, OnceCell, RwLock};

use super::variant::{ESVariantConsumer, VariantKey};
use crate::error::{RelayError, Result};

struct Entry {
	consumer: ESVariantConsumer,
	/// Number of output processors currently attached to this variant,
	/// used by the idle sweeper to decide when a transcoded variant can be
	/// torn down (the source variant, refcount aside, is kept alive as long
	/// as the upstream connection is).
	refs: Arc<AtomicUsize>,
	last_touched: Instant,
}

/// One channel's worth of variants, shared between the upstream ingest task
/// and every attached output processor.
///
/// The variant map is a `RwLock<HashMap<..>>` rather than per-variant
/// `watch` channels: membership (insert/remove of whole variants) changes
/// far less often than any individual track's contents, so the coarse lock
/// only needs to be held briefly around map mutation, while per-track reads
/// go through the lock-free `watch` receiver cloned out of the entry.
pub struct SharedBuffer {
	channel_id: String,
	variants: RwLock<HashMap<VariantKey, Entry>>,
	/// Single-flight slots for variants currently being built by
	/// [`Self::get_or_create_variant`], keyed separately from `variants`
	/// since the slot only needs to exist for the duration of that one
	/// build: it's removed once the build settles (whether it succeeded or
	/// failed), so a later call — e.g. after the variant it built was torn
	/// down for being idle — starts a fresh build instead of replaying a
	/// stale result.
	pending: Mutex<HashMap<VariantKey, Arc<OnceCell<Result<()>>>>>,
}

impl SharedBuffer {
	pub fn new(channel_id: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			channel_id: channel_id.into(),
			variants: RwLock::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
		})
	}

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

	/// Registers the consumer half of a freshly built variant under `key`.
	/// Callers keep the matching `ESVariantProducer` (returned alongside the
	/// consumer by whatever demuxer or transcoder built the variant) and
	/// write samples directly into it; the buffer only ever holds consumer
	/// handles, since it exists to fan reads out, not to mediate writes.
	pub async fn insert_variant_consumer(&self, key: VariantKey, consumer: ESVariantConsumer) {
		let mut variants = self.variants.write().await;
		variants.insert(
			key,
			Entry {
				consumer,
				refs: Arc::new(AtomicUsize::new(0)),
				last_touched: Instant::now(),
			},
		);
	}

	pub async fn remove_variant(&self, key: &VariantKey) {
		self.variants.write().await.remove(key);
	}

	pub async fn variant(&self, key: &VariantKey) -> Option<ESVariantConsumer> {
		let mut variants = self.variants.write().await;
		let entry = variants.get_mut(key)?;
		entry.last_touched = Instant::now();
		Some(entry.consumer.clone())
	}

	pub async fn has_variant(&self, key: &VariantKey) -> bool {
		self.variants.read().await.contains_key(key)
	}

	/// Returns `key`'s consumer, building it first if absent.
	///
	/// If `key` isn't registered and isn't `source`, `on_variant_request` is
	/// invoked exactly once (even under concurrent callers asking for the
	/// same `key`) to build and register it — a transcoder pipeline, in
	/// practice — before this returns the newly registered consumer. `source`
	/// itself is never lazily built this way; a miss on `source` is a
	/// genuine not-found, since only upstream ingest populates it.
	pub async fn get_or_create_variant<F, Fut>(
		&self,
		source: &VariantKey,
		key: VariantKey,
		on_variant_request: F,
	) -> Result<ESVariantConsumer>
	where
		F: FnOnce(VariantKey, VariantKey) -> Fut,
		Fut: Future<Output = Result<()>>,
	{
		if let Some(consumer) = self.variant(&key).await {
			return Ok(consumer);
		}
		if key == *source {
			return Err(RelayError::NotFound);
		}

		let slot = {
			let mut pending = self.pending.lock().await;
			pending.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
		};

		let result = slot.get_or_init(|| on_variant_request(*source, key)).await.clone();
		self.pending.lock().await.remove(&key);
		result?;

		self.variant(&key).await.ok_or(RelayError::NotFound)
	}

	/// Attaches one processor to `key`, bumping its refcount. Returns a
	/// guard that decrements the refcount on drop.
	pub async fn register_processor(&self, key: &VariantKey) -> Result<VariantRefGuard> {
		let variants = self.variants.read().await;
		let entry = variants.get(key).ok_or(RelayError::NotFound)?;
		let refs = entry.refs.clone();
		refs.fetch_add(1, Ordering::SeqCst);
		Ok(VariantRefGuard { refs })
	}

	pub async fn refcount(&self, key: &VariantKey) -> usize {
		match self.variants.read().await.get(key) {
			Some(entry) => entry.refs.load(Ordering::SeqCst),
			None => 0,
		}
	}

	/// Removes transcoded variants whose refcount has been zero for longer
	/// than `idle_timeout`. The source variant (the one whose key matches
	/// the upstream's own codecs) is exempt, since tearing it down would
	/// require re-probing the origin on the next request.
	pub async fn sweep_idle(&self, idle_timeout: std::time::Duration, source: &VariantKey) {
		let mut variants = self.variants.write().await;
		let now = Instant::now();
		variants.retain(|key, entry| {
			if key == source {
				return true;
			}
			let idle = entry.refs.load(Ordering::SeqCst) == 0
				&& now.duration_since(entry.last_touched) > idle_timeout;
			!idle
		});
	}

	pub async fn variant_keys(&self) -> Vec<VariantKey> {
		self.variants.read().await.keys().copied().collect()
	}
}

/// RAII refcount handle returned by [`SharedBuffer::register_processor`].
pub struct VariantRefGuard {
	refs: Arc<AtomicUsize>,
}

impl Drop for VariantRefGuard {
	fn drop(&mut self) {
		self.refs.fetch_sub(1, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::codec::VideoCodec;
	use crate::model::track::ESTrackProducer;
	use crate::model::variant::ESVariantConsumer;
	use crate::model::codec::Codec;

	fn variant_key() -> VariantKey {
		VariantKey::source(Some(VideoCodec::H264), None)
	}

	#[tokio::test]
	async fn insert_and_fetch_variant() {
		let buffer = SharedBuffer::new("chan-1");
		let (_producer, video) = ESTrackProducer::new(Codec::Video(VideoCodec::H264), 8);
		let key = variant_key();
		buffer
			.insert_variant_consumer(
				key,
				ESVariantConsumer {
					key,
					video: Some(video),
					audio: None,
				},
			)
			.await;
		assert!(buffer.has_variant(&key).await);
		assert!(buffer.variant(&key).await.is_some());
	}

	#[tokio::test]
	async fn refcount_tracks_processors() {
		let buffer = SharedBuffer::new("chan-1");
		let (_producer, video) = ESTrackProducer::new(Codec::Video(VideoCodec::H264), 8);
		let key = variant_key();
		buffer
			.insert_variant_consumer(
				key,
				ESVariantConsumer {
					key,
					video: Some(video),
					audio: None,
				},
			)
			.await;
		let guard = buffer.register_processor(&key).await.unwrap();
		assert_eq!(buffer.refcount(&key).await, 1);
		drop(guard);
		assert_eq!(buffer.refcount(&key).await, 0);
	}

	#[tokio::test]
	async fn sweep_idle_keeps_source_variant() {
		let buffer = SharedBuffer::new("chan-1");
		let (_producer, video) = ESTrackProducer::new(Codec::Video(VideoCodec::H264), 8);
		let key = variant_key();
		buffer
			.insert_variant_consumer(
				key,
				ESVariantConsumer {
					key,
					video: Some(video),
					audio: None,
				},
			)
			.await;
		buffer
			.sweep_idle(std::time::Duration::from_secs(0), &key)
			.await;
		assert!(buffer.has_variant(&key).await);
	}

	#[tokio::test]
	async fn register_processor_on_missing_variant_errors() {
		let buffer = SharedBuffer::new("chan-1");
		let key = variant_key();
		assert!(matches!(
			buffer.register_processor(&key).await,
			Err(RelayError::NotFound)
		));
	}

	#[tokio::test]
	async fn get_or_create_variant_builds_once_under_concurrent_callers() {
		let buffer = Arc::new(SharedBuffer::new("chan-1"));
		let source = variant_key();
		let target = VariantKey::source(Some(VideoCodec::H264), Some(crate::model::codec::AudioCodec::Aac));
		let calls = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..8 {
			let buffer = buffer.clone();
			let calls = calls.clone();
			handles.push(tokio::spawn(async move {
				buffer
					.get_or_create_variant(&source, target, move |_source, target| {
						let buffer = buffer.clone();
						let calls = calls.clone();
						async move {
							calls.fetch_add(1, Ordering::SeqCst);
							let (_producer, video) = ESTrackProducer::new(Codec::Video(VideoCodec::H264), 8);
							buffer
								.insert_variant_consumer(target, ESVariantConsumer { key: target, video: Some(video), audio: None })
								.await;
							Ok(())
						}
					})
					.await
			}));
		}
		for handle in handles {
			assert!(handle.await.unwrap().is_ok());
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn get_or_create_variant_retries_after_a_failed_build() {
		let buffer = SharedBuffer::new("chan-1");
		let source = variant_key();
		let target = VariantKey::source(Some(VideoCodec::H264), Some(crate::model::codec::AudioCodec::Aac));

		let first = buffer
			.get_or_create_variant(&source, target, |_source, _target| async { Err(RelayError::Closed) })
			.await;
		assert!(first.is_err());
		assert!(!buffer.pending.lock().await.contains_key(&target));

		let second = buffer
			.get_or_create_variant(&source, target, |_source, _target| async { Ok(()) })
			.await;
		// second build reports success but (deliberately, for this test)
		// never registers a consumer, so the lookup afterward surfaces
		// NotFound rather than hanging or replaying the first call's error.
		assert!(matches!(second, Err(RelayError::NotFound)));
	}

	#[tokio::test]
	async fn get_or_create_variant_rejects_source_key() {
		let buffer = SharedBuffer::new("chan-1");
		let key = variant_key();
		let result = buffer
			.get_or_create_variant(&key, key, |_source, _target| async { Ok(()) })
			.await;
		assert!(matches!(result, Err(RelayError::NotFound)));
	}
}
