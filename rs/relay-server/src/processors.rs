//! Keeps one segmenting output processor alive per `(channel, container,
//! variant)` triple, shared across every client attached to the same
//! rendition, instead of letting each client's request spin up its own
//! segmenter.
//!
//! HLS and DASH address media by `#EXT-X-MEDIA-SEQUENCE`/segment number;
//! two clients polling the same variant must see the same sequence counter,
//! which only holds if they're reading one running [`Processor`], not two
//! independently-cut ones. MPEG-TS direct streaming has no such addressing
//! and is driven per-client in `web.rs` instead.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use relay_core::model::buffer::VariantRefGuard;
use relay_core::model::{ESVariantConsumer, VariantKey};
use relay_core::output::dash::DashProcessor;
use relay_core::output::hls_fmp4::HlsFmp4Processor;
use relay_core::output::hls_ts::HlsTsProcessor;
use relay_core::output::segment::SegmentConfig;
use relay_core::output::Processor as _;
use relay_core::profile::ContainerHint;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProcessorKey {
	channel: String,
	container: ContainerHint,
	variant: VariantKey,
}

/// Concrete processor kinds a registry entry can hold. Kept as a closed enum
/// rather than `Box<dyn Processor>` because the shared driver needs each
/// kind's inherent `playlist()`/`manifest()`/`init_segment()`/`segment_data()`
/// accessors, none of which are part of the `Processor` trait.
enum ProcessorKind {
	HlsTs(HlsTsProcessor),
	HlsFmp4(HlsFmp4Processor),
	Dash(DashProcessor),
}

impl ProcessorKind {
	async fn attach(&mut self) -> relay_core::Result<()> {
		match self {
			Self::HlsTs(p) => p.attach().await,
			Self::HlsFmp4(p) => p.attach().await,
			Self::Dash(p) => p.attach().await,
		}
	}

	async fn next_chunk(&mut self) -> relay_core::Result<Option<Bytes>> {
		match self {
			Self::HlsTs(p) => p.next_chunk().await,
			Self::HlsFmp4(p) => p.next_chunk().await,
			Self::Dash(p) => p.next_chunk().await,
		}
	}

	async fn detach(&mut self) {
		match self {
			Self::HlsTs(p) => p.detach().await,
			Self::HlsFmp4(p) => p.detach().await,
			Self::Dash(p) => p.detach().await,
		}
	}

	fn snapshot(&self) -> Snapshot {
		match self {
			Self::HlsTs(p) => Snapshot {
				playlist: Some(p.playlist()),
				init_segment: None,
				manifest: None,
			},
			Self::HlsFmp4(p) => Snapshot {
				playlist: Some(p.playlist()),
				init_segment: p.init_segment(),
				manifest: None,
			},
			Self::Dash(p) => Snapshot {
				playlist: None,
				init_segment: p.init_segment(),
				manifest: Some(p.manifest()),
			},
		}
	}

	fn segment_data(&self, sequence: u64) -> Option<Bytes> {
		match self {
			Self::HlsTs(p) => p.segment_data(sequence),
			Self::HlsFmp4(p) => p.segment_data(sequence),
			Self::Dash(p) => p.segment_data(sequence),
		}
	}
}

/// Latest playlist/manifest/init-segment state, refreshed after every
/// segment the background driver cuts. Reading this never blocks on the
/// driver's own lock on the processor.
#[derive(Clone, Default)]
pub struct Snapshot {
	pub playlist: Option<String>,
	pub init_segment: Option<Bytes>,
	pub manifest: Option<String>,
}

/// One running processor plus the snapshot clients read without touching
/// its lock.
pub struct SharedProcessor {
	snapshot: RwLock<Snapshot>,
	inner: Mutex<ProcessorKind>,
	/// Keeps the variant's refcount above zero for as long as this processor
	/// runs, independent of any individual client request's lifetime — a
	/// client fetching a playlist once shouldn't make the variant look idle
	/// the moment that request finishes.
	_guard: VariantRefGuard,
}

impl SharedProcessor {
	pub async fn snapshot(&self) -> Snapshot {
		self.snapshot.read().await.clone()
	}

	pub async fn segment_data(&self, sequence: u64) -> Option<Bytes> {
		self.inner.lock().await.segment_data(sequence)
	}
}

/// Registry of running [`SharedProcessor`]s, keyed by channel, container
/// format and variant so each rendition of each channel is segmented
/// exactly once regardless of how many clients are watching it.
#[derive(Default)]
pub struct ProcessorRegistry {
	entries: Mutex<HashMap<ProcessorKey, Arc<SharedProcessor>>>,
}

impl ProcessorRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the running processor for this triple, starting one (seeded
	/// from `consumer`/`guard`) if none exists yet. `consumer`/`guard` are
	/// only consumed on the first call for a given key; later callers'
	/// copies are simply dropped since the registered processor already
	/// owns a handle and a refcount on the variant.
	pub async fn get_or_start(
		&self,
		channel: &str,
		container: ContainerHint,
		variant: VariantKey,
		consumer: ESVariantConsumer,
		guard: VariantRefGuard,
		config: SegmentConfig,
	) -> Arc<SharedProcessor> {
		let key = ProcessorKey {
			channel: channel.to_string(),
			container,
			variant,
		};
		let mut entries = self.entries.lock().await;
		if let Some(existing) = entries.get(&key) {
			return existing.clone();
		}

		let kind = match container {
			ContainerHint::HlsTs => ProcessorKind::HlsTs(HlsTsProcessor::new(consumer, config)),
			ContainerHint::HlsFmp4 => ProcessorKind::HlsFmp4(HlsFmp4Processor::new(consumer, config)),
			ContainerHint::Dash => ProcessorKind::Dash(DashProcessor::new(consumer, config)),
			ContainerHint::MpegTs => {
				unreachable!("direct MPEG-TS streaming is driven per-client, never registered")
			}
		};
		let shared = Arc::new(SharedProcessor {
			snapshot: RwLock::new(Snapshot::default()),
			inner: Mutex::new(kind),
			_guard: guard,
		});
		entries.insert(key, shared.clone());
		tokio::spawn(drive(shared.clone()));
		shared
	}

	/// Tears down every processor registered for `channel`, called once its
	/// session is evicted so their background drivers stop polling a buffer
	/// nobody is feeding anymore.
	pub async fn remove_channel(&self, channel: &str) {
		self.entries.lock().await.retain(|key, _| key.channel != channel);
	}
}

/// Attaches then repeatedly cuts segments, publishing a fresh snapshot after
/// each one, until the source ends or a demux error kills the pipeline.
async fn drive(shared: Arc<SharedProcessor>) {
	{
		let mut inner = shared.inner.lock().await;
		if let Err(err) = inner.attach().await {
			warn!(%err, "shared processor failed to attach");
			return;
		}
	}

	loop {
		let outcome = {
			let mut inner = shared.inner.lock().await;
			inner.next_chunk().await
		};
		match outcome {
			Ok(Some(_)) => {
				let snapshot = {
					let inner = shared.inner.lock().await;
					inner.snapshot()
				};
				*shared.snapshot.write().await = snapshot;
			}
			Ok(None) => break,
			Err(err) => {
				warn!(%err, "shared processor stopped on error");
				break;
			}
		}
	}

	shared.inner.lock().await.detach().await;
}
