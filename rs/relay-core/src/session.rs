use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OnceCell};
use url::Url;

use crate::classification::Classification;
use crate::model::SharedBuffer;

/// One upstream channel currently being relayed: its classified source, the
/// shared ES buffer every variant and output processor attaches to, and a
/// refcount of attached clients used by [`crate::manager::SessionManager`]
/// to decide when ingest can stop.
pub struct Session {
	pub channel_id: String,
	pub origin_url: Url,
	pub classification: Classification,
	pub buffer: Arc<SharedBuffer>,
	refs: AtomicUsize,
	closed: Notify,
	source_started: OnceCell<()>,
	/// Last time a request for this channel came in. HLS/DASH clients poll
	/// with no connection held open between requests, so `refcount() == 0`
	/// between polls is normal and must not trigger eviction on its own —
	/// [`crate::manager::SessionManager::sweep_idle`] only evicts once both
	/// this and the refcount have been idle past the configured timeout.
	last_active: Mutex<Instant>,
}

impl Session {
	pub fn new(channel_id: impl Into<String>, origin_url: Url, classification: Classification) -> Arc<Self> {
		let channel_id = channel_id.into();
		Arc::new(Self {
			buffer: SharedBuffer::new(channel_id.clone()),
			channel_id,
			origin_url,
			classification,
			refs: AtomicUsize::new(0),
			closed: Notify::new(),
			source_started: OnceCell::new(),
			last_active: Mutex::new(Instant::now()),
		})
	}

	/// Records that a client just made a request against this session,
	/// called on every `/relay/stream` hit regardless of delivery mode.
	pub fn touch(&self) {
		*self.last_active.lock().unwrap() = Instant::now();
	}

	/// How long it's been since [`Self::touch`] was last called.
	pub fn idle_for(&self) -> Duration {
		self.last_active.lock().unwrap().elapsed()
	}

	/// Runs `start` at most once for this session's lifetime, the first time
	/// a request actually needs the source variant ingested (a `Direct`
	/// delivery decision never touches this, so a channel only ever
	/// redirected to directly never spins up a buffer or origin
	/// connection).
	pub async fn ensure_source_ingest<F, Fut>(&self, start: F)
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = ()>,
	{
		self.source_started.get_or_init(start).await;
	}

	/// Acquires a ref-counted guard that keeps this session alive (and
	/// ingest running) until dropped. Owns an `Arc` clone rather than
	/// borrowing so it can be held across an `'static` future, e.g. an
	/// axum response body streaming from this session's buffer.
	pub fn acquire(self: &Arc<Self>) -> SessionRefGuard {
		self.refs.fetch_add(1, Ordering::SeqCst);
		SessionRefGuard { session: self.clone() }
	}

	pub fn refcount(&self) -> usize {
		self.refs.load(Ordering::SeqCst)
	}

	/// Resolves once [`Self::notify_closed`] has been called, used by the
	/// ingest task to wake up promptly when the last client detaches
	/// instead of waiting for the next idle-sweep tick.
	pub async fn closed(&self) {
		self.closed.notified().await;
	}

	pub fn notify_closed(&self) {
		self.closed.notify_waiters();
	}
}

pub struct SessionRefGuard {
	session: Arc<Session>,
}

impl Drop for SessionRefGuard {
	fn drop(&mut self) {
		if self.session.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.session.notify_closed();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classification::SourceFormat;

	fn session() -> Arc<Session> {
		Session::new(
			"chan-1",
			Url::parse("http://origin.example/stream").unwrap(),
			Classification {
				source_url: Url::parse("http://origin.example/stream").unwrap(),
				format: SourceFormat::MpegTs,
				video: None,
				audio: None,
			},
		)
	}

	#[test]
	fn refcount_tracks_guards() {
		let session = session();
		let guard_a = session.acquire();
		let guard_b = session.acquire();
		assert_eq!(session.refcount(), 2);
		drop(guard_a);
		assert_eq!(session.refcount(), 1);
		drop(guard_b);
		assert_eq!(session.refcount(), 0);
	}
}
