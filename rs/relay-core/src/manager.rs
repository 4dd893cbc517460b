use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};

use crate::error::Result;
use crate::session::Session;

/// Holds one in-flight-or-ready session per channel id. A `OnceCell` rather
/// than a plain `Arc<Session>` slot means concurrent callers racing to open
/// the same channel all await the same single creation future instead of
/// each starting their own upstream connection.
type Slot = Arc<OnceCell<Arc<Session>>>;

/// Owns every active [`Session`], creating them single-flight per channel
/// id and sweeping ones whose refcount has been zero for longer than the
/// configured idle timeout.
pub struct SessionManager {
	sessions: Mutex<HashMap<String, Slot>>,
	idle_timeout: Duration,
}

impl SessionManager {
	pub fn new(idle_timeout: Duration) -> Self {
		Self {
			sessions: Mutex::new(HashMap::new()),
			idle_timeout,
		}
	}

	/// Returns the session for `channel_id`, creating it via `create` if
	/// this is the first request for that channel. Concurrent calls for
	/// the same channel share one `create` invocation.
	pub async fn get_or_create<F, Fut>(&self, channel_id: &str, create: F) -> Result<Arc<Session>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<Arc<Session>>>,
	{
		let slot = {
			let mut sessions = self.sessions.lock().await;
			sessions
				.entry(channel_id.to_string())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};

		// `get_or_try_init` leaves the cell uninitialized on an `Err`, so a
		// failed creation doesn't poison the channel for later requests.
		slot.get_or_try_init(create).await.cloned()
	}

	pub async fn get(&self, channel_id: &str) -> Option<Arc<Session>> {
		let sessions = self.sessions.lock().await;
		sessions.get(channel_id)?.get().cloned()
	}

	/// Removes sessions whose refcount is zero AND which haven't seen a
	/// request in `idle_timeout`, intended to be called periodically from a
	/// background task (`relay-server`'s main loop spawns this the way
	/// `moq-relay` spawns its own sweep tasks). Returns the channel ids that
	/// were evicted so the caller can tear down anything keyed on them
	/// elsewhere (e.g. `relay-server`'s per-variant processor registry).
	///
	/// The idle-timeout check matters for HLS/DASH clients, which poll with
	/// no connection held open between requests: `refcount() == 0` between
	/// polls is the normal state, not a sign the viewer left.
	pub async fn sweep_idle(&self) -> Vec<String> {
		let mut sessions = self.sessions.lock().await;
		let mut evicted = Vec::new();
		sessions.retain(|channel_id, slot| {
			let keep = match slot.get() {
				Some(session) => session.refcount() > 0 || session.idle_for() < self.idle_timeout,
				None => true,
			};
			if !keep {
				evicted.push(channel_id.clone());
			}
			keep
		});
		evicted
	}

	pub fn idle_timeout(&self) -> Duration {
		self.idle_timeout
	}

	pub async fn active_channel_count(&self) -> usize {
		self.sessions.lock().await.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classification::{Classification, SourceFormat};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use url::Url;

	fn classification() -> Classification {
		Classification {
			source_url: Url::parse("http://origin.example/stream").unwrap(),
			format: SourceFormat::MpegTs,
			video: None,
			audio: None,
		}
	}

	#[tokio::test]
	async fn concurrent_requests_share_one_creation() {
		let manager = Arc::new(SessionManager::new(Duration::from_secs(30)));
		let calls = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..8 {
			let manager = manager.clone();
			let calls = calls.clone();
			handles.push(tokio::spawn(async move {
				manager
					.get_or_create("chan-1", || async move {
						calls.fetch_add(1, Ordering::SeqCst);
						tokio::time::sleep(Duration::from_millis(5)).await;
						Ok(Session::new(
							"chan-1",
							Url::parse("http://origin.example/stream").unwrap(),
							classification(),
						))
					})
					.await
			}));
		}
		for handle in handles {
			handle.await.unwrap().unwrap();
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn sweep_removes_idle_sessions() {
		let manager = SessionManager::new(Duration::from_secs(0));
		let session = manager
			.get_or_create("chan-1", || async { Ok(Session::new("chan-1", Url::parse("http://origin.example/stream").unwrap(), classification())) })
			.await
			.unwrap();
		assert_eq!(session.refcount(), 0);
		manager.sweep_idle().await;
		assert!(manager.get("chan-1").await.is_none());
	}
}
