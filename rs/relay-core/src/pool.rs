use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
	pub max_per_host: usize,
}

impl Default for ConnectionPoolConfig {
	fn default() -> Self {
		Self { max_per_host: 4 }
	}
}

/// Per-host admission gate bounding how many concurrent upstream connections
/// the relay opens to a single origin host, independent of how many channels
/// on that host are being relayed.
///
/// Each host gets its own `tokio::sync::Semaphore`; `acquire` is cancel-safe
/// because dropping the returned permit (e.g. the caller's future being
/// dropped on client disconnect) releases the slot automatically.
pub struct ConnectionPool {
	max_per_host: usize,
	hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

pub struct PoolPermit {
	_permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
	pub fn new(config: ConnectionPoolConfig) -> Self {
		Self {
			max_per_host: config.max_per_host,
			hosts: Mutex::new(HashMap::new()),
		}
	}

	fn semaphore_for(&self, host: &str) -> Arc<Semaphore> {
		let mut hosts = self.hosts.lock().unwrap();
		hosts
			.entry(host.to_string())
			.or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
			.clone()
	}

	/// Waits for a free slot for `host`, returning a permit that releases
	/// the slot when dropped. Returns [`RelayError::Cancel`] only if the
	/// underlying semaphore was closed, which this type never does itself —
	/// callers can otherwise simply drop the returned future to cancel.
	pub async fn acquire(&self, host: &str) -> Result<PoolPermit> {
		let semaphore = self.semaphore_for(host);
		let permit = semaphore
			.acquire_owned()
			.await
			.map_err(|_| RelayError::Cancel)?;
		Ok(PoolPermit { _permit: permit })
	}

	/// Non-blocking admission check, used by the smart-delivery router to
	/// decide up front whether opening a new upstream connection is even
	/// worth attempting before consulting the circuit breaker.
	pub fn try_acquire(&self, host: &str) -> Option<PoolPermit> {
		let semaphore = self.semaphore_for(host);
		semaphore
			.try_acquire_owned()
			.ok()
			.map(|permit| PoolPermit { _permit: permit })
	}

	pub fn available(&self, host: &str) -> usize {
		self.semaphore_for(host).available_permits()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn bounds_concurrent_connections_per_host() {
		let pool = ConnectionPool::new(ConnectionPoolConfig { max_per_host: 1 });
		let permit = pool.acquire("origin-a").await.unwrap();
		assert!(pool.try_acquire("origin-a").is_none());
		drop(permit);
		assert!(pool.try_acquire("origin-a").is_some());
	}

	#[tokio::test]
	async fn hosts_are_independent() {
		let pool = ConnectionPool::new(ConnectionPoolConfig { max_per_host: 1 });
		let _a = pool.acquire("origin-a").await.unwrap();
		assert!(pool.try_acquire("origin-b").is_some());
	}
}
